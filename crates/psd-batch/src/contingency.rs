//! Contingency analysis: list builders and the parallel runner.
//!
//! Each contingency clones the base simulation, applies its outage stages,
//! runs a power flow per stage, and scans for violations. Execution fans out
//! over a rayon thread pool; nothing mutable is shared between workers.

use anyhow::{Context, Result};
use psd_core::{ComponentId, ComponentKind};
use psd_sim::Simulation;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

/// Component classes enumerable as outages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutageKind {
    Bus,
    Link,
    Generator,
    Load,
}

impl OutageKind {
    fn matches(&self, kind: &ComponentKind) -> bool {
        matches!(
            (self, kind),
            (OutageKind::Bus, ComponentKind::Bus(_))
                | (OutageKind::Link, ComponentKind::Link(_))
                | (OutageKind::Generator, ComponentKind::Generator(_))
                | (OutageKind::Load, ComponentKind::Load(_))
        )
    }
}

/// A recorded limit or solution violation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    ConvergenceFailure { stage: usize },
    VoltageLow { bus: String, value: f64, limit: f64 },
    VoltageHigh { bus: String, value: f64, limit: f64 },
    LineOverload { link: String, loading: f64, rating: f64 },
}

/// Voltage band applied when a bus declares no explicit limits.
#[derive(Debug, Clone, Copy)]
pub struct ViolationLimits {
    pub v_min: f64,
    pub v_max: f64,
}

impl Default for ViolationLimits {
    fn default() -> Self {
        ViolationLimits {
            v_min: 0.9,
            v_max: 1.1,
        }
    }
}

/// One disturbance scenario: outage stages applied to a cloned simulation.
#[derive(Debug, Clone)]
pub struct Contingency {
    pub id: usize,
    pub name: String,
    /// Components disconnected per stage
    pub stages: Vec<Vec<ComponentId>>,
    pub completed: bool,
    pub violation_count: usize,
    pub bus_voltages: Vec<f64>,
    pub bus_angles: Vec<f64>,
    pub line_flows: Vec<f64>,
    pub violations: Vec<Violation>,
}

impl Contingency {
    pub fn new(id: usize, name: impl Into<String>, stages: Vec<Vec<ComponentId>>) -> Self {
        Contingency {
            id,
            name: name.into(),
            stages,
            completed: false,
            violation_count: 0,
            bus_voltages: Vec::new(),
            bus_angles: Vec::new(),
            line_flows: Vec::new(),
            violations: Vec::new(),
        }
    }

    /// Run this contingency against a clone of `base`.
    pub fn execute(&mut self, base: &Simulation, limits: &ViolationLimits) {
        let mut sim = base.clone();
        for (stage_index, stage) in self.stages.clone().into_iter().enumerate() {
            for id in stage {
                sim.arena.disconnect(id);
            }
            match sim.powerflow() {
                Ok(()) => {
                    self.collect_results(&sim);
                    self.scan_violations(&sim, limits);
                }
                Err(err) => {
                    debug!(contingency = self.id, stage = stage_index, %err, "power flow failed");
                    self.violations.push(Violation::ConvergenceFailure {
                        stage: stage_index,
                    });
                }
            }
        }
        self.violation_count = self.violations.len();
        self.completed = true;
    }

    fn collect_results(&mut self, sim: &Simulation) {
        self.bus_voltages.clear();
        self.bus_angles.clear();
        self.line_flows.clear();
        let sd = psd_core::StateData::empty();
        for id in sim.arena.subtree_post_order(sim.root) {
            let comp = sim.arena.expect(id);
            match &comp.kind {
                ComponentKind::Bus(bus) if comp.base.is_connected() => {
                    self.bus_voltages.push(bus.voltage);
                    self.bus_angles.push(bus.angle);
                }
                ComponentKind::Link(_) if comp.base.is_connected() => {
                    let outputs = sim.arena.outputs(id, &sd, &psd_core::LOCAL_MODE);
                    let p = outputs.first().copied().unwrap_or(0.0);
                    let q = outputs.get(1).copied().unwrap_or(0.0);
                    self.line_flows.push((p * p + q * q).sqrt());
                }
                _ => {}
            }
        }
    }

    fn scan_violations(&mut self, sim: &Simulation, limits: &ViolationLimits) {
        let sd = psd_core::StateData::empty();
        for id in sim.arena.subtree_post_order(sim.root) {
            let comp = sim.arena.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            match &comp.kind {
                ComponentKind::Bus(bus) => {
                    let v_min = bus.vmin.unwrap_or(limits.v_min);
                    let v_max = bus.vmax.unwrap_or(limits.v_max);
                    if bus.voltage < v_min {
                        self.violations.push(Violation::VoltageLow {
                            bus: comp.base.name.clone(),
                            value: bus.voltage,
                            limit: v_min,
                        });
                    } else if bus.voltage > v_max {
                        self.violations.push(Violation::VoltageHigh {
                            bus: comp.base.name.clone(),
                            value: bus.voltage,
                            limit: v_max,
                        });
                    }
                }
                ComponentKind::Link(link) => {
                    let Some(rating) = link.rating else { continue };
                    let outputs = sim.arena.outputs(id, &sd, &psd_core::LOCAL_MODE);
                    let p = outputs.first().copied().unwrap_or(0.0);
                    let q = outputs.get(1).copied().unwrap_or(0.0);
                    let loading = (p * p + q * q).sqrt();
                    if loading > rating {
                        self.violations.push(Violation::LineOverload {
                            link: comp.base.name.clone(),
                            loading,
                            rating,
                        });
                    }
                }
                _ => {}
            }
        }
    }
}

fn enumerate_outages(sim: &Simulation, kinds: &[OutageKind]) -> Vec<(ComponentId, String)> {
    sim.arena
        .subtree_post_order(sim.root)
        .into_iter()
        .filter_map(|id| {
            let comp = sim.arena.expect(id);
            if !comp.base.is_connected() {
                return None;
            }
            kinds
                .iter()
                .any(|k| k.matches(&comp.kind))
                .then(|| (id, comp.base.name.clone()))
        })
        .collect()
}

/// Build the N-1 list: one contingency per enumerable component.
pub fn build_n1(sim: &Simulation, kinds: &[OutageKind]) -> Vec<Contingency> {
    enumerate_outages(sim, kinds)
        .into_iter()
        .enumerate()
        .map(|(i, (id, name))| Contingency::new(i, format!("N-1 {name}"), vec![vec![id]]))
        .collect()
}

/// Build the N-1-1 list: ordered pairs applied in two stages.
pub fn build_n1_1(sim: &Simulation, kinds: &[OutageKind]) -> Vec<Contingency> {
    let outages = enumerate_outages(sim, kinds);
    let mut list = Vec::new();
    for (a, name_a) in &outages {
        for (b, name_b) in &outages {
            if a == b {
                continue;
            }
            list.push(Contingency::new(
                list.len(),
                format!("N-1-1 {name_a} then {name_b}"),
                vec![vec![*a], vec![*b]],
            ));
        }
    }
    list
}

/// Build the N-2 list: unordered pairs applied together.
pub fn build_n2(sim: &Simulation, kinds: &[OutageKind]) -> Vec<Contingency> {
    let outages = enumerate_outages(sim, kinds);
    let mut list = Vec::new();
    for (i, (a, name_a)) in outages.iter().enumerate() {
        for (b, name_b) in outages.iter().skip(i + 1) {
            list.push(Contingency::new(
                list.len(),
                format!("N-2 {name_a} + {name_b}"),
                vec![vec![*a, *b]],
            ));
        }
    }
    list
}

/// Summary of a contingency batch.
#[derive(Debug, Clone)]
pub struct ContingencySummary {
    pub total: usize,
    pub completed: usize,
    pub with_violations: usize,
}

/// Execute a contingency list on a thread pool and write the CSV summary:
/// one header row plus one row per contingency.
pub fn run_contingencies(
    base: &Simulation,
    list: &mut [Contingency],
    threads: usize,
    limits: &ViolationLimits,
    output: impl AsRef<Path>,
) -> Result<ContingencySummary> {
    let thread_count = if threads == 0 {
        num_cpus::get()
    } else {
        threads
    };
    let pool = ThreadPoolBuilder::new()
        .num_threads(thread_count)
        .build()
        .context("building the contingency thread pool")?;

    pool.install(|| {
        list.par_iter_mut()
            .for_each(|contingency| contingency.execute(base, limits));
    });

    write_summary(list, output.as_ref())?;

    let completed = list.iter().filter(|c| c.completed).count();
    let with_violations = list.iter().filter(|c| c.violation_count > 0).count();
    info!(
        total = list.len(),
        completed, with_violations, "contingency batch complete"
    );
    Ok(ContingencySummary {
        total: list.len(),
        completed,
        with_violations,
    })
}

fn write_summary(list: &[Contingency], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating contingency output '{}'", path.display()))?;
    writer.write_record([
        "id",
        "name",
        "completed",
        "violations",
        "min_voltage",
        "max_flow",
    ])?;
    for contingency in list {
        let min_v = contingency
            .bus_voltages
            .iter()
            .fold(f64::INFINITY, |m, &v| m.min(v));
        let max_flow = contingency
            .line_flows
            .iter()
            .fold(0.0f64, |m, &f| m.max(f));
        writer.write_record([
            contingency.id.to_string(),
            contingency.name.clone(),
            contingency.completed.to_string(),
            contingency.violation_count.to_string(),
            if min_v.is_finite() {
                format!("{min_v:.6}")
            } else {
                String::new()
            },
            format!("{max_flow:.6}"),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
