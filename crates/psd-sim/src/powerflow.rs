//! Power-flow orchestration: the voltage and power adjustment loops, the
//! pre-solve network check, and the event-driven power-flow mode.

use crate::client::TreeClient;
use crate::recovery::{PowerFlowErrorRecovery, RecoveryOutcome};
use crate::simulation::{SimState, Simulation};
use anyhow::{anyhow, Result};
use petgraph::unionfind::UnionFind;
use psd_core::{
    ChangeCode, CheckLevel, ComponentId, ComponentKind, StateData, NO_SLACK_BUS_FOUND,
};
use psd_core::models::BusType;
use std::collections::HashMap;
use tracing::{debug, info, warn};

impl Simulation {
    /// Solve the static operating point.
    ///
    /// Voltage loop: guess, solve, uptake, reversible adjustments, repeat
    /// while anything moved. A full-check adjustment pass follows; any
    /// resulting change triggers a simplified network recheck and a restart.
    /// The power loop then redistributes slack drift across participating
    /// generators.
    pub fn powerflow(&mut self) -> Result<()> {
        self.make_ready(SimState::Initialized, &psd_core::POWER_FLOW_MODE)?;
        let mode = self.modes.powerflow;
        self.reinit_mode(&mode, ChangeCode::StateCountChange)?;

        let slack_pre = self.scheduled_slack_generation();
        let mut p_iter = 0;
        let mut full_checks = 0;

        'power: loop {
            // voltage loop
            let mut v_iter = 0;
            loop {
                v_iter += 1;
                if v_iter > self.options.max_v_adjust_iterations {
                    self.state = SimState::GdError;
                    return Err(anyhow!(
                        "voltage adjustment loop exceeded {} iterations",
                        self.options.max_v_adjust_iterations
                    ));
                }
                self.guess_into_handle(&mode);
                let code = self.solve_powerflow_once(&mode);
                if code < 0 {
                    if self.options.no_powerflow_error_recovery {
                        self.state = SimState::GdError;
                        return Err(anyhow!("power flow solve failed with code {code}"));
                    }
                    self.run_powerflow_recovery(code)?;
                    continue;
                }
                self.set_state_from_handle(&mode);
                let change = self
                    .arena
                    .power_flow_adjust(self.root, 0, CheckLevel::ReversableOnly);
                if change >= ChangeCode::NonStateChange {
                    debug!(?change, v_iter, "reversible adjustment changed the system");
                    self.reinit_mode(&mode, change)?;
                    continue;
                }
                break;
            }

            // one non-reversible pass after the voltage loop stabilizes
            let change = self
                .arena
                .power_flow_adjust(self.root, 0, CheckLevel::FullCheck);
            if change > ChangeCode::NoChange && full_checks < 5 {
                full_checks += 1;
                self.check_network_simplified()?;
                self.reinit_mode(&mode, change)?;
                continue 'power;
            }

            // power loop: pull drifting slack generation back onto the
            // participating units
            if self.options.power_adjust_enabled
                && p_iter < self.options.max_p_adjust_iterations
            {
                let slack_now = self.total_slack_generation();
                let drift = slack_now - slack_pre;
                if drift.abs() > self.options.power_adjust_threshold {
                    p_iter += 1;
                    info!(drift, p_iter, "redistributing slack generation drift");
                    self.redistribute_power(drift);
                    self.reinit_mode(&mode, ChangeCode::ParameterChange)?;
                    continue 'power;
                }
            }
            break;
        }

        self.state = SimState::PowerflowComplete;
        Ok(())
    }

    /// One Newton solve of the power-flow system at the current time.
    pub(crate) fn solve_powerflow_once(&mut self, mode: &psd_core::SolverMode) -> i32 {
        let index = self.handle_index(mode);
        let Simulation {
            arena,
            root,
            solvers,
            current_time,
            ..
        } = self;
        let handle = solvers[index].as_mut().unwrap();
        let mut client = TreeClient::new(arena, *root, *mode);
        handle.solve_algebraic(&mut client, *current_time)
    }

    fn run_powerflow_recovery(&mut self, first_code: i32) -> Result<()> {
        let mode = self.modes.powerflow;
        let mut recovery = PowerFlowErrorRecovery::new();
        let mut code = first_code;
        loop {
            match recovery.attempt_fix(self, code)? {
                RecoveryOutcome::Fixed | RecoveryOutcome::MoreOptions => {
                    self.guess_into_handle(&mode);
                    code = self.solve_powerflow_once(&mode);
                    if code >= 0 {
                        warn!(
                            attempts = recovery.attempts(),
                            "power flow recovered after staged fixes"
                        );
                        return Ok(());
                    }
                }
                RecoveryOutcome::OutOfOptions => {
                    self.state = SimState::GdError;
                    return Err(anyhow!(
                        "power flow error recovery exhausted its options (last code {code})"
                    ));
                }
            }
        }
    }

    /// Scheduled generation at slack buses before any solve.
    pub fn scheduled_slack_generation(&self) -> f64 {
        let mut total = 0.0;
        for id in self.arena.subtree_post_order(self.root) {
            let comp = self.arena.expect(id);
            let ComponentKind::Bus(bus) = &comp.kind else {
                continue;
            };
            if !comp.base.is_connected() || bus.effective_type() != BusType::Slack {
                continue;
            }
            for child in self.arena.children(id) {
                if let Some(ComponentKind::Generator(gen)) = self.arena.get(child).map(|c| &c.kind)
                {
                    total += gen.power_set;
                }
            }
        }
        total
    }

    /// Total real power produced by slack buses (network outflow plus local
    /// demand).
    pub fn total_slack_generation(&self) -> f64 {
        let sd = StateData::empty();
        let mut total = 0.0;
        for id in self.arena.subtree_post_order(self.root) {
            let comp = self.arena.expect(id);
            let ComponentKind::Bus(bus) = &comp.kind else {
                continue;
            };
            if !comp.base.is_connected() || bus.effective_type() != BusType::Slack {
                continue;
            }
            let outputs = self
                .arena
                .outputs(id, &sd, &psd_core::LOCAL_MODE);
            let mut local_load = 0.0;
            for child in self.arena.children(id) {
                if let Some(ComponentKind::Load(load)) = self.arena.get(child).map(|c| &c.kind) {
                    local_load += load.p;
                }
            }
            total += outputs.first().copied().unwrap_or(0.0) + local_load;
        }
        total
    }

    /// Spread a slack drift across participating generators at non-slack
    /// buses, proportionally to their available headroom.
    fn redistribute_power(&mut self, drift: f64) {
        let mut candidates: Vec<(ComponentId, f64)> = Vec::new();
        for id in self.arena.subtree_post_order(self.root) {
            let comp = self.arena.expect(id);
            let ComponentKind::Generator(gen) = &comp.kind else {
                continue;
            };
            if !comp.base.is_connected() || gen.participation <= 0.0 {
                continue;
            }
            let at_slack = comp
                .base
                .parent
                .and_then(|p| self.arena.get(p))
                .is_some_and(|p| match &p.kind {
                    ComponentKind::Bus(b) => b.effective_type() == BusType::Slack,
                    _ => false,
                });
            if at_slack {
                continue;
            }
            let capacity = if drift > 0.0 {
                gen.up_capacity()
            } else {
                gen.down_capacity()
            };
            if capacity > 0.0 {
                candidates.push((id, capacity));
            }
        }
        let total_capacity: f64 = candidates.iter().map(|(_, c)| c).sum();
        if total_capacity <= 0.0 {
            warn!("no generation headroom available for slack redistribution");
            return;
        }
        for (id, capacity) in candidates {
            let share = drift * capacity / total_capacity;
            if let Some(ComponentKind::Generator(gen)) =
                self.arena.get_mut(id).map(|c| &mut c.kind)
            {
                gen.power_set = (gen.power_set + share).clamp(gen.p_min, gen.p_max);
            }
        }
    }

    /// Full pre-power-flow network check: participation screening, island
    /// detection, slack promotion or island disconnection.
    pub fn check_network_full(&mut self) -> Result<()> {
        self.check_network(true)
    }

    /// Simplified recheck after adjustments: islands and slack coverage
    /// only.
    pub fn check_network_simplified(&mut self) -> Result<()> {
        self.check_network(false)
    }

    fn check_network(&mut self, full: bool) -> Result<()> {
        let ids = self.arena.subtree_post_order(self.root);
        let buses: Vec<ComponentId> = ids
            .iter()
            .copied()
            .filter(|&id| {
                let comp = self.arena.expect(id);
                matches!(comp.kind, ComponentKind::Bus(_)) && comp.base.is_connected()
            })
            .collect();
        if buses.is_empty() {
            return Ok(());
        }

        if full && buses.len() > 1 {
            // buses with no live connection cannot participate
            let mut disable = Vec::new();
            for &id in &buses {
                let ComponentKind::Bus(bus) = &self.arena.expect(id).kind else {
                    continue;
                };
                let live_links = bus.attached_links.iter().any(|&l| {
                    self.arena
                        .get(l)
                        .is_some_and(|c| c.base.is_connected())
                });
                if !live_links {
                    disable.push(id);
                }
            }
            for id in disable {
                warn!(bus = id.value(), "disconnecting bus with no live links");
                self.arena.disconnect(id);
            }
        }

        // connected components over the live link graph
        let live: Vec<ComponentId> = buses
            .into_iter()
            .filter(|&id| self.arena.expect(id).base.is_connected())
            .collect();
        let index_of: HashMap<ComponentId, usize> =
            live.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let mut uf = UnionFind::<usize>::new(live.len());
        for &id in &ids {
            let comp = self.arena.expect(id);
            let ComponentKind::Link(link) = &comp.kind else {
                continue;
            };
            if !comp.base.is_connected() {
                continue;
            }
            if let (Some(f), Some(t)) = (link.from_bus, link.to_bus) {
                if let (Some(&fi), Some(&ti)) = (index_of.get(&f), index_of.get(&t)) {
                    uf.union(fi, ti);
                }
            }
        }

        let mut islands: HashMap<usize, Vec<ComponentId>> = HashMap::new();
        for (i, &id) in live.iter().enumerate() {
            islands.entry(uf.find(i)).or_default().push(id);
        }

        for island in islands.values() {
            let mut has_slack = false;
            let mut has_pv = false;
            let mut has_afix = false;
            for &id in island {
                let ComponentKind::Bus(bus) = &self.arena.expect(id).kind else {
                    continue;
                };
                match bus.bus_type {
                    BusType::Slack => has_slack = true,
                    BusType::Pv => has_pv = true,
                    BusType::Afix => has_afix = true,
                    BusType::Pq => {}
                }
            }
            if has_slack || (has_pv && has_afix) {
                continue;
            }

            // promote the highest-headroom PV bus
            let mut best: Option<(ComponentId, f64)> = None;
            for &id in island {
                let ComponentKind::Bus(bus) = &self.arena.expect(id).kind else {
                    continue;
                };
                if bus.bus_type != BusType::Pv {
                    continue;
                }
                let mut headroom = 0.0;
                for child in self.arena.children(id) {
                    if let Some(ComponentKind::Generator(gen)) =
                        self.arena.get(child).map(|c| &c.kind)
                    {
                        headroom += gen.up_capacity();
                    }
                }
                if best.map_or(true, |(_, h)| headroom > h) {
                    best = Some((id, headroom));
                }
            }
            match best {
                Some((id, _)) => {
                    info!(bus = id.value(), "promoting PV bus to slack for its island");
                    if let Some(ComponentKind::Bus(bus)) =
                        self.arena.get_mut(id).map(|c| &mut c.kind)
                    {
                        bus.bus_type = BusType::Slack;
                    }
                    self.arena.alert(id, psd_core::change::SLACK_BUS_CHANGE);
                }
                None => {
                    if self.options.no_auto_disconnect {
                        self.state = SimState::GdError;
                        return Err(anyhow!(
                            "no slack bus found for an island (code {NO_SLACK_BUS_FOUND})"
                        ));
                    }
                    warn!(
                        island_size = island.len(),
                        "disconnecting island with no slack capability"
                    );
                    for &id in island {
                        self.arena.disconnect(id);
                    }
                }
            }
        }
        Ok(())
    }

    /// Event-driven power flow: timestep to the next event, run A parts,
    /// re-solve when anything moved (or the heartbeat fired), then run B
    /// parts so recorders capture post-adjustment values.
    pub fn event_driven_powerflow(&mut self, t_end: f64, t_step: f64) -> Result<()> {
        self.make_ready(SimState::PowerflowComplete, &psd_core::POWER_FLOW_MODE)?;
        self.events
            .null_event_time(self.current_time + t_step, Some(t_step));

        while self.current_time < t_end - self.options.time_tol {
            let next = self.events.next_time().min(t_end);
            self.current_time = next;
            self.arena
                .timestep(self.root, next, &psd_core::POWER_FLOW_MODE);

            let heartbeat = self.events.take_null_due(next);
            let code_a = {
                let Simulation { events, arena, .. } = self;
                events.execute_events_a_only(arena, next)
            };
            if code_a >= ChangeCode::ParameterChange || heartbeat {
                if code_a >= ChangeCode::StateCountChange {
                    let mode = self.modes.powerflow;
                    self.reinit_mode(&mode, code_a)?;
                }
                self.powerflow()?;
            }
            let code_b = {
                let Simulation { events, arena, .. } = self;
                events.execute_events_b_only(arena)
            };
            if code_b >= ChangeCode::ParameterChange {
                self.powerflow()?;
            }
        }
        Ok(())
    }
}
