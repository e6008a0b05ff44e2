//! The simulation driver.
//!
//! Owns the root area, the event queue, and the per-mode solver handles.
//! The run state progresses monotonically through the state machine under
//! normal operation; `make_ready` walks it forward on demand.

use crate::client::TreeClient;
use crate::solvers::{IcMode, SolverHandle};
use anyhow::{anyhow, Result};
use psd_core::{
    ChangeCode, Component, ComponentArena, ComponentId, ComponentKind, EventQueue,
    OffsetOrdering, SolverMode, StateData, Unit, DAE_MODE, DYN_ALGEBRAIC_MODE,
    DYN_DIFFERENTIAL_MODE, POWER_FLOW_MODE,
};
use psd_core::{ConvergeMode, models};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Driver state machine. Progresses monotonically under normal operation;
/// `GdError` is a sink on fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimState {
    Startup,
    Initialized,
    PowerflowComplete,
    DynamicInitialized,
    DynamicPartial,
    DynamicComplete,
    GdError,
}

/// Per-run scalar configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimOptions {
    pub tolerance: f64,
    pub voltage_tolerance: f64,
    pub max_v_adjust_iterations: usize,
    pub max_p_adjust_iterations: usize,
    pub power_adjust_enabled: bool,
    pub power_adjust_threshold: f64,
    pub no_powerflow_error_recovery: bool,
    pub no_auto_disconnect: bool,
    pub time_tol: f64,
    pub step_size: f64,
    pub max_step: f64,
    pub dae_initialization_for_partitioned: bool,
    pub reset_voltage_on_ic_failure: bool,
    pub low_voltage_checking: bool,
    #[serde(skip)]
    pub ordering: OffsetOrdering,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions {
            tolerance: 1e-8,
            voltage_tolerance: 1e-6,
            max_v_adjust_iterations: 30,
            max_p_adjust_iterations: 15,
            power_adjust_enabled: false,
            power_adjust_threshold: 0.01,
            no_powerflow_error_recovery: false,
            no_auto_disconnect: false,
            time_tol: 1e-9,
            step_size: 0.01,
            max_step: 1.0,
            dae_initialization_for_partitioned: false,
            reset_voltage_on_ic_failure: true,
            low_voltage_checking: false,
            ordering: OffsetOrdering::Mixed,
        }
    }
}

/// Binding of the solution roles to concrete solver modes.
#[derive(Debug, Clone, Copy)]
pub struct DefaultModes {
    pub powerflow: SolverMode,
    pub dae: SolverMode,
    pub algebraic: SolverMode,
    pub differential: SolverMode,
}

impl Default for DefaultModes {
    fn default() -> Self {
        DefaultModes {
            powerflow: POWER_FLOW_MODE,
            dae: DAE_MODE,
            algebraic: DYN_ALGEBRAIC_MODE,
            differential: DYN_DIFFERENTIAL_MODE,
        }
    }
}

/// Which role a `set_default_mode` call rebinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolutionRole {
    Powerflow,
    Dae,
    Algebraic,
    Differential,
}

/// Queued driver actions for `execute`.
#[derive(Debug, Clone)]
pub enum SimCommand {
    Ignore,
    Set {
        target: String,
        param: String,
        value: f64,
    },
    SetAll {
        type_name: String,
        param: String,
        value: f64,
    },
    SetSolver {
        role: SolutionRole,
        tolerance: f64,
    },
    Print(String),
    Powerflow,
    Check,
    Contingency(String),
    Continuation(String),
    Initialize,
    Iterate {
        t_step: f64,
        t_end: f64,
    },
    EventMode {
        t_end: f64,
        t_step: f64,
    },
    DynamicDae(f64),
    DynamicPart(f64),
    DynamicDecoupled(f64),
    Step(f64),
    Run(f64),
    Reset,
    Save(String),
    Load(String),
    Add {
        type_name: String,
        name: String,
        parent: String,
    },
    Rollback,
    Checkpoint,
}

/// The simulation driver.
#[derive(Debug)]
pub struct Simulation {
    pub arena: ComponentArena,
    pub root: ComponentId,
    pub events: EventQueue,
    pub options: SimOptions,
    pub modes: DefaultModes,
    pub state: SimState,
    pub current_time: f64,
    pub start_time: f64,
    pub stop_time: f64,
    pub(crate) solvers: Vec<Option<SolverHandle>>,
    pub(crate) action_queue: VecDeque<SimCommand>,
    pub(crate) invalid_state: bool,
}

impl Clone for Simulation {
    fn clone(&self) -> Self {
        Simulation {
            arena: self.arena.clone(),
            root: self.root,
            events: self.events.clone(),
            options: self.options.clone(),
            modes: self.modes,
            state: self.state,
            current_time: self.current_time,
            start_time: self.start_time,
            stop_time: self.stop_time,
            solvers: self.solvers.clone(),
            action_queue: self.action_queue.clone(),
            invalid_state: self.invalid_state,
        }
    }
}

impl Simulation {
    /// Fresh simulation owning an empty root area.
    pub fn new(name: impl Into<String>) -> Self {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new(
            name,
            ComponentKind::Area(models::Area::default()),
        ));
        Simulation {
            arena,
            root,
            events: EventQueue::new(),
            options: SimOptions::default(),
            modes: DefaultModes::default(),
            state: SimState::Startup,
            current_time: 0.0,
            start_time: 0.0,
            stop_time: 30.0,
            solvers: Vec::new(),
            action_queue: VecDeque::new(),
            invalid_state: false,
        }
    }

    /// Bind one of the solution roles to a specific solver mode.
    pub fn set_default_mode(&mut self, role: SolutionRole, mode: SolverMode) {
        match role {
            SolutionRole::Powerflow => self.modes.powerflow = mode,
            SolutionRole::Dae => self.modes.dae = mode,
            SolutionRole::Algebraic => self.modes.algebraic = mode,
            SolutionRole::Differential => self.modes.differential = mode,
        }
    }

    /// The solver handle for a mode, creating it on first reference.
    pub(crate) fn handle_index(&mut self, mode: &SolverMode) -> usize {
        let index = mode.offset_index;
        if self.solvers.len() <= index {
            self.solvers.resize_with(index + 1, || None);
        }
        if self.solvers[index].is_none() {
            let handle = if mode.is_dynamic() && mode.has_differential() {
                SolverHandle::integrator(*mode)
            } else {
                SolverHandle::algebraic(*mode)
            };
            self.solvers[index] = Some(handle);
        }
        index
    }

    pub(crate) fn handle(&mut self, mode: &SolverMode) -> &mut SolverHandle {
        let index = self.handle_index(mode);
        self.solvers[index].as_mut().unwrap()
    }

    pub fn solver_state(&self, mode: &SolverMode) -> Option<&[f64]> {
        self.solvers
            .get(mode.offset_index)
            .and_then(|h| h.as_ref())
            .map(|h| h.state.as_slice())
    }

    /// Last error string from a mode's solver handle.
    pub fn last_solver_error(&self, mode: &SolverMode) -> Option<&str> {
        self.solvers
            .get(mode.offset_index)
            .and_then(|h| h.as_ref())
            .and_then(|h| h.last_error())
    }

    /// Walk the state machine forward to at least `desired`.
    pub fn make_ready(&mut self, desired: SimState, mode: &SolverMode) -> Result<()> {
        if self.state == SimState::GdError {
            return Err(anyhow!("simulation is in the error state; reset first"));
        }
        if self.state >= desired {
            return Ok(());
        }
        if self.state < SimState::Initialized && desired >= SimState::Initialized {
            self.pflow_initialize(self.start_time)?;
        }
        if self.state < SimState::PowerflowComplete && desired >= SimState::PowerflowComplete {
            self.powerflow()?;
        }
        if self.state < SimState::DynamicInitialized && desired >= SimState::DynamicInitialized {
            self.dyn_initialize(self.current_time, mode)?;
        }
        Ok(())
    }

    /// Power-flow initialization: phase A (sizes), network bookkeeping,
    /// phase B (numeric seeding), and the pre-power-flow network check.
    pub fn pflow_initialize(&mut self, t0: f64) -> Result<()> {
        info!(time = t0, "power flow initialization");
        models::area::update_network_links(&mut self.arena, self.root);
        self.arena.pflow_init_a(self.root, t0, 0);
        self.check_network_full()?;
        self.arena.pflow_init_b(self.root);
        self.arena.refresh_caches(self.root);
        self.current_time = t0;
        self.start_time = t0;
        self.state = SimState::Initialized;
        Ok(())
    }

    /// Reload sizes, offsets, and the solver allocation for a mode after a
    /// change of the given severity.
    pub fn reinit_mode(&mut self, mode: &SolverMode, level: ChangeCode) -> Result<()> {
        if level >= ChangeCode::StateCountChange {
            self.arena.state_unload(self.root, mode.is_dynamic());
        }
        if level >= ChangeCode::RootChange {
            self.arena.root_unload(self.root, mode.is_dynamic());
        }
        if level >= ChangeCode::JacobianChange {
            self.arena.jacobian_unload(self.root, mode.is_dynamic());
        }
        self.arena.load_sizes(self.root, mode);
        let ordering = self.options.ordering;
        self.arena.assign_offsets(self.root, 0, mode, ordering);
        self.arena.assign_root_offsets(self.root, 0, mode);
        let size = self.arena.state_size(self.root, mode);
        let roots = self.arena.root_size(self.root, mode);
        let tolerance = self.options.tolerance;
        let step = self.options.step_size;
        let max_step = self.options.max_step;
        let handle = self.handle(mode);
        handle.allocate(size, roots);
        handle.config.tolerance = tolerance;
        handle.config.initial_step = step;
        handle.config.max_step = max_step;
        debug!(mode = mode.offset_index, size, roots, "mode reinitialized");
        Ok(())
    }

    /// Fill a solver handle's vectors with the component guesses.
    pub(crate) fn guess_into_handle(&mut self, mode: &SolverMode) {
        let index = self.handle_index(mode);
        let Simulation { arena, root, solvers, current_time, .. } = self;
        let handle = solvers[index].as_mut().unwrap();
        handle.state.fill(0.0);
        handle.dstate.fill(0.0);
        arena.guess_state(*root, *current_time, &mut handle.state, &mut handle.dstate, mode);
    }

    /// Push a solver handle's vectors back into the components.
    pub(crate) fn set_state_from_handle(&mut self, mode: &SolverMode) {
        let index = self.handle_index(mode);
        let Simulation { arena, root, solvers, current_time, .. } = self;
        let handle = solvers[index].as_mut().unwrap();
        arena.set_state(*root, *current_time, &handle.state, &handle.dstate, mode);
        arena.refresh_caches(*root);
    }

    /// Gauss-Seidel style convergence pass used by the recovery stages.
    pub fn converge(&mut self, mode: &SolverMode, cmode: ConvergeMode, alpha: f64) {
        let iterations = match cmode {
            ConvergeMode::SingleIteration => 1,
            ConvergeMode::VoltageOnly | ConvergeMode::LocalIteration => 5,
            ConvergeMode::BlockIteration => 50,
            ConvergeMode::StrongIteration => 100,
        };
        let index = self.handle_index(mode);
        let Simulation { arena, root, solvers, current_time, options, .. } = self;
        let handle = solvers[index].as_mut().unwrap();
        let n = handle.state.len();
        let mut update = vec![0.0; n];
        for _ in 0..iterations {
            let sd = StateData::new(*current_time, &handle.state, None, 0);
            update.copy_from_slice(&handle.state);
            arena.algebraic_update(*root, &sd, &mut update, mode, alpha.max(0.05));
            let delta = handle
                .state
                .iter()
                .zip(update.iter())
                .fold(0.0f64, |m, (a, b)| m.max((a - b).abs()));
            handle.state.copy_from_slice(&update);
            if delta < options.tolerance {
                break;
            }
        }
    }

    /// Bus voltages in tree order.
    pub fn voltages(&self) -> Vec<f64> {
        self.arena
            .subtree_post_order(self.root)
            .into_iter()
            .filter_map(|id| match &self.arena.expect(id).kind {
                ComponentKind::Bus(bus) => Some(bus.voltage),
                _ => None,
            })
            .collect()
    }

    /// Compute consistent initial conditions for a dynamic mode, with the
    /// staged fallback sequence on failure.
    pub(crate) fn compute_dynamic_ic(&mut self, mode: &SolverMode) -> Result<()> {
        let index = self.handle_index(mode);
        let time = self.current_time;
        let code = {
            let Simulation { arena, root, solvers, .. } = self;
            let handle = solvers[index].as_mut().unwrap();
            let mut client = TreeClient::new(arena, *root, *mode);
            handle.calc_ic(&mut client, time, IcMode::FixedMaskedAndDeriv)
        };
        if code >= 0 {
            return Ok(());
        }
        warn!(code, "initial condition computation failed; running fallback");
        self.generate_dynamic_initial_conditions(mode)
    }

    /// The staged fallback: voltage reset, low-voltage check, a fixed-diff
    /// retry, an algebraic root check, then staged recovery.
    fn generate_dynamic_initial_conditions(&mut self, mode: &SolverMode) -> Result<()> {
        if self.options.reset_voltage_on_ic_failure {
            self.reset_voltages();
            self.guess_into_handle(mode);
        }
        if self.options.low_voltage_checking {
            let sd = StateData::empty();
            self.arena
                .root_check(self.root, &sd, psd_core::CheckLevel::LowVoltageCheck);
        }
        let index = self.handle_index(mode);
        let time = self.current_time;
        let code = {
            let Simulation { arena, root, solvers, .. } = self;
            let handle = solvers[index].as_mut().unwrap();
            let mut client = TreeClient::new(arena, *root, *mode);
            handle.calc_ic(&mut client, time, IcMode::FixedDiff)
        };
        if code >= 0 {
            self.set_state_from_handle(mode);
            let sd = StateData::empty();
            self.arena
                .root_check(self.root, &sd, psd_core::CheckLevel::CompleteStateCheck);
            return Ok(());
        }
        let mut recovery = crate::recovery::DynamicInitRecovery::new();
        loop {
            match recovery.attempt_fix(self, mode)? {
                crate::recovery::RecoveryOutcome::Fixed => return Ok(()),
                crate::recovery::RecoveryOutcome::MoreOptions => continue,
                crate::recovery::RecoveryOutcome::OutOfOptions => {
                    self.state = SimState::GdError;
                    return Err(anyhow!(
                        "dynamic initial condition recovery exhausted its options"
                    ));
                }
            }
        }
    }

    /// Reset all bus voltages toward their setpoints.
    pub(crate) fn reset_voltages(&mut self) {
        for id in self.arena.subtree_post_order(self.root) {
            if let ComponentKind::Bus(bus) = &mut self.arena.expect_mut(id).kind {
                bus.voltage = bus.v_set;
            }
        }
    }

    /// Queue an action for `run` to drain.
    pub fn queue_action(&mut self, action: SimCommand) {
        self.action_queue.push_back(action);
    }

    /// Execute one driver action.
    pub fn execute(&mut self, action: SimCommand) -> Result<()> {
        match action {
            SimCommand::Ignore | SimCommand::Checkpoint | SimCommand::Rollback => Ok(()),
            SimCommand::Set {
                target,
                param,
                value,
            } => {
                let id = if target.is_empty() {
                    self.root
                } else {
                    self.arena
                        .find(self.root, &target)
                        .ok_or_else(|| anyhow!("no object named '{target}'"))?
                };
                self.arena.set_param(id, &param, value, Unit::PerUnit)?;
                Ok(())
            }
            SimCommand::SetAll {
                type_name,
                param,
                value,
            } => {
                self.arena.set_all(self.root, &type_name, &param, value);
                Ok(())
            }
            SimCommand::SetSolver { role, tolerance } => {
                let mode = match role {
                    SolutionRole::Powerflow => self.modes.powerflow,
                    SolutionRole::Dae => self.modes.dae,
                    SolutionRole::Algebraic => self.modes.algebraic,
                    SolutionRole::Differential => self.modes.differential,
                };
                self.handle(&mode).config.tolerance = tolerance;
                Ok(())
            }
            SimCommand::Print(message) => {
                info!("{message}");
                Ok(())
            }
            SimCommand::Powerflow => self.powerflow(),
            SimCommand::Check => self.check_network_full(),
            SimCommand::Contingency(_) | SimCommand::Continuation(_) => Err(anyhow!(
                "list-driven analyses execute through their own runner"
            )),
            SimCommand::Initialize => self.pflow_initialize(self.current_time),
            SimCommand::Iterate { t_step, t_end } | SimCommand::EventMode { t_end, t_step } => {
                self.event_driven_powerflow(t_end, t_step)
            }
            SimCommand::DynamicDae(t_end) => self.dynamic_dae(t_end),
            SimCommand::DynamicPart(t_end) => self.dynamic_partitioned(t_end),
            SimCommand::DynamicDecoupled(t_end) => self.dynamic_decoupled(t_end),
            SimCommand::Step(t_stop) => self.step(t_stop).map(|_| ()),
            SimCommand::Run(t_end) => {
                self.stop_time = t_end;
                self.run(t_end)
            }
            SimCommand::Reset => {
                self.state = SimState::Startup;
                self.invalid_state = false;
                self.arena.unload(self.root, false);
                Ok(())
            }
            SimCommand::Save(path) => crate::snapshot::save_powerflow_csv(self, &path),
            SimCommand::Load(path) => crate::snapshot::load_powerflow_csv(self, &path),
            SimCommand::Add {
                type_name,
                name,
                parent,
            } => {
                let parent_id = if parent.is_empty() {
                    self.root
                } else {
                    self.arena
                        .find(self.root, &parent)
                        .ok_or_else(|| anyhow!("no object named '{parent}'"))?
                };
                let comp = psd_core::factory::create_object(&type_name, &name)
                    .ok_or_else(|| anyhow!("unknown object type '{type_name}'"))?;
                self.arena.add_sub_object(parent_id, comp)?;
                Ok(())
            }
        }
    }

    /// Drain the action queue, or run the default strategy when empty: a
    /// dynamic DAE run when the tree carries differential states, a power
    /// flow otherwise.
    pub fn run(&mut self, t_end: f64) -> Result<()> {
        if !self.action_queue.is_empty() {
            while let Some(action) = self.action_queue.pop_front() {
                self.execute(action)?;
            }
            return Ok(());
        }
        self.make_ready(SimState::Initialized, &POWER_FLOW_MODE)?;
        let mut probe = self.arena.clone();
        probe.load_state_sizes(self.root, &DAE_MODE);
        let has_dynamics = probe
            .expect(self.root)
            .base
            .offsets
            .get(&DAE_MODE)
            .is_some_and(|so| so.total.diff > 0);
        if has_dynamics {
            self.dynamic_dae(t_end)
        } else {
            self.powerflow()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_ordering() {
        assert!(SimState::Startup < SimState::Initialized);
        assert!(SimState::Initialized < SimState::PowerflowComplete);
        assert!(SimState::PowerflowComplete < SimState::DynamicInitialized);
        assert!(SimState::DynamicPartial < SimState::DynamicComplete);
    }

    #[test]
    fn test_new_simulation_has_area_root() {
        let sim = Simulation::new("test");
        let root = sim.arena.expect(sim.root);
        assert_eq!(root.kind.model().type_name(), "area");
        assert_eq!(sim.state, SimState::Startup);
    }

    #[test]
    fn test_handle_created_on_demand() {
        let mut sim = Simulation::new("test");
        assert!(sim.solver_state(&POWER_FLOW_MODE).is_none());
        sim.handle(&POWER_FLOW_MODE);
        assert!(sim.solver_state(&POWER_FLOW_MODE).is_some());
    }

    #[test]
    fn test_set_default_mode() {
        let mut sim = Simulation::new("test");
        let mut custom = POWER_FLOW_MODE;
        custom.offset_index = 7;
        sim.set_default_mode(SolutionRole::Powerflow, custom);
        assert_eq!(sim.modes.powerflow.offset_index, 7);
    }

    #[test]
    fn test_execute_add_and_set() {
        let mut sim = Simulation::new("test");
        sim.execute(SimCommand::Add {
            type_name: "bus".into(),
            name: "bus1".into(),
            parent: String::new(),
        })
        .unwrap();
        sim.execute(SimCommand::Set {
            target: "bus1".into(),
            param: "vset".into(),
            value: 1.05,
        })
        .unwrap();
        let bus = sim.arena.find(sim.root, "bus1").unwrap();
        assert!(
            (sim.arena.get_param(bus, "vset", Unit::PerUnit).unwrap() - 1.05).abs() < 1e-12
        );
    }
}
