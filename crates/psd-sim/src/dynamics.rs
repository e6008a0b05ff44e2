//! Dynamic simulation strategies: monolithic DAE, partitioned, and the
//! (declined) decoupled mode.

use crate::client::{PartitionedAlgClient, PartitionedDiffClient, TreeClient};
use crate::simulation::{SimState, Simulation};
use anyhow::{anyhow, Result};
use psd_core::{
    ChangeCode, CheckLevel, SolverMode, StateData, FUNCTION_EXECUTION_FAILURE,
    SOLVER_INVALID_STATE_ERROR, SOLVER_ROOT_FOUND,
};
use tracing::{debug, info, warn};

/// Consecutive stalled steps tolerated before aborting a dynamic run.
const MAX_STALLED_STEPS: usize = 10;

impl Simulation {
    /// Dynamic initialization for a strategy identified by its mode: size
    /// declaration, per-component initial conditions, solver allocation, and
    /// the consistent-IC solve.
    pub fn dyn_initialize(&mut self, t0: f64, mode: &SolverMode) -> Result<()> {
        self.make_ready(SimState::PowerflowComplete, mode)?;
        info!(time = t0, "dynamic initialization");
        self.arena.dyn_init_a(self.root, t0, 0);
        self.arena.refresh_caches(self.root);
        self.arena.dyn_init_b(self.root);
        self.current_time = t0;

        if mode.is_dae() {
            let dae = self.modes.dae;
            self.reinit_mode(&dae, ChangeCode::StateCountChange)?;
            self.guess_into_handle(&dae);
            self.compute_dynamic_ic(&dae)?;
            self.set_state_from_handle(&dae);
        } else {
            let alg = self.modes.algebraic;
            let diff = self.modes.differential;
            self.reinit_mode(&alg, ChangeCode::StateCountChange)?;
            self.reinit_mode(&diff, ChangeCode::StateCountChange)?;
            if self.options.dae_initialization_for_partitioned {
                // seed both halves from a consistent DAE solution
                let dae = self.modes.dae;
                self.reinit_mode(&dae, ChangeCode::StateCountChange)?;
                self.guess_into_handle(&dae);
                self.compute_dynamic_ic(&dae)?;
                self.set_state_from_handle(&dae);
            }
            self.guess_into_handle(&alg);
            self.guess_into_handle(&diff);
            self.dyn_algebraic_solve()?;
        }
        self.state = SimState::DynamicInitialized;
        Ok(())
    }

    /// Monolithic DAE run: one integrator owns all states.
    pub fn dynamic_dae(&mut self, t_end: f64) -> Result<()> {
        let mode = self.modes.dae;
        if self.state < SimState::DynamicInitialized {
            self.dyn_initialize(self.current_time, &mode)?;
        }
        let time_tol = self.options.time_tol;
        let mut stall_count = 0usize;
        let mut invalid_retries = 0usize;
        let mut last_time = self.current_time;

        while self.current_time < t_end - time_tol {
            let next_stop = self.events.next_time().min(t_end);
            let (reached, code) = {
                let index = self.handle_index(&mode);
                let Simulation {
                    arena,
                    root,
                    solvers,
                    ..
                } = self;
                let handle = solvers[index].as_mut().unwrap();
                let mut client = TreeClient::new(arena, *root, mode);
                handle.solve_to(&mut client, next_stop)
            };
            self.current_time = reached;

            if code == SOLVER_ROOT_FOUND {
                let mask = self.handle(&mode).root_mask();
                self.set_state_from_handle(&mode);
                let change = self
                    .arena
                    .root_trigger(self.root, reached, &mask, &mode);
                debug!(time = reached, ?change, "root crossing handled");
                self.dynamic_check_and_reset(&mode, change)?;
                self.handle(&mode).reset_roots();
                continue;
            }
            if code == SOLVER_INVALID_STATE_ERROR {
                self.invalid_state = true;
                invalid_retries += 1;
                if invalid_retries > 3 {
                    self.state = SimState::DynamicPartial;
                    return Err(anyhow!("repeated invalid-state failures at t = {reached}"));
                }
                let sd = StateData::empty();
                self.arena
                    .root_check(self.root, &sd, CheckLevel::LowVoltageCheck);
                self.dynamic_check_and_reset(&mode, ChangeCode::ObjectChange)?;
                self.invalid_state = false;
                continue;
            }
            if code < 0 {
                self.state = SimState::DynamicPartial;
                return Err(anyhow!("dynamic solve failed with code {code}"));
            }
            invalid_retries = 0;

            // stall handling: a return that fails to advance past the stop
            if reached <= last_time + time_tol {
                stall_count += 1;
                if stall_count == 1 {
                    self.current_time += time_tol;
                    self.handle(&mode).current_time = self.current_time;
                }
                if stall_count > MAX_STALLED_STEPS {
                    self.state = SimState::DynamicPartial;
                    return Err(anyhow!("integrator stalled at t = {reached}"));
                }
            } else {
                stall_count = 0;
            }
            last_time = reached;

            self.set_state_from_handle(&mode);
            if self.events.next_time() <= reached + time_tol {
                let change = {
                    let Simulation { events, arena, .. } = self;
                    events.execute_events(arena, reached)
                };
                if change > ChangeCode::NoChange {
                    self.dynamic_check_and_reset(&mode, change)?;
                }
            }
        }
        self.state = SimState::DynamicComplete;
        Ok(())
    }

    /// Partitioned run: a differential integrator and an algebraic
    /// companion exchanging state each step.
    pub fn dynamic_partitioned(&mut self, t_end: f64) -> Result<()> {
        let diff_mode = self.modes.differential;
        let alg_mode = self.modes.algebraic;
        if self.state < SimState::DynamicInitialized {
            self.dyn_initialize(self.current_time, &diff_mode)?;
        }
        let time_tol = self.options.time_tol;
        let mut stall_count = 0usize;
        let mut last_time = self.current_time;

        while self.current_time < t_end - time_tol {
            let next_stop = self
                .events
                .next_time()
                .min(t_end)
                .min(self.current_time + self.options.max_step);

            let alg_snapshot = self.handle(&alg_mode).state.clone();
            let alg_time = self.current_time;
            let (reached, code) = {
                let index = self.handle_index(&diff_mode);
                let Simulation {
                    arena,
                    root,
                    solvers,
                    ..
                } = self;
                let handle = solvers[index].as_mut().unwrap();
                let mut client = PartitionedDiffClient {
                    arena,
                    root: *root,
                    mode: diff_mode,
                    alg_state: &alg_snapshot,
                    alg_time,
                    seq: 1,
                };
                handle.solve_to(&mut client, next_stop)
            };
            self.current_time = reached;

            if code == SOLVER_ROOT_FOUND {
                let mask = self.handle(&diff_mode).root_mask();
                self.set_state_from_handle(&diff_mode);
                let change = self.arena.root_trigger(self.root, reached, &mask, &diff_mode);
                self.dynamic_check_and_reset(&diff_mode, change)?;
                self.handle(&diff_mode).reset_roots();
                continue;
            }
            if code < 0 {
                self.state = SimState::DynamicPartial;
                return Err(anyhow!(
                    "partitioned differential solve failed with code {code}"
                ));
            }

            if reached <= last_time + time_tol {
                stall_count += 1;
                if stall_count == 1 {
                    self.current_time += time_tol;
                    self.handle(&diff_mode).current_time = self.current_time;
                }
                if stall_count > MAX_STALLED_STEPS {
                    self.state = SimState::DynamicPartial;
                    return Err(anyhow!("partitioned run stalled at t = {reached}"));
                }
            } else {
                stall_count = 0;
            }
            last_time = reached;

            self.dyn_algebraic_solve()?;
            self.set_state_from_handle(&diff_mode);
            self.set_state_from_handle(&alg_mode);

            if self.events.next_time() <= reached + time_tol {
                let change = {
                    let Simulation { events, arena, .. } = self;
                    events.execute_events(arena, reached)
                };
                if change > ChangeCode::NoChange {
                    self.dynamic_check_and_reset(&diff_mode, change)?;
                    self.dyn_algebraic_solve()?;
                }
            }
        }
        self.state = SimState::DynamicComplete;
        Ok(())
    }

    /// Hand the differential state to the algebraic companion through the
    /// paired-index mechanism and solve.
    pub(crate) fn dyn_algebraic_solve(&mut self) -> Result<()> {
        let alg_mode = self.modes.algebraic;
        let diff_mode = self.modes.differential;
        let diff_index = self.handle_index(&diff_mode);
        let diff_state = self.solvers[diff_index].as_ref().unwrap().state.clone();
        let diff_dstate = self.solvers[diff_index].as_ref().unwrap().dstate.clone();
        let diff_time = self.current_time;

        let code = {
            let index = self.handle_index(&alg_mode);
            let Simulation {
                arena,
                root,
                solvers,
                current_time,
                ..
            } = self;
            let handle = solvers[index].as_mut().unwrap();
            let mut client = PartitionedAlgClient {
                arena,
                root: *root,
                mode: alg_mode,
                diff_state: &diff_state,
                diff_dstate: &diff_dstate,
                diff_time,
                seq: 1,
            };
            handle.solve_algebraic(&mut client, *current_time)
        };
        if code < 0 {
            self.state = SimState::DynamicPartial;
            return Err(anyhow!("algebraic companion solve failed with code {code}"));
        }
        Ok(())
    }

    /// Decoupled stepping is reserved.
    pub fn dynamic_decoupled(&mut self, _t_end: f64) -> Result<()> {
        Err(anyhow!(
            "decoupled dynamic mode is not available (code {FUNCTION_EXECUTION_FAILURE})"
        ))
    }

    /// Advance one bounded step of the default dynamic strategy, returning
    /// the reached time.
    pub fn step(&mut self, t_stop: f64) -> Result<f64> {
        let mode = self.modes.dae;
        if self.state < SimState::DynamicInitialized {
            self.dyn_initialize(self.current_time, &mode)?;
        }
        let bounded = t_stop.min(self.current_time + self.options.max_step);
        let (reached, code) = {
            let index = self.handle_index(&mode);
            let Simulation {
                arena,
                root,
                solvers,
                ..
            } = self;
            let handle = solvers[index].as_mut().unwrap();
            let mut client = TreeClient::new(arena, *root, mode);
            handle.solve_to(&mut client, bounded)
        };
        self.current_time = reached;
        if code == SOLVER_ROOT_FOUND {
            let mask = self.handle(&mode).root_mask();
            self.set_state_from_handle(&mode);
            let change = self.arena.root_trigger(self.root, reached, &mask, &mode);
            self.dynamic_check_and_reset(&mode, change)?;
            self.handle(&mode).reset_roots();
        } else if code < 0 {
            return Err(anyhow!("step failed with code {code}"));
        } else {
            self.set_state_from_handle(&mode);
        }
        if self.state < SimState::DynamicComplete {
            self.state = SimState::DynamicPartial;
        }
        Ok(reached)
    }

    /// Re-establish solver consistency after a change of the given
    /// severity.
    pub(crate) fn dynamic_check_and_reset(
        &mut self,
        mode: &SolverMode,
        change: ChangeCode,
    ) -> Result<()> {
        if change == ChangeCode::NoChange {
            return Ok(());
        }
        if change >= ChangeCode::ObjectChange {
            warn!(?change, "structural change: reinitializing the dynamic mode");
            self.reinit_mode(mode, change.max(ChangeCode::StateCountChange))?;
            self.guess_into_handle(mode);
            self.compute_dynamic_ic(mode)?;
            self.set_state_from_handle(mode);
            self.handle(mode).reset_roots();
            return Ok(());
        }
        // parameter-level changes: re-solve the algebraic picture and reset
        // root bookkeeping
        if mode.is_dae() {
            let index = self.handle_index(mode);
            let time = self.current_time;
            let code = {
                let Simulation {
                    arena,
                    root,
                    solvers,
                    ..
                } = self;
                let handle = solvers[index].as_mut().unwrap();
                let mut client = TreeClient::new(arena, *root, *mode);
                handle.calc_ic(&mut client, time, crate::solvers::IcMode::FixedDiff)
            };
            if code < 0 {
                self.compute_dynamic_ic(mode)?;
            }
            self.set_state_from_handle(mode);
        } else {
            self.dyn_algebraic_solve()?;
        }
        // a discrete change may have jumped the state across a root level
        let sd = StateData::empty();
        let root_change = self
            .arena
            .root_check(self.root, &sd, CheckLevel::CompleteStateCheck);
        if root_change >= ChangeCode::ObjectChange {
            self.dynamic_check_and_reset(mode, root_change)?;
        }
        self.handle(mode).reset_roots();
        Ok(())
    }
}
