//! Staged error recovery.
//!
//! Each recovery class walks an ordered list of fixes; `attempt_fix` applies
//! the next one and reports whether more remain. The driver retries its
//! solve between attempts.

use crate::simulation::Simulation;
use anyhow::Result;
use psd_core::{
    ChangeCode, CheckLevel, ConvergeMode, SolverMode, StateData, SOLVER_INITIAL_SETUP_ERROR,
    SOLVER_INVALID_STATE_ERROR,
};
use tracing::{debug, info};

/// Result of one recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The fix solved the problem outright
    Fixed,
    /// A fix was applied; retry the solve
    MoreOptions,
    /// Nothing left to try
    OutOfOptions,
}

/// Staged power-flow failure recovery.
#[derive(Debug, Default)]
pub struct PowerFlowErrorRecovery {
    attempt_number: usize,
    applied_pq_low_v: bool,
}

impl PowerFlowErrorRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempt_number
    }

    pub fn reset(&mut self) {
        self.attempt_number = 0;
    }

    pub fn attempt_fix(&mut self, sim: &mut Simulation, error_code: i32) -> Result<RecoveryOutcome> {
        let mode = sim.modes.powerflow;
        if error_code == SOLVER_INITIAL_SETUP_ERROR {
            // something went wrong in setup; try a full reinitialization
            sim.reinit_mode(&mode, ChangeCode::StateCountChange)?;
            return Ok(if self.attempt_number > 3 {
                RecoveryOutcome::OutOfOptions
            } else {
                RecoveryOutcome::MoreOptions
            });
        }
        if error_code == SOLVER_INVALID_STATE_ERROR {
            self.low_voltage_fix(sim)?;
        }
        self.attempt_number += 1;
        info!(stage = self.attempt_number, "power flow recovery attempt");
        match self.attempt_number {
            1 => {
                if self.fix_nonreversible(sim)? {
                    Ok(RecoveryOutcome::MoreOptions)
                } else {
                    self.attempt_fix(sim, 0)
                }
            }
            2 => {
                self.fix_block_converge(sim, &mode)?;
                Ok(RecoveryOutcome::MoreOptions)
            }
            3 => {
                if self.fix_low_voltage_loads(sim, &mode)? {
                    Ok(RecoveryOutcome::MoreOptions)
                } else {
                    self.attempt_fix(sim, 0)
                }
            }
            4 => {
                if self.fix_disconnect_very_low(sim, &mode)? {
                    Ok(RecoveryOutcome::MoreOptions)
                } else {
                    self.attempt_fix(sim, 0)
                }
            }
            5 => {
                self.fix_high_angle_trip(sim, &mode)?;
                Ok(RecoveryOutcome::MoreOptions)
            }
            _ => Ok(RecoveryOutcome::OutOfOptions),
        }
    }

    /// Stage 1: apply any non-reversible adjustments that are out there.
    fn fix_nonreversible(&mut self, sim: &mut Simulation) -> Result<bool> {
        let mode = sim.modes.powerflow;
        sim.arena.refresh_caches(sim.root);
        let eval = sim
            .arena
            .power_flow_adjust(sim.root, 0, CheckLevel::FullCheck);
        if eval > ChangeCode::NonStateChange {
            sim.check_network_simplified()?;
            sim.reinit_mode(&mode, eval)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Stage 2: a few rounds of block iteration to pull the guess into a
    /// solvable region.
    fn fix_block_converge(&mut self, sim: &mut Simulation, mode: &SolverMode) -> Result<()> {
        sim.guess_into_handle(mode);
        sim.converge(mode, ConvergeMode::BlockIteration, 0.1);
        sim.set_state_from_handle(mode);
        let eval = sim
            .arena
            .power_flow_adjust(sim.root, 0, CheckLevel::ReversableOnly);
        sim.reinit_mode(mode, eval)?;
        Ok(())
    }

    /// Stage 3: below 0.7 pu anywhere, put the loads on their low-voltage
    /// characteristic (once) and iterate the reversible adjustments until
    /// they stop moving.
    fn fix_low_voltage_loads(&mut self, sim: &mut Simulation, mode: &SolverMode) -> Result<bool> {
        if !sim.voltages().iter().any(|&v| v < 0.7) {
            return Ok(false);
        }
        sim.guess_into_handle(mode);
        sim.converge(mode, ConvergeMode::SingleIteration, 1.0);
        sim.set_state_from_handle(mode);
        if !self.applied_pq_low_v {
            sim.arena.set_all(sim.root, "load", "pqlowvlimit", 1.0);
            self.applied_pq_low_v = true;
            debug!("pq low-voltage limiting enabled on all loads");
        }
        sim.arena
            .power_flow_adjust(sim.root, 0, CheckLevel::ReversableOnly);
        sim.reinit_mode(mode, ChangeCode::StateCountChange)?;
        sim.guess_into_handle(mode);
        sim.converge(mode, ConvergeMode::BlockIteration, 0.1);
        sim.set_state_from_handle(mode);
        let mut eval = sim
            .arena
            .power_flow_adjust(sim.root, 0, CheckLevel::ReversableOnly);
        let mut guard = 0;
        while eval > ChangeCode::NoChange && guard < 10 {
            guard += 1;
            sim.reinit_mode(mode, eval)?;
            sim.guess_into_handle(mode);
            sim.converge(mode, ConvergeMode::SingleIteration, 1.0);
            sim.set_state_from_handle(mode);
            eval = sim
                .arena
                .power_flow_adjust(sim.root, 0, CheckLevel::ReversableOnly);
        }
        Ok(true)
    }

    /// Stage 4: below 0.1 pu anywhere, arm the per-bus low-voltage
    /// disconnect.
    fn fix_disconnect_very_low(&mut self, sim: &mut Simulation, mode: &SolverMode) -> Result<bool> {
        if !sim.voltages().iter().any(|&v| v < 0.1) {
            return Ok(false);
        }
        sim.arena.set_all(sim.root, "bus", "lowvdisconnect", 0.03);
        sim.arena
            .power_flow_adjust(sim.root, 0, CheckLevel::LowVoltageCheck);
        sim.reinit_mode(mode, ChangeCode::ObjectChange)?;
        Ok(true)
    }

    /// Stage 5: disconnect links with terminal angle differentials past
    /// pi/2.
    fn fix_high_angle_trip(&mut self, sim: &mut Simulation, mode: &SolverMode) -> Result<()> {
        let eval = sim
            .arena
            .power_flow_adjust(sim.root, 0, CheckLevel::HighAngleTrip);
        if eval > ChangeCode::NoChange {
            sim.check_network_simplified()?;
            sim.reinit_mode(mode, eval)?;
        }
        Ok(())
    }

    /// Invoked before counting an attempt when the solver reports an
    /// invalid state.
    fn low_voltage_fix(&mut self, sim: &mut Simulation) -> Result<bool> {
        let eval = sim
            .arena
            .power_flow_adjust(sim.root, 0, CheckLevel::LowVoltageCheck);
        if eval > ChangeCode::NoChange {
            sim.check_network_simplified()?;
            let mode = sim.modes.powerflow;
            sim.reinit_mode(&mode, eval)?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Staged recovery for dynamic initial-condition failures.
#[derive(Debug, Default)]
pub struct DynamicInitRecovery {
    attempt_number: usize,
}

impl DynamicInitRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_fix(&mut self, sim: &mut Simulation, mode: &SolverMode) -> Result<RecoveryOutcome> {
        self.attempt_number += 1;
        info!(stage = self.attempt_number, "dynamic IC recovery attempt");
        match self.attempt_number {
            1 => {
                // pull the voltages back to their setpoints and relax
                sim.reset_voltages();
                sim.guess_into_handle(mode);
                sim.converge(mode, ConvergeMode::BlockIteration, 0.1);
                Ok(self.retry_ic(sim, mode))
            }
            2 => {
                let sd = StateData::empty();
                sim.arena
                    .root_check(sim.root, &sd, CheckLevel::LowVoltageCheck);
                sim.guess_into_handle(mode);
                Ok(self.retry_ic(sim, mode))
            }
            3 => {
                sim.converge(mode, ConvergeMode::StrongIteration, 0.5);
                Ok(self.retry_ic(sim, mode))
            }
            _ => Ok(RecoveryOutcome::OutOfOptions),
        }
    }

    fn retry_ic(&self, sim: &mut Simulation, mode: &SolverMode) -> RecoveryOutcome {
        let index = sim.handle_index(mode);
        let time = sim.current_time;
        let code = {
            let Simulation {
                arena,
                root,
                solvers,
                ..
            } = sim;
            let handle = solvers[index].as_mut().unwrap();
            let mut client = crate::client::TreeClient::new(arena, *root, *mode);
            handle.calc_ic(&mut client, time, crate::solvers::IcMode::FixedDiff)
        };
        if code >= 0 {
            sim.set_state_from_handle(mode);
            RecoveryOutcome::Fixed
        } else {
            RecoveryOutcome::MoreOptions
        }
    }
}

/// Staged recovery after a fault-clearing reset fails to reconverge.
#[derive(Debug, Default)]
pub struct FaultResetRecovery {
    attempt_number: usize,
}

impl FaultResetRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempt_fix(&mut self, sim: &mut Simulation, mode: &SolverMode) -> Result<RecoveryOutcome> {
        self.attempt_number += 1;
        match self.attempt_number {
            1 => {
                sim.converge(mode, ConvergeMode::SingleIteration, 1.0);
                Ok(RecoveryOutcome::MoreOptions)
            }
            2 => {
                sim.reset_voltages();
                sim.guess_into_handle(mode);
                sim.converge(mode, ConvergeMode::BlockIteration, 0.1);
                Ok(RecoveryOutcome::MoreOptions)
            }
            3 => {
                let sd = StateData::empty();
                sim.arena
                    .root_check(sim.root, &sd, CheckLevel::CompleteStateCheck);
                sim.guess_into_handle(mode);
                Ok(RecoveryOutcome::MoreOptions)
            }
            _ => Ok(RecoveryOutcome::OutOfOptions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_stages_exhaust() {
        let mut sim = Simulation::new("test");
        sim.pflow_initialize(0.0).unwrap();
        let mode = sim.modes.powerflow;
        sim.reinit_mode(&mode, ChangeCode::StateCountChange).unwrap();

        let mut recovery = PowerFlowErrorRecovery::new();
        let mut outcomes = Vec::new();
        for _ in 0..8 {
            let outcome = recovery.attempt_fix(&mut sim, 0).unwrap();
            outcomes.push(outcome);
            if outcome == RecoveryOutcome::OutOfOptions {
                break;
            }
        }
        assert_eq!(outcomes.last(), Some(&RecoveryOutcome::OutOfOptions));
        assert!(recovery.attempts() >= 5);
    }

    #[test]
    fn test_setup_error_reinitializes() {
        let mut sim = Simulation::new("test");
        sim.pflow_initialize(0.0).unwrap();
        let mut recovery = PowerFlowErrorRecovery::new();
        let outcome = recovery
            .attempt_fix(&mut sim, SOLVER_INITIAL_SETUP_ERROR)
            .unwrap();
        assert_eq!(outcome, RecoveryOutcome::MoreOptions);
    }
}
