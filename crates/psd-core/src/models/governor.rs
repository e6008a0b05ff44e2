//! First-order droop governor.
//!
//! One differential state, the mechanical power command:
//! `T dPm/dt = Pref - (omega - 1)/R - Pm`, clamped at the gate limits.

use crate::change::ParamResult;
use crate::component::{EvalCtx, GridModel};
use crate::error::PsdResult;
use crate::matrix::MatrixData;
use crate::models::diff_state_of;
use crate::object::{ComponentBase, OpFlag};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;

#[derive(Debug, Clone)]
pub struct Governor {
    /// Droop (per-unit speed change for full gate travel)
    pub r: f64,
    /// Servo time constant (seconds)
    pub t1: f64,
    /// Power reference
    pub p_ref: f64,
    pub p_min: f64,
    pub p_max: f64,
    /// Cached mechanical power state
    pub pm: f64,
}

impl Default for Governor {
    fn default() -> Self {
        Governor {
            r: 0.05,
            t1: 0.5,
            p_ref: 0.0,
            p_min: 0.0,
            p_max: f64::INFINITY,
            pm: 0.0,
        }
    }
}

impl Governor {
    /// Parent generator speed, live.
    fn omega_live(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> f64 {
        ctx.base()
            .parent
            .and_then(|gen| diff_state_of(ctx, gen, sd, mode, 1))
            .unwrap_or(1.0)
    }

    fn rhs(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode, pm: f64) -> f64 {
        let omega = self.omega_live(ctx, sd, mode);
        let raw = (self.p_ref - (omega - 1.0) / self.r - pm) / self.t1;
        // non-windup limits: stop integrating past a bound
        if (pm >= self.p_max && raw > 0.0) || (pm <= self.p_min && raw < 0.0) {
            0.0
        } else {
            raw
        }
    }
}

impl GridModel for Governor {
    fn type_name(&self) -> &'static str {
        "governor"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, mode: &SolverMode) -> StateSizes {
        if mode.is_local() || (mode.is_dynamic() && mode.has_differential()) {
            StateSizes {
                diff: 1,
                ..Default::default()
            }
        } else {
            StateSizes::default()
        }
    }

    fn local_jacobian_count(&self, _base: &ComponentBase, mode: &SolverMode) -> usize {
        if mode.is_dynamic() && mode.has_differential() {
            3
        } else {
            0
        }
    }

    fn dyn_init_a(&mut self, base: &mut ComponentBase, _time0: f64, _flags: u32) {
        base.flags.set(OpFlag::HasDifferentialStates, true);
    }

    fn dyn_init_b(&mut self, _base: &mut ComponentBase, inputs: &[f64]) {
        // inputs: [Pm0, Efd0, V] from the parent generator
        if let Some(&pm0) = inputs.first() {
            self.pm = pm0;
            self.p_ref = pm0;
        }
    }

    fn guess_state(
        &self,
        ctx: &EvalCtx,
        _time: f64,
        state: &mut [f64],
        dstate: &mut [f64],
        mode: &SolverMode,
    ) {
        if let Some(off) = ctx.base().offsets.get(mode).and_then(|so| so.diff_offset) {
            if off < state.len() {
                state[off] = self.pm;
            }
            if off < dstate.len() {
                dstate[off] = 0.0;
            }
        }
    }

    fn set_state(
        &mut self,
        base: &mut ComponentBase,
        _time: f64,
        state: &[f64],
        _dstate: &[f64],
        mode: &SolverMode,
    ) {
        if let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) {
            if let Some(&pm) = state.get(off) {
                self.pm = pm;
            }
        }
    }

    fn residual(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        resid: &mut [f64],
        mode: &SolverMode,
    ) -> PsdResult<()> {
        if !mode.has_differential() {
            return Ok(());
        }
        let base = ctx.base();
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return Ok(());
        };
        let loc = base.locations(sd, mode)?;
        let pm = loc.diff_state.first().copied().unwrap_or(self.pm);
        let dpm = loc.dstate.first().copied().unwrap_or(0.0);
        resid[off] = self.rhs(ctx, sd, mode, pm) - dpm;
        Ok(())
    }

    fn derivative(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        deriv: &mut [f64],
        mode: &SolverMode,
    ) -> PsdResult<()> {
        if !mode.has_differential() {
            return Ok(());
        }
        let base = ctx.base();
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return Ok(());
        };
        let loc = base.locations(sd, mode)?;
        let pm = loc.diff_state.first().copied().unwrap_or(self.pm);
        deriv[off] = self.rhs(ctx, sd, mode, pm);
        Ok(())
    }

    fn jacobian_elements(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        md: &mut dyn MatrixData,
        _input_locs: &[usize],
        mode: &SolverMode,
    ) {
        if !mode.has_differential() {
            return;
        }
        let base = ctx.base();
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return;
        };
        md.assign(off, off, -1.0 / self.t1 - sd.cj);
        // coupling to the generator speed state
        if let Some(gen) = base.parent {
            if let Some(gen_off) = ctx
                .get(gen)
                .and_then(|c| c.base.offsets.get(mode))
                .and_then(|so| so.diff_offset)
            {
                md.assign(off, gen_off + 1, -1.0 / (self.r * self.t1));
            }
        }
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        if index == 0 {
            self.pm
        } else {
            0.0
        }
    }

    fn set_param(
        &mut self,
        _base: &mut ComponentBase,
        name: &str,
        value: f64,
        _unit: Unit,
    ) -> ParamResult {
        match name {
            "r" | "droop" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.r = value;
            }
            "t1" | "t" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.t1 = value;
            }
            "pref" => self.p_ref = value,
            "pmin" => self.p_min = value,
            "pmax" => self.p_max = value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn get_param(&self, _base: &ComponentBase, name: &str, _unit: Unit) -> Option<f64> {
        match name {
            "r" | "droop" => Some(self.r),
            "t1" | "t" => Some(self.t1),
            "pref" => Some(self.p_ref),
            "pmin" => Some(self.p_min),
            "pmax" => Some(self.p_max),
            "pm" => Some(self.pm),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracks_operating_point() {
        let mut gov = Governor::default();
        let mut base = ComponentBase::new("gov");
        gov.dyn_init_b(&mut base, &[0.8, 1.0, 1.0]);
        assert!((gov.pm - 0.8).abs() < 1e-12);
        assert!((gov.p_ref - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_sizes_only_differential_modes() {
        let gov = Governor::default();
        let base = ComponentBase::new("gov");
        assert_eq!(
            gov.local_state_sizes(&base, &crate::solver_mode::DAE_MODE)
                .diff,
            1
        );
        assert_eq!(
            gov.local_state_sizes(&base, &crate::solver_mode::POWER_FLOW_MODE)
                .total(),
            0
        );
    }
}
