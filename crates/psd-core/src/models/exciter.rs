//! First-order automatic voltage regulator.
//!
//! One differential state, the field voltage:
//! `Ta dEfd/dt = Ka (Vref - V) - Efd`, clamped at the ceiling limits.

use crate::change::ParamResult;
use crate::component::{EvalCtx, GridModel};
use crate::error::PsdResult;
use crate::matrix::MatrixData;
use crate::object::{ComponentBase, OpFlag};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;

#[derive(Debug, Clone)]
pub struct Exciter {
    /// Regulator gain
    pub ka: f64,
    /// Regulator time constant (seconds)
    pub ta: f64,
    /// Voltage reference
    pub v_ref: f64,
    pub e_min: f64,
    pub e_max: f64,
    /// Cached field voltage state
    pub efd: f64,
}

impl Default for Exciter {
    fn default() -> Self {
        Exciter {
            ka: 50.0,
            ta: 0.1,
            v_ref: 1.0,
            e_min: 0.0,
            e_max: 5.0,
            efd: 1.0,
        }
    }
}

impl Exciter {
    /// Terminal voltage of the grandparent bus, live.
    fn terminal_v(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> f64 {
        let bus = ctx
            .base()
            .parent
            .and_then(|gen| ctx.get(gen))
            .and_then(|g| g.base.parent);
        match bus {
            Some(b) => crate::models::bus_va(ctx, b, sd, mode).0,
            None => 1.0,
        }
    }

    fn rhs(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode, efd: f64) -> f64 {
        let v = self.terminal_v(ctx, sd, mode);
        let raw = (self.ka * (self.v_ref - v) - efd) / self.ta;
        if (efd >= self.e_max && raw > 0.0) || (efd <= self.e_min && raw < 0.0) {
            0.0
        } else {
            raw
        }
    }
}

impl GridModel for Exciter {
    fn type_name(&self) -> &'static str {
        "exciter"
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
            2
        } else {
            0
        }
    }

    fn dyn_init_a(&mut self, base: &mut ComponentBase, _time0: f64, _flags: u32) {
        base.flags.set(OpFlag::HasDifferentialStates, true);
    }

    fn dyn_init_b(&mut self, _base: &mut ComponentBase, inputs: &[f64]) {
        // inputs: [Pm0, Efd0, V] from the parent generator
        let efd0 = inputs.get(1).copied().unwrap_or(self.efd);
        let v0 = inputs.get(2).copied().unwrap_or(1.0);
        self.efd = efd0;
        // pick Vref so the operating point is an equilibrium
        self.v_ref = v0 + efd0 / self.ka;
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
                state[off] = self.efd;
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
            if let Some(&efd) = state.get(off) {
                self.efd = efd;
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
        let efd = loc.diff_state.first().copied().unwrap_or(self.efd);
        let defd = loc.dstate.first().copied().unwrap_or(0.0);
        resid[off] = self.rhs(ctx, sd, mode, efd) - defd;
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
        let efd = loc.diff_state.first().copied().unwrap_or(self.efd);
        deriv[off] = self.rhs(ctx, sd, mode, efd);
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
        md.assign(off, off, -1.0 / self.ta - sd.cj);
        // coupling to the terminal bus voltage
        if mode.has_algebraic() {
            let bus = base
                .parent
                .and_then(|gen| ctx.get(gen))
                .and_then(|g| g.base.parent);
            if let Some(v_col) = bus
                .and_then(|b| ctx.get(b))
                .and_then(|c| c.base.offsets.get(mode))
                .and_then(|so| so.v_offset)
            {
                md.assign(off, v_col, -self.ka / self.ta);
            }
        }
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        if index == 0 {
            self.efd
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
            "ka" | "gain" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.ka = value;
            }
            "ta" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.ta = value;
            }
            "vref" => self.v_ref = value,
            "emin" => self.e_min = value,
            "emax" => self.e_max = value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn get_param(&self, _base: &ComponentBase, name: &str, _unit: Unit) -> Option<f64> {
        match name {
            "ka" | "gain" => Some(self.ka),
            "ta" => Some(self.ta),
            "vref" => Some(self.v_ref),
            "emin" => Some(self.e_min),
            "emax" => Some(self.e_max),
            "efd" => Some(self.efd),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_sets_equilibrium_reference() {
        let mut exc = Exciter::default();
        let mut base = ComponentBase::new("exc");
        exc.dyn_init_b(&mut base, &[0.8, 1.1, 1.02]);
        assert!((exc.efd - 1.1).abs() < 1e-12);
        // at the operating point the rhs numerator must vanish
        let numerator = exc.ka * (exc.v_ref - 1.02) - exc.efd;
        assert!(numerator.abs() < 1e-9);
    }
}
