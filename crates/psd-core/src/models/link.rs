//! Transmission link: pi-model branch between two buses.
//!
//! Links hold no states of their own; they contribute flow terms and
//! Jacobian entries to their terminal buses' balance rows. Tap ratio and
//! phase shift are applied on the from side.

use crate::change::{ChangeCode, CheckLevel, ParamResult};
use crate::component::{EvalCtx, GridAction, GridModel};
use crate::models::bus_va;
use crate::object::{ComponentBase, ComponentId};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;
use num_complex::{Complex64, ComplexFloat};

/// Which terminal a flow is evaluated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSide {
    From,
    To,
}

/// Power flow leaving one terminal and its partial derivatives.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowTerms {
    pub p: f64,
    pub q: f64,
    pub dp_dv_own: f64,
    pub dp_dv_other: f64,
    pub dp_da_own: f64,
    pub dq_dv_own: f64,
    pub dq_dv_other: f64,
    pub dq_da_own: f64,
    // derivatives with respect to the other terminal's angle are the
    // negatives of the own-angle terms
}

#[derive(Debug, Clone)]
pub struct Link {
    pub from_bus: Option<ComponentId>,
    pub to_bus: Option<ComponentId>,
    /// Terminal names awaiting resolution by the network pass
    pub from_name: Option<String>,
    pub to_name: Option<String>,
    /// Series resistance (per-unit)
    pub r: f64,
    /// Series reactance (per-unit)
    pub x: f64,
    /// Total line charging susceptance (per-unit, split half/half)
    pub b_charging: f64,
    /// Multiplicative tap magnitude applied from the from side
    pub tap: f64,
    /// Phase shift applied from the from side (radians)
    pub phase_shift: f64,
    /// Thermal rating (per-unit MVA) for violation checks
    pub rating: Option<f64>,
    /// Cached from-side flow after the last set_state
    pub flow_p: f64,
    pub flow_q: f64,
}

impl Default for Link {
    fn default() -> Self {
        Link {
            from_bus: None,
            to_bus: None,
            from_name: None,
            to_name: None,
            r: 0.0,
            x: 0.0001,
            b_charging: 0.0,
            tap: 1.0,
            phase_shift: 0.0,
            rating: None,
            flow_p: 0.0,
            flow_q: 0.0,
        }
    }
}

impl Link {
    /// Two-port admittance entries `(y_ff, y_ft, y_tf, y_tt)`.
    pub fn admittances(&self) -> (Complex64, Complex64, Complex64, Complex64) {
        let z = Complex64::new(self.r, self.x);
        let y = z.recip();
        let b_sh = Complex64::new(0.0, self.b_charging / 2.0);
        let tap_mag = if self.tap > 0.0 { self.tap } else { 1.0 };
        let tap = Complex64::from_polar(tap_mag, self.phase_shift);
        let y_ff = y / (tap_mag * tap_mag) + b_sh;
        let y_ft = -(y / tap.conj());
        let y_tf = -(y / tap);
        let y_tt = y + b_sh;
        (y_ff, y_ft, y_tf, y_tt)
    }

    /// Flow leaving the given terminal with partials, from terminal
    /// voltages/angles. `v_own`/`a_own` belong to the side evaluated.
    pub fn flow(&self, side: LinkSide, v_own: f64, a_own: f64, v_other: f64, a_other: f64) -> FlowTerms {
        let (y_ff, y_ft, y_tf, y_tt) = self.admittances();
        let (y_ss, y_st) = match side {
            LinkSide::From => (y_ff, y_ft),
            LinkSide::To => (y_tt, y_tf),
        };
        let (g_ss, b_ss) = (y_ss.re, y_ss.im);
        let (g_st, b_st) = (y_st.re, y_st.im);
        let theta = a_own - a_other;
        let (sin_t, cos_t) = theta.sin_cos();

        let p = v_own * v_own * g_ss + v_own * v_other * (g_st * cos_t + b_st * sin_t);
        let q = -v_own * v_own * b_ss + v_own * v_other * (g_st * sin_t - b_st * cos_t);

        FlowTerms {
            p,
            q,
            dp_dv_own: 2.0 * v_own * g_ss + v_other * (g_st * cos_t + b_st * sin_t),
            dp_dv_other: v_own * (g_st * cos_t + b_st * sin_t),
            dp_da_own: v_own * v_other * (-g_st * sin_t + b_st * cos_t),
            dq_dv_own: -2.0 * v_own * b_ss + v_other * (g_st * sin_t - b_st * cos_t),
            dq_dv_other: v_own * (g_st * sin_t - b_st * cos_t),
            dq_da_own: v_own * v_other * (g_st * cos_t + b_st * sin_t),
        }
    }

    /// DC flow leaving the given terminal: `(theta_own - theta_other -+ shift)/x`.
    pub fn dc_flow(&self, side: LinkSide, a_own: f64, a_other: f64) -> (f64, f64) {
        let shift = match side {
            LinkSide::From => self.phase_shift,
            LinkSide::To => -self.phase_shift,
        };
        let p = (a_own - a_other - shift) / self.x;
        (p, 1.0 / self.x)
    }

    /// The other terminal relative to `bus`.
    pub fn other_terminal(&self, bus: ComponentId) -> Option<(LinkSide, ComponentId)> {
        if self.from_bus == Some(bus) {
            self.to_bus.map(|t| (LinkSide::From, t))
        } else if self.to_bus == Some(bus) {
            self.from_bus.map(|f| (LinkSide::To, f))
        } else {
            None
        }
    }

    /// Evaluate the flow leaving `bus` under live state data. A link with a
    /// disconnected far terminal carries nothing.
    pub fn flow_out_of(
        &self,
        ctx: &EvalCtx,
        bus: ComponentId,
        sd: &StateData,
        mode: &SolverMode,
    ) -> Option<(FlowTerms, ComponentId)> {
        let (side, other) = self.other_terminal(bus)?;
        if !ctx.get(other)?.base.is_connected() {
            return None;
        }
        let (v_own, a_own) = bus_va(ctx, bus, sd, mode);
        let (v_other, a_other) = bus_va(ctx, other, sd, mode);
        if mode.is_dc() {
            let (p, dp_da) = self.dc_flow(side, a_own, a_other);
            return Some((
                FlowTerms {
                    p,
                    dp_da_own: dp_da,
                    ..Default::default()
                },
                other,
            ));
        }
        Some((self.flow(side, v_own, a_own, v_other, a_other), other))
    }

    /// Apparent-power loading on the from side.
    pub fn mva_loading(&self) -> f64 {
        (self.flow_p * self.flow_p + self.flow_q * self.flow_q).sqrt()
    }
}

impl GridModel for Link {
    fn type_name(&self) -> &'static str {
        "link"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, _mode: &SolverMode) -> StateSizes {
        StateSizes::default()
    }

    fn set_state(
        &mut self,
        base: &mut ComponentBase,
        _time: f64,
        _state: &[f64],
        _dstate: &[f64],
        _mode: &SolverMode,
    ) {
        let _ = base;
    }

    fn outputs(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        mode: &SolverMode,
    ) -> Vec<f64> {
        match self.from_bus.and_then(|f| self.flow_out_of(ctx, f, sd, mode)) {
            Some((flow, _)) => vec![flow.p, flow.q],
            None => vec![0.0, 0.0],
        }
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        match index {
            0 => self.flow_p,
            1 => self.flow_q,
            _ => 0.0,
        }
    }

    fn power_flow_adjust(
        &self,
        ctx: &EvalCtx,
        _flags: u32,
        level: CheckLevel,
    ) -> (ChangeCode, Vec<GridAction>) {
        if level != CheckLevel::HighAngleTrip {
            return (ChangeCode::NoChange, Vec::new());
        }
        let (Some(from), Some(to)) = (self.from_bus, self.to_bus) else {
            return (ChangeCode::NoChange, Vec::new());
        };
        let sd = StateData::empty();
        let (_, a_from) = bus_va(ctx, from, &sd, &crate::solver_mode::LOCAL_MODE);
        let (_, a_to) = bus_va(ctx, to, &sd, &crate::solver_mode::LOCAL_MODE);
        if (a_from - a_to - self.phase_shift).abs() > std::f64::consts::FRAC_PI_2 {
            return (
                ChangeCode::ObjectChange,
                vec![GridAction::Disconnect(ctx.id)],
            );
        }
        (ChangeCode::NoChange, Vec::new())
    }

    fn set_param(
        &mut self,
        _base: &mut ComponentBase,
        name: &str,
        value: f64,
        _unit: Unit,
    ) -> ParamResult {
        match name {
            "r" | "resistance" => self.r = value,
            "x" | "reactance" => {
                if value == 0.0 {
                    return ParamResult::Invalid;
                }
                self.x = value;
            }
            "b" | "charging" => self.b_charging = value,
            "tap" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.tap = value;
            }
            "shift" | "phaseshift" => self.phase_shift = value,
            "rating" | "smax" => self.rating = (value > 0.0).then_some(value),
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn set_param_str(&mut self, _base: &mut ComponentBase, name: &str, value: &str) -> ParamResult {
        match name {
            "from" | "bus1" => self.from_name = Some(value.to_string()),
            "to" | "bus2" => self.to_name = Some(value.to_string()),
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn get_param(&self, _base: &ComponentBase, name: &str, _unit: Unit) -> Option<f64> {
        match name {
            "r" | "resistance" => Some(self.r),
            "x" | "reactance" => Some(self.x),
            "b" | "charging" => Some(self.b_charging),
            "tap" => Some(self.tap),
            "shift" | "phaseshift" => Some(self.phase_shift),
            "rating" | "smax" => self.rating,
            "p" | "flow" => Some(self.flow_p),
            "q" => Some(self.flow_q),
            "loading" => Some(self.mva_loading()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admittance_lossless_line() {
        let link = Link {
            x: 0.1,
            ..Default::default()
        };
        let (y_ff, y_ft, _, y_tt) = link.admittances();
        assert!((y_ff.im + 10.0).abs() < 1e-9);
        assert!((y_ft.im - 10.0).abs() < 1e-9);
        assert_eq!(y_ff, y_tt);
    }

    #[test]
    fn test_flow_symmetry_lossless() {
        let link = Link {
            x: 0.1,
            ..Default::default()
        };
        let f = link.flow(LinkSide::From, 1.0, 0.1, 1.0, 0.0);
        let t = link.flow(LinkSide::To, 1.0, 0.0, 1.0, 0.1);
        // lossless: power in equals power out
        assert!((f.p + t.p).abs() < 1e-12);
        assert!(f.p > 0.0);
    }

    #[test]
    fn test_losses_with_resistance() {
        let link = Link {
            r: 0.02,
            x: 0.1,
            ..Default::default()
        };
        let f = link.flow(LinkSide::From, 1.02, 0.0, 0.95, -0.08);
        let t = link.flow(LinkSide::To, 0.95, -0.08, 1.02, 0.0);
        let loss = f.p + t.p;
        assert!(loss > 0.0);
    }

    #[test]
    fn test_flow_partials_match_finite_difference() {
        let link = Link {
            r: 0.01,
            x: 0.08,
            b_charging: 0.04,
            tap: 1.02,
            phase_shift: 0.02,
            ..Default::default()
        };
        let (v1, a1, v2, a2) = (1.01, 0.05, 0.97, -0.03);
        let f0 = link.flow(LinkSide::From, v1, a1, v2, a2);
        let h = 1e-7;
        let fd_dv = (link.flow(LinkSide::From, v1 + h, a1, v2, a2).p - f0.p) / h;
        let fd_da = (link.flow(LinkSide::From, v1, a1 + h, v2, a2).p - f0.p) / h;
        let fd_dq_dv2 = (link.flow(LinkSide::From, v1, a1, v2 + h, a2).q - f0.q) / h;
        assert!((fd_dv - f0.dp_dv_own).abs() < 1e-5);
        assert!((fd_da - f0.dp_da_own).abs() < 1e-5);
        assert!((fd_dq_dv2 - f0.dq_dv_other).abs() < 1e-5);
    }

    #[test]
    fn test_dc_flow() {
        let link = Link {
            x: 0.2,
            ..Default::default()
        };
        let (p, dp) = link.dc_flow(LinkSide::From, 0.1, 0.0);
        assert!((p - 0.5).abs() < 1e-12);
        assert!((dp - 5.0).abs() < 1e-12);
    }
}
