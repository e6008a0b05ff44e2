//! Generator model: static P/Q injection for power flow, classical machine
//! for dynamics.
//!
//! The machine carries two differential states (rotor angle delta and speed
//! omega) behind transient reactance. Mechanical power comes from a governor
//! sub-model when one is attached, the field voltage from an exciter;
//! otherwise both are held at their initialization values.

use crate::change::{ChangeCode, CheckLevel, ParamResult};
use crate::component::{ComponentKind, EvalCtx, GridAction, GridModel};
use crate::error::PsdResult;
use crate::matrix::MatrixData;
use crate::models::{child_matching, diff_state_of};
use crate::object::{ComponentBase, ComponentId, OpFlag};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;

/// Electrical output of the machine with the partials bus rows need.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElecTerms {
    pub p: f64,
    pub q: f64,
    pub dp_ddelta: f64,
    pub dp_dv: f64,
    pub dp_dtheta: f64,
    pub dp_de: f64,
    pub dq_ddelta: f64,
    pub dq_dv: f64,
    pub dq_dtheta: f64,
    pub dq_de: f64,
    /// Live state column of delta in the current mode, if any
    pub delta_col: Option<usize>,
    /// Live state column of the exciter field voltage, if any
    pub efd_col: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Generator {
    /// Real power setpoint (per-unit)
    pub power_set: f64,
    /// Reactive power setpoint (per-unit)
    pub q_set: f64,
    pub p_min: f64,
    pub p_max: f64,
    pub q_min: f64,
    pub q_max: f64,
    /// Participation factor for slack redistribution
    pub participation: f64,

    /// Inertia constant H (seconds)
    pub h: f64,
    /// Damping coefficient D (per-unit)
    pub d: f64,
    /// Transient reactance X'd (per-unit)
    pub xdp: f64,

    /// Cached rotor angle (radians)
    pub delta: f64,
    /// Cached speed (per-unit, 1 = synchronous)
    pub omega: f64,
    /// Internal EMF magnitude behind X'd
    pub emf: f64,
    /// Mechanical power when no governor is attached
    pub mech_power: f64,
    /// Field voltage when no exciter is attached
    pub field_voltage: f64,

    /// Terminal readings cached by the network pass
    pub bus_voltage: f64,
    pub bus_angle: f64,
}

impl Default for Generator {
    fn default() -> Self {
        Generator {
            power_set: 0.0,
            q_set: 0.0,
            p_min: 0.0,
            p_max: f64::INFINITY,
            q_min: f64::NEG_INFINITY,
            q_max: f64::INFINITY,
            participation: 1.0,
            h: 0.0,
            d: 0.0,
            xdp: 0.25,
            delta: 0.0,
            omega: 1.0,
            emf: 1.0,
            mech_power: 0.0,
            field_voltage: 1.0,
            bus_voltage: 1.0,
            bus_angle: 0.0,
        }
    }
}

impl Generator {
    /// Whether the machine contributes differential states (H set).
    pub fn has_machine_states(&self) -> bool {
        self.h > 0.0
    }

    /// Headroom above the current setpoint, for slack redistribution.
    pub fn up_capacity(&self) -> f64 {
        if self.p_max.is_finite() {
            (self.p_max - self.power_set).max(0.0)
        } else {
            (1.0 + self.participation) * self.power_set.max(0.1)
        }
    }

    /// Headroom below the current setpoint.
    pub fn down_capacity(&self) -> f64 {
        (self.power_set - self.p_min).max(0.0)
    }

    fn governor_child(&self, ctx: &EvalCtx) -> Option<ComponentId> {
        child_matching(ctx, ctx.id, |k| matches!(k, ComponentKind::Governor(_)))
    }

    fn exciter_child(&self, ctx: &EvalCtx) -> Option<ComponentId> {
        child_matching(ctx, ctx.id, |k| matches!(k, ComponentKind::Exciter(_)))
    }

    /// Live mechanical power: governor state when attached, cached value
    /// otherwise.
    pub fn mech_power_live(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> f64 {
        self.governor_child(ctx)
            .and_then(|gov| diff_state_of(ctx, gov, sd, mode, 0))
            .unwrap_or(self.mech_power)
    }

    /// Live field voltage: exciter state when attached.
    pub fn field_voltage_live(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> f64 {
        self.exciter_child(ctx)
            .and_then(|exc| diff_state_of(ctx, exc, sd, mode, 0))
            .unwrap_or(self.field_voltage)
    }

    /// Own delta/omega read live, following partitioned pairing.
    fn machine_state(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> (f64, f64) {
        let delta = diff_state_of(ctx, ctx.id, sd, mode, 0).unwrap_or(self.delta);
        let omega = diff_state_of(ctx, ctx.id, sd, mode, 1).unwrap_or(self.omega);
        (delta, omega)
    }

    /// Electrical injection and partials at terminal conditions `(v, theta)`.
    pub fn electrical_terms(
        &self,
        ctx: &EvalCtx,
        sd: &StateData,
        mode: &SolverMode,
        v: f64,
        theta: f64,
    ) -> ElecTerms {
        let (delta, _) = self.machine_state(ctx, sd, mode);
        // the exciter state scales the initialization EMF
        let e_scale = self.emf / self.field_voltage.max(1e-9);
        let e = self.field_voltage_live(ctx, sd, mode) * e_scale;
        let x = self.xdp;
        let (sin_d, cos_d) = (delta - theta).sin_cos();

        let p = e * v / x * sin_d;
        let q = (e * v * cos_d - v * v) / x;

        let delta_col = if mode.has_differential() {
            ctx.base()
                .offsets
                .get(mode)
                .and_then(|so| so.diff_offset)
        } else {
            None
        };
        let efd_col = if mode.has_differential() {
            self.exciter_child(ctx).and_then(|exc| {
                ctx.get(exc)
                    .and_then(|c| c.base.offsets.get(mode))
                    .and_then(|so| so.diff_offset)
            })
        } else {
            None
        };

        ElecTerms {
            p,
            q,
            dp_ddelta: e * v / x * cos_d,
            dp_dv: e / x * sin_d,
            dp_dtheta: -e * v / x * cos_d,
            dp_de: e_scale * v / x * sin_d,
            dq_ddelta: -e * v / x * sin_d,
            dq_dv: (e * cos_d - 2.0 * v) / x,
            dq_dtheta: e * v / x * sin_d,
            dq_de: e_scale * v / x * cos_d,
            delta_col,
            efd_col,
        }
    }

    /// Terminal voltage and angle of the parent bus, live.
    fn terminal_va(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> (f64, f64) {
        match ctx.base().parent {
            Some(bus) => crate::models::bus_va(ctx, bus, sd, mode),
            None => (self.bus_voltage, self.bus_angle),
        }
    }

    /// Swing-equation right-hand sides at the live state.
    fn swing_rhs(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode, omega0: f64) -> (f64, f64) {
        let (delta, omega) = self.machine_state(ctx, sd, mode);
        let (v, theta) = self.terminal_va(ctx, sd, mode);
        let e_scale = self.emf / self.field_voltage.max(1e-9);
        let e = self.field_voltage_live(ctx, sd, mode) * e_scale;
        let pe = e * v / self.xdp * (delta - theta).sin();
        let pm = self.mech_power_live(ctx, sd, mode);
        let ddelta = omega0 * (omega - 1.0);
        let domega = (pm - pe - self.d * (omega - 1.0)) / (2.0 * self.h);
        (ddelta, domega)
    }
}

impl GridModel for Generator {
    fn type_name(&self) -> &'static str {
        "generator"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, mode: &SolverMode) -> StateSizes {
        if !self.has_machine_states() {
            return StateSizes::default();
        }
        if mode.is_local() || (mode.is_dynamic() && mode.has_differential()) {
            StateSizes {
                diff: 2,
                ..Default::default()
            }
        } else {
            StateSizes::default()
        }
    }

    fn local_jacobian_count(&self, _base: &ComponentBase, mode: &SolverMode) -> usize {
        if self.has_machine_states() && mode.is_dynamic() && mode.has_differential() {
            12
        } else {
            0
        }
    }

    fn dyn_init_a(&mut self, base: &mut ComponentBase, _time0: f64, _flags: u32) {
        if self.has_machine_states() {
            base.flags.set(OpFlag::HasDifferentialStates, true);
        }
    }

    fn dyn_init_b(&mut self, _base: &mut ComponentBase, inputs: &[f64]) {
        if !self.has_machine_states() {
            return;
        }
        // inputs: terminal [V, theta] from the parent bus
        let v = inputs.first().copied().unwrap_or(self.bus_voltage);
        let theta = inputs.get(1).copied().unwrap_or(self.bus_angle);
        self.bus_voltage = v;
        self.bus_angle = theta;

        // internal EMF from the power-flow operating point:
        // E = V + jX' * I, I = conj(S / V)
        let vc = num_complex::Complex64::from_polar(v, theta);
        let s = num_complex::Complex64::new(self.power_set, self.q_set);
        let i = (s / vc).conj();
        let e = vc + num_complex::Complex64::new(0.0, self.xdp) * i;
        self.delta = e.arg();
        self.emf = e.norm();
        self.omega = 1.0;
        self.mech_power = self.power_set;
        self.field_voltage = self.emf;
    }

    fn guess_state(
        &self,
        ctx: &EvalCtx,
        _time: f64,
        state: &mut [f64],
        dstate: &mut [f64],
        mode: &SolverMode,
    ) {
        if !mode.has_differential() {
            return;
        }
        let Some(off) = ctx.base().offsets.get(mode).and_then(|so| so.diff_offset) else {
            return;
        };
        if off + 1 >= state.len() {
            return;
        }
        state[off] = self.delta;
        state[off + 1] = self.omega;
        if off + 1 < dstate.len() {
            dstate[off] = 0.0;
            dstate[off + 1] = 0.0;
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
        if !mode.has_differential() {
            return;
        }
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return;
        };
        if let Some(&d) = state.get(off) {
            self.delta = d;
        }
        if let Some(&w) = state.get(off + 1) {
            self.omega = w;
        }
        let alg_total = base.offsets.local().total.algebraic_total();
        if base.local_state.len() > alg_total + 1 {
            base.local_state[alg_total] = self.delta;
            base.local_state[alg_total + 1] = self.omega;
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
        if !mode.has_differential() || !self.has_machine_states() {
            return Ok(());
        }
        let base = ctx.base();
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return Ok(());
        };
        let loc = base.locations(sd, mode)?;
        let (ddelta, domega) = self.swing_rhs(ctx, sd, mode, base.omega0());
        let dstate0 = loc.dstate.first().copied().unwrap_or(0.0);
        let dstate1 = loc.dstate.get(1).copied().unwrap_or(0.0);
        resid[off] = ddelta - dstate0;
        resid[off + 1] = domega - dstate1;
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
        if !mode.has_differential() || !self.has_machine_states() {
            return Ok(());
        }
        let base = ctx.base();
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return Ok(());
        };
        let (ddelta, domega) = self.swing_rhs(ctx, sd, mode, base.omega0());
        deriv[off] = ddelta;
        deriv[off + 1] = domega;
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
        if !mode.has_differential() || !self.has_machine_states() {
            return;
        }
        let base = ctx.base();
        let Some(off) = base.offsets.get(mode).and_then(|so| so.diff_offset) else {
            return;
        };
        let cj = sd.cj;
        let (v, theta) = self.terminal_va(ctx, sd, mode);
        let elec = self.electrical_terms(ctx, sd, mode, v, theta);
        let two_h = 2.0 * self.h;

        // d(delta)/dt row: omega0*(omega - 1) - delta'
        md.assign(off, off, -cj);
        md.assign(off, off + 1, base.omega0());

        // d(omega)/dt row: (Pm - Pe - D(omega-1))/(2H) - omega'
        md.assign(off + 1, off, -elec.dp_ddelta / two_h);
        md.assign(off + 1, off + 1, -self.d / two_h - cj);

        // coupling to the terminal bus states when they are live
        if let Some(bus) = base.parent {
            if mode.has_algebraic() {
                if let Some(bus_so) = ctx.get(bus).and_then(|c| c.base.offsets.get(mode)) {
                    if let Some(v_col) = bus_so.v_offset {
                        md.assign(off + 1, v_col, -elec.dp_dv / two_h);
                    }
                    if let Some(a_col) = bus_so.a_offset {
                        md.assign(off + 1, a_col, -elec.dp_dtheta / two_h);
                    }
                }
            }
        }

        // coupling to the governor state
        if let Some(gov) = self.governor_child(ctx) {
            if let Some(pm_col) = ctx
                .get(gov)
                .and_then(|c| c.base.offsets.get(mode))
                .and_then(|so| so.diff_offset)
            {
                md.assign(off + 1, pm_col, 1.0 / two_h);
            }
        }
        // coupling to the exciter state
        if let Some(efd_col) = elec.efd_col {
            md.assign(off + 1, efd_col, -elec.dp_de / two_h);
        }
    }

    /// Partials of the electrical outputs `[P, Q]` against the machine's
    /// live state columns; rows are output indices.
    fn output_partial_derivatives(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        md: &mut dyn MatrixData,
        mode: &SolverMode,
    ) {
        if !self.has_machine_states() || !mode.is_dynamic() {
            return;
        }
        let (v, theta) = self.terminal_va(ctx, sd, mode);
        let elec = self.electrical_terms(ctx, sd, mode, v, theta);
        if let Some(col) = elec.delta_col {
            md.assign(0, col, elec.dp_ddelta);
            md.assign(1, col, elec.dq_ddelta);
        }
        if let Some(col) = elec.efd_col {
            md.assign(0, col, elec.dp_de);
            md.assign(1, col, elec.dq_de);
        }
    }

    /// Partials of the outputs against the terminal inputs `[V, theta]`.
    fn io_partial_derivatives(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        md: &mut dyn MatrixData,
        input_locs: &[usize],
        mode: &SolverMode,
    ) {
        if !self.has_machine_states() || !mode.is_dynamic() {
            return;
        }
        let (v, theta) = self.terminal_va(ctx, sd, mode);
        let elec = self.electrical_terms(ctx, sd, mode, v, theta);
        if let Some(&v_loc) = input_locs.first() {
            md.assign(0, v_loc, elec.dp_dv);
            md.assign(1, v_loc, elec.dq_dv);
        }
        if let Some(&a_loc) = input_locs.get(1) {
            md.assign(0, a_loc, elec.dp_dtheta);
            md.assign(1, a_loc, elec.dq_dtheta);
        }
    }

    fn outputs(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        mode: &SolverMode,
    ) -> Vec<f64> {
        if mode.is_dynamic() && self.has_machine_states() {
            let (v, theta) = self.terminal_va(ctx, sd, mode);
            let elec = self.electrical_terms(ctx, sd, mode, v, theta);
            vec![elec.p, elec.q]
        } else {
            vec![self.power_set, self.q_set]
        }
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        match index {
            0 => self.power_set,
            1 => self.q_set,
            2 => self.delta,
            3 => self.omega,
            _ => 0.0,
        }
    }

    fn power_flow_adjust(
        &self,
        ctx: &EvalCtx,
        _flags: u32,
        level: CheckLevel,
    ) -> (ChangeCode, Vec<GridAction>) {
        if level != CheckLevel::FullCheck {
            return (ChangeCode::NoChange, Vec::new());
        }
        // clamp a setpoint that drifted past the capability limits
        if self.power_set > self.p_max {
            return (
                ChangeCode::ParameterChange,
                vec![GridAction::SetParam {
                    target: ctx.id,
                    name: "p".into(),
                    value: self.p_max,
                }],
            );
        }
        if self.power_set < self.p_min {
            return (
                ChangeCode::ParameterChange,
                vec![GridAction::SetParam {
                    target: ctx.id,
                    name: "p".into(),
                    value: self.p_min,
                }],
            );
        }
        (ChangeCode::NoChange, Vec::new())
    }

    fn set_param(
        &mut self,
        base: &mut ComponentBase,
        name: &str,
        value: f64,
        unit: Unit,
    ) -> ParamResult {
        let bases = base.unit_bases();
        let value_pu = crate::units::to_internal(value, unit, &bases);
        match name {
            "p" | "power" | "pset" => self.power_set = value_pu,
            "q" | "qset" => self.q_set = value_pu,
            "pmin" => self.p_min = value_pu,
            "pmax" => self.p_max = value_pu,
            "qmin" => self.q_min = value_pu,
            "qmax" => self.q_max = value_pu,
            "participation" => self.participation = value,
            "h" | "inertia" => {
                if value < 0.0 {
                    return ParamResult::Invalid;
                }
                self.h = value;
            }
            "d" | "damping" => self.d = value,
            "xdp" | "xd'" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.xdp = value;
            }
            "pm" | "mechpower" => self.mech_power = value_pu,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn get_param(&self, base: &ComponentBase, name: &str, unit: Unit) -> Option<f64> {
        let bases = base.unit_bases();
        let raw = match name {
            "p" | "power" | "pset" => self.power_set,
            "q" | "qset" => self.q_set,
            "pmin" => self.p_min,
            "pmax" => self.p_max,
            "qmin" => self.q_min,
            "qmax" => self.q_max,
            "participation" => return Some(self.participation),
            "h" | "inertia" => return Some(self.h),
            "d" | "damping" => return Some(self.d),
            "xdp" => return Some(self.xdp),
            "delta" => return Some(self.delta),
            "omega" | "speed" => return Some(self.omega),
            "pm" | "mechpower" => self.mech_power,
            _ => return None,
        };
        Some(crate::units::from_internal(raw, unit, &bases))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_state_gate() {
        let mut gen = Generator::default();
        assert!(!gen.has_machine_states());
        gen.h = 3.0;
        assert!(gen.has_machine_states());
    }

    #[test]
    fn test_state_sizes() {
        let gen = Generator {
            h: 3.0,
            ..Default::default()
        };
        let base = ComponentBase::new("g");
        let dae = gen.local_state_sizes(&base, &crate::solver_mode::DAE_MODE);
        assert_eq!(dae.diff, 2);
        let pf = gen.local_state_sizes(&base, &crate::solver_mode::POWER_FLOW_MODE);
        assert_eq!(pf.total(), 0);
        let dyn_alg = gen.local_state_sizes(&base, &crate::solver_mode::DYN_ALGEBRAIC_MODE);
        assert_eq!(dyn_alg.total(), 0);
    }

    #[test]
    fn test_dyn_init_b_consistency() {
        // initialization must reproduce the scheduled electrical power
        let mut gen = Generator {
            h: 4.0,
            xdp: 0.3,
            power_set: 0.8,
            q_set: 0.2,
            ..Default::default()
        };
        let mut base = ComponentBase::new("g");
        gen.dyn_init_b(&mut base, &[1.02, 0.05]);
        let pe = gen.emf * 1.02 / gen.xdp * (gen.delta - 0.05).sin();
        assert!((pe - 0.8).abs() < 1e-9);
        assert!((gen.omega - 1.0).abs() < 1e-12);
        assert!((gen.mech_power - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_output_partials_follow_state_columns() {
        use crate::arena::ComponentArena;
        use crate::component::{Component, OffsetOrdering};
        use crate::matrix::TripletMatrix;
        use crate::models::{Area, Bus};
        use crate::solver_mode::DAE_MODE;

        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("grid", ComponentKind::Area(Area::default())));
        let bus = arena
            .add_sub_object(root, Component::new("bus1", ComponentKind::Bus(Bus::default())))
            .unwrap();
        let gen = arena
            .add_sub_object(
                bus,
                Component::new(
                    "gen1",
                    ComponentKind::Generator(Generator {
                        h: 3.0,
                        xdp: 0.25,
                        power_set: 0.4,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        arena.pflow_init_a(root, 0.0, 0);
        arena.dyn_init_a(root, 0.0, 0);
        arena.load_sizes(root, &DAE_MODE);
        arena.assign_offsets(root, 0, &DAE_MODE, OffsetOrdering::Mixed);

        let n = arena.state_size(root, &DAE_MODE);
        let mut state = vec![0.0; n];
        let mut dstate = vec![0.0; n];
        arena.guess_state(root, 0.0, &mut state, &mut dstate, &DAE_MODE);
        let sd = crate::state_data::StateData::new(0.0, &state, Some(&dstate), 1);

        let ctx = EvalCtx::new(&arena, gen);
        let comp = arena.expect(gen);
        let mut sink = TripletMatrix::new(2, n);
        comp.kind
            .model()
            .output_partial_derivatives(&ctx, &[], &sd, &mut sink, &DAE_MODE);
        let delta_col = comp
            .base
            .offsets
            .get(&DAE_MODE)
            .unwrap()
            .diff_offset
            .unwrap();
        assert!(sink
            .entries()
            .iter()
            .any(|&(r, c, _)| r == 0 && c == delta_col));
    }

    #[test]
    fn test_capacity_helpers() {
        let gen = Generator {
            power_set: 0.5,
            p_min: 0.1,
            p_max: 1.2,
            ..Default::default()
        };
        assert!((gen.up_capacity() - 0.7).abs() < 1e-12);
        assert!((gen.down_capacity() - 0.4).abs() < 1e-12);

        let unbounded = Generator {
            power_set: 0.5,
            participation: 0.5,
            ..Default::default()
        };
        assert!((unbounded.up_capacity() - 0.75).abs() < 1e-12);
    }
}
