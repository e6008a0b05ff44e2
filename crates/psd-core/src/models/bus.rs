//! Bus model: voltage and angle states plus the nodal balance equations.
//!
//! Every network-solving mode gives a bus one voltage and one angle state
//! (angle only under DC). The residual rows live at the bus's voltage and
//! angle offsets: the angle row carries the real-power balance, the voltage
//! row the reactive balance, with identity equations substituted per bus
//! type (slack fixes both, PV fixes voltage, afix fixes angle).

use crate::change::{ChangeCode, CheckLevel, ParamResult, VOLTAGE_CONTROL_CHANGE};
use crate::component::{ComponentKind, EvalCtx, GridAction, GridModel};
use crate::error::{PsdError, PsdResult};
use crate::matrix::MatrixData;
use crate::object::{ComponentBase, ComponentId};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;

/// Bus classification for network solves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusType {
    /// V and theta fixed; absorbs residual mismatch
    Slack,
    /// P and V specified
    Pv,
    /// P and Q specified
    #[default]
    Pq,
    /// Angle fixed, reactive balance kept
    Afix,
}

/// Accumulated child injections at a bus with the partials the Jacobian
/// needs.
#[derive(Debug, Default)]
struct Injections {
    p: f64,
    q: f64,
    dp_dv: f64,
    dq_dv: f64,
    dp_da: f64,
    dq_da: f64,
    /// extra columns (state index, dP/dx, dQ/dx) from dynamic machines
    extra: Vec<(usize, f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct Bus {
    pub bus_type: BusType,
    /// Solved voltage magnitude (per-unit)
    pub voltage: f64,
    /// Solved voltage angle (radians)
    pub angle: f64,
    /// Voltage setpoint for slack/PV operation
    pub v_set: f64,
    /// Angle setpoint for slack/afix operation
    pub angle_set: f64,
    pub vmin: Option<f64>,
    pub vmax: Option<f64>,
    /// Disconnect the bus when solved voltage falls below this (0 disables)
    pub low_v_disconnect: f64,
    /// Reactive injection pinned by a PV-to-PQ limit switch
    pub fixed_q: Option<f64>,
    /// Links terminating at this bus, maintained by the network pass
    pub attached_links: Vec<ComponentId>,
    /// Participation factor for slack redistribution
    pub participation: f64,
}

impl Default for Bus {
    fn default() -> Self {
        Bus {
            bus_type: BusType::Pq,
            voltage: 1.0,
            angle: 0.0,
            v_set: 1.0,
            angle_set: 0.0,
            vmin: None,
            vmax: None,
            low_v_disconnect: 0.0,
            fixed_q: None,
            attached_links: Vec::new(),
            participation: 1.0,
        }
    }
}

impl Bus {
    /// The bus type in effect, accounting for a PV limit switch.
    pub fn effective_type(&self) -> BusType {
        if self.bus_type == BusType::Pv && self.fixed_q.is_some() {
            BusType::Pq
        } else {
            self.bus_type
        }
    }

    /// Own voltage and angle read from the snapshot at this bus's offsets,
    /// falling back to the caches.
    fn own_va(&self, base: &ComponentBase, sd: &StateData, mode: &SolverMode) -> (f64, f64) {
        if sd.is_empty() || mode.is_local() {
            return (self.voltage, self.angle);
        }
        let Some(state) = sd.state else {
            return (self.voltage, self.angle);
        };
        let so = base.offsets.get(mode);
        let v = so
            .and_then(|s| s.v_offset)
            .and_then(|off| state.get(off).copied())
            .unwrap_or(self.voltage);
        let a = so
            .and_then(|s| s.a_offset)
            .and_then(|off| state.get(off).copied())
            .unwrap_or(self.angle);
        (v, a)
    }

    /// Sum generator and load injections from the bus's children.
    fn injections(
        &self,
        ctx: &EvalCtx,
        sd: &StateData,
        mode: &SolverMode,
        v: f64,
        theta: f64,
    ) -> Injections {
        let mut acc = Injections::default();
        for child in ctx.arena.children(ctx.id) {
            let Some(comp) = ctx.get(child) else { continue };
            if !comp.base.is_connected() {
                continue;
            }
            match &comp.kind {
                ComponentKind::Generator(gen) => {
                    if mode.is_dynamic() && gen.has_machine_states() {
                        let elec = gen.electrical_terms(&ctx.for_id(child), sd, mode, v, theta);
                        acc.p += elec.p;
                        acc.q += elec.q;
                        acc.dp_dv += elec.dp_dv;
                        acc.dq_dv += elec.dq_dv;
                        acc.dp_da += elec.dp_dtheta;
                        acc.dq_da += elec.dq_dtheta;
                        if let Some(col) = elec.delta_col {
                            acc.extra.push((col, elec.dp_ddelta, elec.dq_ddelta));
                        }
                        if let Some(col) = elec.efd_col {
                            acc.extra.push((col, elec.dp_de, elec.dq_de));
                        }
                    } else {
                        acc.p += gen.power_set;
                        acc.q += gen.q_set;
                    }
                }
                ComponentKind::Load(load) => {
                    let terms = load.injection_terms(&ctx.for_id(child), sd.time, v);
                    acc.p -= terms.p;
                    acc.q -= terms.q;
                    acc.dp_dv -= terms.dp_dv;
                    acc.dq_dv -= terms.dq_dv;
                }
                _ => {}
            }
        }
        acc
    }

    /// Real/reactive balance and the identity of the rows to write.
    fn balance(
        &self,
        ctx: &EvalCtx,
        sd: &StateData,
        mode: &SolverMode,
        v: f64,
        theta: f64,
    ) -> (f64, f64, Injections) {
        let inj = self.injections(ctx, sd, mode, v, theta);
        let mut p_bal = inj.p;
        let mut q_bal = inj.q;
        if let Some(q_fixed) = self.fixed_q {
            if self.bus_type == BusType::Pv {
                q_bal += q_fixed;
            }
        }
        for &link_id in &self.attached_links {
            let Some(comp) = ctx.get(link_id) else { continue };
            if !comp.base.is_connected() {
                continue;
            }
            if let ComponentKind::Link(link) = &comp.kind {
                if let Some((flow, _)) = link.flow_out_of(ctx, ctx.id, sd, mode) {
                    p_bal -= flow.p;
                    q_bal -= flow.q;
                }
            }
        }
        (p_bal, q_bal, inj)
    }
}

impl GridModel for Bus {
    fn type_name(&self) -> &'static str {
        "bus"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, mode: &SolverMode) -> StateSizes {
        if mode.is_local() {
            return StateSizes {
                v: 1,
                a: 1,
                ..Default::default()
            };
        }
        if !mode.has_algebraic() {
            return StateSizes::default();
        }
        if mode.is_dc() {
            StateSizes {
                a: 1,
                ..Default::default()
            }
        } else {
            StateSizes {
                v: 1,
                a: 1,
                ..Default::default()
            }
        }
    }

    fn local_jacobian_count(&self, base: &ComponentBase, _mode: &SolverMode) -> usize {
        let links = self.attached_links.len();
        let children = base.children.len();
        2 * (2 + 2 * links) + 6 * children + 4
    }

    fn pflow_init_b(&mut self, base: &mut ComponentBase, _inputs: &[f64]) {
        match self.bus_type {
            BusType::Slack => {
                self.voltage = self.v_set;
                self.angle = self.angle_set;
            }
            BusType::Pv => self.voltage = self.v_set,
            BusType::Afix => self.angle = self.angle_set,
            BusType::Pq => {}
        }
        if base.local_state.len() >= 2 {
            base.local_state[0] = self.voltage;
            base.local_state[1] = self.angle;
        }
    }

    fn guess_state(
        &self,
        ctx: &EvalCtx,
        _time: f64,
        state: &mut [f64],
        _dstate: &mut [f64],
        mode: &SolverMode,
    ) {
        let so = ctx.base().offsets.get(mode);
        if let Some(off) = so.and_then(|s| s.v_offset) {
            state[off] = self.voltage;
        }
        if let Some(off) = so.and_then(|s| s.a_offset) {
            state[off] = self.angle;
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
        let so = base.offsets.get(mode);
        if let Some(off) = so.and_then(|s| s.v_offset) {
            if let Some(&v) = state.get(off) {
                self.voltage = v;
            }
        }
        if let Some(off) = so.and_then(|s| s.a_offset) {
            if let Some(&a) = state.get(off) {
                self.angle = a;
            }
        }
        if base.local_state.len() >= 2 {
            base.local_state[0] = self.voltage;
            base.local_state[1] = self.angle;
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
        if !mode.has_algebraic() {
            return Ok(());
        }
        let base = ctx.base();
        let so = base
            .offsets
            .get(mode)
            .ok_or_else(|| PsdError::Object("bus offsets not loaded".into()))?;
        let (v, theta) = self.own_va(base, sd, mode);
        if v < 0.0 {
            return Err(PsdError::FunctionExecutionFailure(
                crate::change::SOLVER_INVALID_STATE_ERROR,
            ));
        }
        let (p_bal, q_bal, _) = self.balance(ctx, sd, mode, v, theta);

        let a_row = so.a_offset;
        let v_row = so.v_offset;
        match self.effective_type() {
            BusType::Slack => {
                if let Some(row) = a_row {
                    resid[row] = theta - self.angle_set;
                }
                if let Some(row) = v_row {
                    resid[row] = v - self.v_set;
                }
            }
            BusType::Pv => {
                if let Some(row) = a_row {
                    resid[row] = p_bal;
                }
                if let Some(row) = v_row {
                    resid[row] = v - self.v_set;
                }
            }
            BusType::Pq => {
                if let Some(row) = a_row {
                    resid[row] = p_bal;
                }
                if let Some(row) = v_row {
                    resid[row] = q_bal;
                }
            }
            BusType::Afix => {
                if let Some(row) = a_row {
                    resid[row] = theta - self.angle_set;
                }
                if let Some(row) = v_row {
                    resid[row] = q_bal;
                }
            }
        }
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
        if !mode.has_algebraic() {
            return;
        }
        let base = ctx.base();
        let Some(so) = base.offsets.get(mode) else { return };
        let (v, theta) = self.own_va(base, sd, mode);
        let a_col = so.a_offset;
        let v_col = so.v_offset;

        let etype = self.effective_type();
        // identity rows first
        if matches!(etype, BusType::Slack | BusType::Afix) {
            if let Some(row) = a_col {
                md.assign(row, row, 1.0);
            }
        }
        if matches!(etype, BusType::Slack | BusType::Pv) {
            if let Some(row) = v_col {
                md.assign(row, row, 1.0);
            }
        }

        let p_row = match etype {
            BusType::Pv | BusType::Pq => a_col,
            _ => None,
        };
        let q_row = match etype {
            BusType::Pq | BusType::Afix => v_col,
            _ => None,
        };
        if p_row.is_none() && q_row.is_none() {
            return;
        }

        // child injections (loads, dynamic machines)
        let inj = self.injections(ctx, sd, mode, v, theta);
        if let Some(row) = p_row {
            if let Some(col) = v_col {
                md.assign(row, col, inj.dp_dv);
            }
            if let Some(col) = a_col {
                md.assign(row, col, inj.dp_da);
            }
            for &(col, dp, _) in &inj.extra {
                md.assign(row, col, dp);
            }
        }
        if let Some(row) = q_row {
            if let Some(col) = v_col {
                md.assign(row, col, inj.dq_dv);
            }
            if let Some(col) = a_col {
                md.assign(row, col, inj.dq_da);
            }
            for &(col, _, dq) in &inj.extra {
                md.assign(row, col, dq);
            }
        }

        // link flow terms (subtracted from the balance)
        for &link_id in &self.attached_links {
            let Some(comp) = ctx.get(link_id) else { continue };
            if !comp.base.is_connected() {
                continue;
            }
            let ComponentKind::Link(link) = &comp.kind else {
                continue;
            };
            let Some((side, other)) = link.other_terminal(ctx.id) else {
                continue;
            };
            let Some(other_comp) = ctx.get(other) else { continue };
            if !other_comp.base.is_connected() {
                continue;
            }
            let other_so = other_comp.base.offsets.get(mode);
            let other_v_col = other_so.and_then(|s| s.v_offset);
            let other_a_col = other_so.and_then(|s| s.a_offset);

            if mode.is_dc() {
                let (_, a_o) = crate::models::bus_va(ctx, other, sd, mode);
                let (_, dp_da) = link.dc_flow(side, theta, a_o);
                if let Some(row) = p_row {
                    if let Some(col) = a_col {
                        md.assign(row, col, -dp_da);
                    }
                    if let Some(col) = other_a_col {
                        md.assign(row, col, dp_da);
                    }
                }
                continue;
            }

            let (v_o, a_o) = crate::models::bus_va(ctx, other, sd, mode);
            let flow = link.flow(side, v, theta, v_o, a_o);
            if let Some(row) = p_row {
                if let Some(col) = v_col {
                    md.assign(row, col, -flow.dp_dv_own);
                }
                if let Some(col) = a_col {
                    md.assign(row, col, -flow.dp_da_own);
                }
                if let Some(col) = other_v_col {
                    md.assign(row, col, -flow.dp_dv_other);
                }
                if let Some(col) = other_a_col {
                    md.assign(row, col, flow.dp_da_own);
                }
            }
            if let Some(row) = q_row {
                if let Some(col) = v_col {
                    md.assign(row, col, -flow.dq_dv_own);
                }
                if let Some(col) = a_col {
                    md.assign(row, col, -flow.dq_da_own);
                }
                if let Some(col) = other_v_col {
                    md.assign(row, col, -flow.dq_dv_other);
                }
                if let Some(col) = other_a_col {
                    md.assign(row, col, flow.dq_da_own);
                }
            }
        }
    }

    fn algebraic_update(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        update: &mut [f64],
        mode: &SolverMode,
        alpha: f64,
    ) {
        if !mode.has_algebraic() {
            return;
        }
        let base = ctx.base();
        let Some(so) = base.offsets.get(mode) else { return };
        let (v, theta) = self.own_va(base, sd, mode);
        let etype = self.effective_type();

        // susceptance scale for the relaxation step
        let mut b_sum = 0.0;
        for &link_id in &self.attached_links {
            if let Some(ComponentKind::Link(link)) = ctx.get(link_id).map(|c| &c.kind) {
                b_sum += link.admittances().0.im.abs();
            }
        }
        let b_sum = b_sum.max(1e-6);
        let (p_bal, q_bal, _) = self.balance(ctx, sd, mode, v, theta);

        if let Some(row) = so.v_offset {
            update[row] = match etype {
                BusType::Slack | BusType::Pv => self.v_set,
                _ => v + alpha * q_bal / (b_sum * v.max(0.1)),
            };
        }
        if let Some(row) = so.a_offset {
            update[row] = match etype {
                BusType::Slack | BusType::Afix => self.angle_set,
                _ => theta + alpha * p_bal / (b_sum * (v * v).max(0.01)),
            };
        }
    }

    fn outputs(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        mode: &SolverMode,
    ) -> Vec<f64> {
        // power delivered into the network over the attached links
        let mut p = 0.0;
        let mut q = 0.0;
        for &link_id in &self.attached_links {
            let Some(comp) = ctx.get(link_id) else { continue };
            if !comp.base.is_connected() {
                continue;
            }
            if let ComponentKind::Link(link) = &comp.kind {
                if let Some((flow, _)) = link.flow_out_of(ctx, ctx.id, sd, mode) {
                    p += flow.p;
                    q += flow.q;
                }
            }
        }
        vec![p, q]
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        match index {
            0 => self.voltage,
            1 => self.angle,
            _ => 0.0,
        }
    }

    fn power_flow_adjust(
        &self,
        ctx: &EvalCtx,
        _flags: u32,
        level: CheckLevel,
    ) -> (ChangeCode, Vec<GridAction>) {
        match level {
            CheckLevel::LowVoltageCheck => {
                if self.low_v_disconnect > 0.0 && self.voltage < self.low_v_disconnect {
                    return (
                        ChangeCode::ObjectChange,
                        vec![GridAction::Disconnect(ctx.id)],
                    );
                }
                (ChangeCode::NoChange, Vec::new())
            }
            CheckLevel::ReversableOnly | CheckLevel::FullCheck => {
                if self.bus_type != BusType::Pv {
                    return (ChangeCode::NoChange, Vec::new());
                }
                // reactive requirement to hold the setpoint: local loads plus
                // link outflows at the solved state
                let sd = StateData::empty();
                let mode = crate::solver_mode::LOCAL_MODE;
                let (_, q_bal, _) = self.balance(ctx, &sd, &mode, self.voltage, self.angle);
                // q_bal excludes the PV reactive support; requirement is -q_bal
                let q_required = -q_bal;
                let (q_min, q_max) = self.gen_q_limits(ctx);
                if self.fixed_q.is_none() {
                    if q_required > q_max {
                        return (
                            ChangeCode::JacobianChange,
                            vec![
                                GridAction::SetBusType {
                                    target: ctx.id,
                                    bus_type: BusType::Pv,
                                    fixed_q: Some(q_max),
                                },
                                GridAction::Alert {
                                    source: ctx.id,
                                    code: VOLTAGE_CONTROL_CHANGE,
                                },
                            ],
                        );
                    }
                    if q_required < q_min {
                        return (
                            ChangeCode::JacobianChange,
                            vec![GridAction::SetBusType {
                                target: ctx.id,
                                bus_type: BusType::Pv,
                                fixed_q: Some(q_min),
                            }],
                        );
                    }
                } else if level == CheckLevel::ReversableOnly {
                    // release the limit when the voltage has recovered past
                    // the setpoint in the limiting direction
                    let fixed = self.fixed_q.unwrap();
                    let release = (fixed >= q_max && self.voltage > self.v_set)
                        || (fixed <= q_min && self.voltage < self.v_set);
                    if release {
                        return (
                            ChangeCode::JacobianChange,
                            vec![GridAction::SetBusType {
                                target: ctx.id,
                                bus_type: BusType::Pv,
                                fixed_q: None,
                            }],
                        );
                    }
                }
                (ChangeCode::NoChange, Vec::new())
            }
            _ => (ChangeCode::NoChange, Vec::new()),
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
            "voltage" | "v" => {
                if value < 0.0 {
                    return ParamResult::Invalid;
                }
                self.voltage = value;
            }
            "angle" | "theta" => self.angle = value,
            "vset" | "vtarget" => {
                if value <= 0.0 {
                    return ParamResult::Invalid;
                }
                self.v_set = value;
            }
            "angleset" | "atarget" => self.angle_set = value,
            "vmin" => self.vmin = (value > 0.0).then_some(value),
            "vmax" => self.vmax = (value > 0.0).then_some(value),
            "lowvdisconnect" => self.low_v_disconnect = value,
            "participation" => self.participation = value,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn set_param_str(&mut self, _base: &mut ComponentBase, name: &str, value: &str) -> ParamResult {
        if name != "type" && name != "bustype" {
            return ParamResult::NotRecognized;
        }
        self.bus_type = match value.to_ascii_lowercase().as_str() {
            "slack" | "slk" | "swing" => BusType::Slack,
            "pv" => BusType::Pv,
            "pq" | "load" => BusType::Pq,
            "afix" => BusType::Afix,
            _ => return ParamResult::Invalid,
        };
        ParamResult::Recognized
    }

    fn get_param(&self, base: &ComponentBase, name: &str, unit: Unit) -> Option<f64> {
        let bases = base.unit_bases();
        let raw = match name {
            "voltage" | "v" => self.voltage,
            "angle" | "theta" => self.angle,
            "vset" | "vtarget" => self.v_set,
            "angleset" | "atarget" => self.angle_set,
            "lowvdisconnect" => self.low_v_disconnect,
            "participation" => self.participation,
            _ => return None,
        };
        Some(crate::units::from_internal(raw, unit, &bases))
    }

    fn get_string(&self, _base: &ComponentBase, name: &str) -> Option<String> {
        if name == "bustype" {
            let t = match self.bus_type {
                BusType::Slack => "slack",
                BusType::Pv => "pv",
                BusType::Pq => "pq",
                BusType::Afix => "afix",
            };
            return Some(t.to_string());
        }
        None
    }
}

impl Bus {
    /// Combined reactive limits of the attached generators.
    fn gen_q_limits(&self, ctx: &EvalCtx) -> (f64, f64) {
        let mut q_min = 0.0;
        let mut q_max = 0.0;
        for child in ctx.arena.children(ctx.id) {
            if let Some(ComponentKind::Generator(gen)) = ctx.get(child).map(|c| &c.kind) {
                q_min += gen.q_min;
                q_max += gen.q_max;
            }
        }
        if q_max == 0.0 && q_min == 0.0 {
            (f64::NEG_INFINITY, f64::INFINITY)
        } else {
            (q_min, q_max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver_mode::{DAE_MODE, POWER_FLOW_MODE};

    #[test]
    fn test_state_sizes_by_mode() {
        let bus = Bus::default();
        let base = ComponentBase::new("b");
        let pf = bus.local_state_sizes(&base, &POWER_FLOW_MODE);
        assert_eq!((pf.v, pf.a), (1, 1));

        let mut dc = POWER_FLOW_MODE;
        dc.set_approx(crate::solver_mode::approx::DC, true);
        let dc_sizes = bus.local_state_sizes(&base, &dc);
        assert_eq!((dc_sizes.v, dc_sizes.a), (0, 1));

        let dae = bus.local_state_sizes(&base, &DAE_MODE);
        assert_eq!((dae.v, dae.a), (1, 1));

        let diff = bus.local_state_sizes(&base, &crate::solver_mode::DYN_DIFFERENTIAL_MODE);
        assert_eq!(diff.total(), 0);
    }

    #[test]
    fn test_effective_type_switch() {
        let mut bus = Bus {
            bus_type: BusType::Pv,
            ..Default::default()
        };
        assert_eq!(bus.effective_type(), BusType::Pv);
        bus.fixed_q = Some(0.5);
        assert_eq!(bus.effective_type(), BusType::Pq);
    }

    #[test]
    fn test_init_b_applies_setpoints() {
        let mut bus = Bus {
            bus_type: BusType::Slack,
            v_set: 1.02,
            angle_set: 0.1,
            ..Default::default()
        };
        let mut base = ComponentBase::new("b");
        base.local_state = vec![0.0, 0.0];
        bus.pflow_init_b(&mut base, &[]);
        assert!((bus.voltage - 1.02).abs() < 1e-12);
        assert!((bus.angle - 0.1).abs() < 1e-12);
        assert!((base.local_state[0] - 1.02).abs() < 1e-12);
    }

    #[test]
    fn test_bus_type_string_setter() {
        let mut bus = Bus::default();
        let mut base = ComponentBase::new("b");
        assert_eq!(
            bus.set_param_str(&mut base, "type", "slack"),
            ParamResult::Recognized
        );
        assert_eq!(bus.bus_type, BusType::Slack);
        assert_eq!(
            bus.set_param_str(&mut base, "type", "nonsense"),
            ParamResult::Invalid
        );
    }
}
