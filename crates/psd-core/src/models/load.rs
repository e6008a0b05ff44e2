//! Constant-PQ load with optional low-voltage impedance conversion.
//!
//! Below the conversion threshold the load behaves as constant impedance
//! (demand scaling with V^2), which keeps power flow solvable through deep
//! voltage sags. A source child, when present, drives the real-power demand.

use crate::change::ParamResult;
use crate::component::{ComponentKind, EvalCtx, GridModel};
use crate::object::ComponentBase;
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::units::Unit;

/// Voltage below which a limited load converts to constant impedance.
const LOW_V_THRESHOLD: f64 = 0.8;

/// Load demand with the voltage partials bus rows need.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadTerms {
    pub p: f64,
    pub q: f64,
    pub dp_dv: f64,
    pub dq_dv: f64,
}

#[derive(Debug, Clone)]
pub struct Load {
    /// Real power demand (per-unit)
    pub p: f64,
    /// Reactive power demand (per-unit)
    pub q: f64,
    /// Convert to constant impedance below [`LOW_V_THRESHOLD`]
    pub pq_low_v_limit: bool,
    /// Terminal voltage cached by the network pass
    pub bus_voltage: f64,
}

impl Default for Load {
    fn default() -> Self {
        Load {
            p: 0.0,
            q: 0.0,
            pq_low_v_limit: false,
            bus_voltage: 1.0,
        }
    }
}

impl Load {
    /// Demand at terminal voltage `v`, honoring the source child and the
    /// low-voltage conversion.
    pub fn injection_terms(&self, ctx: &EvalCtx, time: f64, v: f64) -> LoadTerms {
        let mut p = self.p;
        for child in ctx.arena.children(ctx.id) {
            if let Some(comp) = ctx.get(child) {
                if let ComponentKind::Source(src) = &comp.kind {
                    if comp.base.is_connected() {
                        p = src.value_at(&ctx.for_id(child), time);
                    }
                }
            }
        }
        if self.pq_low_v_limit && v < LOW_V_THRESHOLD {
            let scale = (v / LOW_V_THRESHOLD) * (v / LOW_V_THRESHOLD);
            let dscale_dv = 2.0 * v / (LOW_V_THRESHOLD * LOW_V_THRESHOLD);
            LoadTerms {
                p: p * scale,
                q: self.q * scale,
                dp_dv: p * dscale_dv,
                dq_dv: self.q * dscale_dv,
            }
        } else {
            LoadTerms {
                p,
                q: self.q,
                dp_dv: 0.0,
                dq_dv: 0.0,
            }
        }
    }
}

impl GridModel for Load {
    fn type_name(&self) -> &'static str {
        "load"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, _mode: &SolverMode) -> StateSizes {
        StateSizes::default()
    }

    fn outputs(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &crate::state_data::StateData,
        _mode: &SolverMode,
    ) -> Vec<f64> {
        let terms = self.injection_terms(ctx, sd.time, self.bus_voltage);
        vec![terms.p, terms.q]
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        match index {
            0 => self.p,
            1 => self.q,
            _ => 0.0,
        }
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
            "p" | "power" => self.p = value_pu,
            "q" => self.q = value_pu,
            "pqlowvlimit" => self.pq_low_v_limit = value > 0.0,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn set_flag(&mut self, _base: &mut ComponentBase, name: &str, value: bool) -> ParamResult {
        if name == "pqlowvlimit" {
            self.pq_low_v_limit = value;
            return ParamResult::Recognized;
        }
        ParamResult::NotRecognized
    }

    fn get_param(&self, base: &ComponentBase, name: &str, unit: Unit) -> Option<f64> {
        let bases = base.unit_bases();
        let raw = match name {
            "p" | "power" => self.p,
            "q" => self.q,
            "pqlowvlimit" => return Some(if self.pq_low_v_limit { 1.0 } else { 0.0 }),
            _ => return None,
        };
        Some(crate::units::from_internal(raw, unit, &bases))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ComponentArena;
    use crate::component::Component;
    use crate::models::Area;

    #[test]
    fn test_low_voltage_conversion() {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("root", ComponentKind::Area(Area::default())));
        let load_id = arena
            .add_sub_object(
                root,
                Component::new(
                    "load",
                    ComponentKind::Load(Load {
                        p: 0.8,
                        q: 0.3,
                        pq_low_v_limit: true,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        let ctx = crate::component::EvalCtx::new(&arena, load_id);
        let load = Load {
            p: 0.8,
            q: 0.3,
            pq_low_v_limit: true,
            ..Default::default()
        };

        let nominal = load.injection_terms(&ctx, 0.0, 1.0);
        assert!((nominal.p - 0.8).abs() < 1e-12);
        assert!(nominal.dp_dv.abs() < 1e-12);

        let sagged = load.injection_terms(&ctx, 0.0, 0.4);
        assert!((sagged.p - 0.8 * 0.25).abs() < 1e-12);
        assert!(sagged.dp_dv > 0.0);
    }

    #[test]
    fn test_unit_conversion_on_set() {
        let mut load = Load::default();
        let mut base = ComponentBase::new("load");
        base.base_power = 100.0;
        assert_eq!(
            load.set_param(&mut base, "p", 80.0, Unit::Mw),
            ParamResult::Recognized
        );
        assert!((load.p - 0.8).abs() < 1e-12);
    }
}
