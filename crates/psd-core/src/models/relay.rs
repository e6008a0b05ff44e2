//! Condition-monitoring relay.
//!
//! A relay owns one continuous root function built from its condition; when
//! the solver reports a crossing the relay trips, disconnecting its target.
//! After tripping the root function goes inert.

use crate::change::{ChangeCode, CheckLevel, ParamResult, POTENTIAL_FAULT_CHANGE};
use crate::component::{ComponentKind, EvalCtx, GridAction, GridModel};
use crate::models::bus_va;
use crate::object::{ComponentBase, ComponentId, OpFlag};
use crate::sizes::StateSizes;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::Unit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayCondition {
    /// Trip when the monitored bus voltage falls below the pickup level
    #[default]
    UnderVoltage,
    /// Trip when the monitored bus voltage rises above the pickup level
    OverVoltage,
    /// Trip when the monitored link's terminal angle difference exceeds the
    /// pickup level
    AngleDifference,
}

#[derive(Debug, Clone)]
pub struct Relay {
    pub condition: RelayCondition,
    /// Threshold level (per-unit voltage or radians)
    pub pickup: f64,
    /// Component whose quantity is monitored (defaults to the parent)
    pub monitor: Option<ComponentId>,
    /// Component disconnected on trip (defaults to the monitored one)
    pub target: Option<ComponentId>,
    pub armed: bool,
    pub tripped: bool,
}

impl Default for Relay {
    fn default() -> Self {
        Relay {
            condition: RelayCondition::UnderVoltage,
            pickup: 0.8,
            monitor: None,
            target: None,
            armed: true,
            tripped: false,
        }
    }
}

impl Relay {
    fn monitored(&self, base: &ComponentBase) -> Option<ComponentId> {
        self.monitor.or(base.parent)
    }

    /// The continuous condition function: positive while healthy, negative
    /// once the trip condition holds.
    fn condition_value(&self, ctx: &EvalCtx, sd: &StateData, mode: &SolverMode) -> f64 {
        if self.tripped || !self.armed {
            return 1.0;
        }
        let Some(monitored) = self.monitored(ctx.base()) else {
            return 1.0;
        };
        match self.condition {
            RelayCondition::UnderVoltage => {
                let (v, _) = bus_va(ctx, monitored, sd, mode);
                v - self.pickup
            }
            RelayCondition::OverVoltage => {
                let (v, _) = bus_va(ctx, monitored, sd, mode);
                self.pickup - v
            }
            RelayCondition::AngleDifference => {
                let Some(ComponentKind::Link(link)) = ctx.get(monitored).map(|c| &c.kind) else {
                    return 1.0;
                };
                match (link.from_bus, link.to_bus) {
                    (Some(f), Some(t)) => {
                        let (_, a_f) = bus_va(ctx, f, sd, mode);
                        let (_, a_t) = bus_va(ctx, t, sd, mode);
                        self.pickup - (a_f - a_t).abs()
                    }
                    _ => 1.0,
                }
            }
        }
    }

    fn trip_actions(&self, base: &ComponentBase, own: ComponentId) -> Vec<GridAction> {
        let target = self.target.or(self.monitored(base));
        let mut actions = Vec::new();
        if let Some(t) = target {
            actions.push(GridAction::Disconnect(t));
        }
        actions.push(GridAction::Alert {
            source: own,
            code: POTENTIAL_FAULT_CHANGE,
        });
        actions
    }
}

impl GridModel for Relay {
    fn type_name(&self) -> &'static str {
        "relay"
    }

    fn local_state_sizes(&self, _base: &ComponentBase, _mode: &SolverMode) -> StateSizes {
        StateSizes::default()
    }

    fn local_root_count(&self, _base: &ComponentBase, mode: &SolverMode) -> (usize, usize) {
        if mode.is_dynamic() && mode.has_algebraic() {
            (1, 0)
        } else {
            (0, 0)
        }
    }

    fn pflow_init_a(&mut self, base: &mut ComponentBase, _time0: f64, _flags: u32) {
        base.flags.set(OpFlag::HasRoots, true);
        base.flags.set(OpFlag::HasAlgRoots, true);
        base.flags.set(OpFlag::ObjectArmed, self.armed);
    }

    fn root_test(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        roots: &mut [f64],
        mode: &SolverMode,
    ) {
        let Some(off) = ctx.base().offsets.get(mode).and_then(|so| so.root_offset) else {
            return;
        };
        if off < roots.len() {
            roots[off] = self.condition_value(ctx, sd, mode);
        }
    }

    fn root_trigger(
        &mut self,
        base: &mut ComponentBase,
        _time: f64,
        _inputs: &[f64],
        root_mask: &[bool],
        _mode: &SolverMode,
    ) -> (ChangeCode, Vec<GridAction>) {
        if self.tripped || !root_mask.first().copied().unwrap_or(false) {
            return (ChangeCode::NoChange, Vec::new());
        }
        self.tripped = true;
        self.armed = false;
        base.flags.set(OpFlag::ObjectArmed, false);
        (ChangeCode::ObjectChange, self.trip_actions(base, base.id))
    }

    fn root_check(
        &self,
        ctx: &EvalCtx,
        _inputs: &[f64],
        sd: &StateData,
        level: CheckLevel,
    ) -> (ChangeCode, Vec<GridAction>) {
        if self.tripped || !self.armed {
            return (ChangeCode::NoChange, Vec::new());
        }
        if level == CheckLevel::LowVoltageCheck && self.condition != RelayCondition::UnderVoltage {
            return (ChangeCode::NoChange, Vec::new());
        }
        let mode = crate::solver_mode::LOCAL_MODE;
        if self.condition_value(ctx, sd, &mode) < 0.0 {
            let mut actions = self.trip_actions(ctx.base(), ctx.id);
            // mark the trip through the action path so the static check has
            // the same effect as a solver-detected crossing
            actions.push(GridAction::SetParam {
                target: ctx.id,
                name: "tripped".into(),
                value: 1.0,
            });
            return (ChangeCode::ObjectChange, actions);
        }
        (ChangeCode::NoChange, Vec::new())
    }

    fn output(&self, _base: &ComponentBase, index: usize) -> f64 {
        match index {
            0 => {
                if self.tripped {
                    1.0
                } else {
                    0.0
                }
            }
            1 => self.pickup,
            _ => 0.0,
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
            "pickup" | "level" => {
                if value < 0.0 {
                    return ParamResult::Invalid;
                }
                self.pickup = value;
            }
            "tripped" => {
                self.tripped = value > 0.0;
                if self.tripped {
                    self.armed = false;
                }
            }
            "armed" => self.armed = value > 0.0,
            _ => return ParamResult::NotRecognized,
        }
        ParamResult::Recognized
    }

    fn set_param_str(&mut self, _base: &mut ComponentBase, name: &str, value: &str) -> ParamResult {
        if name != "condition" && name != "type" {
            return ParamResult::NotRecognized;
        }
        self.condition = match value.to_ascii_lowercase().as_str() {
            "undervoltage" | "uv" => RelayCondition::UnderVoltage,
            "overvoltage" | "ov" => RelayCondition::OverVoltage,
            "anglediff" | "angledifference" => RelayCondition::AngleDifference,
            _ => return ParamResult::Invalid,
        };
        ParamResult::Recognized
    }

    fn get_param(&self, _base: &ComponentBase, name: &str, _unit: Unit) -> Option<f64> {
        match name {
            "pickup" | "level" => Some(self.pickup),
            "tripped" => Some(if self.tripped { 1.0 } else { 0.0 }),
            "armed" => Some(if self.armed { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ComponentArena;
    use crate::component::Component;
    use crate::models::{Area, Bus};

    fn relay_on_bus(voltage: f64, pickup: f64) -> (ComponentArena, ComponentId) {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("root", ComponentKind::Area(Area::default())));
        let bus = arena
            .add_sub_object(
                root,
                Component::new(
                    "bus1",
                    ComponentKind::Bus(Bus {
                        voltage,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        let relay = arena
            .add_sub_object(
                bus,
                Component::new(
                    "uv1",
                    ComponentKind::Relay(Relay {
                        pickup,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        (arena, relay)
    }

    #[test]
    fn test_condition_sign() {
        let (arena, relay_id) = relay_on_bus(1.0, 0.8);
        let ctx = EvalCtx::new(&arena, relay_id);
        let relay = Relay {
            pickup: 0.8,
            ..Default::default()
        };
        let sd = StateData::empty();
        let healthy = relay.condition_value(&ctx, &sd, &crate::solver_mode::LOCAL_MODE);
        assert!(healthy > 0.0);

        let (arena2, relay_id2) = relay_on_bus(0.7, 0.8);
        let ctx2 = EvalCtx::new(&arena2, relay_id2);
        let sagged = relay.condition_value(&ctx2, &sd, &crate::solver_mode::LOCAL_MODE);
        assert!(sagged < 0.0);
    }

    #[test]
    fn test_trigger_disconnects_monitored_bus() {
        let (mut arena, relay_id) = relay_on_bus(0.7, 0.8);
        let bus_id = arena.expect(relay_id).base.parent.unwrap();
        let comp = arena.expect_mut(relay_id);
        let Component { base, kind } = comp;
        let ComponentKind::Relay(relay) = kind else {
            panic!("expected relay");
        };
        let (code, actions) =
            relay.root_trigger(base, 1.0, &[], &[true], &crate::solver_mode::DAE_MODE);
        assert_eq!(code, ChangeCode::ObjectChange);
        assert!(relay.tripped);
        assert!(actions
            .iter()
            .any(|a| matches!(a, GridAction::Disconnect(id) if *id == bus_id)));
    }

    #[test]
    fn test_inert_after_trip() {
        let (arena, relay_id) = relay_on_bus(0.5, 0.8);
        let ctx = EvalCtx::new(&arena, relay_id);
        let relay = Relay {
            pickup: 0.8,
            tripped: true,
            armed: false,
            ..Default::default()
        };
        let sd = StateData::empty();
        assert!(relay.condition_value(&ctx, &sd, &crate::solver_mode::LOCAL_MODE) > 0.0);
    }
}
