//! Concrete component models.

pub mod area;
pub mod bus;
pub mod exciter;
pub mod generator;
pub mod governor;
pub mod link;
pub mod load;
pub mod relay;

pub use area::Area;
pub use bus::{Bus, BusType};
pub use exciter::Exciter;
pub use generator::Generator;
pub use governor::Governor;
pub use link::Link;
pub use load::Load;
pub use relay::{Relay, RelayCondition};

use crate::component::{ComponentKind, EvalCtx};
use crate::object::ComponentId;
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;

/// Read a bus's voltage magnitude and angle under any mode.
///
/// Resolution order: the mode's own state vector, the paired half for
/// partitioned differential solves, then the bus's cached values. DC modes
/// carry no voltage state, so the cached magnitude is used.
pub fn bus_va(
    ctx: &EvalCtx,
    bus_id: ComponentId,
    sd: &StateData,
    mode: &SolverMode,
) -> (f64, f64) {
    let Some(comp) = ctx.get(bus_id) else {
        return (1.0, 0.0);
    };
    let ComponentKind::Bus(bus) = &comp.kind else {
        return (1.0, 0.0);
    };
    if mode.is_local() || sd.is_empty() {
        return (bus.voltage, bus.angle);
    }
    let (arr, column): (&[f64], usize) = if mode.has_algebraic() {
        match sd.state {
            Some(state) => (state, mode.offset_index),
            None => return (bus.voltage, bus.angle),
        }
    } else {
        // differential-only solve: the bus states live in the paired half
        match (sd.alg_state.or(sd.full_state), sd.pair_index) {
            (Some(arr), Some(pair)) => (arr, pair),
            _ => return (bus.voltage, bus.angle),
        }
    };
    let Some(so) = comp.base.offsets.column(column) else {
        return (bus.voltage, bus.angle);
    };
    let v = so
        .v_offset
        .and_then(|off| arr.get(off).copied())
        .unwrap_or(bus.voltage);
    let a = so
        .a_offset
        .and_then(|off| arr.get(off).copied())
        .unwrap_or(bus.angle);
    (v, a)
}

/// Read the k-th differential state of a component under any mode,
/// following the paired column for algebraic-only partitioned solves.
pub fn diff_state_of(
    ctx: &EvalCtx,
    id: ComponentId,
    sd: &StateData,
    mode: &SolverMode,
    k: usize,
) -> Option<f64> {
    let comp = ctx.get(id)?;
    if mode.is_local() || sd.is_empty() {
        let alg_total = comp.base.offsets.local().total.algebraic_total();
        return comp.base.local_state.get(alg_total + k).copied();
    }
    let (arr, column): (&[f64], usize) = if mode.has_differential() {
        (sd.state?, mode.offset_index)
    } else {
        match (sd.diff_state.or(sd.full_state), sd.pair_index) {
            (Some(arr), Some(pair)) => (arr, pair),
            _ => return None,
        }
    };
    let so = comp.base.offsets.column(column)?;
    arr.get(so.diff_offset? + k).copied()
}

/// First child of a component matching a predicate.
pub fn child_matching(
    ctx: &EvalCtx,
    id: ComponentId,
    pred: fn(&ComponentKind) -> bool,
) -> Option<ComponentId> {
    ctx.arena
        .children(id)
        .into_iter()
        .find(|&c| ctx.get(c).is_some_and(|comp| pred(&comp.kind)))
}
