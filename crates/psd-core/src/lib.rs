//! # psd-core: Power System Dynamics Modeling Core
//!
//! Component models and the component-solver bridge for power network
//! simulation.
//!
//! ## Design
//!
//! The object tree is an arena of tagged component variants:
//! - **Containers**: areas own buses, links, and relays; buses own
//!   generators and loads; generators own governors and exciters.
//! - **The math contract**: every model implements [`GridModel`] — size
//!   declaration, two-phase initialization, residual/derivative/Jacobian
//!   and root evaluation, outputs, and parameter dispatch.
//! - **Solver modes**: several views of "which variables belong to which
//!   solver" coexist on one tree. Each component's [`OffsetTable`] maps a
//!   [`SolverMode`] to the offsets of its variables in that mode's global
//!   vectors.
//!
//! ## Quick Start
//!
//! ```rust
//! use psd_core::*;
//!
//! let mut arena = ComponentArena::new();
//! let root = arena.insert(Component::new("grid", ComponentKind::Area(Area::default())));
//!
//! let bus1 = arena
//!     .add_sub_object(
//!         root,
//!         Component::new(
//!             "bus1",
//!             ComponentKind::Bus(Bus {
//!                 bus_type: BusType::Slack,
//!                 v_set: 1.02,
//!                 ..Default::default()
//!             }),
//!         ),
//!     )
//!     .unwrap();
//! let bus2 = arena
//!     .add_sub_object(root, Component::new("bus2", ComponentKind::Bus(Bus::default())))
//!     .unwrap();
//! arena
//!     .add_sub_object(
//!         root,
//!         Component::new(
//!             "line12",
//!             ComponentKind::Link(Link {
//!                 from_bus: Some(bus1),
//!                 to_bus: Some(bus2),
//!                 r: 0.02,
//!                 x: 0.1,
//!                 ..Default::default()
//!             }),
//!         ),
//!     )
//!     .unwrap();
//!
//! models::area::update_network_links(&mut arena, root);
//! arena.pflow_init_a(root, 0.0, 0);
//! arena.load_sizes(root, &POWER_FLOW_MODE);
//! assert_eq!(arena.state_size(root, &POWER_FLOW_MODE), 4);
//! ```
//!
//! ## Modules
//!
//! - [`solver_mode`] / [`sizes`] / [`offset_table`] - the offset/solver-mode
//!   system
//! - [`component`] / [`arena`] / [`object`] - the component hierarchy
//! - [`models`] - buses, links, generators, governors, exciters, loads,
//!   relays, areas
//! - [`sources`] - the signal source family
//! - [`events`] - the two-phase event queue
//! - [`matrix`] - Jacobian sinks
//! - [`factory`] - the global object factory

pub mod arena;
pub mod change;
pub mod component;
pub mod error;
pub mod events;
pub mod factory;
pub mod matrix;
pub mod models;
pub mod object;
pub mod offset_table;
pub mod sizes;
pub mod solver_mode;
pub mod sources;
pub mod state_data;
pub mod units;

pub use arena::ComponentArena;
pub use change::{
    ChangeCode, CheckLevel, ConvergeMode, ParamResult, ResetLevel, FUNCTION_EXECUTION_FAILURE,
    FUNCTION_EXECUTION_SUCCESS, NO_SLACK_BUS_FOUND, SOLVER_CONVERGENCE_ERROR, SOLVER_INITIAL_SETUP_ERROR,
    SOLVER_INVALID_STATE_ERROR, SOLVER_ROOT_FOUND,
};
pub use component::{
    Component, ComponentKind, EvalCtx, GridAction, GridModel, OffsetOrdering,
    ALGEBRAIC_VARIABLE, DIFFERENTIAL_VARIABLE,
};
pub use error::{PsdError, PsdResult};
pub use events::{EventAdapter, EventQueue, FlagEvent, ParameterEvent, RecorderEvent};
pub use matrix::{FnSink, MatrixData, TripletMatrix};
pub use models::{
    Area, Bus, BusType, Exciter, Generator, Governor, Link, Load, Relay, RelayCondition,
};
pub use object::{ComponentBase, ComponentId, OpFlag, OpFlags};
pub use offset_table::{Locations, OffsetTable};
pub use sizes::{SolverOffsets, StateSizes};
pub use solver_mode::{
    SolverMode, DAE_MODE, DYN_ALGEBRAIC_MODE, DYN_DIFFERENTIAL_MODE, LOCAL_MODE, POWER_FLOW_MODE,
};
pub use sources::Source;
pub use state_data::StateData;
pub use units::{Unit, UnitBases};

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus_arena() -> (ComponentArena, ComponentId) {
        let mut arena = ComponentArena::new();
        let root = arena.insert(Component::new("grid", ComponentKind::Area(Area::default())));
        let b1 = arena
            .add_sub_object(
                root,
                Component::new(
                    "bus1",
                    ComponentKind::Bus(Bus {
                        bus_type: BusType::Slack,
                        v_set: 1.02,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        let b2 = arena
            .add_sub_object(root, Component::new("bus2", ComponentKind::Bus(Bus::default())))
            .unwrap();
        arena
            .add_sub_object(
                b2,
                Component::new(
                    "load2",
                    ComponentKind::Load(Load {
                        p: 0.8,
                        q: 0.3,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        arena
            .add_sub_object(
                root,
                Component::new(
                    "line12",
                    ComponentKind::Link(Link {
                        from_bus: Some(b1),
                        to_bus: Some(b2),
                        r: 0.02,
                        x: 0.1,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        models::area::update_network_links(&mut arena, root);
        arena.pflow_init_a(root, 0.0, 0);
        arena.pflow_init_b(root);
        arena.load_sizes(root, &POWER_FLOW_MODE);
        arena.assign_offsets(root, 0, &POWER_FLOW_MODE, OffsetOrdering::Mixed);
        (arena, root)
    }

    #[test]
    fn test_two_bus_sizes_and_offsets() {
        let (arena, root) = two_bus_arena();
        assert_eq!(arena.state_size(root, &POWER_FLOW_MODE), 4);
        // sibling ranges must not overlap
        let ids = arena.subtree_post_order(root);
        let mut seen = std::collections::HashSet::new();
        for id in ids {
            let comp = arena.expect(id);
            if let Some(so) = comp.base.offsets.get(&POWER_FLOW_MODE) {
                for off in [so.v_offset, so.a_offset] {
                    if let Some(off) = off {
                        assert!(seen.insert(off), "offset {off} assigned twice");
                    }
                }
            }
        }
    }

    #[test]
    fn test_two_bus_residual_at_flat_start() {
        let (arena, root) = two_bus_arena();
        let n = arena.state_size(root, &POWER_FLOW_MODE);
        let mut state = vec![0.0; n];
        let mut dstate = vec![0.0; n];
        arena.guess_state(root, 0.0, &mut state, &mut dstate, &POWER_FLOW_MODE);

        let sd = StateData::new(0.0, &state, None, 1);
        let mut resid = vec![0.0; n];
        arena
            .residual(root, &sd, &mut resid, &POWER_FLOW_MODE)
            .unwrap();

        // the load bus P row must show the unserved 0.8 pu demand
        let b2 = arena.find(root, "bus2").unwrap();
        let so = arena.expect(b2).base.offsets.get(&POWER_FLOW_MODE).unwrap();
        let p_row = so.a_offset.unwrap();
        assert!((resid[p_row] + 0.8).abs() < 0.1);
    }

    #[test]
    fn test_jacobian_count_is_an_upper_bound() {
        let (arena, root) = two_bus_arena();
        let mut arena = arena;
        arena.load_jacobian_sizes(root, &POWER_FLOW_MODE);
        let bound = arena.jacobian_size(root, &POWER_FLOW_MODE);

        let n = arena.state_size(root, &POWER_FLOW_MODE);
        let mut state = vec![0.0; n];
        let mut dstate = vec![0.0; n];
        arena.guess_state(root, 0.0, &mut state, &mut dstate, &POWER_FLOW_MODE);
        let sd = StateData::new(0.0, &state, None, 1);
        let mut jac = TripletMatrix::new(n, n);
        arena.jacobian_elements(root, &sd, &mut jac, &POWER_FLOW_MODE);
        assert!(jac.count() <= bound, "{} > {}", jac.count(), bound);
        assert!(jac.count() > 0);
    }

    #[test]
    fn test_empty_state_mode() {
        let (arena, root) = two_bus_arena();
        // no differential states exist in the power-flow tree
        let mut arena = arena;
        arena.load_sizes(root, &DYN_DIFFERENTIAL_MODE);
        assert_eq!(arena.state_size(root, &DYN_DIFFERENTIAL_MODE), 0);
    }
}
