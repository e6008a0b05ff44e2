//! Two-bus power flow: slack at 1.02 pu feeding a 0.8 + j0.3 pu load over
//! an r = 0.02, x = 0.1 line.

use psd_core::{
    Bus, BusType, Component, ComponentKind, Link, Load, OffsetOrdering, Unit, POWER_FLOW_MODE,
};
use psd_sim::{
    check_object_equivalence, jacobian_check, residual_check, SimState, Simulation,
};

fn two_bus() -> Simulation {
    let mut sim = Simulation::new("grid");
    let root = sim.root;
    let b1 = sim
        .arena
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
    let b2 = sim
        .arena
        .add_sub_object(root, Component::new("bus2", ComponentKind::Bus(Bus::default())))
        .unwrap();
    sim.arena
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
    sim.arena
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
    sim
}

#[test]
fn solves_to_the_reference_operating_point() {
    let mut sim = two_bus();
    sim.powerflow().expect("power flow");
    assert_eq!(sim.state, SimState::PowerflowComplete);

    let b2 = sim.arena.find(sim.root, "bus2").unwrap();
    let v2 = sim.arena.get_param(b2, "voltage", Unit::PerUnit).unwrap();
    let a2 = sim.arena.get_param(b2, "angle", Unit::PerUnit).unwrap();
    assert!((v2 - 0.9547).abs() < 1e-3, "load bus voltage {v2}");
    assert!((a2 + 0.0827).abs() < 1e-3, "load bus angle {a2}");

    let slack_p = sim.total_slack_generation();
    assert!((slack_p - 0.8180).abs() < 1e-3, "slack power {slack_p}");
    let losses = slack_p - 0.8;
    assert!((losses - 0.018).abs() < 1e-3, "losses {losses}");
}

#[test]
fn residuals_are_below_tolerance_after_the_solve() {
    let mut sim = two_bus();
    sim.powerflow().expect("power flow");
    let offending = residual_check(&mut sim, &POWER_FLOW_MODE, 1e-6);
    assert!(offending.is_empty(), "residuals above tolerance: {offending:?}");
}

#[test]
fn analytic_jacobian_matches_finite_differences() {
    let mut sim = two_bus();
    sim.powerflow().expect("power flow");
    let issues = jacobian_check(&mut sim, &POWER_FLOW_MODE, 1e-5);
    assert!(issues.is_empty(), "Jacobian issues: {issues:?}");
}

#[test]
fn power_balance_holds_at_every_bus() {
    let mut sim = two_bus();
    sim.powerflow().expect("power flow");
    // the slack outflow must cover load plus losses within tolerance
    let slack_p = sim.total_slack_generation();
    assert!(slack_p > 0.8);
    assert!(slack_p < 0.83);
}

#[test]
fn clone_is_structurally_equivalent_and_solves_identically() {
    let mut sim = two_bus();
    let mut copy = sim.clone();
    assert!(check_object_equivalence(
        &sim.arena, sim.root, &copy.arena, copy.root
    ));

    sim.powerflow().expect("power flow");
    copy.powerflow().expect("power flow on the clone");
    for (a, b) in sim.voltages().iter().zip(copy.voltages().iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}

#[test]
fn offset_orderings_give_the_same_solution() {
    let mut reference = two_bus();
    reference.powerflow().expect("power flow");
    let ref_v = reference.voltages();

    for ordering in [
        OffsetOrdering::Grouped,
        OffsetOrdering::AlgebraicGrouped,
        OffsetOrdering::VoltageFirst,
        OffsetOrdering::AngleFirst,
        OffsetOrdering::DifferentialFirst,
    ] {
        let mut sim = two_bus();
        sim.options.ordering = ordering;
        sim.powerflow().expect("power flow");
        for (a, b) in ref_v.iter().zip(sim.voltages().iter()) {
            assert!((a - b).abs() < 1e-9, "{ordering:?} diverged");
        }
    }
}

#[test]
fn dc_approximation_drops_voltage_states() {
    let mut sim = two_bus();
    let mut dc_mode = POWER_FLOW_MODE;
    dc_mode.set_approx(psd_core::solver_mode::approx::DC, true);
    sim.set_default_mode(psd_sim::SolutionRole::Powerflow, dc_mode);
    sim.powerflow().expect("dc power flow");
    // one angle state per bus only
    assert_eq!(sim.arena.state_size(sim.root, &dc_mode), 2);
    let b2 = sim.arena.find(sim.root, "bus2").unwrap();
    let a2 = sim.arena.get_param(b2, "angle", Unit::PerUnit).unwrap();
    // P x / 1.0 = 0.08 rad angle drop, DC approximation
    assert!((a2 + 0.08).abs() < 1e-6, "dc angle {a2}");
}

#[test]
fn empty_network_power_flow_is_a_no_op() {
    let mut sim = Simulation::new("empty");
    sim.powerflow().expect("empty power flow");
    assert_eq!(sim.arena.state_size(sim.root, &POWER_FLOW_MODE), 0);
}

#[test]
fn snapshot_round_trip_preserves_state() {
    let mut sim = two_bus();
    sim.powerflow().expect("power flow");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    psd_sim::snapshot::save_state(&sim, &POWER_FLOW_MODE, &path).expect("save");
    let before = sim.solver_state(&POWER_FLOW_MODE).unwrap().to_vec();

    // perturb, reload, compare
    let mut other = two_bus();
    other.powerflow().expect("power flow");
    psd_sim::snapshot::load_state(&mut other, &POWER_FLOW_MODE, &path).expect("load");
    let after = other.solver_state(&POWER_FLOW_MODE).unwrap().to_vec();
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        assert!((a - b).abs() < 1e-12);
    }
}
