//! Contingency batch execution over a small meshed network.

use psd_batch::{build_n1, build_n1_1, build_n2, run_contingencies, OutageKind, ViolationLimits};
use psd_core::{Bus, BusType, Component, ComponentKind, Link, Load, Unit};
use psd_sim::Simulation;

/// Three buses in a triangle: losing any one line leaves the system
/// connected.
fn triangle_grid() -> Simulation {
    let mut sim = Simulation::new("triangle");
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
    let b3 = sim
        .arena
        .add_sub_object(root, Component::new("bus3", ComponentKind::Bus(Bus::default())))
        .unwrap();
    for (name, from, to) in [("line12", b1, b2), ("line13", b1, b3), ("line23", b2, b3)] {
        sim.arena
            .add_sub_object(
                root,
                Component::new(
                    name,
                    ComponentKind::Link(Link {
                        from_bus: Some(from),
                        to_bus: Some(to),
                        r: 0.01,
                        x: 0.1,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
    }
    for (name, bus, p, q) in [("load2", b2, 0.4, 0.1), ("load3", b3, 0.3, 0.1)] {
        sim.arena
            .add_sub_object(
                bus,
                Component::new(
                    name,
                    ComponentKind::Load(Load {
                        p,
                        q,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
    }
    sim
}

#[test]
fn n1_list_covers_every_link() {
    let sim = triangle_grid();
    let list = build_n1(&sim, &[OutageKind::Link]);
    assert_eq!(list.len(), 3);
    assert!(list.iter().all(|c| c.stages.len() == 1 && c.stages[0].len() == 1));
}

#[test]
fn n2_list_is_the_pair_set() {
    let sim = triangle_grid();
    let list = build_n2(&sim, &[OutageKind::Link]);
    // C(3, 2) unordered pairs, applied in one stage
    assert_eq!(list.len(), 3);
    assert!(list.iter().all(|c| c.stages[0].len() == 2));
}

#[test]
fn n1_1_list_is_ordered_pairs_in_stages() {
    let sim = triangle_grid();
    let list = build_n1_1(&sim, &[OutageKind::Link]);
    assert_eq!(list.len(), 6);
    assert!(list.iter().all(|c| c.stages.len() == 2));
}

#[test]
fn parallel_n1_run_writes_the_summary() {
    let mut sim = triangle_grid();
    sim.powerflow().expect("base power flow");

    let mut list = build_n1(&sim, &[OutageKind::Link]);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("n1.csv");
    let summary = run_contingencies(&sim, &mut list, 2, &ViolationLimits::default(), &out)
        .expect("contingency batch");

    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 3);
    for contingency in &list {
        assert!(contingency.completed);
        // a triangle survives any single line loss
        assert!(
            !contingency
                .violations
                .iter()
                .any(|v| matches!(v, psd_batch::Violation::ConvergenceFailure { .. })),
            "{} failed to converge",
            contingency.name
        );
        assert_eq!(contingency.bus_voltages.len(), 3);
    }

    let text = std::fs::read_to_string(&out).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next().unwrap(),
        "id,name,completed,violations,min_voltage,max_flow"
    );
    assert_eq!(lines.count(), 3);
}

#[test]
fn contingency_execution_leaves_the_base_untouched() {
    let mut sim = triangle_grid();
    sim.powerflow().expect("base power flow");
    let b2 = sim.arena.find(sim.root, "bus2").unwrap();
    let v_before = sim.arena.get_param(b2, "voltage", Unit::PerUnit).unwrap();

    let mut list = build_n1(&sim, &[OutageKind::Link]);
    let dir = tempfile::tempdir().unwrap();
    run_contingencies(
        &sim,
        &mut list,
        0,
        &ViolationLimits::default(),
        dir.path().join("n1.csv"),
    )
    .expect("batch");

    let v_after = sim.arena.get_param(b2, "voltage", Unit::PerUnit).unwrap();
    assert!((v_before - v_after).abs() < 1e-15);
    // every link in the base case is still connected
    for name in ["line12", "line13", "line23"] {
        let id = sim.arena.find(sim.root, name).unwrap();
        assert!(sim.arena.expect(id).base.is_connected());
    }
}
