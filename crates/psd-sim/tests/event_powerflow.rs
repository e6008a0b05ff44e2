//! Event-driven power flow: a load step at t = 3 with a periodic recorder.

use psd_core::{
    Bus, BusType, Component, ComponentKind, Link, Load, ParameterEvent, RecorderEvent, Unit,
};
use psd_sim::Simulation;

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
fn load_step_is_visible_to_the_recorder_only_after_the_event() {
    let mut sim = two_bus();
    let load = sim.arena.find(sim.root, "bus2.load2").unwrap();

    // sample the load real power every second, deferred to part B so the
    // post-event power flow is already in
    let recorder = RecorderEvent::new(0.0, Some(1.0), load, "p");
    let samples = recorder.samples();
    sim.events.insert(Box::new(recorder));
    sim.events
        .insert(Box::new(ParameterEvent::new(3.0, load, "p", 1.0)));

    sim.event_driven_powerflow(5.0, 1.0).expect("event-driven run");

    let recorded = samples.lock().unwrap().clone();
    assert!(recorded.len() >= 6, "expected samples at 0..=5, got {recorded:?}");
    for (time, value) in &recorded {
        let expected = if *time < 3.0 - 1e-9 { 0.8 } else { 1.0 };
        assert!(
            (value - expected).abs() < 1e-9,
            "at t = {time} expected {expected}, recorded {value}"
        );
    }
    // the event itself must be consumed
    let p_now = sim.arena.get_param(load, "p", Unit::PerUnit).unwrap();
    assert!((p_now - 1.0).abs() < 1e-12);
}

#[test]
fn heartbeat_resolves_between_events() {
    let mut sim = two_bus();
    sim.event_driven_powerflow(3.0, 1.0).expect("run");
    // no events at all: the run still completes on the heartbeat and the
    // network stays solved
    assert!((sim.current_time - 3.0).abs() < 1e-6);
    let b2 = sim.arena.find(sim.root, "bus2").unwrap();
    let v2 = sim.arena.get_param(b2, "voltage", Unit::PerUnit).unwrap();
    assert!((v2 - 0.9547).abs() < 1e-3);
}

#[test]
fn voltage_drops_after_the_load_step() {
    let mut sim = two_bus();
    let load = sim.arena.find(sim.root, "bus2.load2").unwrap();
    let b2 = sim.arena.find(sim.root, "bus2").unwrap();

    let recorder = RecorderEvent::new(0.0, Some(1.0), b2, "voltage");
    let samples = recorder.samples();
    sim.events.insert(Box::new(recorder));
    sim.events
        .insert(Box::new(ParameterEvent::new(3.0, load, "p", 1.0)));

    sim.event_driven_powerflow(5.0, 1.0).expect("run");

    let recorded = samples.lock().unwrap().clone();
    let before = recorded
        .iter()
        .find(|(t, _)| (*t - 2.0).abs() < 1e-6)
        .map(|(_, v)| *v)
        .expect("sample at t=2");
    let after = recorded
        .iter()
        .find(|(t, _)| (*t - 4.0).abs() < 1e-6)
        .map(|(_, v)| *v)
        .expect("sample at t=4");
    assert!(after < before, "voltage should sag after the load step");
}
