//! Dynamic simulation: machine swing behavior under the DAE and partitioned
//! strategies, root-driven relay trips, and post-init consistency checks.

use psd_core::{
    Bus, BusType, Component, ComponentKind, Exciter, Generator, Governor, Link, Load,
    ParameterEvent, Relay, Unit, DAE_MODE,
};
use psd_sim::{derivative_check, jacobian_check, residual_check, SimState, Simulation};

/// Slack bus feeding a PQ bus that hosts a classical machine with governor
/// and exciter plus a local load.
fn machine_grid() -> Simulation {
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
                    v_set: 1.0,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    let b2 = sim
        .arena
        .add_sub_object(root, Component::new("bus2", ComponentKind::Bus(Bus::default())))
        .unwrap();
    let gen = sim
        .arena
        .add_sub_object(
            b2,
            Component::new(
                "gen2",
                ComponentKind::Generator(Generator {
                    h: 4.0,
                    d: 1.0,
                    xdp: 0.3,
                    power_set: 0.5,
                    q_set: 0.1,
                    p_max: 1.5,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    sim.arena
        .add_sub_object(
            gen,
            Component::new("gov2", ComponentKind::Governor(Governor::default())),
        )
        .unwrap();
    sim.arena
        .add_sub_object(
            gen,
            Component::new("avr2", ComponentKind::Exciter(Exciter::default())),
        )
        .unwrap();
    sim.arena
        .add_sub_object(
            b2,
            Component::new(
                "load2",
                ComponentKind::Load(Load {
                    p: 0.8,
                    q: 0.2,
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
                    r: 0.01,
                    x: 0.08,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    sim
}

fn gen_state(sim: &Simulation) -> (f64, f64) {
    let gen = sim.arena.find(sim.root, "bus2.gen2").unwrap();
    let delta = sim.arena.get_param(gen, "delta", Unit::PerUnit).unwrap();
    let omega = sim.arena.get_param(gen, "omega", Unit::PerUnit).unwrap();
    (delta, omega)
}

#[test]
fn dae_sizes_include_machine_and_controls() {
    let mut sim = machine_grid();
    sim.powerflow().expect("power flow");
    sim.arena.dyn_init_a(sim.root, 0.0, 0);
    sim.arena.load_sizes(sim.root, &DAE_MODE);
    // 2 buses x (v, a) + machine (delta, omega) + governor + exciter
    assert_eq!(sim.arena.state_size(sim.root, &DAE_MODE), 8);
}

#[test]
fn equilibrium_holds_without_disturbances() {
    let mut sim = machine_grid();
    sim.dyn_initialize(0.0, &DAE_MODE).expect("dynamic init");

    let offending = residual_check(&mut sim, &DAE_MODE, 1e-5);
    assert!(offending.is_empty(), "post-init residuals: {offending:?}");
    let deriv = derivative_check(&mut sim, &DAE_MODE, 1e-5);
    assert!(deriv.is_empty(), "post-init derivative mismatch: {deriv:?}");

    sim.dynamic_dae(1.0).expect("dae run");
    assert_eq!(sim.state, SimState::DynamicComplete);
    let (_, omega) = gen_state(&sim);
    assert!((omega - 1.0).abs() < 1e-6, "speed drifted to {omega}");
}

#[test]
fn dae_jacobian_matches_finite_differences() {
    let mut sim = machine_grid();
    sim.dyn_initialize(0.0, &DAE_MODE).expect("dynamic init");
    let issues = jacobian_check(&mut sim, &DAE_MODE, 1e-5);
    assert!(issues.is_empty(), "DAE Jacobian issues: {issues:?}");
}

#[test]
fn load_step_excites_a_bounded_swing() {
    let mut sim = machine_grid();
    sim.dyn_initialize(0.0, &DAE_MODE).expect("dynamic init");
    let load = sim.arena.find(sim.root, "bus2.load2").unwrap();
    sim.events
        .insert(Box::new(ParameterEvent::new(0.5, load, "p", 0.9)));

    sim.dynamic_dae(3.0).expect("dae run");
    assert_eq!(sim.state, SimState::DynamicComplete);
    let (delta, omega) = gen_state(&sim);
    assert!(delta.is_finite());
    assert!(
        (omega - 1.0).abs() < 0.05,
        "speed excursion too large: {omega}"
    );
    // the governor should be carrying part of the new burden
    let gov = sim.arena.find(sim.root, "bus2.gen2.gov2").unwrap();
    let pm = sim.arena.get_param(gov, "pm", Unit::PerUnit).unwrap();
    assert!(pm.is_finite());
}

#[test]
fn partitioned_matches_the_monolithic_equilibrium() {
    let mut dae = machine_grid();
    dae.dyn_initialize(0.0, &DAE_MODE).expect("dae init");
    dae.dynamic_dae(0.5).expect("dae run");
    let (delta_dae, omega_dae) = gen_state(&dae);

    let mut part = machine_grid();
    part.options.dae_initialization_for_partitioned = true;
    part.options.max_step = 0.05;
    part.dyn_initialize(0.0, &psd_core::DYN_DIFFERENTIAL_MODE)
        .expect("partitioned init");
    part.dynamic_partitioned(0.5).expect("partitioned run");
    let (delta_part, omega_part) = gen_state(&part);

    assert!(
        (delta_dae - delta_part).abs() < 1e-3,
        "delta {delta_dae} vs {delta_part}"
    );
    assert!(
        (omega_dae - omega_part).abs() < 1e-4,
        "omega {omega_dae} vs {omega_part}"
    );
}

#[test]
fn decoupled_mode_is_declined() {
    let mut sim = machine_grid();
    assert!(sim.dynamic_decoupled(1.0).is_err());
}

#[test]
fn undervoltage_relay_sheds_its_load() {
    // radial third bus with no local machine support: its voltage sags
    // freely when the load jumps
    let mut sim = machine_grid();
    let root = sim.root;
    let b2 = sim.arena.find(root, "bus2").unwrap();
    let b3 = sim
        .arena
        .add_sub_object(root, Component::new("bus3", ComponentKind::Bus(Bus::default())))
        .unwrap();
    let load3 = sim
        .arena
        .add_sub_object(
            b3,
            Component::new(
                "load3",
                ComponentKind::Load(Load {
                    p: 0.3,
                    q: 0.1,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    sim.arena
        .add_sub_object(
            root,
            Component::new(
                "line23",
                ComponentKind::Link(Link {
                    from_bus: Some(b2),
                    to_bus: Some(b3),
                    r: 0.02,
                    x: 0.1,
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    sim.arena
        .add_sub_object(
            b3,
            Component::new(
                "uvrelay",
                ComponentKind::Relay(Relay {
                    pickup: 0.9,
                    monitor: Some(b3),
                    target: Some(load3),
                    ..Default::default()
                }),
            ),
        )
        .unwrap();
    sim.dyn_initialize(0.0, &DAE_MODE).expect("dynamic init");

    // push bus3 below the pickup level
    sim.events
        .insert(Box::new(ParameterEvent::new(0.5, load3, "p", 1.2)));
    sim.events
        .insert(Box::new(ParameterEvent::new(0.5, load3, "q", 0.6)));
    sim.dynamic_dae(2.0).expect("dae run");

    let relay = sim.arena.find(root, "bus3.uvrelay").unwrap();
    let tripped = sim.arena.get_param(relay, "tripped", Unit::PerUnit).unwrap();
    assert!((tripped - 1.0).abs() < 1e-12, "relay did not trip");
    assert!(!sim.arena.expect(load3).base.is_connected());
}

#[test]
fn step_advances_time_monotonically() {
    let mut sim = machine_grid();
    sim.dyn_initialize(0.0, &DAE_MODE).expect("dynamic init");
    let t1 = sim.step(0.1).expect("step");
    let t2 = sim.step(0.2).expect("step");
    assert!(t1 > 0.0);
    assert!(t2 > t1);
}
