//! # psd-sim: Simulation Driver
//!
//! Orchestrates power-flow and dynamic solves over a `psd-core` component
//! tree: the per-mode solver bridge, the power-flow voltage/power adjustment
//! loops, the three dynamic strategies (monolithic DAE, partitioned,
//! decoupled), event-driven power flow, staged error recovery, Jacobian and
//! consistency diagnostics, and snapshot persistence.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use psd_sim::{SimCommand, Simulation};
//!
//! let mut sim = Simulation::new("grid");
//! // ... build the network under sim.root ...
//! sim.execute(SimCommand::Powerflow).unwrap();
//! sim.execute(SimCommand::DynamicDae(10.0)).unwrap();
//! ```

pub mod client;
pub mod diagnostics;
pub mod dynamics;
pub mod powerflow;
pub mod recovery;
pub mod simulation;
pub mod snapshot;
pub mod solvers;

pub use client::{PartitionedAlgClient, PartitionedDiffClient, TreeClient};
pub use diagnostics::{
    algebraic_check, check_object_equivalence, derivative_check, jacobian_check, residual_check,
    JacobianIssue,
};
pub use recovery::{
    DynamicInitRecovery, FaultResetRecovery, PowerFlowErrorRecovery, RecoveryOutcome,
};
pub use simulation::{
    DefaultModes, SimCommand, SimOptions, SimState, Simulation, SolutionRole,
};
pub use solvers::{IcMode, ImplicitIntegrator, NewtonSolver, SolverClient, SolverConfig,
    SolverHandle};
