//! # psd-batch: Parallel Contingency Analysis
//!
//! N-1 / N-1-1 / N-2 list builders and a rayon thread-pool runner executing
//! each contingency on its own cloned simulation, with a CSV summary writer.

pub mod contingency;

pub use contingency::{
    build_n1, build_n1_1, build_n2, run_contingencies, Contingency, ContingencySummary,
    OutageKind, Violation, ViolationLimits,
};
