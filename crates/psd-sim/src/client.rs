//! Solver-client adapters dispatching callbacks into the component tree.

use crate::solvers::SolverClient;
use psd_core::{
    ComponentArena, ComponentId, SolverMode, StateData, TripletMatrix,
    SOLVER_INVALID_STATE_ERROR,
};

/// Client for monolithic solves: the state vector carries every variable of
/// the mode.
pub struct TreeClient<'a> {
    pub arena: &'a ComponentArena,
    pub root: ComponentId,
    pub mode: SolverMode,
    pub seq: u64,
}

impl<'a> TreeClient<'a> {
    pub fn new(arena: &'a ComponentArena, root: ComponentId, mode: SolverMode) -> Self {
        TreeClient {
            arena,
            root,
            mode,
            seq: 1,
        }
    }
}

impl SolverClient for TreeClient<'_> {
    fn size(&self) -> usize {
        self.arena.state_size(self.root, &self.mode)
    }

    fn residual(
        &mut self,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        cj: f64,
        resid: &mut [f64],
    ) -> i32 {
        self.seq += 1;
        let mut sd = StateData::new(time, state, Some(dstate), self.seq);
        sd.cj = cj;
        resid.fill(0.0);
        match self.arena.residual(self.root, &sd, resid, &self.mode) {
            Ok(()) => 0,
            Err(_) => SOLVER_INVALID_STATE_ERROR,
        }
    }

    fn jacobian(
        &mut self,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        cj: f64,
        jac: &mut TripletMatrix,
    ) -> i32 {
        self.seq += 1;
        let mut sd = StateData::new(time, state, Some(dstate), self.seq);
        sd.cj = cj;
        self.arena.jacobian_elements(self.root, &sd, jac, &self.mode);
        0
    }

    fn root_count(&self) -> usize {
        self.arena.root_size(self.root, &self.mode)
    }

    fn roots(&mut self, time: f64, state: &[f64], dstate: &[f64], out: &mut [f64]) -> i32 {
        self.seq += 1;
        let sd = StateData::new(time, state, Some(dstate), self.seq);
        out.fill(0.0);
        self.arena.root_test(self.root, &sd, out, &self.mode);
        0
    }

    fn variable_types(&self, out: &mut [f64]) {
        self.arena.variable_types(self.root, &self.mode, out);
    }
}

/// Client for the algebraic half of a partitioned solve: the differential
/// states and their derivatives come from the paired mode's vectors.
pub struct PartitionedAlgClient<'a> {
    pub arena: &'a ComponentArena,
    pub root: ComponentId,
    pub mode: SolverMode,
    pub diff_state: &'a [f64],
    pub diff_dstate: &'a [f64],
    pub diff_time: f64,
    pub seq: u64,
}

impl SolverClient for PartitionedAlgClient<'_> {
    fn size(&self) -> usize {
        self.arena.state_size(self.root, &self.mode)
    }

    fn residual(
        &mut self,
        time: f64,
        state: &[f64],
        _dstate: &[f64],
        cj: f64,
        resid: &mut [f64],
    ) -> i32 {
        self.seq += 1;
        let mut sd = StateData::new(time, state, Some(self.diff_dstate), self.seq);
        sd.cj = cj;
        sd.diff_state = Some(self.diff_state);
        sd.pair_index = self.mode.paired_offset_index;
        sd.alt_time = self.diff_time;
        resid.fill(0.0);
        match self.arena.residual(self.root, &sd, resid, &self.mode) {
            Ok(()) => 0,
            Err(_) => SOLVER_INVALID_STATE_ERROR,
        }
    }

    fn jacobian(
        &mut self,
        time: f64,
        state: &[f64],
        _dstate: &[f64],
        cj: f64,
        jac: &mut TripletMatrix,
    ) -> i32 {
        self.seq += 1;
        let mut sd = StateData::new(time, state, Some(self.diff_dstate), self.seq);
        sd.cj = cj;
        sd.diff_state = Some(self.diff_state);
        sd.pair_index = self.mode.paired_offset_index;
        sd.alt_time = self.diff_time;
        self.arena.jacobian_elements(self.root, &sd, jac, &self.mode);
        0
    }
}

/// Client for the differential half of a partitioned solve: the algebraic
/// states come from the paired mode's vector.
pub struct PartitionedDiffClient<'a> {
    pub arena: &'a ComponentArena,
    pub root: ComponentId,
    pub mode: SolverMode,
    pub alg_state: &'a [f64],
    pub alg_time: f64,
    pub seq: u64,
}

impl SolverClient for PartitionedDiffClient<'_> {
    fn size(&self) -> usize {
        self.arena.state_size(self.root, &self.mode)
    }

    fn residual(
        &mut self,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        cj: f64,
        resid: &mut [f64],
    ) -> i32 {
        self.seq += 1;
        let mut sd = StateData::new(time, state, Some(dstate), self.seq);
        sd.cj = cj;
        sd.alg_state = Some(self.alg_state);
        sd.pair_index = self.mode.paired_offset_index;
        sd.alt_time = self.alg_time;
        resid.fill(0.0);
        match self.arena.residual(self.root, &sd, resid, &self.mode) {
            Ok(()) => 0,
            Err(_) => SOLVER_INVALID_STATE_ERROR,
        }
    }

    fn jacobian(
        &mut self,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        cj: f64,
        jac: &mut TripletMatrix,
    ) -> i32 {
        self.seq += 1;
        let mut sd = StateData::new(time, state, Some(dstate), self.seq);
        sd.cj = cj;
        sd.alg_state = Some(self.alg_state);
        sd.pair_index = self.mode.paired_offset_index;
        sd.alt_time = self.alg_time;
        self.arena.jacobian_elements(self.root, &sd, jac, &self.mode);
        0
    }

    fn variable_types(&self, out: &mut [f64]) {
        // every variable of the differential half integrates
        out.fill(psd_core::DIFFERENTIAL_VARIABLE);
    }
}
