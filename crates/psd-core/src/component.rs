//! The component math contract and the tree-level aggregate operations.
//!
//! Every concrete model implements [`GridModel`]: size declaration, two-phase
//! initialization, state guessing and uptake, residual/derivative/Jacobian
//! and root evaluation, outputs, and parameter dispatch. Composite behavior
//! (size aggregation, offset distribution, recursive evaluation) lives on
//! [`ComponentArena`] so the per-kind code stays local.
//!
//! Mutating feedback from evaluation passes (trips, adjustments) is expressed
//! as [`GridAction`] values applied by the arena after the dispatch pass, so
//! evaluation itself never needs simultaneous mutable access to two
//! components.

use crate::arena::ComponentArena;
use crate::change::{ChangeCode, CheckLevel, ParamResult, ResetLevel};
use crate::error::PsdResult;
use crate::matrix::MatrixData;
use crate::models::{Area, Bus, BusType, Exciter, Generator, Governor, Link, Load, Relay};
use crate::object::{ComponentBase, ComponentId, OpFlag};
use crate::sizes::StateSizes;
use crate::solver_mode::{SolverMode, LOCAL_MODE};
use crate::sources::Source;
use crate::state_data::StateData;
use crate::units::Unit;

/// Immutable evaluation context: the arena plus the id of the component
/// being evaluated.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub arena: &'a ComponentArena,
    pub id: ComponentId,
}

impl<'a> EvalCtx<'a> {
    pub fn new(arena: &'a ComponentArena, id: ComponentId) -> Self {
        EvalCtx { arena, id }
    }

    #[inline]
    pub fn comp(&self) -> &'a Component {
        self.arena.expect(self.id)
    }

    #[inline]
    pub fn base(&self) -> &'a ComponentBase {
        &self.comp().base
    }

    #[inline]
    pub fn get(&self, id: ComponentId) -> Option<&'a Component> {
        self.arena.get(id)
    }

    /// Context for a different component in the same arena.
    pub fn for_id(&self, id: ComponentId) -> EvalCtx<'a> {
        EvalCtx {
            arena: self.arena,
            id,
        }
    }
}

/// Deferred mutation proposed by an evaluation or adjustment pass.
#[derive(Debug, Clone)]
pub enum GridAction {
    Disconnect(ComponentId),
    Reconnect(ComponentId),
    SetParam {
        target: ComponentId,
        name: String,
        value: f64,
    },
    SetBusType {
        target: ComponentId,
        bus_type: BusType,
        fixed_q: Option<f64>,
    },
    Alert {
        source: ComponentId,
        code: u32,
    },
}

impl GridAction {
    /// The change code applying this action will report.
    pub fn change_code(&self) -> ChangeCode {
        match self {
            GridAction::Disconnect(_) | GridAction::Reconnect(_) => ChangeCode::ObjectChange,
            GridAction::SetParam { .. } => ChangeCode::ParameterChange,
            GridAction::SetBusType { .. } => ChangeCode::JacobianChange,
            GridAction::Alert { code, .. } => crate::change::alert_change_code(*code),
        }
    }
}

/// Variable-class placement order used when distributing offsets.
///
/// All orderings group states by class with subtree-contiguous ranges per
/// class; they differ in which class block comes first. `Mixed` is the
/// default natural order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetOrdering {
    #[default]
    Mixed,
    Grouped,
    AlgebraicGrouped,
    VoltageFirst,
    AngleFirst,
    DifferentialFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VarClass {
    V,
    A,
    Alg,
    Diff,
}

impl OffsetOrdering {
    fn class_order(self) -> [VarClass; 4] {
        match self {
            OffsetOrdering::Mixed | OffsetOrdering::Grouped | OffsetOrdering::VoltageFirst => {
                [VarClass::V, VarClass::A, VarClass::Alg, VarClass::Diff]
            }
            OffsetOrdering::AngleFirst => [VarClass::A, VarClass::V, VarClass::Alg, VarClass::Diff],
            OffsetOrdering::AlgebraicGrouped => {
                [VarClass::Alg, VarClass::V, VarClass::A, VarClass::Diff]
            }
            OffsetOrdering::DifferentialFirst => {
                [VarClass::Diff, VarClass::V, VarClass::A, VarClass::Alg]
            }
        }
    }
}

/// Marker written into variable-type arrays for differential variables.
pub const DIFFERENTIAL_VARIABLE: f64 = 1.0;
/// Marker written into variable-type arrays for algebraic variables.
pub const ALGEBRAIC_VARIABLE: f64 = 0.0;

/// The mathematical contract every component model implements.
///
/// Size-declaration results may depend on the component's own parameters but
/// never on peers. Evaluation methods write only into this component's
/// offset ranges.
#[allow(unused_variables)]
pub trait GridModel {
    fn type_name(&self) -> &'static str;

    /// State counts for this component alone in the given mode.
    fn local_state_sizes(&self, base: &ComponentBase, mode: &SolverMode) -> StateSizes;

    /// Upper bound on Jacobian entries this component will emit.
    fn local_jacobian_count(&self, base: &ComponentBase, mode: &SolverMode) -> usize {
        0
    }

    /// Root counts `(algebraic, differential)` for this component alone.
    fn local_root_count(&self, base: &ComponentBase, mode: &SolverMode) -> (usize, usize) {
        (0, 0)
    }

    fn pflow_init_a(&mut self, base: &mut ComponentBase, time0: f64, flags: u32) {}
    fn pflow_init_b(&mut self, base: &mut ComponentBase, inputs: &[f64]) {}
    fn dyn_init_a(&mut self, base: &mut ComponentBase, time0: f64, flags: u32) {}
    fn dyn_init_b(&mut self, base: &mut ComponentBase, inputs: &[f64]) {}

    /// Write this component's initial guess into the global arrays at its
    /// assigned offsets. An empty `dstate` slice means derivatives are not
    /// wanted.
    fn guess_state(
        &self,
        ctx: &EvalCtx,
        time: f64,
        state: &mut [f64],
        dstate: &mut [f64],
        mode: &SolverMode,
    ) {
    }

    /// Read the global arrays back, refreshing cached quantities.
    fn set_state(
        &mut self,
        base: &mut ComponentBase,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        mode: &SolverMode,
    ) {
    }

    /// Write residual contributions at this component's offsets; zero when
    /// the equations are satisfied.
    fn residual(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        resid: &mut [f64],
        mode: &SolverMode,
    ) -> PsdResult<()> {
        Ok(())
    }

    /// Write `dx/dt` at this component's differential offsets.
    fn derivative(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        deriv: &mut [f64],
        mode: &SolverMode,
    ) -> PsdResult<()> {
        Ok(())
    }

    /// Write a relaxed new guess for this component's algebraic variables;
    /// `alpha` in [0,1] blends toward the update.
    fn algebraic_update(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        update: &mut [f64],
        mode: &SolverMode,
        alpha: f64,
    ) {
    }

    /// Append `(row, col, value)` Jacobian triplets. For residual rows the
    /// entry is `d f / d x_j`; for derivative rows `d f / d x_j - cj`
    /// on the diagonal, with `cj` from the state data.
    fn jacobian_elements(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        md: &mut dyn MatrixData,
        input_locs: &[usize],
        mode: &SolverMode,
    ) {
    }

    /// Partial derivatives of outputs with respect to inputs.
    fn io_partial_derivatives(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        md: &mut dyn MatrixData,
        input_locs: &[usize],
        mode: &SolverMode,
    ) {
    }

    /// Partial derivatives of outputs with respect to this component's
    /// states.
    fn output_partial_derivatives(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        md: &mut dyn MatrixData,
        mode: &SolverMode,
    ) {
    }

    /// Write continuous root functions whose sign changes mark events.
    fn root_test(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        roots: &mut [f64],
        mode: &SolverMode,
    ) {
    }

    /// React to a solver-reported crossing. `root_mask` covers this
    /// component's root range only.
    fn root_trigger(
        &mut self,
        base: &mut ComponentBase,
        time: f64,
        inputs: &[f64],
        root_mask: &[bool],
        mode: &SolverMode,
    ) -> (ChangeCode, Vec<GridAction>) {
        (ChangeCode::NoChange, Vec::new())
    }

    /// Re-evaluate root conditions at a static state after a reset.
    fn root_check(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        level: CheckLevel,
    ) -> (ChangeCode, Vec<GridAction>) {
        (ChangeCode::NoChange, Vec::new())
    }

    /// Semantic outputs of the component (for a bus: `[P, Q]`).
    fn outputs(&self, ctx: &EvalCtx, inputs: &[f64], sd: &StateData, mode: &SolverMode)
        -> Vec<f64> {
        Vec::new()
    }

    /// Read a single output from the cached local state.
    fn output(&self, base: &ComponentBase, index: usize) -> f64 {
        0.0
    }

    /// Time derivative of an output.
    fn dout_dt(
        &self,
        ctx: &EvalCtx,
        inputs: &[f64],
        sd: &StateData,
        mode: &SolverMode,
        index: usize,
    ) -> f64 {
        0.0
    }

    /// Advance the component locally when the driver is not integrating its
    /// states. Returns the primary output after the step.
    fn timestep(
        &mut self,
        base: &mut ComponentBase,
        time: f64,
        inputs: &[f64],
        mode: &SolverMode,
    ) -> f64 {
        base.prev_time = time;
        self.output(base, 0)
    }

    /// Propose power-flow adjustments at the requested check level.
    fn power_flow_adjust(
        &self,
        ctx: &EvalCtx,
        flags: u32,
        level: CheckLevel,
    ) -> (ChangeCode, Vec<GridAction>) {
        (ChangeCode::NoChange, Vec::new())
    }

    /// Reset internal state to a given depth.
    fn reset(&mut self, base: &mut ComponentBase, level: ResetLevel) {}

    fn set_param(
        &mut self,
        base: &mut ComponentBase,
        name: &str,
        value: f64,
        unit: Unit,
    ) -> ParamResult {
        ParamResult::NotRecognized
    }

    fn set_param_str(&mut self, base: &mut ComponentBase, name: &str, value: &str) -> ParamResult {
        ParamResult::NotRecognized
    }

    fn set_flag(&mut self, base: &mut ComponentBase, name: &str, value: bool) -> ParamResult {
        ParamResult::NotRecognized
    }

    fn get_param(&self, base: &ComponentBase, name: &str, unit: Unit) -> Option<f64> {
        None
    }

    fn get_string(&self, base: &ComponentBase, name: &str) -> Option<String> {
        None
    }
}

/// Tagged component variant.
#[derive(Debug, Clone)]
pub enum ComponentKind {
    Area(Area),
    Bus(Bus),
    Link(Link),
    Generator(Generator),
    Governor(Governor),
    Exciter(Exciter),
    Load(Load),
    Relay(Relay),
    Source(Source),
}

impl ComponentKind {
    pub fn model(&self) -> &dyn GridModel {
        match self {
            ComponentKind::Area(m) => m,
            ComponentKind::Bus(m) => m,
            ComponentKind::Link(m) => m,
            ComponentKind::Generator(m) => m,
            ComponentKind::Governor(m) => m,
            ComponentKind::Exciter(m) => m,
            ComponentKind::Load(m) => m,
            ComponentKind::Relay(m) => m,
            ComponentKind::Source(m) => m,
        }
    }

    pub fn model_mut(&mut self) -> &mut dyn GridModel {
        match self {
            ComponentKind::Area(m) => m,
            ComponentKind::Bus(m) => m,
            ComponentKind::Link(m) => m,
            ComponentKind::Generator(m) => m,
            ComponentKind::Governor(m) => m,
            ComponentKind::Exciter(m) => m,
            ComponentKind::Load(m) => m,
            ComponentKind::Relay(m) => m,
            ComponentKind::Source(m) => m,
        }
    }
}

/// A node in the component tree: shared bookkeeping plus the tagged model.
#[derive(Debug, Clone)]
pub struct Component {
    pub base: ComponentBase,
    pub kind: ComponentKind,
}

impl Component {
    pub fn new(name: impl Into<String>, kind: ComponentKind) -> Self {
        Component {
            base: ComponentBase::new(name),
            kind,
        }
    }
}

impl ComponentArena {
    /// Load state sizes for a mode, children first. Skips components whose
    /// counts are already loaded; call one of the unload operations first to
    /// force a refresh.
    pub fn load_state_sizes(&mut self, root: ComponentId, mode: &SolverMode) {
        for id in self.subtree_post_order(root) {
            if self
                .expect(id)
                .base
                .offsets
                .is_state_count_loaded(mode)
            {
                continue;
            }
            let child_totals: Vec<StateSizes> = self
                .children(id)
                .into_iter()
                .map(|c| {
                    self.expect(c)
                        .base
                        .offsets
                        .get(mode)
                        .map_or_else(StateSizes::default, |so| so.total)
                })
                .collect();
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            let local = if base.is_connected() {
                kind.model().local_state_sizes(base, mode)
            } else {
                StateSizes::default()
            };
            let so = base.offsets.get_mut(mode);
            so.local.alg = local.alg;
            so.local.diff = local.diff;
            so.local.v = local.v;
            so.local.a = local.a;
            so.total.state_reset();
            let own = so.local;
            so.total.add_states(&own);
            for ct in &child_totals {
                so.total.add_states(ct);
            }
            so.state_loaded = true;
        }
    }

    /// Load root counts for a mode, children first.
    pub fn load_root_sizes(&mut self, root: ComponentId, mode: &SolverMode) {
        for id in self.subtree_post_order(root) {
            if self.expect(id).base.offsets.is_root_count_loaded(mode) {
                continue;
            }
            let child_totals: Vec<StateSizes> = self
                .children(id)
                .into_iter()
                .map(|c| {
                    self.expect(c)
                        .base
                        .offsets
                        .get(mode)
                        .map_or_else(StateSizes::default, |so| so.total)
                })
                .collect();
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            let (alg_roots, diff_roots) = if base.is_connected() {
                kind.model().local_root_count(base, mode)
            } else {
                (0, 0)
            };
            if alg_roots + diff_roots > 0 {
                base.flags.set(OpFlag::HasRoots, true);
                if alg_roots > 0 {
                    base.flags.set(OpFlag::HasAlgRoots, true);
                }
            }
            let so = base.offsets.get_mut(mode);
            so.local.alg_roots = alg_roots;
            so.local.diff_roots = diff_roots;
            so.total.root_reset();
            let own = so.local;
            so.total.add_roots(&own);
            for ct in &child_totals {
                so.total.add_roots(ct);
            }
            so.roots_loaded = true;
        }
    }

    /// Load Jacobian entry bounds for a mode, children first.
    pub fn load_jacobian_sizes(&mut self, root: ComponentId, mode: &SolverMode) {
        for id in self.subtree_post_order(root) {
            if self.expect(id).base.offsets.is_jacobian_count_loaded(mode) {
                continue;
            }
            let child_jac: usize = self
                .children(id)
                .into_iter()
                .map(|c| {
                    self.expect(c)
                        .base
                        .offsets
                        .get(mode)
                        .map_or(0, |so| so.total.jac)
                })
                .sum();
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            let local_jac = if base.is_connected() {
                kind.model().local_jacobian_count(base, mode)
            } else {
                0
            };
            let so = base.offsets.get_mut(mode);
            so.local.jac = local_jac;
            so.total.jac = local_jac + child_jac;
            so.jacobian_loaded = true;
        }
    }

    /// Load all three size families.
    pub fn load_sizes(&mut self, root: ComponentId, mode: &SolverMode) {
        self.load_state_sizes(root, mode);
        self.load_root_sizes(root, mode);
        self.load_jacobian_sizes(root, mode);
    }

    /// Total state size of the subtree in a mode (state sizes must be
    /// loaded).
    pub fn state_size(&self, root: ComponentId, mode: &SolverMode) -> usize {
        self.expect(root).base.state_size(mode)
    }

    /// Total root-function count of the subtree in a mode.
    pub fn root_size(&self, root: ComponentId, mode: &SolverMode) -> usize {
        self.expect(root).base.root_size(mode)
    }

    /// Total Jacobian entry bound of the subtree in a mode.
    pub fn jacobian_size(&self, root: ComponentId, mode: &SolverMode) -> usize {
        self.expect(root)
            .base
            .offsets
            .get(mode)
            .map_or(0, |so| so.total.jac)
    }

    /// Distribute state offsets over the subtree so that each component's
    /// per-class ranges are contiguous and disjoint from its siblings'.
    /// Returns the first index past the subtree.
    pub fn assign_offsets(
        &mut self,
        root: ComponentId,
        start: usize,
        mode: &SolverMode,
        ordering: OffsetOrdering,
    ) -> usize {
        let totals = self
            .expect(root)
            .base
            .offsets
            .get(mode)
            .map_or_else(StateSizes::default, |so| so.total);
        let mut bases = [0usize; 4]; // indexed by VarClass discriminant order v,a,alg,diff
        let mut cursor = start;
        for class in ordering.class_order() {
            let (slot, count) = match class {
                VarClass::V => (0, totals.v),
                VarClass::A => (1, totals.a),
                VarClass::Alg => (2, totals.alg),
                VarClass::Diff => (3, totals.diff),
            };
            bases[slot] = cursor;
            cursor += count;
        }
        self.place_offsets(root, bases[0], bases[1], bases[2], bases[3], mode);
        start + totals.total()
    }

    fn place_offsets(
        &mut self,
        id: ComponentId,
        mut v: usize,
        mut a: usize,
        mut alg: usize,
        mut diff: usize,
        mode: &SolverMode,
    ) {
        let children = self.children(id);
        {
            let so = self.expect_mut(id).base.offsets.get_mut(mode);
            so.set_category_offsets(v, a, alg, diff);
            v += so.local.v;
            a += so.local.a;
            alg += so.local.alg;
            diff += so.local.diff;
        }
        for child in children {
            let ct = self
                .expect(child)
                .base
                .offsets
                .get(mode)
                .map_or_else(StateSizes::default, |so| so.total);
            self.place_offsets(child, v, a, alg, diff, mode);
            v += ct.v;
            a += ct.a;
            alg += ct.alg;
            diff += ct.diff;
        }
    }

    /// Distribute root-function offsets (pre-order, local roots first).
    /// Returns the first index past the subtree.
    pub fn assign_root_offsets(
        &mut self,
        root: ComponentId,
        start: usize,
        mode: &SolverMode,
    ) -> usize {
        let mut cursor = start;
        self.place_root_offsets(root, &mut cursor, mode);
        cursor
    }

    fn place_root_offsets(&mut self, id: ComponentId, cursor: &mut usize, mode: &SolverMode) {
        let children = self.children(id);
        {
            let so = self.expect_mut(id).base.offsets.get_mut(mode);
            so.root_offset = (so.total.total_roots() > 0).then_some(*cursor);
            *cursor += so.local.total_roots();
        }
        for child in children {
            self.place_root_offsets(child, cursor, mode);
        }
    }

    /// Write initial guesses for the whole subtree, children first.
    pub fn guess_state(
        &self,
        root: ComponentId,
        time: f64,
        state: &mut [f64],
        dstate: &mut [f64],
        mode: &SolverMode,
    ) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            comp.kind.model().guess_state(&ctx, time, state, dstate, mode);
        }
    }

    /// Push solved state back into the components, children first.
    pub fn set_state(
        &mut self,
        root: ComponentId,
        time: f64,
        state: &[f64],
        dstate: &[f64],
        mode: &SolverMode,
    ) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect_mut(id);
            if !comp.base.is_connected() {
                continue;
            }
            let Component { base, kind } = comp;
            kind.model_mut().set_state(base, time, state, dstate, mode);
            base.prev_time = time;
        }
    }

    /// Evaluate residual contributions over the subtree, children first.
    pub fn residual(
        &self,
        root: ComponentId,
        sd: &StateData,
        resid: &mut [f64],
        mode: &SolverMode,
    ) -> PsdResult<()> {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            comp.kind.model().residual(&ctx, &[], sd, resid, mode)?;
        }
        Ok(())
    }

    /// Evaluate derivative contributions over the subtree.
    pub fn derivative(
        &self,
        root: ComponentId,
        sd: &StateData,
        deriv: &mut [f64],
        mode: &SolverMode,
    ) -> PsdResult<()> {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            comp.kind.model().derivative(&ctx, &[], sd, deriv, mode)?;
        }
        Ok(())
    }

    /// Evaluate algebraic updates over the subtree.
    pub fn algebraic_update(
        &self,
        root: ComponentId,
        sd: &StateData,
        update: &mut [f64],
        mode: &SolverMode,
        alpha: f64,
    ) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            comp.kind
                .model()
                .algebraic_update(&ctx, &[], sd, update, mode, alpha);
        }
    }

    /// Collect Jacobian triplets over the subtree.
    pub fn jacobian_elements(
        &self,
        root: ComponentId,
        sd: &StateData,
        md: &mut dyn MatrixData,
        mode: &SolverMode,
    ) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            comp.kind
                .model()
                .jacobian_elements(&ctx, &[], sd, md, &[], mode);
        }
    }

    /// Evaluate root functions over the subtree.
    pub fn root_test(
        &self,
        root: ComponentId,
        sd: &StateData,
        roots: &mut [f64],
        mode: &SolverMode,
    ) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() || !comp.base.flags.get(OpFlag::HasRoots) {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            comp.kind.model().root_test(&ctx, &[], sd, roots, mode);
        }
    }

    /// Fire `root_trigger` on every component whose mask range contains a
    /// crossing, apply the proposed actions, and return the combined code.
    pub fn root_trigger(
        &mut self,
        root: ComponentId,
        time: f64,
        root_mask: &[bool],
        mode: &SolverMode,
    ) -> ChangeCode {
        let mut code = ChangeCode::NoChange;
        let mut all_actions = Vec::new();
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() || !comp.base.flags.get(OpFlag::HasRoots) {
                continue;
            }
            let (offset, count) = match comp.base.offsets.get(mode) {
                Some(so) => (so.root_offset, so.local.total_roots()),
                None => (None, 0),
            };
            let Some(offset) = offset else { continue };
            if count == 0 || offset + count > root_mask.len() {
                continue;
            }
            let local_mask = &root_mask[offset..offset + count];
            if !local_mask.iter().any(|&m| m) {
                continue;
            }
            let local_mask = local_mask.to_vec();
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            let (c, actions) =
                kind.model_mut()
                    .root_trigger(base, time, &[], &local_mask, mode);
            code = code.max_with(c);
            all_actions.extend(actions);
        }
        code.max_with(self.apply_actions(all_actions))
    }

    /// Re-evaluate root conditions statically, apply resulting actions.
    pub fn root_check(
        &mut self,
        root: ComponentId,
        sd: &StateData,
        level: CheckLevel,
    ) -> ChangeCode {
        let mut code = ChangeCode::NoChange;
        let mut all_actions = Vec::new();
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            let (c, actions) = comp.kind.model().root_check(&ctx, &[], sd, level);
            code = code.max_with(c);
            all_actions.extend(actions);
        }
        code.max_with(self.apply_actions(all_actions))
    }

    /// Propose and apply power-flow adjustments over the subtree.
    pub fn power_flow_adjust(
        &mut self,
        root: ComponentId,
        flags: u32,
        level: CheckLevel,
    ) -> ChangeCode {
        let mut code = ChangeCode::NoChange;
        let mut all_actions = Vec::new();
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            let ctx = EvalCtx::new(self, id);
            let (c, actions) = comp.kind.model().power_flow_adjust(&ctx, flags, level);
            code = code.max_with(c);
            all_actions.extend(actions);
        }
        code.max_with(self.apply_actions(all_actions))
    }

    /// Mark differential variable positions with [`DIFFERENTIAL_VARIABLE`].
    pub fn variable_types(&self, root: ComponentId, mode: &SolverMode, out: &mut [f64]) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            if !comp.base.is_connected() {
                continue;
            }
            if let Some(so) = comp.base.offsets.get(mode) {
                if let Some(diff_off) = so.diff_offset {
                    for k in 0..so.local.diff {
                        if diff_off + k < out.len() {
                            out[diff_off + k] = DIFFERENTIAL_VARIABLE;
                        }
                    }
                }
            }
        }
    }

    /// Advance every component locally to `time` (used when the driver is
    /// not integrating their states).
    pub fn timestep(&mut self, root: ComponentId, time: f64, mode: &SolverMode) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect_mut(id);
            if !comp.base.is_connected() {
                continue;
            }
            let Component { base, kind } = comp;
            kind.model_mut().timestep(base, time, &[], mode);
        }
    }

    /// Refresh cross-component caches (terminal voltage readings on
    /// generators, loads, and relays) from the bus models.
    pub fn refresh_caches(&mut self, root: ComponentId) {
        let mut readings: Vec<(ComponentId, f64, f64)> = Vec::new();
        for id in self.subtree_post_order(root) {
            let comp = self.expect(id);
            let Some(parent) = comp.base.parent else {
                continue;
            };
            if let Some(ComponentKind::Bus(bus)) = self.get(parent).map(|c| &c.kind) {
                readings.push((id, bus.voltage, bus.angle));
            }
        }
        for (id, v, theta) in readings {
            match &mut self.expect_mut(id).kind {
                ComponentKind::Generator(gen) => {
                    gen.bus_voltage = v;
                    gen.bus_angle = theta;
                }
                ComponentKind::Load(load) => {
                    load.bus_voltage = v;
                }
                _ => {}
            }
        }
    }

    /// Apply deferred actions, returning the strongest resulting code.
    pub fn apply_actions(&mut self, actions: Vec<GridAction>) -> ChangeCode {
        let mut code = ChangeCode::NoChange;
        for action in actions {
            code = code.max_with(action.change_code());
            match action {
                GridAction::Disconnect(id) => self.disconnect(id),
                GridAction::Reconnect(id) => self.reconnect(id),
                GridAction::SetParam {
                    target,
                    name,
                    value,
                } => {
                    let _ = self.set_param(target, &name, value, Unit::PerUnit);
                }
                GridAction::SetBusType {
                    target,
                    bus_type,
                    fixed_q,
                } => {
                    if let Some(ComponentKind::Bus(bus)) =
                        self.get_mut(target).map(|c| &mut c.kind)
                    {
                        bus.bus_type = bus_type;
                        bus.fixed_q = fixed_q;
                    }
                }
                GridAction::Alert { source, code: alert } => self.alert(source, alert),
            }
        }
        code
    }

    /// Phase A of power-flow initialization: per-component setup plus local
    /// size declaration and cache allocation.
    pub fn pflow_init_a(&mut self, root: ComponentId, time0: f64, flags: u32) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            kind.model_mut().pflow_init_a(base, time0, flags);
            let local = kind.model().local_state_sizes(base, &LOCAL_MODE);
            let slot = base.offsets.local_mut();
            slot.local = local;
            slot.local_load_all(true);
            base.allocate_local_cache();
            base.flags.set(OpFlag::PflowInitialized, true);
            base.prev_time = time0;
        }
    }

    /// Phase B of power-flow initialization: numeric seeding.
    pub fn pflow_init_b(&mut self, root: ComponentId) {
        for id in self.subtree_post_order(root) {
            let inputs = self.collect_init_inputs(id);
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            kind.model_mut().pflow_init_b(base, &inputs);
        }
    }

    /// Phase A of dynamic initialization.
    pub fn dyn_init_a(&mut self, root: ComponentId, time0: f64, flags: u32) {
        for id in self.subtree_post_order(root) {
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            kind.model_mut().dyn_init_a(base, time0, flags);
            let local = kind.model().local_state_sizes(base, &LOCAL_MODE);
            let slot = base.offsets.local_mut();
            slot.local = local;
            slot.local_load_all(true);
            base.allocate_local_cache();
            base.flags.set(OpFlag::DynInitialized, true);
        }
    }

    /// Phase B of dynamic initialization: initial conditions, parents first
    /// so sub-models see their owner's operating point.
    pub fn dyn_init_b(&mut self, root: ComponentId) {
        let mut pre_order = self.subtree_post_order(root);
        pre_order.reverse();
        for id in pre_order {
            let inputs = self.collect_init_inputs(id);
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            kind.model_mut().dyn_init_b(base, &inputs);
        }
    }

    /// Gather the operating-point inputs a component's initialization wants
    /// from its surroundings.
    fn collect_init_inputs(&self, id: ComponentId) -> Vec<f64> {
        let comp = self.expect(id);
        let parent = comp.base.parent;
        match &comp.kind {
            ComponentKind::Generator(_) | ComponentKind::Load(_) | ComponentKind::Relay(_) => {
                if let Some(ComponentKind::Bus(bus)) =
                    parent.and_then(|p| self.get(p)).map(|c| &c.kind)
                {
                    vec![bus.voltage, bus.angle]
                } else {
                    Vec::new()
                }
            }
            ComponentKind::Governor(_) | ComponentKind::Exciter(_) => {
                if let Some(ComponentKind::Generator(gen)) =
                    parent.and_then(|p| self.get(p)).map(|c| &c.kind)
                {
                    vec![gen.mech_power, gen.field_voltage, gen.bus_voltage]
                } else {
                    Vec::new()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Two-step parameter dispatch: dotted paths address children; a flat
    /// name is offered to the component, then to common base parameters,
    /// then depth-first to sub-objects.
    pub fn set_param(
        &mut self,
        id: ComponentId,
        name: &str,
        value: f64,
        unit: Unit,
    ) -> PsdResult<()> {
        if let Some((head, rest)) = name.split_once('.') {
            let child = self
                .find(id, head)
                .ok_or_else(|| crate::error::PsdError::UnrecognizedParameter(name.to_string()))?;
            return self.set_param(child, rest, value, unit);
        }
        let lname = name.to_ascii_lowercase();
        {
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            match kind.model_mut().set_param(base, &lname, value, unit) {
                ParamResult::Recognized => return Ok(()),
                ParamResult::Invalid => {
                    return Err(crate::error::PsdError::InvalidParameterValue(
                        name.to_string(),
                    ))
                }
                ParamResult::NotRecognized => {}
            }
            match lname.as_str() {
                "basepower" => {
                    base.base_power = value;
                    return Ok(());
                }
                "basefrequency" | "basefreq" => {
                    base.base_frequency = value;
                    return Ok(());
                }
                "basevoltage" => {
                    base.base_voltage = value;
                    return Ok(());
                }
                _ => {}
            }
        }
        for child in self.children(id) {
            if self.set_param(child, &lname, value, unit).is_ok() {
                return Ok(());
            }
        }
        Err(crate::error::PsdError::UnrecognizedParameter(
            name.to_string(),
        ))
    }

    /// String parameter dispatch with the same resolution rules.
    pub fn set_param_str(&mut self, id: ComponentId, name: &str, value: &str) -> PsdResult<()> {
        if let Some((head, rest)) = name.split_once('.') {
            let child = self
                .find(id, head)
                .ok_or_else(|| crate::error::PsdError::UnrecognizedParameter(name.to_string()))?;
            return self.set_param_str(child, rest, value);
        }
        let lname = name.to_ascii_lowercase();
        {
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            match kind.model_mut().set_param_str(base, &lname, value) {
                ParamResult::Recognized => return Ok(()),
                ParamResult::Invalid => {
                    return Err(crate::error::PsdError::InvalidParameterValue(
                        name.to_string(),
                    ))
                }
                ParamResult::NotRecognized => {}
            }
            if lname == "name" {
                base.name = value.to_string();
                return Ok(());
            }
        }
        for child in self.children(id) {
            if self.set_param_str(child, &lname, value).is_ok() {
                return Ok(());
            }
        }
        Err(crate::error::PsdError::UnrecognizedParameter(
            name.to_string(),
        ))
    }

    /// Flag dispatch with the same resolution rules.
    pub fn set_flag(&mut self, id: ComponentId, name: &str, value: bool) -> PsdResult<()> {
        let lname = name.to_ascii_lowercase();
        {
            let comp = self.expect_mut(id);
            let Component { base, kind } = comp;
            match kind.model_mut().set_flag(base, &lname, value) {
                ParamResult::Recognized => return Ok(()),
                ParamResult::Invalid => {
                    return Err(crate::error::PsdError::InvalidParameterValue(
                        name.to_string(),
                    ))
                }
                ParamResult::NotRecognized => {}
            }
            match lname.as_str() {
                "enabled" => {
                    base.enabled = value;
                    return Ok(());
                }
                "disconnected" => {
                    base.flags.set(OpFlag::Disconnected, value);
                    return Ok(());
                }
                _ => {}
            }
        }
        for child in self.children(id) {
            if self.set_flag(child, &lname, value).is_ok() {
                return Ok(());
            }
        }
        Err(crate::error::PsdError::UnrecognizedParameter(
            name.to_string(),
        ))
    }

    /// Read a named value; dotted paths address children.
    pub fn get_param(&self, id: ComponentId, name: &str, unit: Unit) -> Option<f64> {
        if let Some((head, rest)) = name.split_once('.') {
            let child = self.find(id, head)?;
            return self.get_param(child, rest, unit);
        }
        let lname = name.to_ascii_lowercase();
        let comp = self.expect(id);
        if let Some(v) = comp.kind.model().get_param(&comp.base, &lname, unit) {
            return Some(v);
        }
        match lname.as_str() {
            "basepower" => Some(comp.base.base_power),
            "basefrequency" | "basefreq" => Some(comp.base.base_frequency),
            "basevoltage" => Some(comp.base.base_voltage),
            _ => None,
        }
    }

    /// Read a named string value.
    pub fn get_string(&self, id: ComponentId, name: &str) -> Option<String> {
        let lname = name.to_ascii_lowercase();
        let comp = self.expect(id);
        if let Some(v) = comp.kind.model().get_string(&comp.base, &lname) {
            return Some(v);
        }
        match lname.as_str() {
            "name" => Some(comp.base.name.clone()),
            "type" => Some(comp.kind.model().type_name().to_string()),
            _ => None,
        }
    }

    /// Broadcast a parameter to every component of a type in the subtree.
    pub fn set_all(&mut self, root: ComponentId, type_name: &str, param: &str, value: f64) {
        for id in self.subtree_post_order(root) {
            let is_type = self
                .get(id)
                .is_some_and(|c| c.kind.model().type_name().eq_ignore_ascii_case(type_name));
            if is_type {
                let _ = self.set_param(id, param, value, Unit::PerUnit);
            }
        }
    }

    /// Unload size information for every component in the subtree.
    pub fn unload(&mut self, root: ComponentId, dynamic_only: bool) {
        for id in self.subtree_post_order(root) {
            self.expect_mut(id).base.offsets.unload(dynamic_only);
        }
    }

    /// Unload only state counts for every component in the subtree.
    pub fn state_unload(&mut self, root: ComponentId, dynamic_only: bool) {
        for id in self.subtree_post_order(root) {
            self.expect_mut(id).base.offsets.state_unload(dynamic_only);
        }
    }

    /// Unload only root counts for every component in the subtree.
    pub fn root_unload(&mut self, root: ComponentId, dynamic_only: bool) {
        for id in self.subtree_post_order(root) {
            self.expect_mut(id).base.offsets.root_unload(dynamic_only);
        }
    }

    /// Unload only Jacobian counts for every component in the subtree.
    pub fn jacobian_unload(&mut self, root: ComponentId, dynamic_only: bool) {
        for id in self.subtree_post_order(root) {
            self.expect_mut(id)
                .base
                .offsets
                .jacobian_unload(dynamic_only);
        }
    }

    /// Single-component outputs under a snapshot.
    pub fn outputs(&self, id: ComponentId, sd: &StateData, mode: &SolverMode) -> Vec<f64> {
        let ctx = EvalCtx::new(self, id);
        self.expect(id).kind.model().outputs(&ctx, &[], sd, mode)
    }

    /// Single-component cached output.
    pub fn output(&self, id: ComponentId, index: usize) -> f64 {
        let comp = self.expect(id);
        comp.kind.model().output(&comp.base, index)
    }
}
