//! State-count and offset bookkeeping for a single solver mode.

use crate::solver_mode::SolverMode;
use serde::{Deserialize, Serialize};

/// State, root, and Jacobian counts for one component in one mode.
///
/// State counts, root counts, and the Jacobian bound refresh independently:
/// state changes are common, root-count changes are rarer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSizes {
    /// Number of generic algebraic variables
    pub alg: usize,
    /// Number of differential variables
    pub diff: usize,
    /// Number of voltage variables
    pub v: usize,
    /// Number of angle variables
    pub a: usize,
    /// Number of roots on algebraic states
    pub alg_roots: usize,
    /// Number of roots on purely differential states
    pub diff_roots: usize,
    /// Upper bound on Jacobian nonzero entries
    pub jac: usize,
}

impl StateSizes {
    /// Total number of state variables.
    #[inline]
    pub fn total(&self) -> usize {
        self.alg + self.diff + self.v + self.a
    }

    /// Total number of root functions.
    #[inline]
    pub fn total_roots(&self) -> usize {
        self.alg_roots + self.diff_roots
    }

    /// Number of algebraic-class variables (generic + voltage + angle).
    #[inline]
    pub fn algebraic_total(&self) -> usize {
        self.alg + self.v + self.a
    }

    pub fn reset(&mut self) {
        *self = StateSizes::default();
    }

    pub fn state_reset(&mut self) {
        self.alg = 0;
        self.diff = 0;
        self.v = 0;
        self.a = 0;
    }

    pub fn root_reset(&mut self) {
        self.alg_roots = 0;
        self.diff_roots = 0;
    }

    pub fn jacobian_reset(&mut self) {
        self.jac = 0;
    }

    /// Fold another size record into this one (all counters).
    pub fn add(&mut self, other: &StateSizes) {
        self.add_states(other);
        self.add_roots(other);
        self.add_jacobian(other);
    }

    /// Fold in just the state counts.
    pub fn add_states(&mut self, other: &StateSizes) {
        self.alg += other.alg;
        self.diff += other.diff;
        self.v += other.v;
        self.a += other.a;
    }

    /// Fold in just the root counts.
    pub fn add_roots(&mut self, other: &StateSizes) {
        self.alg_roots += other.alg_roots;
        self.diff_roots += other.diff_roots;
    }

    /// Fold in just the Jacobian bound.
    pub fn add_jacobian(&mut self, other: &StateSizes) {
        self.jac += other.jac;
    }
}

/// Offsets and size records for one component in one solver mode.
///
/// `local` counts this component alone; `total` counts this component plus
/// all descendants. `None` offsets mark variable classes not present in the
/// mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SolverOffsets {
    pub alg_offset: Option<usize>,
    pub diff_offset: Option<usize>,
    pub v_offset: Option<usize>,
    pub a_offset: Option<usize>,
    pub root_offset: Option<usize>,

    pub state_loaded: bool,
    pub jacobian_loaded: bool,
    pub roots_loaded: bool,

    /// The mode this column serves
    pub mode: SolverMode,

    /// Sizes for this component plus all descendants
    pub total: StateSizes,
    /// Sizes for this component alone
    pub local: StateSizes,
}

impl SolverOffsets {
    pub fn new(mode: SolverMode) -> Self {
        SolverOffsets {
            mode,
            ..Default::default()
        }
    }

    /// Reset everything, keeping only the mode tag.
    pub fn reset(&mut self) {
        let mode = self.mode;
        *self = SolverOffsets::new(mode);
    }

    pub fn state_reset(&mut self) {
        self.alg_offset = None;
        self.diff_offset = None;
        self.v_offset = None;
        self.a_offset = None;
        self.total.state_reset();
        self.local.state_reset();
        self.state_loaded = false;
    }

    pub fn root_count_reset(&mut self) {
        self.root_offset = None;
        self.total.root_reset();
        self.local.root_reset();
        self.roots_loaded = false;
    }

    pub fn jacobian_count_reset(&mut self) {
        self.total.jacobian_reset();
        self.local.jacobian_reset();
        self.jacobian_loaded = false;
    }

    /// Derive all sub-offsets from a single base in the order v, a, alg,
    /// diff, using the `total` sizes. Voltage and angle offsets are nulled
    /// when their counts are zero.
    pub fn set_offset(&mut self, base: usize) {
        let v_base = base;
        let a_base = v_base + self.total.v;
        let alg_base = a_base + self.total.a;
        let diff_base = alg_base + self.total.alg;
        self.v_offset = (self.total.v > 0).then_some(v_base);
        self.a_offset = (self.total.a > 0).then_some(a_base);
        self.alg_offset = Some(alg_base);
        self.diff_offset = Some(diff_base);
    }

    /// Place each variable class at an explicit base, nulling voltage and
    /// angle offsets when their counts are zero.
    pub fn set_category_offsets(&mut self, v: usize, a: usize, alg: usize, diff: usize) {
        self.v_offset = (self.total.v > 0).then_some(v);
        self.a_offset = (self.total.a > 0).then_some(a);
        self.alg_offset = Some(alg);
        self.diff_offset = Some(diff);
    }

    /// Copy the offsets (not the sizes) from another record.
    pub fn set_offsets(&mut self, other: &SolverOffsets) {
        self.alg_offset = other.alg_offset;
        self.diff_offset = other.diff_offset;
        self.v_offset = other.v_offset;
        self.a_offset = other.a_offset;
        self.root_offset = other.root_offset;
    }

    /// Advance every non-null offset by the total sizes of `other`, folding
    /// the voltage/angle counts into the algebraic range when those classes
    /// are not separately placed.
    pub fn increment_by(&mut self, other: &SolverOffsets) {
        let mut alg_extra = 0;
        match self.a_offset.as_mut() {
            Some(a) => *a += other.total.a,
            None => alg_extra += other.total.a,
        }
        match self.v_offset.as_mut() {
            Some(v) => *v += other.total.v,
            None => alg_extra += other.total.v,
        }
        if let Some(alg) = self.alg_offset.as_mut() {
            *alg += other.total.alg + alg_extra;
        }
        match self.diff_offset.as_mut() {
            Some(d) => *d += other.total.diff,
            None => {
                if let Some(alg) = self.alg_offset.as_mut() {
                    *alg += other.total.diff;
                }
            }
        }
        if let Some(r) = self.root_offset.as_mut() {
            *r += other.total.total_roots();
        }
    }

    /// Copy the local sizes into the total and mark the state loaded.
    pub fn local_load_all(&mut self, finished: bool) {
        self.total = self.local;
        if finished {
            self.state_loaded = true;
            self.jacobian_loaded = true;
            self.roots_loaded = true;
        }
    }

    pub fn set_loaded(&mut self) {
        self.state_loaded = true;
        self.jacobian_loaded = true;
        self.roots_loaded = true;
    }

    pub fn is_loaded(&self) -> bool {
        self.state_loaded && self.jacobian_loaded && self.roots_loaded
    }

    /// The smallest index strictly greater than any index occupied by this
    /// component's states in the mode. Dynamic modes consider both algebraic
    /// and differential ranges; static modes only algebraic. Voltage/angle
    /// ranges count when placed.
    pub fn max_index(&self) -> usize {
        let mut mx = 0;
        if self.mode.is_dynamic() {
            if self.total.diff > 0 {
                if let Some(d) = self.diff_offset {
                    mx = mx.max(d + self.total.diff);
                }
            }
            if self.total.alg > 0 {
                if let Some(a) = self.alg_offset {
                    mx = mx.max(a + self.total.alg);
                }
            }
        } else if self.total.alg > 0 {
            if let Some(a) = self.alg_offset {
                mx = mx.max(a + self.total.alg);
            }
        }
        if let Some(v) = self.v_offset {
            mx = mx.max(v + self.total.v);
        }
        if let Some(a) = self.a_offset {
            mx = mx.max(a + self.total.a);
        }
        mx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver_mode::{DAE_MODE, POWER_FLOW_MODE};

    #[test]
    fn test_total_size_invariant() {
        let sizes = StateSizes {
            alg: 2,
            diff: 3,
            v: 1,
            a: 1,
            ..Default::default()
        };
        assert_eq!(sizes.total(), 7);
        assert_eq!(sizes.algebraic_total(), 4);
    }

    #[test]
    fn test_add_families_are_independent() {
        let mut sizes = StateSizes::default();
        let other = StateSizes {
            alg: 1,
            diff: 2,
            alg_roots: 3,
            jac: 9,
            ..Default::default()
        };
        sizes.add_states(&other);
        assert_eq!(sizes.total(), 3);
        assert_eq!(sizes.total_roots(), 0);
        assert_eq!(sizes.jac, 0);
        sizes.add_roots(&other);
        assert_eq!(sizes.total_roots(), 3);
        sizes.add_jacobian(&other);
        assert_eq!(sizes.jac, 9);
    }

    #[test]
    fn test_set_offset_order_and_nulling() {
        let mut so = SolverOffsets::new(POWER_FLOW_MODE);
        so.total = StateSizes {
            alg: 2,
            diff: 3,
            v: 1,
            a: 1,
            ..Default::default()
        };
        so.set_offset(10);
        assert_eq!(so.v_offset, Some(10));
        assert_eq!(so.a_offset, Some(11));
        assert_eq!(so.alg_offset, Some(12));
        assert_eq!(so.diff_offset, Some(14));

        so.total.v = 0;
        so.total.a = 0;
        so.set_offset(10);
        assert_eq!(so.v_offset, None);
        assert_eq!(so.a_offset, None);
        assert_eq!(so.alg_offset, Some(10));
    }

    #[test]
    fn test_max_index_static_ignores_diff() {
        let mut so = SolverOffsets::new(POWER_FLOW_MODE);
        so.total = StateSizes {
            alg: 2,
            diff: 5,
            ..Default::default()
        };
        so.alg_offset = Some(0);
        so.diff_offset = Some(2);
        assert_eq!(so.max_index(), 2);

        let mut dyn_so = SolverOffsets::new(DAE_MODE);
        dyn_so.total = so.total;
        dyn_so.alg_offset = Some(0);
        dyn_so.diff_offset = Some(2);
        assert_eq!(dyn_so.max_index(), 7);
    }

    #[test]
    fn test_increment_folds_unplaced_classes() {
        let mut so = SolverOffsets::new(POWER_FLOW_MODE);
        so.alg_offset = Some(4);
        let mut other = SolverOffsets::new(POWER_FLOW_MODE);
        other.total = StateSizes {
            alg: 1,
            v: 2,
            a: 1,
            ..Default::default()
        };
        // no v/a offsets of our own: those counts land in the alg range
        so.increment_by(&other);
        assert_eq!(so.alg_offset, Some(8));
    }

    #[test]
    fn test_local_load_all() {
        let mut so = SolverOffsets::new(DAE_MODE);
        so.local = StateSizes {
            alg: 1,
            diff: 2,
            jac: 4,
            ..Default::default()
        };
        so.local_load_all(true);
        assert_eq!(so.total, so.local);
        assert!(so.is_loaded());
    }
}
