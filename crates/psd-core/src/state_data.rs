//! Immutable state snapshot passed into every evaluation call.

/// A view of the solver state at one instant.
///
/// For partitioned solves, `state` holds only the mode's own half; the other
/// half arrives through `full_state`/`diff_state`/`alg_state` together with
/// `pair_index` naming the offset column those arrays are laid out for.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateData<'a> {
    /// Time the snapshot corresponds to
    pub time: f64,
    /// Sequence id differentiating subsequent snapshots; 0 means "unknown"
    pub seq_id: u64,
    /// Current state guess
    pub state: Option<&'a [f64]>,
    /// State time-derivative array
    pub dstate_dt: Option<&'a [f64]>,
    /// Full combined state when `state` holds only one class
    pub full_state: Option<&'a [f64]>,
    /// Differential states when `state` holds only algebraic components
    pub diff_state: Option<&'a [f64]>,
    /// Algebraic states when `state` holds only differential components
    pub alg_state: Option<&'a [f64]>,
    /// Coefficient applied to derivative-related Jacobian entries
    pub cj: f64,
    /// Time corresponding to the paired half of the state
    pub alt_time: f64,
    /// Offset column the paired data is laid out for
    pub pair_index: Option<usize>,
}

impl<'a> StateData<'a> {
    pub fn new(time: f64, state: &'a [f64], dstate_dt: Option<&'a [f64]>, seq_id: u64) -> Self {
        StateData {
            time,
            seq_id,
            state: Some(state),
            dstate_dt,
            cj: 1.0,
            ..Default::default()
        }
    }

    /// An empty snapshot: evaluations fall back to component-local caches.
    pub fn empty() -> Self {
        StateData {
            cj: 1.0,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    /// Whether a cache stamped with `check_id` needs refreshing against this
    /// snapshot.
    #[inline]
    pub fn update_required(&self, check_id: u64) -> bool {
        check_id != self.seq_id || self.seq_id == 0 || self.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let sd = StateData::empty();
        assert!(sd.is_empty());
        assert_eq!(sd.cj, 1.0);
    }

    #[test]
    fn test_update_required() {
        let state = [1.0, 2.0];
        let sd = StateData::new(0.5, &state, None, 3);
        assert!(!sd.update_required(3));
        assert!(sd.update_required(2));
        let unstamped = StateData::new(0.5, &state, None, 0);
        assert!(unstamped.update_required(0));
    }
}
