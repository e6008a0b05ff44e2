//! Solver mode identification.
//!
//! A [`SolverMode`] names one view of the simulation: which variable classes
//! participate (algebraic, differential, both), whether the solve is dynamic,
//! which approximations the solver wants honored, and where in each
//! component's offset table the mode's bookkeeping lives.
//!
//! Several modes coexist on one object tree; the `offset_index` selects the
//! offset-table column, and partitioned modes carry a `paired_offset_index`
//! naming the mode that owns the other half of the state.

use serde::{Deserialize, Serialize};

/// Approximation request bits carried on a solver mode.
///
/// These are requests, not obligations: a component honors the ones it
/// understands.
pub mod approx {
    /// Treat the network as decoupled (P-theta / Q-V separation)
    pub const DECOUPLED: u32 = 1 << 0;
    /// Small-angle assumption (sin x ~ x)
    pub const SMALL_ANGLE: u32 = 1 << 1;
    /// Neglect series resistance
    pub const SMALL_R: u32 = 1 << 2;
    /// Fully linearized evaluation
    pub const LINEAR: u32 = 1 << 3;
    /// Force recalculation of cached quantities
    pub const FORCE_RECALC: u32 = 1 << 29;
    /// DC network representation (angles only)
    pub const DC: u32 = 1 << 31;
}

/// Well-known offset-table columns.
pub mod mode_index {
    pub const LOCAL: usize = 0;
    pub const POWER_FLOW: usize = 1;
    pub const DAE: usize = 2;
    pub const DYNAMIC_ALGEBRAIC: usize = 3;
    pub const DYNAMIC_DIFFERENTIAL: usize = 4;
}

/// Value tag identifying a solve and how to find its information.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverMode {
    /// The solve integrates over time
    pub dynamic: bool,
    /// Differential states participate
    pub differential: bool,
    /// Algebraic states participate
    pub algebraic: bool,
    /// Local (disconnected) operation against the component caches
    pub local: bool,
    /// Reserved; carried for forward compatibility, keys no behavior
    pub extended_state: bool,
    /// The solve treats parameters as unknowns
    pub parameters: bool,
    /// Approximation request bits (see [`approx`])
    pub approx: u32,
    /// Column in each component's offset table
    pub offset_index: usize,
    /// Offset column holding the other half of the state for partitioned modes
    pub paired_offset_index: Option<usize>,
}

impl SolverMode {
    /// A mode with nothing set, used as a null return.
    pub const fn empty() -> Self {
        SolverMode {
            dynamic: false,
            differential: false,
            algebraic: false,
            local: false,
            extended_state: false,
            parameters: false,
            approx: 0,
            offset_index: usize::MAX,
            paired_offset_index: None,
        }
    }

    pub const fn local() -> Self {
        SolverMode {
            local: true,
            algebraic: true,
            differential: true,
            offset_index: mode_index::LOCAL,
            ..Self::empty()
        }
    }

    pub const fn power_flow() -> Self {
        SolverMode {
            algebraic: true,
            offset_index: mode_index::POWER_FLOW,
            ..Self::empty()
        }
    }

    pub const fn dae() -> Self {
        SolverMode {
            dynamic: true,
            algebraic: true,
            differential: true,
            offset_index: mode_index::DAE,
            ..Self::empty()
        }
    }

    pub const fn dynamic_algebraic() -> Self {
        SolverMode {
            dynamic: true,
            algebraic: true,
            offset_index: mode_index::DYNAMIC_ALGEBRAIC,
            paired_offset_index: Some(mode_index::DYNAMIC_DIFFERENTIAL),
            ..Self::empty()
        }
    }

    pub const fn dynamic_differential() -> Self {
        SolverMode {
            dynamic: true,
            differential: true,
            offset_index: mode_index::DYNAMIC_DIFFERENTIAL,
            paired_offset_index: Some(mode_index::DYNAMIC_ALGEBRAIC),
            ..Self::empty()
        }
    }

    /// Structural equality over the role booleans and approximation flags,
    /// ignoring the offset indices.
    pub fn same_structure(&self, other: &SolverMode) -> bool {
        self.dynamic == other.dynamic
            && self.differential == other.differential
            && self.algebraic == other.algebraic
            && self.local == other.local
            && self.extended_state == other.extended_state
            && self.approx == other.approx
    }

    #[inline]
    pub fn is_dc(&self) -> bool {
        self.approx & approx::DC != 0
    }

    #[inline]
    pub fn is_ac(&self) -> bool {
        !self.is_dc()
    }

    #[inline]
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    #[inline]
    pub fn is_power_flow(&self) -> bool {
        !self.dynamic
    }

    #[inline]
    pub fn is_algebraic_only(&self) -> bool {
        self.algebraic && !self.differential
    }

    #[inline]
    pub fn is_differential_only(&self) -> bool {
        self.differential && !self.algebraic
    }

    #[inline]
    pub fn is_dae(&self) -> bool {
        self.algebraic && self.differential && !self.local
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[inline]
    pub fn has_differential(&self) -> bool {
        self.differential
    }

    #[inline]
    pub fn has_algebraic(&self) -> bool {
        self.algebraic
    }

    #[inline]
    pub fn is_extended(&self) -> bool {
        self.extended_state
    }

    /// Set an approximation bit.
    pub fn set_approx(&mut self, bit: u32, value: bool) {
        if value {
            self.approx |= bit;
        } else {
            self.approx &= !bit;
        }
    }
}

impl Default for SolverMode {
    fn default() -> Self {
        Self::empty()
    }
}

// Structural equality matches `same_structure`; the offset indices are
// bookkeeping and are compared separately where they matter.
impl PartialEq for SolverMode {
    fn eq(&self, other: &Self) -> bool {
        self.same_structure(other)
    }
}

/// The predefined mode singletons in offset-index order.
pub const LOCAL_MODE: SolverMode = SolverMode::local();
pub const POWER_FLOW_MODE: SolverMode = SolverMode::power_flow();
pub const DAE_MODE: SolverMode = SolverMode::dae();
pub const DYN_ALGEBRAIC_MODE: SolverMode = SolverMode::dynamic_algebraic();
pub const DYN_DIFFERENTIAL_MODE: SolverMode = SolverMode::dynamic_differential();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_indices() {
        assert_eq!(LOCAL_MODE.offset_index, 0);
        assert_eq!(POWER_FLOW_MODE.offset_index, 1);
        assert_eq!(DAE_MODE.offset_index, 2);
        assert_eq!(DYN_ALGEBRAIC_MODE.offset_index, 3);
        assert_eq!(DYN_DIFFERENTIAL_MODE.offset_index, 4);
    }

    #[test]
    fn test_pairing() {
        assert_eq!(
            DYN_ALGEBRAIC_MODE.paired_offset_index,
            Some(DYN_DIFFERENTIAL_MODE.offset_index)
        );
        assert_eq!(
            DYN_DIFFERENTIAL_MODE.paired_offset_index,
            Some(DYN_ALGEBRAIC_MODE.offset_index)
        );
    }

    #[test]
    fn test_capability_helpers() {
        assert!(POWER_FLOW_MODE.is_power_flow());
        assert!(POWER_FLOW_MODE.is_algebraic_only());
        assert!(DAE_MODE.is_dae());
        assert!(DAE_MODE.is_dynamic());
        assert!(DYN_DIFFERENTIAL_MODE.is_differential_only());
        assert!(LOCAL_MODE.is_local());
    }

    #[test]
    fn test_structural_equality_ignores_index() {
        let mut other = DAE_MODE;
        other.offset_index = 7;
        assert_eq!(other, DAE_MODE);
        assert!(other.same_structure(&DAE_MODE));
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&DAE_MODE).unwrap();
        let back: SolverMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DAE_MODE);
        assert_eq!(back.offset_index, DAE_MODE.offset_index);
    }

    #[test]
    fn test_dc_flag() {
        let mut mode = POWER_FLOW_MODE;
        assert!(mode.is_ac());
        mode.set_approx(approx::DC, true);
        assert!(mode.is_dc());
        mode.set_approx(approx::DC, false);
        assert!(mode.is_ac());
    }
}
