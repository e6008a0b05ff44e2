//! Component identity and the shared per-component bookkeeping.

use crate::error::PsdResult;
use crate::offset_table::{Locations, OffsetTable};
use crate::solver_mode::SolverMode;
use crate::state_data::StateData;
use crate::units::UnitBases;
use serde::{Deserialize, Serialize};

/// Arena index of a component. Stable across clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(usize);

impl ComponentId {
    #[inline]
    pub fn new(value: usize) -> Self {
        ComponentId(value)
    }
    #[inline]
    pub fn value(&self) -> usize {
        self.0
    }
}

/// Operational flag bit positions on the per-component 64-bit flag word.
///
/// Bits 0..=10 typically cascade to parents; 24..=31 signal condition
/// changes; 32..=43 are free for per-object use; 54..=63 describe
/// capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpFlag {
    HasConstraints = 0,
    HasRoots = 1,
    HasAlgRoots = 2,
    HasPowerflowAdjustments = 3,
    PreExRequested = 4,
    UsesBusFrequency = 5,
    HasPflowStates = 6,
    HasDynStates = 7,
    HasDifferentialStates = 8,
    NotCloneable = 9,

    RemoteVoltageControl = 11,
    LocalVoltageControl = 12,
    IndirectVoltageControl = 13,
    AdjustableQ = 14,
    RemotePowerControl = 15,
    LocalPowerControl = 16,
    IndirectPowerControl = 17,
    AdjustableP = 18,

    PflowInitialized = 19,
    DynInitialized = 20,
    ObjectArmed = 21,
    LateBInitialize = 22,
    ErrorFlag = 23,

    StateChange = 24,
    ObjectChange = 25,
    ConstraintChange = 26,
    RootChange = 27,
    JacobianCountChange = 28,
    SlackBusChange = 29,
    VoltageControlChange = 30,
    ConnectivityChange = 31,

    ObjectFlag1 = 32,
    ObjectFlag2 = 33,
    ObjectFlag3 = 34,
    ObjectFlag4 = 35,
    ObjectFlag5 = 36,
    ObjectFlag6 = 37,
    ObjectFlag7 = 38,
    ObjectFlag8 = 39,

    NoPowerflowOperations = 44,
    NoDynamics = 45,
    DisableFlagUpdates = 46,
    FlagUpdateRequired = 47,
    PflowInitRequired = 48,

    Disconnected = 49,
    DifferentialOutput = 50,
    BeingDeleted = 52,
    SeparateProcessing = 53,

    MultipartCalculationCapable = 54,
    HasSubobjectPflowStates = 55,
    DcOnly = 57,
    DcCapable = 58,
    DcTerminal2 = 59,
    ThreePhaseOnly = 61,
    ThreePhaseCapable = 62,
    ThreePhaseTerminal2 = 63,
}

/// Flags that cascade upward to parent components when set.
pub const CASCADING_FLAG_MASK: u64 = 0x3FE;
/// Mask clearing the condition-change bits (24..=31).
pub const RESET_CHANGE_FLAG_MASK: u64 = 0xFFFF_FFFF_00FF_FFFF;

/// Dense 64-bit operational flag word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpFlags(pub u64);

impl OpFlags {
    #[inline]
    pub fn get(&self, flag: OpFlag) -> bool {
        self.0 & (1u64 << flag as u8) != 0
    }

    #[inline]
    pub fn set(&mut self, flag: OpFlag, value: bool) {
        if value {
            self.0 |= 1u64 << flag as u8;
        } else {
            self.0 &= !(1u64 << flag as u8);
        }
    }

    /// Any of the condition-change bits set?
    #[inline]
    pub fn any_change_flags(&self) -> bool {
        self.0 & 0x00FF_0000_00 != 0
    }

    /// Clear the condition-change bits.
    #[inline]
    pub fn reset_change_flags(&mut self) {
        self.0 &= RESET_CHANGE_FLAG_MASK;
    }

    /// The flags that propagate to a parent.
    #[inline]
    pub fn cascading(&self) -> u64 {
        self.0 & CASCADING_FLAG_MASK
    }
}

/// Bookkeeping shared by every component: identity, tree links, flags,
/// offsets, base quantities, and the local state cache used when the
/// component is disconnected from a global solve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentBase {
    pub id: ComponentId,
    pub user_id: u64,
    pub name: String,
    pub parent: Option<ComponentId>,
    pub children: Vec<ComponentId>,

    pub flags: OpFlags,
    pub offsets: OffsetTable,

    pub input_size: usize,
    pub output_size: usize,

    /// System base frequency in Hz
    pub base_frequency: f64,
    /// System base power in MVA
    pub base_power: f64,
    /// Local base voltage in kV
    pub base_voltage: f64,

    /// Local state cache (algebraic classes first, then differential)
    pub local_state: Vec<f64>,
    /// Local derivative cache, same layout
    pub local_dstate: Vec<f64>,
    /// Time of the last local update
    pub prev_time: f64,

    pub enabled: bool,
}

impl ComponentBase {
    pub fn new(name: impl Into<String>) -> Self {
        ComponentBase {
            id: ComponentId::new(usize::MAX),
            user_id: 0,
            name: name.into(),
            parent: None,
            children: Vec::new(),
            flags: OpFlags::default(),
            offsets: OffsetTable::new(),
            input_size: 0,
            output_size: 1,
            base_frequency: 60.0,
            base_power: 100.0,
            base_voltage: 120.0,
            local_state: Vec::new(),
            local_dstate: Vec::new(),
            prev_time: 0.0,
            enabled: true,
        }
    }

    /// Whether the component takes part in a solve at all.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.enabled && !self.flags.get(OpFlag::Disconnected)
    }

    /// Total state contribution (this component plus descendants) in a mode.
    pub fn state_size(&self, mode: &SolverMode) -> usize {
        self.offsets.get(mode).map_or(0, |so| so.total.total())
    }

    /// Total root contribution in a mode.
    pub fn root_size(&self, mode: &SolverMode) -> usize {
        self.offsets.get(mode).map_or(0, |so| so.total.total_roots())
    }

    /// Resolve data locations against a snapshot, falling back to the local
    /// caches for local mode or empty snapshots.
    pub fn locations<'a>(
        &'a self,
        sd: &StateData<'a>,
        mode: &SolverMode,
    ) -> PsdResult<Locations<'a>> {
        self.offsets
            .locations(sd, mode, &self.local_state, &self.local_dstate, self.prev_time)
    }

    /// Size the local caches to the local-mode totals.
    pub fn allocate_local_cache(&mut self) {
        let total = self.offsets.local().total.total();
        self.local_state.resize(total, 0.0);
        self.local_dstate.resize(total, 0.0);
    }

    pub fn unit_bases(&self) -> UnitBases {
        UnitBases {
            power_mva: self.base_power,
            voltage_kv: self.base_voltage,
            frequency_hz: self.base_frequency,
        }
    }

    /// Angular system frequency in rad/s.
    #[inline]
    pub fn omega0(&self) -> f64 {
        2.0 * std::f64::consts::PI * self.base_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_get_set() {
        let mut flags = OpFlags::default();
        assert!(!flags.get(OpFlag::HasRoots));
        flags.set(OpFlag::HasRoots, true);
        flags.set(OpFlag::DcCapable, true);
        assert!(flags.get(OpFlag::HasRoots));
        assert!(flags.get(OpFlag::DcCapable));
        flags.set(OpFlag::HasRoots, false);
        assert!(!flags.get(OpFlag::HasRoots));
    }

    #[test]
    fn test_change_flag_reset() {
        let mut flags = OpFlags::default();
        flags.set(OpFlag::StateChange, true);
        flags.set(OpFlag::RootChange, true);
        flags.set(OpFlag::HasRoots, true);
        assert!(flags.any_change_flags());
        flags.reset_change_flags();
        assert!(!flags.any_change_flags());
        assert!(flags.get(OpFlag::HasRoots));
    }

    #[test]
    fn test_cascading_mask() {
        let mut flags = OpFlags::default();
        flags.set(OpFlag::HasRoots, true);
        flags.set(OpFlag::Disconnected, true);
        assert_eq!(flags.cascading(), 1 << OpFlag::HasRoots as u8);
    }

    #[test]
    fn test_base_defaults() {
        let base = ComponentBase::new("bus1");
        assert_eq!(base.name, "bus1");
        assert!(base.enabled);
        assert!((base.base_power - 100.0).abs() < 1e-12);
        assert_eq!(base.state_size(&crate::solver_mode::POWER_FLOW_MODE), 0);
    }
}
