//! Change codes, alert codes, and return-code constants.
//!
//! Change codes form a monotone scale: every mutating call reports the
//! strongest effect it had, and drivers act on the maximum code observed
//! over a step to decide how deeply to reinitialize.

use serde::{Deserialize, Serialize};

/// Monotone report of what a mutating call did to the simulation.
///
/// Ordering matters: the driver keeps the maximum over all objects in a pass.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum ChangeCode {
    #[default]
    NoChange,
    /// A numeric parameter moved; no structural impact
    ParameterChange,
    /// Something other than solver state moved (caches, setpoints)
    NonStateChange,
    /// An object connected, disconnected, or changed activity
    ObjectChange,
    /// The Jacobian entry count or pattern changed
    JacobianChange,
    /// The root-function count changed
    RootChange,
    /// The state count changed; a full size/offset reload is required
    StateCountChange,
}

impl ChangeCode {
    /// Combine two codes, keeping the stronger.
    #[inline]
    pub fn max_with(self, other: ChangeCode) -> ChangeCode {
        self.max(other)
    }
}

/// Outcome of a two-step parameter dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamResult {
    /// The component consumed the parameter
    Recognized,
    /// The name means nothing to this component; the caller may try children
    NotRecognized,
    /// The name was recognized but the value rejected
    Invalid,
}

/// Check depth requested from adjustment and root-check passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckLevel {
    /// Only adjustments that can be undone
    ReversableOnly,
    /// Everything, including one-way changes
    FullCheck,
    /// Scan for low-voltage conditions
    LowVoltageCheck,
    /// Re-derive the complete state picture
    CompleteStateCheck,
    /// Disconnect links whose terminal angle differential exceeds pi/2
    HighAngleTrip,
}

/// Reset depth for state resets during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetLevel {
    Minimal,
    Voltage,
    Angle,
    VoltageAngle,
    Full,
    LowVoltagePflow,
    LowVoltageDyn,
}

/// Iteration style for the driver-level converge helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergeMode {
    SingleIteration,
    VoltageOnly,
    LocalIteration,
    BlockIteration,
    StrongIteration,
}

// Alert codes posted by components to the simulation change queue.
// Change alerts occupy [MIN_CHANGE_ALERT, MAX_CHANGE_ALERT).
pub const MIN_CHANGE_ALERT: u32 = 500;
pub const MAX_CHANGE_ALERT: u32 = 900;

pub const INVALID_STATE_ALERT: u32 = 585;
pub const INITIALIZATION_FAILURE: u32 = 587;
pub const ROOT_COUNT_CHANGE: u32 = 590;
pub const ROOT_COUNT_INCREASE: u32 = 591;
pub const ROOT_COUNT_DECREASE: u32 = 592;
pub const STATE_COUNT_CHANGE: u32 = 600;
pub const STATE_COUNT_INCREASE: u32 = 601;
pub const STATE_COUNT_DECREASE: u32 = 602;
pub const STATE_IDENTITY_CHANGE: u32 = 604;
pub const FLAG_CHANGE: u32 = 605;
pub const CONNECTIVITY_CHANGE: u32 = 607;
pub const OBJECT_COUNT_CHANGE: u32 = 615;
pub const JAC_COUNT_CHANGE: u32 = 630;
pub const SLACK_BUS_CHANGE: u32 = 655;
pub const CONSTRAINT_COUNT_CHANGE: u32 = 670;
pub const POTENTIAL_FAULT_CHANGE: u32 = 690;
pub const VERY_LOW_VOLTAGE_ALERT: u32 = 700;
pub const VOLTAGE_CONTROL_CHANGE: u32 = 710;

/// Map an alert code into the change code the driver should fold in.
pub fn alert_change_code(alert: u32) -> ChangeCode {
    match alert {
        STATE_COUNT_CHANGE..=STATE_IDENTITY_CHANGE => ChangeCode::StateCountChange,
        ROOT_COUNT_CHANGE..=ROOT_COUNT_DECREASE => ChangeCode::RootChange,
        JAC_COUNT_CHANGE => ChangeCode::JacobianChange,
        OBJECT_COUNT_CHANGE | CONNECTIVITY_CHANGE | SLACK_BUS_CHANGE => ChangeCode::ObjectChange,
        FLAG_CHANGE | VOLTAGE_CONTROL_CHANGE => ChangeCode::NonStateChange,
        _ => ChangeCode::NoChange,
    }
}

// Function return codes shared with the solver bridge.
pub const FUNCTION_EXECUTION_SUCCESS: i32 = 0;
pub const FUNCTION_EXECUTION_FAILURE: i32 = -1;
pub const SOLVER_ROOT_FOUND: i32 = 2;
pub const SOLVER_CONVERGENCE_ERROR: i32 = -12;
pub const SOLVER_INVALID_STATE_ERROR: i32 = -36;
pub const SOLVER_INITIAL_SETUP_ERROR: i32 = -38;
pub const NO_SLACK_BUS_FOUND: i32 = -46;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_code_ordering() {
        assert!(ChangeCode::NoChange < ChangeCode::ParameterChange);
        assert!(ChangeCode::ParameterChange < ChangeCode::NonStateChange);
        assert!(ChangeCode::NonStateChange < ChangeCode::ObjectChange);
        assert!(ChangeCode::ObjectChange < ChangeCode::JacobianChange);
        assert!(ChangeCode::JacobianChange < ChangeCode::RootChange);
        assert!(ChangeCode::RootChange < ChangeCode::StateCountChange);
    }

    #[test]
    fn test_max_with() {
        let code = ChangeCode::ParameterChange.max_with(ChangeCode::ObjectChange);
        assert_eq!(code, ChangeCode::ObjectChange);
    }

    #[test]
    fn test_alert_mapping() {
        assert_eq!(
            alert_change_code(STATE_COUNT_INCREASE),
            ChangeCode::StateCountChange
        );
        assert_eq!(alert_change_code(ROOT_COUNT_CHANGE), ChangeCode::RootChange);
        assert_eq!(alert_change_code(SLACK_BUS_CHANGE), ChangeCode::ObjectChange);
        assert_eq!(alert_change_code(VERY_LOW_VOLTAGE_ALERT), ChangeCode::NoChange);
    }

    #[test]
    fn test_alert_range() {
        for code in [
            INVALID_STATE_ALERT,
            STATE_COUNT_CHANGE,
            JAC_COUNT_CHANGE,
            SLACK_BUS_CHANGE,
            VERY_LOW_VOLTAGE_ALERT,
        ] {
            assert!((MIN_CHANGE_ALERT..MAX_CHANGE_ALERT).contains(&code));
        }
    }
}
