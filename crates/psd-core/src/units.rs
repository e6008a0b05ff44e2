//! Unit handling for the external `set`/`get` surface.
//!
//! All internal computation is in per-unit on the system bases; the unit
//! argument on the parameter surface lets callers supply values in physical
//! units and have them converted on the way in and out.

use serde::{Deserialize, Serialize};

/// Units accepted by the parameter interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Value already on the appropriate per-unit base (the default)
    #[default]
    PerUnit,
    /// Megawatts (converted on the system power base)
    Mw,
    /// Megavars (converted on the system power base)
    Mvar,
    /// Megavolt-amperes (converted on the system power base)
    Mva,
    /// Kilovolts (converted on the local voltage base)
    Kv,
    /// Radians (angles are stored in radians)
    Rad,
    /// Degrees
    Deg,
    /// Seconds
    Sec,
    /// Hertz (converted on the system frequency base)
    Hz,
}

/// Conversion bases for a component: system power (MVA), local voltage (kV),
/// system frequency (Hz).
#[derive(Debug, Clone, Copy)]
pub struct UnitBases {
    pub power_mva: f64,
    pub voltage_kv: f64,
    pub frequency_hz: f64,
}

impl Default for UnitBases {
    fn default() -> Self {
        Self {
            power_mva: 100.0,
            voltage_kv: 120.0,
            frequency_hz: 60.0,
        }
    }
}

/// Convert an externally supplied value into the internal per-unit/radian form.
pub fn to_internal(value: f64, unit: Unit, bases: &UnitBases) -> f64 {
    match unit {
        Unit::PerUnit | Unit::Rad | Unit::Sec => value,
        Unit::Mw | Unit::Mvar | Unit::Mva => value / bases.power_mva,
        Unit::Kv => value / bases.voltage_kv,
        Unit::Deg => value.to_radians(),
        Unit::Hz => value / bases.frequency_hz,
    }
}

/// Convert an internal per-unit/radian value into the requested unit.
pub fn from_internal(value: f64, unit: Unit, bases: &UnitBases) -> f64 {
    match unit {
        Unit::PerUnit | Unit::Rad | Unit::Sec => value,
        Unit::Mw | Unit::Mvar | Unit::Mva => value * bases.power_mva,
        Unit::Kv => value * bases.voltage_kv,
        Unit::Deg => value.to_degrees(),
        Unit::Hz => value * bases.frequency_hz,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_conversion() {
        let bases = UnitBases::default();
        assert!((to_internal(80.0, Unit::Mw, &bases) - 0.8).abs() < 1e-12);
        assert!((from_internal(0.8, Unit::Mw, &bases) - 80.0).abs() < 1e-12);
    }

    #[test]
    fn test_angle_conversion() {
        let bases = UnitBases::default();
        assert!((to_internal(180.0, Unit::Deg, &bases) - std::f64::consts::PI).abs() < 1e-12);
    }

    #[test]
    fn test_round_trip() {
        let bases = UnitBases {
            power_mva: 50.0,
            voltage_kv: 230.0,
            frequency_hz: 50.0,
        };
        for unit in [Unit::Mw, Unit::Kv, Unit::Deg, Unit::Hz, Unit::PerUnit] {
            let v = from_internal(to_internal(3.25, unit, &bases), unit, &bases);
            assert!((v - 3.25).abs() < 1e-12);
        }
    }
}
