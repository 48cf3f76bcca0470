//! Deterministic tag classifier used by bulk auto-generation.
//!
//! This is a fixed lookup table over the tag's declared type, its units
//! label and its key, not a heuristic: the same inputs always classify the
//! same way, and classification has no side effects. Each protocol module
//! maps the resulting class onto its own native type.

use crate::value::DataType;

/// Protocol-independent shape of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagClass {
    /// Analog measurement best carried as a floating-point value.
    FloatMeasurement,
    /// On/off status, carried as a single point or Boolean.
    SinglePoint,
    /// Integer that fits 16 bits (percentages, codes, alarm numbers).
    SmallInt,
    /// General integer, carried in 32 bits.
    WideInt,
    /// Free-form text.
    Text,
    /// Anything else; protocols pick their own default.
    Other,
}

/// Units labels that mark a tag as an analog measurement.
const MEASUREMENT_UNITS: &[&str] = &[
    "°c", "°f", "hpa", "bar", "psi", "l/min", "m3/h", "mm/s", "kw", "w",
];

/// Key fragments that mark a tag as an analog measurement.
const MEASUREMENT_KEYS: &[&str] = &["temp", "pressure", "flow", "vibrat", "power"];

/// Key fragments that mark a tag as an on/off status.
const STATUS_KEYS: &[&str] = &["status", "enabled", "motor"];

/// Key fragments and units that mark an integer as 16-bit sized.
const SMALL_INT_KEYS: &[&str] = &["position", "code", "alarm"];

pub fn classify(data_type: DataType, units: &str, key: &str) -> TagClass {
    let units = units.to_lowercase();
    let key = key.to_lowercase();

    if MEASUREMENT_KEYS.iter().any(|k| key.contains(k))
        || MEASUREMENT_UNITS.iter().any(|u| units.contains(u))
    {
        return TagClass::FloatMeasurement;
    }

    if data_type == DataType::Bool || STATUS_KEYS.iter().any(|k| key.contains(k)) {
        return TagClass::SinglePoint;
    }

    match data_type {
        DataType::Int => {
            if SMALL_INT_KEYS.iter().any(|k| key.contains(k)) || units.contains('%') {
                TagClass::SmallInt
            } else {
                TagClass::WideInt
            }
        }
        DataType::Float => TagClass::FloatMeasurement,
        DataType::String => TagClass::Text,
        _ => TagClass::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_mark_measurements() {
        assert_eq!(
            classify(DataType::Int, "°C", "sensor1"),
            TagClass::FloatMeasurement
        );
        assert_eq!(
            classify(DataType::Int, "bar", "p1"),
            TagClass::FloatMeasurement
        );
    }

    #[test]
    fn key_fragments_mark_measurements_before_type() {
        assert_eq!(
            classify(DataType::Bool, "", "power_ok"),
            TagClass::FloatMeasurement
        );
        assert_eq!(
            classify(DataType::String, "", "tempZone3"),
            TagClass::FloatMeasurement
        );
    }

    #[test]
    fn status_keys_and_bools_are_single_points() {
        assert_eq!(classify(DataType::Bool, "", "motorOn"), TagClass::SinglePoint);
        assert_eq!(
            classify(DataType::Int, "", "valve_status"),
            TagClass::SinglePoint
        );
    }

    #[test]
    fn integer_sizing() {
        assert_eq!(classify(DataType::Int, "%", "fill"), TagClass::SmallInt);
        assert_eq!(
            classify(DataType::Int, "", "alarm_count"),
            TagClass::SmallInt
        );
        assert_eq!(classify(DataType::Int, "", "counter"), TagClass::WideInt);
    }

    #[test]
    fn classification_is_idempotent() {
        let first = classify(DataType::Float, "kW", "gridPower");
        for _ in 0..3 {
            assert_eq!(classify(DataType::Float, "kW", "gridPower"), first);
        }
    }
}
