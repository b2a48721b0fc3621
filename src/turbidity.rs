//! Turbidity classes and their NTU ranges.
//!
//! The six labels are ordered from most turbid to clearest. A label's index
//! is the index of the matching network output, so `ClassLabel::ALL` doubles
//! as the output-to-label table.

use std::fmt;

use serde::{Serialize, Serializer};

/// Number of turbidity classes the network predicts.
pub const NUM_CLASSES: usize = 6;

/// One of the six fixed turbidity categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClassLabel {
    UltraCloudy,
    VeryCloudy,
    Cloudy,
    LightlyCloudy,
    LightlyClear,
    Clear,
}

impl ClassLabel {
    /// All labels in network output order (most turbid first).
    pub const ALL: [ClassLabel; NUM_CLASSES] = [
        ClassLabel::UltraCloudy,
        ClassLabel::VeryCloudy,
        ClassLabel::Cloudy,
        ClassLabel::LightlyCloudy,
        ClassLabel::LightlyClear,
        ClassLabel::Clear,
    ];

    /// Wire name used in JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ClassLabel::UltraCloudy => "Ultra cloudy",
            ClassLabel::VeryCloudy => "very cloudy",
            ClassLabel::Cloudy => "cloudy",
            ClassLabel::LightlyCloudy => "lightly cloudy",
            ClassLabel::LightlyClear => "lightly clear",
            ClassLabel::Clear => "clear",
        }
    }

    /// Position of this label in the network output.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Static NTU range for this class.
    pub fn ntu_range(self) -> TurbidityRange {
        ntu_range(self)
    }
}

impl fmt::Display for ClassLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ClassLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Inclusive NTU interval associated with a class.
///
/// Serialized as a two-element array `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurbidityRange {
    pub min: f64,
    pub max: f64,
}

impl Serialize for TurbidityRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.min, self.max].serialize(serializer)
    }
}

const TURBIDITY_RANGES: [TurbidityRange; NUM_CLASSES] = [
    TurbidityRange { min: 3336.0, max: 3844.0 },
    TurbidityRange { min: 1300.0, max: 2520.0 },
    TurbidityRange { min: 600.0, max: 1200.0 },
    TurbidityRange { min: 150.0, max: 450.0 },
    TurbidityRange { min: 25.0, max: 90.0 },
    TurbidityRange { min: 1.47, max: 17.13 },
];

/// Map a class to its NTU range.
pub fn ntu_range(label: ClassLabel) -> TurbidityRange {
    TURBIDITY_RANGES[label.index()]
}
