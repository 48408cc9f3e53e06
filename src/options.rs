use serde::Deserialize;

/// Options for summarizing a parsed GPX document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryOptions {
    /// Unit for reported distances (default: meters)
    #[serde(default)]
    pub distance_unit: DistanceUnit,

    /// Include a summary for every track segment (default: false)
    #[serde(default)]
    pub include_segments: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    Meters,
    Kilometers,
}

impl DistanceUnit {
    pub fn convert(self, meters: f64) -> f64 {
        match self {
            DistanceUnit::Meters => meters,
            DistanceUnit::Kilometers => meters / 1000.0,
        }
    }
}
