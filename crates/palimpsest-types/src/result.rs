use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DamageSeverity {
    Minor,
    Moderate,
    Severe,
}

impl DamageSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            DamageSeverity::Minor => "minor",
            DamageSeverity::Moderate => "moderate",
            DamageSeverity::Severe => "severe",
        }
    }
}

/// A circular region of physical degradation, positioned in percentages of
/// the page so the client can overlay it at any render size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DamageHotspot {
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub severity: DamageSeverity,
    pub damage_type: String,
    pub description: String,
}

impl DamageHotspot {
    /// Coordinates and radius are clamped into [0, 100] at construction so a
    /// hotspot can never escape the page.
    pub fn new(
        x: f32,
        y: f32,
        radius: f32,
        severity: DamageSeverity,
        damage_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            x: x.clamp(0.0, 100.0),
            y: y.clamp(0.0, 100.0),
            radius: radius.clamp(0.0, 100.0),
            severity,
            damage_type: damage_type.into(),
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestorationSummary {
    pub document_type: String,
    #[serde(default)]
    pub issues_detected: Vec<String>,
    #[serde(default)]
    pub enhancements_applied: Vec<String>,
    pub quality_score: f32,
    #[serde(default)]
    pub structural_flags: Vec<String>,
}

/// The sealed outcome of one pipeline run. Immutable once constructed;
/// cached by content hash and carried whole in the terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResurrectionResult {
    pub overall_confidence: f32,
    pub processing_time_ms: u64,
    pub raw_ocr_text: String,
    pub transliterated_text: String,
    pub enhanced_image_base64: String,
    #[serde(default)]
    pub repair_recommendations: Vec<String>,
    #[serde(default)]
    pub damage_hotspots: Vec<DamageHotspot>,
    pub restoration_summary: RestorationSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hotspot_coordinates_are_clamped() {
        let spot = DamageHotspot::new(
            120.0,
            -4.0,
            300.0,
            DamageSeverity::Severe,
            "water_damage",
            "tide line across the header",
        );
        assert_eq!(spot.x, 100.0);
        assert_eq!(spot.y, 0.0);
        assert_eq!(spot.radius, 100.0);
    }

    #[test]
    fn severity_wire_form_is_snake_case() {
        let json = serde_json::to_string(&DamageSeverity::Moderate).unwrap();
        assert_eq!(json, "\"moderate\"");
    }

    #[test]
    fn result_round_trips_through_json() {
        let result = ResurrectionResult {
            overall_confidence: 72.5,
            processing_time_ms: 1840,
            raw_ocr_text: "ɓasa".into(),
            transliterated_text: "basa".into(),
            enhanced_image_base64: "aGVsbG8=".into(),
            repair_recommendations: vec!["deacidify within 12 months".into()],
            damage_hotspots: vec![DamageHotspot::new(
                10.0,
                20.0,
                5.0,
                DamageSeverity::Minor,
                "foxing",
                "scattered rust-brown spots",
            )],
            restoration_summary: RestorationSummary {
                document_type: "colonial-era letter".into(),
                issues_detected: vec!["ink fading".into()],
                enhancements_applied: vec![],
                quality_score: 0.72,
                structural_flags: vec![],
            },
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: ResurrectionResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
