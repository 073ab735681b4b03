//! Injected domain reference tables.
//!
//! The engine treats these as data: deployments can swap in their own tables
//! at construction time. The defaults cover the material the pipeline was
//! built around: Doke-era Shona orthography, figures of the First
//! Chimurenga period, and a paper-conservation damage taxonomy.

use serde::{Deserialize, Serialize};

use palimpsest_types::DamageSeverity;

/// One archaic-to-modern orthography substitution. `archaic` may be a
/// multi-character cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrthographyPair {
    pub archaic: String,
    pub modern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalFigure {
    pub name: String,
    pub era: String,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DamageTaxonomyEntry {
    pub damage_type: String,
    pub severity: DamageSeverity,
    /// Context signals that implicate this damage class.
    pub indicators: Vec<String>,
    pub recommendation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceData {
    pub orthography: Vec<OrthographyPair>,
    pub figures: Vec<HistoricalFigure>,
    pub taxonomy: Vec<DamageTaxonomyEntry>,
}

impl Default for ReferenceData {
    fn default() -> Self {
        Self {
            orthography: default_orthography(),
            figures: default_figures(),
            taxonomy: default_taxonomy(),
        }
    }
}

/// Result of a rule-based transliteration pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Transliteration {
    pub text: String,
    /// How many archaic clusters were rewritten.
    pub substitutions: usize,
}

impl ReferenceData {
    /// Rewrite archaic orthography into the modern standard. Longer clusters
    /// are applied first so digraphs are not shadowed by their parts.
    pub fn transliterate(&self, input: &str) -> Transliteration {
        let mut pairs: Vec<&OrthographyPair> = self.orthography.iter().collect();
        pairs.sort_by(|a, b| b.archaic.chars().count().cmp(&a.archaic.chars().count()));

        let mut text = input.to_string();
        let mut substitutions = 0;
        for pair in pairs {
            let count = text.matches(pair.archaic.as_str()).count();
            if count > 0 {
                text = text.replace(pair.archaic.as_str(), &pair.modern);
                substitutions += count;
            }
        }
        Transliteration { text, substitutions }
    }

    /// Figures whose name appears in `text`, case-insensitively on the
    /// distinctive surname token.
    pub fn match_figures(&self, text: &str) -> Vec<&HistoricalFigure> {
        let haystack = text.to_lowercase();
        self.figures
            .iter()
            .filter(|figure| {
                figure
                    .name
                    .split_whitespace()
                    .any(|token| token.len() > 3 && haystack.contains(&token.to_lowercase()))
            })
            .collect()
    }

    pub fn taxonomy_entry(&self, damage_type: &str) -> Option<&DamageTaxonomyEntry> {
        self.taxonomy.iter().find(|e| e.damage_type == damage_type)
    }
}

fn default_orthography() -> Vec<OrthographyPair> {
    [
        ("ɓ", "b"),
        ("Ɓ", "B"),
        ("ɗ", "d"),
        ("Ɗ", "D"),
        ("ȿ", "sv"),
        ("ɀ", "zv"),
        ("ʋ", "v"),
        ("tʃ", "ch"),
        ("ʃ", "sh"),
        ("ʒ", "zh"),
        ("ŋ", "n'"),
    ]
    .into_iter()
    .map(|(archaic, modern)| OrthographyPair {
        archaic: archaic.to_string(),
        modern: modern.to_string(),
    })
    .collect()
}

fn default_figures() -> Vec<HistoricalFigure> {
    [
        (
            "Nehanda Charwe Nyakasikana",
            "1840–1898",
            "Spirit medium and leader of the 1896–97 rising in Mazowe",
        ),
        (
            "Sekuru Kaguvi",
            "c. 1850–1898",
            "Spirit medium, co-leader of the First Chimurenga",
        ),
        (
            "Lobengula Khumalo",
            "1845–1894",
            "Second and last king of the Northern Ndebele",
        ),
        (
            "Mzilikazi Khumalo",
            "c. 1790–1868",
            "Founder of the Ndebele kingdom at Bulawayo",
        ),
        (
            "Chaminuka",
            "19th century",
            "Shona spirit figure associated with Chitungwiza",
        ),
        (
            "Cecil John Rhodes",
            "1853–1902",
            "British South Africa Company; frequent subject of colonial-era correspondence",
        ),
    ]
    .into_iter()
    .map(|(name, era, note)| HistoricalFigure {
        name: name.to_string(),
        era: era.to_string(),
        note: note.to_string(),
    })
    .collect()
}

fn default_taxonomy() -> Vec<DamageTaxonomyEntry> {
    vec![
        DamageTaxonomyEntry {
            damage_type: "foxing".to_string(),
            severity: DamageSeverity::Minor,
            indicators: vec!["aged paper".to_string(), "sparse speckling".to_string()],
            recommendation: "Store below 50% relative humidity; do not bleach the spots"
                .to_string(),
        },
        DamageTaxonomyEntry {
            damage_type: "ink_fading".to_string(),
            severity: DamageSeverity::Moderate,
            indicators: vec!["low text density".to_string(), "weak stroke contrast".to_string()],
            recommendation: "Digitize under raking light before further handling".to_string(),
        },
        DamageTaxonomyEntry {
            damage_type: "water_damage".to_string(),
            severity: DamageSeverity::Severe,
            indicators: vec!["tide lines".to_string(), "cockled paper".to_string()],
            recommendation: "Interleave with blotting paper and flatten under weight".to_string(),
        },
        DamageTaxonomyEntry {
            damage_type: "edge_tearing".to_string(),
            severity: DamageSeverity::Moderate,
            indicators: vec!["losses at margins".to_string()],
            recommendation: "Mend with wheat-starch paste and Japanese tissue".to_string(),
        },
        DamageTaxonomyEntry {
            damage_type: "mold_staining".to_string(),
            severity: DamageSeverity::Severe,
            indicators: vec!["purple-grey blooms".to_string(), "musty residue".to_string()],
            recommendation: "Isolate from the rest of the collection; dry-clean with a soft brush"
                .to_string(),
        },
        DamageTaxonomyEntry {
            damage_type: "brittleness".to_string(),
            severity: DamageSeverity::Moderate,
            indicators: vec!["acidic paper stock".to_string()],
            recommendation: "Deacidify and rehouse in buffered folders".to_string(),
        },
    ]
}
