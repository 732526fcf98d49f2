use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const TRAIT_MIN: f64 = 1.0;
pub const TRAIT_MAX: f64 = 10.0;

pub const CORE_TRAITS: &[&str] = &[
    "curiosity",
    "caution",
    "empathy",
    "skepticism",
    "pragmatism",
    "aggression",
    "deception",
    "honor",
];

/// Psychological model of a player, re-scored asynchronously from recent
/// interactions. Maps are `BTreeMap` and tag lists stay sorted so the
/// persisted form is stable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PsychologicalProfile {
    pub core_traits: BTreeMap<String, f64>,
    pub decision_patterns: Vec<String>,
    pub veil_perception: String,
    pub interaction_style_summary: String,
    pub key_experiences_tags: Vec<String>,
    pub trust_levels: BTreeMap<String, f64>,
    pub inferred_motivations: Vec<String>,
}

impl Default for PsychologicalProfile {
    fn default() -> Self {
        let mut core_traits = BTreeMap::new();
        for name in CORE_TRAITS {
            let default_value = match *name {
                "aggression" => 3.0,
                "deception" => 2.0,
                _ => 5.0,
            };
            core_traits.insert((*name).to_string(), default_value);
        }
        let mut trust_levels = BTreeMap::new();
        trust_levels.insert("general".to_string(), 5.0);
        Self {
            core_traits,
            decision_patterns: Vec::new(),
            veil_perception: "neutral_curiosity".to_string(),
            interaction_style_summary: String::new(),
            key_experiences_tags: Vec::new(),
            trust_levels,
            inferred_motivations: Vec::new(),
        }
    }
}

impl PsychologicalProfile {
    /// Apply a signed adjustment to one trait, clamping into [1, 10] and
    /// rounding to one decimal.
    pub fn adjust_trait(&mut self, name: &str, delta: f64) {
        let entry = self
            .core_traits
            .entry(name.to_string())
            .or_insert(5.0);
        *entry = round_clamp(*entry + delta);
    }

    /// Re-clamp every trait. Idempotent; run after any bulk update.
    pub fn clamp_all(&mut self) {
        for value in self.core_traits.values_mut() {
            *value = round_clamp(*value);
        }
        for value in self.trust_levels.values_mut() {
            *value = round_clamp(*value);
        }
    }

    /// Merge tags into a list as a sorted set union.
    pub fn merge_tags(list: &mut Vec<String>, new_tags: &[String]) {
        for tag in new_tags {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            if !list.iter().any(|existing| existing == tag) {
                list.push(tag.to_string());
            }
        }
        list.sort();
        list.dedup();
    }

    /// One-paragraph summary used by the guide prompt and the turn outcome.
    pub fn summary(&self) -> String {
        let mut traits: Vec<String> = self
            .core_traits
            .iter()
            .map(|(name, value)| format!("{name} {value:.1}"))
            .collect();
        traits.sort();
        let mut parts = vec![format!("Traits: {}.", traits.join(", "))];
        if !self.decision_patterns.is_empty() {
            parts.push(format!(
                "Recent patterns: {}.",
                self.decision_patterns.join(", ")
            ));
        }
        if !self.inferred_motivations.is_empty() {
            parts.push(format!(
                "Motivations: {}.",
                self.inferred_motivations.join(", ")
            ));
        }
        parts.push(format!("Veil perception: {}.", self.veil_perception));
        if !self.interaction_style_summary.is_empty() {
            parts.push(self.interaction_style_summary.clone());
        }
        parts.join(" ")
    }

    /// Rule-based one-to-two-sentence hint about the player's apparent
    /// bent, used when the LLM distillation is unavailable.
    pub fn insight_hint(&self) -> String {
        let mut ranked: Vec<(&String, &f64)> = self.core_traits.iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        let top: Vec<String> = ranked
            .iter()
            .take(2)
            .map(|(name, value)| format!("{name} ({value:.0}/10)"))
            .collect();
        format!(
            "The player shows marked {}. Calibrate your tone accordingly.",
            top.join(" and ")
        )
    }

    /// Stable 8-hex-char digest over the sorted profile items; keys the
    /// per-NPC composed-prompt cache.
    pub fn short_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.core_traits {
            hasher.update(name.as_bytes());
            hasher.update(format!("{value:.1}").as_bytes());
        }
        for tag in self
            .decision_patterns
            .iter()
            .chain(self.key_experiences_tags.iter())
            .chain(self.inferred_motivations.iter())
        {
            hasher.update(tag.as_bytes());
        }
        hasher.update(self.veil_perception.as_bytes());
        hasher.update(self.interaction_style_summary.as_bytes());
        let digest = hasher.finalize();
        let hex = format!("{digest:x}");
        hex[..8].to_string()
    }
}

fn round_clamp(value: f64) -> f64 {
    let rounded = (value * 10.0).round() / 10.0;
    rounded.clamp(TRAIT_MIN, TRAIT_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_sheet() {
        let profile = PsychologicalProfile::default();
        assert_eq!(profile.core_traits["curiosity"], 5.0);
        assert_eq!(profile.core_traits["aggression"], 3.0);
        assert_eq!(profile.core_traits["deception"], 2.0);
        assert_eq!(profile.trust_levels["general"], 5.0);
        assert_eq!(profile.veil_perception, "neutral_curiosity");
    }

    #[test]
    fn adjustments_clamp_and_round() {
        let mut profile = PsychologicalProfile::default();
        profile.adjust_trait("curiosity", 7.35);
        assert_eq!(profile.core_traits["curiosity"], 10.0);
        profile.adjust_trait("deception", -9.0);
        assert_eq!(profile.core_traits["deception"], 1.0);
        profile.adjust_trait("empathy", 0.26);
        assert_eq!(profile.core_traits["empathy"], 5.3);
    }

    #[test]
    fn tag_merge_is_a_sorted_set_union() {
        let mut profile = PsychologicalProfile::default();
        PsychologicalProfile::merge_tags(
            &mut profile.key_experiences_tags,
            &["zeta".into(), "alpha".into()],
        );
        PsychologicalProfile::merge_tags(
            &mut profile.key_experiences_tags,
            &["alpha".into(), "mid".into(), " ".into()],
        );
        assert_eq!(profile.key_experiences_tags, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn hash_is_stable_and_tracks_changes() {
        let profile = PsychologicalProfile::default();
        let first = profile.short_hash();
        assert_eq!(first.len(), 8);
        assert_eq!(first, PsychologicalProfile::default().short_hash());

        let mut changed = profile.clone();
        changed.adjust_trait("honor", 1.0);
        assert_ne!(first, changed.short_hash());
    }
}
