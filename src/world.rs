use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::llm::{ANALYSIS_TASK_PREFIX, GenerateRequest, TextGenerator};
use crate::message::ChatMessage;
use crate::stats::{CallType, StatsLedger};

/// Persistent document an NPC can hand to the world client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notecard {
    pub name: String,
    pub content: String,
}

/// Read-only character sheet, loaded at process start. The `code` is a
/// filesystem-style dotted path and is the stable identifier everywhere.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NpcSheet {
    pub code: String,
    pub name: String,
    pub area: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub motivation: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub player_hint: String,
    #[serde(default)]
    pub needed_object: String,
    #[serde(default)]
    pub treasure: String,
    #[serde(default)]
    pub dialogue_hooks: String,
    #[serde(default)]
    pub veil_connection: String,
    #[serde(default)]
    pub default_greeting: String,
    // Side-channel metadata passed through to the world client.
    #[serde(default)]
    pub emote: Option<String>,
    #[serde(default)]
    pub animation: Option<String>,
    #[serde(default)]
    pub lookup: Option<String>,
    #[serde(default)]
    pub text_overlay: Option<String>,
    #[serde(default)]
    pub teleport_to: Option<String>,
    #[serde(default)]
    pub notecard: Option<Notecard>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorldFile {
    storyboard: String,
    npcs: Vec<NpcSheet>,
}

/// Shared, read-only world: NPC sheets keyed by code, the storyboard text,
/// and the selected wise guide.
#[derive(Clone, Debug, Default)]
pub struct WorldModel {
    npcs: BTreeMap<String, NpcSheet>,
    storyboard: String,
    wise_guide_code: String,
}

impl WorldModel {
    pub fn new(storyboard: String, sheets: Vec<NpcSheet>) -> Self {
        let mut npcs = BTreeMap::new();
        for sheet in sheets {
            npcs.insert(sheet.code.clone(), sheet);
        }
        let mut world = Self {
            npcs,
            storyboard,
            wise_guide_code: String::new(),
        };
        world.wise_guide_code = world.fallback_guide_code().unwrap_or_default();
        world
    }

    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let data = std::fs::read_to_string(path)?;
        let file: WorldFile = serde_json::from_str(&data)?;
        Ok(Self::new(file.storyboard, file.npcs))
    }

    pub fn storyboard(&self) -> &str {
        &self.storyboard
    }

    pub fn npc(&self, code: &str) -> Option<&NpcSheet> {
        self.npcs.get(code)
    }

    /// Case-insensitive name prefix lookup within one area.
    pub fn get_npc(&self, area: &str, name: &str) -> Option<&NpcSheet> {
        let prefix = name.to_lowercase();
        self.npcs_in_area(area)
            .into_iter()
            .find(|sheet| sheet.name.to_lowercase().starts_with(&prefix))
    }

    /// First NPC of an area, ordered by display name.
    pub fn default_npc(&self, area: &str) -> Option<&NpcSheet> {
        self.npcs_in_area(area).into_iter().next()
    }

    pub fn npcs_in_area(&self, area: &str) -> Vec<&NpcSheet> {
        let mut sheets: Vec<&NpcSheet> = self
            .npcs
            .values()
            .filter(|sheet| sheet.area.eq_ignore_ascii_case(area))
            .collect();
        sheets.sort_by(|a, b| a.name.cmp(&b.name));
        sheets
    }

    pub fn list_npcs_by_area(&self) -> BTreeMap<String, Vec<&NpcSheet>> {
        let mut by_area: BTreeMap<String, Vec<&NpcSheet>> = BTreeMap::new();
        for sheet in self.npcs.values() {
            by_area.entry(sheet.area.clone()).or_default().push(sheet);
        }
        for sheets in by_area.values_mut() {
            sheets.sort_by(|a, b| a.name.cmp(&b.name));
        }
        by_area
    }

    /// Area names are derived from the NPC set, sorted for stable listings.
    pub fn areas(&self) -> Vec<String> {
        self.list_npcs_by_area().into_keys().collect()
    }

    /// Case-insensitive all-words-present match over the known areas.
    /// Returns every candidate; the caller decides what a non-unique match
    /// means.
    pub fn find_areas(&self, fragment: &str) -> Vec<String> {
        let words: Vec<String> = fragment
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        if words.is_empty() {
            return Vec::new();
        }
        self.areas()
            .into_iter()
            .filter(|area| {
                let lower = area.to_lowercase();
                words.iter().all(|word| lower.contains(word.as_str()))
            })
            .collect()
    }

    pub fn wise_guide(&self) -> Option<&NpcSheet> {
        self.npcs.get(&self.wise_guide_code)
    }

    pub fn wise_guide_code(&self) -> &str {
        &self.wise_guide_code
    }

    pub fn is_wise_guide(&self, code: &str) -> bool {
        code == self.wise_guide_code
    }

    fn fallback_guide_code(&self) -> Option<String> {
        const GUIDE_WORDS: &[&str] = &["guide", "wise", "sage", "keeper", "oracle"];
        self.npcs
            .values()
            .find(|sheet| {
                let role = sheet.role.to_lowercase();
                GUIDE_WORDS.iter().any(|word| role.contains(word))
            })
            .map(|sheet| sheet.code.clone())
            .or_else(|| self.npcs.keys().next().cloned())
    }

    /// One LLM call at world load picks the guide from the sheet set;
    /// anything short of a clean verdict falls back to the role heuristic.
    pub async fn select_wise_guide(
        &mut self,
        gateway: &dyn TextGenerator,
        ledger: &StatsLedger,
        model: &str,
    ) {
        let roster: Vec<String> = self
            .npcs
            .values()
            .map(|sheet| format!("{} - {} ({})", sheet.code, sheet.name, sheet.role))
            .collect();
        let prompt = format!(
            "{ANALYSIS_TASK_PREFIX} From the NPC roster below, pick the one best suited \
             to act as the story's wise guide and hint-giver. Respond with a JSON object \
             {{\"npc_code\": \"<code>\"}} and nothing else.\n{}",
            roster.join("\n")
        );
        let req = GenerateRequest::new(vec![ChatMessage::system(prompt)], model);
        let (text, stats) = gateway.generate(req).await;
        if let Some(stats) = stats {
            ledger.record(CallType::GuideSelection, stats);
        }
        let picked = crate::intent::extract_json_object(&text)
            .and_then(|value| value.get("npc_code").and_then(|v| v.as_str()).map(String::from))
            .filter(|code| self.npcs.contains_key(code));
        match picked {
            Some(code) => self.wise_guide_code = code,
            None => {
                log::warn!("guide selection returned no usable code, keeping fallback");
            }
        }
    }
}

/// Built-in minimal world for the CLI harness and tests.
pub fn demo_world() -> WorldModel {
    let storyboard = "Beyond the Veil lies Oblivion, and between them drift the last \
        free towns of the Reach. Seekers cross the Veil chasing memories the world \
        has already given up.\n\nThe Tavern of the Split Lantern serves as neutral \
        ground; the Sanctum above it keeps the old records.\n\nNobody who enters \
        Oblivion returns unchanged, and the Veil keeps its own ledger of debts."
        .to_string();

    let npcs = vec![
        NpcSheet {
            code: "sanctum.elowen".to_string(),
            name: "Elowen".to_string(),
            area: "Sanctum".to_string(),
            role: "Wise guide and keeper of the records".to_string(),
            motivation: "Preserve what the Veil erases".to_string(),
            goal: "Prepare the Seeker for the crossing".to_string(),
            player_hint: "Ask her about the ledger of debts".to_string(),
            dialogue_hooks: "Speaks in measured, archival cadence; quotes old entries."
                .to_string(),
            veil_connection: "Has crossed the Veil twice and remembers both times."
                .to_string(),
            default_greeting: "The records said you would come.".to_string(),
            ..Default::default()
        },
        NpcSheet {
            code: "tavern.garin".to_string(),
            name: "Garin".to_string(),
            area: "Tavern".to_string(),
            role: "Innkeeper".to_string(),
            motivation: "Keep the Split Lantern out of the Veil's ledger".to_string(),
            goal: "Recover the coin he lost to a Seeker".to_string(),
            player_hint: "He pays well for rare coinage".to_string(),
            needed_object: "rare coin".to_string(),
            treasure: "cellar key".to_string(),
            dialogue_hooks: "Gruff, fair, superstitious about Oblivion.".to_string(),
            default_greeting: "Mind the lantern. What'll it be?".to_string(),
            ..Default::default()
        },
        NpcSheet {
            code: "tavern.mira".to_string(),
            name: "Mira".to_string(),
            area: "Tavern".to_string(),
            role: "Traveling cartographer".to_string(),
            motivation: "Map the drift of the free towns".to_string(),
            goal: "Trade maps for stories of the crossing".to_string(),
            player_hint: "Her maps show more than roads".to_string(),
            dialogue_hooks: "Quick, curious, always sketching.".to_string(),
            ..Default::default()
        },
    ];

    WorldModel::new(storyboard, npcs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_world_picks_the_keeper_as_guide() {
        let world = demo_world();
        assert_eq!(world.wise_guide_code(), "sanctum.elowen");
        assert_eq!(world.wise_guide().unwrap().name, "Elowen");
    }

    #[test]
    fn default_npc_is_first_by_name() {
        let world = demo_world();
        assert_eq!(world.default_npc("Tavern").unwrap().name, "Garin");
    }

    #[test]
    fn area_match_requires_all_words() {
        let world = demo_world();
        assert_eq!(world.find_areas("tav"), vec!["Tavern".to_string()]);
        assert_eq!(world.find_areas("tav sanct"), Vec::<String>::new());
        assert_eq!(world.areas(), vec!["Sanctum".to_string(), "Tavern".to_string()]);
    }

    #[test]
    fn npc_prefix_lookup_is_case_insensitive() {
        let world = demo_world();
        assert_eq!(world.get_npc("Tavern", "mi").unwrap().name, "Mira");
        assert!(world.get_npc("Sanctum", "garin").is_none());
    }
}
