use std::collections::HashMap;
use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::EngineError;
use crate::message::ChatMessage;
use crate::player::PlayerState;
use crate::profile::PsychologicalProfile;

/// Persistence contract consumed by the engine. Backends are key-value
/// shaped; the engine never sees files or tables directly.
pub trait Storage: Send + Sync {
    fn load_player_state(&self, player_id: &str) -> Result<Option<PlayerState>, EngineError>;
    fn save_player_state(&self, player_id: &str, state: &PlayerState) -> Result<(), EngineError>;

    fn load_inventory(&self, player_id: &str) -> Result<Vec<String>, EngineError>;
    fn save_inventory(&self, player_id: &str, items: &[String]) -> Result<(), EngineError>;

    fn load_player_profile(
        &self,
        player_id: &str,
    ) -> Result<Option<PsychologicalProfile>, EngineError>;
    fn save_player_profile(
        &self,
        player_id: &str,
        profile: &PsychologicalProfile,
    ) -> Result<(), EngineError>;

    fn load_conversation(
        &self,
        player_id: &str,
        npc_code: &str,
    ) -> Result<Vec<ChatMessage>, EngineError>;
    fn save_conversation(
        &self,
        player_id: &str,
        npc_code: &str,
        messages: &[ChatMessage],
    ) -> Result<(), EngineError>;
}

pub const DATA_DIR: &str = "./data/players";

/// JSON-file backend, one directory per player.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl Default for FileStorage {
    fn default() -> Self {
        Self::new(DATA_DIR)
    }
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn player_dir(&self, player_id: &str) -> PathBuf {
        // Player ids are opaque strings; keep them filesystem-safe.
        let safe: String = player_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, EngineError> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        Ok(Some(serde_json::from_reader(file)?))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, value)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn load_player_state(&self, player_id: &str) -> Result<Option<PlayerState>, EngineError> {
        Self::read_json(&self.player_dir(player_id).join("state.json"))
    }

    fn save_player_state(&self, player_id: &str, state: &PlayerState) -> Result<(), EngineError> {
        Self::write_json(&self.player_dir(player_id).join("state.json"), state)
    }

    fn load_inventory(&self, player_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(Self::read_json(&self.player_dir(player_id).join("inventory.json"))?.unwrap_or_default())
    }

    fn save_inventory(&self, player_id: &str, items: &[String]) -> Result<(), EngineError> {
        Self::write_json(&self.player_dir(player_id).join("inventory.json"), &items)
    }

    fn load_player_profile(
        &self,
        player_id: &str,
    ) -> Result<Option<PsychologicalProfile>, EngineError> {
        Self::read_json(&self.player_dir(player_id).join("profile.json"))
    }

    fn save_player_profile(
        &self,
        player_id: &str,
        profile: &PsychologicalProfile,
    ) -> Result<(), EngineError> {
        Self::write_json(&self.player_dir(player_id).join("profile.json"), profile)
    }

    fn load_conversation(
        &self,
        player_id: &str,
        npc_code: &str,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        let path = self
            .player_dir(player_id)
            .join("conversations")
            .join(format!("{npc_code}.json"));
        Ok(Self::read_json(&path)?.unwrap_or_default())
    }

    fn save_conversation(
        &self,
        player_id: &str,
        npc_code: &str,
        messages: &[ChatMessage],
    ) -> Result<(), EngineError> {
        let path = self
            .player_dir(player_id)
            .join("conversations")
            .join(format!("{npc_code}.json"));
        Self::write_json(&path, &messages)
    }
}

/// In-memory backend for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    states: Mutex<HashMap<String, PlayerState>>,
    inventories: Mutex<HashMap<String, Vec<String>>>,
    profiles: Mutex<HashMap<String, PsychologicalProfile>>,
    conversations: Mutex<HashMap<(String, String), Vec<ChatMessage>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn load_player_state(&self, player_id: &str) -> Result<Option<PlayerState>, EngineError> {
        Ok(self.states.lock().expect("storage poisoned").get(player_id).cloned())
    }

    fn save_player_state(&self, player_id: &str, state: &PlayerState) -> Result<(), EngineError> {
        self.states
            .lock()
            .expect("storage poisoned")
            .insert(player_id.to_string(), state.clone());
        Ok(())
    }

    fn load_inventory(&self, player_id: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .inventories
            .lock()
            .expect("storage poisoned")
            .get(player_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_inventory(&self, player_id: &str, items: &[String]) -> Result<(), EngineError> {
        self.inventories
            .lock()
            .expect("storage poisoned")
            .insert(player_id.to_string(), items.to_vec());
        Ok(())
    }

    fn load_player_profile(
        &self,
        player_id: &str,
    ) -> Result<Option<PsychologicalProfile>, EngineError> {
        Ok(self.profiles.lock().expect("storage poisoned").get(player_id).cloned())
    }

    fn save_player_profile(
        &self,
        player_id: &str,
        profile: &PsychologicalProfile,
    ) -> Result<(), EngineError> {
        self.profiles
            .lock()
            .expect("storage poisoned")
            .insert(player_id.to_string(), profile.clone());
        Ok(())
    }

    fn load_conversation(
        &self,
        player_id: &str,
        npc_code: &str,
    ) -> Result<Vec<ChatMessage>, EngineError> {
        Ok(self
            .conversations
            .lock()
            .expect("storage poisoned")
            .get(&(player_id.to_string(), npc_code.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn save_conversation(
        &self,
        player_id: &str,
        npc_code: &str,
        messages: &[ChatMessage],
    ) -> Result<(), EngineError> {
        self.conversations
            .lock()
            .expect("storage poisoned")
            .insert((player_id.to_string(), npc_code.to_string()), messages.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::DEFAULT_CREDITS;

    fn exercise(storage: &dyn Storage) {
        assert!(storage.load_player_state("p1").unwrap().is_none());

        let mut state = PlayerState::default();
        assert_eq!(state.credits, DEFAULT_CREDITS);
        state.current_area = Some("Tavern".to_string());
        state.credits = 75;
        state
            .plot_flags
            .insert("met_garin".to_string(), serde_json::json!(true));
        storage.save_player_state("p1", &state).unwrap();

        storage
            .save_inventory("p1", &["healing potion".to_string(), "rare coin".to_string()])
            .unwrap();
        storage
            .save_conversation(
                "p1",
                "tavern.garin",
                &[ChatMessage::user("hello"), ChatMessage::assistant("hi")],
            )
            .unwrap();
        storage
            .save_player_profile("p1", &PsychologicalProfile::default())
            .unwrap();

        let reloaded = storage.load_player_state("p1").unwrap().unwrap();
        assert_eq!(reloaded.current_area.as_deref(), Some("Tavern"));
        assert_eq!(reloaded.credits, 75);
        assert_eq!(reloaded.plot_flags["met_garin"], serde_json::json!(true));
        assert_eq!(
            storage.load_inventory("p1").unwrap(),
            vec!["healing potion", "rare coin"]
        );
        assert_eq!(storage.load_conversation("p1", "tavern.garin").unwrap().len(), 2);
        assert_eq!(
            storage.load_player_profile("p1").unwrap().unwrap(),
            PsychologicalProfile::default()
        );
    }

    #[test]
    fn memory_backend_round_trips() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn file_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileStorage::new(dir.path()));
    }
}
