use std::fs;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};

/// Which persistence backend the engine constructs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Filesystem,
    Memory,
}

// Engine configuration knobs, persisted as pretty JSON under ./data.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub model_name: String, // Default dialogue model.
    #[serde(default)]
    pub profile_analysis_model_name: Option<String>, // Defaults to model_name.
    #[serde(default)]
    pub wise_guide_model_name: Option<String>, // Guide selection only.
    pub nlp_command_interpretation_enabled: bool,
    pub nlp_command_confidence_threshold: f64,
    pub debug_mode: bool,
    #[serde(default)]
    pub storage_backend: StorageBackend,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub preferred_api_base: Option<String>,
    #[serde(default)]
    pub preferred_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            model_name: "gpt-4o-mini".to_string(),
            profile_analysis_model_name: None,
            wise_guide_model_name: None,
            nlp_command_interpretation_enabled: true,
            nlp_command_confidence_threshold: 0.7,
            debug_mode: false,
            storage_backend: StorageBackend::default(),
            openai_api_key: None,
            preferred_api_base: None,
            preferred_api_key: None,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    // Load settings from the default path, then let the environment win.
    pub fn load() -> io::Result<Self> {
        let mut settings = Self::load_settings_from_file("./data/settings.json")
            .unwrap_or_default();
        settings.apply_env_overrides();
        Ok(settings)
    }

    pub fn save(&self) -> io::Result<()> {
        fs::create_dir_all("./data")?;
        self.save_to_file("./data/settings.json")
    }

    pub fn load_settings_from_file(path: &str) -> io::Result<Self> {
        let data = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&data)?;
        Ok(settings)
    }

    pub fn save_to_file(&self, path: &str) -> io::Result<()> {
        let data = serde_json::to_string_pretty(self)?;
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(data.as_bytes())?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                self.openai_api_key = Some(key);
            }
        }
        if let Ok(base) = std::env::var("PREFERRED_API_BASE") {
            if !base.is_empty() {
                self.preferred_api_base = Some(base);
            }
        }
        if let Ok(key) = std::env::var("PREFERRED_API_KEY") {
            if !key.is_empty() {
                self.preferred_api_key = Some(key);
            }
        }
    }

    pub fn profile_model(&self) -> &str {
        self.profile_analysis_model_name
            .as_deref()
            .unwrap_or(&self.model_name)
    }

    pub fn guide_model(&self) -> &str {
        self.wise_guide_model_name
            .as_deref()
            .unwrap_or(&self.model_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_the_knobs() {
        let settings = Settings::default();
        assert!(settings.nlp_command_interpretation_enabled);
        assert_eq!(settings.nlp_command_confidence_threshold, 0.7);
        assert_eq!(settings.profile_model(), "gpt-4o-mini");
        assert_eq!(settings.guide_model(), "gpt-4o-mini");
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.model_name = "veil-chat-large".to_string();
        settings.storage_backend = StorageBackend::Memory;
        settings.save_to_file(path.to_str().unwrap()).unwrap();
        let loaded = Settings::load_settings_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.model_name, "veil-chat-large");
        assert_eq!(loaded.storage_backend, StorageBackend::Memory);
    }
}
