pub mod chat;
pub mod command;
pub mod directives;
pub mod engine;
pub mod error;
pub mod intent;
pub mod llm;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod player;
pub mod profile;
pub mod profile_update;
pub mod prompt;
pub mod settings;
pub mod stats;
pub mod storage;
pub mod system_msg;
pub mod world;

// Re-export commonly used items for easier access
pub use engine::Engine;
pub use error::{EngineError, GameError, LlmError};
pub use llm::{LlmGateway, ScriptedGateway, TextGenerator};
pub use message::{ChatMessage, Role};
pub use pipeline::TurnOutcome;
pub use player::PlayerSession;
pub use settings::Settings;
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use world::{NpcSheet, WorldModel, demo_world};
