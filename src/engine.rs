use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::llm::TextGenerator;
use crate::pipeline::TurnOutcome;
use crate::player::PlayerSession;
use crate::settings::Settings;
use crate::stats::StatsLedger;
use crate::storage::Storage;
use crate::world::WorldModel;

/// Process-wide engine: shared world, gateway and ledger, plus one lazily
/// created [`PlayerSession`] per player id. Each session sits behind its
/// own async mutex so turns for one player serialize while different
/// players run concurrently.
pub struct Engine {
    pub world: Arc<WorldModel>,
    pub gateway: Arc<dyn TextGenerator>,
    pub ledger: Arc<StatsLedger>,
    pub storage: Arc<dyn Storage>,
    pub settings: Settings,
    players: Mutex<HashMap<String, Arc<tokio::sync::Mutex<PlayerSession>>>>,
}

impl Engine {
    pub fn new(
        world: WorldModel,
        gateway: Arc<dyn TextGenerator>,
        ledger: Arc<StatsLedger>,
        storage: Arc<dyn Storage>,
        settings: Settings,
    ) -> Self {
        Self {
            world: Arc::new(world),
            gateway,
            ledger,
            storage,
            settings,
            players: Mutex::new(HashMap::new()),
        }
    }

    /// Handle to a player's session, created lazily on first access. The
    /// same handle is returned until [`Self::close_player_session`].
    pub fn get_player_system(
        &self,
        player_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<PlayerSession>>, EngineError> {
        let mut players = self
            .players
            .lock()
            .map_err(|_| EngineError::Storage("player table lock poisoned".to_string()))?;
        if let Some(existing) = players.get(player_id) {
            return Ok(Arc::clone(existing));
        }
        let session = PlayerSession::load(
            player_id,
            Arc::clone(&self.world),
            Arc::clone(&self.gateway),
            Arc::clone(&self.ledger),
            Arc::clone(&self.storage),
            self.settings.clone(),
        )?;
        let handle = Arc::new(tokio::sync::Mutex::new(session));
        players.insert(player_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// One turn for one player. The error path collapses into a diagnostic
    /// outcome inside `process`; only session creation can fail here.
    pub async fn process_turn(
        &self,
        player_id: &str,
        input: &str,
    ) -> Result<TurnOutcome, EngineError> {
        let handle = self.get_player_system(player_id)?;
        let mut session = handle.lock().await;
        Ok(session.process(input, false).await)
    }

    /// Drop a player from the live table after a bounded join on any
    /// in-flight profile update and a final persistence pass.
    pub async fn close_player_session(&self, player_id: &str) -> Result<(), EngineError> {
        let handle = {
            let mut players = self
                .players
                .lock()
                .map_err(|_| EngineError::Storage("player table lock poisoned".to_string()))?;
            players.remove(player_id)
        };
        let Some(handle) = handle else {
            return Ok(());
        };
        let mut session = handle.lock().await;
        session.close().await
    }

    pub fn session_summary(&self) -> String {
        self.ledger.session_summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGateway;
    use crate::storage::MemoryStorage;
    use crate::world::demo_world;

    fn offline_engine() -> Engine {
        let mut settings = Settings::new();
        settings.nlp_command_interpretation_enabled = false;
        Engine::new(
            demo_world(),
            Arc::new(ScriptedGateway::new(vec![])),
            Arc::new(StatsLedger::new()),
            Arc::new(MemoryStorage::new()),
            settings,
        )
    }

    #[tokio::test]
    async fn sessions_are_created_lazily_and_reused() {
        let engine = offline_engine();
        let first = engine.get_player_system("ada").unwrap();
        let again = engine.get_player_system("ada").unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        engine.close_player_session("ada").await.unwrap();
        let fresh = engine.get_player_system("ada").unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[tokio::test]
    async fn injected_ledger_is_the_one_the_engine_reports_from() {
        let ledger = Arc::new(StatsLedger::new());
        let mut settings = Settings::new();
        settings.nlp_command_interpretation_enabled = false;
        let engine = Engine::new(
            demo_world(),
            Arc::new(ScriptedGateway::new(vec![])),
            Arc::clone(&ledger),
            Arc::new(MemoryStorage::new()),
            settings,
        );
        assert!(Arc::ptr_eq(&engine.ledger, &ledger));
        assert_eq!(engine.session_summary(), ledger.session_summary());
    }

    #[tokio::test]
    async fn closing_an_unknown_player_is_a_no_op() {
        let engine = offline_engine();
        engine.close_player_session("nobody").await.unwrap();
    }
}
