use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::chat::ChatSession;
use crate::command::{Command, GiveWhat, Verb, help_text, parse_give};
use crate::error::EngineError;
use crate::intent::WorldContext;
use crate::llm::{ANALYSIS_TASK_PREFIX, GenerateRequest, TextGenerator};
use crate::message::ChatMessage;
use crate::profile::PsychologicalProfile;
use crate::prompt::{
    self, NpcPromptInputs, PRIOR_CONVERSATION_MAX_CHARS, compose_guide_prompt, compose_npc_prompt,
};
use crate::settings::Settings;
use crate::stats::StatsLedger;
use crate::storage::Storage;
use crate::system_msg::SystemMessageBuffer;
use crate::world::{Notecard, WorldModel};

pub const DEFAULT_CREDITS: i64 = 220;

/// Context caches (composed prompts, hint sessions) expire after this.
pub const CACHE_TTL: Duration = Duration::from_secs(300);

fn default_credits() -> i64 {
    DEFAULT_CREDITS
}

/// Durable per-player state, exactly what the storage contract carries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerState {
    #[serde(default)]
    pub current_area: Option<String>,
    #[serde(default)]
    pub current_npc_code: Option<String>,
    #[serde(default)]
    pub plot_flags: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_credits")]
    pub credits: i64,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            current_area: None,
            current_npc_code: None,
            plot_flags: BTreeMap::new(),
            credits: DEFAULT_CREDITS,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TurnStatus {
    #[default]
    Ok,
    Exit,
}

/// Ephemeral per-turn record.
#[derive(Debug, Default)]
pub struct TurnContext {
    pub action_log: Vec<String>,
    pub npc_produced_new_response: bool,
    pub force_reactive: bool,
    pub gave_item: Option<String>,
    pub notecard: Option<Notecard>,
    pub status: TurnStatus,
}

struct HintCacheEntry {
    fingerprint: String,
    session: ChatSession,
    created: Instant,
}

/// Item names are stored lowercased and trimmed; normalization is
/// idempotent by construction.
pub fn normalize_item(name: &str) -> String {
    name.trim().to_lowercase()
}

/// The player bundle: everything one player owns, mutated only through
/// `process` (the caller serializes turns per player).
pub struct PlayerSession {
    pub id: String,
    pub world: Arc<WorldModel>,
    pub gateway: Arc<dyn TextGenerator>,
    pub ledger: Arc<StatsLedger>,
    pub storage: Arc<dyn Storage>,
    pub settings: Settings,

    pub state: PlayerState,
    pub inventory: Vec<String>,
    pub profile: Arc<Mutex<PsychologicalProfile>>,

    pub chat: Option<ChatSession>,
    pub stashed_chat: Option<ChatSession>,
    pub in_hint_mode: bool,

    pub pending_profile_update: Arc<AtomicBool>,
    pub profile_task: Option<JoinHandle<()>>,

    pub turn: TurnContext,
    pending_system: Vec<String>,
    prompt_cache: HashMap<String, (Instant, String)>,
    hint_cache: Option<HintCacheEntry>,
}

impl PlayerSession {
    /// Load (or lazily create) a player from storage. New players get the
    /// default 220 credits and a welcome line on their first turn.
    pub fn load(
        id: impl Into<String>,
        world: Arc<WorldModel>,
        gateway: Arc<dyn TextGenerator>,
        ledger: Arc<StatsLedger>,
        storage: Arc<dyn Storage>,
        settings: Settings,
    ) -> Result<Self, EngineError> {
        let id = id.into();
        let stored = storage.load_player_state(&id)?;
        let is_new = stored.is_none();
        let state = stored.unwrap_or_default();
        let inventory: Vec<String> = storage
            .load_inventory(&id)?
            .iter()
            .map(|item| normalize_item(item))
            .filter(|item| !item.is_empty())
            .collect();
        let profile = storage.load_player_profile(&id)?.unwrap_or_default();

        let mut pending_system = Vec::new();
        if is_new {
            pending_system
                .push("Welcome, Seeker. Speak freely, or type /help for commands.".to_string());
        }

        Ok(Self {
            id,
            world,
            gateway,
            ledger,
            storage,
            settings,
            state,
            inventory,
            profile: Arc::new(Mutex::new(profile)),
            chat: None,
            stashed_chat: None,
            in_hint_mode: false,
            pending_profile_update: Arc::new(AtomicBool::new(false)),
            profile_task: None,
            turn: TurnContext::default(),
            pending_system,
            prompt_cache: HashMap::new(),
            hint_cache: None,
        })
    }

    pub fn profile_snapshot(&self) -> PsychologicalProfile {
        self.profile.lock().expect("profile poisoned").clone()
    }

    pub(crate) fn drain_pending_system(&mut self, out: &mut SystemMessageBuffer) {
        for line in self.pending_system.drain(..) {
            out.push(line);
        }
    }

    pub fn world_context(&self) -> WorldContext {
        WorldContext {
            current_area: self.state.current_area.clone(),
            current_npc: self
                .chat
                .as_ref()
                .map(|session| session.npc_name.clone()),
            areas: self.world.areas(),
            in_hint_mode: self.in_hint_mode,
        }
    }

    // ---- inventory ----------------------------------------------------

    /// Insert normalized; duplicates collapse.
    pub fn add_item(&mut self, name: &str) {
        let normalized = normalize_item(name);
        if normalized.is_empty() {
            return;
        }
        if !self.inventory.contains(&normalized) {
            self.inventory.push(normalized);
        }
    }

    /// Remove by partial match against the first containing entry.
    pub fn remove_item(&mut self, query: &str) -> Option<String> {
        let normalized = normalize_item(query);
        if normalized.is_empty() {
            return None;
        }
        let position = self
            .inventory
            .iter()
            .position(|item| item.contains(&normalized))?;
        Some(self.inventory.remove(position))
    }

    pub fn has_item(&self, query: &str) -> bool {
        let normalized = normalize_item(query);
        !normalized.is_empty() && self.inventory.iter().any(|item| item.contains(&normalized))
    }

    fn inventory_listing(&self) -> String {
        if self.inventory.is_empty() {
            format!("Your pack is empty. Credits: {}.", self.state.credits)
        } else {
            format!(
                "You carry: {}. Credits: {}.",
                self.inventory.join(", "),
                self.state.credits
            )
        }
    }

    // ---- sessions -----------------------------------------------------

    /// Distill a one-to-two-sentence player hint for a regular NPC via the
    /// gateway; any failure degrades to the rule-based hint.
    async fn distill_profile_insights(&self) -> String {
        let snapshot = self.profile_snapshot();
        let prompt = format!(
            "{ANALYSIS_TASK_PREFIX} In one or two sentences, tell a character what \
             kind of person this player seems to be, from this profile JSON. Plain \
             text only.\n{}",
            serde_json::to_string(&snapshot).unwrap_or_default()
        );
        let mut req = GenerateRequest::new(
            vec![ChatMessage::system(prompt)],
            self.settings.profile_model(),
        );
        req.collect_stats = false;
        let (text, _) = self.gateway.generate(req).await;
        let text = text.trim();
        if text.is_empty() || text.starts_with("[LLM_ERROR") || text.len() > 400 {
            snapshot.insight_hint()
        } else {
            text.to_string()
        }
    }

    /// Composed-prompt cache, keyed by NPC, profile hash, and a hash of the
    /// prior-conversation distillate. Time-based invalidation only.
    async fn npc_system_prompt(
        &mut self,
        npc_code: &str,
        prior: Option<(&str, &[ChatMessage])>,
    ) -> Result<String, EngineError> {
        let npc = self
            .world
            .npc(npc_code)
            .ok_or_else(|| EngineError::Game(crate::error::GameError::UnknownNpc(npc_code.into())))?
            .clone();
        let profile_hash = self.profile_snapshot().short_hash();
        let prior_hash = match prior {
            None => "none".to_string(),
            Some((name, messages)) => {
                let distilled =
                    prompt::distill_conversation(messages, name, PRIOR_CONVERSATION_MAX_CHARS);
                let digest = Sha256::digest(distilled.as_bytes());
                format!("{digest:x}")[..8].to_string()
            }
        };
        let key = format!("{npc_code}:{profile_hash}:{prior_hash}");
        if let Some((created, cached)) = self.prompt_cache.get(&key) {
            if created.elapsed() < CACHE_TTL {
                return Ok(cached.clone());
            }
        }
        // The guide always gets the consultation composer and its tighter
        // budget; everyone else gets the regular NPC prompt with distilled
        // player insights.
        let composed = if self.world.is_wise_guide(npc_code) {
            compose_guide_prompt(&npc, self.world.storyboard(), &self.profile_snapshot(), prior)
        } else {
            let insights = self.distill_profile_insights().await;
            compose_npc_prompt(&NpcPromptInputs {
                npc: &npc,
                storyboard: self.world.storyboard(),
                profile_insights: Some(&insights),
                prior_conversation: prior,
            })
        };
        self.prompt_cache
            .insert(key, (Instant::now(), composed.clone()));
        Ok(composed)
    }

    /// Persist the active session's transcript. The stored copy ends with a
    /// break sentinel; the in-memory transcript is left untouched. Hint-mode
    /// guide sessions are never persisted.
    pub(crate) fn persist_active_conversation(&self) -> Result<(), EngineError> {
        if self.in_hint_mode {
            return Ok(());
        }
        let Some(session) = &self.chat else {
            return Ok(());
        };
        if session.messages.is_empty() {
            return Ok(());
        }
        let mut stored = session.clone();
        stored.ensure_break_sentinel("session saved");
        self.storage
            .save_conversation(&self.id, &session.npc_code, &stored.messages)
    }

    /// Close and persist the active session before switching NPC or area.
    fn close_active_session(&mut self, reason: &str) -> Result<(), EngineError> {
        let Some(mut session) = self.chat.take() else {
            return Ok(());
        };
        if !self.in_hint_mode && !session.messages.is_empty() {
            session.ensure_break_sentinel(reason);
            self.storage
                .save_conversation(&self.id, &session.npc_code, &session.messages)?;
        }
        Ok(())
    }

    /// Open a session with an NPC: cached prompt, persisted transcript,
    /// resume sentinel, greeting line.
    pub(crate) async fn open_session(
        &mut self,
        npc_code: &str,
        prior: Option<(&str, &[ChatMessage])>,
        out: &mut SystemMessageBuffer,
    ) -> Result<(), EngineError> {
        let system_prompt = self.npc_system_prompt(npc_code, prior).await?;
        let npc = self
            .world
            .npc(npc_code)
            .ok_or_else(|| EngineError::Game(crate::error::GameError::UnknownNpc(npc_code.into())))?
            .clone();
        let mut session = ChatSession::new(&npc.code, &npc.name, system_prompt);
        session.messages = self.storage.load_conversation(&self.id, &npc.code)?;
        session.inject_resume_sentinel("the player returns");
        self.state.current_npc_code = Some(npc.code.clone());
        self.state.current_area = Some(npc.area.clone());
        if session.messages.is_empty() && !npc.default_greeting.is_empty() {
            out.push(format!("{} greets you: {}", npc.name, npc.default_greeting));
        }
        self.chat = Some(session);
        Ok(())
    }

    /// Make sure a session exists: first contact lands on the wise guide.
    pub(crate) async fn ensure_active_session(
        &mut self,
        out: &mut SystemMessageBuffer,
    ) -> Result<(), EngineError> {
        if self.chat.is_some() {
            return Ok(());
        }
        let code = self
            .state
            .current_npc_code
            .clone()
            .filter(|code| self.world.npc(code).is_some())
            .unwrap_or_else(|| self.world.wise_guide_code().to_string());
        self.open_session(&code, None, out).await
    }

    // ---- command handlers --------------------------------------------

    fn refuse_in_hint_mode(&self, out: &mut SystemMessageBuffer) -> bool {
        if self.in_hint_mode {
            out.push("Finish the consultation first: /endhint.");
            true
        } else {
            false
        }
    }

    pub(crate) async fn dispatch_command(
        &mut self,
        cmd: Command,
        out: &mut SystemMessageBuffer,
    ) -> Result<(), EngineError> {
        match cmd.verb {
            Verb::Exit => {
                self.turn.status = TurnStatus::Exit;
                out.push("Farewell, Seeker.");
            }
            Verb::Help => out.push(help_text()),
            Verb::Go => self.cmd_go(&cmd.arg, out).await?,
            Verb::Talk => self.cmd_talk(&cmd.arg, out).await?,
            Verb::Who => self.cmd_who(out),
            Verb::Whereami => {
                let area = self.state.current_area.as_deref().unwrap_or("nowhere yet");
                match &self.chat {
                    Some(session) => {
                        out.push(format!("You are in the {area}, with {}.", session.npc_name))
                    }
                    None => out.push(format!("You are in the {area}, alone.")),
                }
            }
            Verb::Npcs => {
                for (area, sheets) in self.world.list_npcs_by_area() {
                    let names: Vec<&str> =
                        sheets.iter().map(|sheet| sheet.name.as_str()).collect();
                    out.push(format!("{area}: {}", names.join(", ")));
                }
            }
            Verb::Areas => out.push(format!("Known areas: {}.", self.world.areas().join(", "))),
            Verb::Inventory => out.push(self.inventory_listing()),
            Verb::Give => self.cmd_give(&cmd.arg, out)?,
            Verb::Receive => self.cmd_receive(&cmd.arg, out)?,
            Verb::Hint => self.cmd_hint(out).await?,
            Verb::Endhint => self.cmd_endhint(out),
            Verb::Profile => {
                let summary = self.profile_snapshot().summary();
                out.push(summary);
            }
            Verb::History => self.cmd_history(out),
            Verb::Clear => {
                if let Some(session) = &mut self.chat {
                    session.clear_messages();
                    out.push("The conversation fades from memory.");
                } else {
                    out.push("No conversation to clear.");
                }
            }
            Verb::Stats => out.push(self.ledger.session_summary()),
        }
        Ok(())
    }

    async fn cmd_go(&mut self, fragment: &str, out: &mut SystemMessageBuffer) -> Result<(), EngineError> {
        if self.refuse_in_hint_mode(out) {
            return Ok(());
        }
        let mut matches = self.world.find_areas(fragment);
        matches.sort();
        match matches.len() {
            0 => out.push(format!("No area matches '{fragment}'.")),
            1 => {
                let area = matches.remove(0);
                if self.state.current_area.as_deref() == Some(area.as_str()) {
                    out.push(format!("You are already in the {area}."));
                    return Ok(());
                }
                self.close_active_session("the player moved on")?;
                let Some(npc_code) = self.world.default_npc(&area).map(|n| n.code.clone()) else {
                    out.push(format!("The {area} is deserted."));
                    self.state.current_area = Some(area);
                    return Ok(());
                };
                self.state.current_area = Some(area.clone());
                out.push(format!("You arrive in the {area}."));
                self.open_session(&npc_code, None, out).await?;
                self.turn.action_log.push(format!("moved to the {area}"));
            }
            _ => out.push(format!("Did you mean one of: {}?", matches.join(", "))),
        }
        Ok(())
    }

    async fn cmd_talk(&mut self, target: &str, out: &mut SystemMessageBuffer) -> Result<(), EngineError> {
        if self.refuse_in_hint_mode(out) {
            return Ok(());
        }
        let Some(area) = self.state.current_area.clone() else {
            out.push("You are nowhere yet; /go somewhere first.");
            return Ok(());
        };
        let current_code = self.chat.as_ref().map(|s| s.npc_code.clone());
        let picked_code = if target.trim() == "." {
            let others: Vec<String> = self
                .world
                .npcs_in_area(&area)
                .iter()
                .filter(|sheet| Some(&sheet.code) != current_code.as_ref())
                .map(|sheet| sheet.code.clone())
                .collect();
            if others.is_empty() {
                out.push("There is nobody else here.");
                return Ok(());
            }
            // ThreadRng is not Send; scope it away from the await below.
            let index = {
                use rand::Rng;
                rand::rng().random_range(0..others.len())
            };
            others[index].clone()
        } else {
            match self.world.get_npc(&area, target) {
                Some(sheet) => sheet.code.clone(),
                None => {
                    out.push(format!("Nobody called '{target}' is here."));
                    return Ok(());
                }
            }
        };
        if current_code.as_deref() == Some(picked_code.as_str()) {
            let name = self.chat.as_ref().map(|s| s.npc_name.clone()).unwrap_or_default();
            out.push(format!("You are already talking with {name}."));
            return Ok(());
        }
        let prior = self.chat.as_ref().map(|session| {
            (session.npc_name.clone(), session.messages.clone())
        });
        self.close_active_session("the player turned away")?;
        let prior_ref = prior
            .as_ref()
            .map(|(name, messages)| (name.as_str(), messages.as_slice()));
        self.open_session(&picked_code, prior_ref, out).await?;
        let name = self.chat.as_ref().map(|s| s.npc_name.clone()).unwrap_or_default();
        self.turn.action_log.push(format!("started talking with {name}"));
        Ok(())
    }

    fn cmd_who(&self, out: &mut SystemMessageBuffer) {
        match self.state.current_area.as_deref() {
            None => out.push("You are nowhere yet."),
            Some(area) => {
                let names: Vec<String> = self
                    .world
                    .npcs_in_area(area)
                    .iter()
                    .map(|sheet| sheet.name.clone())
                    .collect();
                out.push(format!("In the {area}: {}.", names.join(", ")));
            }
        }
    }

    fn cmd_give(&mut self, arg: &str, out: &mut SystemMessageBuffer) -> Result<(), EngineError> {
        if self.refuse_in_hint_mode(out) {
            return Ok(());
        }
        let Some(npc_name) = self.chat.as_ref().map(|s| s.npc_name.clone()) else {
            out.push("There is nobody here to give anything to.");
            return Ok(());
        };
        match parse_give(arg) {
            GiveWhat::Credits(amount) => {
                if amount <= 0 {
                    out.push("That is not an amount you can give.");
                    return Ok(());
                }
                if self.state.credits < amount {
                    out.push(format!(
                        "You don't have enough credits (balance: {}).",
                        self.state.credits
                    ));
                    return Ok(());
                }
                self.state.credits -= amount;
                self.turn
                    .action_log
                    .push(format!("gave {amount} credits to {npc_name}"));
                if let Some(session) = &mut self.chat {
                    session.push_user(format!("You hand {amount} credits to {npc_name}."));
                }
                self.turn.force_reactive = true;
            }
            GiveWhat::Item(raw_name) => {
                let Some(removed) = self.remove_item(&raw_name) else {
                    out.push(format!("You don't carry any '{raw_name}'."));
                    return Ok(());
                };
                self.turn
                    .action_log
                    .push(format!("gave item {removed} to {npc_name}"));
                self.turn.gave_item = Some(removed);
                if let Some(session) = &mut self.chat {
                    // Echo the player's own wording in the dialogue.
                    session.push_user(format!("You hand {} to {npc_name}.", raw_name.trim()));
                }
                self.turn.force_reactive = true;
            }
        }
        Ok(())
    }

    fn cmd_receive(&mut self, item: &str, out: &mut SystemMessageBuffer) -> Result<(), EngineError> {
        let Some(session) = &mut self.chat else {
            out.push("There is nobody here to ask.");
            return Ok(());
        };
        let item = item.trim();
        session.push_user(format!("Dammi {item}."));
        let npc_name = session.npc_name.clone();
        self.turn
            .action_log
            .push(format!("asked {npc_name} for {item}"));
        self.turn.force_reactive = true;
        Ok(())
    }

    fn hint_fingerprint(&self, summary: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(summary.as_bytes());
        // Plot flags steer the guide's advice; changed flags invalidate.
        hasher.update(
            serde_json::to_string(&self.state.plot_flags).unwrap_or_default().as_bytes(),
        );
        format!("{:x}", hasher.finalize())
    }

    async fn cmd_hint(&mut self, out: &mut SystemMessageBuffer) -> Result<(), EngineError> {
        if self.in_hint_mode {
            out.push("You are already consulting the guide.");
            return Ok(());
        }
        let Some(guide) = self.world.wise_guide().cloned() else {
            out.push("No guide inhabits this world.");
            return Ok(());
        };
        let Some(current) = self.chat.take() else {
            out.push("Start a conversation first; the guide advises on what you are doing.");
            return Ok(());
        };
        let summary = prompt::distill_conversation(
            &current.messages,
            &current.npc_name,
            PRIOR_CONVERSATION_MAX_CHARS,
        );
        let fingerprint = self.hint_fingerprint(&summary);

        let cached = self.hint_cache.take().filter(|entry| {
            entry.fingerprint == fingerprint && entry.created.elapsed() < CACHE_TTL
        });
        let guide_session = match cached {
            Some(entry) => {
                out.push(format!("{} takes up where you left off.", guide.name));
                entry.session
            }
            None => {
                let profile = self.profile_snapshot();
                let system_prompt = compose_guide_prompt(
                    &guide,
                    self.world.storyboard(),
                    &profile,
                    Some((current.npc_name.as_str(), current.messages.as_slice())),
                );
                out.push(format!("You step aside to consult {}.", guide.name));
                ChatSession::new(&guide.code, &guide.name, system_prompt)
            }
        };
        self.stashed_chat = Some(current);
        self.chat = Some(guide_session);
        self.in_hint_mode = true;
        self.turn.action_log.push("consulted the wise guide".to_string());
        Ok(())
    }

    fn cmd_endhint(&mut self, out: &mut SystemMessageBuffer) {
        if !self.in_hint_mode {
            out.push("You are not consulting the guide.");
            return;
        }
        let guide_session = self.chat.take();
        if let Some(session) = guide_session {
            let summary_source = self
                .stashed_chat
                .as_ref()
                .map(|stash| {
                    prompt::distill_conversation(
                        &stash.messages,
                        &stash.npc_name,
                        PRIOR_CONVERSATION_MAX_CHARS,
                    )
                })
                .unwrap_or_default();
            self.hint_cache = Some(HintCacheEntry {
                fingerprint: self.hint_fingerprint(&summary_source),
                session,
                created: Instant::now(),
            });
        }
        self.in_hint_mode = false;
        let restored = self.stashed_chat.take();
        if let Some(session) = restored {
            out.push(format!("You return to {}.", session.npc_name));
            self.state.current_npc_code = Some(session.npc_code.clone());
            self.chat = Some(session);
        } else {
            self.state.current_npc_code = None;
        }
    }

    fn cmd_history(&self, out: &mut SystemMessageBuffer) {
        let Some(session) = &self.chat else {
            out.push("No conversation yet.");
            return;
        };
        if session.messages.is_empty() {
            out.push("Nothing has been said yet.");
            return;
        }
        for msg in &session.messages {
            match msg.role {
                crate::message::Role::User => out.push(format!("You: {}", msg.content)),
                crate::message::Role::Assistant => {
                    out.push(format!("{}: {}", session.npc_name, msg.content))
                }
                crate::message::Role::System => {}
            }
        }
    }

    // ---- persistence --------------------------------------------------

    /// Persist aggregated state, inventory, and profile. Conversation
    /// persistence is separate (`persist_active_conversation`).
    pub(crate) fn persist_bundle(&self) -> Result<(), EngineError> {
        self.storage.save_player_state(&self.id, &self.state)?;
        self.storage.save_inventory(&self.id, &self.inventory)?;
        self.storage
            .save_player_profile(&self.id, &self.profile_snapshot())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedGateway;
    use crate::storage::MemoryStorage;
    use crate::world::demo_world;

    fn session() -> PlayerSession {
        PlayerSession::load(
            "p1",
            Arc::new(demo_world()),
            Arc::new(ScriptedGateway::new(vec![]).with_fallback("…")),
            Arc::new(StatsLedger::new()),
            Arc::new(MemoryStorage::new()),
            Settings::default(),
        )
        .unwrap()
    }

    #[test]
    fn new_player_defaults() {
        let player = session();
        assert_eq!(player.state.credits, DEFAULT_CREDITS);
        assert!(player.inventory.is_empty());
        assert!(player.state.current_area.is_none());
        assert!(!player.pending_system.is_empty());
    }

    #[test]
    fn inventory_normalizes_and_collapses_duplicates() {
        let mut player = session();
        player.add_item("  Rare Coin ");
        player.add_item("rare coin");
        assert_eq!(player.inventory, vec!["rare coin"]);
        assert!(player.has_item("Coin"));
        assert_eq!(player.remove_item("COIN"), Some("rare coin".to_string()));
        assert!(player.inventory.is_empty());
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_item("  Healing POTION ");
        assert_eq!(once, normalize_item(&once));
    }

    #[tokio::test]
    async fn insufficient_credits_is_a_no_op() {
        let mut player = session();
        player.state.credits = 10;
        let mut out = SystemMessageBuffer::new();
        player.ensure_active_session(&mut out).await.unwrap();
        player.cmd_give("50 Credits", &mut out).unwrap();
        assert_eq!(player.state.credits, 10);
        assert!(!player.turn.force_reactive);
        assert!(out.lines().iter().any(|l| l.contains("enough credits")));
    }

    #[tokio::test]
    async fn go_with_ambiguous_fragment_reports_candidates() {
        let mut player = session();
        let mut out = SystemMessageBuffer::new();
        // Both demo areas contain the letter 'a'.
        player.cmd_go("a", &mut out).await.unwrap();
        assert!(player.state.current_area.is_none());
        assert!(out.lines().iter().any(|l| l.contains("Sanctum, Tavern")));
    }

    #[tokio::test]
    async fn talk_same_npc_twice_leaves_history_alone() {
        let mut player = session();
        let mut out = SystemMessageBuffer::new();
        player.cmd_go("Tavern", &mut out).await.unwrap();
        player.chat.as_mut().unwrap().push_user("hello");
        let before = player.chat.as_ref().unwrap().messages.clone();
        player.cmd_talk("Garin", &mut out).await.unwrap();
        assert_eq!(player.chat.as_ref().unwrap().messages, before);
    }

    #[tokio::test]
    async fn hint_stashes_and_endhint_restores() {
        let mut player = session();
        let mut out = SystemMessageBuffer::new();
        player.cmd_go("Tavern", &mut out).await.unwrap();
        player.chat.as_mut().unwrap().push_user("about that coin");
        let garin_messages = player.chat.as_ref().unwrap().messages.clone();

        player.cmd_hint(&mut out).await.unwrap();
        assert!(player.in_hint_mode);
        assert!(player.stashed_chat.is_some());
        let guide = player.chat.as_ref().unwrap();
        assert_eq!(guide.npc_code, "sanctum.elowen");
        assert!(guide.system_prompt.contains("about that coin"));

        player.cmd_endhint(&mut out);
        assert!(!player.in_hint_mode);
        assert!(player.stashed_chat.is_none());
        let restored = player.chat.as_ref().unwrap();
        assert_eq!(restored.npc_code, "tavern.garin");
        assert_eq!(restored.messages, garin_messages);
    }

    #[tokio::test]
    async fn give_and_go_are_refused_in_hint_mode() {
        let mut player = session();
        let mut out = SystemMessageBuffer::new();
        player.cmd_go("Tavern", &mut out).await.unwrap();
        player.cmd_hint(&mut out).await.unwrap();

        let mut out = SystemMessageBuffer::new();
        player.cmd_give("rare coin", &mut out).unwrap();
        player.cmd_go("Sanctum", &mut out).await.unwrap();
        assert_eq!(
            out.lines()
                .iter()
                .filter(|l| l.contains("/endhint"))
                .count(),
            2
        );
        assert_eq!(player.state.current_area.as_deref(), Some("Tavern"));
    }
}
