use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde::Serialize;
use tokio::time::{Duration, timeout};

use crate::chat::ChatSession;
use crate::command::Command;
use crate::directives::{Grant, extract_given_items, extract_notecard, world_client_directive};
use crate::error::EngineError;
use crate::intent::classify;
use crate::llm::GenerateRequest;
use crate::player::{PlayerSession, TurnContext, TurnStatus, normalize_item};
use crate::profile::PsychologicalProfile;
use crate::profile_update::{self, UpdateArgs};
use crate::stats::{CallStats, CallType};
use crate::system_msg::SystemMessageBuffer;

/// Fast-path join budget for the speculative intent classifier.
pub const CLASSIFIER_JOIN_BUDGET: Duration = Duration::from_millis(300);
/// Remaining wait for the speculative dialogue after the classifier
/// resolves, bounding the whole speculative phase near 1.5 s.
pub const SPECULATIVE_DIALOGUE_BUDGET: Duration = Duration::from_millis(1200);
/// Deadline for joining a pending profile update on session close.
pub const CLOSE_JOIN_DEADLINE: Duration = Duration::from_secs(2);

/// Everything one turn returns to the caller.
#[derive(Clone, Debug, Serialize)]
pub struct TurnOutcome {
    pub npc_response: String,
    pub system_messages: Vec<String>,
    pub player_id: String,
    pub current_area: Option<String>,
    pub current_npc_name: Option<String>,
    pub inventory: Vec<String>,
    pub credits: i64,
    pub profile_summary: String,
    pub status: &'static str,
    pub last_speaker_for_suffix: Option<String>,
    /// Pipe-delimited control-channel directive for the world client.
    pub world_directive: Option<String>,
}

enum Speculative {
    /// Classifier won with a confident command; dialogue loser discarded.
    Command(String),
    /// Speculative dialogue finished; its session is already committed.
    Reply(String),
    /// Neither resolved in budget; take the synchronous path.
    Fallthrough,
}

impl PlayerSession {
    /// One player utterance in, one structured outcome out. Never panics,
    /// never propagates an error to the caller.
    pub async fn process(&mut self, input: &str, skip_profile_update: bool) -> TurnOutcome {
        self.turn = TurnContext::default();
        let initial_profile = self.profile_snapshot();
        let mut out = SystemMessageBuffer::new();
        self.drain_pending_system(&mut out);

        let npc_response = match self.process_inner(input, &mut out).await {
            Ok(reply) => reply,
            Err(err) => {
                log::error!("turn failed for {}: {err}", self.id);
                if self.settings.debug_mode {
                    out.push(format!("debug: {err:?}"));
                }
                format!("[The world flickers and settles: {err}]")
            }
        };

        self.check_quest_match(&mut out);

        if !skip_profile_update && self.turn.status != TurnStatus::Exit {
            self.maybe_spawn_profile_update(&initial_profile);
        }

        if let Err(err) = self.persist_bundle() {
            log::error!("state persistence failed for {}: {err}", self.id);
        }
        if let Err(err) = self.persist_active_conversation() {
            log::error!("conversation persistence failed for {}: {err}", self.id);
        }

        let current_npc_name = self.chat.as_ref().map(|s| s.npc_name.clone());
        let world_directive = self.chat.as_ref().and_then(|session| {
            self.world
                .npc(&session.npc_code)
                .and_then(|npc| world_client_directive(npc, self.turn.notecard.as_ref()))
        });
        TurnOutcome {
            npc_response,
            system_messages: out.into_lines(),
            player_id: self.id.clone(),
            current_area: self.state.current_area.clone(),
            current_npc_name: current_npc_name.clone(),
            inventory: self.inventory.clone(),
            credits: self.state.credits,
            profile_summary: self.profile_snapshot().summary(),
            status: match self.turn.status {
                TurnStatus::Ok => "ok",
                TurnStatus::Exit => "exit",
            },
            last_speaker_for_suffix: self
                .turn
                .npc_produced_new_response
                .then_some(current_npc_name)
                .flatten(),
            world_directive,
        }
    }

    async fn process_inner(
        &mut self,
        input: &str,
        out: &mut SystemMessageBuffer,
    ) -> Result<String, EngineError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(String::new());
        }
        let mut pending = trimmed.to_string();
        let mut inference_hops = 0u8;
        loop {
            if pending.starts_with('/') {
                let cmd = match Command::parse(&pending) {
                    Ok(cmd) => cmd,
                    Err(err) => {
                        out.push(err.to_string());
                        return Ok(String::new());
                    }
                };
                self.dispatch_command(cmd, out).await?;
                if self.turn.status == TurnStatus::Exit {
                    return Ok(String::new());
                }
                if self.turn.force_reactive && self.chat.is_some() {
                    // The handler queued its own user message.
                    return self.run_dialogue(None, out).await;
                }
                return Ok(String::new());
            }

            self.ensure_active_session(out).await?;
            if !self.settings.nlp_command_interpretation_enabled || inference_hops >= 2 {
                return self.run_dialogue(Some(pending.clone()), out).await;
            }
            match self.speculative_turn(&pending).await? {
                Speculative::Command(inferred) => {
                    out.push(format!("(interpreted as {inferred})"));
                    pending = inferred;
                    inference_hops += 1;
                }
                Speculative::Reply(raw) => return self.commit_reply(raw, out),
                Speculative::Fallthrough => {
                    return self.run_dialogue(Some(pending.clone()), out).await;
                }
            }
        }
    }

    /// Launch classifier and speculative dialogue in parallel, reconcile on
    /// the classifier's verdict. Losers are dropped, not cancelled.
    async fn speculative_turn(&mut self, input: &str) -> Result<Speculative, EngineError> {
        let ctx = self.world_context();
        let gateway = Arc::clone(&self.gateway);
        let ledger = Arc::clone(&self.ledger);
        let model = self.settings.model_name.clone();
        let utterance = input.to_string();
        let classifier = tokio::spawn(async move {
            classify(gateway.as_ref(), ledger.as_ref(), &ctx, &utterance, &model).await
        });

        let dialogue = if self.in_hint_mode {
            None
        } else {
            self.chat.as_ref().map(|session| {
                // Deep copy: history side effects stay undoable until we
                // commit the whole session back.
                let mut speculative = session.clone();
                speculative.push_user(input);
                let messages = speculative.request_messages();
                let gateway = Arc::clone(&self.gateway);
                let model = self.settings.model_name.clone();
                tokio::spawn(async move {
                    let (raw, stats) =
                        gateway.generate(GenerateRequest::new(messages, model)).await;
                    (speculative, raw, stats)
                })
            })
        };

        let verdict = match timeout(CLASSIFIER_JOIN_BUDGET, classifier).await {
            Ok(Ok(verdict)) => Some(verdict),
            Ok(Err(join_err)) => {
                log::warn!("classifier task failed: {join_err}");
                None
            }
            Err(_) => None, // Too slow for the fast path; treat as dialogue.
        };
        if let Some(verdict) = verdict {
            let confident = verdict.is_command
                && verdict.confidence >= self.settings.nlp_command_confidence_threshold;
            if confident {
                if let Some(inferred) = verdict.inferred_command {
                    return Ok(Speculative::Command(inferred));
                }
            }
        }

        match dialogue {
            None => Ok(Speculative::Fallthrough),
            Some(handle) => match timeout(SPECULATIVE_DIALOGUE_BUDGET, handle).await {
                Ok(Ok((session, raw, stats))) => {
                    self.commit_session(session, stats);
                    Ok(Speculative::Reply(raw))
                }
                Ok(Err(join_err)) => {
                    log::warn!("speculative dialogue task failed: {join_err}");
                    Ok(Speculative::Fallthrough)
                }
                Err(_) => Ok(Speculative::Fallthrough),
            },
        }
    }

    fn commit_session(&mut self, mut session: ChatSession, stats: Option<CallStats>) {
        if let Some(stats) = stats {
            self.ledger.record(CallType::Dialogue, stats.clone());
            session.last_stats = Some(stats);
        }
        self.chat = Some(session);
    }

    /// Synchronous dialogue path: used for hint-mode chat, forced reactive
    /// turns, and speculative fall-through.
    async fn run_dialogue(
        &mut self,
        new_user_msg: Option<String>,
        out: &mut SystemMessageBuffer,
    ) -> Result<String, EngineError> {
        let messages = {
            let session = self.chat.as_mut().ok_or(EngineError::NoActiveSession)?;
            if let Some(msg) = new_user_msg {
                session.push_user(msg);
            }
            session.request_messages()
        };
        let model = self.settings.model_name.clone();
        let (raw, stats) = self
            .gateway
            .generate(GenerateRequest::new(messages, model))
            .await;
        if let Some(stats) = stats {
            self.ledger.record(CallType::Dialogue, stats.clone());
            if let Some(session) = &mut self.chat {
                session.last_stats = Some(stats);
            }
        }
        self.commit_reply(raw, out)
    }

    /// Turn raw LLM output into the visible reply: placeholder for empty
    /// text, side-channel extraction for the rest, cleaned text into
    /// history.
    fn commit_reply(
        &mut self,
        raw: String,
        out: &mut SystemMessageBuffer,
    ) -> Result<String, EngineError> {
        let npc_name = self
            .chat
            .as_ref()
            .map(|s| s.npc_name.clone())
            .ok_or(EngineError::NoActiveSession)?;

        if raw.trim().is_empty() {
            // Placeholder fallback, clearly marked; no grant processing.
            let placeholder = format!("*{npc_name} seems to ponder…*");
            if let Some(session) = &mut self.chat {
                session.push_assistant(placeholder.clone());
            }
            self.turn.npc_produced_new_response = true;
            return Ok(placeholder);
        }

        let (without_grants, grants) = extract_given_items(&raw);
        for grant in grants {
            match grant {
                Grant::Credits(amount) if amount < 0 => {
                    let cost = -amount;
                    if self.state.credits < cost {
                        out.push(format!(
                            "You cannot cover {cost} credits (balance: {}).",
                            self.state.credits
                        ));
                    } else {
                        self.state.credits -= cost;
                        self.turn.action_log.push(format!("paid {cost} credits"));
                    }
                }
                Grant::Credits(amount) => {
                    self.state.credits += amount;
                    self.turn
                        .action_log
                        .push(format!("received {amount} credits"));
                }
                Grant::Item(name) => {
                    let normalized = normalize_item(&name);
                    self.add_item(&name);
                    self.turn
                        .action_log
                        .push(format!("received {normalized} item"));
                }
            }
        }
        let (cleaned, notecard) = extract_notecard(&without_grants);
        if self.turn.notecard.is_none() {
            self.turn.notecard = notecard;
        }
        if let Some(session) = &mut self.chat {
            session.push_assistant(cleaned.clone());
        }
        self.turn.npc_produced_new_response = true;
        Ok(cleaned)
    }

    fn check_quest_match(&mut self, out: &mut SystemMessageBuffer) {
        let Some(item) = self.turn.gave_item.clone() else {
            return;
        };
        let Some(session) = &self.chat else { return };
        let Some(npc) = self.world.npc(&session.npc_code) else {
            return;
        };
        if !npc.needed_object.is_empty() && normalize_item(&npc.needed_object) == item {
            out.push(format!(
                "[GAME] {} received the needed object: {item}!",
                npc.name
            ));
            self.turn
                .action_log
                .push(format!("delivered the needed object {item} to {}", npc.name));
        }
    }

    /// Daemon-style profile re-scoring; the hot path never waits on it.
    fn maybe_spawn_profile_update(&mut self, initial: &PsychologicalProfile) {
        let has_signal =
            self.turn.npc_produced_new_response || !self.turn.action_log.is_empty();
        if !has_signal || self.in_hint_mode {
            return;
        }
        if self
            .pending_profile_update
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // An update is already in flight; this one is suppressed.
            return;
        }
        let args = UpdateArgs {
            gateway: Arc::clone(&self.gateway),
            ledger: Arc::clone(&self.ledger),
            storage: Arc::clone(&self.storage),
            player_id: self.id.clone(),
            profile: Arc::clone(&self.profile),
            snapshot: initial.clone(),
            recent_messages: self.chat.as_ref().map(|s| s.tail(4)).unwrap_or_default(),
            action_log: self.turn.action_log.clone(),
            model: self.settings.profile_model().to_string(),
            pending_flag: Arc::clone(&self.pending_profile_update),
        };
        self.profile_task = Some(tokio::spawn(profile_update::run(args)));
    }

    /// Explicit session close: bounded join on the profile updater, then a
    /// final persistence pass.
    pub async fn close(&mut self) -> Result<(), EngineError> {
        if let Some(handle) = self.profile_task.take() {
            match timeout(CLOSE_JOIN_DEADLINE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => log::warn!("profile task failed: {join_err}"),
                Err(_) => log::warn!("profile update still running at session close"),
            }
        }
        self.persist_bundle()?;
        self.persist_active_conversation()?;
        Ok(())
    }
}
