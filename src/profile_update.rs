use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::intent::extract_json_object;
use crate::llm::{ANALYSIS_TASK_PREFIX, GenerateRequest, TextGenerator};
use crate::message::ChatMessage;
use crate::profile::PsychologicalProfile;
use crate::stats::{CallType, StatsLedger};
use crate::storage::Storage;

/// What the analysis model is asked to return. Trait adjustments are
/// signed deltas encoded as strings ("+0.5", "-1"); unparsable entries
/// are skipped rather than failing the whole update.
#[derive(Debug, Default, Deserialize)]
pub struct ProfileAnalysis {
    #[serde(default)]
    pub trait_adjustments: BTreeMap<String, String>,
    #[serde(default)]
    pub new_decision_patterns: Vec<String>,
    #[serde(default)]
    pub new_key_experiences_tags: Vec<String>,
    #[serde(default)]
    pub updated_interaction_style_summary: String,
    #[serde(default)]
    pub updated_veil_perception: String,
    #[serde(default)]
    pub analysis_notes: String,
}

/// Everything the detached updater needs, captured at spawn time so the
/// task holds no reference into the player bundle.
pub struct UpdateArgs {
    pub gateway: Arc<dyn TextGenerator>,
    pub ledger: Arc<StatsLedger>,
    pub storage: Arc<dyn Storage>,
    pub player_id: String,
    pub profile: Arc<Mutex<PsychologicalProfile>>,
    pub snapshot: PsychologicalProfile,
    pub recent_messages: Vec<ChatMessage>,
    pub action_log: Vec<String>,
    pub model: String,
    pub pending_flag: Arc<AtomicBool>,
}

/// Detached profile re-scoring pass. Clears the in-flight flag on every
/// exit path; all failures are logged and swallowed.
pub async fn run(args: UpdateArgs) {
    let outcome = run_inner(&args).await;
    args.pending_flag.store(false, Ordering::SeqCst);
    if let Err(err) = outcome {
        log::warn!("profile update for {} failed: {err}", args.player_id);
    }
}

async fn run_inner(args: &UpdateArgs) -> Result<(), crate::error::EngineError> {
    let mut working = args.snapshot.clone();

    let analysis = request_analysis(args).await;
    let mut changed = apply_analysis(&mut working, &analysis);
    changed |= apply_action_rules(&mut working, &args.action_log);

    if !changed {
        return Ok(());
    }
    working.clamp_all();
    args.storage.save_player_profile(&args.player_id, &working)?;
    if let Ok(mut shared) = args.profile.lock() {
        *shared = working;
    }
    Ok(())
}

async fn request_analysis(args: &UpdateArgs) -> ProfileAnalysis {
    let transcript: Vec<String> = args
        .recent_messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect();
    let profile_json =
        serde_json::to_string_pretty(&args.snapshot).unwrap_or_else(|_| "{}".to_string());
    let prompt = format!(
        "{ANALYSIS_TASK_PREFIX} You maintain a psychological profile of a player in a \
         narrative game. Given the current profile, the most recent exchange, and the \
         player's mechanical actions this turn, emit a JSON object with any of these \
         keys: trait_adjustments (map of trait name to a signed delta string such as \
         \"+0.5\"), new_decision_patterns, new_key_experiences_tags, \
         updated_interaction_style_summary, updated_veil_perception, analysis_notes. \
         Omit keys with no change; respond with {{}} if nothing changed.\n\n\
         CURRENT PROFILE:\n{profile_json}\n\n\
         RECENT EXCHANGE:\n{}\n\n\
         ACTIONS THIS TURN:\n{}",
        transcript.join("\n"),
        if args.action_log.is_empty() {
            "(none)".to_string()
        } else {
            args.action_log.join("\n")
        }
    );
    let req = GenerateRequest::new(vec![ChatMessage::system(prompt)], &args.model);
    let (text, stats) = args.gateway.generate(req).await;
    if let Some(stats) = stats {
        args.ledger.record(CallType::Profile, stats);
    }
    match extract_json_object(&text).and_then(|v| serde_json::from_value(v).ok()) {
        Some(analysis) => analysis,
        None => {
            log::debug!("profile analysis had no usable JSON, applying action rules only");
            ProfileAnalysis::default()
        }
    }
}

fn apply_analysis(profile: &mut PsychologicalProfile, analysis: &ProfileAnalysis) -> bool {
    let mut changed = false;
    for (name, delta_text) in &analysis.trait_adjustments {
        let Ok(delta) = delta_text.trim().trim_start_matches('+').parse::<f64>() else {
            log::debug!("skipping unparsable trait delta {name}={delta_text:?}");
            continue;
        };
        if delta != 0.0 {
            profile.adjust_trait(name, delta);
            changed = true;
        }
    }
    if !analysis.new_decision_patterns.is_empty() {
        let before = profile.decision_patterns.len();
        PsychologicalProfile::merge_tags(
            &mut profile.decision_patterns,
            &analysis.new_decision_patterns,
        );
        changed |= profile.decision_patterns.len() != before;
    }
    if !analysis.new_key_experiences_tags.is_empty() {
        let before = profile.key_experiences_tags.len();
        PsychologicalProfile::merge_tags(
            &mut profile.key_experiences_tags,
            &analysis.new_key_experiences_tags,
        );
        changed |= profile.key_experiences_tags.len() != before;
    }
    let summary = analysis.updated_interaction_style_summary.trim();
    if !summary.is_empty() && summary != profile.interaction_style_summary {
        profile.interaction_style_summary = summary.to_string();
        changed = true;
    }
    let perception = analysis.updated_veil_perception.trim();
    if !perception.is_empty() && perception != profile.veil_perception {
        profile.veil_perception = perception.to_string();
        changed = true;
    }
    changed
}

static GAVE_CREDITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bgave (\d+) credits\b").unwrap());
static PAID_CREDITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bpaid (\d+) credits\b").unwrap());
static DELIVERED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bdelivered the needed object\b").unwrap());
static RECEIVED_ITEM_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\breceived .+ item\b").unwrap());

/// Mechanical actions always leave a trace, even when the analysis model
/// returns nothing: generosity nudges empathy, quest delivery nudges honor.
fn apply_action_rules(profile: &mut PsychologicalProfile, action_log: &[String]) -> bool {
    let mut changed = false;
    for action in action_log {
        if GAVE_CREDITS_RE.is_match(action) || action.to_lowercase().starts_with("gave ") {
            profile.adjust_trait("empathy", 0.2);
            PsychologicalProfile::merge_tags(
                &mut profile.key_experiences_tags,
                &["gave_away_possession".to_string()],
            );
            changed = true;
        }
        if PAID_CREDITS_RE.is_match(action) {
            profile.adjust_trait("pragmatism", 0.1);
            changed = true;
        }
        if RECEIVED_ITEM_RE.is_match(action) {
            PsychologicalProfile::merge_tags(
                &mut profile.key_experiences_tags,
                &["received_a_gift".to_string()],
            );
            changed = true;
        }
        if DELIVERED_RE.is_match(action) {
            profile.adjust_trait("honor", 0.3);
            PsychologicalProfile::merge_tags(
                &mut profile.key_experiences_tags,
                &["completed_a_request".to_string()],
            );
            changed = true;
        }
    }
    changed
}
