use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{GenerateRequest, TextGenerator};
use crate::message::ChatMessage;
use crate::stats::{CallType, StatsLedger};

/// Verdict on one free-form utterance: command or dialogue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntentVerdict {
    pub is_command: bool,
    pub inferred_command: Option<String>,
    pub confidence: f64,
    pub reasoning: String,
}

impl IntentVerdict {
    pub fn dialogue(reasoning: impl Into<String>) -> Self {
        Self {
            is_command: false,
            inferred_command: None,
            confidence: 0.8,
            reasoning: reasoning.into(),
        }
    }

    pub fn command(inferred: impl Into<String>, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            is_command: true,
            inferred_command: Some(inferred.into()),
            confidence,
            reasoning: reasoning.into(),
        }
    }
}

/// Snapshot of the world state the classifier reasons about; captured once
/// at turn start so the speculative task needs no locks.
#[derive(Clone, Debug, Default)]
pub struct WorldContext {
    pub current_area: Option<String>,
    pub current_npc: Option<String>,
    pub areas: Vec<String>,
    pub in_hint_mode: bool,
}

/// Italian↔English area vocabulary shared by the LLM prompt and the rule
/// fallback.
const AREA_SYNONYMS: &[(&str, &str)] = &[
    ("taverna", "tavern"),
    ("locanda", "tavern"),
    ("santuario", "sanctum"),
    ("mercato", "market"),
    ("piazza", "square"),
    ("biblioteca", "library"),
];

const GO_VERBS: &[&str] = &[
    "go to", "head to", "move to", "travel to", "walk to", "vai", "andare", "andiamo",
];
const TALK_VERBS: &[&str] = &["talk to", "speak to", "speak with", "parla con", "parlare con"];
const GIVE_ME_FORMS: &[&str] = &["give me ", "hand me ", "dammi ", "dacci "];
const INVENTORY_WORDS: &[&str] = &["inventory", "inventario", "my items", "what do i have"];

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("fence regex"));
static IS_COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""is_command"\s*:\s*(true|false)"#).expect("is_command regex"));
static CONFIDENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""confidence"\s*:\s*([0-9]*\.?[0-9]+)"#).expect("confidence regex"));
static INFERRED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""inferred_command"\s*:\s*"([^"]*)""#).expect("inferred regex"));

/// Pull a JSON object out of free text: direct parse, then fenced block,
/// then the outermost brace span.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }
    if let Some(caps) = FENCE_RE.captures(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn classification_prompt(ctx: &WorldContext, input: &str) -> String {
    let synonyms: Vec<String> = AREA_SYNONYMS
        .iter()
        .map(|(it, en)| format!("{it}={en}"))
        .collect();
    format!(
        "You classify one player utterance for a text adventure as either a slash \
         command or in-character dialogue.\n\
         Known commands: /go <area>, /talk <npc>, /give <item|N Credits>, /receive <item>, \
         /inventory, /who, /whereami, /npcs, /areas, /hint, /endhint, /profile, /history, \
         /clear, /stats, /help, /exit.\n\
         Current area: {area}. Current NPC: {npc}. Available areas: {areas}. \
         Hint mode: {hint}.\n\
         Area-name synonyms: {synonyms}.\n\
         Rules: verbs of going somewhere mean /go <area>; asking a character to hand \
         something over (\"give me X\", \"dammi X\") means /receive <X>; polite inquiries \
         (\"do you have X?\") are dialogue; talk of collecting or picking things up is \
         dialogue; addressing a character by name to chat means /talk <name>.\n\
         Respond with exactly one JSON object: {{\"is_command\": bool, \
         \"inferred_command\": string or null, \"confidence\": number 0..1, \
         \"reasoning\": string}}. No prose, no fences.\n\
         Utterance: {input:?}",
        area = ctx.current_area.as_deref().unwrap_or("none"),
        npc = ctx.current_npc.as_deref().unwrap_or("none"),
        areas = ctx.areas.join(", "),
        hint = ctx.in_hint_mode,
        synonyms = synonyms.join(", "),
    )
}

fn parse_verdict(text: &str) -> Option<IntentVerdict> {
    if let Some(value) = extract_json_object(text) {
        let is_command = value.get("is_command")?.as_bool()?;
        let confidence = value
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        let inferred_command = value
            .get("inferred_command")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);
        let reasoning = value
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Some(IntentVerdict {
            is_command,
            inferred_command,
            confidence,
            reasoning,
        });
    }
    // Field-level rescue from malformed JSON.
    let is_command = IS_COMMAND_RE.captures(text)?.get(1)?.as_str() == "true";
    let confidence = CONFIDENCE_RE
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);
    let inferred_command = INFERRED_RE
        .captures(text)
        .map(|c| c[1].to_string())
        .filter(|s| !s.is_empty());
    Some(IntentVerdict {
        is_command,
        inferred_command,
        confidence,
        reasoning: "recovered from malformed classifier output".to_string(),
    })
}

/// Resolve an area mention against the context, applying the synonym table.
fn match_area(ctx: &WorldContext, mention: &str) -> Option<String> {
    let mut mention = mention.trim().trim_end_matches(['.', '!', '?']).to_lowercase();
    for (it, en) in AREA_SYNONYMS {
        if mention.contains(it) {
            mention = (*en).to_string();
            break;
        }
    }
    ctx.areas
        .iter()
        .find(|area| {
            let lower = area.to_lowercase();
            lower.contains(&mention) || mention.contains(&lower)
        })
        .cloned()
}

/// Deterministic keyword matcher; the terminal fallback. Always yields a
/// valid verdict.
pub fn rule_classify(ctx: &WorldContext, input: &str) -> IntentVerdict {
    let lower = input.trim().to_lowercase();
    if lower.starts_with('/') {
        return IntentVerdict::command(input.trim(), 1.0, "already a slash command");
    }
    for form in GIVE_ME_FORMS {
        if let Some(rest) = lower.strip_prefix(form) {
            let item = rest.trim().trim_end_matches(['.', '!', '?']);
            if !item.is_empty() {
                return IntentVerdict::command(
                    format!("/receive {item}"),
                    0.9,
                    "imperative request for an item",
                );
            }
        }
    }
    for verb in TALK_VERBS {
        if let Some(pos) = lower.find(verb) {
            let name = lower[pos + verb.len()..]
                .trim()
                .trim_end_matches(['.', '!', '?']);
            if !name.is_empty() {
                return IntentVerdict::command(
                    format!("/talk {name}"),
                    0.85,
                    "talk verb with a target",
                );
            }
        }
    }
    for verb in GO_VERBS {
        if let Some(pos) = lower.find(verb) {
            let mut tail = lower[pos + verb.len()..].trim();
            for article in ["alla ", "allo ", "al ", "the ", "a ", "in "] {
                if let Some(rest) = tail.strip_prefix(article) {
                    tail = rest;
                    break;
                }
            }
            if let Some(area) = match_area(ctx, tail) {
                return IntentVerdict::command(
                    format!("/go {area}"),
                    0.9,
                    "directional verb with a known area",
                );
            }
        }
    }
    if INVENTORY_WORDS.iter().any(|w| lower.contains(w)) {
        return IntentVerdict::command("/inventory", 0.8, "inventory keyword");
    }
    IntentVerdict::dialogue("no command keywords matched")
}

/// Primary path: the LLM classifies; every parse failure degrades to the
/// rule fallback. Stats are recorded under `command_interpretation`.
pub async fn classify(
    gateway: &dyn TextGenerator,
    ledger: &StatsLedger,
    ctx: &WorldContext,
    input: &str,
    model: &str,
) -> IntentVerdict {
    let req = GenerateRequest::new(
        vec![ChatMessage::user(classification_prompt(ctx, input))],
        model,
    );
    let (text, stats) = gateway.generate(req).await;
    let errored = stats.as_ref().is_some_and(|s| s.error.is_some());
    if let Some(stats) = stats {
        ledger.record(CallType::CommandInterpretation, stats);
    }
    if !errored {
        if let Some(verdict) = parse_verdict(&text) {
            return verdict;
        }
        log::debug!("classifier output unparseable, using rule fallback: {text}");
    }
    rule_classify(ctx, input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WorldContext {
        WorldContext {
            current_area: Some("Sanctum".into()),
            current_npc: Some("Elowen".into()),
            areas: vec!["Sanctum".into(), "Tavern".into()],
            in_hint_mode: false,
        }
    }

    #[test]
    fn extracts_fenced_json() {
        let value =
            extract_json_object("sure!\n```json\n{\"is_command\": true}\n```").unwrap();
        assert_eq!(value["is_command"], Value::Bool(true));
    }

    #[test]
    fn extracts_inline_brace_span() {
        let value = extract_json_object("verdict: {\"confidence\": 0.9} done").unwrap();
        assert_eq!(value["confidence"], 0.9);
    }

    #[test]
    fn parse_verdict_rescues_broken_json() {
        let verdict = parse_verdict(
            "\"is_command\": true, \"inferred_command\": \"/go Tavern\", \"confidence\": 0.82,",
        )
        .unwrap();
        assert!(verdict.is_command);
        assert_eq!(verdict.inferred_command.as_deref(), Some("/go Tavern"));
        assert!((verdict.confidence - 0.82).abs() < 1e-9);
    }

    #[test]
    fn rule_fallback_maps_italian_go() {
        let verdict = rule_classify(&ctx(), "voglio andare alla taverna");
        assert!(verdict.is_command);
        assert_eq!(verdict.inferred_command.as_deref(), Some("/go Tavern"));
        assert!(verdict.confidence >= 0.7);
    }

    #[test]
    fn rule_fallback_maps_give_me_to_receive() {
        let verdict = rule_classify(&ctx(), "Dammi la mappa.");
        assert!(verdict.is_command);
        assert_eq!(verdict.inferred_command.as_deref(), Some("/receive la mappa"));
    }

    #[test]
    fn polite_inquiry_stays_dialogue() {
        let verdict = rule_classify(&ctx(), "do you happen to sell maps?");
        assert!(!verdict.is_command);
    }

    #[tokio::test]
    async fn classify_records_stats_and_falls_back() {
        use crate::llm::ScriptedGateway;

        let gateway = ScriptedGateway::new(vec!["not json at all".into()]);
        let ledger = StatsLedger::new();
        let verdict = classify(&gateway, &ledger, &ctx(), "hello there", "test-model").await;
        assert!(!verdict.is_command);
        assert_eq!(ledger.call_count(CallType::CommandInterpretation), 1);
    }
}
