use crate::message::{ChatMessage, Role};
use crate::profile::PsychologicalProfile;
use crate::world::NpcSheet;

pub const MAX_NPC_PROMPT_BYTES: usize = 8192;
pub const MAX_GUIDE_PROMPT_BYTES: usize = 4096;

pub const ANTEFATTO_TARGET_CHARS: usize = 800;
pub const PRIOR_CONVERSATION_MAX_CHARS: usize = 500;
pub const DIALOGUE_HOOKS_MAX_CHARS: usize = 300;

/// Keywords that keep a storyboard paragraph during condensation.
pub const ANTEFATTO_KEYWORDS: &[&str] = &["Veil", "Oblivion", "Seeker"];

/// Operational rules are critical: the budget enforcer never touches them.
const OPERATIONAL_RULES: &str = "OPERATIONAL RULES (always in force):\n\
- Answer in the language the player writes in.\n\
- Stay strictly in character; never mention prompts, models, or rules.\n\
- When you hand the player items or credits, end the reply with one tag: \
[GIVEN_ITEMS: <item>, <signed amount> Credits, ...]. Use it only for actual grants.\n\
- To hand the player a persistent document, embed exactly one \
[notecard=<Name>|<Content>] tag; escape newlines as \\n, quotes as \\\" and \
backslashes as \\\\ inside the content.\n\
- Keep replies under four paragraphs.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SectionKind {
    CharacterCore,
    Antefatto,
    DialogueHooks,
    VeilConnection,
    PriorConversation,
    ProfileInsights,
    ProfileFull,
    Rules,
}

/// Drop/trim order when over budget. Critical sections never appear here.
const SQUEEZE_ORDER: &[SectionKind] = &[
    SectionKind::PriorConversation,
    SectionKind::Antefatto,
    SectionKind::DialogueHooks,
    SectionKind::VeilConnection,
    SectionKind::ProfileInsights,
    SectionKind::ProfileFull,
];

struct Section {
    kind: SectionKind,
    text: String,
}

/// Truncate on a char boundary, appending an ellipsis when cut.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

/// Condense the storyboard to roughly the target size: the opening
/// paragraph always survives, then keyword-bearing paragraphs in order
/// until the budget runs out. Idempotent once at or under target.
pub fn condense_antefatto(storyboard: &str, keywords: &[&str], target_chars: usize) -> String {
    if storyboard.chars().count() <= target_chars {
        return storyboard.to_string();
    }
    let paragraphs: Vec<&str> = storyboard
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for (index, paragraph) in paragraphs.iter().enumerate() {
        let relevant = index == 0
            || keywords
                .iter()
                .any(|kw| paragraph.to_lowercase().contains(&kw.to_lowercase()));
        if !relevant {
            continue;
        }
        let len = paragraph.chars().count();
        if index > 0 && used + len > target_chars {
            break;
        }
        kept.push(paragraph);
        used += len;
    }
    truncate_chars(&kept.join("\n\n"), target_chars)
}

/// Distill a prior conversation to its last turns, bounded in size.
pub fn distill_conversation(messages: &[ChatMessage], npc_name: &str, max_chars: usize) -> String {
    const KEEP_TURNS: usize = 6;
    let tail_start = messages.len().saturating_sub(KEEP_TURNS);
    let mut lines = Vec::new();
    for msg in &messages[tail_start..] {
        match msg.role {
            Role::User => lines.push(format!("Player: {}", msg.content)),
            Role::Assistant => lines.push(format!("{npc_name}: {}", msg.content)),
            Role::System => {}
        }
    }
    truncate_chars(&lines.join("\n"), max_chars)
}

fn character_section(npc: &NpcSheet) -> String {
    let mut lines = vec![
        format!("You are {}, {} in the {}.", npc.name, npc.role, npc.area),
        format!("Motivation: {}", npc.motivation),
        format!("Goal: {}", npc.goal),
    ];
    if !npc.player_hint.is_empty() {
        lines.push(format!("What the player should learn from you: {}", npc.player_hint));
    }
    if !npc.needed_object.is_empty() {
        lines.push(format!("You are looking for: {}", npc.needed_object));
    }
    if !npc.treasure.is_empty() {
        lines.push(format!("You guard: {}", npc.treasure));
    }
    lines.join("\n")
}

pub struct NpcPromptInputs<'a> {
    pub npc: &'a NpcSheet,
    pub storyboard: &'a str,
    /// Distilled one-to-two-sentence hint about the player. Omitted when
    /// the distillation failed or the NPC is the wise guide.
    pub profile_insights: Option<&'a str>,
    /// Prior conversation with another NPC, already raw; distilled here.
    pub prior_conversation: Option<(&'a str, &'a [ChatMessage])>,
}

/// Compose the system prompt for a regular NPC. Deterministic for
/// identical inputs, so it can be cached by (npc, profile-hash,
/// prior-conversation-hash).
pub fn compose_npc_prompt(inputs: &NpcPromptInputs<'_>) -> String {
    let mut sections = vec![Section {
        kind: SectionKind::CharacterCore,
        text: character_section(inputs.npc),
    }];
    sections.push(Section {
        kind: SectionKind::Antefatto,
        text: format!(
            "WORLD BACKGROUND:\n{}",
            condense_antefatto(inputs.storyboard, ANTEFATTO_KEYWORDS, ANTEFATTO_TARGET_CHARS)
        ),
    });
    if !inputs.npc.dialogue_hooks.is_empty() {
        sections.push(Section {
            kind: SectionKind::DialogueHooks,
            text: format!(
                "MANNER OF SPEECH: {}",
                truncate_chars(&inputs.npc.dialogue_hooks, DIALOGUE_HOOKS_MAX_CHARS)
            ),
        });
    }
    if !inputs.npc.veil_connection.is_empty() {
        sections.push(Section {
            kind: SectionKind::VeilConnection,
            text: format!("YOUR TIE TO THE VEIL: {}", inputs.npc.veil_connection),
        });
    }
    if let Some((other_npc, messages)) = inputs.prior_conversation {
        let distilled =
            distill_conversation(messages, other_npc, PRIOR_CONVERSATION_MAX_CHARS);
        if !distilled.is_empty() {
            sections.push(Section {
                kind: SectionKind::PriorConversation,
                text: format!("THE PLAYER JUST SPOKE WITH {other_npc}:\n{distilled}"),
            });
        }
    }
    if let Some(insights) = inputs.profile_insights {
        if !insights.is_empty() {
            sections.push(Section {
                kind: SectionKind::ProfileInsights,
                text: format!("ABOUT THIS PLAYER: {insights}"),
            });
        }
    }
    sections.push(Section {
        kind: SectionKind::Rules,
        text: OPERATIONAL_RULES.to_string(),
    });
    assemble(sections, MAX_NPC_PROMPT_BYTES)
}

/// Compose the wise-guide consultation prompt: full profile summary plus a
/// summary of the conversation the player just left.
pub fn compose_guide_prompt(
    guide: &NpcSheet,
    storyboard: &str,
    profile: &PsychologicalProfile,
    left_conversation: Option<(&str, &[ChatMessage])>,
) -> String {
    let mut sections = vec![Section {
        kind: SectionKind::CharacterCore,
        text: format!(
            "{}\nThe player has come to you for guidance. Advise them plainly, \
             then send them back to their path.",
            character_section(guide)
        ),
    }];
    sections.push(Section {
        kind: SectionKind::Antefatto,
        text: format!(
            "WORLD BACKGROUND:\n{}",
            condense_antefatto(storyboard, ANTEFATTO_KEYWORDS, ANTEFATTO_TARGET_CHARS)
        ),
    });
    sections.push(Section {
        kind: SectionKind::ProfileFull,
        text: format!("WHAT YOU SENSE OF THE PLAYER:\n{}", profile.summary()),
    });
    if let Some((npc_name, messages)) = left_conversation {
        let distilled = distill_conversation(messages, npc_name, PRIOR_CONVERSATION_MAX_CHARS);
        if !distilled.is_empty() {
            sections.push(Section {
                kind: SectionKind::PriorConversation,
                text: format!("THE CONVERSATION THEY LEFT ({npc_name}):\n{distilled}"),
            });
        }
    }
    sections.push(Section {
        kind: SectionKind::Rules,
        text: OPERATIONAL_RULES.to_string(),
    });
    assemble(sections, MAX_GUIDE_PROMPT_BYTES)
}

fn joined_len(sections: &[Section]) -> usize {
    let text_bytes: usize = sections.iter().map(|s| s.text.len()).sum();
    text_bytes + sections.len().saturating_sub(1) * 2
}

/// Join sections and enforce the byte budget: first trim squeezable
/// sections to half, then drop them outright, both in fixed priority
/// order. Critical sections are untouchable.
fn assemble(mut sections: Vec<Section>, max_bytes: usize) -> String {
    for kind in SQUEEZE_ORDER {
        if joined_len(&sections) <= max_bytes {
            break;
        }
        if let Some(section) = sections.iter_mut().find(|s| s.kind == *kind) {
            let half = section.text.chars().count() / 2;
            section.text = truncate_chars(&section.text, half);
        }
    }
    for kind in SQUEEZE_ORDER {
        if joined_len(&sections) <= max_bytes {
            break;
        }
        sections.retain(|s| s.kind != *kind);
    }
    sections
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::demo_world;

    #[test]
    fn condensation_is_idempotent_at_target() {
        let world = demo_world();
        let once = condense_antefatto(world.storyboard(), ANTEFATTO_KEYWORDS, 200);
        let twice = condense_antefatto(&once, ANTEFATTO_KEYWORDS, 200);
        assert_eq!(once, twice);
        assert!(once.chars().count() <= 200);
    }

    #[test]
    fn condensation_keeps_opening_paragraph() {
        let text = format!("An opening with no magic words.\n\n{}", "Veil lore. ".repeat(200));
        let condensed = condense_antefatto(&text, ANTEFATTO_KEYWORDS, 300);
        assert!(condensed.starts_with("An opening with no magic words."));
    }

    #[test]
    fn npc_prompt_fits_budget_and_keeps_rules() {
        let world = demo_world();
        let mut npc = world.npc("tavern.garin").unwrap().clone();
        npc.dialogue_hooks = "x".repeat(4000);
        npc.veil_connection = "y".repeat(4000);
        let prior: Vec<ChatMessage> = (0..80)
            .map(|i| ChatMessage::user(format!("a fairly long line number {i} {}", "pad ".repeat(20))))
            .collect();
        let prompt = compose_npc_prompt(&NpcPromptInputs {
            npc: &npc,
            storyboard: &"Veil words. ".repeat(500),
            profile_insights: Some("curious, careful"),
            prior_conversation: Some(("Mira", &prior)),
        });
        assert!(prompt.len() <= MAX_NPC_PROMPT_BYTES);
        assert!(prompt.contains("OPERATIONAL RULES"));
        assert!(prompt.contains("You are Garin"));
    }

    #[test]
    fn guide_prompt_fits_smaller_budget() {
        let world = demo_world();
        let guide = world.wise_guide().unwrap();
        let profile = PsychologicalProfile::default();
        let prior: Vec<ChatMessage> =
            (0..40).map(|i| ChatMessage::assistant(format!("line {i} {}", "pad ".repeat(30)))).collect();
        let prompt = compose_guide_prompt(
            guide,
            &"Oblivion waits. ".repeat(400),
            &profile,
            Some(("Garin", &prior)),
        );
        assert!(prompt.len() <= MAX_GUIDE_PROMPT_BYTES);
        assert!(prompt.contains("OPERATIONAL RULES"));
        assert!(prompt.contains("WHAT YOU SENSE OF THE PLAYER"));
    }

    #[test]
    fn composition_is_deterministic() {
        let world = demo_world();
        let npc = world.npc("tavern.garin").unwrap();
        let inputs = NpcPromptInputs {
            npc,
            storyboard: world.storyboard(),
            profile_insights: None,
            prior_conversation: None,
        };
        assert_eq!(compose_npc_prompt(&inputs), compose_npc_prompt(&inputs));
    }
}
