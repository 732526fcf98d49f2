use once_cell::sync::Lazy;
use regex::Regex;

use crate::world::{Notecard, NpcSheet};

pub const GIVEN_ITEMS_TAG: &str = "[GIVEN_ITEMS:";
pub const NOTECARD_TAG: &str = "[notecard=";

/// One entry of a `[GIVEN_ITEMS: …]` tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Grant {
    Item(String),
    Credits(i64),
}

static CREDITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^([+-]?\d+)\s+credits?$").expect("credits regex"));

fn parse_grant(entry: &str) -> Option<Grant> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    if let Some(caps) = CREDITS_RE.captures(entry) {
        if let Ok(amount) = caps[1].parse::<i64>() {
            return Some(Grant::Credits(amount));
        }
    }
    Some(Grant::Item(entry.to_string()))
}

/// Extract grants from the last `[GIVEN_ITEMS: …]` tag and strip every
/// occurrence from the text. A model emitting two tags is out of contract;
/// the later one wins and the extras are swallowed so the visible reply
/// never carries the marker. A dangling unclosed tag is cut to end of text.
pub fn extract_given_items(text: &str) -> (String, Vec<Grant>) {
    let mut cleaned = text.to_string();
    let mut grants: Option<Vec<Grant>> = None;
    while let Some(start) = cleaned.rfind(GIVEN_ITEMS_TAG) {
        let after_tag = start + GIVEN_ITEMS_TAG.len();
        match cleaned[after_tag..].find(']') {
            Some(close) => {
                if grants.is_none() {
                    let body = &cleaned[after_tag..after_tag + close];
                    grants = Some(body.split(',').filter_map(parse_grant).collect());
                }
                let tail = cleaned[after_tag + close + 1..].to_string();
                cleaned.truncate(start);
                cleaned.push_str(&tail);
            }
            None => cleaned.truncate(start),
        }
    }
    (cleaned.trim().to_string(), grants.unwrap_or_default())
}

/// Extract the first `[notecard=<name>|<payload>]` tag and strip every
/// occurrence; extras are discarded unparsed. The payload keeps its `\n`,
/// `\"`, `\\` escapes; the world client unescapes.
pub fn extract_notecard(text: &str) -> (String, Option<Notecard>) {
    let mut cleaned = text.to_string();
    let mut card: Option<Notecard> = None;
    while let Some(start) = cleaned.find(NOTECARD_TAG) {
        let after_tag = start + NOTECARD_TAG.len();
        let rest = cleaned[after_tag..].to_string();
        let bounds = rest
            .find('|')
            .and_then(|pipe| rest[pipe..].find(']').map(|close_rel| (pipe, close_rel)));
        match bounds {
            Some((pipe, close_rel)) => {
                if card.is_none() {
                    card = Some(Notecard {
                        name: rest[..pipe].trim().to_string(),
                        content: rest[pipe + 1..pipe + close_rel].to_string(),
                    });
                }
                cleaned.truncate(start);
                cleaned.push_str(&rest[pipe + close_rel + 1..]);
            }
            None => cleaned.truncate(start),
        }
    }
    (cleaned.trim().to_string(), card)
}

/// Assemble the bracketed, pipe-delimited control-channel directive for the
/// embedded world client from NPC-sheet fields and the turn's extracted
/// notecard. Grammar is opaque to the engine; fields pass through verbatim.
pub fn world_client_directive(npc: &NpcSheet, notecard: Option<&Notecard>) -> Option<String> {
    let mut fields = Vec::new();
    if let Some(animation) = &npc.animation {
        fields.push(format!("anim={animation}"));
    }
    if let Some(emote) = &npc.emote {
        fields.push(format!("emote={emote}"));
    }
    if let Some(lookup) = &npc.lookup {
        fields.push(format!("lookup={lookup}"));
    }
    if let Some(overlay) = &npc.text_overlay {
        fields.push(format!("text={overlay}"));
    }
    if let Some(teleport) = &npc.teleport_to {
        fields.push(format!("teleport={teleport}"));
    }
    if let Some(notecard) = notecard {
        fields.push(format!("notecard={}|{}", notecard.name, notecard.content));
    }
    if fields.is_empty() {
        None
    } else {
        Some(format!("[{}]", fields.join("|")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_parse_items_and_signed_credits() {
        let (cleaned, grants) =
            extract_given_items("Ecco qui.\n[GIVEN_ITEMS: Healing Potion, -25 Credits]");
        assert_eq!(cleaned, "Ecco qui.");
        assert_eq!(
            grants,
            vec![
                Grant::Item("Healing Potion".to_string()),
                Grant::Credits(-25),
            ]
        );
    }

    #[test]
    fn last_given_items_tag_wins_and_all_are_stripped() {
        let text = "[GIVEN_ITEMS: old rope] ... later ... [GIVEN_ITEMS: 10 credits]";
        let (cleaned, grants) = extract_given_items(text);
        assert_eq!(grants, vec![Grant::Credits(10)]);
        assert!(!cleaned.contains(GIVEN_ITEMS_TAG));
        assert!(cleaned.contains("... later ..."));
    }

    #[test]
    fn dangling_given_items_tag_is_cut() {
        let (cleaned, grants) = extract_given_items("Take it. [GIVEN_ITEMS: key");
        assert_eq!(cleaned, "Take it.");
        assert!(grants.is_empty());
    }

    #[test]
    fn credits_grammar_is_strict() {
        assert_eq!(parse_grant("25 Credits"), Some(Grant::Credits(25)));
        assert_eq!(parse_grant("+3 credit"), Some(Grant::Credits(3)));
        // A stray word makes it an item, not credits.
        assert_eq!(
            parse_grant("about 25 credits"),
            Some(Grant::Item("about 25 credits".to_string()))
        );
    }

    #[test]
    fn notecard_first_occurrence_wins_and_extras_vanish() {
        let text = "Take this. [notecard=Map Notes|First line\\nSecond \\\"quoted\\\"] Safe travels. [notecard=Second|ignored]";
        let (cleaned, card) = extract_notecard(text);
        let card = card.unwrap();
        assert_eq!(card.name, "Map Notes");
        assert_eq!(card.content, "First line\\nSecond \\\"quoted\\\"");
        assert!(cleaned.starts_with("Take this."));
        assert!(cleaned.contains("Safe travels."));
        assert!(!cleaned.contains(NOTECARD_TAG));
    }

    #[test]
    fn repeated_tags_of_both_kinds_leave_no_residue() {
        let text = "Take both. [GIVEN_ITEMS: old rope] wait, [notecard=A|a] and \
                    [GIVEN_ITEMS: 5 credits] plus [notecard=B|b]";
        let (without_grants, grants) = extract_given_items(text);
        let (cleaned, card) = extract_notecard(&without_grants);
        assert_eq!(grants, vec![Grant::Credits(5)]);
        assert_eq!(card.unwrap().name, "A");
        assert!(!cleaned.contains(GIVEN_ITEMS_TAG));
        assert!(!cleaned.contains(NOTECARD_TAG));
    }

    #[test]
    fn directive_passes_sheet_fields_through() {
        let npc = NpcSheet {
            animation: Some("wave".to_string()),
            teleport_to: Some("128,42,25".to_string()),
            ..Default::default()
        };
        let card = Notecard {
            name: "Notes".to_string(),
            content: "line".to_string(),
        };
        let directive = world_client_directive(&npc, Some(&card)).unwrap();
        assert_eq!(directive, "[anim=wave|teleport=128,42,25|notecard=Notes|line]");
        assert_eq!(world_client_directive(&NpcSheet::default(), None), None);
    }
}
