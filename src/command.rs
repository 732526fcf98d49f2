use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::GameError;

/// Closed verb set of the slash-command vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Verb {
    #[strum(serialize = "exit", serialize = "quit")]
    Exit,
    Help,
    Go,
    Talk,
    Who,
    Whereami,
    Npcs,
    #[strum(serialize = "areas", serialize = "listareas")]
    Areas,
    #[strum(serialize = "inventory", serialize = "inv")]
    Inventory,
    Give,
    Receive,
    Hint,
    Endhint,
    Profile,
    History,
    Clear,
    Stats,
}

impl Verb {
    fn usage(self) -> (&'static str, &'static str) {
        match self {
            Verb::Exit => ("", "leave the game, saving everything"),
            Verb::Help => ("", "show this list"),
            Verb::Go => ("<area>", "move to another area"),
            Verb::Talk => ("<npc|.>", "talk to an NPC here ('.' picks at random)"),
            Verb::Who => ("", "list NPCs in the current area"),
            Verb::Whereami => ("", "show current area and NPC"),
            Verb::Npcs => ("", "list every NPC by area"),
            Verb::Areas => ("", "list known areas"),
            Verb::Inventory => ("", "show items and credits"),
            Verb::Give => ("<item|N Credits>", "hand something to the current NPC"),
            Verb::Receive => ("<item>", "ask the current NPC for an item"),
            Verb::Hint => ("", "step aside and consult the wise guide"),
            Verb::Endhint => ("", "return from the guide consultation"),
            Verb::Profile => ("", "show what the world has learned about you"),
            Verb::History => ("", "show the current conversation"),
            Verb::Clear => ("", "forget the current conversation (in memory only)"),
            Verb::Stats => ("", "show LLM call statistics"),
        }
    }

    fn requires_argument(self) -> bool {
        matches!(self, Verb::Go | Verb::Talk | Verb::Give | Verb::Receive)
    }
}

/// A parsed slash command: verb plus raw argument tail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub verb: Verb,
    pub arg: String,
}

impl Command {
    /// Tokenize a `/verb argument tail` line. The leading slash is
    /// required by the caller's dispatch, optional here.
    pub fn parse(input: &str) -> Result<Self, GameError> {
        let trimmed = input.trim().trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(GameError::InvalidCommand("empty command".to_string()));
        }
        let (verb_text, arg) = match trimmed.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim().to_string()),
            None => (trimmed, String::new()),
        };
        let verb = Verb::from_str(verb_text)
            .map_err(|_| GameError::InvalidCommand(format!("unknown command '/{verb_text}'")))?;
        if verb.requires_argument() && arg.is_empty() {
            let (args, _) = verb.usage();
            return Err(GameError::InvalidCommand(format!(
                "usage: /{verb} {args}"
            )));
        }
        Ok(Self { verb, arg })
    }
}

/// Help text derived from the verb table.
pub fn help_text() -> String {
    let mut lines = vec!["Available commands:".to_string()];
    for verb in Verb::iter() {
        let (args, description) = verb.usage();
        if args.is_empty() {
            lines.push(format!("  /{verb} - {description}"));
        } else {
            lines.push(format!("  /{verb} {args} - {description}"));
        }
    }
    lines.join("\n")
}

/// What a `/give` argument denotes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GiveWhat {
    Credits(i64),
    Item(String),
}

static GIVE_CREDITS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+)\s+credits?$").expect("give credits regex"));

pub fn parse_give(arg: &str) -> GiveWhat {
    let arg = arg.trim();
    if let Some(caps) = GIVE_CREDITS_RE.captures(arg) {
        if let Ok(amount) = caps[1].parse::<i64>() {
            return GiveWhat::Credits(amount);
        }
    }
    GiveWhat::Item(arg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_parse_with_aliases() {
        assert_eq!(Command::parse("/quit").unwrap().verb, Verb::Exit);
        assert_eq!(Command::parse("/inv").unwrap().verb, Verb::Inventory);
        assert_eq!(Command::parse("/listareas").unwrap().verb, Verb::Areas);
        assert_eq!(Command::parse("/GO Tavern").unwrap().arg, "Tavern");
    }

    #[test]
    fn missing_argument_yields_usage_hint() {
        let err = Command::parse("/go").unwrap_err();
        assert!(err.to_string().contains("usage: /go <area>"));
    }

    #[test]
    fn unknown_verb_is_rejected() {
        assert!(Command::parse("/fly north").is_err());
    }

    #[test]
    fn give_argument_disambiguates_credits() {
        assert_eq!(parse_give("50 Credits"), GiveWhat::Credits(50));
        assert_eq!(parse_give("1 credit"), GiveWhat::Credits(1));
        assert_eq!(
            parse_give("rare coin"),
            GiveWhat::Item("rare coin".to_string())
        );
    }

    #[test]
    fn help_lists_every_verb_once() {
        let help = help_text();
        assert!(help.contains("/go <area>"));
        assert!(help.contains("/endhint"));
        assert_eq!(help.matches("/talk").count(), 1);
    }
}
