use serde::{Deserialize, Serialize};

/// Speaker of a chat message. `System` appears only as the first message of
/// a session (the composed prompt) or as the single-message analysis escape
/// hatch of the gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

pub const CONVERSATION_BREAK_PREFIX: &str = "[CONVERSATION_BREAK:";
pub const CONVERSATION_RESUMED_PREFIX: &str = "[CONVERSATION_RESUMED:";

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Sentinel appended before a session is persisted, marking a natural
    /// exit point in the transcript.
    pub fn conversation_break(reason: &str) -> Self {
        Self::user(format!("{CONVERSATION_BREAK_PREFIX} {reason}]"))
    }

    /// Counterpart injected when a persisted conversation is reopened.
    pub fn conversation_resumed(note: &str) -> Self {
        Self::user(format!("{CONVERSATION_RESUMED_PREFIX} {note}]"))
    }

    pub fn is_conversation_break(&self) -> bool {
        self.role == Role::User && self.content.starts_with(CONVERSATION_BREAK_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_sentinel_round_trips_through_serde() {
        let msg = ChatMessage::conversation_break("player left for the Tavern");
        assert!(msg.is_conversation_break());
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""role":"user""#));
        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn resume_sentinel_is_not_a_break() {
        assert!(!ChatMessage::conversation_resumed("back again").is_conversation_break());
    }
}
