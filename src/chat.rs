use serde::{Deserialize, Serialize};

use crate::message::{ChatMessage, Role};
use crate::stats::CallStats;

/// Per-(player, NPC) conversation aggregate. Assistant messages are only
/// ever recorded from gateway responses or clearly marked placeholders.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSession {
    pub npc_code: String,
    pub npc_name: String,
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip)]
    pub last_stats: Option<CallStats>,
}

impl ChatSession {
    pub fn new(npc_code: impl Into<String>, npc_name: impl Into<String>, system_prompt: String) -> Self {
        Self {
            npc_code: npc_code.into(),
            npc_name: npc_name.into(),
            system_prompt,
            messages: Vec::new(),
            last_stats: None,
        }
    }

    /// Full message list as sent to the gateway: the system prompt followed
    /// by the transcript.
    pub fn request_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(ChatMessage::system(self.system_prompt.clone()));
        out.extend(self.messages.iter().cloned());
        out
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    /// Last `n` transcript messages, for profile analysis snapshots.
    pub fn tail(&self, n: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(n);
        self.messages[start..].to_vec()
    }

    /// Append the break sentinel unless the transcript already ends with
    /// one. Called before every persistence of a live session.
    pub fn ensure_break_sentinel(&mut self, reason: &str) {
        if self
            .messages
            .last()
            .is_some_and(ChatMessage::is_conversation_break)
        {
            return;
        }
        self.messages.push(ChatMessage::conversation_break(reason));
    }

    /// Counterpart on re-entry into a persisted conversation.
    pub fn inject_resume_sentinel(&mut self, note: &str) {
        if self
            .messages
            .last()
            .is_some_and(ChatMessage::is_conversation_break)
        {
            self.messages.push(ChatMessage::conversation_resumed(note));
        }
    }

    /// Wipe the in-memory transcript; the system prompt survives.
    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.last_stats = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn break_sentinel_is_not_duplicated() {
        let mut session = ChatSession::new("tavern.garin", "Garin", "prompt".into());
        session.push_user("hello");
        session.ensure_break_sentinel("leaving");
        session.ensure_break_sentinel("leaving again");
        let breaks = session
            .messages
            .iter()
            .filter(|m| m.is_conversation_break())
            .count();
        assert_eq!(breaks, 1);
    }

    #[test]
    fn resume_only_follows_a_break() {
        let mut session = ChatSession::new("tavern.garin", "Garin", "prompt".into());
        session.push_user("hello");
        session.inject_resume_sentinel("back");
        assert_eq!(session.messages.len(), 1);

        session.ensure_break_sentinel("leaving");
        session.inject_resume_sentinel("back");
        assert!(
            session
                .messages
                .last()
                .unwrap()
                .content
                .starts_with("[CONVERSATION_RESUMED:")
        );
    }

    #[test]
    fn clear_retains_system_prompt() {
        let mut session = ChatSession::new("tavern.garin", "Garin", "prompt".into());
        session.push_user("hi");
        session.push_assistant("ho");
        session.clear_messages();
        assert!(session.messages.is_empty());
        assert_eq!(session.system_prompt, "prompt");
        assert_eq!(session.request_messages().len(), 1);
    }
}
