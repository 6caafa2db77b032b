use crate::model::Turn;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const TRANSCRIPT_LIMIT: usize = 10;

#[derive(Debug, Default)]
struct Conversation {
    turns: VecDeque<Turn>,
    user_turns_seen: u64,
}

#[derive(Debug, Default)]
pub struct ConversationMemory {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &str) -> Vec<Turn> {
        let mut conversations = self.lock();
        conversations
            .entry(identity.to_string())
            .or_default()
            .turns
            .iter()
            .cloned()
            .collect()
    }

    pub fn append(&self, identity: &str, turn: Turn) {
        let mut conversations = self.lock();
        let conversation = conversations.entry(identity.to_string()).or_default();
        if turn.role == crate::model::Role::User {
            conversation.user_turns_seen += 1;
        }
        conversation.turns.push_back(turn);
        while conversation.turns.len() > TRANSCRIPT_LIMIT {
            conversation.turns.pop_front();
        }
    }

    /// Count of user turns ever appended for `identity`, unaffected by eviction.
    pub fn user_turns_seen(&self, identity: &str) -> u64 {
        self.lock()
            .get(identity)
            .map(|c| c.user_turns_seen)
            .unwrap_or(0)
    }

    /// Read-only view that does not create an entry.
    pub fn snapshot(&self, identity: &str) -> Option<Vec<Turn>> {
        self.lock()
            .get(identity)
            .map(|c| c.turns.iter().cloned().collect())
    }

    pub fn conversation_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Conversation>> {
        // Critical sections never panic, so a poisoned lock still holds
        // consistent data.
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    #[test]
    fn get_creates_empty_transcript() {
        let memory = ConversationMemory::new();
        assert!(memory.snapshot("a@s.whatsapp.net").is_none());
        assert!(memory.get("a@s.whatsapp.net").is_empty());
        assert_eq!(memory.snapshot("a@s.whatsapp.net"), Some(vec![]));
        assert_eq!(memory.conversation_count(), 1);
    }

    #[test]
    fn eleventh_append_evicts_only_the_first_turn() {
        let memory = ConversationMemory::new();
        for idx in 0..11 {
            memory.append("x", Turn::user(format!("m{idx}")));
        }
        let transcript = memory.get("x");
        assert_eq!(transcript.len(), TRANSCRIPT_LIMIT);
        assert_eq!(transcript.first().map(|t| t.content.as_str()), Some("m1"));
        assert_eq!(transcript.last().map(|t| t.content.as_str()), Some("m10"));
    }

    #[test]
    fn transcript_keeps_last_ten_in_insertion_order() {
        let memory = ConversationMemory::new();
        for idx in 0..37 {
            let turn = if idx % 3 == 0 {
                Turn::assistant(format!("a{idx}"))
            } else {
                Turn::user(format!("u{idx}"))
            };
            memory.append("x", turn);
            assert!(memory.get("x").len() <= TRANSCRIPT_LIMIT);
        }
        let contents: Vec<String> = memory.get("x").into_iter().map(|t| t.content).collect();
        let expected: Vec<String> = (27..37)
            .map(|idx| {
                if idx % 3 == 0 {
                    format!("a{idx}")
                } else {
                    format!("u{idx}")
                }
            })
            .collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn conversations_are_isolated() {
        let memory = ConversationMemory::new();
        memory.append("x", Turn::user("hi x"));
        memory.append("y", Turn::user("hi y"));
        memory.append("y", Turn::assistant("hello y"));
        assert_eq!(memory.get("x"), vec![Turn::user("hi x")]);
        assert_eq!(memory.get("y").len(), 2);
        assert_eq!(memory.get("y")[1].role, Role::Assistant);
    }

    #[test]
    fn user_turn_counter_survives_eviction() {
        let memory = ConversationMemory::new();
        for idx in 0..15 {
            memory.append("x", Turn::user(format!("m{idx}")));
        }
        memory.append("x", Turn::assistant("reply"));
        assert_eq!(memory.user_turns_seen("x"), 15);
        assert_eq!(memory.user_turns_seen("unknown"), 0);
    }
}
