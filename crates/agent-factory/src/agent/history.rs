//! Conversation history and oldest-first, whole-turn trimming.

use crate::config::{HistoryLimits, HistoryUnit};
use crate::model::{ChatMessage, Role};

/// Messages of one conversation, without the system prompt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = ChatMessage>) {
        self.messages.extend(messages);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Drop everything after the first `len` messages.
    pub fn truncate(&mut self, len: usize) {
        self.messages.truncate(len);
    }

    /// Start index of each turn. A turn begins at a user message; anything
    /// before the first user message belongs to the first turn.
    pub fn turn_starts(&self) -> Vec<usize> {
        let mut starts: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.role == Role::User)
            .map(|(i, _)| i)
            .collect();
        if !self.messages.is_empty() && starts.first() != Some(&0) {
            starts.insert(0, 0);
        }
        starts
    }
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(message: &ChatMessage) -> usize {
    let chars = message.content.chars().count()
        + message
            .tool_calls
            .iter()
            .map(|c| c.name.chars().count() + c.arguments.chars().count())
            .sum::<usize>();
    chars.div_ceil(4).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryReducer {
    pub threshold: usize,
    pub target: usize,
    pub unit: HistoryUnit,
}

impl From<HistoryLimits> for HistoryReducer {
    fn from(l: HistoryLimits) -> Self {
        Self {
            threshold: l.threshold_count,
            target: l.target_count,
            unit: l.unit,
        }
    }
}

impl HistoryReducer {
    pub fn messages(threshold: usize, target: usize) -> Self {
        Self {
            threshold,
            target,
            unit: HistoryUnit::Messages,
        }
    }

    pub fn size_of(&self, messages: &[ChatMessage]) -> usize {
        match self.unit {
            HistoryUnit::Messages => messages.len(),
            HistoryUnit::Tokens => messages.iter().map(estimate_tokens).sum(),
        }
    }

    /// Trim when the history exceeds the threshold. Oldest whole turns are
    /// dropped until the size is at most the target; the latest turn is
    /// always kept. Returns true if anything was removed.
    pub fn reduce(&self, history: &mut ChatHistory) -> bool {
        if self.size_of(&history.messages) <= self.threshold {
            return false;
        }
        let starts = history.turn_starts();
        let Some(&last_turn) = starts.last() else {
            return false;
        };
        let mut cut = 0;
        for &start in &starts {
            if start == last_turn || self.size_of(&history.messages[start..]) <= self.target {
                cut = start;
                break;
            }
        }
        if cut == 0 {
            return false;
        }
        history.messages.drain(..cut);
        true
    }
}
