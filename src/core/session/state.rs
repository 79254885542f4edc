use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::core::graph::NodeIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Agent,
    User,
}

/// One line of the conversation transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub at_ms: u64,
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// The mutable, session-owned part of a call.
#[derive(Debug, Clone)]
pub struct ConversationState {
    current: NodeIndex,
    history: Vec<Turn>,
    variables: HashMap<String, String>,
    visits: HashMap<NodeIndex, u32>,
}

impl ConversationState {
    pub fn new(start: NodeIndex, variables: HashMap<String, String>) -> Self {
        Self {
            current: start,
            history: Vec::new(),
            variables,
            visits: HashMap::from([(start, 1)]),
        }
    }

    pub fn current(&self) -> NodeIndex {
        self.current
    }

    /// Make `node` current and count the visit.
    pub fn enter(&mut self, node: NodeIndex) {
        self.current = node;
        *self.visits.entry(node).or_insert(0) += 1;
    }

    pub fn visits(&self, node: NodeIndex) -> u32 {
        self.visits.get(&node).copied().unwrap_or(0)
    }

    pub fn record(&mut self, speaker: Speaker, text: impl Into<String>) {
        let text = text.into();
        if text.trim().is_empty() {
            return;
        }
        self.history.push(Turn {
            speaker,
            text,
            at_ms: epoch_ms(),
        });
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Merge bindings; empty values never overwrite an existing binding.
    pub fn bind(&mut self, bindings: HashMap<String, String>) {
        for (name, value) in bindings {
            if value.trim().is_empty() {
                continue;
            }
            self.variables.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visits_are_counted_per_node() {
        let start = NodeIndex(0);
        let other = NodeIndex(1);
        let mut state = ConversationState::new(start, HashMap::new());
        assert_eq!(state.visits(start), 1);

        state.enter(start);
        state.enter(other);
        assert_eq!(state.current(), other);
        assert_eq!(state.visits(start), 2);
        assert_eq!(state.visits(other), 1);
    }

    #[test]
    fn test_bind_ignores_empty_values() {
        let mut state = ConversationState::new(
            NodeIndex(0),
            HashMap::from([("name".to_string(), "Ann".to_string())]),
        );
        state.bind(HashMap::from([
            ("name".to_string(), " ".to_string()),
            ("date".to_string(), "Friday".to_string()),
        ]));
        assert_eq!(state.variables()["name"], "Ann");
        assert_eq!(state.variables()["date"], "Friday");
    }

    #[test]
    fn test_blank_turns_are_not_recorded() {
        let mut state = ConversationState::new(NodeIndex(0), HashMap::new());
        state.record(Speaker::User, "  ");
        state.record(Speaker::Agent, "Hello");
        assert_eq!(state.history().len(), 1);
        assert_eq!(state.history()[0].speaker, Speaker::Agent);
    }
}
