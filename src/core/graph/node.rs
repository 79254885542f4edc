use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::session::Disposition;
use crate::core::webhook::WebhookSpec;

/// Position of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(pub(crate) usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A variable an extract node tries to bind from the caller's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl VariableSpec {
    /// Optional variables are always satisfied; required ones need a
    /// non-blank value.
    pub fn is_satisfied_by(&self, bound: &HashMap<String, String>) -> bool {
        !self.required
            || bound
                .get(&self.name)
                .is_some_and(|value| !value.trim().is_empty())
    }
}

/// What a node says when it becomes current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Scripted {
        template: String,
    },
    Generated {
        instructions: String,
    },
    Extract {
        variables: Vec<VariableSpec>,
        reprompt: String,
        #[serde(default)]
        template: Option<String>,
        #[serde(default)]
        instructions: Option<String>,
    },
    Webhook {
        request: WebhookSpec,
        #[serde(default)]
        pre_message: Option<String>,
        success_message: String,
        failure_message: String,
        /// Variable the response body is bound to.
        #[serde(default)]
        result_variable: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Terminal {
        message: String,
        #[serde(default)]
        disposition: Option<Disposition>,
    },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Scripted { .. } => "scripted",
            NodeKind::Generated { .. } => "generated",
            NodeKind::Extract { .. } => "extract",
            NodeKind::Webhook { .. } => "webhook",
            NodeKind::Terminal { .. } => "terminal",
        }
    }
}

/// An outgoing edge, evaluated in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub condition: String,
    pub target: NodeIndex,
    pub keywords: Vec<String>,
    pub required_variables: Vec<String>,
}

/// Where to go once a node has been visited `max_visits` times without the
/// caller moving on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPolicy {
    pub max_visits: u32,
    pub exit_to: NodeIndex,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationNode {
    pub id: String,
    pub kind: NodeKind,
    pub transitions: Vec<Transition>,
    pub loop_policy: Option<LoopPolicy>,
}

impl ConversationNode {
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal { .. })
    }
}
