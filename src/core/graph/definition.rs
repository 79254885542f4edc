//! Serialized form of a conversation graph, as authored in YAML or JSON.

use serde::{Deserialize, Serialize};

use super::node::NodeKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Agent identifier the graph is registered under.
    pub id: String,
    pub start: String,
    #[serde(default)]
    pub description: Option<String>,
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub max_visits: Option<u32>,
    #[serde(default)]
    pub exit_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub condition: String,
    pub target: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub required_variables: Vec<String>,
}
