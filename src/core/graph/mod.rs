//! Conversation graphs: immutable node arenas shared by every call of an
//! agent.

mod definition;
mod node;
mod store;

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

pub use definition::{GraphDefinition, NodeDefinition, TransitionDefinition};
pub use node::{ConversationNode, LoopPolicy, NodeIndex, NodeKind, Transition, VariableSpec};
pub use store::{GraphStore, read_dir as read_graph_dir};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph has no nodes")]
    Empty,

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("Start node '{0}' does not exist")]
    UnknownStart(String),

    #[error("Node '{node}' references unknown node '{target}'")]
    UnknownTarget { node: String, target: String },

    #[error("Node '{node}' is invalid: {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("Failed to parse graph: {0}")]
    Parse(String),

    #[error("Failed to read graph file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type GraphResult<T> = Result<T, GraphError>;

#[derive(Debug, Clone)]
pub struct ConversationGraph {
    id: String,
    description: Option<String>,
    nodes: Vec<ConversationNode>,
    by_id: HashMap<String, NodeIndex>,
    start: NodeIndex,
}

fn invalid(node: &str, reason: impl Into<String>) -> GraphError {
    GraphError::InvalidNode {
        node: node.to_string(),
        reason: reason.into(),
    }
}

fn validate_kind(id: &str, kind: &NodeKind, has_transitions: bool) -> GraphResult<()> {
    match kind {
        NodeKind::Scripted { template } if template.trim().is_empty() => {
            Err(invalid(id, "scripted node needs a template"))
        }
        NodeKind::Generated { instructions } if instructions.trim().is_empty() => {
            Err(invalid(id, "generated node needs instructions"))
        }
        NodeKind::Extract {
            variables,
            template,
            instructions,
            ..
        } => {
            if variables.is_empty() {
                return Err(invalid(id, "extract node declares no variables"));
            }
            if template.is_none() && instructions.is_none() {
                return Err(invalid(
                    id,
                    "extract node needs a template or instructions to continue with",
                ));
            }
            Ok(())
        }
        NodeKind::Webhook { request, .. } if request.url.trim().is_empty() => {
            Err(invalid(id, "webhook node needs a url"))
        }
        NodeKind::Terminal { .. } if has_transitions => {
            Err(invalid(id, "terminal node cannot have transitions"))
        }
        _ => Ok(()),
    }
}

impl ConversationGraph {
    /// Validate a definition and resolve every node reference to an index.
    pub fn from_definition(definition: GraphDefinition) -> GraphResult<Self> {
        if definition.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut by_id = HashMap::with_capacity(definition.nodes.len());
        for (i, node) in definition.nodes.iter().enumerate() {
            if by_id.insert(node.id.clone(), NodeIndex(i)).is_some() {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
        }

        let resolve = |from: &str, target: &str| {
            by_id
                .get(target)
                .copied()
                .ok_or_else(|| GraphError::UnknownTarget {
                    node: from.to_string(),
                    target: target.to_string(),
                })
        };

        let start = by_id
            .get(&definition.start)
            .copied()
            .ok_or_else(|| GraphError::UnknownStart(definition.start.clone()))?;

        let mut nodes = Vec::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            validate_kind(&node.id, &node.kind, !node.transitions.is_empty())?;

            let transitions = node
                .transitions
                .iter()
                .map(|t| -> GraphResult<Transition> {
                    Ok(Transition {
                        condition: t.condition.clone(),
                        target: resolve(&node.id, &t.target)?,
                        keywords: t.keywords.clone(),
                        required_variables: t.required_variables.clone(),
                    })
                })
                .collect::<GraphResult<Vec<_>>>()?;

            let loop_policy = match (node.max_visits, node.exit_to.as_deref()) {
                (Some(0), _) => return Err(invalid(&node.id, "max_visits must be at least 1")),
                (Some(max_visits), Some(exit)) => Some(LoopPolicy {
                    max_visits,
                    exit_to: resolve(&node.id, exit)?,
                }),
                (Some(_), None) => {
                    return Err(invalid(&node.id, "max_visits requires exit_to"));
                }
                (None, Some(_)) => {
                    return Err(invalid(&node.id, "exit_to requires max_visits"));
                }
                (None, None) => None,
            };

            nodes.push(ConversationNode {
                id: node.id.clone(),
                kind: node.kind.clone(),
                transitions,
                loop_policy,
            });
        }

        Ok(Self {
            id: definition.id,
            description: definition.description,
            nodes,
            by_id,
            start,
        })
    }

    pub fn from_yaml_str(raw: &str) -> GraphResult<Self> {
        let definition: GraphDefinition =
            serde_yaml::from_str(raw).map_err(|e| GraphError::Parse(e.to_string()))?;
        Self::from_definition(definition)
    }

    pub fn from_json_str(raw: &str) -> GraphResult<Self> {
        let definition: GraphDefinition =
            serde_json::from_str(raw).map_err(|e| GraphError::Parse(e.to_string()))?;
        Self::from_definition(definition)
    }

    /// Load a `.json`, `.yaml` or `.yml` graph file.
    pub fn from_file(path: &Path) -> GraphResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn start(&self) -> NodeIndex {
        self.start
    }

    pub fn node(&self, index: NodeIndex) -> &ConversationNode {
        &self.nodes[index.0]
    }

    pub fn lookup(&self, id: &str) -> Option<NodeIndex> {
        self.by_id.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &ConversationNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIndex(i), n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APPOINTMENT: &str = r#"
id: appointments
start: greet
nodes:
  - id: greet
    kind: scripted
    template: "Hi {name}, this is the clinic calling about your appointment."
    transitions:
      - condition: caller wants to reschedule
        target: reschedule
        keywords: [reschedule, another day]
      - condition: caller confirms
        target: goodbye
        keywords: ["yes", confirm]
    max_visits: 3
    exit_to: goodbye
  - id: reschedule
    kind: extract
    variables:
      - name: date
        description: the new appointment date
    reprompt: "Which day works better for you?"
    template: "Great, I have you down for {date}."
    transitions:
      - condition: date captured
        target: goodbye
        required_variables: [date]
  - id: goodbye
    kind: terminal
    message: "Thanks, goodbye!"
    disposition: completed
"#;

    #[test]
    fn test_yaml_graph_resolves_targets() {
        let graph = ConversationGraph::from_yaml_str(APPOINTMENT).unwrap();
        assert_eq!(graph.id(), "appointments");
        assert_eq!(graph.len(), 3);

        let greet = graph.node(graph.start());
        assert_eq!(greet.id, "greet");
        assert_eq!(greet.transitions.len(), 2);
        assert_eq!(greet.transitions[0].target, graph.lookup("reschedule").unwrap());
        assert_eq!(
            greet.loop_policy,
            Some(LoopPolicy {
                max_visits: 3,
                exit_to: graph.lookup("goodbye").unwrap(),
            })
        );

        let goodbye = graph.node(graph.lookup("goodbye").unwrap());
        assert!(goodbye.is_terminal());
    }

    #[test]
    fn test_json_graph() {
        let raw = r#"{
            "id": "one",
            "start": "only",
            "nodes": [{"id": "only", "kind": "generated", "instructions": "Chat."}]
        }"#;
        let graph = ConversationGraph::from_json_str(raw).unwrap();
        assert!(matches!(graph.node(graph.start()).kind, NodeKind::Generated { .. }));
    }

    #[test]
    fn test_unknown_target_is_rejected() {
        let raw = r#"
id: broken
start: a
nodes:
  - id: a
    kind: scripted
    template: "hi"
    transitions:
      - condition: anything
        target: nowhere
"#;
        let err = ConversationGraph::from_yaml_str(raw).unwrap_err();
        assert!(matches!(err, GraphError::UnknownTarget { ref target, .. } if target == "nowhere"));
    }

    #[test]
    fn test_duplicate_and_start_errors() {
        let duplicate = r#"
id: dup
start: a
nodes:
  - {id: a, kind: scripted, template: "x"}
  - {id: a, kind: scripted, template: "y"}
"#;
        assert!(matches!(
            ConversationGraph::from_yaml_str(duplicate),
            Err(GraphError::DuplicateNode(_))
        ));

        let no_start = r#"
id: nostart
start: missing
nodes:
  - {id: a, kind: scripted, template: "x"}
"#;
        assert!(matches!(
            ConversationGraph::from_yaml_str(no_start),
            Err(GraphError::UnknownStart(_))
        ));
    }

    #[test]
    fn test_kind_specific_validation() {
        let terminal_with_edges = r#"
id: t
start: end
nodes:
  - id: end
    kind: terminal
    message: "bye"
    transitions:
      - {condition: again, target: end}
"#;
        assert!(matches!(
            ConversationGraph::from_yaml_str(terminal_with_edges),
            Err(GraphError::InvalidNode { .. })
        ));

        let loop_without_exit = r#"
id: l
start: a
nodes:
  - {id: a, kind: scripted, template: "x", max_visits: 2}
"#;
        assert!(matches!(
            ConversationGraph::from_yaml_str(loop_without_exit),
            Err(GraphError::InvalidNode { .. })
        ));

        let extract_without_followup = r#"
id: e
start: a
nodes:
  - id: a
    kind: extract
    variables: [{name: date}]
    reprompt: "When?"
"#;
        assert!(matches!(
            ConversationGraph::from_yaml_str(extract_without_followup),
            Err(GraphError::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_unparseable_input() {
        assert!(matches!(
            ConversationGraph::from_yaml_str("nodes: [: :"),
            Err(GraphError::Parse(_))
        ));
    }
}
