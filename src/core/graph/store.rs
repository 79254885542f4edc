use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use super::{ConversationGraph, GraphError, GraphResult};

/// Graphs by agent id. Calls hold an `Arc` to the graph they started with,
/// so reloading never changes a call mid-flight.
#[derive(Default)]
pub struct GraphStore {
    graphs: RwLock<HashMap<String, Arc<ConversationGraph>>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, graph: ConversationGraph) -> Arc<ConversationGraph> {
        let graph = Arc::new(graph);
        self.graphs
            .write()
            .insert(graph.id().to_string(), Arc::clone(&graph));
        graph
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<ConversationGraph>> {
        self.graphs.read().get(agent_id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.graphs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.graphs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every graph file in `dir`. Any invalid file fails the whole load
    /// and leaves the store untouched.
    pub fn load_dir(&self, dir: &Path) -> GraphResult<usize> {
        let loaded = read_dir(dir)?;
        let count = loaded.len();
        let mut graphs = self.graphs.write();
        for graph in loaded {
            info!(agent_id = graph.id(), nodes = graph.len(), "Loaded conversation graph");
            graphs.insert(graph.id().to_string(), Arc::new(graph));
        }
        Ok(count)
    }
}

fn is_graph_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml" | "json")
    )
}

/// Parse and validate every graph file in `dir`, sorted by file name.
pub fn read_dir(dir: &Path) -> GraphResult<Vec<ConversationGraph>> {
    let io_error = |source| GraphError::Io {
        path: dir.display().to_string(),
        source,
    };
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_file() && is_graph_file(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| ConversationGraph::from_file(path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_dir_registers_by_agent_id() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("sales.yaml"),
            "id: sales\nstart: a\nnodes:\n  - {id: a, kind: scripted, template: \"hello\"}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("support.json"),
            r#"{"id":"support","start":"a","nodes":[{"id":"a","kind":"generated","instructions":"help"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = GraphStore::new();
        assert_eq!(store.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(store.ids(), vec!["sales", "support"]);
        assert!(store.get("sales").is_some());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_invalid_file_fails_whole_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "id: ok\nstart: a\nnodes:\n  - {id: a, kind: scripted, template: \"hi\"}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("b.yaml"), "id: bad\nstart: zzz\nnodes: []\n").unwrap();

        let store = GraphStore::new();
        assert!(store.load_dir(dir.path()).is_err());
        assert!(store.is_empty());
    }
}
