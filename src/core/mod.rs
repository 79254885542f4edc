pub mod audio;
pub mod cache;
pub mod coordinator;
pub mod dead_air;
pub mod errors;
pub mod graph;
pub mod interruption;
pub mod llm;
pub mod response;
pub mod session;
pub mod state;
pub mod stt;
pub mod text;
pub mod transition;
pub mod transport;
pub mod tts;
pub mod webhook;

// Re-export commonly used types for convenience
pub use coordinator::{MemoryStateStore, RemoteStateStore, StateCoordinator, StateStore};
pub use errors::CallErrorKind;
pub use graph::{ConversationGraph, GraphStore};
pub use session::{
    CallCapabilities, CallConfig, CallEvent, CallSession, CallSetup, Disposition, SessionRegistry,
};

// Re-export CoreState for external use
pub use state::CoreState;
