//! One live phone call: the event loop that ties transcripts, transitions,
//! responses, audio and dead-air monitoring together, and the registry of
//! calls this process hosts.

mod call;
mod config;
mod registry;
mod state;
mod termination;

pub use call::{CallEvent, CallInfo, CallSession, CallSetup, SessionError};
pub use config::{CallCapabilities, CallConfig};
pub use registry::SessionRegistry;
pub(crate) use state::epoch_ms;
pub use state::{ConversationState, Speaker, Turn};
pub use termination::{Disposition, TerminationSignal};
