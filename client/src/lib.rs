//! Two-party technical interview sessions: peer signaling, shared editor
//! state, proctoring alerts and a realtime audio link to an AI monitor.

pub mod alerts;
pub mod audio;
pub mod catalog;
pub mod config;
pub mod constants;
pub mod engine;
pub mod gemini;
pub mod hub;
pub mod identity;
pub mod interview;
pub mod link;
pub mod media;
pub mod proctor;
pub mod protocol;
pub mod report;
pub mod session;
pub mod signal;
pub mod sync;
pub mod utils;
pub mod video;

pub use identity::{derive_identity, PeerIdentity, Role};
pub use interview::{AiSetup, Interview, InterviewSummary};
pub use session::{ConnectionStatus, PeerSession, SessionEvent};
pub use signal::{SignalClient, SignalError};
pub use sync::{SharedState, Synchronizer};
