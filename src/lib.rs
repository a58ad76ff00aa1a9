#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod config;
pub mod endpoint;
pub mod mux;
pub mod signaling;
pub mod stun;
pub mod supervisor;

pub use config::{Config, Mode};
pub use endpoint::Endpoint;
pub use signaling::{SignalingPort, WebSocketSignaling};
pub use supervisor::Supervisor;
