/**
 * mux/mod.rs
 *
 * Session multiplexer: frame codec plus the mode-asymmetric client and
 * server pipelines described in SPEC_FULL.md §4.3.
 */

pub mod client;
pub mod frame;
pub mod server;

pub use client::ClientTable;
pub use server::ServerTable;

use std::time::Duration;

pub const JANITOR_SWEEP_PERIOD: Duration = Duration::from_secs(5);
pub const IDLE_EVICTION_THRESHOLD: Duration = Duration::from_secs(30);
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
