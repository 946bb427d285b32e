//! Node runtime for the hushlink peer-to-peer messaging system.
//!
//! # Architecture
//!
//! - [`peers`] — the process-wide peer table and its persistence hook
//! - [`peer_handlers`] — the peer-to-peer command table
//! - [`manager`] — the local control-client command table and session
//! - [`node`] — listener, session lifecycle, shutdown teardown
//! - [`discovery`] — multicast beacon announce / listen
//!
//! One task serves each accepted session; a failing session cleans up
//! its own peer-table entry and never touches the others.

pub mod discovery;
pub mod manager;
pub mod node;
pub mod peer_handlers;
pub mod peers;
