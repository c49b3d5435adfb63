//! Mobox server: runs agents in sandboxes and streams their normalized
//! activity to UI clients.

pub mod agents;
pub mod cli;
pub mod persistence;
pub mod router;
pub mod sandbox;
pub mod stream;
