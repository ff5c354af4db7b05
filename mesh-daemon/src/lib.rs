//! Mesh sync daemon: discovery, authenticated sync sessions, catalog gossip, model serving
//! and resumable model downloads on top of `mesh-core`.

pub mod config;
pub mod discovery;
pub mod download;
pub mod library;
pub mod node;
pub mod serve;
pub mod session;

pub use config::Config;
pub use node::{MeshNode, NodeError};
