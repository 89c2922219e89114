//! davmirror keeps a local directory and a remote WebDAV collection in
//! sync. Filesystem events and periodic remote listings feed a reconciler
//! that classifies each path three-way (local vs. remote vs. last synced)
//! and drives a durable, retrying task queue of uploads, downloads and
//! deletions. Diverged paths are resolved through an external arbitrator.

pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hash;
pub mod index;
pub mod models;
pub mod netmon;
pub mod prober;
pub mod queue;
pub mod reconciler;
pub mod remote;
pub mod store;
pub mod watcher;
pub mod webdav;

pub use config::{SyncConfig, SyncMode};
pub use conflict::{Conflict, Resolution};
pub use engine::Engine;
pub use error::{Error, Result};
pub use models::{FileState, FileStatus, Task, TaskOperation, TaskStatus};
pub use remote::{RemoteClient, RemoteEntry};
pub use store::Store;
pub use webdav::WebDavClient;
