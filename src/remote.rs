//! The remote store interface the engine consumes.

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;

/// A streamable remote object body.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// One entry of a remote collection listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    /// Name relative to the listed collection.
    pub name: String,
    /// Unix mtime as reported by the server, 0 when unknown.
    pub mtime: i64,
}

/// Minimal remote-store surface. Implementations target WebDAV; the engine
/// makes no HTTP assumptions beyond this shape.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// List the files directly inside `path` (collections are omitted).
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Open a streaming read of `path`.
    async fn read_stream(&self, path: &str) -> Result<RemoteReader>;

    /// Create or overwrite `path` from `data`. `mode` is advisory; stores
    /// without permission bits ignore it.
    async fn write_stream(&self, path: &str, data: RemoteReader, mode: u32) -> Result<()>;

    /// Remove `path`; removing a missing target succeeds.
    async fn remove(&self, path: &str) -> Result<()>;
}
