//! Capability through which the puller reaches the rest of the system:
//! the authoritative global/local/need file lists, the availability
//! index, the wire protocol client, and repository lifecycle state.

use async_trait::async_trait;

use crate::pull::types::FileInfo;

/// Connection id reserved for the local node. The puller never requests
/// blocks from itself.
pub const LOCAL_CONN_ID: u32 = 0;

/// Repository lifecycle state as exposed to observers. `Scanning` is set
/// by the model itself during walks; the puller sets the other three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoState {
    Idle,
    Scanning,
    Syncing,
    Cleaning,
}

/// A currently connected peer. The `id` indexes availability bitmaps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnection {
    pub name: String,
    pub id: u32,
}

#[async_trait]
pub trait Model: Send + Sync {
    /// Walks the repository tree and refreshes the local file list.
    async fn scan_repo(&self, repo: &str) -> std::io::Result<()>;

    /// Files whose local version lags the global one.
    fn need_files(&self, repo: &str) -> Vec<FileInfo>;

    /// The current local version of `name`, if one is known.
    fn current_file(&self, repo: &str, name: &str) -> Option<FileInfo>;

    /// Bitmap over connection ids of the peers that hold `name`.
    fn availability(&self, repo: &str, name: &str) -> u64;

    /// Fetches `size` bytes of `name` at `offset` from `peer`.
    async fn request_global(
        &self,
        peer: &str,
        repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> std::io::Result<Vec<u8>>;

    /// Records that the local tree now carries this version of the file.
    fn update_local(&self, repo: &str, file: FileInfo);

    /// Publishes the repository lifecycle state.
    fn set_state(&self, repo: &str, state: RepoState);

    /// The currently connected peers, including the local node.
    fn connections(&self) -> Vec<PeerConnection>;

    /// Marks the repository unusable. The puller exits after calling this.
    fn invalidate_repo(&self, repo: &str, reason: String);
}
