#[derive(Debug)]
pub enum PullError {
    NoSourcePeer,
    Io {
        op: &'static str,
        path: std::path::PathBuf,
        source: std::io::Error,
    },
    Request {
        peer: String,
        source: std::io::Error,
    },
    HashMismatch {
        path: std::path::PathBuf,
        block: usize,
    },
    BlockCountMismatch {
        path: std::path::PathBuf,
        expected: usize,
        actual: usize,
    },
    Scan {
        repo: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoSourcePeer => write!(f, "no available source peer"),
            Self::Io { op, path, source } => {
                write!(f, "failed to {op} '{}': {source}", path.display())
            }
            Self::Request { peer, source } => {
                write!(f, "block request to '{peer}' failed: {source}")
            }
            Self::HashMismatch { path, block } => {
                write!(f, "block {block} hash mismatch in '{}'", path.display())
            }
            Self::BlockCountMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "block count mismatch in '{}': expected {expected}, got {actual}",
                path.display()
            ),
            Self::Scan { repo, source } => {
                write!(f, "rescan of repository '{repo}' failed: {source}")
            }
        }
    }
}

impl std::error::Error for PullError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Request { source, .. } => Some(source),
            Self::Scan { source, .. } => Some(source),
            Self::NoSourcePeer | Self::HashMismatch { .. } | Self::BlockCountMismatch { .. } => {
                None
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, PullError>;
