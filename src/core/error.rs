use crate::core::jobs::Phase;
use crate::core::model::{ResourceId, TransitionError};
use std::fmt;

/// Persisted classification of a unit failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NetworkTransient,
    NetworkPermanent,
    Decode,
    PlaylistParse,
    SegmentIncomplete,
    MergeTool,
    Storage,
    LocalIo,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::NetworkPermanent => "network_permanent",
            ErrorKind::Decode => "decode",
            ErrorKind::PlaylistParse => "playlist_parse",
            ErrorKind::SegmentIncomplete => "segment_incomplete",
            ErrorKind::MergeTool => "merge_tool",
            ErrorKind::Storage => "storage",
            ErrorKind::LocalIo => "local_io",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "network_transient" => ErrorKind::NetworkTransient,
            "network_permanent" => ErrorKind::NetworkPermanent,
            "decode" => ErrorKind::Decode,
            "playlist_parse" => ErrorKind::PlaylistParse,
            "segment_incomplete" => ErrorKind::SegmentIncomplete,
            "merge_tool" => ErrorKind::MergeTool,
            "storage" => ErrorKind::Storage,
            "local_io" => ErrorKind::LocalIo,
            "cancelled" => ErrorKind::Cancelled,
            "internal" => ErrorKind::Internal,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt record {id}: {detail}")]
    Corrupt { id: String, detail: String },
}

#[derive(thiserror::Error, Debug)]
pub enum MergeError {
    #[error("merge tool `{0}` not found; install it or pass its path explicitly")]
    ToolMissing(String),

    #[error("merge tool exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("merge tool i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that can end (or interrupt) one unit of work.
#[derive(thiserror::Error, Debug)]
pub enum UnitError {
    #[error("transient network error: {0}")]
    NetworkTransient(String),

    #[error("network error: {0}")]
    NetworkPermanent(String),

    #[error("inline payload could not be decoded: {0}")]
    Decode(String),

    #[error("malformed playlist: {0}")]
    PlaylistParse(String),

    #[error("segment {index} could not be downloaded: {detail}")]
    SegmentIncomplete { index: u64, detail: String },

    #[error(transparent)]
    MergeTool(#[from] MergeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("local i/o: {0}")]
    LocalIo(#[from] std::io::Error),

    #[error("not enough free space: {required} bytes needed, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("unit panicked: {0}")]
    Panicked(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl UnitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UnitError::NetworkTransient(_) => ErrorKind::NetworkTransient,
            UnitError::NetworkPermanent(_) => ErrorKind::NetworkPermanent,
            UnitError::Decode(_) => ErrorKind::Decode,
            UnitError::PlaylistParse(_) => ErrorKind::PlaylistParse,
            UnitError::SegmentIncomplete { .. } => ErrorKind::SegmentIncomplete,
            UnitError::MergeTool(_) => ErrorKind::MergeTool,
            UnitError::Storage(_) => ErrorKind::Storage,
            UnitError::LocalIo(_) | UnitError::InsufficientSpace { .. } => ErrorKind::LocalIo,
            UnitError::Cancelled => ErrorKind::Cancelled,
            UnitError::Transition(_) | UnitError::Panicked(_) | UnitError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// A command the orchestrator refused to start.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("engine is busy ({0:?})")]
    Busy(Phase),

    #[error("nothing is running")]
    Idle,

    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("http client: {0}")]
    Client(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("output directory: {0}")]
    Io(#[from] std::io::Error),
}
