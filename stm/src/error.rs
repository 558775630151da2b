use crate::settings::ConfigError;

/// Why a transaction was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum AbortReason {
    #[error("read-write conflict")]
    ReadWriteConflict,
    #[error("write-write conflict")]
    WriteWriteConflict,
    /// Another segment won the contention check while committing.
    #[error("aborted by a committing transaction")]
    RemoteAbort,
    /// Lost the contention check on our own commit.
    #[error("lost contention on commit")]
    LostContention,
    #[error("explicit abort")]
    Explicit,
    #[error("out of old-space memory")]
    MemoryPressure,
}

impl AbortReason {
    pub(crate) const fn to_u8(self) -> u8 {
        match self {
            AbortReason::ReadWriteConflict => 1,
            AbortReason::WriteWriteConflict => 2,
            AbortReason::RemoteAbort => 3,
            AbortReason::LostContention => 4,
            AbortReason::Explicit => 5,
            AbortReason::MemoryPressure => 6,
        }
    }

    pub(crate) const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(AbortReason::ReadWriteConflict),
            2 => Some(AbortReason::WriteWriteConflict),
            3 => Some(AbortReason::RemoteAbort),
            4 => Some(AbortReason::LostContention),
            5 => Some(AbortReason::Explicit),
            6 => Some(AbortReason::MemoryPressure),
            _ => None,
        }
    }
}

/// Returned by every fallible transactional operation once the running
/// transaction has been rolled back. The thread is outside any transaction
/// when it sees this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("transaction aborted: {reason}")]
pub struct Abort {
    pub reason: AbortReason,
}

pub type StmResult<T> = Result<T, Abort>;

#[derive(Debug, thiserror::Error)]
pub enum StmError {
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] ConfigError),
    #[error("all {segments} segments are in use")]
    NoFreeSegment { segments: usize },
    #[error("failed to map {bytes} bytes for a segment")]
    MemoryMap { bytes: usize },
}
