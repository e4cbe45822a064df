use core::fmt;

use crate::netbuf::NetBufList;

/// Errors produced by the data path.
///
/// Per-packet errors never unwind past the packet they concern. Only the attach-time variants
/// ([TxRxError::OutOfMemory]) are meant to reach the code responsible for device bring-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxRxError {
    /// A peer lookup missed.
    NotFound,
    /// Allocation of a table or pool failed.
    OutOfMemory,
    /// All ID slots of a peer are in use.
    TooManyIds,
    /// The peer ID is outside of the ID map.
    InvalidPeerId,
    /// The frame couldn't be encapsulated.
    EncapError,
    /// The frame couldn't be decapsulated.
    DecapError,
    /// No tx descriptor was available.
    PoolExhausted,
    /// The transport refused the frame.
    Rejected,
    /// The pause queue of the vdev is at capacity.
    QueueFull,
    /// No vdev with that ID is attached.
    InvalidVdev,
    /// A vdev with that ID is already attached.
    VdevExists,
    /// The buffer has no headroom left for the requested push.
    HeadroomExhausted,
    /// The operation isn't supported in the current configuration.
    Unsupported,
    /// A control event was too short.
    MalformedEvent,
}
impl fmt::Display for TxRxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "peer not found",
            Self::OutOfMemory => "out of memory",
            Self::TooManyIds => "too many peer IDs",
            Self::InvalidPeerId => "invalid peer ID",
            Self::EncapError => "encapsulation failed",
            Self::DecapError => "decapsulation failed",
            Self::PoolExhausted => "tx descriptor pool exhausted",
            Self::Rejected => "rejected by transport",
            Self::QueueFull => "pause queue full",
            Self::InvalidVdev => "invalid vdev",
            Self::VdevExists => "vdev already attached",
            Self::HeadroomExhausted => "headroom exhausted",
            Self::Unsupported => "unsupported",
            Self::MalformedEvent => "malformed control event",
        })
    }
}

pub type TxRxResult<T> = Result<T, TxRxError>;

/// Frames, which weren't accepted by the data path.
///
/// Ownership of every frame, that wasn't taken by the transport or a queue, is handed back in
/// the original order. The caller may retry them later or drop them.
#[derive(Debug)]
pub struct TxRejected {
    pub reason: TxRxError,
    pub frames: NetBufList,
}
impl TxRejected {
    pub(crate) fn new(reason: TxRxError, frames: NetBufList) -> Self {
        Self { reason, frames }
    }
}

pub type TxResult = Result<(), TxRejected>;
