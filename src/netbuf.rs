//! Network buffers with reserved headroom.
//!
//! The bytes of a [NetBuf] are reference counted, so that one frame can be referenced by
//! multiple descriptors, as is the case for TSO. Cloning a [NetBuf] adds a user, dropping one
//! removes it. Every clone has its own view (head and tail) into the shared bytes.
//!
//! ```text
//! |<-- headroom -->|<-- data (head..tail) -->|<-- tailroom -->|
//! 0              head                      tail          capacity
//! ```

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use core::fmt;

use crate::error::{TxRxError, TxRxResult};

/// Headroom reserved by [NetBuf::from_slice].
pub const DEFAULT_HEADROOM: usize = 64;

/// A list of frames, as exchanged with the network stack.
pub type NetBufList = VecDeque<NetBuf>;

/// A DMA fragment of a frame, beyond the one holding the frame data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxFrag {
    pub paddr: u64,
    pub len: u32,
}

/// Per packet metadata attached by the OS facing layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxMeta {
    /// Traffic identifier. If [None], the TID is derived from the frame.
    pub ext_tid: Option<u8>,
    /// The target should compute the L4 checksum.
    pub cksum_offload: bool,
    /// Send the frame unencrypted, even if a key is installed.
    pub no_encrypt: bool,
    /// The frame will be encrypted, so the protected bit has to be set.
    pub do_encrypt: bool,
    /// Maximum segment size, if the frame is to be segmented.
    pub tso_mss: Option<u16>,
    /// Fragments following the data of this buffer.
    pub extra_frags: Vec<TxFrag>,
}

#[derive(Clone)]
pub struct NetBuf {
    bytes: Arc<Vec<u8>>,
    head: usize,
    tail: usize,
    pub meta: TxMeta,
}
impl NetBuf {
    /// Copy `data` into a new buffer with `headroom` bytes in front of it.
    pub fn with_headroom(headroom: usize, data: &[u8]) -> TxRxResult<Self> {
        let capacity = headroom
            .checked_add(data.len())
            .ok_or(TxRxError::OutOfMemory)?;
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(capacity)
            .map_err(|_| TxRxError::OutOfMemory)?;
        bytes.resize(headroom, 0);
        bytes.extend_from_slice(data);
        Ok(Self {
            bytes: Arc::new(bytes),
            head: headroom,
            tail: capacity,
            meta: TxMeta::default(),
        })
    }
    /// Copy `data` into a new buffer with [DEFAULT_HEADROOM].
    pub fn from_slice(data: &[u8]) -> TxRxResult<Self> {
        Self::with_headroom(DEFAULT_HEADROOM, data)
    }
    pub fn with_meta(mut self, meta: TxMeta) -> Self {
        self.meta = meta;
        self
    }
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.head..self.tail]
    }
    /// Mutable access to the data.
    ///
    /// Returns [None] if the bytes are shared with another user.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        let (head, tail) = (self.head, self.tail);
        Arc::get_mut(&mut self.bytes).map(|bytes| &mut bytes[head..tail])
    }
    pub fn len(&self) -> usize {
        self.tail - self.head
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn headroom(&self) -> usize {
        self.head
    }
    /// Extend the data by `len` bytes into the headroom.
    ///
    /// The bytes aren't touched, so pushing back previously pulled bytes restores them.
    pub fn push_header(&mut self, len: usize) -> TxRxResult<()> {
        if len > self.head {
            return Err(TxRxError::HeadroomExhausted);
        }
        self.head -= len;
        Ok(())
    }
    /// Remove `len` bytes from the front of the data.
    ///
    /// This fails with [TxRxError::HeadroomExhausted], if the data is shorter than that.
    pub fn pull_header(&mut self, len: usize) -> TxRxResult<()> {
        if len > self.len() {
            return Err(TxRxError::HeadroomExhausted);
        }
        self.head += len;
        Ok(())
    }
    /// Shorten the data to `len` bytes. Longer lengths are ignored.
    pub fn trim(&mut self, len: usize) {
        if len < self.len() {
            self.tail = self.head + len;
        }
    }
    /// The number of [NetBuf]s referencing these bytes.
    pub fn users(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
    /// Bus address of the data, as seen by the transport.
    pub fn paddr(&self) -> u64 {
        self.data().as_ptr() as usize as u64
    }
}
impl fmt::Debug for NetBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetBuf")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("users", &self.users())
            .finish()
    }
}
