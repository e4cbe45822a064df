//! Tx descriptors.
//!
//! A descriptor carries everything the target needs to know about one frame or TSO segment. The
//! descriptors come from a fixed size pool, which is shared by all vdevs of a device. Allocating
//! hands out a [TxDesc] by value, and dropping it returns its ID to the pool. Each descriptor is
//! therefore returned exactly once, no matter if that happens through a completion or through a
//! local failure.

use alloc::sync::Arc;
use core::fmt;

use bitfield_struct::bitfield;

use crate::{
    error::TxRxResult,
    freelist::IndexFreeList,
    ieee80211::{LLC_SNAP_HDR_LEN, MAX_HDR_LEN},
    netbuf::{NetBuf, TxFrag},
    peer::PeerRef,
    tso::TsoSeg,
};

/// The most fragments a descriptor can describe, including the first one.
pub const MAX_FRAGS: usize = 8;
/// Size of the scratch space for a synthesized 802.11 header.
pub const MPDU_HDR_SCRATCH_LEN: usize = MAX_HDR_LEN + LLC_SNAP_HDR_LEN;

/// The fixed header of a descriptor, as the target sees it.
#[bitfield(u32)]
pub struct TxDescHeader {
    #[bits(16)]
    pub pkt_len: u16,
    #[bits(5)]
    pub ext_tid: u8,
    pub cksum_offload: bool,
    pub no_encrypt: bool,
    pub is_tso: bool,
    #[bits(4)]
    pub num_frags: u8,
    #[bits(4)]
    pub __: u8,
}

/// The outcome of a transmission, as reported by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxCompletionStatus {
    /// The frame was delivered.
    Ok,
    /// The target dropped the frame.
    Discard,
    /// The frame wasn't acknowledged.
    NoAck,
    /// The frame was dropped locally.
    PktError,
    /// The frame never made it to the target.
    DownloadFail,
}

pub struct TxDesc {
    id: u16,
    pool: Arc<IndexFreeList>,
    pub(crate) header: TxDescHeader,
    pub(crate) buf: Option<NetBuf>,
    pub(crate) peer: Option<PeerRef>,
    pub(crate) vdev_id: u8,
    pub(crate) tid: u8,
    mpdu_hdr: [u8; MPDU_HDR_SCRATCH_LEN],
    mpdu_hdr_len: usize,
    /// Bytes of the original L2 header, that were pulled from the buffer during encapsulation.
    pub(crate) orig_l2_hdr_bytes: usize,
    frags: [TxFrag; MAX_FRAGS],
    pub(crate) tso_seg: Option<TsoSeg>,
    pub(crate) download_len: usize,
}
impl TxDesc {
    fn new(id: u16, pool: Arc<IndexFreeList>) -> Self {
        Self {
            id,
            pool,
            header: TxDescHeader::new(),
            buf: None,
            peer: None,
            vdev_id: 0,
            tid: 0,
            mpdu_hdr: [0u8; MPDU_HDR_SCRATCH_LEN],
            mpdu_hdr_len: 0,
            orig_l2_hdr_bytes: 0,
            frags: [TxFrag::default(); MAX_FRAGS],
            tso_seg: None,
            download_len: 0,
        }
    }
    pub fn id(&self) -> u16 {
        self.id
    }
    pub fn header(&self) -> TxDescHeader {
        self.header
    }
    pub fn buf(&self) -> Option<&NetBuf> {
        self.buf.as_ref()
    }
    pub fn peer(&self) -> Option<&PeerRef> {
        self.peer.as_ref()
    }
    pub fn vdev_id(&self) -> u8 {
        self.vdev_id
    }
    pub fn tid(&self) -> u8 {
        self.tid
    }
    /// The 802.11 header built for this frame, if the frame had to be encapsulated.
    pub fn mpdu_header(&self) -> &[u8] {
        &self.mpdu_hdr[..self.mpdu_hdr_len]
    }
    pub(crate) fn mpdu_header_scratch(&mut self) -> &mut [u8; MPDU_HDR_SCRATCH_LEN] {
        &mut self.mpdu_hdr
    }
    pub(crate) fn set_mpdu_header_len(&mut self, len: usize) {
        self.mpdu_hdr_len = len.min(MPDU_HDR_SCRATCH_LEN);
    }
    pub fn orig_l2_hdr_bytes(&self) -> usize {
        self.orig_l2_hdr_bytes
    }
    /// The fragments of the frame, starting with the one holding the (header of the) frame.
    pub fn frags(&self) -> &[TxFrag] {
        &self.frags[..self.header.num_frags() as usize]
    }
    /// Fill the fragment table.
    ///
    /// Fragments beyond the table size are dropped. Returns the number of fragments written.
    pub(crate) fn set_frags(&mut self, frags: impl IntoIterator<Item = TxFrag>) -> usize {
        let mut num_frags = 0;
        for (slot, frag) in self.frags.iter_mut().zip(frags) {
            *slot = frag;
            num_frags += 1;
        }
        self.header.set_num_frags(num_frags as u8);
        num_frags
    }
    pub fn tso_seg(&self) -> Option<&TsoSeg> {
        self.tso_seg.as_ref()
    }
    /// Number of bytes the transport should copy eagerly.
    pub fn download_len(&self) -> usize {
        self.download_len
    }
    /// Take the frame out of the descriptor.
    pub fn take_buf(&mut self) -> Option<NetBuf> {
        self.buf.take()
    }
}
impl Drop for TxDesc {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
impl fmt::Debug for TxDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxDesc")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("vdev_id", &self.vdev_id)
            .field("tid", &self.tid)
            .field("download_len", &self.download_len)
            .field("tso_seg", &self.tso_seg)
            .finish()
    }
}

/// The descriptor pool of a device.
pub struct TxDescPool {
    ids: Arc<IndexFreeList>,
}
impl TxDescPool {
    pub fn new(size: usize) -> TxRxResult<Self> {
        Ok(Self {
            ids: Arc::new(IndexFreeList::new(size)?),
        })
    }
    /// Take a descriptor from the pool.
    pub fn alloc(&self) -> Option<TxDesc> {
        self.ids
            .alloc()
            .map(|id| TxDesc::new(id, self.ids.clone()))
    }
    /// Return a descriptor to the pool.
    ///
    /// This is the same as dropping it, but makes the intent explicit.
    pub fn free(&self, desc: TxDesc) {
        drop(desc);
    }
    pub fn available(&self) -> usize {
        self.ids.available()
    }
    pub fn capacity(&self) -> usize {
        self.ids.capacity()
    }
}
