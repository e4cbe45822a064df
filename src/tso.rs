//! TCP segmentation offload.
//!
//! A frame carrying an MSS in its [TxMeta](crate::netbuf::TxMeta) is split into segments, each of
//! which is sent with its own descriptor. Every segment consists of a header fragment, which is a
//! copy of the Ethernet, IPv4 and TCP headers with the per segment fields updated, and a payload
//! fragment pointing into the original buffer.

use alloc::{collections::VecDeque, sync::Arc};
use core::fmt;

use crate::{
    error::{TxRxError, TxRxResult},
    freelist::IndexFreeList,
    ieee80211::{ETHERTYPE_IPV4, ETH_HLEN},
    netbuf::{NetBuf, TxFrag},
};

const IPV4_MIN_HLEN: usize = 20;
const IPV4_MAX_HLEN: usize = 60;
const TCP_MIN_HLEN: usize = 20;
const TCP_MAX_HLEN: usize = 60;
const IPPROTO_TCP: u8 = 6;

const TCP_FLAG_FIN: u8 = 0x01;
const TCP_FLAG_PSH: u8 = 0x08;

/// The longest header, that a segment can carry.
pub const TSO_MAX_HDR_LEN: usize = ETH_HLEN + IPV4_MAX_HLEN + TCP_MAX_HLEN;

/// One segment of a TSO frame.
///
/// The segment returns itself to its pool, when dropped.
pub struct TsoSeg {
    id: u16,
    pool: Arc<IndexFreeList>,
    hdr: [u8; TSO_MAX_HDR_LEN],
    hdr_len: usize,
    payload_offset: usize,
    payload_len: usize,
    tcp_seq: u32,
    ip_id: u16,
    seg_num: usize,
    is_last: bool,
    sent_to_target: bool,
}
impl TsoSeg {
    pub fn id(&self) -> u16 {
        self.id
    }
    /// The rewritten Ethernet, IPv4 and TCP headers.
    pub fn header(&self) -> &[u8] {
        &self.hdr[..self.hdr_len]
    }
    /// Offset of the payload in the data of the original frame.
    pub fn payload_offset(&self) -> usize {
        self.payload_offset
    }
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }
    pub fn tcp_seq(&self) -> u32 {
        self.tcp_seq
    }
    pub fn ip_id(&self) -> u16 {
        self.ip_id
    }
    /// Position of this segment in the chain.
    pub fn seg_num(&self) -> usize {
        self.seg_num
    }
    pub fn is_last(&self) -> bool {
        self.is_last
    }
    pub fn is_sent_to_target(&self) -> bool {
        self.sent_to_target
    }
    pub(crate) fn mark_sent_to_target(&mut self) {
        self.sent_to_target = true;
    }
    /// The header and payload fragments of this segment, for a buffer holding the whole frame.
    pub fn frags(&self, buf: &NetBuf) -> [TxFrag; 2] {
        [
            TxFrag {
                paddr: self.hdr.as_ptr() as usize as u64,
                len: self.hdr_len as u32,
            },
            TxFrag {
                paddr: buf.paddr() + self.payload_offset as u64,
                len: self.payload_len as u32,
            },
        ]
    }
}
impl Drop for TsoSeg {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}
impl fmt::Debug for TsoSeg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TsoSeg")
            .field("id", &self.id)
            .field("seg_num", &self.seg_num)
            .field("payload_len", &self.payload_len)
            .field("tcp_seq", &self.tcp_seq)
            .field("is_last", &self.is_last)
            .finish()
    }
}

/// The segments of one frame, in transmission order.
pub type TsoSegList = VecDeque<TsoSeg>;

/// A bounded pool of segment descriptors.
pub struct TsoSegPool {
    ids: Arc<IndexFreeList>,
}
impl TsoSegPool {
    pub fn new(size: usize) -> TxRxResult<Self> {
        Ok(Self {
            ids: Arc::new(IndexFreeList::new(size)?),
        })
    }
    pub fn available(&self) -> usize {
        self.ids.available()
    }
    pub fn capacity(&self) -> usize {
        self.ids.capacity()
    }
    fn alloc(&self) -> Option<u16> {
        self.ids.alloc()
    }
}

/// Offsets of the headers in a TCP/IPv4 frame.
struct TcpFrameLayout {
    ip_offset: usize,
    ip_hlen: usize,
    tcp_offset: usize,
    hdr_len: usize,
    /// End of the IP datagram, which excludes any Ethernet padding.
    datagram_end: usize,
}
impl TcpFrameLayout {
    fn parse(data: &[u8]) -> TxRxResult<Self> {
        if data.len() < ETH_HLEN + IPV4_MIN_HLEN + TCP_MIN_HLEN {
            return Err(TxRxError::Unsupported);
        }
        if u16::from_be_bytes([data[12], data[13]]) != ETHERTYPE_IPV4 {
            return Err(TxRxError::Unsupported);
        }
        let ip_offset = ETH_HLEN;
        let ip = &data[ip_offset..];
        if ip[0] >> 4 != 4 || ip[9] != IPPROTO_TCP {
            return Err(TxRxError::Unsupported);
        }
        let ip_hlen = ((ip[0] & 0xf) as usize) * 4;
        let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
        if ip_hlen < IPV4_MIN_HLEN || total_len < ip_hlen {
            return Err(TxRxError::Unsupported);
        }
        let tcp_offset = ip_offset + ip_hlen;
        let tcp_hlen = data
            .get(tcp_offset + 12)
            .map(|doff| ((doff >> 4) as usize) * 4)
            .ok_or(TxRxError::Unsupported)?;
        let hdr_len = tcp_offset + tcp_hlen;
        let datagram_end = (ip_offset + total_len).min(data.len());
        if tcp_hlen < TCP_MIN_HLEN || hdr_len > datagram_end {
            return Err(TxRxError::Unsupported);
        }
        Ok(Self {
            ip_offset,
            ip_hlen,
            tcp_offset,
            hdr_len,
            datagram_end,
        })
    }
}

fn ipv4_checksum(hdr: &[u8]) -> u16 {
    let mut sum = hdr
        .chunks(2)
        .map(|word| u16::from_be_bytes([word[0], *word.get(1).unwrap_or(&0)]) as u32)
        .sum::<u32>();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Split a TCP/IPv4 frame into segments of at most `mss` payload bytes.
///
/// Every segment gets a copy of the headers with the IP total length, IP ID, IP checksum and TCP
/// sequence number adjusted. FIN and PSH are only kept on the last segment. The TCP checksum is
/// left to the target. If the pool runs dry, all segments taken so far are returned to it.
pub fn segment(buf: &NetBuf, mss: u16, pool: &TsoSegPool) -> TxRxResult<TsoSegList> {
    if mss == 0 {
        return Err(TxRxError::Unsupported);
    }
    let data = buf.data();
    let layout = TcpFrameLayout::parse(data)?;
    let headers = &data[..layout.hdr_len];
    let payload_len = layout.datagram_end - layout.hdr_len;
    let base_ip_id = u16::from_be_bytes([
        headers[layout.ip_offset + 4],
        headers[layout.ip_offset + 5],
    ]);
    let base_seq = u32::from_be_bytes([
        headers[layout.tcp_offset + 4],
        headers[layout.tcp_offset + 5],
        headers[layout.tcp_offset + 6],
        headers[layout.tcp_offset + 7],
    ]);
    let flags = headers[layout.tcp_offset + 13];

    let num_segs = payload_len.div_ceil(mss as usize).max(1);
    let mut segs = TsoSegList::new();
    segs.try_reserve_exact(num_segs)
        .map_err(|_| TxRxError::OutOfMemory)?;
    for seg_num in 0..num_segs {
        let id = pool.alloc().ok_or(TxRxError::PoolExhausted)?;
        let offset = seg_num * mss as usize;
        let seg_len = (payload_len - offset).min(mss as usize);
        let is_last = seg_num + 1 == num_segs;
        let ip_id = base_ip_id.wrapping_add(seg_num as u16);
        let tcp_seq = base_seq.wrapping_add(offset as u32);

        let mut hdr = [0u8; TSO_MAX_HDR_LEN];
        hdr[..layout.hdr_len].copy_from_slice(headers);
        let ip = &mut hdr[layout.ip_offset..layout.tcp_offset];
        let total_len = (layout.hdr_len - layout.ip_offset + seg_len) as u16;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[4..6].copy_from_slice(&ip_id.to_be_bytes());
        ip[10..12].fill(0);
        let checksum = ipv4_checksum(&ip[..layout.ip_hlen]);
        ip[10..12].copy_from_slice(&checksum.to_be_bytes());
        let tcp = &mut hdr[layout.tcp_offset..layout.hdr_len];
        tcp[4..8].copy_from_slice(&tcp_seq.to_be_bytes());
        if !is_last {
            tcp[13] = flags & !(TCP_FLAG_FIN | TCP_FLAG_PSH);
        }

        segs.push_back(TsoSeg {
            id,
            pool: pool.ids.clone(),
            hdr,
            hdr_len: layout.hdr_len,
            payload_offset: layout.hdr_len + offset,
            payload_len: seg_len,
            tcp_seq,
            ip_id,
            seg_num,
            is_last,
            sent_to_target: false,
        });
    }
    trace!("Split TSO frame into {} segments.", segs.len());
    Ok(segs)
}
