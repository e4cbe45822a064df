use std::{sync::Mutex, vec::Vec};

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    ieee80211::{
        write_addr, DsMode, FrameControl, MacAddr, QosControl, ADDR1_OFFSET, ADDR2_OFFSET,
        ADDR3_OFFSET, ETHERTYPE_EAPOL, ETHERTYPE_IPV4, HDR_LEN_3ADDR, HDR_LEN_4ADDR,
        RFC1042_PREFIX, SUBTYPE_QOS_FLAG,
    },
    netbuf::NetBuf,
    tx_desc::TxDesc,
    TxTransport,
};

pub const VDEV_MAC: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
pub const BSSID: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0xaa]);
pub const STA_A: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x0a]);
pub const STA_B: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x0b]);

/// An Ethernet II frame.
pub fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> NetBuf {
    let mut bytes = Vec::from(dst.0);
    bytes.extend_from_slice(&src.0);
    bytes.extend_from_slice(&ethertype.to_be_bytes());
    bytes.extend_from_slice(payload);
    NetBuf::from_slice(&bytes).unwrap()
}

/// An EAPOL-Key frame.
pub fn eapol_frame(dst: MacAddr, src: MacAddr) -> NetBuf {
    eth_frame(dst, src, ETHERTYPE_EAPOL, &[0x02, 0x03, 0x00, 0x5f, 0x02])
}

/// An IPv4 frame, that isn't TCP.
pub fn ip_frame(dst: MacAddr, src: MacAddr, tag: u8) -> NetBuf {
    let mut ip = [0u8; 28];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&28u16.to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[20..].fill(tag);
    eth_frame(dst, src, ETHERTYPE_IPV4, &ip)
}

/// A TCP/IPv4 frame from [STA_A] to [STA_B] with `payload_len` bytes of payload.
pub fn tcp_frame(payload_len: usize, seq: u32, flags: u8) -> NetBuf {
    let mut ip = [0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((40 + payload_len) as u16).to_be_bytes());
    ip[4..6].copy_from_slice(&0x1000u16.to_be_bytes());
    ip[6] = 0x40;
    ip[8] = 64;
    ip[9] = 6;
    ip[12..16].copy_from_slice(&[192, 168, 1, 10]);
    ip[16..20].copy_from_slice(&[192, 168, 1, 20]);

    let mut tcp = [0u8; 20];
    tcp[0..2].copy_from_slice(&49152u16.to_be_bytes());
    tcp[2..4].copy_from_slice(&80u16.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[12] = 0x50;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&0xffffu16.to_be_bytes());

    let mut payload = Vec::from(ip);
    payload.extend_from_slice(&tcp);
    payload.extend((0..payload_len).map(|i| i as u8));
    eth_frame(STA_B, STA_A, ETHERTYPE_IPV4, &payload)
}

/// An 802.11 data header. With `amsdu` set, the header carries QoS control with the A-MSDU
/// present bit set accordingly.
pub fn mpdu_header(
    ds_mode: DsMode,
    addr1: MacAddr,
    addr2: MacAddr,
    addr3: MacAddr,
    amsdu: Option<bool>,
) -> Vec<u8> {
    let mut fc = FrameControl::data(ds_mode);
    let base_len = if ds_mode.has_addr4() {
        HDR_LEN_4ADDR
    } else {
        HDR_LEN_3ADDR
    };
    let mut hdr = std::vec![0u8; base_len];
    if let Some(amsdu) = amsdu {
        fc.set_subtype(fc.subtype() | SUBTYPE_QOS_FLAG);
        let qos = QosControl::new().with_amsdu_present(amsdu);
        hdr.extend_from_slice(&qos.into_bits().to_le_bytes());
    }
    fc.write(&mut hdr);
    write_addr(&mut hdr, ADDR1_OFFSET, addr1);
    write_addr(&mut hdr, ADDR2_OFFSET, addr2);
    write_addr(&mut hdr, ADDR3_OFFSET, addr3);
    hdr
}

/// One A-MSDU subframe with an RFC 1042 LLC header.
pub fn amsdu_subframe(
    da: MacAddr,
    sa: MacAddr,
    ethertype: u16,
    payload: &[u8],
    pad: bool,
) -> Vec<u8> {
    let mut bytes = Vec::from(da.0);
    bytes.extend_from_slice(&sa.0);
    bytes.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
    bytes.extend_from_slice(&RFC1042_PREFIX);
    bytes.extend_from_slice(&ethertype.to_be_bytes());
    bytes.extend_from_slice(payload);
    if pad {
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
    }
    bytes
}

/// A transport recording everything it accepts.
#[derive(Default)]
pub struct MockTransport {
    submitted: Mutex<Vec<(TxDesc, u8, usize)>>,
    attempts: AtomicUsize,
    /// One based index of the submission attempt to reject.
    reject_nth: AtomicUsize,
    reject_all: AtomicBool,
}
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }
    /// Reject only the `n`th submission attempt, counting from one.
    pub fn reject_nth(&self, n: usize) {
        self.reject_nth.store(n, Ordering::SeqCst);
    }
    pub fn set_reject_all(&self, reject: bool) {
        self.reject_all.store(reject, Ordering::SeqCst);
    }
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
    pub fn accepted(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
    /// Take all accepted descriptors, with their endpoint and download length.
    pub fn take(&self) -> Vec<(TxDesc, u8, usize)> {
        core::mem::take(&mut *self.submitted.lock().unwrap())
    }
    /// Take only the accepted descriptors.
    pub fn take_descs(&self) -> Vec<TxDesc> {
        self.take().into_iter().map(|(desc, _, _)| desc).collect()
    }
    /// The frames of all accepted descriptors, in submission order.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(desc, _, _)| desc.buf().map(|buf| Vec::from(buf.data())))
            .collect()
    }
}
impl TxTransport for MockTransport {
    fn submit(&self, desc: TxDesc, endpoint: u8, download_len: usize) -> Result<(), TxDesc> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let rejected = self.reject_all.load(Ordering::SeqCst)
            || self.reject_nth.load(Ordering::SeqCst) == attempt;
        if rejected {
            return Err(desc);
        }
        self.submitted
            .lock()
            .unwrap()
            .push((desc, endpoint, download_len));
        Ok(())
    }
}
