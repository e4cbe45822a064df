//! The parts of the 802.3 and 802.11 frame layouts, which the data path touches.

use core::fmt;

use bitfield_struct::bitfield;
use macro_bits::{bit, check_bit};

pub const ETH_ALEN: usize = 6;
/// Length of an Ethernet II header.
pub const ETH_HLEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_AARP: u16 = 0x80f3;
pub const ETHERTYPE_IPX: u16 = 0x8137;
pub const ETHERTYPE_EAPOL: u16 = 0x888e;
pub const ETHERTYPE_WAPI: u16 = 0x88b4;
/// Values below this are a length, not an EtherType.
pub const ETHERTYPE_MIN: u16 = 0x0600;

pub const LLC_SNAP_PREFIX_LEN: usize = 6;
/// LLC/SNAP prefix plus the EtherType.
pub const LLC_SNAP_HDR_LEN: usize = LLC_SNAP_PREFIX_LEN + 2;
pub const RFC1042_PREFIX: [u8; LLC_SNAP_PREFIX_LEN] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0x00];
pub const BRIDGE_TUNNEL_PREFIX: [u8; LLC_SNAP_PREFIX_LEN] = [0xaa, 0xaa, 0x03, 0x00, 0x00, 0xf8];

pub const HDR_LEN_3ADDR: usize = 24;
pub const HDR_LEN_4ADDR: usize = 30;
pub const QOS_CTRL_LEN: usize = 2;
/// The largest header we ever build.
pub const MAX_HDR_LEN: usize = HDR_LEN_4ADDR + QOS_CTRL_LEN;

pub const ADDR1_OFFSET: usize = 4;
pub const ADDR2_OFFSET: usize = 10;
pub const ADDR3_OFFSET: usize = 16;
pub const SEQ_CTRL_OFFSET: usize = 22;
pub const ADDR4_OFFSET: usize = 24;

pub const FRAME_TYPE_DATA: u8 = 2;
pub const SUBTYPE_DATA: u8 = 0x0;
/// The QoS bit of the data subtypes.
pub const SUBTYPE_QOS_FLAG: u8 = 0x8;

/// Length of the DA/SA/length header in front of every A-MSDU subframe.
pub const AMSDU_SUBFRAME_HDR_LEN: usize = ETH_HLEN;

/// TID 0-15 plus the management pseudo TID.
pub const NUM_TIDS: usize = 17;
pub const MGMT_TID: u8 = 16;
/// Mask applied to the TID before it goes into the QoS control field.
pub const QOS_TID_MASK: u8 = 0xf;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MacAddr(pub [u8; ETH_ALEN]);
impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; ETH_ALEN]);
    pub const ZERO: Self = Self([0x00; ETH_ALEN]);

    pub const fn new(addr: [u8; ETH_ALEN]) -> Self {
        Self(addr)
    }
    /// Read an address from the start of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.get(..ETH_ALEN)?.try_into().ok().map(Self)
    }
    /// Group addresses have the I/G bit set, which includes broadcast.
    pub fn is_multicast(&self) -> bool {
        check_bit!(self.0[0], bit!(0))
    }
    pub const fn as_bytes(&self) -> &[u8; ETH_ALEN] {
        &self.0
    }
}
impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct FrameControl {
    #[bits(2)]
    pub protocol_version: u8,
    #[bits(2)]
    pub frame_type: u8,
    #[bits(4)]
    pub subtype: u8,
    pub to_ds: bool,
    pub from_ds: bool,
    pub more_fragments: bool,
    pub retry: bool,
    pub pwr_mgmt: bool,
    pub more_data: bool,
    pub protected: bool,
    pub order: bool,
}
impl FrameControl {
    /// A data frame with the specified DS bits.
    pub const fn data(ds_mode: DsMode) -> Self {
        let (to_ds, from_ds) = ds_mode.bits();
        Self::new()
            .with_frame_type(FRAME_TYPE_DATA)
            .with_subtype(SUBTYPE_DATA)
            .with_to_ds(to_ds)
            .with_from_ds(from_ds)
    }
    pub fn read(bytes: &[u8]) -> Option<Self> {
        let raw = bytes.get(..2)?;
        Some(Self::from_bits(u16::from_le_bytes([raw[0], raw[1]])))
    }
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[..2].copy_from_slice(&self.into_bits().to_le_bytes());
    }
    pub const fn is_data(&self) -> bool {
        self.frame_type() == FRAME_TYPE_DATA
    }
    pub const fn is_qos_data(&self) -> bool {
        self.is_data() && self.subtype() & SUBTYPE_QOS_FLAG != 0
    }
    pub const fn ds_mode(&self) -> DsMode {
        DsMode::from_bits(self.to_ds(), self.from_ds())
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq)]
pub struct QosControl {
    #[bits(4)]
    pub tid: u8,
    pub eosp: bool,
    #[bits(2)]
    pub ack_policy: u8,
    pub amsdu_present: bool,
    #[bits(8)]
    pub txop: u8,
}

/// The combination of the ToDS and FromDS bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DsMode {
    NoDs,
    ToDs,
    FromDs,
    DsToDs,
}
impl DsMode {
    pub const fn from_bits(to_ds: bool, from_ds: bool) -> Self {
        match (to_ds, from_ds) {
            (false, false) => Self::NoDs,
            (true, false) => Self::ToDs,
            (false, true) => Self::FromDs,
            (true, true) => Self::DsToDs,
        }
    }
    /// Returns `(to_ds, from_ds)`.
    pub const fn bits(&self) -> (bool, bool) {
        match self {
            Self::NoDs => (false, false),
            Self::ToDs => (true, false),
            Self::FromDs => (false, true),
            Self::DsToDs => (true, true),
        }
    }
    pub const fn has_addr4(&self) -> bool {
        matches!(self, Self::DsToDs)
    }
}

/// Length of an 802.11 data header, including the QoS control field if present.
pub const fn data_header_len(fc: FrameControl) -> usize {
    let base = if fc.ds_mode().has_addr4() {
        HDR_LEN_4ADDR
    } else {
        HDR_LEN_3ADDR
    };
    if fc.is_qos_data() {
        base + QOS_CTRL_LEN
    } else {
        base
    }
}

/// Offset of the QoS control field in a header with this frame control.
pub const fn qos_ctrl_offset(fc: FrameControl) -> usize {
    if fc.ds_mode().has_addr4() {
        HDR_LEN_4ADDR
    } else {
        HDR_LEN_3ADDR
    }
}

/// Read the address at `offset` from a header.
pub fn read_addr(hdr: &[u8], offset: usize) -> MacAddr {
    hdr.get(offset..)
        .and_then(MacAddr::from_slice)
        .unwrap_or_default()
}
pub fn write_addr(hdr: &mut [u8], offset: usize, addr: MacAddr) {
    hdr[offset..offset + ETH_ALEN].copy_from_slice(addr.as_bytes());
}

/// An Ethernet II header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    /// Either an EtherType or, for 802.3 frames with LLC, the payload length.
    pub ethertype: u16,
}
impl EthHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ETH_HLEN {
            return None;
        }
        Some(Self {
            dst: MacAddr::from_slice(&bytes[0..6])?,
            src: MacAddr::from_slice(&bytes[6..12])?,
            ethertype: u16::from_be_bytes([bytes[12], bytes[13]]),
        })
    }
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..6].copy_from_slice(self.dst.as_bytes());
        bytes[6..12].copy_from_slice(self.src.as_bytes());
        bytes[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
    /// Check if the type field holds an EtherType rather than a length.
    pub const fn is_ethertype(&self) -> bool {
        self.ethertype >= ETHERTYPE_MIN
    }
}

/// The SNAP prefix used to carry `ethertype`.
///
/// AppleTalk ARP and IPX use the bridge tunnel encapsulation, everything else RFC 1042.
pub const fn llc_snap_prefix(ethertype: u16) -> [u8; LLC_SNAP_PREFIX_LEN] {
    match ethertype {
        ETHERTYPE_AARP | ETHERTYPE_IPX => BRIDGE_TUNNEL_PREFIX,
        _ => RFC1042_PREFIX,
    }
}

/// Check if the key exchange frames, that bypass all pausing, use this EtherType.
pub const fn is_key_exchange(ethertype: u16) -> bool {
    matches!(ethertype, ETHERTYPE_EAPOL | ETHERTYPE_WAPI)
}
