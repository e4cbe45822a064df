//! Conversion between the frame formats of the network stack and the target.
//!
//! On tx, the 802.11 header is built into scratch space of the descriptor and the bytes of the
//! original L2 header it replaces are pulled from the buffer. Pushing them back restores the frame
//! unmodified, which is what happens to frames the transport didn't accept.
//!
//! On rx, frames are converted in place. A-MSDU subframes after the first one don't carry an
//! 802.11 header, so the header of the first subframe is cached in a [DecapState], which the
//! caller owns and passes along with every subframe of one MPDU.

use crate::{
    config::{FrameFormat, OpMode, PdevConfig},
    error::{TxRxError, TxRxResult},
    ieee80211::{
        data_header_len, llc_snap_prefix, qos_ctrl_offset, read_addr, write_addr, DsMode,
        EthHeader, FrameControl, MacAddr, QosControl, ADDR1_OFFSET, ADDR2_OFFSET, ADDR3_OFFSET,
        ADDR4_OFFSET, AMSDU_SUBFRAME_HDR_LEN, BRIDGE_TUNNEL_PREFIX, ETHERTYPE_AARP,
        ETHERTYPE_IPX, ETH_ALEN, ETH_HLEN, HDR_LEN_3ADDR, HDR_LEN_4ADDR, LLC_SNAP_HDR_LEN,
        LLC_SNAP_PREFIX_LEN, MAX_HDR_LEN, QOS_CTRL_LEN, QOS_TID_MASK, RFC1042_PREFIX,
        SUBTYPE_QOS_FLAG,
    },
    netbuf::NetBuf,
    tx_desc::MPDU_HDR_SCRATCH_LEN,
};

/// How frames are prepared for the target.
///
/// Exactly one of these applies to a device, since it's derived from read-only configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EncapStrategy {
    /// The frame is handed over untouched.
    Passthrough,
    /// The frame already carries an 802.11 header, which is extended.
    FromNativeWifi,
    /// The 802.11 header is synthesized from the Ethernet header.
    FromEthernet,
}
impl EncapStrategy {
    pub fn from_config(config: &PdevConfig) -> Self {
        match config.frame_format {
            FrameFormat::NativeWifi => Self::FromNativeWifi,
            FrameFormat::Ethernet if !config.target_8023_translation => Self::FromEthernet,
            _ => Self::Passthrough,
        }
    }
}

/// Everything [encap] needs to know about the frame besides its bytes.
#[derive(Clone, Copy, Debug)]
pub struct TxEncapParams {
    pub opmode: OpMode,
    pub vdev_mac: MacAddr,
    pub bssid: MacAddr,
    /// Address of the destination peer, if one was found.
    pub peer_mac: Option<MacAddr>,
    pub peer_qos_capable: bool,
    pub tid: u8,
    /// Insert the LLC/SNAP header on the host.
    pub sw_llc: bool,
    /// Set the protected frame bit.
    pub protect: bool,
}

/// The result of a successful [encap].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncapOutput {
    /// Length of the header written to the scratch space.
    pub hdr_len: usize,
    /// Number of bytes pulled from the front of the buffer.
    pub orig_l2_hdr_bytes: usize,
}

/// Encapsulate the frame in `buf` for the target.
///
/// On failure, the buffer is left untouched.
pub fn encap(
    strategy: EncapStrategy,
    params: &TxEncapParams,
    buf: &mut NetBuf,
    hdr: &mut [u8; MPDU_HDR_SCRATCH_LEN],
) -> TxRxResult<EncapOutput> {
    let out = match strategy {
        EncapStrategy::Passthrough => return Ok(EncapOutput::default()),
        EncapStrategy::FromNativeWifi => encap_from_native_wifi(params, buf.data(), hdr)?,
        EncapStrategy::FromEthernet => encap_from_ethernet(params, buf.data(), hdr)?,
    };
    buf.pull_header(out.orig_l2_hdr_bytes)
        .map_err(|_| TxRxError::EncapError)?;
    Ok(out)
}

/// Undo [encap], by pushing the pulled bytes back onto the buffer.
pub fn restore(buf: &mut NetBuf, orig_l2_hdr_bytes: usize) {
    // The bytes were pulled from this buffer, so there's always enough headroom.
    let _ = buf.push_header(orig_l2_hdr_bytes);
}

/// Append the QoS control field, if the frame qualifies for one, and return the new length.
fn add_qos_ctrl(
    params: &TxEncapParams,
    fc: &mut FrameControl,
    ra: MacAddr,
    hdr: &mut [u8],
    hdr_len: usize,
) -> usize {
    if !params.peer_qos_capable || ra.is_multicast() {
        return hdr_len;
    }
    fc.set_subtype(fc.subtype() | SUBTYPE_QOS_FLAG);
    let qos = QosControl::new().with_tid(params.tid & QOS_TID_MASK);
    hdr[hdr_len..hdr_len + QOS_CTRL_LEN].copy_from_slice(&qos.into_bits().to_le_bytes());
    hdr_len + QOS_CTRL_LEN
}

fn encap_from_native_wifi(
    params: &TxEncapParams,
    data: &[u8],
    hdr: &mut [u8; MPDU_HDR_SCRATCH_LEN],
) -> TxRxResult<EncapOutput> {
    let mut fc = FrameControl::read(data).ok_or(TxRxError::EncapError)?;
    // Frames from the stack never carry a QoS control field.
    let orig_len = if fc.ds_mode().has_addr4() {
        HDR_LEN_4ADDR
    } else {
        HDR_LEN_3ADDR
    };
    if data.len() < orig_len {
        return Err(TxRxError::EncapError);
    }
    hdr[..orig_len].copy_from_slice(&data[..orig_len]);
    let ra = read_addr(hdr, ADDR1_OFFSET);
    let hdr_len = add_qos_ctrl(params, &mut fc, ra, hdr, orig_len);
    if params.protect {
        fc.set_protected(true);
    }
    fc.write(hdr);
    Ok(EncapOutput {
        hdr_len,
        orig_l2_hdr_bytes: orig_len,
    })
}

fn encap_from_ethernet(
    params: &TxEncapParams,
    data: &[u8],
    hdr: &mut [u8; MPDU_HDR_SCRATCH_LEN],
) -> TxRxResult<EncapOutput> {
    let eth = EthHeader::parse(data).ok_or(TxRxError::EncapError)?;
    let (ds_mode, addr1, addr2, addr3) = match params.opmode {
        OpMode::Ap => (DsMode::FromDs, eth.dst, params.vdev_mac, eth.src),
        OpMode::Ibss | OpMode::Ocb => (DsMode::NoDs, eth.dst, eth.src, params.bssid),
        OpMode::Sta => (
            DsMode::ToDs,
            params.peer_mac.unwrap_or(params.bssid),
            eth.src,
            eth.dst,
        ),
        OpMode::Monitor | OpMode::Unknown(_) => return Err(TxRxError::EncapError),
    };
    hdr[..HDR_LEN_3ADDR].fill(0);
    write_addr(hdr, ADDR1_OFFSET, addr1);
    write_addr(hdr, ADDR2_OFFSET, addr2);
    write_addr(hdr, ADDR3_OFFSET, addr3);

    let mut fc = FrameControl::data(ds_mode);
    // The QoS decision is based on the final destination, not the receiver address.
    let mut hdr_len = add_qos_ctrl(params, &mut fc, eth.dst, hdr, HDR_LEN_3ADDR);
    if params.protect {
        fc.set_protected(true);
    }
    fc.write(hdr);

    let orig_l2_hdr_bytes = if eth.is_ethertype() {
        if params.sw_llc {
            hdr[hdr_len..hdr_len + LLC_SNAP_PREFIX_LEN]
                .copy_from_slice(&llc_snap_prefix(eth.ethertype));
            hdr[hdr_len + LLC_SNAP_PREFIX_LEN..hdr_len + LLC_SNAP_HDR_LEN]
                .copy_from_slice(&eth.ethertype.to_be_bytes());
            hdr_len += LLC_SNAP_HDR_LEN;
            ETH_HLEN
        } else {
            // The target inserts the SNAP prefix in front of the EtherType, so that stays.
            2 * ETH_ALEN
        }
    } else {
        // An 802.3 length field. The LLC header already follows it.
        ETH_HLEN
    };
    Ok(EncapOutput {
        hdr_len,
        orig_l2_hdr_bytes,
    })
}

/// State carried across the MSDUs of one MPDU.
#[derive(Clone, Debug)]
pub struct DecapState {
    hdr: [u8; MAX_HDR_LEN],
    hdr_len: usize,
    is_subfrm: bool,
    has_hdr: bool,
}
impl DecapState {
    pub const fn new() -> Self {
        Self {
            hdr: [0u8; MAX_HDR_LEN],
            hdr_len: 0,
            is_subfrm: false,
            has_hdr: false,
        }
    }
    /// Check if a header is cached for the MPDU in progress.
    pub fn has_cached_header(&self) -> bool {
        self.has_hdr
    }
    pub fn is_amsdu(&self) -> bool {
        self.is_subfrm
    }
    /// The 802.11 header of the MPDU in progress.
    pub fn cached_header(&self) -> &[u8] {
        &self.hdr[..self.hdr_len]
    }
    pub fn reset(&mut self) {
        *self = Self::new();
    }
    fn fc(&self) -> FrameControl {
        FrameControl::read(&self.hdr).unwrap_or_default()
    }
}
impl Default for DecapState {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of an MSDU within its MPDU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxMsduInfo {
    /// This MSDU carries the 802.11 header.
    pub first_msdu: bool,
    /// This is the last MSDU of the MPDU.
    pub completes_mpdu: bool,
}
impl RxMsduInfo {
    /// A frame, which isn't part of an aggregate.
    pub const SINGLE: Self = Self {
        first_msdu: true,
        completes_mpdu: true,
    };
}

/// Convert a received MSDU in place to `format`.
///
/// The state is reset once the last MSDU of the MPDU was processed, even if that failed.
pub fn decap(
    state: &mut DecapState,
    format: FrameFormat,
    buf: &mut NetBuf,
    info: RxMsduInfo,
) -> TxRxResult<()> {
    let res = decap_msdu(state, format, buf, info);
    if info.completes_mpdu || res.is_err() {
        state.reset();
    }
    res
}

fn decap_msdu(
    state: &mut DecapState,
    format: FrameFormat,
    buf: &mut NetBuf,
    info: RxMsduInfo,
) -> TxRxResult<()> {
    if format == FrameFormat::Raw {
        return Err(TxRxError::Unsupported);
    }
    if info.first_msdu {
        let fc = FrameControl::read(buf.data()).ok_or(TxRxError::DecapError)?;
        if !fc.is_data() {
            return Err(TxRxError::DecapError);
        }
        let hdr_len = data_header_len(fc);
        if buf.len() < hdr_len {
            return Err(TxRxError::DecapError);
        }
        state.hdr[..hdr_len].copy_from_slice(&buf.data()[..hdr_len]);
        state.hdr_len = hdr_len;
        state.has_hdr = true;
        let amsdu_present = fc.is_qos_data() && {
            let offset = qos_ctrl_offset(fc);
            QosControl::from_bits(u16::from_le_bytes([
                state.hdr[offset],
                state.hdr[offset + 1],
            ]))
            .amsdu_present()
        };
        state.is_subfrm = amsdu_present || !info.completes_mpdu;
        buf.pull_header(hdr_len)
            .map_err(|_| TxRxError::DecapError)?;
    } else if !state.has_hdr {
        debug!("MSDU without a cached MPDU header.");
        return Err(TxRxError::DecapError);
    }

    let subfrm_addrs = if state.is_subfrm {
        let subfrm = EthHeader::parse(buf.data()).ok_or(TxRxError::DecapError)?;
        buf.pull_header(AMSDU_SUBFRAME_HDR_LEN)
            .map_err(|_| TxRxError::DecapError)?;
        // Strip the padding to the next subframe.
        buf.trim(subfrm.ethertype as usize);
        Some((subfrm.dst, subfrm.src))
    } else {
        None
    };

    match format {
        FrameFormat::NativeWifi => decap_to_native_wifi(state, buf, subfrm_addrs),
        _ => decap_to_ethernet(state, buf, subfrm_addrs),
    }
}

/// DA and SA of a frame, as given by its 802.11 header.
fn mpdu_addrs(hdr: &[u8], ds_mode: DsMode) -> (MacAddr, MacAddr) {
    let (da, sa) = match ds_mode {
        DsMode::NoDs => (ADDR1_OFFSET, ADDR2_OFFSET),
        DsMode::ToDs => (ADDR3_OFFSET, ADDR2_OFFSET),
        DsMode::FromDs => (ADDR1_OFFSET, ADDR3_OFFSET),
        DsMode::DsToDs => (ADDR3_OFFSET, ADDR4_OFFSET),
    };
    (read_addr(hdr, da), read_addr(hdr, sa))
}

fn decap_to_ethernet(
    state: &DecapState,
    buf: &mut NetBuf,
    subfrm_addrs: Option<(MacAddr, MacAddr)>,
) -> TxRxResult<()> {
    let (da, sa) =
        subfrm_addrs.unwrap_or_else(|| mpdu_addrs(state.cached_header(), state.fc().ds_mode()));
    let data = buf.data();
    let strip_llc = data.len() >= LLC_SNAP_HDR_LEN && {
        let prefix = &data[..LLC_SNAP_PREFIX_LEN];
        let ethertype = u16::from_be_bytes([data[6], data[7]]);
        prefix == BRIDGE_TUNNEL_PREFIX
            || (prefix == RFC1042_PREFIX && !matches!(ethertype, ETHERTYPE_AARP | ETHERTYPE_IPX))
    };
    let ethertype = if strip_llc {
        // Keep the EtherType from the SNAP header.
        buf.pull_header(LLC_SNAP_PREFIX_LEN)
            .map_err(|_| TxRxError::DecapError)?;
        buf.push_header(2 * ETH_ALEN)
            .map_err(|_| TxRxError::DecapError)?;
        None
    } else {
        let len = u16::try_from(buf.len()).map_err(|_| TxRxError::DecapError)?;
        buf.push_header(ETH_HLEN)
            .map_err(|_| TxRxError::DecapError)?;
        Some(len)
    };
    let out = buf.data_mut().ok_or(TxRxError::DecapError)?;
    out[..ETH_ALEN].copy_from_slice(da.as_bytes());
    out[ETH_ALEN..2 * ETH_ALEN].copy_from_slice(sa.as_bytes());
    if let Some(len) = ethertype {
        out[2 * ETH_ALEN..ETH_HLEN].copy_from_slice(&len.to_be_bytes());
    }
    Ok(())
}

fn decap_to_native_wifi(
    state: &DecapState,
    buf: &mut NetBuf,
    subfrm_addrs: Option<(MacAddr, MacAddr)>,
) -> TxRxResult<()> {
    let mut fc = state.fc();
    let ds_mode = fc.ds_mode();
    let hdr_len = if ds_mode.has_addr4() {
        HDR_LEN_4ADDR
    } else {
        HDR_LEN_3ADDR
    };
    let mut hdr = [0u8; HDR_LEN_4ADDR];
    hdr[..hdr_len].copy_from_slice(&state.hdr[..hdr_len]);
    fc.set_subtype(fc.subtype() & !SUBTYPE_QOS_FLAG);
    fc.write(&mut hdr);
    if let Some((da, sa)) = subfrm_addrs {
        let (da_offset, sa_offset) = match ds_mode {
            DsMode::NoDs => (ADDR1_OFFSET, ADDR2_OFFSET),
            DsMode::ToDs => (ADDR3_OFFSET, ADDR2_OFFSET),
            DsMode::FromDs => (ADDR1_OFFSET, ADDR3_OFFSET),
            DsMode::DsToDs => (ADDR3_OFFSET, ADDR4_OFFSET),
        };
        write_addr(&mut hdr, da_offset, da);
        write_addr(&mut hdr, sa_offset, sa);
    }
    buf.push_header(hdr_len)
        .map_err(|_| TxRxError::DecapError)?;
    let out = buf.data_mut().ok_or(TxRxError::DecapError)?;
    out[..hdr_len].copy_from_slice(&hdr[..hdr_len]);
    Ok(())
}
