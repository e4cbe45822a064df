//! Tx descriptor preparation.
//!
//! This is where a frame meets a descriptor. The destination peer and TID are determined, the
//! frame is encapsulated for the target, the descriptor is filled in and handed to the transport.
//! TSO frames get one descriptor per segment.

use alloc::{collections::VecDeque, vec::Vec};
use core::iter;

use crate::{
    config::{FrameFormat, OpMode},
    encap::{self, EncapStrategy, TxEncapParams},
    error::{TxRejected, TxResult, TxRxError},
    ieee80211::{
        data_header_len, read_addr, DsMode, EthHeader, FrameControl, MacAddr, ADDR1_OFFSET,
        ADDR3_OFFSET, BRIDGE_TUNNEL_PREFIX, ETHERTYPE_IPV4, ETH_HLEN, LLC_SNAP_HDR_LEN,
        LLC_SNAP_PREFIX_LEN, MGMT_TID, RFC1042_PREFIX,
    },
    netbuf::{NetBuf, NetBufList, TxFrag},
    peer::PeerRef,
    stats::TxRxStats,
    tso,
    tx_desc::{TxCompletionStatus, TxDesc, TxDescHeader},
    vdev::Vdev,
    TxRxPdev, TxTransport,
};

/// What happened to a single frame.
pub(crate) enum SendOutcome {
    /// The transport took the frame.
    Sent,
    /// The frame was dropped and counted.
    Dropped,
    /// The frame wasn't accepted and is handed back.
    NotAccepted(TxRxError, NetBuf),
}

/// EtherType and offset of the L3 header of an outbound frame.
pub(crate) fn l3_protocol(format: FrameFormat, data: &[u8]) -> Option<(u16, usize)> {
    let llc_offset = match format {
        FrameFormat::Ethernet => {
            let eth = EthHeader::parse(data)?;
            if eth.is_ethertype() {
                return Some((eth.ethertype, ETH_HLEN));
            }
            ETH_HLEN
        }
        _ => data_header_len(FrameControl::read(data)?),
    };
    let llc = data.get(llc_offset..llc_offset + LLC_SNAP_HDR_LEN)?;
    let prefix = &llc[..LLC_SNAP_PREFIX_LEN];
    if prefix != RFC1042_PREFIX && prefix != BRIDGE_TUNNEL_PREFIX {
        return None;
    }
    Some((
        u16::from_be_bytes([llc[6], llc[7]]),
        llc_offset + LLC_SNAP_HDR_LEN,
    ))
}

/// The final destination of an outbound frame.
fn frame_dest(format: FrameFormat, data: &[u8]) -> Option<MacAddr> {
    match format {
        FrameFormat::Ethernet => EthHeader::parse(data).map(|eth| eth.dst),
        _ => {
            let fc = FrameControl::read(data)?;
            if data.len() < data_header_len(fc) {
                return None;
            }
            Some(match fc.ds_mode() {
                DsMode::ToDs | DsMode::DsToDs => read_addr(data, ADDR3_OFFSET),
                _ => read_addr(data, ADDR1_OFFSET),
            })
        }
    }
}

impl<T: TxTransport> TxRxPdev<T> {
    /// Send frames in order, until one isn't accepted.
    ///
    /// That frame and all following ones are handed back.
    pub(crate) fn send_list(&self, vdev: &Vdev, mut frames: NetBufList) -> TxResult {
        while let Some(frame) = frames.pop_front() {
            if let SendOutcome::NotAccepted(reason, frame) = self.send_frame(vdev, frame) {
                frames.push_front(frame);
                return Err(TxRejected::new(reason, frames));
            }
        }
        Ok(())
    }
    /// Check if the frame is part of a key exchange.
    pub(crate) fn is_key_exchange_frame(&self, buf: &NetBuf) -> bool {
        l3_protocol(self.config.frame_format, buf.data())
            .is_some_and(|(ethertype, _)| crate::ieee80211::is_key_exchange(ethertype))
    }
    /// Find the peer a frame is sent to.
    ///
    /// Group addressed frames of an AP or IBSS have no peer. A STA sends everything to its AP.
    fn classify_peer(&self, vdev: &Vdev, buf: &NetBuf) -> Result<Option<PeerRef>, TxRxError> {
        let dest = match vdev.opmode() {
            OpMode::Sta => vdev.bssid(),
            OpMode::Ap | OpMode::Ibss => {
                let dest = frame_dest(self.config.frame_format, buf.data())
                    .ok_or(TxRxError::NotFound)?;
                if dest.is_multicast() {
                    return Ok(None);
                }
                dest
            }
            _ => return Ok(None),
        };
        self.peers
            .find(&dest, Some(vdev.id()), true)
            .map(Some)
            .ok_or(TxRxError::NotFound)
    }
    /// The TID from the metadata, or the IP precedence of the frame.
    fn classify_tid(&self, buf: &NetBuf) -> u8 {
        if let Some(tid) = buf.meta.ext_tid {
            return tid.min(MGMT_TID);
        }
        match l3_protocol(self.config.frame_format, buf.data()) {
            Some((ETHERTYPE_IPV4, offset)) => buf
                .data()
                .get(offset + 1)
                .map(|tos| tos >> 5)
                .unwrap_or(0),
            _ => 0,
        }
    }
    pub(crate) fn alloc_desc(&self) -> Option<TxDesc> {
        let desc = self.desc_pool.alloc();
        match desc {
            Some(_) if self.desc_pool.available() < self.pool_thresholds.stop => {
                self.stop_os_queues()
            }
            None => debug!("Tx descriptor pool exhausted."),
            _ => {}
        }
        desc
    }
    /// Send a single frame, which may be split into TSO segments.
    pub(crate) fn send_frame(&self, vdev: &Vdev, buf: NetBuf) -> SendOutcome {
        let peer = match self.classify_peer(vdev, &buf) {
            Ok(peer) => peer,
            Err(_) => {
                TxRxStats::inc(&self.stats.dropped_no_peer);
                debug!("No peer for frame on vdev {}, dropping it.", vdev.id());
                return SendOutcome::Dropped;
            }
        };
        let tid = self.classify_tid(&buf);
        if peer.as_ref().is_some_and(|peer| peer.tid(tid).is_paused()) {
            return SendOutcome::NotAccepted(TxRxError::Rejected, buf);
        }
        match buf.meta.tso_mss {
            Some(mss) => self.send_tso(vdev, buf, mss, peer, tid),
            None => self.send_single(vdev, buf, peer, tid),
        }
    }
    fn send_single(
        &self,
        vdev: &Vdev,
        mut buf: NetBuf,
        peer: Option<PeerRef>,
        tid: u8,
    ) -> SendOutcome {
        let Some(mut desc) = self.alloc_desc() else {
            TxRxStats::inc(&self.stats.dropped_host_reject);
            return SendOutcome::NotAccepted(TxRxError::PoolExhausted, buf);
        };
        let params = TxEncapParams {
            opmode: vdev.opmode(),
            vdev_mac: vdev.mac(),
            bssid: vdev.bssid(),
            peer_mac: peer.as_ref().map(|peer| peer.mac()),
            peer_qos_capable: peer.as_ref().is_some_and(|peer| peer.is_qos_capable()),
            tid,
            sw_llc: self.config.sw_tx_llc_proc,
            protect: self.config.sw_pf_proc && buf.meta.do_encrypt && !buf.meta.no_encrypt,
        };
        let scratch = desc.mpdu_header_scratch();
        let out = match encap::encap(self.strategy, &params, &mut buf, scratch) {
            Ok(out) => out,
            Err(err) => {
                TxRxStats::inc(&self.stats.dropped_encap_error);
                debug!("Dropping frame on vdev {}: {:?}", vdev.id(), err);
                return SendOutcome::Dropped;
            }
        };
        desc.set_mpdu_header_len(out.hdr_len);
        desc.orig_l2_hdr_bytes = out.orig_l2_hdr_bytes;

        let extra_frags = buf
            .meta
            .extra_frags
            .iter()
            .copied()
            .take(self.config.max_extra_frags);
        let first_frag = TxFrag {
            paddr: buf.paddr(),
            len: buf.len() as u32,
        };
        desc.set_frags(iter::once(first_frag).chain(extra_frags));
        let pkt_len = out.hdr_len
            + desc
                .frags()
                .iter()
                .map(|frag| frag.len as usize)
                .sum::<usize>();
        desc.header = TxDescHeader::new()
            .with_pkt_len(pkt_len.min(u16::MAX as usize) as u16)
            .with_ext_tid(tid)
            .with_cksum_offload(buf.meta.cksum_offload)
            .with_no_encrypt(buf.meta.no_encrypt)
            .with_num_frags(desc.header.num_frags());
        desc.download_len = self
            .config
            .download_len
            .min(self.config.tx_desc_hdr_len + out.hdr_len + buf.len());
        desc.vdev_id = vdev.id();
        desc.tid = tid;
        desc.peer = peer.clone();
        desc.buf = Some(buf);

        let download_len = desc.download_len;
        match self
            .transport
            .submit(desc, self.config.endpoint_id, download_len)
        {
            Ok(()) => {
                self.on_submitted(peer.as_ref(), tid, pkt_len);
                SendOutcome::Sent
            }
            Err(mut desc) => {
                TxRxStats::inc(&self.stats.dropped_download_fail);
                debug!("Transport rejected frame on vdev {}.", vdev.id());
                let orig_l2_hdr_bytes = desc.orig_l2_hdr_bytes;
                match desc.take_buf() {
                    Some(mut buf) => {
                        encap::restore(&mut buf, orig_l2_hdr_bytes);
                        SendOutcome::NotAccepted(TxRxError::Rejected, buf)
                    }
                    None => SendOutcome::Dropped,
                }
            }
        }
    }
    /// Send a TSO frame segment by segment.
    ///
    /// Descriptors for all segments are taken up front, so running out of them never leaves a
    /// frame partially sent. The first segment owns the buffer, every other segment holds a clone
    /// of it.
    fn send_tso(
        &self,
        vdev: &Vdev,
        buf: NetBuf,
        mss: u16,
        peer: Option<PeerRef>,
        tid: u8,
    ) -> SendOutcome {
        if self.strategy != EncapStrategy::Passthrough {
            TxRxStats::inc(&self.stats.dropped_encap_error);
            debug!("TSO requires the target to do the encapsulation.");
            return SendOutcome::Dropped;
        }
        let segs = match tso::segment(&buf, mss, &self.tso_pool) {
            Ok(segs) => segs,
            Err(TxRxError::PoolExhausted) => {
                TxRxStats::inc(&self.stats.dropped_host_reject);
                debug!("TSO segment pool exhausted.");
                return SendOutcome::NotAccepted(TxRxError::PoolExhausted, buf);
            }
            Err(err) => {
                TxRxStats::inc(&self.stats.dropped_encap_error);
                debug!("Dropping TSO frame on vdev {}: {:?}", vdev.id(), err);
                return SendOutcome::Dropped;
            }
        };
        let mut descs = Vec::new();
        if descs.try_reserve_exact(segs.len()).is_err() {
            TxRxStats::inc(&self.stats.dropped_host_reject);
            return SendOutcome::NotAccepted(TxRxError::OutOfMemory, buf);
        }
        for _ in 0..segs.len() {
            let Some(desc) = self.alloc_desc() else {
                TxRxStats::inc(&self.stats.dropped_host_reject);
                return SendOutcome::NotAccepted(TxRxError::PoolExhausted, buf);
            };
            descs.push(desc);
        }

        let num_segs = segs.len();
        let mut pending = VecDeque::new();
        let mut owner = Some(buf);
        for (i, (mut desc, seg)) in descs.into_iter().zip(segs).enumerate() {
            let seg_buf = if i + 1 == num_segs {
                owner.take()
            } else {
                owner.clone()
            };
            let Some(seg_buf) = seg_buf else {
                break;
            };
            let [hdr_frag, payload_frag] = seg.frags(&seg_buf);
            desc.set_frags([hdr_frag, payload_frag]);
            let pkt_len = hdr_frag.len as usize + payload_frag.len as usize;
            desc.header = TxDescHeader::new()
                .with_pkt_len(pkt_len.min(u16::MAX as usize) as u16)
                .with_ext_tid(tid)
                .with_cksum_offload(seg_buf.meta.cksum_offload)
                .with_no_encrypt(seg_buf.meta.no_encrypt)
                .with_is_tso(true)
                .with_num_frags(2);
            desc.download_len = self
                .config
                .download_len
                .min(self.config.tx_desc_hdr_len + hdr_frag.len as usize);
            desc.vdev_id = vdev.id();
            desc.tid = tid;
            desc.peer = peer.clone();
            desc.tso_seg = Some(seg);
            desc.buf = Some(seg_buf);
            pending.push_back((desc, pkt_len));
        }

        while let Some((mut desc, pkt_len)) = pending.pop_front() {
            if let Some(seg) = desc.tso_seg.as_mut() {
                seg.mark_sent_to_target();
            }
            let download_len = desc.download_len;
            match self
                .transport
                .submit(desc, self.config.endpoint_id, download_len)
            {
                Ok(()) => self.on_submitted(peer.as_ref(), tid, pkt_len),
                Err(mut desc) => {
                    let seg_num = desc.tso_seg().map(|seg| seg.seg_num()).unwrap_or(0);
                    let frame = desc.take_buf();
                    // Segments not yet submitted go back to their pools, along with their
                    // references to the buffer.
                    drop(desc);
                    drop(pending);
                    TxRxStats::inc(&self.stats.dropped_download_fail);
                    self.stats
                        .record_completion(TxCompletionStatus::PktError, 1);
                    debug!(
                        "Transport rejected TSO segment {} of {} on vdev {}.",
                        seg_num,
                        num_segs,
                        vdev.id()
                    );
                    return match frame {
                        Some(frame) => SendOutcome::NotAccepted(TxRxError::Rejected, frame),
                        None => SendOutcome::Dropped,
                    };
                }
            }
        }
        SendOutcome::Sent
    }
    fn on_submitted(&self, peer: Option<&PeerRef>, tid: u8, len: usize) {
        if let Some(peer) = peer {
            peer.tid(tid).on_submit();
        }
        TxRxStats::inc(&self.stats.tx_frames);
        TxRxStats::add(&self.stats.tx_bytes, len);
    }
}
