//! The physical device context.
//!
//! A [TxRxPdev] is created once per device and owns everything shared between its vdevs. Vdevs
//! are attached with [TxRxPdev::vdev_attach] and detached with [TxRxPdev::vdev_detach], which
//! stops the drain timer, flushes the pause queue and drops the peers of the vdev.
//!
//! Frames enter through [TxRxPdev::tx]. They're sent right away, unless the vdev is paused or
//! already has a backlog, in which case they're queued. Queues are drained on unpause and by the
//! drain timer, see [TxRxPdev::drain_tick] and [TxRxPdev::run_drain_timer].
//! [TxRxPdev::send_direct] skips the queue entirely.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    config::{OpMode, PdevConfig, VdevConfig},
    encap::{self, DecapState, EncapStrategy, RxMsduInfo},
    error::{TxRejected, TxResult, TxRxError, TxRxResult},
    fastpath::SendOutcome,
    flow_control::{FlowControlCallback, PauseReason, PoolThresholds},
    ieee80211::MacAddr,
    netbuf::{NetBuf, NetBufList},
    peer::{PeerHandle, PeerTable},
    stats::{TxRxStats, TxRxStatsSnapshot},
    throttle::{Throttle, ThrottlePhase},
    tso::TsoSegPool,
    tx_desc::{TxCompletionStatus, TxDesc, TxDescPool},
    vdev::Vdev,
    DefaultRawMutex,
};

/// The lower layer moving descriptors to the target.
///
/// Implementations must not block. Completions are reported back through
/// [TxRxPdev::tx_completion], once the target is done with a descriptor.
pub trait TxTransport {
    /// Hand a descriptor to the target.
    ///
    /// `download_len` bytes of the frame should be copied right away, the rest may be fetched by
    /// the target later. If the descriptor isn't accepted, it has to be handed back untouched.
    fn submit(&self, desc: TxDesc, endpoint: u8, download_len: usize) -> Result<(), TxDesc>;
}

/// What happened to a frame, that wasn't a key exchange frame, on [TxRxPdev::tx].
enum Admission {
    Send(NetBuf),
    Queued { active: bool },
    Full(NetBuf),
}

/// The data path context of one physical device.
pub struct TxRxPdev<T: TxTransport> {
    pub(crate) config: PdevConfig,
    pub(crate) transport: T,
    pub(crate) strategy: EncapStrategy,
    pub(crate) peers: PeerTable,
    pub(crate) desc_pool: TxDescPool,
    pub(crate) tso_pool: TsoSegPool,
    pub(crate) pool_thresholds: PoolThresholds,
    pool_paused: AtomicBool,
    os_paused_vdevs: AtomicUsize,
    vdevs: blocking_mutex::Mutex<DefaultRawMutex, RefCell<BTreeMap<u8, Arc<Vdev>>>>,
    throttle: Throttle,
    pub(crate) stats: TxRxStats,
}
impl<T: TxTransport> TxRxPdev<T> {
    /// Attach a device.
    ///
    /// This allocates the peer table and all pools, which is the only thing that can fail here.
    pub fn new(config: PdevConfig, transport: T) -> TxRxResult<Self> {
        let peers = PeerTable::new(config.max_peers, config.max_peer_id)?;
        let desc_pool = TxDescPool::new(config.tx_desc_pool_size)?;
        let tso_pool = TsoSegPool::new(config.tso_seg_pool_size)?;
        let pool_thresholds = PoolThresholds::new(
            config.tx_desc_pool_size,
            config.tx_flow.stop_threshold_pct,
            config.tx_flow.start_offset_pct,
        );
        let strategy = EncapStrategy::from_config(&config);
        info!(
            "Pdev attached with {} tx descriptors, encapsulation: {:?}",
            config.tx_desc_pool_size,
            strategy
        );
        Ok(Self {
            throttle: Throttle::new(config.throttle),
            config,
            transport,
            strategy,
            peers,
            desc_pool,
            tso_pool,
            pool_thresholds,
            pool_paused: AtomicBool::new(false),
            os_paused_vdevs: AtomicUsize::new(0),
            vdevs: blocking_mutex::Mutex::new(RefCell::new(BTreeMap::new())),
            stats: TxRxStats::default(),
        })
    }
    pub fn config(&self) -> &PdevConfig {
        &self.config
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }
    /// Number of tx descriptors currently free.
    pub fn free_descs(&self) -> usize {
        self.desc_pool.available()
    }

    // Vdevs
    pub fn vdev_attach(&self, vdev_id: u8, config: VdevConfig) -> TxRxResult<Arc<Vdev>> {
        let vdev = self.vdevs.lock(|vdevs| {
            let mut vdevs = vdevs.borrow_mut();
            if vdevs.contains_key(&vdev_id) {
                return Err(TxRxError::VdevExists);
            }
            let vdev = Arc::new(Vdev::new(vdev_id, config));
            vdevs.insert(vdev_id, vdev.clone());
            Ok(vdev)
        })?;
        info!("Vdev {} attached with address {}.", vdev_id, config.mac);
        Ok(vdev)
    }
    /// Tear a vdev down.
    ///
    /// The drain timer is stopped, all queued frames are dropped and the attach references of
    /// all its peers are released.
    pub fn vdev_detach(&self, vdev_id: u8) -> TxRxResult<()> {
        let vdev = self
            .vdevs
            .lock(|vdevs| vdevs.borrow_mut().remove(&vdev_id))
            .ok_or(TxRxError::InvalidVdev)?;
        vdev.set_detaching();
        vdev.drain_timer.cancel_sync();
        self.flush_vdev(&vdev);
        if vdev.set_flow_control_callback(None) {
            self.os_paused_vdevs.fetch_sub(1, Ordering::AcqRel);
        }
        for handle in self.peers.handles(Some(vdev_id)) {
            match self.peers.detach(handle) {
                // Detached already, only waiting for its last reference.
                Ok(()) | Err(TxRxError::NotFound) => {}
                Err(err) => warn!("Failed to detach a peer of vdev {}: {}", vdev_id, err),
            }
        }
        info!("Vdev {} detached.", vdev_id);
        Ok(())
    }
    pub fn vdev(&self, vdev_id: u8) -> Option<Arc<Vdev>> {
        self.vdevs
            .lock(|vdevs| vdevs.borrow().get(&vdev_id).cloned())
    }
    fn vdevs(&self) -> Vec<Arc<Vdev>> {
        self.vdevs
            .lock(|vdevs| vdevs.borrow().values().cloned().collect())
    }
    fn require_vdev(&self, vdev_id: u8) -> TxRxResult<Arc<Vdev>> {
        self.vdev(vdev_id).ok_or(TxRxError::InvalidVdev)
    }

    // Peers
    /// Create a peer on a vdev.
    ///
    /// The peer can only be found by the data path, once it's marked valid.
    pub fn peer_attach(
        &self,
        vdev_id: u8,
        mac: MacAddr,
        qos_capable: bool,
    ) -> TxRxResult<PeerHandle> {
        self.require_vdev(vdev_id)?;
        let peer = self.peers.attach(vdev_id, mac, qos_capable)?;
        Ok(peer.handle())
    }
    pub fn peer_set_valid(&self, handle: PeerHandle, valid: bool) -> TxRxResult<()> {
        let peer = self.peers.get(handle).ok_or(TxRxError::NotFound)?;
        peer.set_valid(valid);
        Ok(())
    }
    /// Record the outcome of the key exchange with a peer.
    ///
    /// On a STA, this also pauses or unpauses the vdev, since all of its traffic goes to that
    /// one peer.
    pub fn peer_authorize(&self, handle: PeerHandle, authorized: bool) -> TxRxResult<()> {
        let peer = self.peers.get(handle).ok_or(TxRxError::NotFound)?;
        peer.set_authorized(authorized);
        let vdev_id = peer.vdev_id();
        drop(peer);
        let vdev = self.require_vdev(vdev_id)?;
        if vdev.opmode() != OpMode::Sta {
            return Ok(());
        }
        if authorized {
            self.unpause(vdev_id, PauseReason::PEER_UNAUTHORIZED)
        } else {
            self.pause(vdev_id, PauseReason::PEER_UNAUTHORIZED)
        }
    }
    /// Release the attach reference of a peer.
    pub fn peer_detach(&self, handle: PeerHandle) -> TxRxResult<()> {
        self.peers.detach(handle)
    }
    /// Handle a peer map event from the firmware.
    ///
    /// The first ID mapped to a peer makes it valid. Events for addresses without a peer are
    /// expected for vdev level IDs and yield [TxRxError::NotFound].
    pub fn peer_map_event(&self, mac: MacAddr, peer_id: u16) -> TxRxResult<bool> {
        let newly_attached = match self.peers.add_id(&mac, peer_id) {
            Err(TxRxError::NotFound) => {
                debug!("Peer map event for unknown address {}.", mac);
                return Err(TxRxError::NotFound);
            }
            res => res?,
        };
        if newly_attached {
            if let Some(peer) = self.peers.id_to_peer(peer_id) {
                peer.set_valid(true);
            }
            debug!("Peer ID {} mapped to {}.", peer_id, mac);
        }
        Ok(newly_attached)
    }
    /// Handle a peer unmap event from the firmware.
    ///
    /// Returns `true`, if the ID was detached from its peer.
    pub fn peer_unmap_event(&self, peer_id: u16) -> TxRxResult<bool> {
        self.peers.id_unmap(peer_id)
    }

    // Tx
    /// Send frames on a vdev.
    ///
    /// Frames go through the pause queue of the vdev, unless it's active and empty. Key exchange
    /// frames are always sent right away. Frames, which were neither sent nor queued, are handed
    /// back in order.
    pub fn tx(&self, vdev_id: u8, mut frames: NetBufList) -> TxResult {
        let Some(vdev) = self.vdev(vdev_id) else {
            return Err(TxRejected::new(TxRxError::InvalidVdev, frames));
        };
        let mut refused = NetBufList::new();
        let mut drain_needed = false;
        while let Some(frame) = frames.pop_front() {
            let admission = if self.is_key_exchange_frame(&frame) {
                Admission::Send(frame)
            } else {
                let throttled = self.throttle.is_tx_blocked();
                vdev.queue.lock(|queue| {
                    let mut queue = queue.borrow_mut();
                    if !queue.must_queue() && !throttled {
                        return Admission::Send(frame);
                    }
                    match queue.enqueue(frame) {
                        Ok(()) => Admission::Queued {
                            active: !queue.is_paused(),
                        },
                        Err(frame) => Admission::Full(frame),
                    }
                })
            };
            match admission {
                Admission::Send(frame) => {
                    if let SendOutcome::NotAccepted(reason, frame) = self.send_frame(&vdev, frame)
                    {
                        refused.push_back(frame);
                        refused.append(&mut frames);
                        return Err(TxRejected::new(reason, refused));
                    }
                }
                Admission::Queued { active } => drain_needed |= active,
                Admission::Full(frame) => {
                    TxRxStats::inc(&self.stats.dropped_queue_full);
                    TxRxStats::inc(&self.stats.queue_overflows);
                    warn!("Pause queue of vdev {} is full.", vdev_id);
                    refused.push_back(frame);
                }
            }
        }
        // Frames queued only to stay behind a backlog.
        if drain_needed {
            self.drain_vdev(&vdev, None);
        }
        if refused.is_empty() {
            Ok(())
        } else {
            Err(TxRejected::new(TxRxError::QueueFull, refused))
        }
    }
    /// Send frames straight through the fast path, bypassing the pause queue.
    ///
    /// Sending stops at the first frame, that isn't accepted. That frame and all following ones
    /// are handed back.
    pub fn send_direct(&self, vdev_id: u8, frames: NetBufList) -> TxResult {
        let Some(vdev) = self.vdev(vdev_id) else {
            return Err(TxRejected::new(TxRxError::InvalidVdev, frames));
        };
        self.send_list(&vdev, frames)
    }
    /// Handle the completion of a descriptor.
    ///
    /// This returns the descriptor and its TSO segment to their pools and drops the references to
    /// the frame and the peer. OS queues are resumed, if enough descriptors are free again.
    pub fn tx_completion(&self, desc: TxDesc, status: TxCompletionStatus) {
        if let Some(peer) = desc.peer() {
            peer.tid(desc.tid()).on_completion();
        }
        self.stats.record_completion(status, 1);
        drop(desc);
        self.resume_os_queues();
    }

    // Pause queues
    pub fn pause(&self, vdev_id: u8, reason: PauseReason) -> TxRxResult<()> {
        let vdev = self.require_vdev(vdev_id)?;
        vdev.queue.lock(|queue| queue.borrow_mut().pause(reason));
        TxRxStats::inc(&self.stats.pause_events);
        debug!("Vdev {} paused, reason: {:#x}", vdev_id, reason.bits());
        Ok(())
    }
    /// Clear a pause reason and drain the queue, if the vdev became active.
    pub fn unpause(&self, vdev_id: u8, reason: PauseReason) -> TxRxResult<()> {
        let vdev = self.require_vdev(vdev_id)?;
        let active = vdev.queue.lock(|queue| queue.borrow_mut().unpause(reason));
        if active {
            debug!("Vdev {} unpaused.", vdev_id);
            self.drain_vdev(&vdev, None);
        }
        Ok(())
    }
    /// Drop all frames in the pause queue of a vdev.
    ///
    /// A pending drain is cancelled first. The drain timer stays usable, so the vdev keeps working
    /// afterwards. Returns the number of frames dropped.
    pub fn flush(&self, vdev_id: u8) -> TxRxResult<usize> {
        let vdev = self.require_vdev(vdev_id)?;
        vdev.drain_timer.disarm();
        Ok(self.flush_vdev(&vdev))
    }
    /// The drain timer has to be stopped by the caller.
    fn flush_vdev(&self, vdev: &Vdev) -> usize {
        let frames = vdev.queue.lock(|queue| queue.borrow_mut().take_all());
        let flushed = frames.len();
        drop(frames);
        TxRxStats::add(&self.stats.flushed, flushed);
        self.stats
            .record_completion(TxCompletionStatus::PktError, flushed);
        info!("Flushed {} frames from vdev {}.", flushed, vdev.id());
        flushed
    }
    /// Send queued frames of a vdev.
    ///
    /// At most `budget` frames are sent, and a margin of descriptors is always left for other
    /// vdevs. If frames remain, the drain timer is armed. Returns the number of frames sent.
    pub(crate) fn drain_vdev(&self, vdev: &Vdev, budget: Option<usize>) -> usize {
        if self.throttle.is_tx_blocked() {
            return 0;
        }
        if !vdev.queue.lock(|queue| queue.borrow_mut().begin_drain()) {
            return 0;
        }
        let mut max_to_send = self
            .desc_pool
            .available()
            .saturating_sub(self.config.pause_queue_send_margin);
        if let Some(budget) = budget {
            max_to_send = max_to_send.min(budget);
        }
        let mut sent = 0;
        while sent < max_to_send {
            let Some(frame) = vdev.queue.lock(|queue| queue.borrow_mut().pop_for_send()) else {
                break;
            };
            match self.send_frame(vdev, frame) {
                SendOutcome::Sent => {
                    sent += 1;
                    vdev.queue.lock(|queue| queue.borrow_mut().release_held());
                }
                SendOutcome::Dropped => {
                    vdev.queue.lock(|queue| queue.borrow_mut().release_held());
                }
                SendOutcome::NotAccepted(_, frame) => {
                    vdev.queue
                        .lock(|queue| queue.borrow_mut().requeue_front(frame));
                    break;
                }
            }
        }
        let backlog = vdev.queue.lock(|queue| queue.borrow_mut().end_drain());
        if backlog && !vdev.is_detaching() {
            vdev.drain_timer.arm();
        }
        if sent != 0 {
            trace!("Drained {} frames from vdev {}.", sent, vdev.id());
        }
        sent
    }
    /// Run a pending drain of a vdev.
    ///
    /// This is what the drain timer does on expiry. Returns [None], if no drain was pending.
    pub fn drain_tick(&self, vdev_id: u8) -> Option<usize> {
        let vdev = self.vdev(vdev_id)?;
        vdev.drain_timer.fire(|| self.drain_vdev(&vdev, None))
    }
    /// The task body of the drain timer of a vdev.
    ///
    /// This returns, once the vdev is detached.
    pub async fn run_drain_timer(&self, vdev_id: u8) {
        let Some(vdev) = self.vdev(vdev_id) else {
            return;
        };
        vdev.drain_timer
            .run(self.config.pause_queue_send_period, || {
                self.drain_vdev(&vdev, None);
            })
            .await;
    }

    // Throttling
    /// Set the throttle level, with zero disabling throttling.
    pub fn set_throttle_level(&self, level: u8) -> TxRxResult<()> {
        if self.throttle.set_level(level)? {
            self.drain_all(self.throttle.tx_threshold());
        }
        Ok(())
    }
    pub fn throttle_level(&self) -> u8 {
        self.throttle.level()
    }
    pub fn throttle_phase(&self) -> ThrottlePhase {
        self.throttle.phase()
    }
    fn on_throttle_phase_end(&self) -> ThrottlePhase {
        let phase = self.throttle.toggle_phase();
        if phase == ThrottlePhase::On {
            self.drain_all(self.throttle.tx_threshold());
        }
        phase
    }
    /// End the current throttle phase, if the phase timer is armed.
    pub fn throttle_tick(&self) -> Option<ThrottlePhase> {
        self.throttle.timer.fire(|| self.on_throttle_phase_end())
    }
    /// The task body of the throttle phase timer.
    pub async fn run_throttle_timer(&self) {
        self.throttle
            .timer
            .run_with(
                || self.throttle.phase_duration(),
                || {
                    self.on_throttle_phase_end();
                },
            )
            .await;
    }
    /// Round robin over all vdevs, sending one queued frame from each per round.
    fn drain_all(&self, mut budget: usize) -> usize {
        let vdevs = self.vdevs();
        let mut sent = 0;
        while budget > 0 {
            let mut progress = false;
            for vdev in vdevs.iter() {
                if budget == 0 {
                    break;
                }
                if self.drain_vdev(vdev, Some(1)) != 0 {
                    budget -= 1;
                    sent += 1;
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        sent
    }

    // OS flow control
    pub fn register_flow_control(
        &self,
        vdev_id: u8,
        callback: FlowControlCallback,
    ) -> TxRxResult<()> {
        let vdev = self.require_vdev(vdev_id)?;
        if vdev.set_flow_control_callback(Some(callback)) {
            self.os_paused_vdevs.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
    pub fn deregister_flow_control(&self, vdev_id: u8) -> TxRxResult<()> {
        let vdev = self.require_vdev(vdev_id)?;
        if vdev.set_flow_control_callback(None) {
            self.os_paused_vdevs.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }
    /// Check if enough descriptors are free for the OS to keep sending on a vdev.
    ///
    /// If fewer than `low_watermark` are free, the OS queue of the vdev is stopped, and resumed
    /// from the completion path once more than `low_watermark + high_watermark_offset` are free.
    pub fn get_tx_resource(
        &self,
        vdev_id: u8,
        low_watermark: usize,
        high_watermark_offset: usize,
    ) -> TxRxResult<bool> {
        let vdev = self.require_vdev(vdev_id)?;
        let free = self.desc_pool.available();
        let (available, newly_stopped) = vdev.os_flow.lock(|flow| {
            flow.borrow_mut()
                .check_stop(free, low_watermark, high_watermark_offset)
        });
        if newly_stopped {
            self.os_paused_vdevs.fetch_add(1, Ordering::AcqRel);
            debug!("Stopping OS queue of vdev {}, {} descriptors free.", vdev_id, free);
            vdev.resume_signal().reset();
            if let Some(callback) = vdev.flow_control_callback() {
                callback(false);
            }
        }
        Ok(available)
    }
    /// Stop the OS queues of all vdevs, because the descriptor pool runs low.
    pub(crate) fn stop_os_queues(&self) {
        if self.pool_paused.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            "Fewer than {} tx descriptors free, stopping all OS queues.",
            self.pool_thresholds.stop
        );
        for vdev in self.vdevs() {
            vdev.resume_signal().reset();
            if let Some(callback) = vdev.flow_control_callback() {
                callback(false);
            }
        }
    }
    fn resume_os_queues(&self) {
        let free = self.desc_pool.available();
        let pool_resumed = self.pool_paused.load(Ordering::Acquire)
            && free >= self.pool_thresholds.start
            && self.pool_paused.swap(false, Ordering::AcqRel);
        if !pool_resumed && self.os_paused_vdevs.load(Ordering::Acquire) == 0 {
            return;
        }
        for vdev in self.vdevs() {
            let resumed = vdev.os_flow.lock(|flow| flow.borrow_mut().check_resume(free));
            if resumed {
                self.os_paused_vdevs.fetch_sub(1, Ordering::AcqRel);
            }
            if !(resumed || pool_resumed) {
                continue;
            }
            debug!("Resuming OS queue of vdev {}.", vdev.id());
            if let Some(callback) = vdev.flow_control_callback() {
                callback(true);
            }
            vdev.resume_signal().signal();
        }
    }

    // Rx
    /// Convert a received MSDU to the configured rx frame format.
    pub fn rx_decap(
        &self,
        state: &mut DecapState,
        buf: &mut NetBuf,
        info: RxMsduInfo,
    ) -> TxRxResult<()> {
        encap::decap(state, self.config.rx_frame_format, buf, info).inspect_err(|_| {
            TxRxStats::inc(&self.stats.rx_decap_error);
        })
    }

    pub fn stats(&self) -> TxRxStatsSnapshot {
        TxRxStatsSnapshot {
            peers_created: self.peers.peers_created(),
            peers_destroyed: self.peers.peers_destroyed(),
            peer_id_overflows: self.peers.id_overflows(),
            ..self.stats.snapshot()
        }
    }
}
impl<T: TxTransport> Drop for TxRxPdev<T> {
    fn drop(&mut self) {
        self.throttle.timer.cancel_sync();
        for vdev in self.vdevs() {
            vdev.set_detaching();
            vdev.drain_timer.cancel_sync();
        }
        self.peers.erase_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex as StdMutex, vec::Vec};

    use embassy_futures::{
        block_on,
        select::{select, Either},
    };
    use embassy_time::{Duration, Timer};

    use super::*;
    use crate::{
        ieee80211::{DsMode, ETHERTYPE_IPV4, EthHeader},
        test_utils::{
            amsdu_subframe, eapol_frame, ip_frame, mpdu_header, MockTransport, BSSID, STA_A,
            STA_B, VDEV_MAC,
        },
    };

    const VDEV_A: u8 = 0;
    const VDEV_B: u8 = 1;
    const BSSID_B: MacAddr = MacAddr::new([0x02, 0x00, 0x00, 0x00, 0x00, 0xbb]);

    fn pdev_with(config: PdevConfig) -> TxRxPdev<MockTransport> {
        TxRxPdev::new(config, MockTransport::new()).unwrap()
    }
    /// Attach a STA vdev with a valid BSS peer.
    fn attach_sta(pdev: &TxRxPdev<MockTransport>, vdev_id: u8, bssid: MacAddr, depth: usize) {
        pdev.vdev_attach(
            vdev_id,
            VdevConfig::new(VDEV_MAC, OpMode::Sta, bssid).with_max_q_depth(depth),
        )
        .unwrap();
        let bss = pdev.peer_attach(vdev_id, bssid, false).unwrap();
        pdev.peer_set_valid(bss, true).unwrap();
    }
    fn frames(tags: core::ops::Range<u8>) -> NetBufList {
        tags.map(|tag| ip_frame(STA_B, STA_A, tag)).collect()
    }
    fn tags(pdev: &TxRxPdev<MockTransport>) -> Vec<u8> {
        pdev.transport()
            .frames()
            .iter()
            .map(|frame| frame[frame.len() - 1])
            .collect()
    }

    #[test]
    fn key_exchange_bypasses_pause() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        attach_sta(&pdev, VDEV_B, BSSID_B, 400);
        pdev.pause(VDEV_B, PauseReason::PEER_UNAUTHORIZED).unwrap();

        let batch = [eapol_frame(BSSID_B, STA_A), ip_frame(BSSID_B, STA_A, 1)]
            .into_iter()
            .collect();
        pdev.tx(VDEV_B, batch).unwrap();
        let sent = pdev.transport().frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            EthHeader::parse(&sent[0]).unwrap().ethertype,
            crate::ieee80211::ETHERTYPE_EAPOL
        );
        let vdev_b = pdev.vdev(VDEV_B).unwrap();
        assert_eq!(vdev_b.queue_depth(), 1);

        // The other vdev isn't affected.
        pdev.tx(VDEV_A, frames(2..3)).unwrap();
        assert_eq!(pdev.transport().accepted(), 2);
        assert_eq!(pdev.vdev(VDEV_A).unwrap().queue_depth(), 0);
    }
    #[test]
    fn overflow_is_reported_and_flushed_once() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 10);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();

        let rejected = pdev.tx(VDEV_A, frames(0..15)).unwrap_err();
        assert_eq!(rejected.reason, TxRxError::QueueFull);
        let refused: Vec<u8> = rejected
            .frames
            .iter()
            .map(|frame| frame.data()[frame.len() - 1])
            .collect();
        assert_eq!(refused, [10, 11, 12, 13, 14]);
        let vdev = pdev.vdev(VDEV_A).unwrap();
        assert_eq!(vdev.queue_depth(), 10);
        assert_eq!(vdev.q_overflow_cnt(), 5);
        assert_eq!(pdev.stats().dropped_queue_full, 5);

        assert_eq!(pdev.flush(VDEV_A).unwrap(), 10);
        assert_eq!(pdev.flush(VDEV_A).unwrap(), 0);
        let stats = pdev.stats();
        assert_eq!(stats.flushed, 10);
        assert_eq!(stats.comp_pkt_error, 10);
        assert_eq!(pdev.transport().attempts(), 0);
    }

    #[test]
    fn unpause_drains_in_order() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.pause(VDEV_A, PauseReason::THERMAL_MITIGATION).unwrap();
        pdev.tx(VDEV_A, frames(0..5)).unwrap();
        pdev.tx(VDEV_A, frames(5..8)).unwrap();

        pdev.unpause(VDEV_A, PauseReason::FW).unwrap();
        assert_eq!(pdev.transport().attempts(), 0);
        pdev.unpause(VDEV_A, PauseReason::THERMAL_MITIGATION).unwrap();
        assert_eq!(tags(&pdev), [0, 1, 2, 3, 4, 5, 6, 7]);
        let vdev = pdev.vdev(VDEV_A).unwrap();
        assert_eq!(vdev.queue_depth(), 0);
        assert!(!vdev.drain_timer.is_armed());

        // Draining an empty queue does nothing.
        assert_eq!(pdev.drain_vdev(&vdev, None), 0);
        assert_eq!(pdev.stats().pause_events, 2);
    }

    #[test]
    fn backlog_keeps_order_and_arms_timer() {
        let config = PdevConfig {
            tx_desc_pool_size: 14,
            ..Default::default()
        };
        let pdev = pdev_with(config);
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.tx(VDEV_A, frames(0..6)).unwrap();

        // Only four descriptors may be used, the rest is the margin.
        pdev.unpause(VDEV_A, PauseReason::FW).unwrap();
        assert_eq!(tags(&pdev), [0, 1, 2, 3]);
        let vdev = pdev.vdev(VDEV_A).unwrap();
        assert!(vdev.drain_timer.is_armed());

        // New frames go behind the backlog.
        pdev.tx(VDEV_A, frames(6..7)).unwrap();
        assert_eq!(vdev.queue_depth(), 3);

        for desc in pdev.transport().take_descs() {
            pdev.tx_completion(desc, TxCompletionStatus::Ok);
        }
        assert_eq!(pdev.drain_tick(VDEV_A), Some(3));
        assert_eq!(tags(&pdev), [4, 5, 6]);
        assert_eq!(pdev.drain_tick(VDEV_A), None);
        assert_eq!(pdev.stats().comp_ok, 4);
    }

    #[test]
    fn detach_skips_peers_held_elsewhere() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        let other = pdev.peer_attach(VDEV_A, STA_B, false).unwrap();
        let held = pdev.peers().find(&STA_B, None, false).unwrap();
        pdev.peer_detach(other).unwrap();

        pdev.vdev_detach(VDEV_A).unwrap();
        assert_eq!(pdev.peers().live_peers(), 1);
        drop(held);
        assert_eq!(pdev.peers().live_peers(), 0);
        assert_eq!(pdev.stats().peers_destroyed, 2);
    }

    #[test]
    fn flush_keeps_the_drain_timer_usable() {
        let config = PdevConfig {
            tx_desc_pool_size: 14,
            ..Default::default()
        };
        let pdev = pdev_with(config);
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.tx(VDEV_A, frames(0..6)).unwrap();
        pdev.unpause(VDEV_A, PauseReason::FW).unwrap();
        let vdev = pdev.vdev(VDEV_A).unwrap();
        assert!(vdev.drain_timer.is_armed());

        assert_eq!(pdev.flush(VDEV_A).unwrap(), 2);
        assert!(!vdev.drain_timer.is_armed());
        assert!(!vdev.drain_timer.is_shutdown());
        assert_eq!(pdev.drain_tick(VDEV_A), None);

        for desc in pdev.transport().take_descs() {
            pdev.tx_completion(desc, TxCompletionStatus::Ok);
        }
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.tx(VDEV_A, frames(6..12)).unwrap();
        pdev.unpause(VDEV_A, PauseReason::FW).unwrap();
        assert_eq!(tags(&pdev), [6, 7, 8, 9]);
        assert!(vdev.drain_timer.is_armed());

        for desc in pdev.transport().take_descs() {
            pdev.tx_completion(desc, TxCompletionStatus::Ok);
        }
        assert_eq!(pdev.drain_tick(VDEV_A), Some(2));
        assert_eq!(tags(&pdev), [10, 11]);
    }

    #[test]
    fn rejected_frame_goes_back_to_the_head() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.tx(VDEV_A, frames(0..3)).unwrap();

        pdev.transport().reject_nth(2);
        pdev.unpause(VDEV_A, PauseReason::FW).unwrap();
        assert_eq!(tags(&pdev), [0]);
        let vdev = pdev.vdev(VDEV_A).unwrap();
        assert_eq!(vdev.queue_depth(), 2);
        assert!(vdev.drain_timer.is_armed());

        assert_eq!(pdev.drain_tick(VDEV_A), Some(2));
        assert_eq!(tags(&pdev), [0, 1, 2]);
    }

    #[test]
    fn detach_stops_the_timer() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.tx(VDEV_A, frames(0..3)).unwrap();
        let vdev = pdev.vdev(VDEV_A).unwrap();
        vdev.drain_timer.arm();

        pdev.vdev_detach(VDEV_A).unwrap();
        assert!(vdev.drain_timer.is_shutdown());
        assert!(!vdev.drain_timer.arm());
        assert_eq!(vdev.queue_depth(), 0);
        assert!(pdev.vdev(VDEV_A).is_none());
        assert_eq!(pdev.peers().live_peers(), 0);
        assert_eq!(pdev.stats().peers_destroyed, 1);
        let rejected = pdev.tx(VDEV_A, frames(3..4)).unwrap_err();
        assert_eq!(rejected.reason, TxRxError::InvalidVdev);
        assert_eq!(pdev.vdev_detach(VDEV_A), Err(TxRxError::InvalidVdev));
    }

    #[test]
    fn direct_send_ignores_pause() {
        let config = PdevConfig {
            tx_desc_pool_size: 3,
            ..Default::default()
        };
        let pdev = pdev_with(config);
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::VDEV_SUSPEND).unwrap();
        let rejected = pdev.send_direct(VDEV_A, frames(0..5)).unwrap_err();
        assert_eq!(rejected.reason, TxRxError::PoolExhausted);
        assert_eq!(tags(&pdev), [0, 1, 2]);
        assert_eq!(rejected.frames.len(), 2);
        assert_eq!(pdev.vdev(VDEV_A).unwrap().queue_depth(), 0);
    }

    #[test]
    fn completion_releases_everything() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        let frame = ip_frame(STA_B, STA_A, 0);
        let probe = frame.clone();
        pdev.tx(VDEV_A, [frame].into_iter().collect()).unwrap();
        let bss = pdev.peers().find(&BSSID, None, false).unwrap();
        // Attach reference, descriptor and our lookup.
        assert_eq!(bss.ref_cnt(), 3);
        assert_eq!(bss.tid(0).in_flight(), 1);

        let descs = pdev.transport().take_descs();
        pdev.tx_completion(descs.into_iter().next().unwrap(), TxCompletionStatus::NoAck);
        assert_eq!(bss.ref_cnt(), 2);
        assert_eq!(bss.tid(0).in_flight(), 0);
        assert_eq!(bss.tid(0).sent(), 1);
        assert_eq!(probe.users(), 1);
        assert_eq!(pdev.free_descs(), pdev.config().tx_desc_pool_size);
        assert_eq!(pdev.stats().comp_no_ack, 1);
    }

    #[test]
    fn authorization_controls_sta_pause() {
        let pdev = pdev_with(PdevConfig::default());
        pdev.vdev_attach(VDEV_A, VdevConfig::new(VDEV_MAC, OpMode::Sta, BSSID))
            .unwrap();
        let bss = pdev.peer_attach(VDEV_A, BSSID, false).unwrap();
        assert_eq!(pdev.peer_map_event(BSSID, 7), Ok(true));
        assert_eq!(pdev.peer_map_event(BSSID, 7), Ok(false));
        assert_eq!(pdev.peer_map_event(STA_B, 8), Err(TxRxError::NotFound));

        pdev.peer_authorize(bss, false).unwrap();
        pdev.tx(VDEV_A, frames(0..2)).unwrap();
        assert_eq!(pdev.transport().attempts(), 0);
        pdev.peer_authorize(bss, true).unwrap();
        assert_eq!(tags(&pdev), [0, 1]);
        assert!(pdev.peers().find(&BSSID, None, true).unwrap().is_authorized());

        // The peer outlives its detach, as long as the ID is mapped.
        pdev.peer_detach(bss).unwrap();
        drop(pdev.transport().take_descs());
        assert_eq!(pdev.peers().live_peers(), 1);
        assert_eq!(pdev.peer_unmap_event(7), Ok(false));
        assert_eq!(pdev.peer_unmap_event(7), Ok(true));
        assert_eq!(pdev.peers().live_peers(), 0);
    }

    #[test]
    fn legacy_flow_control() {
        let config = PdevConfig {
            tx_desc_pool_size: 20,
            tx_flow: crate::config::TxFlowConfig {
                stop_threshold_pct: 0,
                start_offset_pct: 0,
            },
            ..Default::default()
        };
        let pdev = pdev_with(config);
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let recorder = events.clone();
        pdev.register_flow_control(
            VDEV_A,
            Arc::new(move |resume| recorder.lock().unwrap().push(resume)),
        )
        .unwrap();

        assert_eq!(pdev.get_tx_resource(VDEV_A, 10, 4), Ok(true));
        pdev.tx(VDEV_A, frames(0..12)).unwrap();
        assert_eq!(pdev.get_tx_resource(VDEV_A, 10, 4), Ok(false));
        assert_eq!(pdev.get_tx_resource(VDEV_A, 10, 4), Ok(false));
        let vdev = pdev.vdev(VDEV_A).unwrap();
        assert!(vdev.is_os_paused());
        assert!(!vdev.resume_signal().is_signaled());

        let mut descs = pdev.transport().take_descs().into_iter();
        for desc in descs.by_ref().take(6) {
            pdev.tx_completion(desc, TxCompletionStatus::Ok);
        }
        // 14 free, which isn't above 10 + 4 yet.
        assert!(vdev.is_os_paused());
        pdev.tx_completion(descs.next().unwrap(), TxCompletionStatus::Ok);
        assert!(!vdev.is_os_paused());
        assert!(vdev.resume_signal().is_signaled());
        assert_eq!(*events.lock().unwrap(), [false, true]);

        pdev.deregister_flow_control(VDEV_A).unwrap();
        drop(descs);
        assert_eq!(*events.lock().unwrap(), [false, true]);
    }

    #[test]
    fn pool_flow_control() {
        let config = PdevConfig {
            tx_desc_pool_size: 20,
            pause_queue_send_margin: 0,
            ..Default::default()
        };
        // Stop below 3, start at 5 free descriptors.
        let pdev = pdev_with(config);
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let recorder = events.clone();
        pdev.register_flow_control(
            VDEV_A,
            Arc::new(move |resume| recorder.lock().unwrap().push(resume)),
        )
        .unwrap();

        pdev.tx(VDEV_A, frames(0..18)).unwrap();
        assert_eq!(*events.lock().unwrap(), [false]);
        let mut descs = pdev.transport().take_descs().into_iter();
        for desc in descs.by_ref().take(2) {
            pdev.tx_completion(desc, TxCompletionStatus::Ok);
        }
        assert_eq!(*events.lock().unwrap(), [false]);
        pdev.tx_completion(descs.next().unwrap(), TxCompletionStatus::Ok);
        assert_eq!(*events.lock().unwrap(), [false, true]);
        assert!(pdev.vdev(VDEV_A).unwrap().resume_signal().is_signaled());
    }

    #[test]
    fn throttle_gates_and_round_robins() {
        let mut config = PdevConfig::default();
        config.throttle.tx_threshold = 3;
        let pdev = pdev_with(config);
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        attach_sta(&pdev, VDEV_B, BSSID_B, 400);
        pdev.set_throttle_level(1).unwrap();
        assert_eq!(pdev.throttle_tick(), Some(ThrottlePhase::Off));

        // Nothing goes out during the OFF phase, not even on a fresh vdev.
        pdev.tx(VDEV_A, frames(0..3)).unwrap();
        pdev.tx(VDEV_B, frames(10..13)).unwrap();
        assert_eq!(pdev.transport().attempts(), 0);
        assert_eq!(pdev.drain_tick(VDEV_A), None);

        assert_eq!(pdev.throttle_tick(), Some(ThrottlePhase::On));
        assert_eq!(tags(&pdev), [0, 10, 1]);
        assert_eq!(pdev.vdev(VDEV_B).unwrap().queue_depth(), 2);

        // Disabling throttling in the OFF phase drains right away.
        assert_eq!(pdev.throttle_tick(), Some(ThrottlePhase::Off));
        pdev.set_throttle_level(0).unwrap();
        assert_eq!(tags(&pdev), [0, 10, 1, 2, 11, 12]);
        assert_eq!(pdev.throttle_phase(), ThrottlePhase::On);
        // The pending phase timer expires without effect.
        assert_eq!(pdev.throttle_tick(), Some(ThrottlePhase::On));
        assert_eq!(pdev.throttle_tick(), None);
    }

    #[test]
    fn rx_uses_configured_format() {
        let pdev = pdev_with(PdevConfig::default());
        let mut frame = mpdu_header(DsMode::FromDs, STA_B, BSSID, STA_A, Some(true));
        frame.extend_from_slice(&amsdu_subframe(STA_B, STA_A, ETHERTYPE_IPV4, &[1; 6], false));
        let mut buf = NetBuf::from_slice(&frame).unwrap();
        let mut state = DecapState::new();
        pdev.rx_decap(&mut state, &mut buf, RxMsduInfo::SINGLE)
            .unwrap();
        let eth = EthHeader::parse(buf.data()).unwrap();
        assert_eq!((eth.dst, eth.src), (STA_B, STA_A));

        let mut garbage = NetBuf::from_slice(&[0u8; 4]).unwrap();
        assert!(pdev
            .rx_decap(&mut state, &mut garbage, RxMsduInfo::SINGLE)
            .is_err());
        assert_eq!(pdev.stats().rx_decap_error, 1);
    }

    #[test]
    fn drain_timer_task() {
        let pdev = pdev_with(PdevConfig::default());
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        pdev.tx(VDEV_A, frames(0..2)).unwrap();
        let vdev = pdev.vdev(VDEV_A).unwrap();
        // Clear the pause without draining, as if it raced with the timer.
        vdev.queue
            .lock(|queue| queue.borrow_mut().unpause(PauseReason::FW));
        vdev.drain_timer.arm();

        let res = block_on(select(
            pdev.run_drain_timer(VDEV_A),
            Timer::after(Duration::from_millis(50)),
        ));
        assert!(matches!(res, Either::Second(())));
        assert_eq!(tags(&pdev), [0, 1]);
    }

    #[test]
    fn concurrent_tx_keeps_per_vdev_order() {
        let pdev = Arc::new(pdev_with(PdevConfig::default()));
        attach_sta(&pdev, VDEV_A, BSSID, 400);
        attach_sta(&pdev, VDEV_B, BSSID_B, 400);
        pdev.pause(VDEV_A, PauseReason::FW).unwrap();
        let handles: Vec<_> = [(VDEV_A, 0u8), (VDEV_B, 100u8)]
            .into_iter()
            .map(|(vdev_id, base)| {
                let pdev = pdev.clone();
                std::thread::spawn(move || {
                    for tag in base..base + 50 {
                        pdev.tx(vdev_id, frames(tag..tag + 1)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        pdev.unpause(VDEV_A, PauseReason::FW).unwrap();
        let sent = tags(&pdev);
        assert_eq!(sent.len(), 100);
        let vdev_a: Vec<u8> = sent.iter().copied().filter(|tag| *tag < 100).collect();
        let vdev_b: Vec<u8> = sent.iter().copied().filter(|tag| *tag >= 100).collect();
        assert_eq!(vdev_a, (0..50).collect::<Vec<u8>>());
        assert_eq!(vdev_b, (100..150).collect::<Vec<u8>>());
    }
}
