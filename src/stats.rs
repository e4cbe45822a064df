//! Data path statistics.
//!
//! All counters are lock free and only ever increase. [TxRxStatsSnapshot] is a consistent enough
//! copy for reporting.

use core::fmt;

use portable_atomic::{AtomicUsize, Ordering};

use crate::tx_desc::TxCompletionStatus;

#[derive(Default)]
pub(crate) struct TxRxStats {
    pub tx_frames: AtomicUsize,
    pub tx_bytes: AtomicUsize,
    pub dropped_host_reject: AtomicUsize,
    pub dropped_download_fail: AtomicUsize,
    pub dropped_encap_error: AtomicUsize,
    pub dropped_no_peer: AtomicUsize,
    pub dropped_queue_full: AtomicUsize,
    pub comp_ok: AtomicUsize,
    pub comp_discard: AtomicUsize,
    pub comp_no_ack: AtomicUsize,
    pub comp_pkt_error: AtomicUsize,
    pub comp_download_fail: AtomicUsize,
    pub pause_events: AtomicUsize,
    pub queue_overflows: AtomicUsize,
    pub flushed: AtomicUsize,
    pub rx_decap_error: AtomicUsize,
}
impl TxRxStats {
    pub fn inc(counter: &AtomicUsize) {
        Self::add(counter, 1);
    }
    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
    pub fn record_completion(&self, status: TxCompletionStatus, n: usize) {
        let counter = match status {
            TxCompletionStatus::Ok => &self.comp_ok,
            TxCompletionStatus::Discard => &self.comp_discard,
            TxCompletionStatus::NoAck => &self.comp_no_ack,
            TxCompletionStatus::PktError => &self.comp_pkt_error,
            TxCompletionStatus::DownloadFail => &self.comp_download_fail,
        };
        Self::add(counter, n);
    }
    pub fn snapshot(&self) -> TxRxStatsSnapshot {
        let get = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        TxRxStatsSnapshot {
            tx_frames: get(&self.tx_frames),
            tx_bytes: get(&self.tx_bytes),
            dropped_host_reject: get(&self.dropped_host_reject),
            dropped_download_fail: get(&self.dropped_download_fail),
            dropped_encap_error: get(&self.dropped_encap_error),
            dropped_no_peer: get(&self.dropped_no_peer),
            dropped_queue_full: get(&self.dropped_queue_full),
            comp_ok: get(&self.comp_ok),
            comp_discard: get(&self.comp_discard),
            comp_no_ack: get(&self.comp_no_ack),
            comp_pkt_error: get(&self.comp_pkt_error),
            comp_download_fail: get(&self.comp_download_fail),
            pause_events: get(&self.pause_events),
            queue_overflows: get(&self.queue_overflows),
            flushed: get(&self.flushed),
            rx_decap_error: get(&self.rx_decap_error),
            ..Default::default()
        }
    }
}

/// A copy of the statistics of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxRxStatsSnapshot {
    /// Frames and segments accepted by the transport.
    pub tx_frames: usize,
    pub tx_bytes: usize,
    /// Frames not accepted, because no descriptor was available.
    pub dropped_host_reject: usize,
    /// Frames the transport refused.
    pub dropped_download_fail: usize,
    pub dropped_encap_error: usize,
    /// Unicast frames without a destination peer.
    pub dropped_no_peer: usize,
    /// Frames, that didn't fit into a pause queue.
    pub dropped_queue_full: usize,
    pub comp_ok: usize,
    pub comp_discard: usize,
    pub comp_no_ack: usize,
    pub comp_pkt_error: usize,
    pub comp_download_fail: usize,
    pub pause_events: usize,
    pub queue_overflows: usize,
    /// Frames dropped from pause queues during teardown.
    pub flushed: usize,
    pub rx_decap_error: usize,
    pub peers_created: usize,
    pub peers_destroyed: usize,
    pub peer_id_overflows: usize,
}
impl fmt::Display for TxRxStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tx: {} frames, {} bytes", self.tx_frames, self.tx_bytes)?;
        writeln!(
            f,
            "dropped: host_reject={} download_fail={} encap_error={} no_peer={} queue_full={}",
            self.dropped_host_reject,
            self.dropped_download_fail,
            self.dropped_encap_error,
            self.dropped_no_peer,
            self.dropped_queue_full
        )?;
        writeln!(
            f,
            "completions: ok={} discard={} no_ack={} pkt_error={} download_fail={}",
            self.comp_ok,
            self.comp_discard,
            self.comp_no_ack,
            self.comp_pkt_error,
            self.comp_download_fail
        )?;
        writeln!(
            f,
            "pause: events={} overflows={} flushed={}",
            self.pause_events, self.queue_overflows, self.flushed
        )?;
        writeln!(f, "rx: decap_error={}", self.rx_decap_error)?;
        write!(
            f,
            "peers: created={} destroyed={} id_overflows={}",
            self.peers_created, self.peers_destroyed, self.peer_id_overflows
        )
    }
}
