//! Pause queues and OS flow control.
//!
//! A [PauseQueue] absorbs frames for a vdev, while it's paused or while older frames are still
//! waiting. It's a bounded FIFO: frames are never reordered, and once it holds `max_q_depth`
//! frames, further ones are refused instead of being dropped silently.
//!
//! OS flow control tells the network stack to stop handing us frames, when we're about to run
//! out of descriptors, and to resume once enough have been returned.

use alloc::{collections::VecDeque, sync::Arc};
use core::ops::{BitAnd, BitOr, BitOrAssign, Not};

use macro_bits::bit;

use crate::netbuf::{NetBuf, NetBufList};

/// A set of reasons for a vdev to be paused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PauseReason(u16);
impl PauseReason {
    pub const NONE: Self = Self(0);
    /// The firmware asked us to stop.
    pub const FW: Self = Self(bit!(0));
    /// The peer hasn't finished the key exchange.
    pub const PEER_UNAUTHORIZED: Self = Self(bit!(1));
    pub const TX_ABORT: Self = Self(bit!(2));
    pub const VDEV_STOP: Self = Self(bit!(3));
    pub const THERMAL_MITIGATION: Self = Self(bit!(4));
    pub const VDEV_SUSPEND: Self = Self(bit!(5));

    pub const fn bits(&self) -> u16 {
        self.0
    }
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}
impl BitOr for PauseReason {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}
impl BitOrAssign for PauseReason {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
impl BitAnd for PauseReason {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        Self(self.0 & rhs.0)
    }
}
impl Not for PauseReason {
    type Output = Self;
    fn not(self) -> Self::Output {
        Self(!self.0)
    }
}

/// The bounded FIFO of a vdev.
#[derive(Debug)]
pub struct PauseQueue {
    frames: VecDeque<NetBuf>,
    max_q_depth: usize,
    paused_reason: PauseReason,
    pause_cnt: usize,
    q_overflow_cnt: usize,
    /// A drain is in progress and holds frames outside of the queue.
    draining: bool,
    /// Frames popped by the drain, that may still come back.
    held: usize,
}
impl PauseQueue {
    pub fn new(max_q_depth: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_q_depth,
            paused_reason: PauseReason::NONE,
            pause_cnt: 0,
            q_overflow_cnt: 0,
            draining: false,
            held: 0,
        }
    }
    /// Assert `reason`. Frames already queued stay where they are.
    pub fn pause(&mut self, reason: PauseReason) {
        self.paused_reason |= reason;
        self.pause_cnt += 1;
    }
    /// Clear `reason`. Returns `true`, if the queue became active.
    pub fn unpause(&mut self, reason: PauseReason) -> bool {
        let was_paused = self.is_paused();
        self.paused_reason = self.paused_reason & !reason;
        was_paused && !self.is_paused()
    }
    pub fn is_paused(&self) -> bool {
        !self.paused_reason.is_empty()
    }
    pub fn paused_reason(&self) -> PauseReason {
        self.paused_reason
    }
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
    pub fn max_q_depth(&self) -> usize {
        self.max_q_depth
    }
    pub fn pause_cnt(&self) -> usize {
        self.pause_cnt
    }
    pub fn q_overflow_cnt(&self) -> usize {
        self.q_overflow_cnt
    }
    /// Check if new frames have to go behind the queue, instead of being sent directly.
    pub fn must_queue(&self) -> bool {
        self.is_paused() || !self.frames.is_empty() || self.draining
    }
    /// Append a frame to the tail.
    ///
    /// If the queue is full, the frame is handed back and the overflow is counted.
    pub fn enqueue(&mut self, frame: NetBuf) -> Result<(), NetBuf> {
        if self.frames.len() + self.held >= self.max_q_depth {
            self.q_overflow_cnt += 1;
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }
    /// Start draining. Only one drain may run at a time, and none while paused.
    pub(crate) fn begin_drain(&mut self) -> bool {
        if self.draining || self.is_paused() {
            return false;
        }
        self.draining = true;
        true
    }
    /// Take the head frame for sending, unless the queue got paused meanwhile.
    pub(crate) fn pop_for_send(&mut self) -> Option<NetBuf> {
        if self.is_paused() {
            return None;
        }
        let frame = self.frames.pop_front()?;
        self.held += 1;
        Some(frame)
    }
    /// The popped frame was consumed.
    pub(crate) fn release_held(&mut self) {
        self.held = self.held.saturating_sub(1);
    }
    /// Put a popped frame back at the head.
    pub(crate) fn requeue_front(&mut self, frame: NetBuf) {
        self.release_held();
        self.frames.push_front(frame);
    }
    /// Finish draining. Returns `true`, if an active backlog remains.
    pub(crate) fn end_drain(&mut self) -> bool {
        self.draining = false;
        !self.frames.is_empty() && !self.is_paused()
    }
    /// Remove all frames.
    pub fn take_all(&mut self) -> NetBufList {
        core::mem::take(&mut self.frames)
    }
}

/// Callback into the OS layer. `true` means the OS queue may be started again.
pub type FlowControlCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Legacy OS flow control state of one vdev.
#[derive(Default)]
pub(crate) struct OsFlowControl {
    pub callback: Option<FlowControlCallback>,
    pub os_paused: bool,
    pub low_watermark: usize,
    pub high_watermark_offset: usize,
}
impl OsFlowControl {
    /// Check if the OS queue is to be stopped at `free` descriptors.
    ///
    /// Returns whether enough descriptors are available, and whether the queue was stopped just
    /// now.
    pub fn check_stop(
        &mut self,
        free: usize,
        low_watermark: usize,
        high_watermark_offset: usize,
    ) -> (bool, bool) {
        self.low_watermark = low_watermark;
        self.high_watermark_offset = high_watermark_offset;
        if free >= low_watermark {
            return (true, false);
        }
        let newly_stopped = !self.os_paused;
        self.os_paused = true;
        (false, newly_stopped)
    }
    /// Check if a stopped OS queue can be resumed at `free` descriptors.
    ///
    /// Returns `true`, if the queue was resumed.
    pub fn check_resume(&mut self, free: usize) -> bool {
        if !self.os_paused || free <= self.low_watermark + self.high_watermark_offset {
            return false;
        }
        self.os_paused = false;
        true
    }
}

/// Pool wide stop and start thresholds, in descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PoolThresholds {
    pub stop: usize,
    pub start: usize,
}
impl PoolThresholds {
    pub fn new(pool_size: usize, stop_pct: u8, start_offset_pct: u8) -> Self {
        let stop = pool_size * stop_pct as usize / 100;
        let start = pool_size * (stop_pct as usize + start_offset_pct as usize) / 100;
        Self {
            stop,
            start: start.min(pool_size),
        }
    }
}
