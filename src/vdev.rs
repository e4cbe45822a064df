//! Virtual devices.

use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    config::{OpMode, VdevConfig},
    flow_control::{FlowControlCallback, OsFlowControl, PauseQueue, PauseReason},
    ieee80211::MacAddr,
    sync::{DeferredTimer, ResumeSignal},
    DefaultRawMutex,
};

/// One logical 802.11 interface of a physical device.
///
/// A vdev owns its pause queue and the timer draining it. It's created and destroyed through
/// [TxRxPdev](crate::TxRxPdev).
pub struct Vdev {
    id: u8,
    config: VdevConfig,
    pub(crate) queue: blocking_mutex::Mutex<DefaultRawMutex, RefCell<PauseQueue>>,
    pub(crate) drain_timer: DeferredTimer,
    pub(crate) os_flow: blocking_mutex::Mutex<DefaultRawMutex, RefCell<OsFlowControl>>,
    resume: ResumeSignal,
    detaching: AtomicBool,
}
impl Vdev {
    pub(crate) fn new(id: u8, config: VdevConfig) -> Self {
        Self {
            id,
            config,
            queue: blocking_mutex::Mutex::new(RefCell::new(PauseQueue::new(config.max_q_depth))),
            drain_timer: DeferredTimer::new(),
            os_flow: blocking_mutex::Mutex::new(RefCell::new(OsFlowControl::default())),
            resume: ResumeSignal::new(),
            detaching: AtomicBool::new(false),
        }
    }
    pub fn id(&self) -> u8 {
        self.id
    }
    pub fn config(&self) -> &VdevConfig {
        &self.config
    }
    pub fn mac(&self) -> MacAddr {
        self.config.mac
    }
    pub fn opmode(&self) -> OpMode {
        self.config.opmode
    }
    pub fn bssid(&self) -> MacAddr {
        self.config.bssid
    }
    /// Signalled, when the OS queue of this vdev may be started again.
    pub fn resume_signal(&self) -> &ResumeSignal {
        &self.resume
    }
    /// Number of frames waiting in the pause queue.
    pub fn queue_depth(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().depth())
    }
    pub fn paused_reason(&self) -> PauseReason {
        self.queue.lock(|queue| queue.borrow().paused_reason())
    }
    pub fn is_paused(&self) -> bool {
        self.queue.lock(|queue| queue.borrow().is_paused())
    }
    /// Number of pause events seen.
    pub fn pause_cnt(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().pause_cnt())
    }
    /// Number of frames refused, because the pause queue was full.
    pub fn q_overflow_cnt(&self) -> usize {
        self.queue.lock(|queue| queue.borrow().q_overflow_cnt())
    }
    /// Check if the OS queue of this vdev is currently stopped.
    pub fn is_os_paused(&self) -> bool {
        self.os_flow.lock(|flow| flow.borrow().os_paused)
    }
    pub fn is_detaching(&self) -> bool {
        self.detaching.load(Ordering::Acquire)
    }
    pub(crate) fn set_detaching(&self) {
        self.detaching.store(true, Ordering::Release);
    }
    /// Replace the flow control callback, which also resumes the OS queue.
    ///
    /// Returns `true`, if the OS queue was stopped.
    pub(crate) fn set_flow_control_callback(&self, callback: Option<FlowControlCallback>) -> bool {
        self.os_flow.lock(|flow| {
            let mut flow = flow.borrow_mut();
            flow.callback = callback;
            core::mem::take(&mut flow.os_paused)
        })
    }
    pub(crate) fn flow_control_callback(&self) -> Option<FlowControlCallback> {
        self.os_flow.lock(|flow| flow.borrow().callback.clone())
    }
}
