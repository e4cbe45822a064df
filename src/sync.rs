use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use atomic_waker::AtomicWaker;
use embassy_time::{Duration, Timer};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

/// A re-armable one shot timer with cancel and join semantics.
///
/// Arming only records, that an expiry was requested. The actual delay is provided by
/// [DeferredTimer::run], which has to be spawned on an executor. Tests and the synchronous parts of
/// the data path can also call [DeferredTimer::fire] directly.
///
/// Once [DeferredTimer::cancel_sync] has returned, the callback is guaranteed to never run again.
/// [DeferredTimer::disarm] only drops a pending expiry, and the timer can be armed again later.
pub struct DeferredTimer {
    armed: AtomicBool,
    /// Number of callers currently inside [DeferredTimer::fire].
    firing: AtomicUsize,
    shutdown: AtomicBool,
    waker: AtomicWaker,
}
impl DeferredTimer {
    pub const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            firing: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }
    /// Request an expiry.
    ///
    /// Returns `false`, if the timer was already shut down.
    pub fn arm(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if !self.armed.swap(true, Ordering::SeqCst) {
            trace!("Deferred timer armed.");
        }
        self.waker.wake();
        true
    }
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
    /// Consume a pending expiry and run the callback.
    ///
    /// Returns [None], if the timer wasn't armed or has been shut down.
    pub fn fire<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        // We count as firing before consuming the expiry. Anyone clearing `armed` and then waiting
        // for `firing` to drop to zero either sees us here, or we see the cleared flag.
        self.firing.fetch_add(1, Ordering::SeqCst);
        if !self.armed.swap(false, Ordering::SeqCst) || self.shutdown.load(Ordering::SeqCst) {
            self.firing.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        trace!("Deferred timer fired.");
        let res = f();
        self.firing.fetch_sub(1, Ordering::SeqCst);
        Some(res)
    }
    fn wait_idle(&self) {
        while self.firing.load(Ordering::SeqCst) != 0 {
            core::hint::spin_loop();
        }
    }
    /// Drop a pending expiry and wait for a running callback to return.
    ///
    /// Unlike [DeferredTimer::cancel_sync], the timer stays usable. This must not be called from
    /// inside the callback.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.wait_idle();
    }
    /// Shut the timer down and wait for a running callback to return.
    ///
    /// This must not be called from inside the callback, since it would wait for itself.
    pub fn cancel_sync(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.armed.store(false, Ordering::SeqCst);
        self.wait_idle();
        self.waker.wake();
    }
    /// Wait until the timer is armed.
    ///
    /// Resolves to `false`, once the timer has been shut down.
    fn wait_armed(&self) -> impl Future<Output = bool> + use<'_> {
        poll_fn(|cx| {
            if self.shutdown.load(Ordering::SeqCst) {
                return Poll::Ready(false);
            }
            self.waker.register(cx.waker());
            if self.shutdown.load(Ordering::SeqCst) {
                Poll::Ready(false)
            } else if self.armed.load(Ordering::SeqCst) {
                Poll::Ready(true)
            } else {
                Poll::Pending
            }
        })
    }
    /// The task body driving the timer.
    ///
    /// Every time the timer is armed, this waits for `period` and then fires. It returns once the
    /// timer is shut down.
    pub async fn run(&self, period: Duration, f: impl FnMut()) {
        self.run_with(|| period, f).await
    }
    /// Like [DeferredTimer::run], but the delay is determined anew every time the timer is armed.
    pub async fn run_with(&self, mut period: impl FnMut() -> Duration, mut f: impl FnMut()) {
        while self.wait_armed().await {
            Timer::after(period()).await;
            self.fire(&mut f);
        }
    }
}
impl Default for DeferredTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// A flag signalling, that the upper layer may resume sending.
pub struct ResumeSignal {
    resumed: AtomicBool,
    waker: AtomicWaker,
}
impl ResumeSignal {
    pub const fn new() -> Self {
        Self {
            resumed: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        }
    }
    pub fn signal(&self) {
        self.resumed.store(true, Ordering::Release);
        self.waker.wake();
    }
    pub fn reset(&self) {
        self.resumed.store(false, Ordering::Relaxed);
    }
    pub fn is_signaled(&self) -> bool {
        self.resumed.load(Ordering::Acquire)
    }
    /// Asynchronously wait for the next resume and consume it.
    pub fn wait(&self) -> impl Future<Output = ()> + use<'_> {
        poll_fn(|cx| {
            if self.resumed.swap(false, Ordering::AcqRel) {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            if self.resumed.swap(false, Ordering::AcqRel) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
}
impl Default for ResumeSignal {
    fn default() -> Self {
        Self::new()
    }
}
