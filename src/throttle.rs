//! Duty cycled tx throttling.
//!
//! While a throttle level above zero is set, every period is split into an ON and an OFF phase.
//! During the OFF phase nothing is sent and new frames pile up in the pause queues. Each ON
//! phase starts with a round robin drain of those queues.

use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use embassy_time::Duration;

use crate::{
    config::ThrottleConfig,
    error::{TxRxError, TxRxResult},
    sync::DeferredTimer,
    DefaultRawMutex,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ThrottlePhase {
    #[default]
    On,
    Off,
}

#[derive(Default)]
struct ThrottleState {
    level: u8,
    phase: ThrottlePhase,
}

pub(crate) struct Throttle {
    config: ThrottleConfig,
    state: blocking_mutex::Mutex<DefaultRawMutex, RefCell<ThrottleState>>,
    pub(crate) timer: DeferredTimer,
}
impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: blocking_mutex::Mutex::new(RefCell::new(ThrottleState::default())),
            timer: DeferredTimer::new(),
        }
    }
    pub fn level(&self) -> u8 {
        self.state.lock(|state| state.borrow().level)
    }
    pub fn phase(&self) -> ThrottlePhase {
        self.state.lock(|state| state.borrow().phase)
    }
    /// Frames have to wait in the pause queues.
    pub fn is_tx_blocked(&self) -> bool {
        self.phase() == ThrottlePhase::Off
    }
    pub fn tx_threshold(&self) -> usize {
        self.config.tx_threshold
    }
    fn off_time(&self, level: u8) -> Duration {
        let off_pct = self.config.off_pct[level as usize].min(100) as u64;
        Duration::from_ticks(self.config.period.as_ticks() * off_pct / 100)
    }
    fn on_time(&self, level: u8) -> Duration {
        self.config.period - self.off_time(level)
    }
    /// Length of the current phase.
    pub fn phase_duration(&self) -> Duration {
        let (level, phase) = self.state.lock(|state| {
            let state = state.borrow();
            (state.level, state.phase)
        });
        match phase {
            ThrottlePhase::On => self.on_time(level),
            ThrottlePhase::Off => self.off_time(level),
        }
    }
    /// Change the throttle level.
    ///
    /// Level zero disables throttling. The new duty cycle starts with an ON phase. Returns `true`,
    /// if sending was blocked before.
    pub fn set_level(&self, level: u8) -> TxRxResult<bool> {
        if level as usize >= self.config.off_pct.len() {
            return Err(TxRxError::Unsupported);
        }
        let was_blocked = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let was_blocked = state.phase == ThrottlePhase::Off;
            state.level = level;
            state.phase = ThrottlePhase::On;
            was_blocked
        });
        if level != 0 && self.off_time(level) != Duration::from_ticks(0) {
            self.timer.arm();
        }
        debug!("Throttle level set to {}.", level);
        Ok(was_blocked)
    }
    /// Switch to the other phase and re-arm the phase timer.
    ///
    /// Returns the new phase.
    pub fn toggle_phase(&self) -> ThrottlePhase {
        let phase = self.state.lock(|state| {
            let mut state = state.borrow_mut();
            if state.level == 0 {
                state.phase = ThrottlePhase::On;
                return None;
            }
            state.phase = match state.phase {
                ThrottlePhase::On => ThrottlePhase::Off,
                ThrottlePhase::Off => ThrottlePhase::On,
            };
            Some(state.phase)
        });
        match phase {
            Some(phase) => {
                trace!("Throttle phase is now {:?}.", phase);
                self.timer.arm();
                phase
            }
            None => ThrottlePhase::On,
        }
    }
}
