//! # `wlan-txrx`
//! This is the host side data path for a Wi-Fi chip, which offloads most of the MAC to its own
//! firmware. The host only has to track the stations it talks to, turn the frames of the network
//! stack into something the target understands and keep the transport to the target fed without
//! overrunning it.
//!
//! ## Overview
//! The central object is the physical device context [TxRxPdev]. It owns the peer table, the pool
//! of tx descriptors shared by all interfaces and the virtual devices ([vdev::Vdev]) attached to
//! it. The transport, which actually moves the frames to the target, is abstracted by
//! [TxTransport].
//!
//! ### Peers
//! Every station we're associated with is represented by a [peer::Peer]. Peers are found either
//! by their MAC address, through a small hash table, or by one of the peer IDs the firmware
//! assigned to them. Lookups hand out a [peer::PeerRef], which keeps the peer alive until it's
//! dropped. Once the last reference is gone, the peer is unlinked from all indices and destroyed.
//!
//! ### Transmit (TX)
//! A frame handed to [TxRxPdev::tx] first goes through the pause queue of its vdev. If the vdev
//! is paused or frames are already waiting, the frame is queued behind them. Otherwise we
//! allocate a tx descriptor, look up the destination peer, encapsulate the frame for the target
//! and submit it to the transport. Frames the transport doesn't accept are handed back to the
//! caller. TCP frames marked for segmentation offload are split into one descriptor per segment.
//!
//! Completions come back through [TxRxPdev::tx_completion], which returns the descriptor to the
//! pool and drops the references it held.
//!
//! ### Receive (RX)
//! Received MPDUs are decapsulated by [TxRxPdev::rx_decap], which also handles A-MSDU
//! subframes. The state needed across the subframes of one MPDU is owned by the caller, through
//! a [encap::DecapState].
//!
//! ### Flow control
//! Each vdev has a bounded FIFO, which absorbs frames while the vdev is paused. It is drained
//! on unpause and by a periodic timer, which is driven by [TxRxPdev::run_drain_timer]. On top of
//! that, the OS queues can be stopped and started through a registered callback, depending on how
//! many descriptors are left. Thermal throttling duty cycles all queues of the device, see
//! [TxRxPdev::set_throttle_level].
//!
//! ### Control plane
//! Commands for OCB and P2P are only passed through. The [ctrl] module defines the boundary.

#![no_std]
#![allow(unexpected_cfgs)]
extern crate alloc;
#[cfg(test)]
extern crate std;

pub(crate) mod fmt;

pub mod config;
pub mod ctrl;
pub mod encap;
pub mod error;
mod fastpath;
pub mod flow_control;
mod freelist;
pub mod ieee80211;
pub mod netbuf;
mod pdev;
pub mod peer;
pub mod stats;
mod sync;
#[cfg(test)]
mod test_utils;
mod throttle;
pub mod tso;
pub mod tx_desc;
pub mod vdev;

pub use config::{FrameFormat, OpMode, PdevConfig, ThrottleConfig, TxFlowConfig, VdevConfig};
pub use error::{TxRejected, TxResult, TxRxError, TxRxResult};
pub use flow_control::PauseReason;
pub use netbuf::{NetBuf, NetBufList, TxMeta};
pub use pdev::*;
pub use sync::{DeferredTimer, ResumeSignal};
pub use throttle::ThrottlePhase;
pub use tx_desc::{TxCompletionStatus, TxDesc};

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
