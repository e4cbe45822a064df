//! Configuration of the device and its interfaces.
//!
//! All of this is read-only once the object it configures is attached.

use embassy_time::Duration;
use macro_bits::serializable_enum;

use crate::ieee80211::MacAddr;

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// The format of frames exchanged with the target.
    pub enum FrameFormat: u8 {
        Raw => 0x00,
        NativeWifi => 0x01,
        #[default]
        Ethernet => 0x02
    }
}

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// The operating mode of a vdev.
    pub enum OpMode: u8 {
        Ap => 0x00,
        #[default]
        Sta => 0x01,
        Ibss => 0x02,
        Monitor => 0x03,
        Ocb => 0x04
    }
}

/// Duty cycle parameters for tx throttling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Length of one ON/OFF cycle.
    pub period: Duration,
    /// Percentage of the period spent in the OFF phase, indexed by throttle level.
    pub off_pct: [u8; 4],
    /// Maximum number of queued frames sent per ON phase.
    pub tx_threshold: usize,
}
impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(100),
            off_pct: [0, 50, 75, 94],
            tx_threshold: 32,
        }
    }
}

/// Thresholds for pausing the OS queues, when the descriptor pool runs low.
///
/// Both are percentages of the descriptor pool size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxFlowConfig {
    /// Stop the OS queues once fewer descriptors than this are free.
    pub stop_threshold_pct: u8,
    /// Restart them once `stop_threshold_pct + start_offset_pct` are free again.
    pub start_offset_pct: u8,
}
impl Default for TxFlowConfig {
    fn default() -> Self {
        Self {
            stop_threshold_pct: 15,
            start_offset_pct: 10,
        }
    }
}

/// Configuration of a physical device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PdevConfig {
    /// Maximum number of peers across all vdevs.
    pub max_peers: usize,
    /// The largest peer ID the firmware may assign.
    pub max_peer_id: u16,
    pub tx_desc_pool_size: usize,
    pub tso_seg_pool_size: usize,
    /// Maximum number of bytes the transport copies eagerly.
    pub download_len: usize,
    /// Length of the hardware descriptor prefix, which counts towards the download length.
    pub tx_desc_hdr_len: usize,
    /// Maximum number of fragments in a descriptor, besides the header fragment.
    pub max_extra_frags: usize,
    /// Descriptors left untouched by pause queue drains, for use by other vdevs.
    pub pause_queue_send_margin: usize,
    /// Delay between two drain attempts of a backlogged pause queue.
    pub pause_queue_send_period: Duration,
    /// Insert LLC/SNAP headers on the host.
    pub sw_tx_llc_proc: bool,
    /// Set the protected frame bit on the host.
    pub sw_pf_proc: bool,
    /// Format of frames handed to the target.
    pub frame_format: FrameFormat,
    /// The target translates 802.3 frames itself.
    pub target_8023_translation: bool,
    /// Format of received frames handed to the network stack.
    pub rx_frame_format: FrameFormat,
    pub throttle: ThrottleConfig,
    pub tx_flow: TxFlowConfig,
    /// Transport endpoint used for data frames.
    pub endpoint_id: u8,
}
impl Default for PdevConfig {
    fn default() -> Self {
        Self {
            max_peers: 32,
            max_peer_id: 255,
            tx_desc_pool_size: 1024,
            tso_seg_pool_size: 256,
            download_len: 96,
            tx_desc_hdr_len: 32,
            max_extra_frags: 2,
            pause_queue_send_margin: 10,
            pause_queue_send_period: Duration::from_millis(5),
            sw_tx_llc_proc: false,
            sw_pf_proc: false,
            frame_format: FrameFormat::Ethernet,
            target_8023_translation: true,
            rx_frame_format: FrameFormat::Ethernet,
            throttle: ThrottleConfig::default(),
            tx_flow: TxFlowConfig::default(),
            endpoint_id: 0,
        }
    }
}

/// Configuration of a virtual device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VdevConfig {
    pub mac: MacAddr,
    pub opmode: OpMode,
    /// BSSID of the network. For an AP this is usually our own address.
    pub bssid: MacAddr,
    /// Maximum number of frames in the pause queue.
    pub max_q_depth: usize,
}
impl VdevConfig {
    pub const DEFAULT_MAX_Q_DEPTH: usize = 400;

    pub const fn new(mac: MacAddr, opmode: OpMode, bssid: MacAddr) -> Self {
        Self {
            mac,
            opmode,
            bssid,
            max_q_depth: Self::DEFAULT_MAX_Q_DEPTH,
        }
    }
    pub const fn with_max_q_depth(mut self, max_q_depth: usize) -> Self {
        self.max_q_depth = max_q_depth;
        self
    }
}
