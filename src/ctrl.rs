//! Control plane boundary for OCB and P2P.
//!
//! The data path doesn't interpret any of this. Commands are forwarded to the firmware by a
//! [ControlPlane] implementation and the status events it sends back are decoded by
//! [parse_event_status].

use alloc::vec::Vec;

use macro_bits::serializable_enum;

use crate::error::{TxRxError, TxRxResult};

serializable_enum! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    /// Identifies a control command on the wire.
    pub enum ControlCommandId: u32 {
        SetConfig => 0x01,
        SetUtcTime => 0x02,
        StartTimingAdvert => 0x03,
        StopTimingAdvert => 0x04,
        GetTsfTimer => 0x05,
        DccGetStats => 0x06,
        DccClearStats => 0x07,
        DccUpdateNdl => 0x08
    }
}

/// A command for the firmware.
///
/// Bodies are opaque to us and passed along unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    /// Configure the channels and schedule of an OCB vdev.
    SetConfig { vdev_id: u8, body: Vec<u8> },
    /// Set the UTC time and its estimated error.
    SetUtcTime { vdev_id: u8, body: Vec<u8> },
    /// Start sending timing advertisements on a channel.
    StartTimingAdvert {
        vdev_id: u8,
        channel_freq: u32,
        repeat_rate: u32,
        template: Vec<u8>,
    },
    StopTimingAdvert { vdev_id: u8, channel_freq: u32 },
    /// Request the TSF of a vdev, which is returned through an event.
    GetTsfTimer { vdev_id: u8 },
    DccGetStats { vdev_id: u8, body: Vec<u8> },
    /// Clear the DCC statistics selected by `bitmap`.
    DccClearStats { vdev_id: u8, bitmap: u32 },
    DccUpdateNdl { vdev_id: u8, body: Vec<u8> },
}
impl ControlCommand {
    pub const fn id(&self) -> ControlCommandId {
        match self {
            Self::SetConfig { .. } => ControlCommandId::SetConfig,
            Self::SetUtcTime { .. } => ControlCommandId::SetUtcTime,
            Self::StartTimingAdvert { .. } => ControlCommandId::StartTimingAdvert,
            Self::StopTimingAdvert { .. } => ControlCommandId::StopTimingAdvert,
            Self::GetTsfTimer { .. } => ControlCommandId::GetTsfTimer,
            Self::DccGetStats { .. } => ControlCommandId::DccGetStats,
            Self::DccClearStats { .. } => ControlCommandId::DccClearStats,
            Self::DccUpdateNdl { .. } => ControlCommandId::DccUpdateNdl,
        }
    }
    pub const fn vdev_id(&self) -> u8 {
        match self {
            Self::SetConfig { vdev_id, .. }
            | Self::SetUtcTime { vdev_id, .. }
            | Self::StartTimingAdvert { vdev_id, .. }
            | Self::StopTimingAdvert { vdev_id, .. }
            | Self::GetTsfTimer { vdev_id }
            | Self::DccGetStats { vdev_id, .. }
            | Self::DccClearStats { vdev_id, .. }
            | Self::DccUpdateNdl { vdev_id, .. } => *vdev_id,
        }
    }
    /// Serialize the command.
    ///
    /// The layout mirrors the event prefix: `[u32 command][u32 vdev]`, followed by the body. All
    /// integers are little endian.
    pub fn to_bytes(&self) -> TxRxResult<Vec<u8>> {
        let mut bytes = Vec::new();
        let body_len = match self {
            Self::SetConfig { body, .. }
            | Self::SetUtcTime { body, .. }
            | Self::DccGetStats { body, .. }
            | Self::DccUpdateNdl { body, .. } => body.len(),
            Self::StartTimingAdvert { template, .. } => 8 + template.len(),
            Self::StopTimingAdvert { .. } | Self::DccClearStats { .. } => 4,
            Self::GetTsfTimer { .. } => 0,
        };
        bytes
            .try_reserve_exact(COMMAND_PREFIX_LEN + body_len)
            .map_err(|_| TxRxError::OutOfMemory)?;
        bytes.extend_from_slice(&self.id().into_bits().to_le_bytes());
        bytes.extend_from_slice(&(self.vdev_id() as u32).to_le_bytes());
        match self {
            Self::SetConfig { body, .. }
            | Self::SetUtcTime { body, .. }
            | Self::DccGetStats { body, .. }
            | Self::DccUpdateNdl { body, .. } => bytes.extend_from_slice(body),
            Self::StartTimingAdvert {
                channel_freq,
                repeat_rate,
                template,
                ..
            } => {
                bytes.extend_from_slice(&channel_freq.to_le_bytes());
                bytes.extend_from_slice(&repeat_rate.to_le_bytes());
                bytes.extend_from_slice(template);
            }
            Self::StopTimingAdvert { channel_freq, .. } => {
                bytes.extend_from_slice(&channel_freq.to_le_bytes())
            }
            Self::DccClearStats { bitmap, .. } => bytes.extend_from_slice(&bitmap.to_le_bytes()),
            Self::GetTsfTimer { .. } => {}
        }
        Ok(bytes)
    }
}

/// Sends commands to the firmware.
pub trait ControlPlane {
    fn send(&self, command: ControlCommand) -> TxRxResult<()>;
}

/// The status prefix of a control event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlEvent {
    pub command: ControlCommandId,
    pub vdev_id: u8,
    /// Zero means success, anything else is firmware specific.
    pub status: u32,
}
impl ControlEvent {
    pub const fn is_success(&self) -> bool {
        self.status == 0
    }
}

const COMMAND_PREFIX_LEN: usize = 8;
const EVENT_PREFIX_LEN: usize = 12;

/// Extract command, vdev and status from the start of an event.
///
/// Anything after the prefix is ignored.
pub fn parse_event_status(event: &[u8]) -> TxRxResult<ControlEvent> {
    let Some(prefix) = event.get(..EVENT_PREFIX_LEN) else {
        debug!("Control event too short: {} bytes.", event.len());
        return Err(TxRxError::MalformedEvent);
    };
    let word = |i: usize| {
        u32::from_le_bytes([
            prefix[i * 4],
            prefix[i * 4 + 1],
            prefix[i * 4 + 2],
            prefix[i * 4 + 3],
        ])
    };
    let vdev_id = u8::try_from(word(1)).map_err(|_| TxRxError::InvalidVdev)?;
    Ok(ControlEvent {
        command: ControlCommandId::from_bits(word(0)),
        vdev_id,
        status: word(2),
    })
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, vec, vec::Vec};

    use super::*;

    #[derive(Default)]
    struct RecordingControlPlane {
        sent: RefCell<Vec<Vec<u8>>>,
    }
    impl ControlPlane for RecordingControlPlane {
        fn send(&self, command: ControlCommand) -> TxRxResult<()> {
            self.sent.borrow_mut().push(command.to_bytes()?);
            Ok(())
        }
    }

    #[test]
    fn event_status() {
        let mut event = Vec::new();
        for word in [0x05u32, 3, 0] {
            event.extend_from_slice(&word.to_le_bytes());
        }
        event.extend_from_slice(&[0xaa; 8]);
        let parsed = parse_event_status(&event).unwrap();
        assert_eq!(parsed.command, ControlCommandId::GetTsfTimer);
        assert_eq!(parsed.vdev_id, 3);
        assert!(parsed.is_success());

        event[8] = 0x16;
        assert_eq!(parse_event_status(&event).unwrap().status, 0x16);
        assert_eq!(
            parse_event_status(&event[..11]),
            Err(TxRxError::MalformedEvent)
        );
        event[4..8].copy_from_slice(&0x100u32.to_le_bytes());
        assert_eq!(parse_event_status(&event), Err(TxRxError::InvalidVdev));
    }

    #[test]
    fn commands_are_forwarded() {
        let ctrl = RecordingControlPlane::default();
        ctrl.send(ControlCommand::DccClearStats {
            vdev_id: 1,
            bitmap: 0x3,
        })
        .unwrap();
        ctrl.send(ControlCommand::StartTimingAdvert {
            vdev_id: 2,
            channel_freq: 5860,
            repeat_rate: 4,
            template: vec![0xde, 0xad],
        })
        .unwrap();
        let sent = ctrl.sent.borrow();
        assert_eq!(sent[0], [7, 0, 0, 0, 1, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(&sent[1][..8], [3, 0, 0, 0, 2, 0, 0, 0]);
        assert_eq!(&sent[1][8..12], 5860u32.to_le_bytes());
        assert_eq!(&sent[1][16..], [0xde, 0xad]);
    }
}
