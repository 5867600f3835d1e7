//! Streaming frame codec and packet sequence monitor.
//!
//! While the board is in DAQ state it streams one fixed 38-byte frame per
//! sample period:
//!
//! | offset | size | field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 1    | head, always `0xAA`                     |
//! | 1      | 1    | frame id (`0x00` for raw ADC data)      |
//! | 2      | 1    | sequence index, wraps at 256            |
//! | 3      | 8    | device timestamp in µs, little-endian   |
//! | 11     | 1    | active channel mask                     |
//! | 12     | 1    | alert byte, bit `b` for channel `b`     |
//! | 13     | 24   | 8 × 24-bit big-endian two's complement  |
//! | 37     | 1    | tail, always `0xBB`                     |
//!
//! There is no checksum; the head/tail sentinels and the sequence index are
//! the only means to detect misalignment and loss.

use std::sync::atomic::{AtomicU16, Ordering};

use serde::Serialize;

use crate::errors::FrameError;

// ============================================================================
// Constants
// ============================================================================

pub const FRAME_LEN: usize = 38;
pub const FRAME_HEAD: u8 = 0xAA;
pub const FRAME_TAIL: u8 = 0xBB;
pub const CHANNELS: usize = 8;

/// Frame id of raw 24-bit ADC data frames.
pub const RAW_DATA_FRAME_ID: u8 = 0x00;

const BYTES_PER_CHANNEL: usize = 3;
const PAYLOAD_LEN: usize = CHANNELS * BYTES_PER_CHANNEL;

const OFFSET_FRAME_ID: usize = 1;
const OFFSET_SEQUENCE: usize = 2;
const OFFSET_TIMESTAMP: usize = 3;
const OFFSET_ACTIVE: usize = 11;
const OFFSET_ALERT: usize = 12;
const OFFSET_PAYLOAD: usize = 13;

/// Smallest and largest value a 24-bit channel can carry.
pub const CHANNEL_MIN: i32 = -(1 << 23);
pub const CHANNEL_MAX: i32 = (1 << 23) - 1;

// ============================================================================
// Data Types
// ============================================================================

/// One decoded sample across all channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodedSample {
    /// Device clock in microseconds.
    pub timestamp: i64,
    /// Sign-extended channel values.
    pub channels: [i32; CHANNELS],
    /// Per-channel alert flags, index = channel.
    pub alerts: [bool; CHANNELS],
    pub frame_id: u8,
    /// Packet counter, checked with [`SequenceMonitor`].
    pub sequence_index: u8,
    pub active_channels: u8,
}

impl DecodedSample {
    /// Alert flags as the `0`/`1` integers stored in recordings.
    pub fn alert_flags(&self) -> [i8; CHANNELS] {
        self.alerts.map(i8::from)
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Decode one raw streaming frame.
pub fn decode(raw: &[u8]) -> Result<DecodedSample, FrameError> {
    if raw.len() != FRAME_LEN {
        return Err(FrameError::WrongLength {
            expected: FRAME_LEN,
            actual: raw.len(),
        });
    }
    if raw[0] != FRAME_HEAD {
        return Err(FrameError::BadHead(raw[0]));
    }
    if raw[FRAME_LEN - 1] != FRAME_TAIL {
        return Err(FrameError::BadTail(raw[FRAME_LEN - 1]));
    }

    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]);

    Ok(DecodedSample {
        timestamp: u64::from_le_bytes(ts) as i64,
        channels: decode_channels(&raw[OFFSET_PAYLOAD..OFFSET_PAYLOAD + PAYLOAD_LEN]),
        alerts: decode_alerts(raw[OFFSET_ALERT]),
        frame_id: raw[OFFSET_FRAME_ID],
        sequence_index: raw[OFFSET_SEQUENCE],
        active_channels: raw[OFFSET_ACTIVE],
    })
}

/// Split the 24-byte payload into eight signed 24-bit values.
pub fn decode_channels(payload: &[u8]) -> [i32; CHANNELS] {
    let mut values = [0i32; CHANNELS];
    for (value, chunk) in values
        .iter_mut()
        .zip(payload.chunks_exact(BYTES_PER_CHANNEL))
    {
        // Place the 24 bits at the top of an i32 and shift back down to sign-extend.
        *value = i32::from_be_bytes([chunk[0], chunk[1], chunk[2], 0]) >> 8;
    }
    values
}

/// Bit `b` of the alert byte is the flag of channel `b` (LSB first).
pub fn decode_alerts(alert_byte: u8) -> [bool; CHANNELS] {
    std::array::from_fn(|bit| (alert_byte >> bit) & 0x01 == 1)
}

/// Inverse of [`decode_channels`]. Values are truncated to 24 bits.
pub fn encode_channels(values: &[i32; CHANNELS]) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    for (chunk, value) in payload.chunks_exact_mut(BYTES_PER_CHANNEL).zip(values) {
        let [_, b0, b1, b2] = value.to_be_bytes();
        chunk.copy_from_slice(&[b0, b1, b2]);
    }
    payload
}

pub fn encode_alerts(alerts: &[bool; CHANNELS]) -> u8 {
    alerts
        .iter()
        .enumerate()
        .fold(0u8, |acc, (bit, &on)| acc | ((on as u8) << bit))
}

/// Build the wire form of a sample, as the firmware would send it.
pub fn encode(sample: &DecodedSample) -> [u8; FRAME_LEN] {
    let mut raw = [0u8; FRAME_LEN];
    raw[0] = FRAME_HEAD;
    raw[OFFSET_FRAME_ID] = sample.frame_id;
    raw[OFFSET_SEQUENCE] = sample.sequence_index;
    raw[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8]
        .copy_from_slice(&(sample.timestamp as u64).to_le_bytes());
    raw[OFFSET_ACTIVE] = sample.active_channels;
    raw[OFFSET_ALERT] = encode_alerts(&sample.alerts);
    raw[OFFSET_PAYLOAD..OFFSET_PAYLOAD + PAYLOAD_LEN]
        .copy_from_slice(&encode_channels(&sample.channels));
    raw[FRAME_LEN - 1] = FRAME_TAIL;
    raw
}

// ============================================================================
// Sequence monitor
// ============================================================================

const UNSEEDED: u16 = u16::MAX;

/// Tracks the 8-bit packet counter to detect drops and reorders.
///
/// Purely observational: the expectation follows whatever index was seen
/// last, so a single loss is reported once and tracking resumes from there.
/// The counter lives in an atomic so the controller can read it while the
/// reader thread updates it.
#[derive(Debug)]
pub struct SequenceMonitor {
    expected: AtomicU16,
}

impl Default for SequenceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceMonitor {
    pub fn new() -> Self {
        Self {
            expected: AtomicU16::new(UNSEEDED),
        }
    }

    /// Record `observed`; `true` when it was the expected index (or the first seen).
    pub fn check(&self, observed: u8) -> bool {
        let next = u16::from(observed.wrapping_add(1));
        let previous = self.expected.swap(next, Ordering::AcqRel);
        previous == UNSEEDED || previous == u16::from(observed)
    }

    /// Index expected next, if any frame has been seen.
    pub fn expected(&self) -> Option<u8> {
        match self.expected.load(Ordering::Acquire) {
            UNSEEDED => None,
            value => Some(value as u8),
        }
    }

    /// Forget the expectation; the next frame re-seeds it.
    pub fn reset(&self) {
        self.expected.store(UNSEEDED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with_payload(payload: [u8; PAYLOAD_LEN], alert: u8) -> [u8; FRAME_LEN] {
        let mut raw = [0u8; FRAME_LEN];
        raw[0] = FRAME_HEAD;
        raw[OFFSET_SEQUENCE] = 7;
        raw[OFFSET_TIMESTAMP..OFFSET_TIMESTAMP + 8].copy_from_slice(&123_456u64.to_le_bytes());
        raw[OFFSET_ACTIVE] = 0xFF;
        raw[OFFSET_ALERT] = alert;
        raw[OFFSET_PAYLOAD..OFFSET_PAYLOAD + PAYLOAD_LEN].copy_from_slice(&payload);
        raw[FRAME_LEN - 1] = FRAME_TAIL;
        raw
    }

    #[test]
    fn decodes_header_fields() {
        let raw = frame_with_payload([0; PAYLOAD_LEN], 0);
        let sample = decode(&raw).unwrap();
        assert_eq!(sample.timestamp, 123_456);
        assert_eq!(sample.sequence_index, 7);
        assert_eq!(sample.frame_id, RAW_DATA_FRAME_ID);
        assert_eq!(sample.active_channels, 0xFF);
    }

    #[test]
    fn sign_extends_24_bit_values() {
        let mut payload = [0u8; PAYLOAD_LEN];
        payload[0..3].copy_from_slice(&[0x7F, 0xFF, 0xFF]);
        payload[3..6].copy_from_slice(&[0xFF, 0xFF, 0xFF]);
        payload[6..9].copy_from_slice(&[0x80, 0x00, 0x00]);
        payload[9..12].copy_from_slice(&[0x00, 0x00, 0x01]);

        let channels = decode(&frame_with_payload(payload, 0)).unwrap().channels;
        assert_eq!(channels[0], 8_388_607);
        assert_eq!(channels[1], -1);
        assert_eq!(channels[2], CHANNEL_MIN);
        assert_eq!(channels[3], 1);
        assert_eq!(channels[4..], [0; 4]);
    }

    #[test]
    fn alert_bits_are_lsb_first() {
        let flags = decode_alerts(0b1010_1010).map(u8::from);
        assert_eq!(flags, [0, 1, 0, 1, 0, 1, 0, 1]);
        assert!(decode_alerts(0x01)[0]);
        assert_eq!(encode_alerts(&decode_alerts(0x5C)), 0x5C);
    }

    #[test]
    fn payload_survives_decode_encode() {
        let payloads: [[u8; PAYLOAD_LEN]; 3] = [
            std::array::from_fn(|i| i as u8 * 11),
            [0xFF; PAYLOAD_LEN],
            std::array::from_fn(|i| if i % 3 == 0 { 0x80 } else { 0x00 }),
        ];
        for payload in payloads {
            let sample = decode(&frame_with_payload(payload, 0)).unwrap();
            assert_eq!(encode_channels(&sample.channels), payload);
        }
    }

    #[test]
    fn rejects_bad_framing() {
        let good = frame_with_payload([0; PAYLOAD_LEN], 0);

        assert_eq!(
            decode(&good[..37]),
            Err(FrameError::WrongLength {
                expected: 38,
                actual: 37
            })
        );

        let mut bad_head = good;
        bad_head[0] = 0xAB;
        assert_eq!(decode(&bad_head), Err(FrameError::BadHead(0xAB)));

        let mut bad_tail = good;
        bad_tail[FRAME_LEN - 1] = 0x00;
        assert_eq!(decode(&bad_tail), Err(FrameError::BadTail(0x00)));
    }

    #[test]
    fn encode_matches_decode() {
        let sample = DecodedSample {
            timestamp: 9_876_543_210,
            channels: [CHANNEL_MAX, CHANNEL_MIN, -1, 0, 1, 42, -42, 1_000_000],
            alerts: [true, false, false, true, false, false, false, true],
            frame_id: RAW_DATA_FRAME_ID,
            sequence_index: 255,
            active_channels: 0x0F,
        };
        assert_eq!(decode(&encode(&sample)).unwrap(), sample);
    }

    #[test]
    fn in_order_indices_are_in_sequence() {
        let monitor = SequenceMonitor::new();
        for index in [5, 6, 7, 8] {
            assert!(monitor.check(index));
        }
        assert_eq!(monitor.expected(), Some(9));
    }

    #[test]
    fn gap_is_reported_and_expectation_follows() {
        let monitor = SequenceMonitor::new();
        assert!(monitor.check(5));
        assert!(!monitor.check(7));
        assert_eq!(monitor.expected(), Some(8));
        assert!(monitor.check(8));
    }

    #[test]
    fn counter_wraps_at_256() {
        let monitor = SequenceMonitor::new();
        assert!(monitor.check(254));
        assert_eq!(monitor.expected(), Some(255));
        assert!(monitor.check(255));
        assert_eq!(monitor.expected(), Some(0));
        assert!(monitor.check(0));
    }

    #[test]
    fn reset_reseeds() {
        let monitor = SequenceMonitor::new();
        assert_eq!(monitor.expected(), None);
        monitor.check(10);
        monitor.reset();
        assert!(monitor.check(200));
    }
}
