//! Command protocol of the acquisition board.
//!
//! This module maps the board's named operations onto [`CommandTransport`]
//! exchanges and decodes the typed responses.
//!
//! # Device state machine
//!
//! The board reports one of `ERROR`, `RESET`, `INIT`, `IDLE`, `TEST` or `DAQ`.
//! Streaming frames are only produced in `DAQ`. `start_daq` is legal from
//! `IDLE`/`TEST`, `stop_daq` from `DAQ`. Both are fire-and-forget and
//! nothing checks the preconditions; query [`DaqDevice::get_system_state`]
//! when the transition has to be confirmed.
//!
//! **Important timing considerations:**
//! - `do_reset` leaves the board unresponsive for a few seconds
//! - start/stop take effect eventually, not when the call returns
//! - Every with-feedback exchange blocks for at most the link timeout

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info};
use serde::Serialize;

use crate::config::{DaqSettings, DriverStrength, PgaGain};
use crate::errors::{ProtocolError, Result};
use crate::frame::{CHANNELS, FRAME_HEAD, FRAME_TAIL};
use crate::transport::{CommandTransport, Link, DATA_BYTES};

// ============================================================================
// Constants
// ============================================================================

/// Time the board needs after a software reset before it answers again.
pub const RESET_SETTLE: Duration = Duration::from_secs(4);

/// Length of the error-register response: head + 17 registers + tail.
pub const ERROR_REGISTER_LEN: usize = 19;

/// Length of the runtime response: head + 8-byte microsecond counter.
const RUNTIME_RESPONSE_LEN: usize = 9;

// Board protocol opcodes (head byte)
pub const CMD_ECHO: u8 = 0;
pub const CMD_RESET: u8 = 1;
pub const CMD_SYSTEM_CLOCK: u8 = 2;
pub const CMD_SYSTEM_STATE: u8 = 3;
pub const CMD_PIN_STATE: u8 = 4;
pub const CMD_RUNTIME: u8 = 5;
pub const CMD_FIRMWARE: u8 = 6;
pub const CMD_LED_ENABLE: u8 = 7;
pub const CMD_LED_DISABLE: u8 = 8;
pub const CMD_LED_TOGGLE: u8 = 9;
pub const CMD_ERROR_REGISTER: u8 = 10;
pub const CMD_START_DAQ: u8 = 11;
pub const CMD_STOP_DAQ: u8 = 12;
pub const CMD_UPDATE_REGISTERS: u8 = 13;
pub const CMD_PGA_GAIN: u8 = 14;
pub const CMD_CHANNEL_MASK: u8 = 15;
pub const CMD_SDO_DRIVER: u8 = 16;
pub const CMD_SAMPLING_RATE: u8 = 17;
pub const CMD_TEST_MODE: u8 = 18;
pub const CMD_POWER_MODE: u8 = 19;
pub const CMD_HEADER_TYPE: u8 = 20;
pub const CMD_REF_SHIELDING: u8 = 21;
pub const CMD_POTI: u8 = 22;

// ============================================================================
// Data Types
// ============================================================================

/// Operating mode reported by the board, ordinal-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SystemState {
    Error = 0,
    Reset = 1,
    Init = 2,
    Idle = 3,
    Test = 4,
    Daq = 5,
}

impl SystemState {
    pub fn from_ordinal(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0 => Ok(SystemState::Error),
            1 => Ok(SystemState::Reset),
            2 => Ok(SystemState::Init),
            3 => Ok(SystemState::Idle),
            4 => Ok(SystemState::Test),
            5 => Ok(SystemState::Daq),
            _ => Err(ProtocolError::InvalidSystemState(value)),
        }
    }

    /// `start_daq` is only meaningful from these states.
    pub fn can_start_daq(self) -> bool {
        matches!(self, SystemState::Idle | SystemState::Test)
    }

    pub fn can_stop_daq(self) -> bool {
        self == SystemState::Daq
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SystemState::Error => "ERROR",
            SystemState::Reset => "RESET",
            SystemState::Init => "INIT",
            SystemState::Idle => "IDLE",
            SystemState::Test => "TEST",
            SystemState::Daq => "DAQ",
        };
        f.write_str(name)
    }
}

/// State of the board's user pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PinState {
    None,
    LedUser,
}

impl PinState {
    pub fn from_byte(value: u8) -> Self {
        if value == 0 {
            PinState::None
        } else {
            PinState::LedUser
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Snapshot of the ADC error registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ErrorRegisterData {
    /// Per-channel ADC error status, channel 0..7.
    pub channel_error_status: [u8; CHANNELS],
    /// DSP error registers of channel pairs 0/1, 2/3, 4/5, 6/7.
    pub dsp_error: [u8; 4],
    pub general_error_1: u8,
    pub general_error_2: u8,
    pub error_status_1: u8,
    pub error_status_2: u8,
    pub error_status_3: u8,
}

impl ErrorRegisterData {
    /// Parse the 19-byte register packet, checking its head/tail sentinels.
    pub fn from_packet(packet: &[u8]) -> std::result::Result<Self, ProtocolError> {
        if packet.len() != ERROR_REGISTER_LEN {
            return Err(ProtocolError::ShortResponse {
                expected: ERROR_REGISTER_LEN,
                actual: packet.len(),
            });
        }
        let head = packet[0];
        let tail = packet[ERROR_REGISTER_LEN - 1];
        if head != FRAME_HEAD || tail != FRAME_TAIL {
            return Err(ProtocolError::BadRegisterFraming { head, tail });
        }

        let regs = &packet[1..ERROR_REGISTER_LEN - 1];
        let mut channel_error_status = [0u8; CHANNELS];
        channel_error_status.copy_from_slice(&regs[0..8]);
        let mut dsp_error = [0u8; 4];
        dsp_error.copy_from_slice(&regs[8..12]);

        Ok(Self {
            channel_error_status,
            dsp_error,
            general_error_1: regs[12],
            general_error_2: regs[13],
            error_status_1: regs[14],
            error_status_2: regs[15],
            error_status_3: regs[16],
        })
    }

    /// True when any register reports a non-zero value.
    pub fn has_errors(&self) -> bool {
        self.channel_error_status.iter().any(|&r| r != 0)
            || self.dsp_error.iter().any(|&r| r != 0)
            || [
                self.general_error_1,
                self.general_error_2,
                self.error_status_1,
                self.error_status_2,
                self.error_status_3,
            ]
            .iter()
            .any(|&r| r != 0)
    }
}

// ============================================================================
// Device Driver
// ============================================================================

/// Command-side driver of the acquisition board.
///
/// # Example
/// ```ignore
/// let link = SerialLink::open("AUTOCOM")?;
/// let mut device = DaqDevice::new(Box::new(link));
///
/// println!("Firmware: {}", device.get_firmware_version()?);
/// device.set_daq_settings(&config.validate()?)?;
/// device.start_daq()?;
/// ```
pub struct DaqDevice {
    transport: CommandTransport,
    reset_settle: Duration,
}

impl DaqDevice {
    pub fn new(link: Box<dyn Link>) -> Self {
        Self {
            transport: CommandTransport::new(link),
            reset_settle: RESET_SETTLE,
        }
    }

    /// Override the post-reset settle delay.
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    /// Independent handle on the same link, for the streaming reader.
    pub fn stream_link(&self) -> std::io::Result<Box<dyn Link>> {
        self.transport.try_clone_link()
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Write the ADC settings and commit them with an update-registers command.
    pub fn set_daq_settings(&mut self, settings: &DaqSettings) -> Result<()> {
        self.set_pga_gain(settings.pga_gain)?;
        self.write(CMD_CHANNEL_MASK, u32::from(settings.channel_mask))?;
        self.set_sdo_driver_strength(settings.driver_strength)?;
        self.write(CMD_SAMPLING_RATE, u32::from(settings.sampling_rate))?;
        self.write_flag(CMD_TEST_MODE, settings.test_mode)?;
        self.write_flag(CMD_POWER_MODE, settings.power_mode_high)?;
        self.write_flag(CMD_HEADER_TYPE, settings.error_header)?;
        self.write(CMD_UPDATE_REGISTERS, 0)?;
        info!(
            "DAQ settings written: pga={:?}, mask={:#010b}, rate={} SPS, sdo={:?}",
            settings.pga_gain, settings.channel_mask, settings.sampling_rate, settings.driver_strength
        );
        Ok(())
    }

    /// Drive (or ground) the reference electrode shield.
    pub fn set_shielding_settings(&mut self, settings: &DaqSettings) -> Result<()> {
        self.write_flag(CMD_REF_SHIELDING, settings.reference_active_shielding)
    }

    /// Write the precomputed potentiometer position for all channels.
    pub fn set_gain_instrument_amplifier(&mut self, poti_value: u8) -> Result<()> {
        self.write(CMD_POTI, u32::from(poti_value))?;
        debug!("instrumentation amplifier potentiometer set to {}", poti_value);
        Ok(())
    }

    fn set_pga_gain(&mut self, gain: PgaGain) -> Result<()> {
        self.write(CMD_PGA_GAIN, gain as u32)
    }

    fn set_sdo_driver_strength(&mut self, strength: DriverStrength) -> Result<()> {
        self.write(CMD_SDO_DRIVER, strength as u32)
    }

    // ------------------------------------------------------------------------
    // Acquisition control
    // ------------------------------------------------------------------------

    pub fn start_daq(&mut self) -> Result<()> {
        self.write(CMD_START_DAQ, 0)
    }

    pub fn stop_daq(&mut self) -> Result<()> {
        self.write(CMD_STOP_DAQ, 0)
    }

    /// Software reset; blocks for the settle delay afterwards.
    pub fn do_reset(&mut self) -> Result<()> {
        self.write(CMD_RESET, 0)?;
        thread::sleep(self.reset_settle);
        Ok(())
    }

    pub fn enable_led(&mut self) -> Result<()> {
        self.write(CMD_LED_ENABLE, 0)
    }

    pub fn disable_led(&mut self) -> Result<()> {
        self.write(CMD_LED_DISABLE, 0)
    }

    pub fn toggle_led(&mut self) -> Result<()> {
        self.write(CMD_LED_TOGGLE, 0)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Read the ADC error registers.
    pub fn error_register(&mut self) -> Result<ErrorRegisterData> {
        self.write(CMD_ERROR_REGISTER, 0)?;
        let packet = self.transport.read(ERROR_REGISTER_LEN)?;
        debug!("error register raw data: {:02X?}", packet);
        Ok(ErrorRegisterData::from_packet(&packet)?)
    }

    pub fn get_system_clock_khz(&mut self) -> Result<u32> {
        let response = self.query(CMD_SYSTEM_CLOCK, 0, None)?;
        Ok(10 * le_uint(&response[1..]) as u32)
    }

    pub fn get_system_state(&mut self) -> Result<SystemState> {
        let response = self.query(CMD_SYSTEM_STATE, 0, None)?;
        Ok(SystemState::from_ordinal(last_byte(&response))?)
    }

    /// True while the board reports `DAQ`.
    pub fn is_daq_active(&mut self) -> Result<bool> {
        Ok(self.get_system_state()? == SystemState::Daq)
    }

    pub fn get_pin_state(&mut self) -> Result<PinState> {
        let response = self.query(CMD_PIN_STATE, 0, None)?;
        Ok(PinState::from_byte(last_byte(&response)))
    }

    /// Seconds since the last reset.
    pub fn get_runtime_sec(&mut self) -> Result<f64> {
        let response = self.query(CMD_RUNTIME, 0, Some(RUNTIME_RESPONSE_LEN))?;
        Ok(1e-6 * le_uint(&response[1..]) as f64)
    }

    pub fn get_firmware_version(&mut self) -> Result<FirmwareVersion> {
        let response = self.query(CMD_FIRMWARE, 0, None)?;
        Ok(FirmwareVersion {
            major: response[1],
            minor: response[2],
        })
    }

    /// Send text to the board and return what it echoes back.
    ///
    /// Text travels in two-byte chunks; an odd byte count is padded with one
    /// space, which is stripped from the reply.
    pub fn echo(&mut self, text: &str) -> Result<String> {
        let mut payload = text.as_bytes().to_vec();
        let padded = payload.len() % DATA_BYTES == 1;
        if padded {
            payload.push(b' ');
        }

        let mut reply = Vec::with_capacity(payload.len());
        for chunk in payload.chunks(DATA_BYTES) {
            let word = u16::from_be_bytes([chunk[0], chunk[1]]);
            let response = self.query(CMD_ECHO, u32::from(word), None)?;
            reply.extend_from_slice(&response[1..]);
        }
        if padded {
            reply.pop();
        }
        String::from_utf8(reply).map_err(|_| ProtocolError::InvalidUtf8.into())
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn write(&mut self, head: u8, data: u32) -> Result<()> {
        self.transport.write_without_feedback(head, data)
    }

    fn write_flag(&mut self, head: u8, enabled: bool) -> Result<()> {
        self.write(head, u32::from(enabled))
    }

    /// With-feedback exchange whose first response byte must echo `head`.
    fn query(&mut self, head: u8, data: u32, response_len: Option<usize>) -> Result<Vec<u8>> {
        let response = self.transport.write_with_feedback(head, data, response_len)?;
        if response[0] != head {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: head,
                actual: response[0],
            }
            .into());
        }
        Ok(response)
    }
}

/// Little-endian unsigned integer of up to 8 bytes.
fn le_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn last_byte(response: &[u8]) -> u8 {
    response.last().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::errors::DriverError;
    use crate::transport::testing::ScriptedLink;

    fn device() -> (DaqDevice, ScriptedLink) {
        let link = ScriptedLink::new();
        let device = DaqDevice::new(Box::new(link.clone())).with_reset_settle(Duration::ZERO);
        (device, link)
    }

    #[test]
    fn daq_settings_sequence_ends_with_commit() {
        let (mut dev, link) = device();
        let config = DeviceConfig {
            adc_pga_gain: 4,
            channel_mask: [true, true, false, false, false, false, false, true],
            sdo_driver_strength: 1,
            adc_sampling_rate: 2000,
            test_mode_enabled: true,
            adc_power_mode_high: false,
            error_header: true,
            ..Default::default()
        };
        dev.set_daq_settings(&config.validate().unwrap()).unwrap();

        assert_eq!(
            link.commands(),
            vec![
                (CMD_PGA_GAIN, 4),
                (CMD_CHANNEL_MASK, 0b1000_0011),
                (CMD_SDO_DRIVER, 1),
                (CMD_SAMPLING_RATE, 2000),
                (CMD_TEST_MODE, 1),
                (CMD_POWER_MODE, 0),
                (CMD_HEADER_TYPE, 1),
                (CMD_UPDATE_REGISTERS, 0),
            ]
        );
    }

    #[test]
    fn invalid_config_writes_nothing() {
        let (_dev, link) = device();
        let config = DeviceConfig {
            sdo_driver_strength: 9,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(link.written().is_empty());
    }

    #[test]
    fn shielding_and_poti_commands() {
        let (mut dev, link) = device();
        let settings = DeviceConfig {
            reference_active_shielding: true,
            ..Default::default()
        }
        .validate()
        .unwrap();
        dev.set_shielding_settings(&settings).unwrap();
        dev.set_gain_instrument_amplifier(204).unwrap();
        assert_eq!(link.commands(), vec![(CMD_REF_SHIELDING, 1), (CMD_POTI, 204)]);
    }

    #[test]
    fn start_stop_and_leds_are_fire_and_forget() {
        let (mut dev, link) = device();
        dev.start_daq().unwrap();
        dev.stop_daq().unwrap();
        dev.enable_led().unwrap();
        dev.disable_led().unwrap();
        dev.toggle_led().unwrap();
        dev.do_reset().unwrap();
        assert_eq!(link.written(), vec![0, 0, 11, 0, 0, 12, 0, 0, 7, 0, 0, 8, 0, 0, 9, 0, 0, 1]);
    }

    #[test]
    fn system_clock_is_scaled() {
        let (mut dev, link) = device();
        link.push_rx(&[CMD_SYSTEM_CLOCK, 0x2C, 0x01]);
        assert_eq!(dev.get_system_clock_khz().unwrap(), 3000);
    }

    #[test]
    fn runtime_reads_nine_bytes() {
        let (mut dev, link) = device();
        let mut response = vec![CMD_RUNTIME];
        response.extend_from_slice(&2_500_000u64.to_le_bytes());
        link.push_rx(&response);
        assert!((dev.get_runtime_sec().unwrap() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn firmware_version_is_major_minor() {
        let (mut dev, link) = device();
        link.push_rx(&[CMD_FIRMWARE, 1, 4]);
        let version = dev.get_firmware_version().unwrap();
        assert_eq!(version, FirmwareVersion { major: 1, minor: 4 });
        assert_eq!(version.to_string(), "1.4");
    }

    #[test]
    fn wrong_opcode_is_protocol_error() {
        let (mut dev, link) = device();
        link.push_rx(&[CMD_SYSTEM_CLOCK, 1, 4]);
        let err = dev.get_firmware_version().unwrap_err();
        assert!(matches!(
            err,
            DriverError::Protocol(ProtocolError::UnexpectedOpcode {
                expected: CMD_FIRMWARE,
                actual: CMD_SYSTEM_CLOCK
            })
        ));
    }

    #[test]
    fn system_and_pin_state_decode() {
        let (mut dev, link) = device();
        link.push_rx(&[CMD_SYSTEM_STATE, 0, 5]);
        assert_eq!(dev.get_system_state().unwrap(), SystemState::Daq);
        link.push_rx(&[CMD_SYSTEM_STATE, 0, 3]);
        assert!(!dev.is_daq_active().unwrap());
        link.push_rx(&[CMD_PIN_STATE, 0, 0]);
        assert_eq!(dev.get_pin_state().unwrap(), PinState::None);
        link.push_rx(&[CMD_PIN_STATE, 0, 2]);
        assert_eq!(dev.get_pin_state().unwrap(), PinState::LedUser);
    }

    #[test]
    fn out_of_range_state_is_fatal() {
        let (mut dev, link) = device();
        link.push_rx(&[CMD_SYSTEM_STATE, 0, 6]);
        assert!(matches!(
            dev.get_system_state(),
            Err(DriverError::Protocol(ProtocolError::InvalidSystemState(6)))
        ));
    }

    #[test]
    fn state_transitions() {
        assert!(SystemState::Idle.can_start_daq());
        assert!(SystemState::Test.can_start_daq());
        assert!(!SystemState::Init.can_start_daq());
        assert!(SystemState::Daq.can_stop_daq());
        assert!(!SystemState::Idle.can_stop_daq());
        assert_eq!(SystemState::Reset.to_string(), "RESET");
    }

    #[test]
    fn error_register_parses_fields_in_order() {
        let (mut dev, link) = device();
        let mut packet = vec![FRAME_HEAD];
        packet.extend(1..=17u8);
        packet.push(FRAME_TAIL);
        link.push_rx(&packet);

        let regs = dev.error_register().unwrap();
        assert_eq!(regs.channel_error_status, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(regs.dsp_error, [9, 10, 11, 12]);
        assert_eq!(regs.general_error_1, 13);
        assert_eq!(regs.general_error_2, 14);
        assert_eq!(regs.error_status_1, 15);
        assert_eq!(regs.error_status_2, 16);
        assert_eq!(regs.error_status_3, 17);
        assert!(regs.has_errors());
        assert_eq!(link.commands(), vec![(CMD_ERROR_REGISTER, 0)]);
    }

    #[test]
    fn error_register_framing_is_checked() {
        let (mut dev, link) = device();
        let mut packet = vec![0xAB];
        packet.extend([0u8; 17]);
        packet.push(FRAME_TAIL);
        link.push_rx(&packet);
        assert!(matches!(
            dev.error_register(),
            Err(DriverError::Protocol(ProtocolError::BadRegisterFraming {
                head: 0xAB,
                tail: FRAME_TAIL
            }))
        ));
        assert!(!ErrorRegisterData::default().has_errors());
    }

    #[test]
    fn echo_pads_odd_length() {
        let (mut dev, link) = device();
        link.push_rx(&[CMD_ECHO, b'a', b'b']);
        link.push_rx(&[CMD_ECHO, b'c', b' ']);
        assert_eq!(dev.echo("abc").unwrap(), "abc");

        // "ab" -> 0x6162 sent little-endian, then "c " -> 0x6320.
        assert_eq!(link.written(), vec![0x62, 0x61, 0, 0x20, 0x63, 0]);
    }

    #[test]
    fn echo_rejects_bad_reply_head() {
        let (mut dev, link) = device();
        link.push_rx(&[0x01, b'h', b'i']);
        assert!(dev.echo("hi").is_err());
    }
}
