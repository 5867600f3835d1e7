//! Session configuration for the acquisition board.
//!
//! [`DeviceConfig`] is what the caller writes (usually in a TOML session file).
//! It is never sent to the device directly: [`DeviceConfig::validate`] turns it
//! into [`DaqSettings`], whose fields can only hold values the firmware
//! accepts. The command layer only takes `DaqSettings`, so an invalid field
//! aborts the whole configuration before the first register write.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, Result};
use crate::frame::CHANNELS;

/// Link name that asks for USB auto-discovery instead of a fixed port.
pub const AUTO_LINK: &str = "AUTOCOM";

/// Upper bound the firmware accepts for the ADC output data rate.
pub const MAX_SAMPLING_RATE_SPS: u32 = 160_000;

// ============================================================================
// Caller-facing configuration
// ============================================================================

/// Configuration of one acquisition session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial port path, or `"AUTOCOM"` to look the board up by USB VID/PID.
    #[serde(default = "default_link")]
    pub link: String,
    /// Total duration of the measurement in seconds.
    #[serde(default)]
    pub measure_duration_s: u64,
    /// Gain of the ADC's programmable gain amplifier (1, 2, 4 or 8).
    pub adc_pga_gain: u8,
    /// Channel `i` is acquired when `channel_mask[i]` is set.
    pub channel_mask: [bool; CHANNELS],
    /// SDO driver strength code: 0 normal, 1 strong, 2 weak, 3 extreme.
    pub sdo_driver_strength: u8,
    /// ADC output data rate in samples per second.
    pub adc_sampling_rate: u32,
    #[serde(default)]
    pub test_mode_enabled: bool,
    #[serde(default = "default_true")]
    pub adc_power_mode_high: bool,
    /// Error header instead of CRC header in the ADC frames.
    #[serde(default)]
    pub error_header: bool,
    /// Drive the reference electrode shield instead of tying it to ground.
    #[serde(default)]
    pub reference_active_shielding: bool,
    /// Target gain of the instrumentation amplifier, applied to every channel.
    pub gain_instrument_amplifier: f64,
}

fn default_link() -> String {
    AUTO_LINK.to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            link: default_link(),
            measure_duration_s: 10,
            adc_pga_gain: 1,
            channel_mask: [true; CHANNELS],
            sdo_driver_strength: 3,
            adc_sampling_rate: 1000,
            test_mode_enabled: false,
            adc_power_mode_high: true,
            error_header: false,
            reference_active_shielding: false,
            gain_instrument_amplifier: 2.0,
        }
    }
}

impl DeviceConfig {
    /// Check every enumerated field and produce the register values.
    pub fn validate(&self) -> std::result::Result<DaqSettings, ConfigError> {
        let pga_gain = PgaGain::from_u8_checked(self.adc_pga_gain)?;
        let driver_strength = DriverStrength::from_u8_checked(self.sdo_driver_strength)?;
        if self.adc_sampling_rate > MAX_SAMPLING_RATE_SPS {
            return Err(ConfigError::SamplingRate(self.adc_sampling_rate));
        }
        // The command payload is two bytes wide.
        let sampling_rate = u16::try_from(self.adc_sampling_rate)
            .map_err(|_| ConfigError::SamplingRateNotEncodable(self.adc_sampling_rate))?;
        let gain = self.gain_instrument_amplifier;
        if gain.is_nan() || gain < 1.0 {
            return Err(ConfigError::AmplifierGain(gain));
        }

        Ok(DaqSettings {
            pga_gain,
            channel_mask: pack_channel_mask(&self.channel_mask),
            driver_strength,
            sampling_rate,
            test_mode: self.test_mode_enabled,
            power_mode_high: self.adc_power_mode_high,
            error_header: self.error_header,
            reference_active_shielding: self.reference_active_shielding,
        })
    }

    /// Number of channels enabled in the mask.
    pub fn active_channel_count(&self) -> usize {
        self.channel_mask.iter().filter(|&&on| on).count()
    }
}

/// Bit `i` set when channel `i` is enabled.
pub fn pack_channel_mask(mask: &[bool; CHANNELS]) -> u8 {
    mask.iter()
        .enumerate()
        .fold(0u8, |acc, (idx, &on)| acc | ((on as u8) << idx))
}

/// Free-form description of the measurement context. Stored, never checked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(default)]
    pub waveform_generator: String,
    #[serde(default)]
    pub waveform_generator_frequency: String,
    #[serde(default)]
    pub waveform_generator_amplitude: String,
    #[serde(default)]
    pub waveform_type: String,
}

/// Contents of a session file: `[device]` and `[metadata]` tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub metadata: DeviceMetadata,
}

impl SessionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Source(e.to_string()).into())
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Source(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

// ============================================================================
// Validated register values
// ============================================================================

/// Programmable gain of the ADC front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PgaGain {
    #[default]
    X1 = 1,
    X2 = 2,
    X4 = 4,
    X8 = 8,
}

impl PgaGain {
    pub fn from_u8_checked(value: u8) -> std::result::Result<Self, ConfigError> {
        match value {
            1 => Ok(PgaGain::X1),
            2 => Ok(PgaGain::X2),
            4 => Ok(PgaGain::X4),
            8 => Ok(PgaGain::X8),
            _ => Err(ConfigError::PgaGain(value)),
        }
    }
}

/// Output driver strength of the ADC's serial data pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DriverStrength {
    Normal = 0,
    Strong = 1,
    Weak = 2,
    #[default]
    Extreme = 3,
}

impl DriverStrength {
    pub fn from_u8_checked(value: u8) -> std::result::Result<Self, ConfigError> {
        match value {
            0 => Ok(DriverStrength::Normal),
            1 => Ok(DriverStrength::Strong),
            2 => Ok(DriverStrength::Weak),
            3 => Ok(DriverStrength::Extreme),
            _ => Err(ConfigError::DriverStrength(value)),
        }
    }
}

/// Register values for `set_daq_settings`, all already in range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqSettings {
    pub pga_gain: PgaGain,
    pub channel_mask: u8,
    pub driver_strength: DriverStrength,
    pub sampling_rate: u16,
    pub test_mode: bool,
    pub power_mode_high: bool,
    pub error_header: bool,
    pub reference_active_shielding: bool,
}
