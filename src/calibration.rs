//! Instrumentation amplifier gain via the digital potentiometer.
//!
//! The amplifier gain is `1 + 19.8 kΩ / R`, where `R` is the potentiometer
//! resistance. The potentiometer has 256 steps of roughly 393 Ω on top of a
//! 130 Ω wiper resistance.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Gain-setting resistor constant of the amplifier, in Ω.
const GAIN_RESISTOR_OHM: f64 = 19.8e3;
/// Datasheet bounds of the potentiometer, in Ω.
const MIN_RESISTOR_OHM: f64 = 130.0;
const MAX_RESISTOR_OHM: f64 = 100e3;
const WIPER_RESISTOR_OHM: f64 = 130.0;
/// Step size used to pick the wiper position.
const STEP_SELECT_OHM: f64 = 391.0;
/// Step size used to predict the resulting resistance.
const STEP_ACTUAL_OHM: f64 = 393.0;

/// Potentiometer setting derived from a requested gain. Persisted with the recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PotiConfig {
    pub gain: f64,
    pub calculated_resistor_value: f64,
    pub poti_value: u8,
    pub actual_resistor_value: f64,
    pub actual_gain_value: f64,
}

impl PotiConfig {
    pub fn for_gain(gain: f64) -> Result<Self, ConfigError> {
        let calculated_resistor_value = required_resistor_for_gain(gain)?;
        let (poti_value, actual_resistor_value) = poti_value_for_resistor(calculated_resistor_value);
        Ok(Self {
            gain,
            calculated_resistor_value,
            poti_value,
            actual_resistor_value,
            actual_gain_value: gain_for_resistor(actual_resistor_value),
        })
    }
}

/// Resistance needed for `gain`, clamped to what the potentiometer can reach.
pub fn required_resistor_for_gain(gain: f64) -> Result<f64, ConfigError> {
    if gain.is_nan() || gain < 1.0 {
        return Err(ConfigError::AmplifierGain(gain));
    }
    let resistor = if gain == 1.0 {
        MAX_RESISTOR_OHM
    } else {
        GAIN_RESISTOR_OHM / (gain - 1.0)
    };

    if resistor > MAX_RESISTOR_OHM {
        warn!(
            "potentiometer resistance {:.0} Ω above {:.0} Ω, clamping",
            resistor, MAX_RESISTOR_OHM
        );
        Ok(MAX_RESISTOR_OHM)
    } else if resistor < MIN_RESISTOR_OHM {
        warn!(
            "potentiometer resistance {:.1} Ω below {:.0} Ω, clamping",
            resistor, MIN_RESISTOR_OHM
        );
        Ok(MIN_RESISTOR_OHM)
    } else {
        Ok(resistor)
    }
}

/// Wiper position for `resistor` and the resistance it actually yields.
pub fn poti_value_for_resistor(resistor: f64) -> (u8, f64) {
    let steps = 255.0 - (resistor - WIPER_RESISTOR_OHM) / STEP_SELECT_OHM;
    let poti_value = steps.trunc().clamp(0.0, 255.0) as u8;
    let actual = f64::from(poti_value) * STEP_ACTUAL_OHM + WIPER_RESISTOR_OHM;
    (poti_value, actual)
}

pub fn gain_for_resistor(resistor: f64) -> f64 {
    1.0 + GAIN_RESISTOR_OHM / resistor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_one_uses_maximum_resistance() {
        assert_eq!(required_resistor_for_gain(1.0).unwrap(), MAX_RESISTOR_OHM);
    }

    #[test]
    fn gain_two_resistor_and_poti() {
        let poti = PotiConfig::for_gain(2.0).unwrap();
        assert_eq!(poti.calculated_resistor_value, 19_800.0);
        // 255 - (19800 - 130) / 391 = 204.69...
        assert_eq!(poti.poti_value, 204);
        assert_eq!(poti.actual_resistor_value, 204.0 * 393.0 + 130.0);
        assert!((poti.actual_gain_value - (1.0 + 19_800.0 / 80_302.0)).abs() < 1e-12);
    }

    #[test]
    fn huge_gain_clamps_to_minimum() {
        assert_eq!(required_resistor_for_gain(1e6).unwrap(), MIN_RESISTOR_OHM);
        let (poti, actual) = poti_value_for_resistor(MIN_RESISTOR_OHM);
        assert_eq!(poti, 255);
        assert_eq!(actual, 255.0 * 393.0 + 130.0);
    }

    #[test]
    fn gain_below_one_is_rejected() {
        assert_eq!(
            required_resistor_for_gain(0.9),
            Err(ConfigError::AmplifierGain(0.9))
        );
        assert!(PotiConfig::for_gain(f64::NAN).is_err());
    }
}
