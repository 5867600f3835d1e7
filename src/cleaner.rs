//! Post-processing of recorded measurements.
//!
//! Both passes work on each channel (column) independently and leave clean
//! data untouched.

use log::{debug, warn};

use crate::errors::CleanerError;
use crate::frame::CHANNELS;

pub const DEFAULT_WINDOW: usize = 5;
pub const DEFAULT_THRESHOLD: i64 = 25;

/// A flagged run that could not be interpolated because it touches an end
/// of the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnboundedRun {
    pub channel: usize,
    pub start: usize,
    pub len: usize,
}

/// Outcome of [`interpolate_flagged`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapReport {
    /// Runs replaced by interpolation.
    pub interpolated_runs: usize,
    /// Samples replaced by interpolation.
    pub interpolated_samples: usize,
    pub unbounded: Vec<UnboundedRun>,
}

/// Centered rolling median of `series`. Positions closer than `window / 2`
/// to either end have no median.
pub fn rolling_median(series: &[i32], window: usize) -> Vec<Option<i32>> {
    let half = window / 2;
    let mut medians = vec![None; series.len()];
    if window == 0 || series.len() < window {
        return medians;
    }
    let mut scratch = Vec::with_capacity(window);
    for center in half..series.len() - half {
        scratch.clear();
        scratch.extend_from_slice(&series[center - half..=center + half]);
        let (_, median, _) = scratch.select_nth_unstable(half);
        medians[center] = Some(*median);
    }
    medians
}

/// Replace samples whose distance from the rolling median exceeds
/// `threshold`. Returns how many samples were replaced.
fn replace_outliers(series: &mut [i32], window: usize, threshold: i64) -> usize {
    let medians = rolling_median(series, window);
    let mut replaced = 0;
    for (value, median) in series.iter_mut().zip(medians) {
        if let Some(median) = median {
            if (i64::from(*value) - i64::from(median)).abs() > threshold {
                *value = median;
                replaced += 1;
            }
        }
    }
    replaced
}

/// Two-pass rolling-median outlier suppression over every channel.
///
/// The second pass recomputes the median on the already corrected series.
/// Returns the number of replaced samples.
pub fn suppress_outliers(
    measurements: &mut [[i32; CHANNELS]],
    window: usize,
    threshold: i64,
) -> Result<usize, CleanerError> {
    if window % 2 == 0 {
        return Err(CleanerError::EvenWindow(window));
    }

    let mut total = 0;
    let mut column = Vec::with_capacity(measurements.len());
    for ch in 0..CHANNELS {
        column.clear();
        column.extend(measurements.iter().map(|row| row[ch]));

        let first = replace_outliers(&mut column, window, threshold);
        let second = replace_outliers(&mut column, window, threshold);
        if first + second > 0 {
            debug!("channel {ch}: {first} outliers in pass 1, {second} in pass 2");
        }
        total += first + second;

        for (row, value) in measurements.iter_mut().zip(&column) {
            row[ch] = *value;
        }
    }
    Ok(total)
}

/// Replace every flagged run bounded by unflagged samples with a linear
/// interpolation between its neighbours. Runs touching either end are left
/// as they are and listed in the report.
pub fn interpolate_flagged(
    measurements: &mut [[i32; CHANNELS]],
    alerts: &[[i8; CHANNELS]],
) -> Result<GapReport, CleanerError> {
    if measurements.len() != alerts.len() {
        return Err(CleanerError::ShapeMismatch {
            measurements: measurements.len(),
            alerts: alerts.len(),
        });
    }

    let n = measurements.len();
    let mut report = GapReport::default();
    for ch in 0..CHANNELS {
        let mut i = 0;
        while i < n {
            if alerts[i][ch] == 0 {
                i += 1;
                continue;
            }
            let start = i;
            while i < n && alerts[i][ch] != 0 {
                i += 1;
            }
            let len = i - start;

            if start == 0 || i == n {
                warn!("channel {ch}: flagged run at {start}..{i} touches the recording edge, left as is");
                report.unbounded.push(UnboundedRun {
                    channel: ch,
                    start,
                    len,
                });
                continue;
            }

            let lower = f64::from(measurements[start - 1][ch]);
            let upper = f64::from(measurements[i][ch]);
            let step = (upper - lower) / (len + 1) as f64;
            for j in 1..=len {
                // Truncates toward zero.
                measurements[start + j - 1][ch] = (lower + step * j as f64) as i32;
            }
            report.interpolated_runs += 1;
            report.interpolated_samples += len;
        }
    }
    Ok(report)
}

/// Convert absolute device timestamps into seconds since the first one.
/// `scale` is the number of timestamp ticks per second.
pub fn elapsed_seconds(timestamps: &[i64], scale: f64) -> Vec<f64> {
    let Some(&first) = timestamps.first() else {
        return Vec::new();
    };
    timestamps
        .iter()
        .map(|&t| (t - first) as f64 / scale)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_channel(values: &[i32]) -> Vec<[i32; CHANNELS]> {
        values.iter().map(|&v| [v; CHANNELS]).collect()
    }

    fn column(rows: &[[i32; CHANNELS]], ch: usize) -> Vec<i32> {
        rows.iter().map(|r| r[ch]).collect()
    }

    fn flags(values: &[i8]) -> Vec<[i8; CHANNELS]> {
        values.iter().map(|&v| [v; CHANNELS]).collect()
    }

    #[test]
    fn rolling_median_leaves_edges_undefined() {
        let medians = rolling_median(&[1, 9, 2, 8, 3], 3);
        assert_eq!(medians, vec![None, Some(2), Some(8), Some(3), None]);
        assert!(rolling_median(&[1, 2], 5).iter().all(Option::is_none));
    }

    #[test]
    fn spike_is_replaced_by_median() {
        let mut rows = single_channel(&[10, 10, 10, 10, 100, 10, 10, 10, 10, 10]);
        let replaced = suppress_outliers(&mut rows, 5, 25).unwrap();
        assert_eq!(column(&rows, 0), vec![10; 10]);
        assert_eq!(replaced, CHANNELS);
    }

    #[test]
    fn edge_samples_are_never_flagged() {
        let mut rows = single_channel(&[500, 10, 10, 10, 10, 10, -500]);
        assert_eq!(suppress_outliers(&mut rows, 5, 25).unwrap(), 0);
        assert_eq!(column(&rows, 0), vec![500, 10, 10, 10, 10, 10, -500]);
    }

    #[test]
    fn threshold_is_strict() {
        let mut rows = single_channel(&[0, 0, 0, 25, 0, 0, 0]);
        assert_eq!(suppress_outliers(&mut rows, 3, 25).unwrap(), 0);
        let mut rows = single_channel(&[0, 0, 0, 26, 0, 0, 0]);
        assert_eq!(suppress_outliers(&mut rows, 3, 25).unwrap(), CHANNELS);
    }

    #[test]
    fn clean_data_is_untouched() {
        let original = single_channel(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut rows = original.clone();
        suppress_outliers(&mut rows, 5, 25).unwrap();
        assert_eq!(rows, original);
    }

    #[test]
    fn even_window_is_rejected() {
        let mut rows = single_channel(&[1, 2, 3, 4]);
        assert_eq!(
            suppress_outliers(&mut rows, 4, 25),
            Err(CleanerError::EvenWindow(4))
        );
    }

    #[test]
    fn flagged_sample_is_interpolated() {
        let mut rows = single_channel(&[41, 47, 43, 44]);
        let report = interpolate_flagged(&mut rows, &flags(&[0, 1, 0, 0])).unwrap();
        assert_eq!(column(&rows, 0), vec![41, 42, 43, 44]);
        assert_eq!(report.interpolated_runs, CHANNELS);
        assert!(report.unbounded.is_empty());
    }

    #[test]
    fn longer_run_is_spread_evenly() {
        let mut rows = single_channel(&[0, 99, 99, 99, 40]);
        interpolate_flagged(&mut rows, &flags(&[0, 1, 1, 1, 0])).unwrap();
        assert_eq!(column(&rows, 0), vec![0, 10, 20, 30, 40]);
    }

    #[test]
    fn interpolated_values_truncate_toward_zero() {
        let mut rows = single_channel(&[-5, 100, 0]);
        interpolate_flagged(&mut rows, &flags(&[0, 1, 0])).unwrap();
        assert_eq!(column(&rows, 0), vec![-5, -2, 0]);
    }

    #[test]
    fn runs_touching_the_edges_are_left_alone() {
        let mut rows = single_channel(&[7, 8, 3, 4, 9]);
        let report = interpolate_flagged(&mut rows, &flags(&[1, 1, 0, 0, 1])).unwrap();
        assert_eq!(column(&rows, 0), vec![7, 8, 3, 4, 9]);
        assert_eq!(report.interpolated_runs, 0);
        assert_eq!(report.unbounded.len(), 2 * CHANNELS);
        assert_eq!(
            report.unbounded[0],
            UnboundedRun {
                channel: 0,
                start: 0,
                len: 2
            }
        );
        assert_eq!(
            report.unbounded[1],
            UnboundedRun {
                channel: 0,
                start: 4,
                len: 1
            }
        );
    }

    #[test]
    fn channels_are_handled_independently() {
        let mut rows = vec![[5; CHANNELS], [50; CHANNELS], [7; CHANNELS]];
        let mut alerts = vec![[0i8; CHANNELS]; 3];
        alerts[1][3] = 1;
        interpolate_flagged(&mut rows, &alerts).unwrap();
        assert_eq!(rows[1][3], 6);
        assert_eq!(rows[1][2], 50);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut rows = single_channel(&[1, 2]);
        assert_eq!(
            interpolate_flagged(&mut rows, &flags(&[0])),
            Err(CleanerError::ShapeMismatch {
                measurements: 2,
                alerts: 1
            })
        );
    }

    #[test]
    fn elapsed_seconds_starts_at_zero() {
        let seconds = elapsed_seconds(&[1_000_000, 1_500_000, 3_000_000], 1e6);
        assert_eq!(seconds, vec![0.0, 0.5, 2.0]);
        assert!(elapsed_seconds(&[], 1e6).is_empty());
    }
}
