//! Growable on-disk (or in-memory) recordings.
//!
//! A recording holds three parallel, append-only sequences (timestamps,
//! 8-channel measurements, 8-channel alert flags) plus attributes written
//! once at creation. The acquisition writer owns the store for the whole
//! session and closes it exactly once; `close` consumes the store so a second
//! close cannot be expressed.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::calibration::PotiConfig;
use crate::config::{DeviceConfig, DeviceMetadata};
use crate::errors::{DriverError, Result};
use crate::frame::CHANNELS;

/// Format version written into every recording.
pub const RECORDING_VERSION: &str = "2.0";

/// Numbered variants tried when a recording name is already taken.
const MAX_NAME_SUFFIX: u32 = 999;

/// Deterministic recording name for a session started at `start`.
pub fn recording_name(start: DateTime<Local>) -> String {
    start.format("measurement_%Y%m%d_%H%M%S").to_string()
}

// ============================================================================
// Data Types
// ============================================================================

/// Static attributes of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetAttributes {
    pub recording_name: String,
    pub created_at: DateTime<Local>,
    pub version: String,
    pub config: DeviceConfig,
    pub metadata: DeviceMetadata,
    pub calibration: PotiConfig,
}

impl DatasetAttributes {
    pub fn new(
        recording_name: impl Into<String>,
        config: &DeviceConfig,
        metadata: &DeviceMetadata,
        calibration: &PotiConfig,
    ) -> Self {
        Self {
            recording_name: recording_name.into(),
            created_at: Local::now(),
            version: RECORDING_VERSION.to_string(),
            config: config.clone(),
            metadata: metadata.clone(),
            calibration: *calibration,
        }
    }
}

/// The three parallel sequences of a recording.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedData {
    pub timestamps: Vec<i64>,
    pub measurements: Vec<[i32; CHANNELS]>,
    pub alerts: Vec<[i8; CHANNELS]>,
}

impl RecordedData {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    fn extend(
        &mut self,
        timestamps: &[i64],
        measurements: &[[i32; CHANNELS]],
        alerts: &[[i8; CHANNELS]],
    ) {
        self.timestamps.extend_from_slice(timestamps);
        self.measurements.extend_from_slice(measurements);
        self.alerts.extend_from_slice(alerts);
    }
}

/// A recording read back from disk.
#[derive(Debug, Clone)]
pub struct Recording {
    pub attributes: Option<DatasetAttributes>,
    pub data: RecordedData,
}

// ============================================================================
// Store abstraction
// ============================================================================

/// Append-only recording target.
pub trait DatasetStore: Send {
    /// Grow all three sequences by one chunk. Slices must have equal length.
    fn append(
        &mut self,
        timestamps: &[i64],
        measurements: &[[i32; CHANNELS]],
        alerts: &[[i8; CHANNELS]],
    ) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Flush and release the store.
    fn close(self: Box<Self>) -> Result<()>;

    /// Name the recording was stored under. May differ from the requested
    /// one when that was already taken.
    fn recording_name(&self) -> &str;

    /// Rows written so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates one store per acquisition session.
pub trait DatasetFactory: Send {
    fn create(&self, attributes: &DatasetAttributes) -> Result<Box<dyn DatasetStore>>;
}

fn check_chunk(
    timestamps: &[i64],
    measurements: &[[i32; CHANNELS]],
    alerts: &[[i8; CHANNELS]],
) -> Result<()> {
    if timestamps.len() != measurements.len() || timestamps.len() != alerts.len() {
        return Err(DriverError::Storage(format!(
            "chunk shape mismatch: {} timestamps, {} measurements, {} alerts",
            timestamps.len(),
            measurements.len(),
            alerts.len()
        )));
    }
    Ok(())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Everything a [`MemoryDataset`] has seen, for inspection.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecording {
    pub attributes: Option<DatasetAttributes>,
    pub data: RecordedData,
    /// Number of rows present at each flush, in order.
    pub flush_points: Vec<usize>,
    /// Number of appended chunks.
    pub appends: usize,
    pub close_count: usize,
}

/// Factory whose stores write into a shared [`MemoryRecording`].
#[derive(Clone, Default)]
pub struct MemoryDatasetFactory {
    recording: Arc<Mutex<MemoryRecording>>,
}

impl MemoryDatasetFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the most recent recording.
    pub fn recording(&self) -> MemoryRecording {
        lock(&self.recording).clone()
    }
}

impl DatasetFactory for MemoryDatasetFactory {
    fn create(&self, attributes: &DatasetAttributes) -> Result<Box<dyn DatasetStore>> {
        *lock(&self.recording) = MemoryRecording {
            attributes: Some(attributes.clone()),
            ..Default::default()
        };
        Ok(Box::new(MemoryDataset {
            name: attributes.recording_name.clone(),
            recording: Arc::clone(&self.recording),
        }))
    }
}

pub struct MemoryDataset {
    name: String,
    recording: Arc<Mutex<MemoryRecording>>,
}

fn lock(recording: &Mutex<MemoryRecording>) -> MutexGuard<'_, MemoryRecording> {
    match recording.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DatasetStore for MemoryDataset {
    fn append(
        &mut self,
        timestamps: &[i64],
        measurements: &[[i32; CHANNELS]],
        alerts: &[[i8; CHANNELS]],
    ) -> Result<()> {
        check_chunk(timestamps, measurements, alerts)?;
        let mut rec = lock(&self.recording);
        rec.data.extend(timestamps, measurements, alerts);
        rec.appends += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut rec = lock(&self.recording);
        let rows = rec.data.len();
        rec.flush_points.push(rows);
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush()?;
        lock(&self.recording).close_count += 1;
        Ok(())
    }

    fn recording_name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        lock(&self.recording).data.len()
    }
}

// ============================================================================
// CSV store
// ============================================================================

const ATTRIBUTE_PREFIX: &str = "# ";

fn csv_header() -> Vec<String> {
    std::iter::once("timestamp".to_string())
        .chain((0..CHANNELS).map(|ch| format!("ch{ch}")))
        .chain((0..CHANNELS).map(|ch| format!("alert{ch}")))
        .collect()
}

/// Creates `<dir>/<recording_name>_data.csv` per session. Existing files are
/// never replaced: a taken name gets a `_1`, `_2`, ... suffix instead.
#[derive(Debug, Clone)]
pub struct CsvDatasetFactory {
    dir: PathBuf,
}

impl CsvDatasetFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, recording_name: &str) -> PathBuf {
        self.dir.join(format!("{recording_name}_data.csv"))
    }
}

impl DatasetFactory for CsvDatasetFactory {
    fn create(&self, attributes: &DatasetAttributes) -> Result<Box<dyn DatasetStore>> {
        std::fs::create_dir_all(&self.dir)?;
        let mut attributes = attributes.clone();
        let requested = attributes.recording_name.clone();
        for suffix in 0..=MAX_NAME_SUFFIX {
            if suffix > 0 {
                attributes.recording_name = format!("{requested}_{suffix}");
            }
            match CsvDataset::create(self.path_for(&attributes.recording_name), &attributes) {
                Ok(dataset) => return Ok(Box::new(dataset)),
                Err(DriverError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("recording {} exists, trying next name", attributes.recording_name);
                }
                Err(e) => return Err(e),
            }
        }
        Err(DriverError::Storage(format!(
            "no free recording name for {requested} in {}",
            self.dir.display()
        )))
    }
}

/// Recording stored as CSV rows under a commented JSON attribute header.
pub struct CsvDataset {
    name: String,
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl CsvDataset {
    /// Create a new recording file. Fails with `AlreadyExists` rather than
    /// replacing an existing file.
    pub fn create(path: impl Into<PathBuf>, attributes: &DatasetAttributes) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        let json = serde_json::to_string_pretty(attributes)?;
        for line in json.lines() {
            file.write_all(ATTRIBUTE_PREFIX.as_bytes())?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(csv_header())?;
        info!("recording to {}", path.display());
        Ok(Self {
            name: attributes.recording_name.clone(),
            path,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a complete recording in one go.
    pub fn write_recording(
        path: impl Into<PathBuf>,
        attributes: &DatasetAttributes,
        data: &RecordedData,
    ) -> Result<()> {
        let mut dataset = Box::new(Self::create(path, attributes)?);
        dataset.append(&data.timestamps, &data.measurements, &data.alerts)?;
        dataset.close()
    }
}

impl DatasetStore for CsvDataset {
    fn append(
        &mut self,
        timestamps: &[i64],
        measurements: &[[i32; CHANNELS]],
        alerts: &[[i8; CHANNELS]],
    ) -> Result<()> {
        check_chunk(timestamps, measurements, alerts)?;
        for ((ts, values), flags) in timestamps.iter().zip(measurements).zip(alerts) {
            let record = std::iter::once(ts.to_string())
                .chain(values.iter().map(|v| v.to_string()))
                .chain(flags.iter().map(|f| f.to_string()));
            self.writer.write_record(record)?;
        }
        self.rows += timestamps.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        debug!("flushed {} rows to {}", self.rows, self.path.display());
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush()?;
        info!("closed {} ({} rows)", self.path.display(), self.rows);
        Ok(())
    }

    fn recording_name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.rows
    }
}

/// Read a CSV recording (attributes and rows) back into memory.
pub fn load_csv_recording(path: impl AsRef<Path>) -> Result<Recording> {
    let path = path.as_ref();

    let mut json = String::new();
    for line in BufReader::new(File::open(path)?).lines() {
        let line = line?;
        match line.strip_prefix(ATTRIBUTE_PREFIX) {
            Some(rest) => {
                json.push_str(rest);
                json.push('\n');
            }
            None => break,
        }
    }
    let attributes = if json.is_empty() {
        None
    } else {
        Some(serde_json::from_str(&json)?)
    };

    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_path(path)?;
    let mut data = RecordedData::default();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let bad_field = |idx: usize, what: &str| {
            DriverError::Storage(format!(
                "{}: row {} column {} is not {what}",
                path.display(),
                row + 1,
                idx
            ))
        };
        let field = |idx: usize| -> Result<i64> {
            record
                .get(idx)
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| bad_field(idx, "an integer"))
        };

        data.timestamps.push(field(0)?);
        let mut values = [0i32; CHANNELS];
        let mut flags = [0i8; CHANNELS];
        for ch in 0..CHANNELS {
            let idx = 1 + ch;
            values[ch] =
                i32::try_from(field(idx)?).map_err(|_| bad_field(idx, "a 32-bit value"))?;
            let idx = 1 + CHANNELS + ch;
            flags[ch] = i8::try_from(field(idx)?).map_err(|_| bad_field(idx, "an alert flag"))?;
        }
        data.measurements.push(values);
        data.alerts.push(flags);
    }

    debug!("loaded {} rows from {}", data.len(), path.display());
    Ok(Recording { attributes, data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn attributes(name: &str) -> DatasetAttributes {
        let config = DeviceConfig::default();
        let calibration = PotiConfig::for_gain(config.gain_instrument_amplifier).unwrap();
        DatasetAttributes::new(name, &config, &DeviceMetadata::default(), &calibration)
    }

    fn rows(n: usize, offset: i64) -> RecordedData {
        let mut data = RecordedData::default();
        for i in 0..n as i64 {
            let t = offset + i;
            data.timestamps.push(t * 1000);
            data.measurements.push([t as i32, -(t as i32), 0, 1, 2, 3, 4, 8_388_607]);
            data.alerts.push([(t % 2) as i8, 0, 0, 0, 0, 0, 0, 1]);
        }
        data
    }

    #[test]
    fn recording_name_follows_start_time() {
        let start = Local.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(recording_name(start), "measurement_20240305_140709");
    }

    #[test]
    fn memory_store_tracks_appends_flushes_and_close() {
        let factory = MemoryDatasetFactory::new();
        let mut store = factory.create(&attributes("mem")).unwrap();
        let chunk = rows(3, 0);
        store
            .append(&chunk.timestamps, &chunk.measurements, &chunk.alerts)
            .unwrap();
        store.flush().unwrap();
        assert_eq!(store.len(), 3);
        store.close().unwrap();

        let rec = factory.recording();
        assert_eq!(rec.data, chunk);
        assert_eq!(rec.appends, 1);
        assert_eq!(rec.flush_points, vec![3, 3]);
        assert_eq!(rec.close_count, 1);
        assert_eq!(rec.attributes.unwrap().recording_name, "mem");
    }

    #[test]
    fn mismatched_chunk_is_rejected() {
        let factory = MemoryDatasetFactory::new();
        let mut store = factory.create(&attributes("mem")).unwrap();
        let err = store.append(&[1, 2], &[[0; CHANNELS]], &[[0; CHANNELS]; 2]);
        assert!(matches!(err, Err(DriverError::Storage(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn csv_store_round_trips_rows_and_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CsvDatasetFactory::new(dir.path());
        let attrs = attributes("session");
        let mut store = factory.create(&attrs).unwrap();

        let first = rows(4, 0);
        let second = rows(2, 4);
        store
            .append(&first.timestamps, &first.measurements, &first.alerts)
            .unwrap();
        store
            .append(&second.timestamps, &second.measurements, &second.alerts)
            .unwrap();
        assert_eq!(store.len(), 6);
        store.close().unwrap();

        let loaded = load_csv_recording(factory.path_for("session")).unwrap();
        assert_eq!(loaded.data, rows(6, 0));
        let loaded_attrs = loaded.attributes.unwrap();
        assert_eq!(loaded_attrs.config, attrs.config);
        assert_eq!(loaded_attrs.calibration.poti_value, attrs.calibration.poti_value);
        assert!(
            (loaded_attrs.calibration.actual_gain_value - attrs.calibration.actual_gain_value)
                .abs()
                < 1e-12
        );
        assert_eq!(loaded_attrs.version, RECORDING_VERSION);
    }

    #[test]
    fn write_recording_writes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleaned.csv");
        let data = rows(5, 10);
        CsvDataset::write_recording(&path, &attributes("cleaned"), &data).unwrap();
        assert_eq!(load_csv_recording(&path).unwrap().data, data);
    }

    #[test]
    fn taken_recording_name_gets_a_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CsvDatasetFactory::new(dir.path());
        let attrs = attributes("measurement_20240305_140709");

        let mut first = factory.create(&attrs).unwrap();
        let chunk = rows(3, 0);
        first
            .append(&chunk.timestamps, &chunk.measurements, &chunk.alerts)
            .unwrap();
        first.close().unwrap();

        let second = factory.create(&attrs).unwrap();
        assert_eq!(second.recording_name(), "measurement_20240305_140709_1");
        second.close().unwrap();
        let third = factory.create(&attrs).unwrap();
        assert_eq!(third.recording_name(), "measurement_20240305_140709_2");
        third.close().unwrap();

        let kept = load_csv_recording(factory.path_for("measurement_20240305_140709")).unwrap();
        assert_eq!(kept.data, chunk);
        let renamed =
            load_csv_recording(factory.path_for("measurement_20240305_140709_1")).unwrap();
        assert!(renamed.data.is_empty());
        assert_eq!(
            renamed.attributes.unwrap().recording_name,
            "measurement_20240305_140709_1"
        );
    }

    #[test]
    fn create_does_not_replace_an_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleaned.csv");
        std::fs::write(&path, "keep me\n").unwrap();
        let err = CsvDataset::create(&path, &attributes("cleaned")).err().unwrap();
        assert!(matches!(err, DriverError::Io(e) if e.kind() == io::ErrorKind::AlreadyExists));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me\n");
    }

    #[test]
    fn out_of_range_values_are_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let header = csv_header().join(",");

        let wide = dir.path().join("wide.csv");
        std::fs::write(&wide, format!("{header}\n0,3000000000,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0\n"))
            .unwrap();
        let err = load_csv_recording(&wide).err().unwrap();
        assert!(matches!(&err, DriverError::Storage(msg) if msg.contains("column 1")));

        let flag = dir.path().join("flag.csv");
        std::fs::write(&flag, format!("{header}\n0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,300\n"))
            .unwrap();
        let err = load_csv_recording(&flag).err().unwrap();
        assert!(matches!(&err, DriverError::Storage(msg) if msg.contains("column 16")));
    }
}
