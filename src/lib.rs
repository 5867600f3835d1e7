//! Driver and acquisition pipeline for the AD7779-based EEG acquisition board.
//!
//! The board is reached over a USB serial link. Control commands are short
//! 3-byte exchanges; once acquisition is started the board streams fixed
//! 38-byte frames, one per sample across all eight channels.
//!
//! # Layers
//!
//! - [`transport`]: the byte-stream [`Link`] and single-exchange [`CommandTransport`]
//! - [`device`]: named board commands ([`DaqDevice`])
//! - [`frame`]: streaming frame codec and [`SequenceMonitor`]
//! - [`pipeline`]: reader/writer threads and session lifecycle ([`AcquisitionController`])
//! - [`dataset`] and [`bus`]: where samples go
//! - [`cleaner`]: offline outlier suppression and gap interpolation
//!
//! # Timing and Synchronization
//!
//! Every frame carries the board's own microsecond timestamp and an 8-bit
//! sequence index. Host-side arrival times are not recorded; use
//! [`cleaner::elapsed_seconds`] on the stored timestamps and watch the
//! sequence counters (see [`PipelineCounters`]) to detect lost frames.

pub mod bus;
pub mod calibration;
pub mod cleaner;
pub mod config;
pub mod dataset;
pub mod device;
pub mod errors;
pub mod frame;
pub mod logging;
pub mod pipeline;
pub mod transport;

pub use bus::{BusSubscription, DataBus, SampleBus, DAQ_STREAM_NAME};
pub use calibration::PotiConfig;
pub use cleaner::{elapsed_seconds, interpolate_flagged, suppress_outliers, GapReport};
pub use config::{DaqSettings, DeviceConfig, DeviceMetadata, SessionConfig, AUTO_LINK};
pub use dataset::{
    load_csv_recording, CsvDataset, CsvDatasetFactory, DatasetAttributes, DatasetFactory,
    DatasetStore, MemoryDatasetFactory, RecordedData, Recording,
};
pub use device::{DaqDevice, ErrorRegisterData, FirmwareVersion, PinState, SystemState};
pub use errors::*;
pub use frame::{DecodedSample, SequenceMonitor};
pub use logging::init_logging;
pub use pipeline::{
    AcquisitionController, FrameReader, PipelineCounters, PipelineTimings, Presenter,
    ProcessPresenter, SessionSummary,
};
pub use transport::{CommandTransport, Link, SerialLink};
