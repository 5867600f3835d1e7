//! Acquisition pipeline.
//!
//! # Threads
//!
//! A session runs two threads plus an optional presenter:
//!
//! - **reader**: reads 38-byte frames from its own link handle, decodes them
//!   and publishes every good sample on the [`DataBus`]. Bad frames are
//!   counted and skipped, and the [`FrameReader`] re-locks onto the next
//!   frame boundary. Nothing on this path ends the session.
//! - **writer**: subscribes to the bus and appends chunks to the session's
//!   [`DatasetStore`], flushing every [`FLUSH_EVERY`] appends. It owns the
//!   store and closes it once, after the reader has finished and the
//!   subscription is drained.
//!
//! A [`ProcessPresenter`] adds a third thread that forwards bus samples to
//! the viewer's stdin as JSON lines.
//!
//! Both loops check a shared running flag once per iteration. A read that is
//! in flight when the flag clears is allowed to complete, which is what the
//! stop grace period is for.

use std::io::{self, BufWriter, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bus::{BusSubscription, DataBus};
use crate::calibration::PotiConfig;
use crate::config::{DaqSettings, DeviceConfig, DeviceMetadata};
use crate::dataset::{recording_name, DatasetAttributes, DatasetFactory, DatasetStore};
use crate::device::DaqDevice;
use crate::errors::{FrameError, LifecycleError, Result};
use crate::frame::{self, DecodedSample, SequenceMonitor, FRAME_HEAD, FRAME_LEN, FRAME_TAIL};
use crate::transport::{read_up_to, Link};

/// Appends between forced flushes.
pub const FLUSH_EVERY: usize = 10;

// ============================================================================
// Timings
// ============================================================================

/// Lifecycle timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineTimings {
    /// Interval between subscriber-count polls during start.
    pub subscriber_poll: Duration,
    /// Give up on start if no subscriber shows up within this time.
    pub subscriber_timeout: Duration,
    /// Sleep between clearing the running flag and joining the threads.
    pub stop_grace: Duration,
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            subscriber_poll: Duration::from_millis(1),
            subscriber_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
        }
    }
}

/// Maximum samples per writer pull: 20 ms of data, at least 10.
pub fn writer_chunk_size(sampling_rate: u16) -> usize {
    if sampling_rate > 50 {
        usize::from(sampling_rate / 50)
    } else {
        10
    }
}

/// Writer pull timeout: about ten sample periods, kept within 1..=100 ms.
pub fn writer_timeout(sampling_rate: u16) -> Duration {
    const MIN: Duration = Duration::from_millis(1);
    const MAX: Duration = Duration::from_millis(100);
    if sampling_rate == 0 {
        return MAX;
    }
    let micros = 10_000_000 / u64::from(sampling_rate);
    Duration::from_micros(micros).clamp(MIN, MAX)
}

// ============================================================================
// Reader
// ============================================================================

/// Why a frame did not make it onto the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Nothing arrived within the link timeout.
    Timeout,
    Framing(FrameError),
    /// Sequence index did not match the expected one.
    Sequence { expected: u8, observed: u8 },
    Transport(io::ErrorKind),
}

/// Result of one reader iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Sample(DecodedSample),
    /// Part of a frame is buffered; the rest has not arrived yet.
    Pending(usize),
    Dropped(DropReason),
}

/// Reassembles frames from the byte stream.
///
/// Bytes of an incomplete frame are carried over to the next call. When a
/// frame fails its head or tail check, only the bytes up to the next
/// [`FRAME_HEAD`] candidate are discarded, so a lost or extra byte costs one
/// frame instead of misaligning the rest of the session.
#[derive(Debug, Default)]
pub struct FrameReader {
    carry: Vec<u8>,
    skipped: u64,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            carry: Vec::with_capacity(FRAME_LEN),
            skipped: 0,
        }
    }

    /// Bytes held back from an incomplete frame.
    pub fn buffered(&self) -> usize {
        self.carry.len()
    }

    /// Bytes discarded while looking for a frame boundary.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Read and validate the next frame from `link`.
    pub fn next_frame(&mut self, link: &mut dyn Read, monitor: &SequenceMonitor) -> FrameOutcome {
        if self.carry.len() < FRAME_LEN {
            match read_up_to(link, FRAME_LEN - self.carry.len()) {
                Ok(bytes) => self.carry.extend_from_slice(&bytes),
                Err(e) => return FrameOutcome::Dropped(DropReason::Transport(e.kind())),
            }
        }
        if self.carry.is_empty() {
            return FrameOutcome::Dropped(DropReason::Timeout);
        }
        if self.carry.len() < FRAME_LEN {
            return FrameOutcome::Pending(self.carry.len());
        }

        let sample = match frame::decode(&self.carry[..FRAME_LEN]) {
            Ok(sample) => sample,
            Err(e) => {
                self.resync();
                return FrameOutcome::Dropped(DropReason::Framing(e));
            }
        };
        self.carry.drain(..FRAME_LEN);

        let expected = monitor.expected();
        if !monitor.check(sample.sequence_index) {
            return FrameOutcome::Dropped(DropReason::Sequence {
                expected: expected.unwrap_or(sample.sequence_index),
                observed: sample.sequence_index,
            });
        }
        FrameOutcome::Sample(sample)
    }

    /// Drop bytes up to the next position that could start a frame: a head
    /// byte whose tail position, when already buffered, holds the tail byte.
    fn resync(&mut self) {
        let carry = &self.carry;
        let next = (1..carry.len())
            .find(|&i| {
                carry[i] == FRAME_HEAD
                    && carry
                        .get(i + FRAME_LEN - 1)
                        .map_or(true, |&tail| tail == FRAME_TAIL)
            })
            .unwrap_or(carry.len());
        self.carry.drain(..next);
        self.skipped += next as u64;
    }
}

/// Snapshot of a session's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineCounters {
    pub frames_published: u64,
    pub timeouts: u64,
    pub framing_errors: u64,
    pub sequence_errors: u64,
    pub transport_errors: u64,
    /// Bytes discarded while re-locking onto frame boundaries.
    pub bytes_skipped: u64,
}

impl PipelineCounters {
    pub fn frames_dropped(&self) -> u64 {
        self.framing_errors + self.sequence_errors + self.transport_errors
    }
}

#[derive(Debug, Default)]
struct PipelineStats {
    frames_published: AtomicU64,
    timeouts: AtomicU64,
    framing_errors: AtomicU64,
    sequence_errors: AtomicU64,
    transport_errors: AtomicU64,
    bytes_skipped: AtomicU64,
}

impl PipelineStats {
    fn record_drop(&self, reason: &DropReason) {
        let counter = match reason {
            DropReason::Timeout => &self.timeouts,
            DropReason::Framing(_) => &self.framing_errors,
            DropReason::Sequence { .. } => &self.sequence_errors,
            DropReason::Transport(_) => &self.transport_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
            sequence_errors: self.sequence_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            bytes_skipped: self.bytes_skipped.load(Ordering::Relaxed),
        }
    }
}

fn log_drop(reason: &DropReason) {
    match reason {
        DropReason::Timeout => debug!("reader: no data within link timeout"),
        DropReason::Framing(e) => warn!("reader: dropped frame: {e}"),
        DropReason::Sequence { expected, observed } => {
            warn!("reader: packet loss, expected index {expected}, got {observed}")
        }
        DropReason::Transport(kind) => warn!("reader: link error: {kind:?}"),
    }
}

/// Clears the flag when the reader thread ends, including on panic.
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ReaderContext {
    link: Box<dyn Link>,
    bus: Arc<dyn DataBus>,
    monitor: Arc<SequenceMonitor>,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
    reader_active: Arc<AtomicBool>,
}

fn run_reader(ctx: ReaderContext) {
    let ReaderContext {
        mut link,
        bus,
        monitor,
        stats,
        running,
        reader_active,
    } = ctx;
    let _guard = ActiveGuard(reader_active);
    let mut frames = FrameReader::new();

    while running.load(Ordering::Acquire) {
        match frames.next_frame(&mut link, &monitor) {
            FrameOutcome::Sample(sample) => {
                bus.publish(&sample);
                stats.frames_published.fetch_add(1, Ordering::Relaxed);
            }
            FrameOutcome::Pending(buffered) => {
                debug!("reader: {buffered} of {FRAME_LEN} bytes buffered")
            }
            FrameOutcome::Dropped(reason) => {
                log_drop(&reason);
                stats.record_drop(&reason);
                stats.bytes_skipped.store(frames.skipped(), Ordering::Relaxed);
            }
        }
    }
    debug!("reader stopped");
}

// ============================================================================
// Writer
// ============================================================================

/// Counts appends and says when the next flush is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    every: usize,
    pending: usize,
}

impl FlushPolicy {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            pending: 0,
        }
    }

    /// Record one append; `true` when a flush is due now.
    pub fn record_append(&mut self) -> bool {
        self.pending += 1;
        if self.pending >= self.every {
            self.pending = 0;
            true
        } else {
            false
        }
    }
}

/// What the writer thread did during a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriterReport {
    pub samples_written: u64,
    pub chunks_written: u64,
    /// Periodic flushes, not counting the one on close.
    pub flushes: u64,
}

struct WriterContext {
    bus: Arc<dyn DataBus>,
    store: Box<dyn DatasetStore>,
    running: Arc<AtomicBool>,
    reader_active: Arc<AtomicBool>,
    chunk_size: usize,
    timeout: Duration,
}

fn run_writer(ctx: WriterContext) -> Result<WriterReport> {
    let WriterContext {
        bus,
        mut store,
        running,
        reader_active,
        chunk_size,
        timeout,
    } = ctx;
    let mut subscription = bus.subscribe();
    debug!("writer subscribed to {}", bus.name());

    let written = write_until_drained(
        &mut *subscription,
        &mut *store,
        &running,
        &reader_active,
        chunk_size,
        timeout,
    );
    let closed = store.close();
    let report = written?;
    closed?;
    info!(
        "writer finished: {} samples in {} chunks",
        report.samples_written, report.chunks_written
    );
    Ok(report)
}

fn write_until_drained(
    subscription: &mut dyn BusSubscription,
    store: &mut dyn DatasetStore,
    running: &AtomicBool,
    reader_active: &AtomicBool,
    chunk_size: usize,
    timeout: Duration,
) -> Result<WriterReport> {
    let mut report = WriterReport::default();
    let mut policy = FlushPolicy::new(FLUSH_EVERY);
    let mut timestamps = Vec::with_capacity(chunk_size);
    let mut measurements = Vec::with_capacity(chunk_size);
    let mut alerts = Vec::with_capacity(chunk_size);

    loop {
        // Sampled before pulling so the last chunk published before the
        // reader stopped is still drained.
        let finished =
            !running.load(Ordering::Acquire) && !reader_active.load(Ordering::Acquire);
        let chunk = subscription.pull_chunk(chunk_size, timeout);
        if chunk.is_empty() {
            if finished {
                return Ok(report);
            }
            continue;
        }

        timestamps.clear();
        measurements.clear();
        alerts.clear();
        for sample in &chunk {
            timestamps.push(sample.timestamp);
            measurements.push(sample.channels);
            alerts.push(sample.alert_flags());
        }
        if let Err(e) = store.append(&timestamps, &measurements, &alerts) {
            error!("writer: append failed: {e}");
            return Err(e);
        }
        report.samples_written += chunk.len() as u64;
        report.chunks_written += 1;

        if policy.record_append() {
            store.flush()?;
            report.flushes += 1;
            debug!("writer: flushed after {} samples", report.samples_written);
        }
    }
}

// ============================================================================
// Presenter
// ============================================================================

/// Samples per forwarded batch.
const FORWARD_CHUNK: usize = 256;
/// Bus poll interval of the forwarding thread; bounds how long terminate waits.
const FORWARD_POLL: Duration = Duration::from_millis(20);
/// Time a viewer gets to exit on its own after its stdin closes.
pub const PRESENTER_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Optional live view of the samples on the bus.
pub trait Presenter: Send {
    /// Start presenting what is published on `bus`.
    fn launch(&mut self, bus: &Arc<dyn DataBus>) -> Result<()>;
    fn is_alive(&mut self) -> bool;
    /// Stop presenting. Does nothing when nothing was launched.
    fn terminate(&mut self) -> Result<()>;
}

/// Presenter implemented as a child process that reads the samples from
/// its stdin, one JSON object per line.
pub struct ProcessPresenter {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    forwarder: Option<Forwarder>,
}

struct Forwarder {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ProcessPresenter {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            child: None,
            forwarder: None,
        }
    }

    fn stop_forwarder(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.stop.store(true, Ordering::Release);
            if forwarder.handle.join().is_err() {
                warn!("presenter forwarder panicked");
            }
        }
    }
}

impl Presenter for ProcessPresenter {
    fn launch(&mut self, bus: &Arc<dyn DataBus>) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .spawn()?;
        let Some(stdin) = child.stdin.take() else {
            reap(&mut child);
            let e = io::Error::new(io::ErrorKind::BrokenPipe, "presenter stdin not piped");
            return Err(e.into());
        };

        let subscription = bus.subscribe();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = match thread::Builder::new()
            .name("daq-presenter".into())
            .spawn(move || forward_samples(subscription, stdin, &flag))
        {
            Ok(handle) => handle,
            Err(e) => {
                reap(&mut child);
                return Err(e.into());
            }
        };

        info!("presenter started: {} (pid {})", self.program, child.id());
        self.child = Some(child);
        self.forwarder = Some(Forwarder { stop, handle });
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(_))) | Some(Err(_)) | None => false,
        }
    }

    fn terminate(&mut self) -> Result<()> {
        // Ending the forwarder closes the child's stdin.
        self.stop_forwarder();
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + PRESENTER_EXIT_GRACE;
        while child.try_wait()?.is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        if child.try_wait()?.is_none() {
            debug!("presenter still running after stdin closed, killing it");
            if let Err(e) = child.kill() {
                debug!("presenter kill: {e}");
            }
        }
        let status = child.wait()?;
        debug!("presenter exited: {status}");
        Ok(())
    }
}

impl Drop for ProcessPresenter {
    fn drop(&mut self) {
        if self.child.is_some() || self.forwarder.is_some() {
            if let Err(e) = self.terminate() {
                warn!("failed to terminate presenter: {e}");
            }
        }
    }
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill().and_then(|_| child.wait().map(|_| ())) {
        warn!("failed to clean up presenter process: {e}");
    }
}

fn forward_samples(
    mut subscription: Box<dyn BusSubscription>,
    sink: impl Write,
    stop: &AtomicBool,
) {
    let mut sink = BufWriter::new(sink);
    let mut forwarded = 0u64;
    while !stop.load(Ordering::Acquire) {
        let chunk = subscription.pull_chunk(FORWARD_CHUNK, FORWARD_POLL);
        if chunk.is_empty() {
            continue;
        }
        if let Err(e) = write_json_lines(&mut sink, &chunk) {
            if e.kind() == io::ErrorKind::BrokenPipe {
                info!("presenter closed its input after {forwarded} samples");
            } else {
                warn!("presenter: write failed: {e}");
            }
            return;
        }
        forwarded += chunk.len() as u64;
    }
    debug!("presenter forwarder stopped after {forwarded} samples");
}

/// Write `samples` as line-delimited JSON and flush.
fn write_json_lines(out: &mut impl Write, samples: &[DecodedSample]) -> io::Result<()> {
    for sample in samples {
        serde_json::to_writer(&mut *out, sample)?;
        out.write_all(b"\n")?;
    }
    out.flush()
}

// ============================================================================
// Controller
// ============================================================================

/// Result of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub recording_name: String,
    pub started_at: DateTime<Local>,
    pub stopped_at: DateTime<Local>,
    pub writer: WriterReport,
    pub counters: PipelineCounters,
}

impl SessionSummary {
    pub fn duration(&self) -> chrono::Duration {
        self.stopped_at - self.started_at
    }
}

struct Session {
    recording_name: String,
    started_at: DateTime<Local>,
    reader: JoinHandle<()>,
    writer: JoinHandle<Result<WriterReport>>,
    stats: Arc<PipelineStats>,
}

/// Owns the device, the bus and the dataset factory, and runs acquisition
/// sessions on them one at a time.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use eegdaq::{
///     AcquisitionController, CsvDatasetFactory, DaqDevice, SampleBus, SerialLink,
///     SessionConfig, DAQ_STREAM_NAME,
/// };
///
/// let session = SessionConfig::from_toml_file("session.toml")?;
/// let link = SerialLink::open(&session.device.link)?;
/// let mut controller = AcquisitionController::new(
///     DaqDevice::new(Box::new(link)),
///     session.device,
///     session.metadata,
///     Arc::new(SampleBus::new(DAQ_STREAM_NAME)),
///     Box::new(CsvDatasetFactory::new("recordings")),
/// )?;
///
/// let summary = controller.run_for(std::time::Duration::from_secs(10))?;
/// println!("{} samples", summary.writer.samples_written);
/// # Ok::<(), eegdaq::DriverError>(())
/// ```
pub struct AcquisitionController {
    device: DaqDevice,
    config: DeviceConfig,
    metadata: DeviceMetadata,
    settings: DaqSettings,
    calibration: PotiConfig,
    bus: Arc<dyn DataBus>,
    datasets: Box<dyn DatasetFactory>,
    presenter: Option<Box<dyn Presenter>>,
    timings: PipelineTimings,
    running: Arc<AtomicBool>,
    reader_active: Arc<AtomicBool>,
    monitor: Arc<SequenceMonitor>,
    session: Option<Session>,
}

impl AcquisitionController {
    /// Validate `config` and write it to the device.
    ///
    /// Nothing is sent unless every configuration field is valid.
    pub fn new(
        mut device: DaqDevice,
        config: DeviceConfig,
        metadata: DeviceMetadata,
        bus: Arc<dyn DataBus>,
        datasets: Box<dyn DatasetFactory>,
    ) -> Result<Self> {
        let settings = config.validate()?;
        let calibration = PotiConfig::for_gain(config.gain_instrument_amplifier)?;

        device.set_daq_settings(&settings)?;
        device.set_shielding_settings(&settings)?;
        device.set_gain_instrument_amplifier(calibration.poti_value)?;
        info!(
            "amplifier gain {:.3} requested, {:.3} set (poti {})",
            calibration.gain, calibration.actual_gain_value, calibration.poti_value
        );

        Ok(Self {
            device,
            config,
            metadata,
            settings,
            calibration,
            bus,
            datasets,
            presenter: None,
            timings: PipelineTimings::default(),
            running: Arc::new(AtomicBool::new(false)),
            reader_active: Arc::new(AtomicBool::new(false)),
            monitor: Arc::new(SequenceMonitor::new()),
            session: None,
        })
    }

    pub fn with_presenter(mut self, presenter: Box<dyn Presenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    pub fn with_timings(mut self, timings: PipelineTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn calibration(&self) -> &PotiConfig {
        &self.calibration
    }

    pub fn settings(&self) -> &DaqSettings {
        &self.settings
    }

    /// Direct access to the device for commands while idle.
    ///
    /// Commands that expect a response will compete with the reader for
    /// incoming bytes while a session is running.
    pub fn device_mut(&mut self) -> &mut DaqDevice {
        &mut self.device
    }

    /// Counters of the running session, if any.
    pub fn counters(&self) -> Option<PipelineCounters> {
        self.session.as_ref().map(|s| s.stats.snapshot())
    }

    /// Start a new session and return its recording name.
    pub fn start(&mut self) -> Result<String> {
        if self.session.is_some() || self.is_running() {
            return Err(LifecycleError::AlreadyRunning.into());
        }

        let started_at = Local::now();
        let attributes = DatasetAttributes::new(
            recording_name(started_at),
            &self.config,
            &self.metadata,
            &self.calibration,
        );
        let store = self.datasets.create(&attributes)?;
        let name = store.recording_name().to_string();

        self.monitor.reset();
        let stats = Arc::new(PipelineStats::default());
        self.running.store(true, Ordering::Release);

        let writer = match self.spawn_writer(store) {
            Ok(writer) => writer,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(e);
            }
        };

        if let Err(e) = self.wait_for_subscriber().and_then(|_| self.device.start_daq()) {
            self.abort_start(writer);
            return Err(e);
        }

        if let Some(presenter) = self.presenter.as_mut() {
            if let Err(e) = presenter.launch(&self.bus) {
                warn!("presenter failed to start, continuing without it: {e}");
            }
        }

        let reader = match self.spawn_reader(&stats) {
            Ok(reader) => reader,
            Err(e) => {
                if let Err(stop_err) = self.device.stop_daq() {
                    warn!("stop_daq after failed start: {stop_err}");
                }
                self.terminate_presenter();
                self.abort_start(writer);
                return Err(e);
            }
        };

        info!("acquisition started: {name}");
        self.session = Some(Session {
            recording_name: name.clone(),
            started_at,
            reader,
            writer,
            stats,
        });
        Ok(name)
    }

    /// Stop the running session, wait for both threads and close the
    /// recording.
    pub fn stop(&mut self) -> Result<SessionSummary> {
        let session = self.session.take().ok_or(LifecycleError::NotRunning)?;

        self.running.store(false, Ordering::Release);
        let stop_result = self.device.stop_daq();
        if let Err(e) = &stop_result {
            warn!("stop_daq failed: {e}");
        }
        thread::sleep(self.timings.stop_grace);

        let reader_result = session.reader.join();
        let writer_result = session.writer.join();

        self.terminate_presenter();
        let stopped_at = Local::now();

        if reader_result.is_err() {
            return Err(LifecycleError::TaskPanicked("reader").into());
        }
        let writer = match writer_result {
            Ok(report) => report?,
            Err(_) => return Err(LifecycleError::TaskPanicked("writer").into()),
        };
        stop_result?;

        let summary = SessionSummary {
            recording_name: session.recording_name,
            started_at: session.started_at,
            stopped_at,
            writer,
            counters: session.stats.snapshot(),
        };
        info!(
            "acquisition stopped: {} ({} samples, {} frames dropped)",
            summary.recording_name,
            summary.writer.samples_written,
            summary.counters.frames_dropped()
        );
        Ok(summary)
    }

    /// Record for `duration`, then stop.
    pub fn run_for(&mut self, duration: Duration) -> Result<SessionSummary> {
        self.start()?;
        thread::sleep(duration);
        self.stop()
    }

    fn spawn_writer(&self, store: Box<dyn DatasetStore>) -> Result<JoinHandle<Result<WriterReport>>> {
        let ctx = WriterContext {
            bus: Arc::clone(&self.bus),
            store,
            running: Arc::clone(&self.running),
            reader_active: Arc::clone(&self.reader_active),
            chunk_size: writer_chunk_size(self.settings.sampling_rate),
            timeout: writer_timeout(self.settings.sampling_rate),
        };
        let handle = thread::Builder::new()
            .name("daq-writer".into())
            .spawn(move || run_writer(ctx))?;
        Ok(handle)
    }

    fn spawn_reader(&mut self, stats: &Arc<PipelineStats>) -> Result<JoinHandle<()>> {
        let mut link = self.device.stream_link()?;
        // Bytes left over from an earlier session would start this one
        // mid-frame.
        link.clear_input()?;
        let ctx = ReaderContext {
            link,
            bus: Arc::clone(&self.bus),
            monitor: Arc::clone(&self.monitor),
            stats: Arc::clone(stats),
            running: Arc::clone(&self.running),
            reader_active: Arc::clone(&self.reader_active),
        };
        self.reader_active.store(true, Ordering::Release);
        match thread::Builder::new()
            .name("daq-reader".into())
            .spawn(move || run_reader(ctx))
        {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.reader_active.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn wait_for_subscriber(&self) -> Result<()> {
        let deadline = Instant::now() + self.timings.subscriber_timeout;
        while self.bus.subscriber_count() == 0 {
            if Instant::now() >= deadline {
                return Err(LifecycleError::NoSubscriber(self.timings.subscriber_timeout).into());
            }
            thread::sleep(self.timings.subscriber_poll);
        }
        Ok(())
    }

    fn terminate_presenter(&mut self) {
        if let Some(presenter) = self.presenter.as_mut() {
            if !presenter.is_alive() {
                debug!("presenter already exited");
            }
            if let Err(e) = presenter.terminate() {
                warn!("failed to terminate presenter: {e}");
            }
        }
    }

    fn abort_start(&mut self, writer: JoinHandle<Result<WriterReport>>) {
        self.running.store(false, Ordering::Release);
        match writer.join() {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("writer failed during aborted start: {e}"),
            Err(_) => warn!("writer panicked during aborted start"),
        }
    }
}

impl Drop for AcquisitionController {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.stop() {
                error!("failed to stop acquisition on drop: {e}");
            }
        }
    }
}
