//! Real-time data bus between the acquisition reader and its consumers.
//!
//! Publishing never blocks: each subscriber has its own bounded queue and a
//! sample is dropped for a subscriber whose queue is full. Loss at this layer
//! is expected under slow consumers and is only counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;

use crate::frame::DecodedSample;

/// Name under which the acquisition stream is published.
pub const DAQ_STREAM_NAME: &str = "DAQ_Stream";

/// Queue depth per subscriber, about a minute of data at 1 kSPS.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 60_000;

/// A named stream of decoded samples with any number of subscribers.
pub trait DataBus: Send + Sync {
    fn name(&self) -> &str;

    /// Hand a sample to every current subscriber without waiting.
    fn publish(&self, sample: &DecodedSample);

    fn subscribe(&self) -> Box<dyn BusSubscription>;

    /// Number of subscriptions that are still alive.
    fn subscriber_count(&self) -> usize;
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub trait BusSubscription: Send {
    /// Wait up to `timeout` for the first sample, then take whatever else is
    /// already queued, up to `max_samples` in total.
    fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> Vec<DecodedSample>;
}

struct Subscriber {
    tx: Sender<DecodedSample>,
    alive: Weak<()>,
}

/// In-process [`DataBus`] built on bounded crossbeam channels.
pub struct SampleBus {
    name: String,
    capacity: usize,
    subscribers: Mutex<Vec<Subscriber>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl SampleBus {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Samples handed to `publish` so far.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Per-subscriber deliveries dropped because a queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DataBus for SampleBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn publish(&self, sample: &DecodedSample) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers.retain(|sub| match sub.tx.try_send(*sample) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                    warn!("bus {}: subscriber queue full, dropping samples", self.name);
                }
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    fn subscribe(&self) -> Box<dyn BusSubscription> {
        let (tx, rx) = bounded(self.capacity);
        let token = Arc::new(());
        let subscriber = Subscriber {
            tx,
            alive: Arc::downgrade(&token),
        };
        match self.subscribers.lock() {
            Ok(mut guard) => guard.push(subscriber),
            Err(poisoned) => poisoned.into_inner().push(subscriber),
        }
        Box::new(ChannelSubscription { rx, _token: token })
    }

    fn subscriber_count(&self) -> usize {
        let subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscribers
            .iter()
            .filter(|sub| sub.alive.strong_count() > 0)
            .count()
    }
}

struct ChannelSubscription {
    rx: Receiver<DecodedSample>,
    _token: Arc<()>,
}

impl BusSubscription for ChannelSubscription {
    fn pull_chunk(&mut self, max_samples: usize, timeout: Duration) -> Vec<DecodedSample> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(sample) => sample,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                return Vec::new()
            }
        };
        let mut chunk = Vec::with_capacity(max_samples.max(1));
        chunk.push(first);
        while chunk.len() < max_samples {
            match self.rx.try_recv() {
                Ok(sample) => chunk.push(sample),
                Err(_) => break,
            }
        }
        chunk
    }
}
