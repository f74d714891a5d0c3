//! The thread-safe buffer sensor frames land in, and the trait every frame
//! producer implements.
//!
//! A [FrameBuffer] keeps the most recent frame for pollers and can also push
//! every frame into one bounded feed for event-driven consumers. The feed
//! never blocks the producer: when it is full the incoming frame is dropped
//! and counted.

use crate::error::HardwareError;
use crate::sensor_frame::{HardwareEvent, SensorFrame};

use log::{debug, warn};
use std::{
    collections::VecDeque,
    str::FromStr,
    sync::{
        mpsc::{self, Receiver, SyncSender, TrySendError},
        Arc, Mutex, MutexGuard,
    },
    time::Instant,
};

const HISTORY_LEN: usize = 100;

/// A frame as it was received, tagged with a receipt sequence number.
///
/// The sequence number increases on every push, even when the hardware
/// repeats a timestamp, so pollers can tell a new sample from a re-read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Received {
    #[allow(missing_docs)]
    pub seq: u64,
    #[allow(missing_docs)]
    pub frame: SensorFrame,
    #[allow(missing_docs)]
    pub at: Instant,
}

/// Counters kept by a [FrameBuffer].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BufferStats {
    /// Frames pushed
    pub received: u64,
    /// Frames the feed had no room for
    pub dropped: u64,
    /// Non-data lines seen
    pub status_lines: u64,
    /// Lines that failed to parse
    pub parse_errors: u64,
    /// Frames per second since the buffer was created
    pub data_rate: f64,
}

#[derive(Debug)]
struct Inner {
    latest: Option<Received>,
    next_seq: u64,
    history: VecDeque<Received>,
    stats: BufferStats,
    feed: Option<SyncSender<Received>>,
    created: Instant,
}

/// Shared handle to the frames coming off one device. Cloning is cheap and
/// every clone sees the same frames.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    /// Instantiate an empty buffer with no feed attached.
    pub fn new() -> Self {
        FrameBuffer {
            inner: Arc::new(Mutex::new(Inner {
                latest: None,
                next_seq: 1,
                history: VecDeque::with_capacity(HISTORY_LEN),
                stats: BufferStats::default(),
                feed: None,
                created: Instant::now(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route every future frame into a new bounded queue, replacing any
    /// previous feed.
    pub fn attach_feed(&self, capacity: usize) -> Receiver<Received> {
        let (tx, rx) = mpsc::sync_channel(capacity);
        self.lock().feed = Some(tx);
        rx
    }

    /// Stop feeding; the receiver sees a disconnect once it drains.
    pub fn detach_feed(&self) {
        self.lock().feed = None;
    }

    /// Store a new frame and offer it to the feed.
    pub fn push(&self, frame: SensorFrame) -> u64 {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let received = Received {
            seq: inner.next_seq,
            frame,
            at: Instant::now(),
        };
        inner.next_seq += 1;
        inner.stats.received += 1;
        inner.latest = Some(received);
        if inner.history.len() == HISTORY_LEN {
            inner.history.pop_front();
        }
        inner.history.push_back(received);

        let mut disconnected = false;
        if let Some(feed) = &inner.feed {
            match feed.try_send(received) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    inner.stats.dropped += 1;
                    warn!(
                        "frame feed full, dropped frame {} ({} dropped so far)",
                        frame.timestamp, inner.stats.dropped
                    );
                }
                Err(TrySendError::Disconnected(_)) => disconnected = true,
            }
        }
        if disconnected {
            debug!("frame feed receiver went away, detaching");
            inner.feed = None;
        }
        received.seq
    }

    /// Parse one line off the wire and store it if it is a frame.
    pub fn ingest_line(&self, line: &str) -> Option<u64> {
        match HardwareEvent::from_str(line) {
            Ok(HardwareEvent::Frame(frame)) => Some(self.push(frame)),
            Ok(HardwareEvent::Status(status)) => {
                if !status.is_empty() {
                    debug!("device: {}", status);
                }
                self.lock().stats.status_lines += 1;
                None
            }
            Err(e) => {
                debug!("was unable to parse hardware line {:?}: {}", line.trim(), e);
                self.lock().stats.parse_errors += 1;
                None
            }
        }
    }

    /// The most recent frame, if any has arrived.
    pub fn latest(&self) -> Option<Received> {
        self.lock().latest
    }

    /// Up to `n` of the most recent frames, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Received> {
        let inner = self.lock();
        let skip = inner.history.len().saturating_sub(n);
        inner.history.iter().skip(skip).copied().collect()
    }

    #[allow(missing_docs)]
    pub fn stats(&self) -> BufferStats {
        let inner = self.lock();
        let elapsed = inner.created.elapsed().as_secs_f64();
        BufferStats {
            data_rate: if elapsed > 0.0 {
                inner.stats.received as f64 / elapsed
            } else {
                0.0
            },
            ..inner.stats
        }
    }
}

/// A producer of [SensorFrame]s running on its own thread.
pub trait FrameSource: Send {
    /// Where this source puts its frames.
    fn buffer(&self) -> &FrameBuffer;

    /// Write a raw command to the device.
    fn send_command(&mut self, command: &str) -> Result<(), HardwareError>;

    /// Stop the producer thread and wait for it, then release the device.
    /// Calling it twice is harmless.
    fn stop(&mut self) -> Result<(), HardwareError>;

    /// Whether the producer thread is still running.
    fn is_running(&self) -> bool;

    /// A short human readable name for logs.
    fn describe(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_grows_even_for_repeated_timestamps() {
        let buffer = FrameBuffer::new();
        let a = buffer.push(SensorFrame::uniform(7, 0.0, 1.0));
        let b = buffer.push(SensorFrame::uniform(7, 0.0, 1.0));
        assert!(b > a);
        assert_eq!(buffer.latest().map(|r| r.seq), Some(b));
    }

    #[test]
    fn full_feed_drops_the_incoming_frame() {
        let buffer = FrameBuffer::new();
        let feed = buffer.attach_feed(2);
        for ts in 1..=5 {
            buffer.push(SensorFrame::uniform(ts, 0.0, 0.0));
        }
        let kept: Vec<u64> = feed.try_iter().map(|r| r.frame.timestamp).collect();
        assert_eq!(kept, vec![1, 2]);
        assert_eq!(buffer.stats().dropped, 3);
        // the poller still sees the newest frame
        assert_eq!(buffer.latest().map(|r| r.frame.timestamp), Some(5));
    }

    #[test]
    fn dropped_receiver_detaches_feed() {
        let buffer = FrameBuffer::new();
        drop(buffer.attach_feed(1));
        buffer.push(SensorFrame::uniform(1, 0.0, 0.0));
        buffer.push(SensorFrame::uniform(2, 0.0, 0.0));
        assert_eq!(buffer.stats().dropped, 0);
    }

    #[test]
    fn lines_are_sorted_into_frames_and_chatter() {
        let buffer = FrameBuffer::new();
        assert!(buffer.ingest_line("[INFO] ready\n").is_none());
        assert!(buffer.ingest_line("12,1,2\n").is_none());
        assert!(buffer
            .ingest_line("100,1,2,0,1,1,2,0,1,0,0,0,0\r\n")
            .is_some());
        let stats = buffer.stats();
        assert_eq!(stats.status_lines, 1);
        assert_eq!(stats.parse_errors, 1);
        assert_eq!(stats.received, 1);
    }

    #[test]
    fn history_is_bounded() {
        let buffer = FrameBuffer::new();
        for ts in 0..(HISTORY_LEN as u64 + 10) {
            buffer.push(SensorFrame::uniform(ts, 0.0, 0.0));
        }
        let recent = buffer.recent(1000);
        assert_eq!(recent.len(), HISTORY_LEN);
        assert_eq!(recent.first().map(|r| r.frame.timestamp), Some(10));
    }
}
