//! Frame-paced duplex audio channel.
//!
//! ## Threading
//!
//! `read`/`write` are called by the host's real-time leg, once per frame
//! interval each. The dialog session worker enqueues playables, flushes on
//! barge-in and starts/stops recordings. All mutable state sits behind one
//! short-held `parking_lot::Mutex`; pacing sleeps and observer callbacks
//! happen after the lock is released.
//!
//! Inbound frames are forwarded to an optional tap (an SPSC ring feeding the
//! recognizer) with `push_slice`, which never blocks. When the ring is full
//! the excess is dropped and counted.

pub mod codec;
pub mod playable;
pub mod recording;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::buffering::{FrameProducer, Producer};
use crate::error::{Result, VxiError};

pub use codec::Codec;
pub use playable::{FrameSource, PlayableItem, PlayableSource};
pub use recording::{RecordSettings, Recording, RecordingSummary, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub codec: Codec,
    /// Native frame interval.
    pub interval: Duration,
    /// Sleep so `read`/`write` run in real time. Off in tests.
    pub pacing: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            interval: Duration::from_millis(20),
            pacing: true,
        }
    }
}

/// Lifecycle notifications from the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    ItemStarted { label: String },
    /// The item could not be opened or read; `event` is the dialog event name.
    ItemFailed { label: String, event: String },
    ItemFinished { label: String },
    /// Nothing left to play.
    QueueEmpty,
    /// A stop condition (max time, final silence, key) ended the recording.
    RecordingStopped(RecordingSummary),
    Closed,
}

pub type ChannelObserver = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

#[derive(Default)]
pub struct ChannelCounters {
    pub frames_read: AtomicU64,
    pub bytes_read: AtomicU64,
    pub silence_frames: AtomicU64,
    pub frames_written: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_recorded: AtomicU64,
    pub tap_dropped: AtomicU64,
    pub items_played: AtomicU64,
    pub items_failed: AtomicU64,
}

impl ChannelCounters {
    pub fn snapshot(&self) -> ChannelCountersSnapshot {
        ChannelCountersSnapshot {
            frames_read: self.frames_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            silence_frames: self.silence_frames.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_recorded: self.bytes_recorded.load(Ordering::Relaxed),
            tap_dropped: self.tap_dropped.load(Ordering::Relaxed),
            items_played: self.items_played.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCountersSnapshot {
    pub frames_read: u64,
    pub bytes_read: u64,
    pub silence_frames: u64,
    pub frames_written: u64,
    pub bytes_written: u64,
    pub bytes_recorded: u64,
    pub tap_dropped: u64,
    pub items_played: u64,
    pub items_failed: u64,
}

#[derive(Default)]
struct ChannelState {
    queue: VecDeque<PlayableItem>,
    active: Option<PlayableItem>,
    paused: bool,
    /// Remaining frames of an inserted or trailing silence period.
    silence_left: u32,
    recording: Option<Recording>,
    tap: Option<FrameProducer>,
    closed: bool,
}

/// Deadline-based frame pacing. Falling behind resets the schedule instead
/// of bursting to catch up.
#[derive(Default)]
struct Pacer {
    next: Option<Instant>,
}

impl Pacer {
    fn wait(&mut self, interval: Duration) {
        let now = Instant::now();
        let due = match self.next {
            Some(t) if t > now => {
                thread::sleep(t - now);
                t
            }
            _ => now,
        };
        self.next = Some(due + interval);
    }
}

pub struct AudioChannel {
    config: ChannelConfig,
    silence: Vec<u8>,
    state: Mutex<ChannelState>,
    observer: Mutex<Option<ChannelObserver>>,
    read_pacer: Mutex<Pacer>,
    write_pacer: Mutex<Pacer>,
    counters: ChannelCounters,
}

impl std::fmt::Debug for AudioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioChannel")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AudioChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            silence: config.codec.silence_frame(config.interval),
            config,
            state: Mutex::new(ChannelState::default()),
            observer: Mutex::new(None),
            read_pacer: Mutex::new(Pacer::default()),
            write_pacer: Mutex::new(Pacer::default()),
            counters: ChannelCounters::default(),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.config.codec
    }

    pub fn set_observer(&self, observer: ChannelObserver) {
        *self.observer.lock() = Some(observer);
    }

    pub fn counters(&self) -> ChannelCountersSnapshot {
        self.counters.snapshot()
    }

    fn frames_for(&self, d: Duration) -> u32 {
        let interval = self.config.interval.as_micros().max(1);
        d.as_micros().div_ceil(interval) as u32
    }

    fn notify(&self, events: Vec<ChannelEvent>) {
        if events.is_empty() {
            return;
        }
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            for event in events {
                observer(event);
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Produce the next outbound frame into `buf`.
    ///
    /// Always yields exactly one frame: audio from the active playable, or a
    /// native-size silence frame when paused, inside a silence period, at an
    /// item boundary or with nothing queued.
    pub fn read(&self, buf: &mut Vec<u8>) {
        let mut events = Vec::new();
        let played = {
            let mut state = self.state.lock();
            self.check_recording(&mut state, &mut events);
            self.next_outbound(&mut state, buf, &mut events)
        };
        if !played {
            buf.clear();
            buf.extend_from_slice(&self.silence);
            self.counters.silence_frames.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.frames_read.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.notify(events);
        if self.config.pacing {
            self.read_pacer.lock().wait(self.config.interval);
        }
    }

    /// Returns true when `buf` holds playable audio.
    fn next_outbound(
        &self,
        state: &mut ChannelState,
        buf: &mut Vec<u8>,
        events: &mut Vec<ChannelEvent>,
    ) -> bool {
        if state.closed || state.paused {
            return false;
        }
        if state.silence_left > 0 {
            state.silence_left -= 1;
            return false;
        }
        let Some(item) = state.active.as_mut() else {
            return false;
        };
        match item.next_frame(buf) {
            Ok(true) => true,
            Ok(false) => {
                match item.on_repeat() {
                    Ok(true) => return false,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(item = %item.label, error = %e, "rewind failed");
                    }
                }
                if let Some(delay) = item.on_delay() {
                    // This cycle's silence frame counts toward the delay.
                    state.silence_left = self.frames_for(delay).saturating_sub(1);
                    return false;
                }
                if let Some(mut done) = state.active.take() {
                    done.on_stop();
                    self.counters.items_played.fetch_add(1, Ordering::Relaxed);
                    events.push(ChannelEvent::ItemFinished { label: done.label.clone() });
                }
                self.start_next(state, events);
                false
            }
            Err(e) => {
                warn!(item = %item.label, error = %e, "playable read failed");
                if let Some(mut failed) = state.active.take() {
                    failed.on_stop();
                    self.counters.items_failed.fetch_add(1, Ordering::Relaxed);
                    events.push(ChannelEvent::ItemFailed {
                        label: failed.label.clone(),
                        event: e.event_name(),
                    });
                }
                self.start_next(state, events);
                false
            }
        }
    }

    /// Open queued items until one starts. Items that fail to open are
    /// discarded.
    fn start_next(&self, state: &mut ChannelState, events: &mut Vec<ChannelEvent>) {
        while let Some(mut item) = state.queue.pop_front() {
            match item.on_start(self.config.codec, self.config.interval) {
                Ok(()) => {
                    events.push(ChannelEvent::ItemStarted { label: item.label.clone() });
                    state.active = Some(item);
                    return;
                }
                Err(e) => {
                    warn!(item = %item.label, error = %e, "playable failed to open");
                    self.counters.items_failed.fetch_add(1, Ordering::Relaxed);
                    events.push(ChannelEvent::ItemFailed {
                        label: item.label.clone(),
                        event: e.event_name(),
                    });
                }
            }
        }
        events.push(ChannelEvent::QueueEmpty);
    }

    pub fn enqueue(&self, item: PlayableItem) -> Result<()> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(VxiError::NoResource("audio channel closed".into()));
            }
            debug!(item = %item.label, kind = item.source().kind(), "playable queued");
            state.queue.push_back(item);
            if state.active.is_none() {
                self.start_next(&mut state, &mut events);
            }
        }
        self.notify(events);
        Ok(())
    }

    /// Stop the active item and discard everything queued.
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        let mut dropped = state.queue.len();
        for mut item in state.queue.drain(..) {
            item.on_stop();
        }
        if let Some(mut item) = state.active.take() {
            item.on_stop();
            dropped += 1;
        }
        state.silence_left = 0;
        if dropped > 0 {
            debug!(dropped, "channel flushed");
        }
        dropped
    }

    pub fn pause(&self) {
        self.state.lock().paused = true;
    }

    pub fn resume(&self) {
        self.state.lock().paused = false;
    }

    pub fn insert_silence(&self, duration: Duration) {
        let frames = self.frames_for(duration);
        self.state.lock().silence_left += frames;
    }

    pub fn is_playing(&self) -> bool {
        let state = self.state.lock();
        state.active.is_some() || !state.queue.is_empty() || state.silence_left > 0
    }

    /// Whether the item now playing may be interrupted. True when idle.
    pub fn active_interruptible(&self) -> bool {
        self.state
            .lock()
            .active
            .as_ref()
            .map_or(true, |item| item.interruptible)
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Accept one inbound frame from the caller leg.
    pub fn write(&self, frame: &[u8]) -> Result<()> {
        self.config.codec.validate_frame(self.config.interval, frame)?;
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            if let Some(tap) = state.tap.as_mut() {
                let pushed = tap.push_slice(frame);
                if pushed < frame.len() {
                    self.counters
                        .tap_dropped
                        .fetch_add((frame.len() - pushed) as u64, Ordering::Relaxed);
                }
            }
            if let Some(rec) = state.recording.as_mut() {
                match rec.write(frame) {
                    Ok(()) => {
                        self.counters
                            .bytes_recorded
                            .fetch_add(frame.len() as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(error = %e, "recording write failed");
                        if let Some(rec) = state.recording.take() {
                            match rec.finish(StopReason::Error) {
                                Ok(summary) => events.push(ChannelEvent::RecordingStopped(summary)),
                                Err(e) => warn!(error = %e, "recording close failed"),
                            }
                        }
                    }
                }
            }
            self.check_recording(&mut state, &mut events);
        }
        self.counters.frames_written.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.notify(events);
        if self.config.pacing {
            self.write_pacer.lock().wait(self.config.interval);
        }
        Ok(())
    }

    /// Route inbound audio to a recognizer ring.
    pub fn attach_tap(&self, producer: FrameProducer) {
        self.state.lock().tap = Some(producer);
    }

    pub fn detach_tap(&self) -> Option<FrameProducer> {
        self.state.lock().tap.take()
    }

    // ── Recording ────────────────────────────────────────────────────────────

    fn check_recording(&self, state: &mut ChannelState, events: &mut Vec<ChannelEvent>) {
        let fired = state
            .recording
            .as_ref()
            .and_then(Recording::pending_stop)
            .is_some();
        if !fired {
            return;
        }
        if let Some(rec) = state.recording.take() {
            match rec.finish(StopReason::Explicit) {
                Ok(summary) => {
                    info!(reason = ?summary.reason, ms = summary.duration_ms, "recording stopped");
                    events.push(ChannelEvent::RecordingStopped(summary));
                }
                Err(e) => warn!(error = %e, "recording close failed"),
            }
        }
    }

    pub fn start_recording(&self, settings: RecordSettings) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(VxiError::NoResource("audio channel closed".into()));
        }
        if state.recording.is_some() {
            return Err(VxiError::Media("a recording is already active".into()));
        }
        state.recording = Some(Recording::start(
            settings,
            self.config.codec,
            self.config.interval,
        )?);
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().recording.is_some()
    }

    /// Stop the active recording, if any.
    pub fn stop_recording(&self, reason: StopReason) -> Result<Option<RecordingSummary>> {
        let rec = self.state.lock().recording.take();
        rec.map(|r| r.finish(reason)).transpose()
    }

    /// Offer a DTMF key to the active recording. Returns the summary when
    /// the key terminated it.
    pub fn recording_dtmf(&self, key: char) -> Result<Option<RecordingSummary>> {
        let rec = {
            let mut state = self.state.lock();
            let hit = state
                .recording
                .as_mut()
                .is_some_and(|rec| rec.on_dtmf(key));
            if hit {
                state.recording.take()
            } else {
                None
            }
        };
        rec.map(|r| r.finish(StopReason::Dtmf)).transpose()
    }

    /// Stop and discard all playables, end any recording, reject new work.
    pub fn close(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            for mut item in state.queue.drain(..) {
                item.on_stop();
            }
            if let Some(mut item) = state.active.take() {
                item.on_stop();
            }
            state.tap = None;
            if let Some(rec) = state.recording.take() {
                match rec.finish(StopReason::Hangup) {
                    Ok(summary) => events.push(ChannelEvent::RecordingStopped(summary)),
                    Err(e) => warn!(error = %e, "recording close failed"),
                }
            }
        }
        events.push(ChannelEvent::Closed);
        info!("audio channel closed");
        self.notify(events);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
