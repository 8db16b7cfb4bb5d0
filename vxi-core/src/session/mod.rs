//! `DialogSession`: one worker interpreting one document against one audio
//! channel.
//!
//! ## Lifecycle
//!
//! ```text
//! DialogSession::new(config, channel)
//!     └─► start(document, collaborators)  → worker spawned, status = Running
//!         ├─► dtmf() / speech() / transfer_completed() / hangup()
//!         └─► stop()                      → abort, bounded join, status = Ended
//! ```
//!
//! ## Threading
//!
//! The worker thread exclusively owns document, grammar and traversal state.
//! Control calls, the channel observer and recognizer callbacks only touch
//! the trigger slot under its mutex and then signal one condition variable;
//! the worker never polls. A replacement document is parked in the same slot
//! and swapped in by the worker between steps.

mod dispatch;
mod handlers;
pub mod properties;
mod prompts;
mod worker;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;
use tracing::{info, info_span, warn};

use crate::audio::{AudioChannel, ChannelEvent};
use crate::cache::ResourceCache;
use crate::document::{Document, DocumentLoader, JsonDocumentLoader};
use crate::error::{Result, VxiError};
use crate::events::{SessionEvent, SessionEventKind, SessionStatus};
use crate::fetch::{fetch_cached, Fetcher};
use crate::grammar::Input;
use crate::script::{ScriptContext, SimpleScript};
use crate::speech::{Recognition, Recognizer, Synthesizer};

/// Broadcast capacity: events buffered for slow observers.
const BROADCAST_CAP: usize = 256;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Session defaults. Document `<property>` declarations override the first
/// five per node.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// No-input timeout. Default: 5 s.
    pub timeout: Duration,
    /// DTMF key that ends digit collection. Default: `#`.
    pub termchar: char,
    /// Default: `"dtmf voice"`.
    pub inputmodes: String,
    /// Default: `en-US`.
    pub language: String,
    /// Whether prompts may be interrupted by input. Default: true.
    pub bargein: bool,
    /// Enter re-dispatches allowed in one step before the document is ended
    /// as a redirection cycle. Default: 64.
    pub redirect_cap: usize,
    /// Bounded join on `stop()`. Default: 2 s.
    pub join_timeout: Duration,
    /// Steps allowed for disconnect handling after an abort. Default: 256.
    pub drain_steps: usize,
    /// Per-request fetch timeout. Default: 10 s.
    pub fetch_timeout: Duration,
    /// Where `<record>` writes its files. Default: the system temp dir.
    pub record_dir: PathBuf,
    /// Inputs kept while no grammar is listening. Default: 32.
    pub max_typeahead: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            termchar: '#',
            inputmodes: "dtmf voice".into(),
            language: "en-US".into(),
            bargein: true,
            redirect_cap: 64,
            join_timeout: Duration::from_secs(2),
            drain_steps: 256,
            fetch_timeout: Duration::from_secs(10),
            record_dir: std::env::temp_dir(),
            max_typeahead: 32,
        }
    }
}

/// The pluggable collaborators a session talks to.
pub struct Collaborators {
    pub script: Box<dyn ScriptContext>,
    pub fetcher: Option<Arc<dyn Fetcher>>,
    pub loader: Arc<dyn DocumentLoader>,
    pub cache: Option<Arc<ResourceCache>>,
    pub recognizer: Option<Arc<dyn Recognizer>>,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            script: Box::new(SimpleScript::new()),
            fetcher: None,
            loader: Arc::new(JsonDocumentLoader),
            cache: None,
            recognizer: None,
            synthesizer: None,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("fetcher", &self.fetcher.is_some())
            .field("cache", &self.cache.is_some())
            .field("recognizer", &self.recognizer.is_some())
            .field("synthesizer", &self.synthesizer.is_some())
            .finish_non_exhaustive()
    }
}

/// Step and event counters for one session run.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub steps: AtomicUsize,
    pub nodes_entered: AtomicUsize,
    pub redirects: AtomicUsize,
    pub events_raised: AtomicUsize,
    pub events_unhandled: AtomicUsize,
    pub grammars_started: AtomicUsize,
    pub grammars_filled: AtomicUsize,
    pub inputs_routed: AtomicUsize,
    pub inputs_discarded: AtomicUsize,
    pub prompts_queued: AtomicUsize,
    pub documents_loaded: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> [&AtomicUsize; 11] {
        [
            &self.steps,
            &self.nodes_entered,
            &self.redirects,
            &self.events_raised,
            &self.events_unhandled,
            &self.grammars_started,
            &self.grammars_filled,
            &self.inputs_routed,
            &self.inputs_discarded,
            &self.prompts_queued,
            &self.documents_loaded,
        ]
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            steps: self.steps.load(Ordering::Relaxed),
            nodes_entered: self.nodes_entered.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            events_raised: self.events_raised.load(Ordering::Relaxed),
            events_unhandled: self.events_unhandled.load(Ordering::Relaxed),
            grammars_started: self.grammars_started.load(Ordering::Relaxed),
            grammars_filled: self.grammars_filled.load(Ordering::Relaxed),
            inputs_routed: self.inputs_routed.load(Ordering::Relaxed),
            inputs_discarded: self.inputs_discarded.load(Ordering::Relaxed),
            prompts_queued: self.prompts_queued.load(Ordering::Relaxed),
            documents_loaded: self.documents_loaded.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub steps: usize,
    pub nodes_entered: usize,
    pub redirects: usize,
    pub events_raised: usize,
    pub events_unhandled: usize,
    pub grammars_started: usize,
    pub grammars_filled: usize,
    pub inputs_routed: usize,
    pub inputs_discarded: usize,
    pub prompts_queued: usize,
    pub documents_loaded: usize,
}

/// A document waiting for the next safe point, plus the `#fragment` dialog
/// to start at.
pub(crate) struct PendingDocument {
    pub document: Arc<Document>,
    pub entry: Option<String>,
}

/// Everything another context may hand the worker.
#[derive(Default)]
pub(crate) struct Triggers {
    pub inputs: VecDeque<Input>,
    pub channel: Vec<ChannelEvent>,
    pub transfer: Option<String>,
    pub hangup: bool,
    pub abort: bool,
    pub pending: Option<PendingDocument>,
}

impl Triggers {
    fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.channel.is_empty()
            && self.transfer.is_none()
            && !self.hangup
            && !self.abort
            && self.pending.is_none()
    }
}

/// Trigger slot plus the condition variable that wakes the worker.
#[derive(Default)]
pub(crate) struct Shared {
    triggers: Mutex<Triggers>,
    wake: Condvar,
}

impl Shared {
    pub fn signal(&self, f: impl FnOnce(&mut Triggers)) {
        let mut triggers = self.triggers.lock();
        f(&mut triggers);
        self.wake.notify_one();
    }

    pub fn take(&self) -> Triggers {
        std::mem::take(&mut *self.triggers.lock())
    }

    /// Block until something is signalled or `deadline` passes.
    pub fn wait(&self, deadline: Option<Instant>) {
        let mut triggers = self.triggers.lock();
        if !triggers.is_empty() {
            return;
        }
        match deadline {
            Some(deadline) => {
                let _ = self.wake.wait_until(&mut triggers, deadline);
            }
            None => self.wake.wait(&mut triggers),
        }
    }
}

/// Status slot and event broadcaster shared by the handle and its worker.
#[derive(Clone)]
pub(crate) struct Emitter {
    tx: broadcast::Sender<SessionEvent>,
    seq: Arc<AtomicU64>,
    status: Arc<Mutex<SessionStatus>>,
}

impl Emitter {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
            status: Arc::new(Mutex::new(SessionStatus::Idle)),
        }
    }

    pub fn emit(&self, kind: SessionEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(SessionEvent { seq, kind });
    }

    pub fn set_status(&self, status: SessionStatus, detail: Option<String>) {
        *self.status.lock() = status;
        self.emit(SessionEventKind::Status { status, detail });
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }
}

/// Everything the worker thread is started with.
pub(crate) struct WorkerContext {
    pub config: SessionConfig,
    pub channel: Arc<AudioChannel>,
    pub shared: Arc<Shared>,
    pub emitter: Emitter,
    pub diagnostics: Arc<SessionDiagnostics>,
    pub document: Arc<Document>,
    pub collaborators: Collaborators,
}

/// The session handle. `Send + Sync`; wrap in `Arc` to share with the
/// context that pumps audio.
pub struct DialogSession {
    id: u64,
    config: SessionConfig,
    channel: Arc<AudioChannel>,
    shared: Arc<Shared>,
    emitter: Emitter,
    running: Arc<AtomicBool>,
    diagnostics: Arc<SessionDiagnostics>,
    done: Mutex<Option<Receiver<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DialogSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialogSession")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DialogSession {
    pub fn new(config: SessionConfig, channel: Arc<AudioChannel>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            config,
            channel,
            shared: Arc::new(Shared::default()),
            emitter: Emitter::new(),
            running: Arc::new(AtomicBool::new(false)),
            diagnostics: Arc::new(SessionDiagnostics::default()),
            done: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel(&self) -> &Arc<AudioChannel> {
        &self.channel
    }

    /// Spawn the worker on `document`.
    ///
    /// # Errors
    /// - `VxiError::AlreadyRunning` if a worker is live.
    /// - `VxiError::Io` if the thread cannot be spawned.
    pub fn start(&self, document: Document, collaborators: Collaborators) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(VxiError::AlreadyRunning);
        }
        self.diagnostics.reset();
        *self.shared.triggers.lock() = Triggers::default();

        let shared = Arc::clone(&self.shared);
        self.channel.set_observer(Arc::new(move |event: ChannelEvent| {
            shared.signal(|t| t.channel.push(event));
        }));

        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let ctx = WorkerContext {
            config: self.config.clone(),
            channel: Arc::clone(&self.channel),
            shared: Arc::clone(&self.shared),
            emitter: self.emitter.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            document: Arc::new(document),
            collaborators,
        };
        let running = Arc::clone(&self.running);
        let id = self.id;
        let spawned = std::thread::Builder::new()
            .name(format!("vxi-session-{id}"))
            .spawn(move || {
                let span = info_span!("session", id);
                let _entered = span.enter();
                worker::run(ctx);
                running.store(false, Ordering::SeqCst);
                let _ = done_tx.send(());
            });
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                *self.done.lock() = Some(done_rx);
                info!(session = id, "session started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.emitter
                    .set_status(SessionStatus::Error, Some(e.to_string()));
                Err(VxiError::Io(e))
            }
        }
    }

    /// Fetch `uri` through the cache and loader, then [`start`](Self::start).
    pub fn start_uri(&self, uri: &str, collaborators: Collaborators) -> Result<()> {
        let fetcher = collaborators
            .fetcher
            .as_deref()
            .ok_or_else(|| VxiError::NoResource("no fetcher configured".into()))?;
        let bytes = fetch_cached(
            collaborators.cache.as_deref(),
            fetcher,
            uri,
            Default::default(),
            self.config.fetch_timeout,
        )?;
        let document = collaborators.loader.load(uri, &bytes)?;
        self.start(document, collaborators)
    }

    /// Abort the worker and join it within `join_timeout`.
    ///
    /// Outstanding disconnect handling runs first. Past the timeout the
    /// worker is detached; it still exits at its next safe point.
    ///
    /// # Errors
    /// - `VxiError::NotRunning` if never started or already stopped.
    /// - `VxiError::JoinTimeout` if the worker did not finish in time.
    pub fn stop(&self) -> Result<()> {
        let Some(done) = self.done.lock().take() else {
            return Err(VxiError::NotRunning);
        };
        if self.running.load(Ordering::SeqCst) {
            self.emitter.set_status(SessionStatus::Stopping, None);
        }
        self.shared.signal(|t| t.abort = true);
        info!(session = self.id, "session stop requested");
        match done.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.join_worker();
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(session = self.id, "worker did not exit in time; detaching");
                self.worker.lock().take();
                self.emitter
                    .set_status(SessionStatus::Error, Some("worker join timed out".into()));
                Err(VxiError::JoinTimeout(self.config.join_timeout))
            }
        }
    }

    /// Wait for the document to end on its own.
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let Some(done) = self.done.lock().clone() else {
            return Err(VxiError::NotRunning);
        };
        match done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                self.done.lock().take();
                self.join_worker();
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(VxiError::JoinTimeout(timeout)),
        }
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!(session = self.id, "session worker panicked");
                self.emitter
                    .set_status(SessionStatus::Error, Some("worker panicked".into()));
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Controls ─────────────────────────────────────────────────────────────

    pub fn dtmf(&self, key: char) {
        self.shared.signal(|t| t.inputs.push_back(Input::Dtmf(key)));
    }

    /// Queue every key of `keys` in order.
    pub fn dtmf_sequence(&self, keys: &str) {
        self.shared
            .signal(|t| t.inputs.extend(keys.chars().map(Input::Dtmf)));
    }

    /// Deliver a recognition produced outside the session's recognizer.
    pub fn speech(&self, result: Recognition) {
        self.shared.signal(|t| t.inputs.push_back(Input::Speech(result)));
    }

    pub fn transfer_completed(&self, outcome: impl Into<String>) {
        let outcome = outcome.into();
        self.shared.signal(|t| t.transfer = Some(outcome));
    }

    /// The caller hung up: raises `connection.disconnect.hangup`.
    pub fn hangup(&self) {
        self.shared.signal(|t| t.hangup = true);
    }

    /// Replace the live document at the next safe point, starting at the
    /// dialog with id `entry` if given.
    pub fn replace_document(&self, document: Document, entry: Option<String>) {
        let pending = PendingDocument {
            document: Arc::new(document),
            entry,
        };
        self.shared.signal(|t| t.pending = Some(pending));
    }

    // ── Observation ──────────────────────────────────────────────────────────

    pub fn status(&self) -> SessionStatus {
        self.emitter.status()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.emitter.tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }
}

impl Drop for DialogSession {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.shared.signal(|t| t.abort = true);
        }
    }
}
