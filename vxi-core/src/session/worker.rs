//! The cooperative session loop and the traversal state machine.
//!
//! One loop iteration: drain triggers (inputs and channel events go to the
//! current document's grammars), process a completed grammar, swap in a
//! pending document, then either sleep until the next trigger or deadline
//! or run one traversal step.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, debug_span, error, info, warn};

use super::{
    properties, Collaborators, Emitter, PendingDocument, SessionConfig, SessionDiagnostics,
    Shared, Triggers, WorkerContext,
};
use crate::audio::{AudioChannel, ChannelEvent, RecordingSummary, StopReason};
use crate::buffering::{create_frame_ring, FRAME_RING_CAPACITY};
use crate::cache::FreshnessPolicy;
use crate::document::{Document, FlagTable, NodeId};
use crate::error::{Result, VxiError};
use crate::events::{EndReason, RecordingStatus, SessionEventKind, SessionStatus, TransferStatus};
use crate::fetch::{fetch_cached, resolve_uri};
use crate::grammar::{Grammar, GrammarState, Input, InputModes, VoiceInput};
use crate::script::{ScopeLevel, ScriptContext};
use crate::speech::ResultCallback;

/// What a blocked worker is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Wait {
    Input,
    Recording,
    Transfer,
    Document,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Jump {
    /// Make the node current and enter it.
    To(NodeId),
    /// Continue as if the node had just finished, without its Exit phase.
    After(NodeId),
    End(EndReason, Option<String>),
}

/// Result of a handler phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Outcome {
    Descend,
    Next,
    Jump(Jump),
    Wait(Wait),
}

impl Outcome {
    pub(super) fn to(node: NodeId) -> Self {
        Self::Jump(Jump::To(node))
    }

    pub(super) fn after(node: NodeId) -> Self {
        Self::Jump(Jump::After(node))
    }

    pub(super) fn end(reason: EndReason, detail: Option<String>) -> Self {
        Self::Jump(Jump::End(reason, detail))
    }
}

enum Move {
    Enter(NodeId),
    Advance { from: NodeId, descend: bool },
    Done,
}

/// Where traversal continues once a catch handler finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Resume {
    Reenter(NodeId),
    After(NodeId),
    End(EndReason),
}

#[derive(Debug, Clone, Copy)]
pub(super) struct CatchFrame {
    pub handler: NodeId,
    pub resume: Resume,
}

pub(super) struct Worker {
    pub(super) config: SessionConfig,
    pub(super) channel: Arc<AudioChannel>,
    pub(super) shared: Arc<Shared>,
    pub(super) emitter: Emitter,
    pub(super) diagnostics: Arc<SessionDiagnostics>,
    pub(super) collab: Collaborators,
    pub(super) doc: Arc<Document>,
    pub(super) flags: FlagTable,
    pub(super) current: Option<NodeId>,
    pub(super) waiting: Option<Wait>,
    /// Owners of the scopes this worker pushed, innermost last.
    pub(super) scopes: Vec<NodeId>,
    pub(super) grammars: Vec<Grammar>,
    pub(super) grammar_errors: HashMap<NodeId, String>,
    pub(super) typeahead: VecDeque<Input>,
    pub(super) barging_in: bool,
    pub(super) suppress_prompts: bool,
    pub(super) reprompt: bool,
    pub(super) reentry: Option<NodeId>,
    pub(super) prompt_timeout: Option<Duration>,
    pub(super) event_counts: HashMap<String, u32>,
    pub(super) prompt_counts: HashMap<NodeId, u32>,
    pub(super) pending_handler: Option<NodeId>,
    pub(super) pending_event: Option<(String, Option<String>)>,
    pub(super) catch_stack: Vec<CatchFrame>,
    pub(super) filled_chain: VecDeque<NodeId>,
    pub(super) filled_resume: Option<NodeId>,
    pub(super) entry_dialog: Option<NodeId>,
    pub(super) recording: RecordingStatus,
    pub(super) record_item: Option<NodeId>,
    pub(super) record_seq: u32,
    pub(super) transfer: TransferStatus,
    pub(super) disconnecting: bool,
    redirects: usize,
    ended: Option<EndReason>,
}

pub(super) fn run(ctx: WorkerContext) {
    let mut worker = Worker::new(ctx);
    worker.emitter.set_status(SessionStatus::Running, None);
    worker.run_loop();
    worker.finish();
}

impl Worker {
    fn new(ctx: WorkerContext) -> Self {
        let WorkerContext {
            config,
            channel,
            shared,
            emitter,
            diagnostics,
            document,
            mut collaborators,
        } = ctx;
        collaborators.script.push_scope(ScopeLevel::Application);
        let root = document.root();
        let worker = Self {
            config,
            channel,
            shared,
            emitter,
            diagnostics,
            collab: collaborators,
            doc: document,
            flags: FlagTable::new(),
            current: Some(root),
            waiting: None,
            scopes: Vec::new(),
            grammars: Vec::new(),
            grammar_errors: HashMap::new(),
            typeahead: VecDeque::new(),
            barging_in: false,
            suppress_prompts: false,
            reprompt: false,
            reentry: None,
            prompt_timeout: None,
            event_counts: HashMap::new(),
            prompt_counts: HashMap::new(),
            pending_handler: None,
            pending_event: None,
            catch_stack: Vec::new(),
            filled_chain: VecDeque::new(),
            filled_resume: None,
            entry_dialog: None,
            recording: RecordingStatus::Idle,
            record_item: None,
            record_seq: 0,
            transfer: TransferStatus::Idle,
            disconnecting: false,
            redirects: 0,
            ended: None,
        };
        worker.announce_document();
        worker
    }

    fn announce_document(&self) {
        SessionDiagnostics::bump(&self.diagnostics.documents_loaded);
        info!(uri = self.doc.uri(), nodes = self.doc.len(), "document loaded");
        self.emitter.emit(SessionEventKind::DocumentLoaded {
            uri: self.doc.uri().to_string(),
        });
    }

    fn run_loop(&mut self) {
        loop {
            let Triggers {
                inputs,
                channel,
                transfer,
                hangup,
                abort,
                pending,
            } = self.shared.take();

            for event in channel {
                self.on_channel_event(event);
            }
            for input in inputs {
                self.route_input(input);
            }
            if let Some(outcome) = transfer {
                self.on_transfer_completed(outcome);
            }
            if hangup {
                self.raise_hangup();
            }
            self.check_timeouts(Instant::now());
            self.complete_grammar();

            // Safe point: nothing below holds a node of the old document.
            if let Some(pending) = pending {
                self.swap_document(pending);
            }
            if abort {
                self.drain();
                return;
            }
            if self.current.is_none() {
                return;
            }
            if self.waiting.is_some() {
                let deadline = self.next_deadline();
                self.shared.wait(deadline);
                continue;
            }
            SessionDiagnostics::bump(&self.diagnostics.steps);
            self.step();
        }
    }

    fn finish(&mut self) {
        if self.ended.is_none() {
            self.end(EndReason::Aborted, None);
        }
        self.channel.detach_tap();
        self.emitter.set_status(SessionStatus::Ended, None);
        info!(reason = ?self.ended, "session worker exiting");
    }

    /// Run queued disconnect handling, bounded, then end.
    fn drain(&mut self) {
        let mut steps = 0;
        while self.disconnecting
            && self.current.is_some()
            && self.waiting.is_none()
            && steps < self.config.drain_steps
        {
            self.step();
            steps += 1;
        }
        if self.current.is_some() {
            debug!(steps, "abort with document still active");
            self.end(EndReason::Aborted, None);
        }
    }

    // ── Traversal ────────────────────────────────────────────────────────────

    fn step(&mut self) {
        let Some(node) = self.current else {
            return;
        };
        self.redirects = 0;
        self.run_moves(Move::Enter(node));
    }

    /// Continue traversal with an outcome produced outside a step (grammar
    /// completion, recording stop, transfer result, hangup).
    fn resume_with(&mut self, at: NodeId, outcome: Outcome) {
        self.redirects = 0;
        let mv = self.follow(at, outcome);
        self.run_moves(mv);
    }

    fn run_moves(&mut self, mut mv: Move) {
        loop {
            mv = match mv {
                Move::Done => return,
                Move::Enter(node) => {
                    self.current = Some(node);
                    SessionDiagnostics::bump(&self.diagnostics.nodes_entered);
                    let outcome = self.guarded(node, |w| w.enter(node));
                    self.follow(node, outcome)
                }
                Move::Advance { from, descend } => self.advance(from, descend),
            };
        }
    }

    fn follow(&mut self, node: NodeId, outcome: Outcome) -> Move {
        match outcome {
            Outcome::Descend => Move::Advance {
                from: node,
                descend: true,
            },
            Outcome::Next => Move::Advance {
                from: node,
                descend: false,
            },
            Outcome::Wait(wait) => {
                self.current = Some(node);
                self.waiting = Some(wait);
                Move::Done
            }
            Outcome::Jump(jump) => {
                self.redirects += 1;
                SessionDiagnostics::bump(&self.diagnostics.redirects);
                if self.redirects > self.config.redirect_cap {
                    error!(
                        node = node.index(),
                        cap = self.config.redirect_cap,
                        "handler redirection cycle; ending document"
                    );
                    self.end(EndReason::Logic, Some("handler redirection cycle".into()));
                    return Move::Done;
                }
                self.jump(jump)
            }
        }
    }

    /// `NextNode`: grammar completions first, then children, siblings, and
    /// ancestor Exit phases.
    fn advance(&mut self, from: NodeId, descend: bool) -> Move {
        if let Some((field, outcome)) = self.take_completed() {
            return self.follow(field, outcome);
        }
        let doc = Arc::clone(&self.doc);
        if descend {
            if let Some(child) = doc.first_child(from) {
                self.current = Some(child);
                return Move::Done;
            }
            match self.guarded(from, |w| w.exit(from)) {
                Outcome::Next | Outcome::Descend => {}
                other => return self.follow(from, other),
            }
        }
        let mut node = from;
        loop {
            if let Some(sibling) = doc.next_sibling(node) {
                self.current = Some(sibling);
                return Move::Done;
            }
            let Some(parent) = doc.parent(node) else {
                self.end(EndReason::Completed, None);
                return Move::Done;
            };
            self.current = Some(parent);
            match self.guarded(parent, |w| w.exit(parent)) {
                Outcome::Next | Outcome::Descend => node = parent,
                other => return self.follow(parent, other),
            }
        }
    }

    fn jump(&mut self, jump: Jump) -> Move {
        match jump {
            Jump::To(target) => {
                self.unwind(target, true);
                if self.pending_handler != Some(target) {
                    self.filled_chain.clear();
                    self.filled_resume = None;
                }
                let doc = Arc::clone(&self.doc);
                self.grammars
                    .retain(|g| doc.is_ancestor_or_self(g.field(), target));
                if !self.grammars.iter().any(Grammar::uses_voice) {
                    self.channel.detach_tap();
                }
                self.barging_in = false;
                debug!(target = target.index(), tag = doc.tag(target), "jump");
                Move::Enter(target)
            }
            Jump::After(node) => {
                self.unwind(node, false);
                self.barging_in = false;
                Move::Advance {
                    from: node,
                    descend: false,
                }
            }
            Jump::End(reason, detail) => {
                self.end(reason, detail);
                Move::Done
            }
        }
    }

    /// Pop scopes and catch frames that do not enclose `target`.
    fn unwind(&mut self, target: NodeId, keep_target: bool) {
        let doc = Arc::clone(&self.doc);
        let keeps = |owner: NodeId| {
            doc.is_ancestor_or_self(owner, target) && (keep_target || owner != target)
        };
        while let Some(&owner) = self.scopes.last() {
            if keeps(owner) {
                break;
            }
            self.scopes.pop();
            self.collab.script.pop_scope();
        }
        self.catch_stack.retain(|frame| keeps(frame.handler));
    }

    fn enter(&mut self, node: NodeId) -> Result<Outcome> {
        if self.flags.is_skipped(node) {
            return Ok(Outcome::Next);
        }
        let doc = Arc::clone(&self.doc);
        if let Some(text) = doc.text(node) {
            if !self.suppress_prompts && !self.barging_in {
                let ctx = self.render_ctx(node);
                self.speak(text, &ctx)?;
            }
            return Ok(Outcome::Next);
        }
        (super::handlers::lookup(doc.tag(node)).enter)(self, node)
    }

    fn exit(&mut self, node: NodeId) -> Result<Outcome> {
        if self.doc.text(node).is_some() {
            return Ok(Outcome::Next);
        }
        let tag = self.doc.tag(node).to_string();
        (super::handlers::lookup(&tag).exit)(self, node)
    }

    /// Errors become dialog events thrown at `node`; logic errors end the
    /// document.
    pub(super) fn guarded(
        &mut self,
        node: NodeId,
        phase: impl FnOnce(&mut Self) -> Result<Outcome>,
    ) -> Outcome {
        match phase(self) {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => {
                error!(node = node.index(), error = %e, "logic error; ending document");
                Outcome::end(EndReason::Logic, Some(e.to_string()))
            }
            Err(e) => {
                warn!(node = node.index(), tag = self.doc.tag(node), error = %e, "raising error event");
                let name = e.event_name();
                self.throw(&name, Some(e.to_string()), node, Resume::After(node))
            }
        }
    }

    pub(super) fn end(&mut self, reason: EndReason, detail: Option<String>) {
        if self.ended.is_some() && self.current.is_none() {
            return;
        }
        info!(?reason, detail = detail.as_deref().unwrap_or(""), "document ended");
        self.current = None;
        self.waiting = None;
        self.grammars.clear();
        self.channel.detach_tap();
        if self.recording == RecordingStatus::Recording {
            if let Err(e) = self.channel.stop_recording(StopReason::Explicit) {
                warn!(error = %e, "recording close failed");
            }
            self.recording = RecordingStatus::Finished;
        }
        self.ended = Some(reason);
        self.emitter.emit(SessionEventKind::Ended { reason, detail });
    }

    fn swap_document(&mut self, pending: PendingDocument) {
        info!(uri = pending.document.uri(), "swapping document");
        while self.scopes.pop().is_some() {
            self.collab.script.pop_scope();
        }
        self.flags.clear();
        self.grammars.clear();
        self.grammar_errors.clear();
        self.channel.detach_tap();
        self.catch_stack.clear();
        self.filled_chain.clear();
        self.filled_resume = None;
        self.pending_handler = None;
        self.pending_event = None;
        self.event_counts.clear();
        self.prompt_counts.clear();
        self.waiting = None;
        self.reentry = None;
        self.barging_in = false;
        self.suppress_prompts = false;
        if self.recording == RecordingStatus::Recording {
            if let Err(e) = self.channel.stop_recording(StopReason::Explicit) {
                warn!(error = %e, "recording close failed during document swap");
            }
        }
        self.recording = RecordingStatus::Idle;
        self.record_item = None;
        self.transfer = TransferStatus::Idle;

        self.doc = pending.document;
        self.entry_dialog = pending.entry.and_then(|id| {
            let found = self.doc.find_by_id(&id);
            if found.is_none() {
                warn!(dialog = %id, "entry dialog not found; starting at the first dialog");
            }
            found
        });
        self.ended = None;
        self.current = Some(self.doc.root());
        self.announce_document();
    }

    // ── Scopes and lookups ───────────────────────────────────────────────────

    pub(super) fn doc(&self) -> Arc<Document> {
        Arc::clone(&self.doc)
    }

    pub(super) fn script(&mut self) -> &mut dyn ScriptContext {
        self.collab.script.as_mut()
    }

    /// Push a scope owned by `owner`, replacing one it already holds.
    pub(super) fn enter_scope(&mut self, owner: NodeId, level: ScopeLevel) {
        self.leave(owner);
        self.collab.script.push_scope(level);
        self.scopes.push(owner);
    }

    pub(super) fn leave(&mut self, owner: NodeId) {
        while self.scopes.last() == Some(&owner) {
            self.scopes.pop();
            self.collab.script.pop_scope();
        }
    }

    pub(super) fn cond(&mut self, node: NodeId) -> Result<bool> {
        match self.doc.opt_attr(node, "cond") {
            Some(expr) => {
                let expr = expr.to_string();
                self.collab.script.eval_bool(&expr)
            }
            None => Ok(true),
        }
    }

    /// `expr_attr` evaluated if present, else the literal `attr`.
    pub(super) fn attr_or_expr(
        &mut self,
        node: NodeId,
        attr: &str,
        expr_attr: &str,
    ) -> Result<Option<String>> {
        let doc = self.doc();
        match doc.opt_attr(node, expr_attr) {
            Some(expr) => self.collab.script.eval(expr).map(Some),
            None => Ok(doc.opt_attr(node, attr).map(str::to_string)),
        }
    }

    pub(super) fn item_name(&self, item: NodeId) -> String {
        self.doc
            .opt_attr(item, "name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("_item{}", item.index()))
    }

    pub(super) fn property(&self, node: NodeId, name: &str) -> Option<String> {
        properties::lookup(&self.doc, node, name).map(str::to_string)
    }

    pub(super) fn language(&self, node: NodeId) -> String {
        self.doc
            .ancestors_inclusive(node)
            .find_map(|n| self.doc.opt_attr(n, "xml:lang"))
            .map(str::to_string)
            .unwrap_or_else(|| self.config.language.clone())
    }

    pub(super) fn fetch_bytes(&self, uri: &str, policy: FreshnessPolicy) -> Result<Vec<u8>> {
        let fetcher = self
            .collab
            .fetcher
            .as_deref()
            .ok_or_else(|| VxiError::NoResource(format!("no fetcher for {uri}")))?;
        fetch_cached(
            self.collab.cache.as_deref(),
            fetcher,
            uri,
            policy,
            self.config.fetch_timeout,
        )
    }

    /// `#id` jumps inside the live document; anything else is fetched,
    /// loaded and parked as the pending document.
    pub(super) fn goto_uri(&mut self, uri: &str) -> Result<Outcome> {
        let uri = uri.trim();
        if let Some(id) = uri.strip_prefix('#') {
            return self
                .doc
                .find_by_id(id)
                .map(Outcome::to)
                .ok_or_else(|| VxiError::bad_fetch(uri, "document", "notfound"));
        }
        let (path, entry) = match uri.split_once('#') {
            Some((path, frag)) => (path, Some(frag.to_string())),
            None => (uri, None),
        };
        let resolved = resolve_uri(self.doc.uri(), path);
        let bytes = self.fetch_bytes(&resolved, FreshnessPolicy::default())?;
        let document = self.collab.loader.load(&resolved, &bytes)?;
        info!(uri = %resolved, "next document fetched");
        let pending = PendingDocument {
            document: Arc::new(document),
            entry,
        };
        self.shared.signal(|t| t.pending = Some(pending));
        Ok(Outcome::Wait(Wait::Document))
    }

    // ── Input ────────────────────────────────────────────────────────────────

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::QueueEmpty => {
                let now = Instant::now();
                for grammar in &mut self.grammars {
                    grammar.arm(now);
                }
            }
            ChannelEvent::ItemFailed { label, event } => {
                warn!(item = %label, event = %event, "prompt could not be played");
            }
            ChannelEvent::RecordingStopped(summary) => self.on_recording_finished(summary),
            ChannelEvent::Closed => debug!("audio channel closed under the session"),
            ChannelEvent::ItemStarted { .. } | ChannelEvent::ItemFinished { .. } => {}
        }
    }

    fn route_input(&mut self, input: Input) {
        if self.current.is_none() {
            return;
        }
        if let Input::Dtmf(key) = input {
            if self.recording == RecordingStatus::Recording {
                match self.channel.recording_dtmf(key) {
                    Ok(Some(summary)) => self.on_recording_finished(summary),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "recording close failed"),
                }
                return;
            }
        }
        if self.channel.is_playing() {
            if !self.channel.active_interruptible() {
                debug!("input during uninterruptible prompt discarded");
                SessionDiagnostics::bump(&self.diagnostics.inputs_discarded);
                return;
            }
            let flushed = self.channel.flush();
            self.barging_in = true;
            debug!(flushed, "barge-in");
        }
        SessionDiagnostics::bump(&self.diagnostics.inputs_routed);
        let now = Instant::now();
        let mut routed = false;
        for grammar in self.grammars.iter_mut().filter(|g| g.state().is_active()) {
            grammar.on_input(&input, now);
            routed = true;
        }
        if !routed {
            if self.typeahead.len() < self.config.max_typeahead {
                self.typeahead.push_back(input);
            } else {
                debug!("typeahead full; input dropped");
            }
        }
    }

    fn check_timeouts(&mut self, now: Instant) {
        if self.waiting != Some(Wait::Input) || self.channel.is_playing() {
            return;
        }
        for grammar in &mut self.grammars {
            grammar.on_timeout(now);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.waiting != Some(Wait::Input) || self.channel.is_playing() {
            return None;
        }
        self.grammars.iter().filter_map(Grammar::deadline).min()
    }

    /// Open a grammar for `item` and wait for it. Typeahead is fed first.
    pub(super) fn start_grammar(&mut self, item: NodeId) -> Result<Outcome> {
        let doc = self.doc();
        let span = debug_span!("grammar", field = item.index(), tag = doc.tag(item));
        let _entered = span.enter();

        let kind = match super::handlers::grammar_kind(self, item) {
            Ok(kind) => kind,
            Err(e) => {
                warn!(error = %e, "grammar unavailable");
                self.grammar_errors.insert(item, e.event_name());
                self.grammars.push(Grammar::failed(item, GrammarState::BadFetch));
                return Ok(Outcome::Wait(Wait::Input));
            }
        };
        let timeout = self
            .prompt_timeout
            .take()
            .or_else(|| self.property(item, "timeout").and_then(|t| properties::parse_time(&t)))
            .unwrap_or(self.config.timeout);
        let termchar = self
            .property(item, "termchar")
            .and_then(|t| t.chars().next())
            .unwrap_or(self.config.termchar);
        let modes = InputModes::parse(
            &self
                .property(item, "inputmodes")
                .unwrap_or_else(|| self.config.inputmodes.clone()),
        );

        let mut grammar = Grammar::new(item, kind, vec![termchar], timeout);
        let now = Instant::now();
        let recognizer = self.collab.recognizer.clone().filter(|_| modes.voice);
        let state = match recognizer {
            Some(recognizer) => {
                let (producer, consumer) = create_frame_ring(FRAME_RING_CAPACITY);
                let shared = Arc::clone(&self.shared);
                let on_result: ResultCallback = Arc::new(move |result| {
                    shared.signal(|t| t.inputs.push_back(Input::Speech(result)));
                });
                let language = self.language(item);
                let state = grammar.start(
                    now,
                    modes,
                    Some(VoiceInput {
                        recognizer: recognizer.as_ref(),
                        language: &language,
                        audio: consumer,
                        on_result,
                    }),
                );
                if grammar.uses_voice() {
                    self.channel.attach_tap(producer);
                }
                state
            }
            None => grammar.start(now, modes, None),
        };
        SessionDiagnostics::bump(&self.diagnostics.grammars_started);
        debug!(?state, modes = %grammar.modes(), ?timeout, "grammar active");

        self.barging_in = false;
        self.suppress_prompts = false;
        self.reprompt = false;
        self.flags.update(item, |f| f.traversing = true);
        while grammar.state().is_active() {
            let Some(input) = self.typeahead.pop_front() else {
                break;
            };
            grammar.on_input(&input, now);
        }
        self.grammars.push(grammar);
        Ok(Outcome::Wait(Wait::Input))
    }

    /// Remove the first terminal grammar and turn it into an outcome.
    fn take_completed(&mut self) -> Option<(NodeId, Outcome)> {
        let idx = self
            .grammars
            .iter()
            .position(|g| g.state().is_terminal())?;
        let grammar = self.grammars.swap_remove(idx);
        self.grammars.clear();
        self.channel.detach_tap();
        if self.waiting == Some(Wait::Input) {
            self.waiting = None;
        }
        let field = grammar.field();
        self.flags.update(field, |f| f.traversing = false);
        let span = debug_span!("grammar", field = field.index(), kind = grammar.kind().name());
        let _entered = span.enter();
        let outcome = match grammar.state() {
            GrammarState::Filled => {
                SessionDiagnostics::bump(&self.diagnostics.grammars_filled);
                let value = grammar.value().to_string();
                drop(grammar);
                self.guarded(field, |w| w.fill(field, &value))
            }
            GrammarState::NoInput => self.throw_input_event("noinput", field),
            GrammarState::NoMatch => self.throw_input_event("nomatch", field),
            GrammarState::BadFetch => {
                let name = self
                    .grammar_errors
                    .remove(&field)
                    .unwrap_or_else(|| "error.badfetch.grammar".into());
                self.throw(&name, None, field, Resume::End(EndReason::Completed))
            }
            GrammarState::Illegal => self.throw(
                "error.unsupported.inputmodes",
                None,
                field,
                Resume::End(EndReason::Completed),
            ),
            other => {
                debug!(state = ?other, "grammar not terminal");
                Outcome::Next
            }
        };
        Some((field, outcome))
    }

    fn complete_grammar(&mut self) {
        if let Some((field, outcome)) = self.take_completed() {
            self.resume_with(field, outcome);
        }
    }

    // ── Completions ──────────────────────────────────────────────────────────

    /// Store a collected value and run the `filled` handlers it triggers.
    pub(super) fn fill(&mut self, item: NodeId, value: &str) -> Result<Outcome> {
        let doc = self.doc();
        if doc.tag(item) == "menu" {
            return self.choose(item, value);
        }
        let value = super::handlers::option_value(&doc, item, value);
        let name = self.item_name(item);
        self.collab.script.set(&name, &value)?;
        self.collab
            .script
            .set(&format!("{name}$.utterance"), &value)?;
        self.flags.set_filled(item, true);
        info!(field = %name, "field filled");
        self.emitter.emit(SessionEventKind::FieldFilled { name, value });
        self.run_filled(item)
    }

    /// Field-level `filled` first, then form-level ones whose namelist the
    /// item completes.
    pub(super) fn run_filled(&mut self, item: NodeId) -> Result<Outcome> {
        let doc = self.doc();
        let mut chain: VecDeque<NodeId> = doc.children_tagged(item, "filled").collect();
        if let Some(form) = doc.parent(item) {
            for handler in doc.children_tagged(form, "filled") {
                let names: Vec<String> = match doc.opt_attr(handler, "namelist") {
                    Some(list) => list.split_whitespace().map(str::to_string).collect(),
                    None => super::handlers::input_items(&doc, form)
                        .into_iter()
                        .map(|i| self.item_name(i))
                        .collect(),
                };
                let mut items = Vec::with_capacity(names.len());
                for name in &names {
                    let found = doc.find_item(form, name).ok_or_else(|| {
                        VxiError::Logic(format!("filled references unknown item '{name}'"))
                    })?;
                    items.push(found);
                }
                if !items.contains(&item) {
                    continue;
                }
                let fire = match doc.attr(handler, "mode") {
                    "any" => true,
                    _ => items.iter().all(|&i| self.flags.is_filled(i)),
                };
                if fire {
                    chain.push_back(handler);
                }
            }
        }
        match chain.pop_front() {
            Some(first) => {
                self.filled_chain = chain;
                self.filled_resume = Some(item);
                self.pending_handler = Some(first);
                Ok(Outcome::to(first))
            }
            None => Ok(Outcome::after(item)),
        }
    }

    /// Resolve a menu selection against its choices.
    fn choose(&mut self, menu: NodeId, value: &str) -> Result<Outcome> {
        let doc = self.doc();
        let picked = doc
            .children_tagged(menu, "choice")
            .enumerate()
            .find(|&(idx, choice)| {
                super::handlers::choice_dtmf(&doc, menu, idx, choice).as_deref() == Some(value)
                    || doc.text_content(choice).eq_ignore_ascii_case(value.trim())
            })
            .map(|(_, choice)| choice);
        let Some(choice) = picked else {
            debug!(value, "no choice matched");
            return Ok(self.throw_input_event("nomatch", menu));
        };
        let name = self.item_name(menu);
        self.emitter.emit(SessionEventKind::FieldFilled {
            name,
            value: value.to_string(),
        });
        if let Some(event) = doc.opt_attr(choice, "event") {
            return Ok(self.throw(event, None, choice, Resume::Reenter(menu)));
        }
        match self.attr_or_expr(choice, "next", "expr")? {
            Some(next) if !next.is_empty() => self.goto_uri(&next),
            _ => Err(VxiError::Semantic("choice without next".into())),
        }
    }

    fn on_recording_finished(&mut self, summary: RecordingSummary) {
        let Some(item) = self.record_item.take() else {
            debug!(path = %summary.path.display(), "recording stop with no record item");
            return;
        };
        self.recording = RecordingStatus::Finished;
        let name = self.item_name(item);
        self.store_recording(&name, &summary);
        self.emitter.emit(SessionEventKind::RecordingFinished {
            name,
            summary,
        });
        if self.waiting == Some(Wait::Recording) {
            self.waiting = None;
            let outcome = self.guarded(item, |w| {
                w.flags.set_filled(item, true);
                w.run_filled(item)
            });
            self.resume_with(item, outcome);
        } else {
            self.flags.set_filled(item, true);
        }
    }

    fn store_recording(&mut self, name: &str, summary: &RecordingSummary) {
        let vars = [
            (name.to_string(), summary.path.display().to_string()),
            (format!("{name}$.duration"), summary.duration_ms.to_string()),
            (format!("{name}$.size"), summary.bytes.to_string()),
            (
                format!("{name}$.termchar"),
                summary.terminator.map(String::from).unwrap_or_default(),
            ),
            (
                format!("{name}$.maxtime"),
                (summary.reason == StopReason::MaxTime).to_string(),
            ),
        ];
        for (var, value) in vars {
            if let Err(e) = self.collab.script.set(&var, &value) {
                warn!(var = %var, error = %e, "could not store recording result");
            }
        }
    }

    fn on_transfer_completed(&mut self, outcome: String) {
        let (Some(item), Some(Wait::Transfer)) = (self.current, self.waiting) else {
            warn!(outcome = %outcome, "transfer result with no transfer pending");
            return;
        };
        self.transfer = TransferStatus::Completed;
        self.waiting = None;
        info!(outcome = %outcome, "transfer completed");
        let result = self.guarded(item, |w| {
            let name = w.item_name(item);
            w.collab.script.set(&name, &outcome)?;
            w.flags.set_filled(item, true);
            w.emitter.emit(SessionEventKind::FieldFilled {
                name,
                value: outcome.clone(),
            });
            w.run_filled(item)
        });
        self.resume_with(item, result);
    }

    fn raise_hangup(&mut self) {
        let Some(at) = self.current else {
            return;
        };
        if self.disconnecting {
            return;
        }
        info!("caller hung up");
        self.disconnecting = true;
        self.grammars.clear();
        self.channel.detach_tap();
        self.typeahead.clear();
        self.channel.flush();
        if self.waiting.take() == Some(Wait::Recording) {
            match self.channel.stop_recording(StopReason::Hangup) {
                Ok(Some(summary)) => {
                    if let Some(item) = self.record_item.take() {
                        let name = self.item_name(item);
                        self.store_recording(&name, &summary);
                        self.flags.set_filled(item, true);
                        self.emitter
                            .emit(SessionEventKind::RecordingFinished { name, summary });
                    }
                    self.recording = RecordingStatus::Finished;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "recording close failed"),
            }
        }
        let outcome = self.throw(
            "connection.disconnect.hangup",
            None,
            at,
            Resume::End(EndReason::Disconnect),
        );
        self.resume_with(at, outcome);
    }
}
