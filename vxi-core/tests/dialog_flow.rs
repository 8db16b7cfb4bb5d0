use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use vxi_core::fetch::FetchResponse;
use vxi_core::speech::stub::StubSynthesizer;
use vxi_core::{
    AudioChannel, ChannelConfig, Collaborators, DialogSession, Document, EndReason, Fetcher,
    NodeSpec, ResourceCache, SessionConfig, SessionEvent, SessionEventKind, VxiError,
};

fn el(tag: &str, attrs: &[(&str, &str)], children: Vec<NodeSpec>) -> NodeSpec {
    NodeSpec::element(tag, attrs, children)
}

fn text(t: &str) -> NodeSpec {
    NodeSpec::text(t)
}

fn log_expr(expr: &str) -> NodeSpec {
    el("log", &[("expr", expr)], vec![])
}

fn log_text(t: &str) -> NodeSpec {
    el("log", &[], vec![text(t)])
}

fn doc(uri: &str, children: Vec<NodeSpec>) -> Document {
    Document::from_spec(uri, &el("vxml", &[], children)).unwrap()
}

/// Serves canned JSON documents and counts requests.
#[derive(Default)]
struct MapFetcher {
    bodies: HashMap<String, Vec<u8>>,
    calls: AtomicUsize,
}

impl MapFetcher {
    fn with(mut self, uri: &str, spec: &NodeSpec) -> Self {
        self.bodies
            .insert(uri.to_string(), serde_json::to_vec(spec).unwrap());
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for MapFetcher {
    fn fetch(&self, uri: &str, _timeout: Duration) -> vxi_core::Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .get(uri)
            .map(|body| FetchResponse::new(body.clone()))
            .ok_or_else(|| VxiError::bad_fetch(uri, "mem", "notfound"))
    }
}

struct Harness {
    session: DialogSession,
    rx: broadcast::Receiver<SessionEvent>,
    _records: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tweak: impl FnOnce(&mut SessionConfig)) -> Harness {
    let records = tempfile::tempdir().unwrap();
    let mut config = SessionConfig {
        timeout: Duration::from_secs(10),
        record_dir: records.path().to_path_buf(),
        ..SessionConfig::default()
    };
    tweak(&mut config);
    let channel = Arc::new(AudioChannel::new(ChannelConfig {
        pacing: false,
        ..ChannelConfig::default()
    }));
    let session = DialogSession::new(config, channel);
    let rx = session.subscribe();
    Harness {
        session,
        rx,
        _records: records,
    }
}

fn next_event(rx: &mut broadcast::Receiver<SessionEvent>, deadline: Instant) -> SessionEventKind {
    loop {
        match rx.try_recv() {
            Ok(ev) => return ev.kind,
            Err(TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    panic!("timed out waiting for session event");
                }
                thread::sleep(Duration::from_millis(2));
            }
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Closed) => panic!("event channel closed unexpectedly"),
        }
    }
}

/// Collect events up to and including the first one matching `stop`.
fn collect_until(
    rx: &mut broadcast::Receiver<SessionEvent>,
    stop: impl Fn(&SessionEventKind) -> bool,
) -> Vec<SessionEventKind> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = Vec::new();
    loop {
        let ev = next_event(rx, deadline);
        let done = stop(&ev);
        seen.push(ev);
        if done {
            return seen;
        }
    }
}

fn until_ended(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEventKind> {
    collect_until(rx, |ev| matches!(ev, SessionEventKind::Ended { .. }))
}

fn logs(events: &[SessionEventKind]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            SessionEventKind::Log { message, .. } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn prompts(events: &[SessionEventKind]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            SessionEventKind::PromptQueued { label } => Some(label.clone()),
            _ => None,
        })
        .collect()
}

fn position(events: &[SessionEventKind], want: impl Fn(&SessionEventKind) -> bool) -> usize {
    events
        .iter()
        .position(want)
        .unwrap_or_else(|| panic!("event not found in {events:?}"))
}

fn wait_for(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}

fn with_synth() -> Collaborators {
    Collaborators {
        synthesizer: Some(Arc::new(StubSynthesizer::new())),
        ..Collaborators::default()
    }
}

/// Serves one body, but only after the test releases the request.
struct GatedFetcher {
    body: Vec<u8>,
    entered: Sender<()>,
    release: Receiver<()>,
}

impl Fetcher for GatedFetcher {
    fn fetch(&self, _uri: &str, _timeout: Duration) -> vxi_core::Result<FetchResponse> {
        let _ = self.entered.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        Ok(FetchResponse::new(self.body.clone()))
    }
}

fn end_of(events: &[SessionEventKind]) -> (EndReason, Option<String>) {
    match events.last() {
        Some(SessionEventKind::Ended { reason, detail }) => (*reason, detail.clone()),
        other => panic!("last event is not Ended: {other:?}"),
    }
}

#[test]
fn digits_fill_runs_filled_handler() {
    let mut h = harness();
    let document = doc(
        "mem:pin",
        vec![el(
            "form",
            &[("id", "main")],
            vec![el(
                "field",
                &[("name", "pin"), ("type", "digits")],
                vec![el("filled", &[], vec![log_expr("'pin=' + pin")])],
            )],
        )],
    );
    h.session.start(document, Collaborators::default()).unwrap();
    h.session.dtmf_sequence("1234#");

    let events = until_ended(&mut h.rx);
    assert!(events.contains(&SessionEventKind::FieldFilled {
        name: "pin".into(),
        value: "1234".into(),
    }));
    assert_eq!(logs(&events), vec!["pin=1234"]);
    assert_eq!(end_of(&events).0, EndReason::Completed);
    h.session.wait(Duration::from_secs(2)).unwrap();

    let diag = h.session.diagnostics_snapshot();
    assert_eq!(diag.grammars_started, 1);
    assert_eq!(diag.grammars_filled, 1);
}

#[test]
fn specific_event_bubbles_to_document_catch() {
    let mut h = harness();
    let document = doc(
        "mem:bubble",
        vec![
            el(
                "catch",
                &[("event", "error.custom")],
                vec![log_expr("'caught ' + _event")],
            ),
            el(
                "form",
                &[],
                vec![el(
                    "block",
                    &[],
                    vec![
                        el("throw", &[("event", "error.custom.deep")], vec![]),
                        log_text("after throw"),
                    ],
                )],
            ),
        ],
    );
    h.session.start(document, Collaborators::default()).unwrap();

    let events = until_ended(&mut h.rx);
    assert!(events.contains(&SessionEventKind::EventRaised {
        name: "error.custom.deep".into(),
        handled: true,
    }));
    // The handler runs, then traversal continues after the throwing node.
    assert_eq!(logs(&events), vec!["caught error.custom.deep", "after throw"]);
    assert_eq!(end_of(&events).0, EndReason::Completed);
}

#[test]
fn unhandled_event_ends_the_document() {
    let mut h = harness();
    let document = doc(
        "mem:unhandled",
        vec![el(
            "form",
            &[],
            vec![el(
                "block",
                &[],
                vec![
                    el("throw", &[("event", "com.example.oops")], vec![]),
                    log_text("never"),
                ],
            )],
        )],
    );
    h.session.start(document, Collaborators::default()).unwrap();

    let events = until_ended(&mut h.rx);
    assert!(logs(&events).is_empty());
    assert_eq!(
        end_of(&events),
        (EndReason::Unhandled, Some("com.example.oops".into()))
    );
    assert_eq!(h.session.diagnostics_snapshot().events_unhandled, 1);
}

#[test]
fn noinput_escalates_by_count() {
    let mut h = harness();
    let document = doc(
        "mem:noinput",
        vec![el(
            "form",
            &[],
            vec![
                el("property", &[("name", "timeout"), ("value", "30ms")], vec![]),
                el(
                    "field",
                    &[("name", "pin"), ("type", "digits")],
                    vec![
                        el("noinput", &[], vec![log_text("first")]),
                        el(
                            "noinput",
                            &[("count", "2")],
                            vec![log_text("second"), el("exit", &[], vec![])],
                        ),
                    ],
                ),
            ],
        )],
    );
    h.session.start(document, Collaborators::default()).unwrap();

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["first", "second"]);
    assert_eq!(end_of(&events).0, EndReason::Exit);
}

#[test]
fn goto_loads_the_next_document_at_its_entry_dialog() {
    let mut h = harness();
    let next = el(
        "vxml",
        &[],
        vec![
            el("form", &[("id", "a")], vec![el("block", &[], vec![log_text("in a")])]),
            el("form", &[("id", "b")], vec![el("block", &[], vec![log_text("in b")])]),
        ],
    );
    let fetcher = Arc::new(MapFetcher::default().with("next.json", &next));
    let document = doc(
        "mem:first",
        vec![el(
            "form",
            &[],
            vec![el("block", &[], vec![el("goto", &[("next", "next.json#b")], vec![])])],
        )],
    );
    let collab = Collaborators {
        fetcher: Some(fetcher.clone()),
        ..Collaborators::default()
    };
    h.session.start(document, collab).unwrap();

    let events = until_ended(&mut h.rx);
    let loaded: Vec<&str> = events
        .iter()
        .filter_map(|ev| match ev {
            SessionEventKind::DocumentLoaded { uri } => Some(uri.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(loaded, vec!["mem:first", "next.json"]);
    assert_eq!(logs(&events), vec!["in b"]);
    assert_eq!(end_of(&events).0, EndReason::Completed);
    assert_eq!(fetcher.calls(), 1);
}

#[test]
fn replaced_document_discards_the_old_grammar() {
    let mut h = harness();
    let first = doc(
        "mem:first",
        vec![el(
            "form",
            &[],
            vec![el("field", &[("name", "pin"), ("type", "digits")], vec![])],
        )],
    );
    h.session.start(first, Collaborators::default()).unwrap();
    collect_until(&mut h.rx, |ev| {
        matches!(ev, SessionEventKind::DocumentLoaded { .. })
    });

    let second = doc(
        "mem:second",
        vec![
            el("form", &[("id", "a")], vec![el("block", &[], vec![log_text("in a")])]),
            el(
                "form",
                &[("id", "b")],
                vec![el(
                    "field",
                    &[("name", "code"), ("type", "digits?length=2")],
                    vec![el("filled", &[], vec![log_expr("code")])],
                )],
            ),
        ],
    );
    h.session.replace_document(second, Some("b".into()));
    collect_until(&mut h.rx, |ev| {
        matches!(ev, SessionEventKind::DocumentLoaded { uri } if uri == "mem:second")
    });
    h.session.dtmf_sequence("42");

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["42"]);
    assert!(!events
        .iter()
        .any(|ev| matches!(ev, SessionEventKind::FieldFilled { name, .. } if name == "pin")));
}

#[test]
fn cached_document_is_not_fetched_again() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ResourceCache::open(cache_dir.path(), Duration::from_secs(300)).unwrap());
    let next = el("vxml", &[], vec![el("form", &[], vec![el("block", &[], vec![log_text("next")])])]);
    let fetcher = Arc::new(MapFetcher::default().with("next.json", &next));

    for _ in 0..2 {
        let mut h = harness();
        let document = doc(
            "mem:first",
            vec![el("form", &[], vec![el("block", &[], vec![el("goto", &[("next", "next.json")], vec![])])])],
        );
        let collab = Collaborators {
            fetcher: Some(fetcher.clone()),
            cache: Some(Arc::clone(&cache)),
            ..Collaborators::default()
        };
        h.session.start(document, collab).unwrap();
        let events = until_ended(&mut h.rx);
        assert_eq!(logs(&events), vec!["next"]);
    }

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(cache.stats(), (1, 1));
}

#[test]
fn hangup_runs_the_disconnect_handler() {
    let mut h = harness();
    let document = doc(
        "mem:hangup",
        vec![
            el(
                "catch",
                &[("event", "connection.disconnect.hangup")],
                vec![log_text("bye")],
            ),
            el(
                "form",
                &[],
                vec![el("field", &[("name", "pin"), ("type", "digits")], vec![])],
            ),
        ],
    );
    h.session.start(document, Collaborators::default()).unwrap();
    collect_until(&mut h.rx, |ev| {
        matches!(ev, SessionEventKind::DocumentLoaded { .. })
    });
    h.session.hangup();

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["bye"]);
    assert_eq!(end_of(&events).0, EndReason::Disconnect);
}

#[test]
fn menu_choice_jumps_to_its_dialog() {
    let mut h = harness();
    let document = doc(
        "mem:menu",
        vec![
            el(
                "menu",
                &[("id", "top"), ("dtmf", "true")],
                vec![
                    el("choice", &[("next", "#sales")], vec![text("sales")]),
                    el("choice", &[("next", "#support")], vec![text("support")]),
                ],
            ),
            el("form", &[("id", "sales")], vec![el("block", &[], vec![log_text("sales")])]),
            el("form", &[("id", "support")], vec![el("block", &[], vec![log_text("support")])]),
        ],
    );
    h.session.start(document, Collaborators::default()).unwrap();
    h.session.dtmf('2');

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["support"]);
    assert_eq!(end_of(&events).0, EndReason::Completed);
}

#[test]
fn transfer_waits_for_the_host_result() {
    let mut h = harness();
    let document = doc(
        "mem:transfer",
        vec![el(
            "form",
            &[],
            vec![el(
                "transfer",
                &[("name", "call"), ("dest", "tel:+15551234")],
                vec![el("filled", &[], vec![log_expr("call")])],
            )],
        )],
    );
    h.session.start(document, Collaborators::default()).unwrap();

    let events = collect_until(&mut h.rx, |ev| {
        matches!(ev, SessionEventKind::TransferRequested { .. })
    });
    assert_eq!(
        events.last(),
        Some(&SessionEventKind::TransferRequested {
            name: "call".into(),
            dest: "tel:+15551234".into(),
            bridge: false,
        })
    );
    h.session.transfer_completed("far_end_disconnect");

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["far_end_disconnect"]);
    assert_eq!(end_of(&events).0, EndReason::Completed);
}

#[test]
fn record_stops_on_dtmf() {
    let mut h = harness();
    let document = doc(
        "mem:record",
        vec![el(
            "form",
            &[],
            vec![el(
                "record",
                &[("name", "msg"), ("maxtime", "30s")],
                vec![el("filled", &[], vec![log_expr("msg$.termchar")])],
            )],
        )],
    );
    h.session.start(document, Collaborators::default()).unwrap();

    let channel = Arc::clone(h.session.channel());
    let deadline = Instant::now() + Duration::from_secs(5);
    while !channel.is_recording() {
        assert!(Instant::now() < deadline, "recording never started");
        thread::sleep(Duration::from_millis(2));
    }
    let frame = channel.codec().silence_frame(channel.config().interval);
    for _ in 0..10 {
        channel.write(&frame).unwrap();
    }
    h.session.dtmf('#');

    let events = until_ended(&mut h.rx);
    let summary = events
        .iter()
        .find_map(|ev| match ev {
            SessionEventKind::RecordingFinished { name, summary } if name == "msg" => {
                Some(summary.clone())
            }
            _ => None,
        })
        .expect("recording summary");
    assert_eq!(summary.terminator, Some('#'));
    assert_eq!(summary.duration_ms, 200);
    assert!(summary.path.exists());
    assert_eq!(logs(&events), vec!["#"]);
}

#[test]
fn redirection_cycle_ends_the_document_as_logic_error() {
    let mut h = harness_with(|c| c.redirect_cap = 5);
    let document = doc(
        "mem:cycle",
        vec![el(
            "form",
            &[],
            vec![el(
                "block",
                &[],
                vec![
                    log_text("start"),
                    el("goto", &[("id", "a"), ("next", "#b")], vec![]),
                    el("goto", &[("id", "b"), ("next", "#a")], vec![]),
                ],
            )],
        )],
    );
    h.session.start(document, Collaborators::default()).unwrap();

    let events = until_ended(&mut h.rx);
    assert_eq!(
        end_of(&events),
        (EndReason::Logic, Some("handler redirection cycle".into()))
    );
    assert_eq!(logs(&events), vec!["start"]);
    h.session.wait(Duration::from_secs(2)).unwrap();
    assert_eq!(h.session.diagnostics_snapshot().redirects, 6);
}

#[test]
fn input_barges_in_on_an_interruptible_prompt() {
    let mut h = harness();
    let document = doc(
        "mem:barge",
        vec![el(
            "form",
            &[],
            vec![el(
                "field",
                &[("name", "pin"), ("type", "digits?length=2")],
                vec![
                    el("prompt", &[], vec![text("please enter your pin")]),
                    el(
                        "filled",
                        &[],
                        vec![el("prompt", &[], vec![text("thank you")]), log_expr("pin")],
                    ),
                ],
            )],
        )],
    );
    h.session.start(document, with_synth()).unwrap();
    collect_until(&mut h.rx, |ev| matches!(ev, SessionEventKind::PromptQueued { .. }));
    let channel = Arc::clone(h.session.channel());
    assert!(channel.is_playing());

    // Nothing reads the channel, so only a flush can empty it.
    h.session.dtmf('4');
    wait_for("barge-in flush", || !channel.is_playing());
    h.session.dtmf('2');

    let events = until_ended(&mut h.rx);
    assert_eq!(prompts(&events), vec!["thank you"]);
    assert!(events.contains(&SessionEventKind::FieldFilled {
        name: "pin".into(),
        value: "42".into(),
    }));
    assert_eq!(logs(&events), vec!["42"]);
    let diag = h.session.diagnostics_snapshot();
    assert_eq!(diag.inputs_routed, 2);
    assert_eq!(diag.inputs_discarded, 0);
}

#[test]
fn uninterruptible_prompt_discards_input_until_it_finishes() {
    let mut h = harness();
    let document = doc(
        "mem:nobarge",
        vec![el(
            "form",
            &[],
            vec![el(
                "field",
                &[("name", "pin"), ("type", "digits?length=1")],
                vec![
                    el("prompt", &[("bargein", "false")], vec![text("listen carefully")]),
                    el("filled", &[], vec![log_expr("pin")]),
                ],
            )],
        )],
    );
    h.session.start(document, with_synth()).unwrap();
    collect_until(&mut h.rx, |ev| matches!(ev, SessionEventKind::PromptQueued { .. }));
    let channel = Arc::clone(h.session.channel());

    h.session.dtmf('5');
    wait_for("discarded input", || {
        h.session.diagnostics_snapshot().inputs_discarded == 1
    });
    assert!(channel.is_playing());

    let mut frame = Vec::new();
    let mut reads = 0;
    while channel.is_playing() {
        channel.read(&mut frame);
        reads += 1;
        assert!(reads < 1000, "prompt never finished");
    }
    h.session.dtmf('6');

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["6"]);
    let diag = h.session.diagnostics_snapshot();
    assert_eq!(diag.inputs_discarded, 1);
    assert_eq!(diag.inputs_routed, 1);
}

#[test]
fn input_signalled_with_a_swap_reaches_the_old_grammar_first() {
    let mut h = harness();
    let old = doc(
        "mem:old",
        vec![el(
            "form",
            &[],
            vec![
                el(
                    "field",
                    &[("name", "pin"), ("type", "digits?length=1")],
                    vec![
                        el("prompt", &[], vec![el("audio", &[("src", "hold.raw")], vec![])]),
                        el("filled", &[], vec![log_expr("'old ' + pin")]),
                    ],
                ),
                el("field", &[("name", "more"), ("type", "digits")], vec![]),
            ],
        )],
    );
    let new = doc(
        "mem:new",
        vec![el(
            "form",
            &[("id", "b")],
            vec![el(
                "field",
                &[("name", "code"), ("type", "digits?length=2")],
                vec![el("filled", &[], vec![log_expr("'new ' + code")])],
            )],
        )],
    );
    let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);
    let (release_tx, release_rx) = crossbeam_channel::bounded(1);
    let fetcher = Arc::new(GatedFetcher {
        body: vec![0u8; 320],
        entered: entered_tx,
        release: release_rx,
    });
    let collab = Collaborators {
        fetcher: Some(fetcher),
        ..Collaborators::default()
    };
    h.session.start(old, collab).unwrap();

    // The worker is parked mid-step inside the prompt fetch: both the key
    // and the replacement land before its next safe point.
    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    h.session.dtmf('7');
    h.session.replace_document(new, Some("b".into()));
    release_tx.send(()).unwrap();

    let events = collect_until(&mut h.rx, |ev| {
        matches!(ev, SessionEventKind::DocumentLoaded { uri } if uri == "mem:new")
    });
    let filled = position(&events, |ev| {
        matches!(ev, SessionEventKind::FieldFilled { name, value } if name == "pin" && value == "7")
    });
    let swapped = position(&events, |ev| {
        matches!(ev, SessionEventKind::DocumentLoaded { uri } if uri == "mem:new")
    });
    assert!(filled < swapped);
    assert_eq!(logs(&events), vec!["old 7"]);

    h.session.dtmf_sequence("42");
    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["new 42"]);
    assert_eq!(end_of(&events).0, EndReason::Completed);
}

#[test]
fn swap_during_recording_closes_the_recording() {
    let mut h = harness();
    let old = doc(
        "mem:rec",
        vec![el(
            "form",
            &[],
            vec![el("record", &[("name", "msg"), ("maxtime", "30s")], vec![])],
        )],
    );
    h.session.start(old, Collaborators::default()).unwrap();
    let channel = Arc::clone(h.session.channel());
    wait_for("recording start", || channel.is_recording());

    let next = doc(
        "mem:after",
        vec![el("form", &[], vec![el("block", &[], vec![log_text("after")])])],
    );
    h.session.replace_document(next, None);

    let events = until_ended(&mut h.rx);
    assert_eq!(logs(&events), vec!["after"]);
    assert!(!channel.is_recording());
    assert!(!events
        .iter()
        .any(|ev| matches!(ev, SessionEventKind::RecordingFinished { .. })));
}

#[test]
fn synthesized_prompt_is_rendered_once_through_the_cache() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ResourceCache::open(cache_dir.path(), Duration::from_secs(300)).unwrap());
    let synth = Arc::new(StubSynthesizer::new());

    for _ in 0..2 {
        let mut h = harness();
        let document = doc(
            "mem:greeting",
            vec![el(
                "form",
                &[],
                vec![el("block", &[], vec![el("prompt", &[], vec![text("welcome back")])])],
            )],
        );
        let collab = Collaborators {
            synthesizer: Some(synth.clone()),
            cache: Some(Arc::clone(&cache)),
            ..Collaborators::default()
        };
        h.session.start(document, collab).unwrap();
        let events = until_ended(&mut h.rx);
        assert_eq!(prompts(&events), vec!["welcome back"]);
    }

    assert_eq!(synth.calls(), 1);
    assert_eq!(cache.stats(), (1, 1));
}
