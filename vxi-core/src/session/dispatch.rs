//! Event throwing and catch-handler selection.
//!
//! Selection walks the generalisations of the event name
//! (`error.badfetch.http.404`, `error.badfetch.http`, ..., `error`, then the
//! catch-all) and for each one searches the ancestors of the throwing node,
//! nearest first. Among the handlers found on one ancestor the one with the
//! greatest `count` not above the occurrence count wins.

use tracing::{debug, info};

use super::worker::{CatchFrame, Outcome, Resume, Worker};
use super::SessionDiagnostics;
use crate::document::{Document, NodeId};
use crate::events::{EndReason, SessionEventKind};
use crate::script::ScriptContext;

const SHORTHAND: [&str; 4] = ["noinput", "nomatch", "error", "help"];

/// `a.b.c` → `["a.b.c", "a.b", "a", ""]`; the empty name is the catch-all.
pub(super) fn generalisations(name: &str) -> Vec<&str> {
    let mut out = vec![name];
    let mut rest = name;
    while let Some(idx) = rest.rfind('.') {
        rest = &rest[..idx];
        out.push(rest);
    }
    if !name.is_empty() {
        out.push("");
    }
    out
}

/// Event names `node` catches, or `None` if it is not a handler.
fn handled_events<'a>(doc: &'a Document, node: NodeId) -> Option<Vec<&'a str>> {
    match doc.tag(node) {
        "catch" => {
            let names: Vec<&str> = doc.attr(node, "event").split_whitespace().collect();
            Some(if names.is_empty() { vec![""] } else { names })
        }
        tag if SHORTHAND.contains(&tag) => Some(vec![tag]),
        _ => None,
    }
}

fn handler_count(doc: &Document, node: NodeId) -> u32 {
    doc.opt_attr(node, "count")
        .and_then(|c| c.trim().parse().ok())
        .unwrap_or(1)
}

/// Find the handler for `name` thrown at `at`, skipping `active` handlers.
pub(super) fn find_handler(
    doc: &Document,
    script: &mut dyn ScriptContext,
    name: &str,
    at: NodeId,
    occurrences: u32,
    active: &[NodeId],
) -> Option<NodeId> {
    for level in generalisations(name) {
        for scope in doc.ancestors_inclusive(at) {
            let mut best: Option<(u32, NodeId)> = None;
            for &child in doc.children(scope) {
                if active.contains(&child) {
                    continue;
                }
                let Some(events) = handled_events(doc, child) else {
                    continue;
                };
                if !events.contains(&level) {
                    continue;
                }
                let count = handler_count(doc, child);
                if count > occurrences {
                    continue;
                }
                let enabled = match doc.opt_attr(child, "cond") {
                    Some(cond) => script.eval_bool(cond).unwrap_or(false),
                    None => true,
                };
                if enabled && best.map_or(true, |(c, _)| count > c) {
                    best = Some((count, child));
                }
            }
            if let Some((_, handler)) = best {
                return Some(handler);
            }
        }
    }
    None
}

impl Worker {
    /// Throw `name` from `at`. `None` when no handler matched anywhere.
    pub(super) fn dispatch(
        &mut self,
        name: &str,
        message: Option<String>,
        at: NodeId,
        resume: Resume,
    ) -> Option<Outcome> {
        let occurrences = {
            let count = self.event_counts.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        SessionDiagnostics::bump(&self.diagnostics.events_raised);
        self.flags.update(at, |f| f.event_raised = true);

        let doc = self.doc();
        let active: Vec<NodeId> = self.catch_stack.iter().map(|f| f.handler).collect();
        let handler = find_handler(
            &doc,
            self.script(),
            name,
            at,
            occurrences,
            &active,
        );
        self.emitter.emit(SessionEventKind::EventRaised {
            name: name.to_string(),
            handled: handler.is_some(),
        });
        let Some(handler) = handler else {
            SessionDiagnostics::bump(&self.diagnostics.events_unhandled);
            info!(event = name, node = at.index(), "event unhandled");
            return None;
        };
        debug!(event = name, occurrences, handler = handler.index(), "event caught");
        self.pending_handler = Some(handler);
        self.pending_event = Some((name.to_string(), message));
        self.catch_stack.push(CatchFrame { handler, resume });
        Some(Outcome::to(handler))
    }

    /// Throw; an unmatched event ends the document.
    pub(super) fn throw(
        &mut self,
        name: &str,
        message: Option<String>,
        at: NodeId,
        resume: Resume,
    ) -> Outcome {
        self.dispatch(name, message, at, resume).unwrap_or_else(|| {
            let reason = if name.starts_with("connection.disconnect") {
                EndReason::Disconnect
            } else {
                EndReason::Unhandled
            };
            Outcome::end(reason, Some(name.to_string()))
        })
    }

    /// `noinput`/`nomatch` from a grammar. Unmatched, the item is simply
    /// visited again with its prompts.
    pub(super) fn throw_input_event(&mut self, name: &str, item: NodeId) -> Outcome {
        match self.dispatch(name, None, item, Resume::Reenter(item)) {
            Some(outcome) => outcome,
            None => {
                debug!(event = name, "no handler; revisiting item");
                self.suppress_prompts = false;
                self.reentry = Some(item);
                Outcome::to(item)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NodeSpec;
    use crate::script::SimpleScript;

    fn el(tag: &str, attrs: &[(&str, &str)], children: Vec<NodeSpec>) -> NodeSpec {
        NodeSpec::element(tag, attrs, children)
    }

    #[test]
    fn generalisation_chain() {
        assert_eq!(
            generalisations("error.badfetch.http.404"),
            vec!["error.badfetch.http.404", "error.badfetch.http", "error.badfetch", "error", ""]
        );
        assert_eq!(generalisations("help"), vec!["help", ""]);
    }

    #[test]
    fn specific_failure_bubbles_to_generic_ancestor() {
        let spec = el(
            "vxml",
            &[],
            vec![
                el("catch", &[("event", "error"), ("id", "doc-error")], vec![]),
                el(
                    "form",
                    &[],
                    vec![
                        el("catch", &[("event", "nomatch")], vec![]),
                        el("block", &[("name", "b")], vec![]),
                    ],
                ),
            ],
        );
        let doc = Document::from_spec("mem:d", &spec).unwrap();
        let block = doc.find_item(doc.root(), "b").unwrap();
        let mut script = SimpleScript::new();
        let found = find_handler(&doc, &mut script, "error.badfetch.http.404", block, 1, &[]);
        assert_eq!(found, doc.find_by_id("doc-error"));
        assert_eq!(find_handler(&doc, &mut script, "connection.disconnect.hangup", block, 1, &[]), None);
    }

    #[test]
    fn occurrence_count_picks_the_escalation() {
        let spec = el(
            "vxml",
            &[],
            vec![el(
                "form",
                &[],
                vec![el(
                    "field",
                    &[("name", "f")],
                    vec![
                        el("noinput", &[("id", "first")], vec![]),
                        el("noinput", &[("count", "3"), ("id", "third")], vec![]),
                    ],
                )],
            )],
        );
        let doc = Document::from_spec("mem:d", &spec).unwrap();
        let field = doc.find_item(doc.root(), "f").unwrap();
        let mut script = SimpleScript::new();
        let pick = |script: &mut SimpleScript, n| find_handler(&doc, script, "noinput", field, n, &[]);
        assert_eq!(pick(&mut script, 1), doc.find_by_id("first"));
        assert_eq!(pick(&mut script, 2), doc.find_by_id("first"));
        assert_eq!(pick(&mut script, 3), doc.find_by_id("third"));
        assert_eq!(pick(&mut script, 9), doc.find_by_id("third"));
    }

    #[test]
    fn conditions_and_active_handlers_are_skipped() {
        let spec = el(
            "vxml",
            &[],
            vec![
                el("catch", &[("id", "all")], vec![]),
                el("error", &[("cond", "false"), ("id", "off")], vec![]),
                el("block", &[("name", "b")], vec![]),
            ],
        );
        let doc = Document::from_spec("mem:d", &spec).unwrap();
        let block = doc.find_item(doc.root(), "b").unwrap();
        let all = doc.find_by_id("all").unwrap();
        let mut script = SimpleScript::new();
        assert_eq!(find_handler(&doc, &mut script, "error.semantic", block, 1, &[]), Some(all));
        assert_eq!(find_handler(&doc, &mut script, "error.semantic", block, 1, &[all]), None);
    }
}
