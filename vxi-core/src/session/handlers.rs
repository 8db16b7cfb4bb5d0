//! Two-phase node handlers, looked up by tag.
//!
//! `enter` runs when traversal reaches a node and decides whether to
//! descend, move on, redirect or wait. `exit` runs when traversal climbs
//! back out of a node it descended into. Unknown tags are transparent
//! containers.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::{debug, info};

use super::properties::{parse_bool, parse_time};
use super::worker::{Outcome, Resume, Wait, Worker};
use crate::audio::{PlayableItem, PlayableSource, RecordSettings};
use crate::cache::FreshnessPolicy;
use crate::document::{Document, NodeFlags, NodeId};
use crate::error::{Result, VxiError};
use crate::events::{EndReason, RecordingStatus, SessionEventKind, TransferStatus};
use crate::fetch::resolve_uri;
use crate::grammar::builtin::parse_builtin;
use crate::grammar::rule::RuleGrammar;
use crate::grammar::GrammarKind;
use crate::script::ScopeLevel;

type Phase = fn(&mut Worker, NodeId) -> Result<Outcome>;

#[derive(Clone, Copy)]
pub(super) struct NodeHandler {
    pub enter: Phase,
    pub exit: Phase,
}

fn handler(enter: Phase, exit: Phase) -> NodeHandler {
    NodeHandler { enter, exit }
}

static REGISTRY: OnceLock<HashMap<&'static str, NodeHandler>> = OnceLock::new();

pub(super) fn lookup(tag: &str) -> NodeHandler {
    REGISTRY
        .get_or_init(build_registry)
        .get(tag)
        .copied()
        .unwrap_or_else(|| handler(descend, next))
}

fn build_registry() -> HashMap<&'static str, NodeHandler> {
    let mut m = HashMap::new();
    m.insert("vxml", handler(enter_vxml, exit_vxml));
    m.insert("form", handler(enter_dialog, exit_form));
    m.insert("menu", handler(enter_dialog, exit_menu));
    m.insert("field", handler(enter_item, exit_field));
    m.insert("record", handler(enter_item, exit_record));
    m.insert("transfer", handler(enter_item, exit_transfer));
    m.insert("block", handler(enter_block, exit_block));
    m.insert("prompt", handler(enter_prompt, next));
    for tag in ["audio", "break", "say-as", "voice", "value", "enumerate"] {
        m.insert(tag, handler(enter_inline, next));
    }
    for tag in ["catch", "noinput", "nomatch", "error", "help"] {
        m.insert(tag, handler(enter_catch, exit_catch));
    }
    m.insert("filled", handler(enter_filled, exit_filled));
    m.insert("var", handler(enter_var, next));
    m.insert("assign", handler(enter_assign, next));
    m.insert("if", handler(enter_if, exit_if));
    m.insert("goto", handler(enter_goto, next));
    m.insert("submit", handler(enter_submit, next));
    m.insert("exit", handler(enter_exit, next));
    m.insert("disconnect", handler(enter_disconnect, next));
    m.insert("throw", handler(enter_throw, next));
    m.insert("log", handler(enter_log, next));
    m.insert("clear", handler(enter_clear, next));
    m.insert("reprompt", handler(enter_reprompt, next));
    m.insert("script", handler(enter_script, next));
    for tag in ["elseif", "else", "property", "grammar", "choice", "option"] {
        m.insert(tag, handler(next, next));
    }
    m
}

fn descend(_: &mut Worker, _: NodeId) -> Result<Outcome> {
    Ok(Outcome::Descend)
}

fn next(_: &mut Worker, _: NodeId) -> Result<Outcome> {
    Ok(Outcome::Next)
}

// ── Helpers shared with the worker ───────────────────────────────────────────

/// Items that collect input, in document order.
pub(super) fn input_items(doc: &Document, dialog: NodeId) -> Vec<NodeId> {
    doc.children(dialog)
        .iter()
        .copied()
        .filter(|&n| matches!(doc.tag(n), "field" | "record" | "transfer"))
        .collect()
}

/// Items the form interpretation selects from, in document order.
fn form_items(doc: &Document, dialog: NodeId) -> Vec<NodeId> {
    doc.children(dialog)
        .iter()
        .copied()
        .filter(|&n| matches!(doc.tag(n), "field" | "record" | "transfer" | "block"))
        .collect()
}

/// DTMF key of the `idx`-th choice; `<menu dtmf="true">` numbers choices
/// without one from 1.
pub(super) fn choice_dtmf(doc: &Document, menu: NodeId, idx: usize, choice: NodeId) -> Option<String> {
    doc.opt_attr(choice, "dtmf").map(str::to_string).or_else(|| {
        (doc.attr(menu, "dtmf") == "true" && idx < 9).then(|| (idx + 1).to_string())
    })
}

/// Map a matched token back to its `<option value>`.
pub(super) fn option_value(doc: &Document, field: NodeId, token: &str) -> String {
    doc.children_tagged(field, "option")
        .find(|&o| {
            doc.opt_attr(o, "dtmf") == Some(token) || doc.text_content(o).eq_ignore_ascii_case(token)
        })
        .map(|o| match doc.opt_attr(o, "value") {
            Some(v) => v.to_string(),
            None => doc.text_content(o),
        })
        .unwrap_or_else(|| token.to_string())
}

fn quoted(phrase: &str) -> String {
    format!("\"{}\"", phrase.replace('"', ""))
}

/// The grammar an item listens with: builtin `type`, a `<grammar>` child
/// (builtin, fetched or inline rule), `<option>` children, or menu choices.
pub(super) fn grammar_kind(w: &mut Worker, item: NodeId) -> Result<GrammarKind> {
    let doc = w.doc();
    if doc.tag(item) == "menu" {
        let phrases = doc
            .children_tagged(item, "choice")
            .map(|c| doc.text_content(c))
            .filter(|t| !t.is_empty())
            .collect();
        return Ok(GrammarKind::Menu { phrases });
    }
    if let Some(ty) = doc.opt_attr(item, "type") {
        return parse_builtin(ty);
    }
    if let Some(grammar) = doc.children_tagged(item, "grammar").next() {
        let source = match doc.opt_attr(grammar, "src") {
            Some(src) if src.trim_start().starts_with("builtin:") => return parse_builtin(src),
            Some(src) => {
                let uri = resolve_uri(doc.uri(), src);
                let bytes = w.fetch_bytes(&uri, FreshnessPolicy::default())?;
                String::from_utf8(bytes)
                    .map_err(|_| VxiError::Grammar(format!("{uri} is not UTF-8")))?
            }
            None => doc.text_content(grammar),
        };
        return Ok(GrammarKind::Rule(RuleGrammar::parse(source.trim())?));
    }
    let alternatives: Vec<String> = doc
        .children_tagged(item, "option")
        .flat_map(|o| {
            let dtmf = doc.opt_attr(o, "dtmf").map(quoted);
            let text = doc.text_content(o);
            dtmf.into_iter()
                .chain((!text.is_empty()).then(|| quoted(&text)))
        })
        .collect();
    if !alternatives.is_empty() {
        return Ok(GrammarKind::Rule(RuleGrammar::parse(&alternatives.join(" | "))?));
    }
    Err(VxiError::unsupported(
        "grammar",
        format!("<{}> declares no grammar", doc.tag(item)),
    ))
}

// ── Structure ────────────────────────────────────────────────────────────────

fn enter_vxml(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    w.enter_scope(node, ScopeLevel::Document);
    Ok(Outcome::Descend)
}

fn exit_vxml(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    w.leave(node);
    Ok(Outcome::end(EndReason::Completed, None))
}

/// Forms and menus: a fresh dialog scope and item variables, unless the
/// dialog is being revisited after one of its own events.
fn enter_dialog(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if let Some(entry) = w.entry_dialog.take() {
        if entry != node {
            return Ok(Outcome::to(entry));
        }
    }
    if w.reentry == Some(node) {
        w.reentry = None;
        *w.prompt_counts.entry(node).or_insert(0) += 1;
        return Ok(Outcome::Descend);
    }
    let doc = w.doc();
    w.enter_scope(node, ScopeLevel::Dialog);
    w.event_counts.clear();
    w.prompt_counts.insert(node, 1);
    w.flags.update(node, |f| *f = NodeFlags::default());
    for item in form_items(&doc, node) {
        w.flags.update(item, |f| *f = NodeFlags::default());
        w.prompt_counts.remove(&item);
        let Some(name) = doc.opt_attr(item, "name") else {
            continue;
        };
        let initial = match doc.opt_attr(item, "expr") {
            Some(expr) => w.script().eval(expr)?,
            None => String::new(),
        };
        w.script().declare(name, &initial)?;
        if !initial.is_empty() {
            w.flags.set_filled(item, true);
        }
    }
    debug!(dialog = doc.opt_attr(node, "id").unwrap_or(""), "dialog entered");
    Ok(Outcome::Descend)
}

/// Revisit the first unfilled item; with none left the document is done.
fn exit_form(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    for item in form_items(&doc, node) {
        if !w.flags.is_filled(item) && w.cond(item)? {
            return Ok(Outcome::to(item));
        }
    }
    w.leave(node);
    Ok(Outcome::end(EndReason::Completed, None))
}

fn exit_menu(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    w.start_grammar(node)
}

fn enter_item(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.reentry == Some(node) {
        w.reentry = None;
    }
    if w.flags.is_filled(node) || !w.cond(node)? {
        return Ok(Outcome::Next);
    }
    *w.prompt_counts.entry(node).or_insert(0) += 1;
    Ok(Outcome::Descend)
}

fn exit_field(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.flags.is_filled(node) {
        return Ok(Outcome::Next);
    }
    w.start_grammar(node)
}

fn exit_record(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.flags.is_filled(node) {
        return Ok(Outcome::Next);
    }
    let doc = w.doc();
    let codec = w.channel.codec();
    if doc.opt_attr(node, "beep").and_then(parse_bool).unwrap_or(false) {
        w.channel
            .enqueue(PlayableItem::new(PlayableSource::beep()).with_label("beep"))?;
    }
    w.record_seq += 1;
    let name = w.item_name(node);
    let ext = if codec.is_linear() { "wav" } else { codec.name() };
    let path = w.config.record_dir.join(format!(
        "vxi-{}-{}-{}.{ext}",
        std::process::id(),
        name,
        w.record_seq
    ));
    let settings = RecordSettings {
        path,
        max_time: doc.opt_attr(node, "maxtime").and_then(parse_time),
        final_silence: doc.opt_attr(node, "finalsilence").and_then(parse_time),
        dtmf_term: doc
            .opt_attr(node, "dtmfterm")
            .and_then(parse_bool)
            .unwrap_or(true),
    };
    w.channel.start_recording(settings)?;
    w.recording = RecordingStatus::Recording;
    w.record_item = Some(node);
    info!(item = %name, "recording");
    Ok(Outcome::Wait(Wait::Recording))
}

fn exit_transfer(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.flags.is_filled(node) {
        return Ok(Outcome::Next);
    }
    let dest = w.attr_or_expr(node, "dest", "destexpr")?.unwrap_or_default();
    if dest.trim().is_empty() {
        return Err(VxiError::Semantic("transfer without a destination".into()));
    }
    let bridge = w
        .doc
        .opt_attr(node, "bridge")
        .and_then(parse_bool)
        .unwrap_or(false);
    let name = w.item_name(node);
    w.transfer = TransferStatus::Pending;
    info!(item = %name, dest = %dest, bridge, "transfer requested");
    w.emitter
        .emit(SessionEventKind::TransferRequested { name, dest, bridge });
    Ok(Outcome::Wait(Wait::Transfer))
}

fn enter_block(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.flags.is_filled(node) || !w.cond(node)? {
        return Ok(Outcome::Next);
    }
    w.flags.set_filled(node, true);
    w.enter_scope(node, ScopeLevel::Anonymous);
    Ok(Outcome::Descend)
}

fn exit_block(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    w.leave(node);
    Ok(Outcome::Next)
}

// ── Output ───────────────────────────────────────────────────────────────────

fn enter_prompt(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.suppress_prompts || w.barging_in {
        return Ok(Outcome::Next);
    }
    if !w.cond(node)? || !w.prompt_selected(node)? {
        return Ok(Outcome::Next);
    }
    if let Some(timeout) = w.doc.opt_attr(node, "timeout").and_then(parse_time) {
        w.prompt_timeout = Some(timeout);
    }
    w.render_prompt(node)?;
    Ok(Outcome::Next)
}

/// Prompt content written directly in executable content.
fn enter_inline(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.suppress_prompts || w.barging_in {
        return Ok(Outcome::Next);
    }
    let ctx = w.render_ctx(node);
    w.render_node(node, &ctx)?;
    Ok(Outcome::Next)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn enter_catch(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.pending_handler != Some(node) {
        return Ok(Outcome::Next);
    }
    w.pending_handler = None;
    w.enter_scope(node, ScopeLevel::Anonymous);
    let (event, message) = w.pending_event.take().unwrap_or_default();
    w.script().declare("_event", &event)?;
    w.script()
        .declare("_message", message.as_deref().unwrap_or(""))?;
    Ok(Outcome::Descend)
}

fn exit_catch(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    w.leave(node);
    let idx = w.catch_stack.iter().rposition(|f| f.handler == node);
    let frame = idx.map(|idx| w.catch_stack.remove(idx));
    Ok(match frame.map(|f| f.resume) {
        Some(Resume::Reenter(item)) => {
            w.suppress_prompts = !w.reprompt;
            w.reprompt = false;
            w.reentry = Some(item);
            Outcome::to(item)
        }
        Some(Resume::After(at)) => Outcome::after(at),
        Some(Resume::End(reason)) => Outcome::end(reason, None),
        None => Outcome::Next,
    })
}

fn enter_filled(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    if w.pending_handler != Some(node) {
        return Ok(Outcome::Next);
    }
    w.pending_handler = None;
    w.enter_scope(node, ScopeLevel::Anonymous);
    Ok(Outcome::Descend)
}

fn exit_filled(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    w.leave(node);
    if let Some(next) = w.filled_chain.pop_front() {
        w.pending_handler = Some(next);
        return Ok(Outcome::to(next));
    }
    Ok(match w.filled_resume.take() {
        Some(item) => Outcome::after(item),
        None => Outcome::Next,
    })
}

// ── Executable content ───────────────────────────────────────────────────────

fn enter_var(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let name = doc.attr(node, "name");
    if name.is_empty() {
        return Err(VxiError::Semantic("<var> without a name".into()));
    }
    let value = match doc.opt_attr(node, "expr") {
        Some(expr) => w.script().eval(expr)?,
        None => String::new(),
    };
    w.script().declare(name, &value)?;
    Ok(Outcome::Next)
}

fn enter_assign(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let name = doc.attr(node, "name");
    if name.is_empty() {
        return Err(VxiError::Semantic("<assign> without a name".into()));
    }
    let value = w.script().eval(doc.attr(node, "expr"))?;
    w.script().set(name, &value)?;
    Ok(Outcome::Next)
}

/// Split the children into `if`/`elseif`/`else` branches and mark every
/// branch but the chosen one as skipped.
fn enter_if(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let mut branches: Vec<(NodeId, Vec<NodeId>)> = vec![(node, Vec::new())];
    for &child in doc.children(node) {
        match doc.tag(child) {
            "elseif" | "else" => branches.push((child, Vec::new())),
            _ => {
                if let Some((_, members)) = branches.last_mut() {
                    members.push(child);
                }
            }
        }
    }
    let mut chosen = None;
    for (idx, (head, _)) in branches.iter().enumerate() {
        let taken = match doc.tag(*head) {
            "else" => true,
            _ => w.script().eval_bool(doc.attr(*head, "cond"))?,
        };
        if taken {
            chosen = Some(idx);
            break;
        }
    }
    for (idx, (head, members)) in branches.iter().enumerate() {
        if *head != node {
            w.flags.update(*head, |f| f.skipped = true);
        }
        let skipped = chosen != Some(idx);
        for &member in members {
            w.flags.update(member, |f| f.skipped = skipped);
        }
    }
    Ok(Outcome::Descend)
}

fn exit_if(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    for &child in doc.children(node) {
        w.flags.update(child, |f| f.skipped = false);
    }
    Ok(Outcome::Next)
}

fn enter_goto(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    if let Some(item) = w.attr_or_expr(node, "nextitem", "expritem")? {
        let dialog = doc.nearest(node, &["form", "menu"]).unwrap_or(doc.root());
        let target = doc
            .find_item(dialog, &item)
            .ok_or_else(|| VxiError::Semantic(format!("goto: no item named '{item}'")))?;
        w.flags.set_filled(target, false);
        return Ok(Outcome::to(target));
    }
    let uri = w.attr_or_expr(node, "next", "expr")?.unwrap_or_default();
    if uri.trim().is_empty() {
        return Err(VxiError::Semantic("<goto> without a target".into()));
    }
    w.goto_uri(&uri)
}

/// `next` plus a query string built from `namelist`.
pub(super) fn submit_uri(next: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return next.to_string();
    }
    let (base, fragment) = match next.split_once('#') {
        Some((base, frag)) => (base, Some(frag)),
        None => (next, None),
    };
    let query: Vec<String> = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    let sep = if base.contains('?') { '&' } else { '?' };
    let mut uri = format!("{base}{sep}{}", query.join("&"));
    if let Some(frag) = fragment {
        uri.push('#');
        uri.push_str(frag);
    }
    uri
}

fn enter_submit(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let next = w.attr_or_expr(node, "next", "expr")?.unwrap_or_default();
    if next.trim().is_empty() {
        return Err(VxiError::Semantic("<submit> without a target".into()));
    }
    let pairs: Vec<(String, String)> = doc
        .attr(node, "namelist")
        .split_whitespace()
        .map(|name| {
            let value = w.script().get(name).unwrap_or_default();
            (name.to_string(), value)
        })
        .collect();
    w.goto_uri(&submit_uri(&next, &pairs))
}

fn enter_exit(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let detail = match w.doc.opt_attr(node, "expr") {
        Some(expr) => {
            let expr = expr.to_string();
            Some(w.script().eval(&expr)?)
        }
        None => None,
    };
    Ok(Outcome::end(EndReason::Exit, detail))
}

fn enter_disconnect(_: &mut Worker, _: NodeId) -> Result<Outcome> {
    Ok(Outcome::end(EndReason::Disconnect, None))
}

fn enter_throw(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let event = w.attr_or_expr(node, "event", "eventexpr")?.unwrap_or_default();
    if event.trim().is_empty() {
        return Err(VxiError::Semantic("<throw> without an event".into()));
    }
    let message = w.attr_or_expr(node, "message", "messageexpr")?;
    Ok(w.throw(event.trim(), message, node, Resume::After(node)))
}

fn enter_log(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let mut parts = Vec::new();
    if let Some(expr) = doc.opt_attr(node, "expr") {
        parts.push(w.script().eval(expr)?);
    }
    for &child in doc.children(node) {
        if let Some(text) = doc.text(child) {
            parts.push(text.trim().to_string());
        } else if doc.tag(child) == "value" {
            parts.push(w.script().eval(doc.attr(child, "expr"))?);
        }
    }
    let message = parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let label = doc.opt_attr(node, "label").map(str::to_string);
    info!(label = label.as_deref().unwrap_or(""), "{message}");
    w.emitter.emit(SessionEventKind::Log { label, message });
    Ok(Outcome::Next)
}

fn enter_clear(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let dialog = doc.nearest(node, &["form", "menu"]).unwrap_or(doc.root());
    let items: Vec<NodeId> = match doc.opt_attr(node, "namelist") {
        Some(list) => list
            .split_whitespace()
            .map(|name| {
                doc.find_item(dialog, name)
                    .ok_or_else(|| VxiError::Semantic(format!("clear: no item named '{name}'")))
            })
            .collect::<Result<_>>()?,
        None => form_items(&doc, dialog),
    };
    for item in items {
        let name = w.item_name(item);
        w.script().set(&name, "")?;
        w.flags.set_filled(item, false);
        w.prompt_counts.remove(&item);
    }
    Ok(Outcome::Next)
}

fn enter_reprompt(w: &mut Worker, _: NodeId) -> Result<Outcome> {
    w.reprompt = true;
    Ok(Outcome::Next)
}

fn enter_script(w: &mut Worker, node: NodeId) -> Result<Outcome> {
    let doc = w.doc();
    let source = match doc.opt_attr(node, "src") {
        Some(src) => {
            let uri = resolve_uri(doc.uri(), src);
            let bytes = w.fetch_bytes(&uri, FreshnessPolicy::default())?;
            String::from_utf8(bytes)
                .map_err(|_| VxiError::Semantic(format!("script {uri} is not UTF-8")))?
        }
        None => doc
            .children(node)
            .iter()
            .filter_map(|&c| doc.text(c))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    w.script().exec(&source)?;
    Ok(Outcome::Next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::NodeSpec;

    #[test]
    fn every_element_has_a_handler() {
        for tag in [
            "vxml", "form", "menu", "choice", "field", "block", "prompt", "audio", "break",
            "say-as", "voice", "value", "var", "assign", "if", "elseif", "else", "goto",
            "submit", "exit", "disconnect", "throw", "log", "clear", "reprompt", "record",
            "transfer", "filled", "catch", "noinput", "nomatch", "error", "help", "property",
            "grammar", "script",
        ] {
            assert!(build_registry().contains_key(tag), "{tag}");
        }
    }

    #[test]
    fn submit_query_encoding() {
        let pairs = vec![
            ("pin".to_string(), "12 34".to_string()),
            ("who".to_string(), "a&b".to_string()),
        ];
        assert_eq!(
            submit_uri("next.json#main", &pairs),
            "next.json?pin=12%2034&who=a%26b#main"
        );
        assert_eq!(submit_uri("n?x=1", &pairs[..1]), "n?x=1&pin=12%2034");
        assert_eq!(submit_uri("n", &[]), "n");
        let utf8 = [("city".to_string(), "Zürich/Nord".to_string())];
        assert_eq!(submit_uri("n", &utf8), "n?city=Z%C3%BCrich%2FNord");
    }

    #[test]
    fn menu_choice_keys_and_option_values() {
        let spec = NodeSpec::element(
            "vxml",
            &[],
            vec![
                NodeSpec::element(
                    "menu",
                    &[("dtmf", "true"), ("id", "m")],
                    vec![
                        NodeSpec::element("choice", &[("next", "#a")], vec![NodeSpec::text("sales")]),
                        NodeSpec::element(
                            "choice",
                            &[("next", "#b"), ("dtmf", "0")],
                            vec![NodeSpec::text("operator")],
                        ),
                    ],
                ),
                NodeSpec::element(
                    "form",
                    &[],
                    vec![NodeSpec::element(
                        "field",
                        &[("name", "drink")],
                        vec![
                            NodeSpec::element(
                                "option",
                                &[("dtmf", "1"), ("value", "coffee")],
                                vec![NodeSpec::text("coffee please")],
                            ),
                            NodeSpec::element("option", &[("dtmf", "2")], vec![NodeSpec::text("tea")]),
                        ],
                    )],
                ),
            ],
        );
        let doc = Document::from_spec("mem:m", &spec).unwrap();
        let menu = doc.find_by_id("m").unwrap();
        let choices: Vec<NodeId> = doc.children_tagged(menu, "choice").collect();
        assert_eq!(choice_dtmf(&doc, menu, 0, choices[0]).as_deref(), Some("1"));
        assert_eq!(choice_dtmf(&doc, menu, 1, choices[1]).as_deref(), Some("0"));

        let field = doc.find_item(doc.root(), "drink").unwrap();
        assert_eq!(option_value(&doc, field, "1"), "coffee");
        assert_eq!(option_value(&doc, field, "tea"), "tea");
        assert_eq!(option_value(&doc, field, "9"), "9");
        assert_eq!(input_items(&doc, doc.parent(field).unwrap()), vec![field]);
    }
}
