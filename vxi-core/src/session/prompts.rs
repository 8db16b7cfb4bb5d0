//! Prompt rendering: speech through the synthesizer and the rendered-audio
//! cache, fetched audio with fallback content, breaks, menu enumeration.

use std::io::Write;

use tracing::{debug, warn};

use super::properties::{break_strength, parse_bool, parse_time};
use super::worker::Worker;
use super::SessionDiagnostics;
use crate::audio::{PlayableItem, PlayableSource};
use crate::cache::{CacheEntry, FreshnessPolicy};
use crate::document::{Document, NodeId};
use crate::error::{Result, VxiError};
use crate::events::SessionEventKind;
use crate::fetch::resolve_uri;
use crate::script::ScopeLevel;
use crate::speech::{select_voice, Gender, SayAs, VoiceSelector};

/// Inherited rendering state while walking prompt content.
#[derive(Debug, Clone)]
pub(super) struct RenderCtx {
    voice: VoiceSelector,
    say_as: SayAs,
    interruptible: bool,
}

fn apply_voice(sel: &mut VoiceSelector, doc: &Document, voice: NodeId) {
    if let Some(name) = doc.opt_attr(voice, "name") {
        sel.name = Some(name.to_string());
    }
    if let Some(gender) = doc.opt_attr(voice, "gender").and_then(Gender::parse) {
        sel.gender = Some(gender);
    }
    if let Some(lang) = doc.opt_attr(voice, "xml:lang") {
        sel.language = lang.to_string();
    }
}

fn seconds(raw: Option<&str>) -> Option<std::time::Duration> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
}

fn prompt_count(doc: &Document, prompt: NodeId) -> u32 {
    doc.opt_attr(prompt, "count")
        .and_then(|c| c.trim().parse().ok())
        .unwrap_or(1)
}

impl Worker {
    pub(super) fn render_ctx(&self, node: NodeId) -> RenderCtx {
        let doc = &self.doc;
        let interruptible = doc
            .nearest(node, &["prompt"])
            .and_then(|p| doc.opt_attr(p, "bargein"))
            .and_then(parse_bool)
            .or_else(|| self.property(node, "bargein").as_deref().and_then(parse_bool))
            .unwrap_or(self.config.bargein);
        let mut voice = VoiceSelector {
            name: None,
            language: self.language(node),
            gender: None,
        };
        let voices: Vec<NodeId> = doc
            .ancestors_inclusive(node)
            .filter(|&n| doc.tag(n) == "voice")
            .collect();
        for &v in voices.iter().rev() {
            apply_voice(&mut voice, doc, v);
        }
        RenderCtx {
            voice,
            say_as: SayAs::Text,
            interruptible,
        }
    }

    /// Whether `prompt` is the one its item plays on this visit.
    pub(super) fn prompt_selected(&mut self, prompt: NodeId) -> Result<bool> {
        let doc = self.doc();
        let Some(item) = doc.nearest(prompt, &["field", "record", "transfer", "menu"]) else {
            return Ok(true);
        };
        let Some(parent) = doc.parent(prompt) else {
            return Ok(true);
        };
        let visits = self.prompt_counts.get(&item).copied().unwrap_or(1).max(1);
        let mut best = None;
        for sibling in doc.children_tagged(parent, "prompt") {
            let count = prompt_count(&doc, sibling);
            if count > visits || !self.cond(sibling)? {
                continue;
            }
            if best.map_or(true, |b| count > b) {
                best = Some(count);
            }
        }
        Ok(best == Some(prompt_count(&doc, prompt)))
    }

    pub(super) fn render_prompt(&mut self, prompt: NodeId) -> Result<()> {
        let ctx = self.render_ctx(prompt);
        self.render_children(prompt, &ctx)
    }

    fn render_children(&mut self, node: NodeId, ctx: &RenderCtx) -> Result<()> {
        let doc = self.doc();
        for &child in doc.children(node) {
            self.render_node(child, ctx)?;
        }
        Ok(())
    }

    pub(super) fn render_node(&mut self, node: NodeId, ctx: &RenderCtx) -> Result<()> {
        let doc = self.doc();
        if let Some(text) = doc.text(node) {
            return self.speak(text, ctx);
        }
        match doc.tag(node) {
            "say-as" => {
                let mut inner = ctx.clone();
                inner.say_as = SayAs::parse(doc.attr(node, "interpret-as"));
                self.render_children(node, &inner)
            }
            "voice" => {
                let mut inner = ctx.clone();
                apply_voice(&mut inner.voice, &doc, node);
                self.render_children(node, &inner)
            }
            "audio" => self.play_audio(node, ctx),
            "break" => {
                let pause = doc
                    .opt_attr(node, "time")
                    .and_then(parse_time)
                    .unwrap_or_else(|| break_strength(doc.attr(node, "strength")));
                let item = PlayableItem::new(PlayableSource::silence(pause)).with_label("break");
                self.queue(item, ctx)
            }
            "value" => {
                let value = self.script().eval(doc.attr(node, "expr"))?;
                self.speak(&value, ctx)
            }
            "enumerate" => self.enumerate(node, ctx),
            _ => self.render_children(node, ctx),
        }
    }

    fn play_audio(&mut self, node: NodeId, ctx: &RenderCtx) -> Result<()> {
        let doc = self.doc();
        let src = self.attr_or_expr(node, "src", "expr")?.unwrap_or_default();
        if src.trim().is_empty() {
            return self.render_children(node, ctx);
        }
        let uri = resolve_uri(doc.uri(), &src);
        let policy = FreshnessPolicy {
            max_age: seconds(doc.opt_attr(node, "maxage")),
            max_stale: seconds(doc.opt_attr(node, "maxstale")).unwrap_or_default(),
        };
        match self.fetch_bytes(&uri, policy) {
            Ok(data) => {
                let item = PlayableItem::new(PlayableSource::Fetched {
                    uri: uri.clone(),
                    data: data.into(),
                });
                self.queue(item, ctx)
            }
            Err(e) if !doc.children(node).is_empty() => {
                warn!(uri = %uri, error = %e, "audio unavailable; rendering fallback");
                self.render_children(node, ctx)
            }
            Err(e) => Err(e),
        }
    }

    /// `<enumerate>` inside a menu: the template runs once per choice with
    /// `_prompt` and `_dtmf` bound; without one a default phrase is spoken.
    fn enumerate(&mut self, node: NodeId, ctx: &RenderCtx) -> Result<()> {
        let doc = self.doc();
        let Some(menu) = doc.nearest(node, &["menu"]) else {
            debug!("enumerate outside a menu ignored");
            return Ok(());
        };
        let choices: Vec<NodeId> = doc.children_tagged(menu, "choice").collect();
        for (idx, choice) in choices.into_iter().enumerate() {
            let text = doc.text_content(choice);
            let dtmf = super::handlers::choice_dtmf(&doc, menu, idx, choice);
            if doc.children(node).is_empty() {
                let phrase = match &dtmf {
                    Some(key) => format!("For {text}, press {key}."),
                    None => text,
                };
                self.speak(&phrase, ctx)?;
                continue;
            }
            self.enter_scope(node, ScopeLevel::Anonymous);
            let bound = self
                .script()
                .declare("_prompt", &text)
                .and_then(|()| {
                    let key = dtmf.clone().unwrap_or_default();
                    self.script().declare("_dtmf", &key)
                })
                .and_then(|()| self.render_children(node, ctx));
            self.leave(node);
            bound?;
        }
        Ok(())
    }

    /// Synthesize `text` (through the cache) and queue it.
    pub(super) fn speak(&mut self, text: &str, ctx: &RenderCtx) -> Result<()> {
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return Ok(());
        }
        let Some(synth) = self.collab.synthesizer.clone() else {
            debug!(text = %text, "no synthesizer; text skipped");
            return Ok(());
        };
        let voices = synth.voices();
        let voice = select_voice(&voices, &ctx.voice)
            .ok_or_else(|| VxiError::NoResource("synthesizer offers no voices".into()))?;
        let codec = self.channel.codec();
        let key = format!(
            "tts|{}|{}|{}@{}|{}",
            voice.name,
            ctx.say_as.as_str(),
            codec.name(),
            codec.sample_rate(),
            text
        );
        let audio = self.cached_render(&key, || synth.synthesize(voice, &text, ctx.say_as, codec))?;
        let item = PlayableItem::new(PlayableSource::Buffer(audio.into())).with_label(text);
        self.queue(item, ctx)
    }

    fn cached_render(&self, key: &str, render: impl FnOnce() -> Result<Vec<u8>>) -> Result<Vec<u8>> {
        let Some(cache) = self.collab.cache.clone() else {
            return render();
        };
        let rendered = match cache.start_entry(key, FreshnessPolicy::default())? {
            CacheEntry::Hit(reader) => match reader.into_bytes() {
                Ok(bytes) => {
                    debug!(key, bytes = bytes.len(), "rendered audio from cache");
                    Ok(bytes)
                }
                Err(e) => {
                    warn!(key, error = %e, "cached audio unreadable; rendering again");
                    render()
                }
            },
            CacheEntry::Miss(mut writer) => match render() {
                Ok(bytes) => {
                    writer.write_all(&bytes)?;
                    writer.finish(true)?;
                    Ok(bytes)
                }
                Err(e) => {
                    writer.finish(false)?;
                    Err(e)
                }
            },
        };
        rendered
    }

    fn queue(&mut self, item: PlayableItem, ctx: &RenderCtx) -> Result<()> {
        let item = item.with_interruptible(ctx.interruptible);
        let label = item.label.clone();
        self.channel.enqueue(item)?;
        SessionDiagnostics::bump(&self.diagnostics.prompts_queued);
        self.emitter.emit(SessionEventKind::PromptQueued { label });
        Ok(())
    }
}
