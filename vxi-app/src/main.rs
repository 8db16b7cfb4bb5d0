//! `vxi`: run one dialog document against a file-backed call leg.
//!
//! Outbound audio (prompts) is written to a raw file in the channel codec;
//! inbound audio comes from a raw or WAV file. DTMF and recognised speech
//! are injected from the command line after a short delay, and every session
//! event is logged as JSON.

mod settings;

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use url::Url;
use vxi_core::audio::codec::read_frame;
use vxi_core::fetch::FetchResponse;
use vxi_core::speech::stub::{StubRecognizer, StubSynthesizer};
use vxi_core::{
    AudioChannel, Collaborators, DialogSession, Document, FileFetcher, Fetcher, HttpFetcher,
    Recognition, ResourceCache, SessionEventKind,
};

use settings::{default_settings_path, load_settings, AppSettings};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Dialog document (JSON node tree)
    document: PathBuf,

    /// Settings file (defaults to the user data directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Inbound caller audio: raw frames in the channel codec, or a .wav file
    #[arg(long)]
    inbound: Option<PathBuf>,

    /// Where outbound audio is written (raw, channel codec)
    #[arg(long)]
    outbound: Option<PathBuf>,

    /// DTMF keys to send, e.g. "1234#"
    #[arg(long)]
    dtmf: Option<String>,

    /// Final recognition result to deliver once a voice grammar listens
    #[arg(long)]
    say: Option<String>,

    /// Delay before injecting input, in milliseconds
    #[arg(long, default_value_t = 1000)]
    input_delay_ms: u64,

    /// Hang up after this many seconds instead of waiting for the document
    #[arg(long)]
    hangup_after: Option<u64>,
}

/// File paths through [`FileFetcher`], `http(s)://` through [`HttpFetcher`].
struct HostFetcher {
    file: FileFetcher,
    http: Option<HttpFetcher>,
}

impl Fetcher for HostFetcher {
    fn fetch(&self, uri: &str, timeout: Duration) -> vxi_core::Result<FetchResponse> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return match &self.http {
                Some(http) => http.fetch(uri, timeout),
                None => Err(vxi_core::VxiError::bad_fetch(uri, "http", "unavailable")),
            };
        }
        self.file.fetch(uri, timeout)
    }
}

fn load_document(path: &Path) -> Result<Document> {
    let abs = path
        .canonicalize()
        .with_context(|| format!("document {}", path.display()))?;
    let bytes = std::fs::read(&abs)?;
    let uri = Url::from_file_path(&abs)
        .map_err(|()| anyhow!("{} is not an absolute path", abs.display()))?;
    Document::from_json(uri.to_string(), &bytes).with_context(|| format!("parse {}", abs.display()))
}

/// Inbound audio as a byte stream in the channel codec. WAV input must
/// already be 16-bit mono at the channel rate.
fn open_inbound(path: &Path, settings: &AppSettings) -> Result<Box<dyn Read + Send>> {
    let is_wav = path
        .extension()
        .map_or(false, |e| e.eq_ignore_ascii_case("wav"));
    if !is_wav {
        return Ok(Box::new(BufReader::new(File::open(path)?)));
    }
    if settings.codec != "linear16" {
        bail!("WAV inbound audio needs the linear16 codec");
    }
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.channels != 1 || spec.bits_per_sample != 16 || spec.sample_rate != settings.sample_rate {
        bail!(
            "{}: expected mono 16-bit {} Hz, got {} ch {}-bit {} Hz",
            path.display(),
            settings.sample_rate,
            spec.channels,
            spec.bits_per_sample,
            spec.sample_rate
        );
    }
    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.extend_from_slice(&sample?.to_le_bytes());
    }
    Ok(Box::new(Cursor::new(pcm)))
}

/// Paced media loop: one outbound and one inbound frame per interval.
fn run_media(
    channel: Arc<AudioChannel>,
    mut inbound: Option<Box<dyn Read + Send>>,
    mut outbound: Option<BufWriter<File>>,
    running: Arc<AtomicBool>,
) {
    let config = *channel.config();
    let format = config.codec.frame_format(config.interval);
    let silence = config.codec.silence_frame(config.interval);
    let mut out = Vec::new();
    let mut frame = Vec::new();
    while running.load(Ordering::Relaxed) {
        channel.read(&mut out);
        if let Some(writer) = outbound.as_mut() {
            if let Err(e) = writer.write_all(&out) {
                warn!(error = %e, "outbound write failed; discarding further audio");
                outbound = None;
            }
        }
        let got = match inbound.as_mut() {
            Some(reader) => match read_frame(format, reader.as_mut(), &mut frame) {
                Ok(got) => got,
                Err(e) => {
                    warn!(error = %e, "inbound audio unreadable; sending silence");
                    false
                }
            },
            None => false,
        };
        if !got {
            inbound = None;
            frame.clone_from(&silence);
        }
        if let Err(e) = channel.write(&frame) {
            debug!(error = %e, "inbound frame rejected");
        }
    }
    if let Some(mut writer) = outbound {
        if let Err(e) = writer.flush() {
            warn!(error = %e, "outbound audio not fully flushed");
        }
    }
    let counters = channel.counters();
    info!(
        frames_read = counters.frames_read,
        frames_written = counters.frames_written,
        silence_frames = counters.silence_frames,
        "media loop stopped"
    );
}

fn main() -> Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("vxi=info,vxi_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let settings = load_settings(&settings_path);
    info!(
        settings_path = ?settings_path,
        codec = %settings.codec,
        frame_ms = settings.frame_ms,
        "host settings loaded"
    );

    // ── Collaborators ─────────────────────────────────────────────────────
    let document = load_document(&cli.document)?;
    let root = cli
        .document
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let http = match HttpFetcher::new() {
        Ok(http) => Some(http),
        Err(e) => {
            warn!(error = %e, "http fetching unavailable");
            None
        }
    };
    let fetcher = Arc::new(HostFetcher {
        file: FileFetcher::new(root),
        http,
    });
    let cache = Arc::new(
        ResourceCache::open(
            settings.cache_dir(),
            Duration::from_secs(settings.cache_ttl_secs),
        )
        .context("open resource cache")?,
    );
    let recognizer = Arc::new(StubRecognizer::new());
    let mut collab = Collaborators {
        fetcher: Some(fetcher),
        cache: Some(cache),
        ..Collaborators::default()
    };
    if settings.stub_speech {
        collab.synthesizer = Some(Arc::new(StubSynthesizer::new()));
        collab.recognizer = Some(recognizer.clone());
    }

    // ── Session ───────────────────────────────────────────────────────────
    let channel = Arc::new(AudioChannel::new(settings.channel_config()));
    let session = DialogSession::new(settings.session_config(), Arc::clone(&channel));
    let mut events = session.subscribe();
    let logger = thread::Builder::new()
        .name("vxi-events".into())
        .spawn(move || loop {
            match events.blocking_recv() {
                Ok(event) => {
                    let ended = matches!(event.kind, SessionEventKind::Ended { .. });
                    match serde_json::to_string(&event) {
                        Ok(json) => info!(target: "vxi::events", "{json}"),
                        Err(e) => warn!(error = %e, "event not serialisable"),
                    }
                    if ended {
                        return;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event logger lagged"),
                Err(RecvError::Closed) => return,
            }
        })?;

    let inbound = cli
        .inbound
        .as_deref()
        .map(|p| open_inbound(p, &settings))
        .transpose()?;
    let outbound = cli
        .outbound
        .as_deref()
        .map(|p| File::create(p).map(BufWriter::new))
        .transpose()?;
    let running = Arc::new(AtomicBool::new(true));
    let media = {
        let channel = Arc::clone(&channel);
        let running = Arc::clone(&running);
        thread::Builder::new()
            .name("vxi-media".into())
            .spawn(move || run_media(channel, inbound, outbound, running))?
    };

    session.start(document, collab)?;
    info!(session = session.id(), "dialog started");

    // ── Scripted caller ───────────────────────────────────────────────────
    let delay = Duration::from_millis(cli.input_delay_ms);
    if let Some(keys) = cli.dtmf.as_deref() {
        thread::sleep(delay);
        for key in keys.chars().filter(|c| !c.is_whitespace()) {
            session.dtmf(key);
            thread::sleep(Duration::from_millis(150));
        }
    }
    if let Some(text) = cli.say.as_deref() {
        thread::sleep(delay);
        let deadline = Instant::now() + Duration::from_secs(settings.max_call_secs);
        while !recognizer.inject(Recognition::final_text(text)) {
            if !session.is_running() || Instant::now() >= deadline {
                warn!("no voice grammar opened; utterance not delivered");
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
    if let Some(secs) = cli.hangup_after {
        thread::sleep(Duration::from_secs(secs));
        session.hangup();
    }

    let limit = Duration::from_secs(settings.max_call_secs);
    if let Err(e) = session.wait(limit) {
        warn!(error = %e, "document still running; stopping session");
        if let Err(e) = session.stop() {
            warn!(error = %e, "session did not stop cleanly");
        }
    }
    running.store(false, Ordering::Relaxed);
    channel.close();
    if media.join().is_err() {
        warn!("media thread panicked");
    }
    if logger.join().is_err() {
        warn!("event logger panicked");
    }
    info!(diagnostics = ?session.diagnostics_snapshot(), "session finished");
    Ok(())
}
