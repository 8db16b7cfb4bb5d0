//! Queued audio-output units and their start/repeat/delay/stop lifecycle.

use std::f32::consts::TAU;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::codec::{read_frame, Codec, FrameFormat};
use crate::error::{Result, VxiError};

/// Produces codec frames for one playable.
pub trait FrameSource: Send {
    /// Fill `buf` with the next frame. `Ok(false)` at end of stream.
    fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool>;

    fn rewind(&mut self) -> Result<()>;

    fn close(&mut self) {}
}

/// Where a playable's audio comes from.
#[derive(Debug, Clone)]
pub enum PlayableSource {
    /// A media file: WAV (Linear16 only) or raw frames in the channel codec.
    File(PathBuf),
    /// Files played back to back as one item.
    FileList(Vec<PathBuf>),
    /// Raw frames read from an external command's stdout.
    Command { program: String, args: Vec<String> },
    /// Raw frames already in memory (synthesised prompts, cache hits).
    Buffer(Arc<[u8]>),
    /// Summed sine tones; an empty frequency list is silence.
    Tone {
        frequencies: Vec<f32>,
        duration: Duration,
        amplitude: f32,
    },
    /// A resource body from the fetch collaborator, raw or WAV.
    Fetched { uri: String, data: Arc<[u8]> },
}

impl PlayableSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::File(_) => "file",
            Self::FileList(_) => "file-list",
            Self::Command { .. } => "command",
            Self::Buffer(_) => "buffer",
            Self::Tone { .. } => "tone",
            Self::Fetched { .. } => "fetched",
        }
    }

    pub fn silence(duration: Duration) -> Self {
        Self::Tone {
            frequencies: Vec::new(),
            duration,
            amplitude: 0.0,
        }
    }

    pub fn beep() -> Self {
        Self::Tone {
            frequencies: vec![1000.0],
            duration: Duration::from_millis(200),
            amplitude: 0.3,
        }
    }
}

/// One queued playable.
pub struct PlayableItem {
    source: PlayableSource,
    pub label: String,
    /// Extra plays after the first.
    pub repeat: u32,
    /// Silence appended once after the last repetition.
    pub delay: Duration,
    /// Delete backing files on stop.
    pub auto_delete: bool,
    /// Whether caller input may barge in.
    pub interruptible: bool,
    stream: Option<Box<dyn FrameSource>>,
    repeats_left: u32,
    delayed: bool,
}

impl std::fmt::Debug for PlayableItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayableItem")
            .field("source", &self.source.kind())
            .field("label", &self.label)
            .field("repeat", &self.repeat)
            .field("open", &self.stream.is_some())
            .finish_non_exhaustive()
    }
}

impl PlayableItem {
    pub fn new(source: PlayableSource) -> Self {
        let label = match &source {
            PlayableSource::File(p) => p.display().to_string(),
            PlayableSource::Fetched { uri, .. } => uri.clone(),
            other => other.kind().to_string(),
        };
        Self {
            source,
            label,
            repeat: 0,
            delay: Duration::ZERO,
            auto_delete: false,
            interruptible: true,
            stream: None,
            repeats_left: 0,
            delayed: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_repeat(mut self, repeat: u32) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn with_interruptible(mut self, interruptible: bool) -> Self {
        self.interruptible = interruptible;
        self
    }

    pub fn source(&self) -> &PlayableSource {
        &self.source
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the backing stream.
    pub fn on_start(&mut self, codec: Codec, interval: Duration) -> Result<()> {
        let stream = open_source(&self.source, codec, interval)?;
        debug!(item = %self.label, kind = self.source.kind(), "playable started");
        self.stream = Some(stream);
        self.repeats_left = self.repeat;
        self.delayed = false;
        Ok(())
    }

    pub fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        match self.stream.as_mut() {
            Some(stream) => stream.next_frame(buf),
            None => Ok(false),
        }
    }

    /// Rewind if repeats remain. Returns whether playback continues.
    pub fn on_repeat(&mut self) -> Result<bool> {
        if self.repeats_left == 0 {
            return Ok(false);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        stream.rewind()?;
        self.repeats_left -= 1;
        Ok(true)
    }

    /// The trailing silence, handed out exactly once.
    pub fn on_delay(&mut self) -> Option<Duration> {
        if self.delayed || self.delay.is_zero() {
            return None;
        }
        self.delayed = true;
        Some(self.delay)
    }

    /// Close the backing stream; auto-delete items remove their files.
    pub fn on_stop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        if !self.auto_delete {
            return;
        }
        let paths: Vec<&PathBuf> = match &self.source {
            PlayableSource::File(p) => vec![p],
            PlayableSource::FileList(list) => list.iter().collect(),
            _ => Vec::new(),
        };
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "auto-delete failed");
            }
        }
    }
}

impl Drop for PlayableItem {
    fn drop(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

fn open_source(source: &PlayableSource, codec: Codec, interval: Duration) -> Result<Box<dyn FrameSource>> {
    let format = codec.frame_format(interval);
    match source {
        PlayableSource::File(path) => open_file(path, codec, interval),
        PlayableSource::FileList(paths) => {
            if paths.is_empty() {
                return Err(VxiError::Media("empty file list".into()));
            }
            let first = open_file(&paths[0], codec, interval)?;
            Ok(Box::new(FileListSource {
                paths: paths.clone(),
                index: 0,
                current: first,
                codec,
                interval,
            }))
        }
        PlayableSource::Command { program, args } => {
            CommandSource::spawn(program, args, format).map(|s| Box::new(s) as Box<dyn FrameSource>)
        }
        PlayableSource::Buffer(data) => Ok(Box::new(ReaderSource::new(
            Cursor::new(Arc::clone(data)),
            format,
        ))),
        PlayableSource::Fetched { data, .. } => {
            if codec.is_linear() && data.starts_with(b"RIFF") {
                let wav = WavSource::open(Cursor::new(Arc::clone(data)), codec, interval)?;
                Ok(Box::new(wav))
            } else {
                Ok(Box::new(ReaderSource::new(Cursor::new(Arc::clone(data)), format)))
            }
        }
        PlayableSource::Tone {
            frequencies,
            duration,
            amplitude,
        } => ToneSource::new(frequencies.clone(), *duration, *amplitude, codec, interval)
            .map(|s| Box::new(s) as Box<dyn FrameSource>),
    }
}

fn open_file(path: &Path, codec: Codec, interval: Duration) -> Result<Box<dyn FrameSource>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            VxiError::bad_fetch(path.display().to_string(), "file", "notfound")
        }
        _ => VxiError::Io(e),
    })?;
    let is_wav = path
        .extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("wav"));
    if is_wav {
        if !codec.is_linear() {
            return Err(VxiError::unsupported(
                "format",
                format!("WAV playback needs linear16, channel is {}", codec.name()),
            ));
        }
        let wav = WavSource::open(BufReader::new(file), codec, interval)?;
        return Ok(Box::new(wav));
    }
    Ok(Box::new(ReaderSource::new(
        BufReader::new(file),
        codec.frame_format(interval),
    )))
}

// ── Sources ──────────────────────────────────────────────────────────────────

/// Raw frames from any seekable reader.
struct ReaderSource<R> {
    reader: R,
    format: FrameFormat,
}

impl<R: Read + Seek + Send> ReaderSource<R> {
    fn new(reader: R, format: FrameFormat) -> Self {
        Self { reader, format }
    }
}

impl<R: Read + Seek + Send> FrameSource for ReaderSource<R> {
    fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        read_frame(self.format, &mut self.reader, buf)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

/// Mono 16-bit WAV through `hound`, framed to the channel interval.
struct WavSource<R: Read> {
    reader: hound::WavReader<R>,
    samples_per_frame: usize,
}

impl<R: Read + Seek + Send> WavSource<R> {
    fn open(inner: R, codec: Codec, interval: Duration) -> Result<Self> {
        let reader =
            hound::WavReader::new(inner).map_err(|e| VxiError::Media(format!("wav header: {e}")))?;
        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
            || spec.sample_rate != codec.sample_rate()
        {
            return Err(VxiError::unsupported(
                "format",
                format!(
                    "wav {} Hz/{} ch/{} bit does not match channel {} Hz mono 16 bit",
                    spec.sample_rate,
                    spec.channels,
                    spec.bits_per_sample,
                    codec.sample_rate()
                ),
            ));
        }
        Ok(Self {
            reader,
            samples_per_frame: codec.frame_size(interval) / 2,
        })
    }
}

impl<R: Read + Seek + Send> FrameSource for WavSource<R> {
    fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let mut count = 0;
        for sample in self.reader.samples::<i16>().take(self.samples_per_frame) {
            let sample = sample.map_err(|e| VxiError::Media(format!("wav read: {e}")))?;
            buf.extend_from_slice(&sample.to_le_bytes());
            count += 1;
        }
        if count == 0 {
            return Ok(false);
        }
        // Pad the final partial frame; the container length is authoritative.
        buf.resize(self.samples_per_frame * 2, 0);
        Ok(true)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader.seek(0)?;
        Ok(())
    }
}

struct FileListSource {
    paths: Vec<PathBuf>,
    index: usize,
    current: Box<dyn FrameSource>,
    codec: Codec,
    interval: Duration,
}

impl FrameSource for FileListSource {
    fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        loop {
            if self.current.next_frame(buf)? {
                return Ok(true);
            }
            if self.index + 1 >= self.paths.len() {
                return Ok(false);
            }
            self.index += 1;
            self.current.close();
            self.current = open_file(&self.paths[self.index], self.codec, self.interval)?;
        }
    }

    fn rewind(&mut self) -> Result<()> {
        if self.index == 0 {
            return self.current.rewind();
        }
        self.current.close();
        self.index = 0;
        self.current = open_file(&self.paths[0], self.codec, self.interval)?;
        Ok(())
    }

    fn close(&mut self) {
        self.current.close();
    }
}

/// Frames from a child process's stdout. Rewinding re-runs the command.
struct CommandSource {
    program: String,
    args: Vec<String>,
    format: FrameFormat,
    child: Child,
    stdout: ChildStdout,
}

impl CommandSource {
    fn spawn(program: &str, args: &[String], format: FrameFormat) -> Result<Self> {
        let (child, stdout) = Self::start(program, args)?;
        Ok(Self {
            program: program.to_string(),
            args: args.to_vec(),
            format,
            child,
            stdout,
        })
    }

    fn start(program: &str, args: &[String]) -> Result<(Child, ChildStdout)> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VxiError::NoResource(format!("spawn {program}: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VxiError::NoResource(format!("{program}: no stdout")))?;
        Ok((child, stdout))
    }

    fn reap(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!(program = %self.program, error = %e, "kill on finished command");
        }
        if let Err(e) = self.child.wait() {
            warn!(program = %self.program, error = %e, "command could not be reaped");
        }
    }
}

impl FrameSource for CommandSource {
    fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        read_frame(self.format, &mut self.stdout, buf)
    }

    fn rewind(&mut self) -> Result<()> {
        self.reap();
        let (child, stdout) = Self::start(&self.program, &self.args)?;
        self.child = child;
        self.stdout = stdout;
        Ok(())
    }

    fn close(&mut self) {
        self.reap();
    }
}

/// Generated tone or silence.
struct ToneSource {
    frequencies: Vec<f32>,
    amplitude: f32,
    sample_rate: u32,
    total_frames: u64,
    emitted: u64,
    silence: Vec<u8>,
    samples_per_frame: usize,
}

impl ToneSource {
    fn new(
        frequencies: Vec<f32>,
        duration: Duration,
        amplitude: f32,
        codec: Codec,
        interval: Duration,
    ) -> Result<Self> {
        if !frequencies.is_empty() && !codec.is_linear() {
            return Err(VxiError::unsupported(
                "format",
                format!("tone generation needs linear16, channel is {}", codec.name()),
            ));
        }
        let interval_us = interval.as_micros().max(1);
        let total_frames = duration.as_micros().div_ceil(interval_us) as u64;
        Ok(Self {
            frequencies,
            amplitude: amplitude.clamp(0.0, 1.0),
            sample_rate: codec.sample_rate(),
            total_frames,
            emitted: 0,
            silence: codec.silence_frame(interval),
            samples_per_frame: codec.frame_size(interval) / 2,
        })
    }

    fn sample(&self, n: u64) -> i16 {
        let t = n as f32 / self.sample_rate as f32;
        let voices = self.frequencies.len() as f32;
        let sum: f32 = self.frequencies.iter().map(|f| (TAU * f * t).sin()).sum();
        (sum / voices * self.amplitude * i16::MAX as f32) as i16
    }
}

impl FrameSource for ToneSource {
    fn next_frame(&mut self, buf: &mut Vec<u8>) -> Result<bool> {
        if self.emitted >= self.total_frames {
            return Ok(false);
        }
        buf.clear();
        if self.frequencies.is_empty() {
            buf.extend_from_slice(&self.silence);
        } else {
            let base = self.emitted * self.samples_per_frame as u64;
            for i in 0..self.samples_per_frame as u64 {
                buf.extend_from_slice(&self.sample(base + i).to_le_bytes());
            }
        }
        self.emitted += 1;
        Ok(true)
    }

    fn rewind(&mut self) -> Result<()> {
        self.emitted = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::pcm16_samples;

    const MS20: Duration = Duration::from_millis(20);
    const L16: Codec = Codec::Linear16 { sample_rate: 8000 };

    fn drain(item: &mut PlayableItem) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        let mut buf = Vec::new();
        while item.next_frame(&mut buf).unwrap() {
            frames.push(buf.clone());
        }
        frames
    }

    #[test]
    fn buffer_item_plays_then_repeats_once_then_delays_once() {
        let data: Arc<[u8]> = vec![1u8; 320].into();
        let mut item = PlayableItem::new(PlayableSource::Buffer(data))
            .with_repeat(1)
            .with_delay(Duration::from_millis(40));
        item.on_start(L16, MS20).unwrap();
        assert_eq!(drain(&mut item).len(), 1);
        assert!(item.on_repeat().unwrap());
        assert_eq!(drain(&mut item).len(), 1);
        assert!(!item.on_repeat().unwrap());
        assert_eq!(item.on_delay(), Some(Duration::from_millis(40)));
        assert_eq!(item.on_delay(), None);
        item.on_stop();
        assert!(!item.is_open());
    }

    #[test]
    fn tone_frames_have_native_size_and_energy() {
        let mut item = PlayableItem::new(PlayableSource::beep());
        item.on_start(L16, MS20).unwrap();
        let frames = drain(&mut item);
        assert_eq!(frames.len(), 10);
        assert!(frames.iter().all(|f| f.len() == 320));
        let peak = pcm16_samples(&frames[0]).iter().map(|s| s.unsigned_abs()).max().unwrap();
        assert!(peak > 5000, "peak={peak}");
    }

    #[test]
    fn silence_tone_works_for_any_codec_but_beep_needs_linear() {
        let mut item = PlayableItem::new(PlayableSource::silence(Duration::from_millis(30)));
        item.on_start(Codec::Mulaw, MS20).unwrap();
        let frames = drain(&mut item);
        assert_eq!(frames, vec![vec![0xFF; 160]; 2]);

        let mut beep = PlayableItem::new(PlayableSource::beep());
        let err = beep.on_start(Codec::Mulaw, MS20).unwrap_err();
        assert_eq!(err.event_name(), "error.unsupported.format");
    }

    #[test]
    fn missing_file_is_badfetch() {
        let mut item = PlayableItem::new(PlayableSource::File("/nonexistent/x.raw".into()));
        let err = item.on_start(L16, MS20).unwrap_err();
        assert_eq!(err.event_name(), "error.badfetch.file.notfound");
    }

    #[test]
    fn wav_file_is_framed_and_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..200 {
            writer.write_sample(i as i16).unwrap();
        }
        writer.finalize().unwrap();

        let mut item = PlayableItem::new(PlayableSource::File(path.clone())).with_auto_delete(true);
        item.on_start(L16, MS20).unwrap();
        let frames = drain(&mut item);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), 320);
        assert_eq!(pcm16_samples(&frames[1])[39], 199);
        assert_eq!(pcm16_samples(&frames[1])[40], 0);
        item.on_stop();
        assert!(!path.exists());
    }

    #[test]
    fn wav_with_wrong_rate_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        hound::WavWriter::create(&path, spec).unwrap().finalize().unwrap();
        let mut item = PlayableItem::new(PlayableSource::File(path));
        let err = item.on_start(L16, MS20).unwrap_err();
        assert_eq!(err.event_name(), "error.unsupported.format");
    }

    #[test]
    fn file_list_plays_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ul");
        let b = dir.path().join("b.ul");
        std::fs::write(&a, vec![1u8; 160]).unwrap();
        std::fs::write(&b, vec![2u8; 320]).unwrap();
        let mut item = PlayableItem::new(PlayableSource::FileList(vec![a, b])).with_repeat(1);
        item.on_start(Codec::Mulaw, MS20).unwrap();
        let frames = drain(&mut item);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0][0], 1);
        assert_eq!(frames[2][0], 2);
        assert!(item.on_repeat().unwrap());
        assert_eq!(drain(&mut item).len(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn command_output_is_rerun_on_repeat() {
        let source = PlayableSource::Command {
            program: "head".into(),
            args: vec!["-c".into(), "320".into(), "/dev/zero".into()],
        };
        let mut item = PlayableItem::new(source).with_repeat(1);
        item.on_start(Codec::Mulaw, MS20).unwrap();
        assert_eq!(drain(&mut item), vec![vec![0u8; 160]; 2]);
        assert!(item.on_repeat().unwrap());
        assert_eq!(drain(&mut item).len(), 2);
        assert!(!item.on_repeat().unwrap());
        item.on_stop();
        assert!(!item.is_open());
    }

    #[test]
    fn misaligned_raw_buffer_is_rejected() {
        let data: Arc<[u8]> = vec![0u8; 100].into();
        let mut item = PlayableItem::new(PlayableSource::Buffer(data));
        item.on_start(Codec::Mulaw, MS20).unwrap();
        let mut buf = Vec::new();
        assert!(item.next_frame(&mut buf).is_err());
    }
}
