//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vxi_core::{ChannelConfig, Codec, SessionConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub codec: String,
    pub sample_rate: u32,
    pub frame_ms: u64,
    pub timeout_ms: u64,
    pub termchar: String,
    pub inputmodes: String,
    pub language: String,
    pub bargein: bool,
    pub fetch_timeout_ms: u64,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_secs: u64,
    pub record_dir: Option<PathBuf>,
    pub max_call_secs: u64,
    pub stub_speech: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            codec: "linear16".into(),
            sample_rate: 8000,
            frame_ms: 20,
            timeout_ms: 5000,
            termchar: "#".into(),
            inputmodes: "dtmf voice".into(),
            language: "en-US".into(),
            bargein: true,
            fetch_timeout_ms: 10_000,
            cache_dir: None,
            cache_ttl_secs: 300,
            record_dir: None,
            max_call_secs: 300,
            stub_speech: true,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.codec = normalize_codec(&self.codec);
        self.sample_rate = match self.sample_rate {
            8000 | 16_000 => self.sample_rate,
            _ => 8000,
        };
        if self.codec != "linear16" {
            self.sample_rate = 8000;
        }
        self.frame_ms = match self.frame_ms {
            10 | 20 | 30 | 40 => self.frame_ms,
            _ => 20,
        };
        if self.codec == "amr" {
            self.frame_ms = 20;
        }
        self.timeout_ms = self.timeout_ms.clamp(500, 120_000);
        self.termchar = normalize_termchar(&self.termchar);
        self.inputmodes = normalize_inputmodes(&self.inputmodes);
        self.language = match self.language.trim() {
            "" => "en-US".into(),
            lang => lang.to_string(),
        };
        self.fetch_timeout_ms = self.fetch_timeout_ms.clamp(100, 120_000);
        self.cache_ttl_secs = self.cache_ttl_secs.clamp(1, 86_400 * 30);
        self.max_call_secs = self.max_call_secs.clamp(1, 86_400);
        self.cache_dir = self.cache_dir.take().filter(|d| !d.as_os_str().is_empty());
        self.record_dir = self.record_dir.take().filter(|d| !d.as_os_str().is_empty());
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let codec = match self.codec.as_str() {
            "mulaw" => Codec::Mulaw,
            "alaw" => Codec::Alaw,
            "amr" => Codec::Amr,
            _ => Codec::Linear16 {
                sample_rate: self.sample_rate,
            },
        };
        ChannelConfig {
            codec,
            interval: Duration::from_millis(self.frame_ms),
            pacing: true,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig {
            timeout: Duration::from_millis(self.timeout_ms),
            termchar: self.termchar.chars().next().unwrap_or(defaults.termchar),
            inputmodes: self.inputmodes.clone(),
            language: self.language.clone(),
            bargein: self.bargein,
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
            record_dir: self
                .record_dir
                .clone()
                .unwrap_or_else(|| defaults.record_dir.clone()),
            ..defaults
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("cache"))
    }
}

pub fn normalize_codec(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "ulaw" | "mulaw" | "pcmu" | "g711u" => "mulaw".into(),
        "alaw" | "pcma" | "g711a" => "alaw".into(),
        "amr" | "amr-nb" => "amr".into(),
        _ => "linear16".into(),
    }
}

fn normalize_termchar(raw: &str) -> String {
    match raw.trim().chars().next() {
        Some(c) if c.is_ascii_digit() || matches!(c, '*' | '#') => c.to_string(),
        _ => "#".into(),
    }
}

fn normalize_inputmodes(raw: &str) -> String {
    let mut modes: Vec<&str> = raw
        .split_whitespace()
        .filter(|m| matches!(*m, "dtmf" | "voice"))
        .collect();
    modes.dedup();
    if modes.is_empty() {
        "dtmf voice".into()
    } else {
        modes.join(" ")
    }
}

fn data_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vxi")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("vxi")
    }
}

pub fn default_settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}
