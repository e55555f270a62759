use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, io};

use serde::Serialize;
use tracing::debug;

use crate::transport::ReconnectPolicy;

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_REALTIME_URL: &str = "ws://127.0.0.1:8000/ws/progress";
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_base_url: String,
    pub realtime_url: String,
    pub poll_interval_ms: u64,
    pub animation_frame_ms: u64,
    pub animation_step: f32,
    pub retire_grace_ms: u64,
    pub reconnect_max_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub http_timeout_ms: u64,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_dir: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub api_base_url: String,
    pub realtime_url: String,
    pub poll_interval_ms: u64,
    pub animation_frame_ms: u64,
    pub reconnect_max_attempts: u32,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_dir: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            api_base_url: parse_url("IMPORT_API_BASE_URL", DEFAULT_API_BASE_URL),
            realtime_url: parse_url("IMPORT_REALTIME_URL", DEFAULT_REALTIME_URL),
            poll_interval_ms: parse_env::<u64>("IMPORT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)
                .max(1),
            animation_frame_ms: parse_env::<u64>("IMPORT_ANIMATION_FRAME_MS", 16).max(1),
            animation_step: parse_step("IMPORT_ANIMATION_STEP", 2.0),
            retire_grace_ms: parse_env("IMPORT_RETIRE_GRACE_MS", 1_500),
            reconnect_max_attempts: parse_env("IMPORT_RECONNECT_MAX_ATTEMPTS", 10),
            reconnect_base_ms: parse_env::<u64>("IMPORT_RECONNECT_BASE_MS", 500).max(1),
            reconnect_max_ms: parse_env("IMPORT_RECONNECT_MAX_MS", 10_000),
            http_timeout_ms: parse_env::<u64>("IMPORT_HTTP_TIMEOUT_MS", 10_000).max(1),
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_env::<usize>("TELEMETRY_BATCH_SIZE", 25).max(1),
            telemetry_buffer_max_bytes: parse_env("TELEMETRY_BUFFER_MAX_BYTES", 5 * 1024 * 1024),
            telemetry_dir: env::var("TELEMETRY_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".import-sync")),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn animation_frame(&self) -> Duration {
        Duration::from_millis(self.animation_frame_ms)
    }

    /// How long a finished record outside any tracked batch stays visible.
    pub fn retire_grace(&self) -> Duration {
        Duration::from_millis(self.retire_grace_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_max_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms)),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            api_base_url: self.api_base_url.clone(),
            realtime_url: self.realtime_url.clone(),
            poll_interval_ms: self.poll_interval_ms,
            animation_frame_ms: self.animation_frame_ms,
            reconnect_max_attempts: self.reconnect_max_attempts,
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
            telemetry_dir: self.telemetry_dir.to_string_lossy().to_string(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_url(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

/// Reads `key` as any `FromStr` value; unset or unparseable falls back.
fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            debug!(key, raw = %raw, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}

fn parse_step(key: &str, default: f32) -> f32 {
    Some(parse_env(key, default))
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}
