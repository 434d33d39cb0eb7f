use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::models::ModelConfig;
use crate::rate_limit::RateLimitConfig;
use crate::validate::RequestLimits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationConfig {
    pub max_bytes: Option<u64>,
    pub keep: usize,
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_bytes: None,
            keep: 1,
            compress: false,
        }
    }
}

/// Where vendor, catalog and conversation data live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSettings {
    Rest { url: String, key: String },
    Fixture(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub limits: RequestLimits,
    pub waiter_rate: RateLimitConfig,
    pub layout_rate: RateLimitConfig,
    pub sweep_interval: Duration,
    pub allowed_origin: String,
    pub upstream_timeout: Duration,
    pub catalog_limit: usize,
    pub models: ModelConfig,
    pub store: StoreSettings,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            limits: RequestLimits::default(),
            waiter_rate: RateLimitConfig::new(10, 60_000),
            layout_rate: RateLimitConfig::new(20, 60_000),
            sweep_interval: Duration::from_secs(300),
            allowed_origin: "*".to_string(),
            upstream_timeout: Duration::from_millis(30_000),
            catalog_limit: 50,
            models: ModelConfig::default(),
            store: StoreSettings::Memory,
            log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must be between 0 and 65535"))?,
            None => defaults.port,
        };

        let limits = RequestLimits {
            max_body_bytes: parse_nonzero_u64("DINEGATE_MAX_REQUEST_BYTES")?
                .map(|v| v as usize)
                .unwrap_or(defaults.limits.max_body_bytes),
            max_message_chars: parse_nonzero_u64("DINEGATE_MAX_MESSAGE_CHARS")?
                .map(|v| v as usize)
                .unwrap_or(defaults.limits.max_message_chars),
        };

        let waiter_rate = parse_rate(
            "DINEGATE_WAITER_RATE_LIMIT",
            "DINEGATE_WAITER_RATE_WINDOW_MS",
            defaults.waiter_rate,
        )?;
        let layout_rate = parse_rate(
            "DINEGATE_LAYOUT_RATE_LIMIT",
            "DINEGATE_LAYOUT_RATE_WINDOW_MS",
            defaults.layout_rate,
        )?;

        let sweep_interval = parse_nonzero_u64("DINEGATE_RATE_SWEEP_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let allowed_origin = env::var("DINEGATE_ALLOWED_ORIGIN")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.allowed_origin);

        let upstream_timeout = parse_nonzero_u64("DINEGATE_UPSTREAM_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.upstream_timeout);

        let catalog_limit = parse_nonzero_u64("DINEGATE_CATALOG_LIMIT")?
            .map(|v| v as usize)
            .unwrap_or(defaults.catalog_limit);

        let models = match non_empty_var("DINEGATE_MODEL_CONFIG") {
            Some(path) => {
                let content = fs::read_to_string(&path).with_context(|| {
                    format!("Failed to read DINEGATE_MODEL_CONFIG '{}': file unreadable", path)
                })?;
                serde_json::from_str::<ModelConfig>(&content).with_context(|| {
                    format!(
                        "Failed to parse DINEGATE_MODEL_CONFIG '{}': invalid JSON configuration",
                        path
                    )
                })?
            }
            None => ModelConfig::from_env_keys(),
        };

        let store = match (
            non_empty_var("DINEGATE_STORE_URL"),
            non_empty_var("DINEGATE_STORE_KEY"),
            non_empty_var("DINEGATE_FIXTURE_FILE"),
        ) {
            (Some(url), Some(key), _) => StoreSettings::Rest { url, key },
            (Some(_), None, _) => bail!("DINEGATE_STORE_URL is set but DINEGATE_STORE_KEY is missing"),
            (None, _, Some(path)) => StoreSettings::Fixture(PathBuf::from(path)),
            (None, _, None) => StoreSettings::Memory,
        };

        let log_file = non_empty_var("LOG_FILE");
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };
        let log_stdout = parse_bool_env("DINEGATE_LOG_STDOUT")?.unwrap_or(false);

        Ok(Self {
            port,
            limits,
            waiter_rate,
            layout_rate,
            sweep_interval,
            allowed_origin,
            upstream_timeout,
            catalog_limit,
            models,
            store,
            log_file,
            rotation,
            log_stdout,
        })
    }
}

fn parse_rate(limit_var: &str, window_var: &str, default: RateLimitConfig) -> Result<RateLimitConfig> {
    let max_requests = match parse_nonzero_u64(limit_var)? {
        Some(v) => u32::try_from(v).map_err(|_| anyhow!("{} is too large", limit_var))?,
        None => default.max_requests,
    };
    let window_ms = parse_nonzero_u64(window_var)?.unwrap_or(default.window_ms);
    Ok(RateLimitConfig::new(max_requests, window_ms))
}

fn non_empty_var(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_nonzero_u64(var: &str) -> Result<Option<u64>> {
    match parse_optional_u64(var)? {
        Some(0) => Err(anyhow!("{} must be greater than zero", var)),
        other => Ok(other),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
