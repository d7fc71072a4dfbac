use anyhow::{Context, anyhow};
use report_flow::{ProviderConfig, ProviderKind, RetryPolicy, WorkerConfig};
use std::{path::PathBuf, str::FromStr, time::Duration};

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Service configuration read from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub templates_path: Option<PathBuf>,
    pub max_upload_size: usize,
    pub provider: ProviderConfig,
    pub retry: RetryPolicy,
    pub workers: WorkerConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let kind = match get("AI_PROVIDER") {
            Some(value) => ProviderKind::parse(&value)
                .ok_or_else(|| anyhow!("Invalid AI_PROVIDER: {}", value))?,
            None if get("ANTHROPIC_API_KEY").is_some() => ProviderKind::Anthropic,
            None if get("OPENAI_API_KEY").is_some() => ProviderKind::OpenAi,
            None => ProviderKind::Ollama,
        };

        let (api_key, base_url) = match kind {
            ProviderKind::Anthropic => (get("ANTHROPIC_API_KEY"), get("ANTHROPIC_BASE_URL")),
            ProviderKind::OpenAi => (get("OPENAI_API_KEY"), get("OPENAI_BASE_URL")),
            ProviderKind::Ollama => (None, get("OLLAMA_BASE_URL")),
        };
        if api_key.is_none() && kind != ProviderKind::Ollama {
            return Err(anyhow!(
                "AI_PROVIDER={} requires an API key",
                kind.as_str()
            ));
        }

        let mut provider = ProviderConfig::new(
            kind,
            get("AI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        )
        .with_timeout(Duration::from_secs(parse_or(&get, "EXTRACTION_TIMEOUT_SECS", 60)?));
        provider.max_tokens = parse_or(&get, "EXTRACTION_MAX_TOKENS", 2000)?;
        if let Some(key) = api_key {
            provider = provider.with_api_key(key);
        }
        if let Some(url) = base_url {
            provider = provider.with_base_url(url);
        }

        let retry = RetryPolicy {
            max_attempts: parse_or(&get, "EXTRACTION_MAX_ATTEMPTS", 3u32)?.max(1),
            initial_backoff: Duration::from_millis(parse_or(&get, "EXTRACTION_BACKOFF_MS", 1000)?),
            max_backoff: Duration::from_millis(parse_or(&get, "EXTRACTION_BACKOFF_CAP_MS", 30_000)?),
        };

        let workers = WorkerConfig {
            concurrency: parse_or(&get, "WORKER_CONCURRENCY", 4usize)?.max(1),
            max_deliveries: parse_or(&get, "MAX_REDELIVERIES", 3u32)?.max(1),
            ..WorkerConfig::default()
        };

        Ok(Self {
            port: parse_or(&get, "PORT", 3000)?,
            database_url: get("DATABASE_URL"),
            templates_path: get("TEMPLATES_PATH").map(PathBuf::from),
            max_upload_size: parse_or(&get, "MAX_UPLOAD_SIZE", 52_428_800)?,
            provider,
            retry,
            workers,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}
