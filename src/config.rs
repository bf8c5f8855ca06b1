use anyhow::Context;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// 单次分析的截止时间
    pub analysis_timeout: Duration,
    /// 模拟后端的响应延迟
    pub simulated_latency: Duration,
    /// 模拟后端种子；不设置则取系统熵
    pub backend_seed: Option<u64>,
    pub max_upload_bytes: usize,
    pub preview_max_dim: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            analysis_timeout: Duration::from_secs(30),
            simulated_latency: Duration::from_millis(3500),
            backend_seed: None,
            max_upload_bytes: 100 * 1024 * 1024,
            preview_max_dim: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT")?.unwrap_or(defaults.port),
            analysis_timeout: parse_var("ANALYSIS_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.analysis_timeout),
            simulated_latency: parse_var("SIMULATED_LATENCY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.simulated_latency),
            backend_seed: parse_var("BACKEND_SEED")?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES")?.unwrap_or(defaults.max_upload_bytes),
            preview_max_dim: parse_var("PREVIEW_MAX_DIM")?.unwrap_or(defaults.preview_max_dim),
        })
    }
}

fn parse_var<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{} must be a number, got {:?}", key, raw)),
        _ => Ok(None),
    }
}
