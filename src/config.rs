use anyhow::{bail, Result};
use clap_serde_derive::ClapSerde;

use crate::inference::model_config::DeviceKind;

#[derive(ClapSerde, Debug, Clone)]
pub struct Config {
    /// The address the listener binds to
    #[default("0.0.0.0".to_string())]
    #[arg(short, long, env)]
    pub(crate) address: String,

    /// The port the listener binds to
    #[default(8000)]
    #[arg(short, long, env)]
    pub(crate) port: u16,

    /// Directory of the mood scoring model
    #[default("./model/bert_4_moods".to_string())]
    #[arg(long, env)]
    pub(crate) mood_score_path: String,

    /// Directory of the depression check model
    #[default("./model/bert-depress-check".to_string())]
    #[arg(long, env)]
    pub(crate) depress_check_path: String,

    /// Device the models run on: auto, cpu, cuda or metal
    #[default(DeviceKind::Auto)]
    #[arg(long, env, value_enum)]
    pub(crate) device: DeviceKind,

    /// Maximum number of tokens fed to a model, longer inputs are truncated
    #[default(512)]
    #[arg(long, env)]
    pub(crate) max_length: usize,

    /// Maximum accepted request body size in bytes
    #[default(1_048_576)]
    #[arg(long, env)]
    pub(crate) max_body_bytes: usize,

    /// Treat a missing model path as a HuggingFace repository id and download it
    #[default(false)]
    #[arg(long, env)]
    pub(crate) hub_fallback: bool,

    /// OTLP collector endpoint, telemetry export is disabled when unset
    #[default(None)]
    #[arg(long, env)]
    pub(crate) otel_endpoint: Option<String>,

    /// Also log to the console when exporting telemetry
    #[default(false)]
    #[arg(long, env)]
    pub(crate) console: bool,

    /// PEM certificate, enables TLS together with tls_key
    #[default(None)]
    #[arg(long, env)]
    pub(crate) tls_cert: Option<String>,

    /// PEM private key, enables TLS together with tls_cert
    #[default(None)]
    #[arg(long, env)]
    pub(crate) tls_key: Option<String>,

    /// Seconds to wait for in-flight requests on shutdown
    #[default(10)]
    #[arg(long, env)]
    pub(crate) shutdown_timeout: u64,
}

impl Config {
    pub fn from_toml(path: &str) -> Result<Self> {
        let str = std::fs::read_to_string(path)?;
        let opt: <Config as ClapSerde>::Opt = toml::from_str(&str)?;
        Ok(Config::from(opt))
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            bail!("port must not be 0");
        }
        if self.max_length == 0 {
            bail!("max_length must be at least 1");
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            bail!("tls_cert and tls_key must be set together");
        }
        Ok(())
    }

    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_str(), key.as_str())),
            _ => None,
        }
    }
}
