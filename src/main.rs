use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use clap::Parser;
use clap_serde_derive::ClapSerde;
use tracing::{error, info};

use crate::api::routes::{router, AppState};
use crate::config::Config;
use crate::inference::model_config::InferenceConfig;
use crate::inference::models::bert::BertClassifierModel;
use crate::inference::models::model::{ModelBase, TextTask};
use crate::telemetry::init_telemetry;

mod api;
mod config;
mod error;
mod extractors;
mod inference;
mod telemetry;

const DEFAULT_CONFIG_FILE: &str = "BertService.toml";

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_result = Config::from_toml(&args.config_file);
    let config_missing = config_result.is_err();
    let config = match config_result {
        Ok(conf) => conf.merge(args.opt_config),
        Err(err) => {
            if args.config_file != DEFAULT_CONFIG_FILE {
                eprintln!(
                    "Failed to read configuration file {} with error: {}",
                    args.config_file, err
                );
                std::process::exit(1);
            }
            Config::default().merge(args.opt_config)
        }
    };

    let telemetry = init_telemetry(&config.otel_endpoint, config.console)?;
    if config_missing {
        info!("No configuration file found, using defaults and command line options");
    }
    if let Err(err) = config.validate() {
        exit_err!(1, "Invalid configuration: {}", err);
    }

    info!(
        "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
        candle_core::utils::with_avx(),
        candle_core::utils::with_neon(),
        candle_core::utils::with_simd128(),
        candle_core::utils::with_f16c()
    );

    let inference_config = InferenceConfig {
        device: config.device,
        max_length: config.max_length,
        hub_fallback: config.hub_fallback,
    };
    let mood_score = load_model(
        ModelBase::for_task(TextTask::MoodScore, &config.mood_score_path),
        &inference_config,
    );
    let depress_check = load_model(
        ModelBase::for_task(TextTask::DepressCheck, &config.depress_check_path),
        &inference_config,
    );
    let model_ids: Arc<[String]> =
        vec![mood_score.base().id.clone(), depress_check.base().id.clone()].into();
    let state = AppState {
        mood_score: Arc::new(mood_score),
        depress_check: Arc::new(depress_check),
        model_ids,
    };
    let app = router(state, config.max_body_bytes);

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(
        handle.clone(),
        Duration::from_secs(config.shutdown_timeout),
    ));

    let served = serve(app, &config, handle).await;
    if let Err(err) = &served {
        error!("Server stopped with error: {:#}", err);
    }
    tokio::task::spawn_blocking(move || telemetry.shutdown()).await?;
    served
}

async fn serve(app: Router, config: &Config, handle: Handle) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.address, config.port).parse()?;
    match config.tls_paths() {
        Some((cert, key)) => {
            let tls_config = RustlsConfig::from_pem_file(cert, key).await?;
            info!("Listening on https://{}", addr);
            axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
        None => {
            info!("Listening on http://{}", addr);
            axum_server::bind(addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await?;
        }
    }
    Ok(())
}

fn load_model(base: ModelBase, config: &InferenceConfig) -> BertClassifierModel {
    match BertClassifierModel::new(base, config) {
        Ok(model) => model,
        Err(err) => exit_err!(1, "{:#}", err),
    }
}

async fn shutdown_signal(handle: Handle, timeout: Duration) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down, waiting up to {}s for requests", timeout.as_secs());
    handle.graceful_shutdown(Some(timeout));
}

#[macro_export]
macro_rules! exit_err {
    ($msg:expr) => {
        {
            tracing::error!($msg);
            std::process::exit(1);
        }
    };
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            tracing::error!($fmt $(, $arg)*);
            std::process::exit($code);
        }
    };
}
