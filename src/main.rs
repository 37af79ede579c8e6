mod channel;
mod config;
mod content_filter;
mod logging;
mod protocol;
mod service;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use log::{error, info};

use crate::channel::FramedChannel;
use crate::config::{DEFAULT_LOG_PATH, ServiceConfig};
use crate::content_filter::{ContentFilter, OnnxSession, onnx};
use crate::service::Service;

fn main() -> ExitCode {
    let config = ServiceConfig::load();
    let log_path = config
        .as_ref()
        .map(|c| c.log_path.clone())
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_PATH));
    logging::init(&log_path);

    let outcome = config
        .context("failed to load configuration")
        .and_then(run);
    let code = match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Fatal: {err:#}");
            ExitCode::FAILURE
        }
    };
    log::logger().flush();
    code
}

fn run(config: ServiceConfig) -> Result<()> {
    info!("Image guard service starting...");

    onnx::init_runtime(&config.library_path)
        .context("failed to initialize ONNX Runtime environment")?;
    info!(
        "ONNX Runtime environment initialized from {}",
        config.library_path.display()
    );

    let session = OnnxSession::load(&config.model_path).with_context(|| {
        format!("failed to load ONNX model {}", config.model_path.display())
    })?;

    let channel = FramedChannel::new(
        io::stdin().lock(),
        io::stdout().lock(),
        config.max_message_bytes,
    );
    let mut service = Service::new(channel, ContentFilter::new(session));
    service.run();

    service.into_filter().into_session().close();
    Ok(())
}
