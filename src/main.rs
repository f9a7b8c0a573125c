//! camsim demo: stream preview frames from the configured source and take a
//! still every few seconds until interrupted

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camsim::encode::BlobTrailer;
use camsim::pipeline::{ChannelListener, PipelineEvent};
use camsim::registry::DeviceRegistry;
use camsim::{CaptureRequest, Config, Session, StillSettings, StreamBuffer};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, error, info, warn};

const PREVIEW_STREAM: i32 = 1;
const STILL_STREAM: i32 = 2;
const STILL_EVERY: u32 = 90;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camsim=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camsim launching...");

    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("CAMSIM_CONFIG"))
        .map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    camsim::CONFIG.store(Arc::new(config.clone()));

    let registry = Arc::new(DeviceRegistry::new(config.capture.devices.clone()));
    let (listener, events) = ChannelListener::new();
    let session = Arc::new(Session::open(
        registry,
        "demo",
        &config,
        Arc::new(listener),
    )?);

    let _event_handle = tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            log_event(event);
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let submitter = {
        let session = Arc::clone(&session);
        let running = Arc::clone(&running);
        let config = config.clone();
        tokio::task::spawn_blocking(move || submit_loop(&session, &config, &running))
    };

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, stopping");
    running.store(false, Ordering::Release);
    submitter.await??;

    let session =
        Arc::try_unwrap(session).map_err(|_| eyre!("session still shared at shutdown"))?;
    session.pipeline().flush(Duration::from_secs(2));
    info!("Final counters: {:?}", session.pipeline().stats());
    session.close();

    info!("camsim shutting down");
    Ok(())
}

fn submit_loop(session: &Session, config: &Config, running: &AtomicBool) -> Result<()> {
    let pipeline = session.pipeline();
    let (width, height) = (config.capture.width, config.capture.height);
    let mut frame_number = 0u32;

    while running.load(Ordering::Acquire) {
        frame_number += 1;
        let mut buffers = vec![StreamBuffer::nv21(PREVIEW_STREAM, width, height)?];
        let mut request = CaptureRequest::new(frame_number, Vec::new());
        if frame_number % STILL_EVERY == 0 {
            let capacity = pipeline.still_buffer_size(width, height);
            buffers.push(StreamBuffer::blob(STILL_STREAM, width, height, capacity)?);
            request = request.with_still(StillSettings::default());
        }
        request.buffers = buffers;

        match pipeline.submit(request) {
            Ok(()) => {}
            Err(camsim::PipelineError::Timeout(what)) => {
                warn!(frame_number, "Submit timed out waiting for {}", what)
            }
            Err(e) => {
                error!(frame_number, "Submit failed: {}", e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn log_event(event: PipelineEvent) {
    match event {
        PipelineEvent::ExposureStart { .. } => {}
        PipelineEvent::DeviceError { frame_number } => {
            error!(frame_number, "Capture device error")
        }
        PipelineEvent::ResultReady {
            frame_number,
            buffers,
            timestamp,
        } => debug!(
            frame_number,
            buffers = buffers.len(),
            timestamp = timestamp.as_nanos(),
            "Result"
        ),
        PipelineEvent::StillImageReady {
            frame_number,
            buffer,
            success,
        } => {
            let size = BlobTrailer::read(buffer.data.as_slice()).map(|t| t.size);
            info!(frame_number, success, ?size, "Still image");
        }
    }
}
