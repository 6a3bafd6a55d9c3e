//! framesink demo: synthetic capture feeding a slow consumer

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use framesink::capture::{ConnectionInfo, FrameBuffer, SyntheticSource};
use framesink::{Config, DeliverySink, DropRecord};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("framesink demo launching...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    framesink::CONFIG.store(Arc::new(config.clone()));
    info!(?config.sink, "configuration loaded");

    let mut source = SyntheticSource::new(config.capture.clone(), ConnectionInfo::new(1, "synthetic"))?;
    let sink = DeliverySink::from_global_config();

    // Frames kept past their callback, released later by a background task
    let (retain_tx, retain_rx) = flume::unbounded::<FrameBuffer>();
    let retain_for = Duration::from_millis(config.demo.retain_ms);
    let retainer = tokio::spawn(async move {
        while let Ok(mut frame) = retain_rx.recv_async().await {
            tokio::time::sleep(retain_for).await;
            debug!(sequence = frame.sequence(), "releasing retained frame");
            frame.release();
        }
    });

    let work = Duration::from_millis(config.demo.consumer_work_ms);
    let retain_every = config.demo.retain_every;
    sink.set_frame_callback(move |frame: FrameBuffer| {
        let luma = frame.pixel_plane(0)?;
        let mean = luma.data.iter().map(|&b| b as u64).sum::<u64>() / luma.data.len().max(1) as u64;
        debug!(sequence = frame.sequence(), mean, "frame consumed");

        std::thread::sleep(work);

        if retain_every > 0 && frame.sequence() % retain_every == 0 {
            // The retainer only goes away at shutdown; the frame is released either way.
            let _ = retain_tx.send(frame);
        }
        Ok(())
    });
    sink.set_drop_callback(|record: DropRecord| {
        warn!(
            sequence = record.sequence,
            reason = %record.reason,
            timestamp = %record.timestamp,
            "frame dropped"
        );
        Ok(())
    });

    sink.attach(&source)?;
    source.start()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(config.demo.report_interval_ms.max(1)));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Ctrl-C received");
                break;
            }
            _ = ticker.tick() => {
                report(&sink, &source);
                if source.is_finished() {
                    info!("Capture finished");
                    break;
                }
            }
        }
    }

    // Stopping and detaching join threads, so keep them off the runtime workers.
    let (source, sink) = tokio::task::spawn_blocking(move || -> Result<_> {
        source.stop()?;
        sink.detach(&source)?;
        // Dropping the callback drops the last retain sender.
        sink.clear_frame_callback();
        Ok((source, sink))
    })
    .await??;
    retainer.await?;

    report(&sink, &source);
    info!("framesink demo shutting down");
    Ok(())
}

fn report(sink: &DeliverySink, source: &SyntheticSource) {
    let stats = sink.delivery_stats();
    let drops = sink.drop_snapshot();
    let pool = source.pool().stats();

    info!(
        delivered = stats.frames_delivered,
        faults = stats.consumer_faults,
        dropped = drops.total(),
        pool_outstanding = pool.outstanding(),
        pool_exhausted = pool.exhausted,
        "delivery report"
    );
    for (reason, count) in drops.iter() {
        info!(%reason, count, "  drops");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framesink=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}
