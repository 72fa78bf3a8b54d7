//! This is the module handling the `send` sub-command.
//!

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result};
use tokio::time::timeout;
use tracing::{info, trace};

use geoshare_client::{
    ClientConfig, CoordinateStreamClient, FixedPosition, PeriodicEmitter, PositionSource, Stats,
    TrackPosition,
};

use crate::{describe, interrupted, SendOpts};

/// How long `--once` waits for our own position to be resolved
const SETTLE: Duration = Duration::from_secs(15);

fn position_source(opts: &SendOpts) -> Result<Arc<dyn PositionSource>> {
    match (&opts.track, opts.lat, opts.lon) {
        (Some(track), _, _) => Ok(Arc::new(TrackPosition::from_file(track)?)),
        (None, Some(lat), Some(lon)) => Ok(Arc::new(FixedPosition::new(lat, lon))),
        _ => Err(eyre!("need either --lat and --lon or --track")),
    }
}

/// Publish our position, once or until interrupted.
///
#[tracing::instrument(skip(cfg))]
pub async fn send_position(cfg: &ClientConfig, opts: &SendOpts) -> Result<Stats> {
    trace!("send_position({})", opts.user);

    let source = position_source(opts)?;
    let client = Arc::new(CoordinateStreamClient::from_config(cfg)?);

    let every = Duration::from_millis(opts.interval.unwrap_or(cfg.emitter.interval_ms));
    let emitter = PeriodicEmitter::new(client.clone(), source, every)?;

    client.connect(&opts.user).await?;
    info!("Connected to {} as {}", cfg.hub.url, opts.user);

    if opts.once {
        let coord = emitter.emit_once().await?;
        eprintln!("Sent {coord}");

        // Wait for our own position to be resolved.
        //
        let mut rx = client.subscribe_resolution();
        if let Ok(Ok(r)) = timeout(SETTLE, rx.wait_for(|r| r.is_settled())).await {
            if let Some(text) = describe(&r) {
                println!("{text}");
            }
        };
    } else {
        emitter.start();
        interrupted(opts.duration.map(Duration::from_secs)).await;
        emitter.stop();
    }

    client.disconnect().await;
    Ok(totals(emitter.stats(), client.stats()))
}

/// The connection already counts what went out.
///
fn totals(emitter: Stats, client: Stats) -> Stats {
    Stats { sent: 0, ..emitter } + client
}
