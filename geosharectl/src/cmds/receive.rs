//! This is the module handling the `receive` sub-command.
//!

use std::time::Duration;

use eyre::Result;
use tracing::{info, trace};

use geoshare_client::{ClientConfig, CoordinateStreamClient, Stats};

use crate::{describe, interrupted, ReceiveOpts};

/// Print connection changes and every settled resolution until interrupted.
///
#[tracing::instrument(skip(cfg))]
pub async fn receive_positions(cfg: &ClientConfig, opts: &ReceiveOpts) -> Result<Stats> {
    trace!("receive_positions({})", opts.user);

    let client = CoordinateStreamClient::from_config(cfg)?;
    let mut states = client.subscribe_state();
    let mut resolutions = client.subscribe_resolution();

    client.connect(&opts.user).await?;
    info!("Connected to {} as {}", cfg.hub.url, opts.user);
    eprintln!("Waiting for update...");

    let stop = interrupted(opts.duration.map(Duration::from_secs));
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            Ok(()) = states.changed() => {
                let state = *states.borrow_and_update();
                eprintln!("Connection: {state}");
            }
            Ok(()) = resolutions.changed() => {
                let text = describe(&resolutions.borrow_and_update());
                if let Some(text) = text {
                    println!("{text}");
                }
            }
        }
    }

    client.disconnect().await;
    Ok(client.stats())
}
