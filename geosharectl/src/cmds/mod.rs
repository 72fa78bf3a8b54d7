//! Sub-commands and their output.
//!
pub use receive::*;
pub use resolve::*;
pub use send::*;

mod receive;
mod resolve;
mod send;

use std::time::Duration;

use geoshare_client::{ResolvedLocation, Resolution};

/// Wait for Ctrl-C, or the end of `duration` if there is one.
///
pub(crate) async fn interrupted(duration: Option<Duration>) {
    match duration {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(d) => (),
                _ = tokio::signal::ctrl_c() => (),
            }
        }
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

fn location(loc: &ResolvedLocation) -> String {
    let c = &loc.coordinate;
    let mut s = loc.display_name.clone();
    if let Some(kind) = loc.kind() {
        s.push_str(&format!("\n  {kind}"));
    }
    s.push_str(&format!("\n  {c} from {}", c.source_id()));
    s
}

/// Text for a settled resolution, `None` while there is nothing to show.
///
pub fn describe(r: &Resolution) -> Option<String> {
    match r {
        Resolution::Resolved(loc) => Some(location(loc)),
        Resolution::Failed {
            coordinate,
            last_good,
            ..
        } => {
            let mut s = format!("{r}\n  {coordinate} from {}", coordinate.source_id());
            if let Some(loc) = last_good {
                s.push_str(&format!("\n  last known: {}", loc.display_name));
            }
            Some(s)
        }
        Resolution::Idle | Resolution::Pending { .. } => None,
    }
}
