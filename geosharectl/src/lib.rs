//! Library part of the `geosharectl` utility.
//!
//! `geosharectl` plays both roles of the position sharing application:
//!
//! - a sender publishing its position on the hub, fixed or replayed from a track,
//! - a receiver printing the place name of the latest position published by the others.
//!
//! All the real work is in `geoshare-client`, this is only option parsing, configuration and
//! output.
//!

/// Re-export
///
pub use cli::*;
pub use cmds::*;
pub use config::*;

mod cli;
mod cmds;
mod config;
