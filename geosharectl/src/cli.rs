//! Module describing all possible commands and sub-commands to the `geosharectl` main driver
//!
//! We have three main commands:
//!
//! - `send`, publish our position once or at a fixed cadence,
//! - `receive`, watch the positions published by the others and their place names,
//! - `resolve`, one-shot reverse lookup.
//!
//! `completion` is here just to configure the various shells completion system.
//!

use std::path::PathBuf;

use clap::{crate_authors, crate_description, crate_name, crate_version, Parser};
use clap_complete::shells::Shell;

/// CLI options
#[derive(Parser)]
#[command(disable_version_flag = true)]
#[clap(name = crate_name!(), about = crate_description!())]
#[clap(version = crate_version!(), author = crate_authors!())]
pub struct Opts {
    /// configuration file.
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,
    /// debug mode.
    #[clap(short = 'D', long = "debug")]
    pub debug: bool,
    /// Verbose mode.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Sub-commands (see below).
    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

// ------

/// All sub-commands:
///
/// `completion SHELL`
/// `receive -u USER [-d SECS]`
/// `resolve --lat LAT --lon LON`
/// `send -u USER (--lat LAT --lon LON | -t FILE) [--once] [-i MS]`
/// `version`
///
#[derive(Debug, Parser)]
pub enum SubCommand {
    /// Generate Completion stuff
    Completion(ComplOpts),
    /// Watch positions from the other parties
    Receive(ReceiveOpts),
    /// Reverse lookup of one position
    Resolve(ResolveOpts),
    /// Publish our position
    Send(SendOpts),
    /// List all package versions
    Version,
}

// ------

/// Options for `send`.
///
#[derive(Debug, Parser)]
pub struct SendOpts {
    /// Identity on the hub.
    #[clap(short = 'u', long)]
    pub user: String,
    /// Latitude of a fixed position.
    #[clap(long, allow_negative_numbers = true, requires = "lon", conflicts_with = "track")]
    pub lat: Option<f64>,
    /// Longitude of a fixed position.
    #[clap(long, allow_negative_numbers = true, requires = "lat")]
    pub lon: Option<f64>,
    /// Replay a track file, one `lat,lon` per line.
    #[clap(short = 't', long)]
    pub track: Option<PathBuf>,
    /// Send once and exit.
    #[clap(long)]
    pub once: bool,
    /// Cadence in milliseconds, overrides the configuration.
    #[clap(short = 'i', long)]
    pub interval: Option<u64>,
    /// Stop after this many seconds.
    #[clap(short = 'd', long)]
    pub duration: Option<u64>,
}

/// Options for `receive`.
///
#[derive(Debug, Parser)]
pub struct ReceiveOpts {
    /// Identity on the hub.
    #[clap(short = 'u', long)]
    pub user: String,
    /// Stop after this many seconds.
    #[clap(short = 'd', long)]
    pub duration: Option<u64>,
}

/// Options for `resolve`.
///
#[derive(Debug, Parser)]
pub struct ResolveOpts {
    /// Latitude.
    #[clap(long, allow_negative_numbers = true)]
    pub lat: f64,
    /// Longitude.
    #[clap(long, allow_negative_numbers = true)]
    pub lon: f64,
}

// ------

/// Options to generate completion files at runtime
///
#[derive(Debug, Parser)]
pub struct ComplOpts {
    #[clap(value_parser)]
    pub shell: Shell,
}
