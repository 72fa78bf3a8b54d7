use std::io;
use std::time::Instant;

use clap::{crate_authors, crate_description, crate_version, CommandFactory, Parser};
use clap_complete::generate;
use eyre::Result;
use tracing::{info, trace};

use geoshare_client::ClientConfig;
use geoshare_common::init_logging;
use geosharectl::{
    receive_positions, resolve_position, send_position, Config, Opts, SubCommand,
};

/// Binary name, using a different binary name
pub const NAME: &str = env!("CARGO_BIN_NAME");
/// Binary version
pub const VERSION: &str = crate_version!();
/// Authors
pub const AUTHORS: &str = crate_authors!();

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    // Initialise logging.
    //
    init_logging(NAME, opts.debug, None)?;

    // Missing default config file means defaults.
    //
    let cfg: ClientConfig = Config::load(opts.config.as_deref())?.into();

    if opts.verbose > 0 {
        banner()?;
    }

    handle_subcmd(&cfg, &opts.subcmd).await
}

pub async fn handle_subcmd(cfg: &ClientConfig, subcmd: &SubCommand) -> Result<()> {
    let start = Instant::now();

    match subcmd {
        // Handle `send`
        //
        SubCommand::Send(sopts) => {
            trace!("send");

            let stats = send_position(cfg, sopts).await?;
            eprintln!("{stats} in {}", humantime::format_duration(start.elapsed()));
        }

        // Handle `receive`
        //
        SubCommand::Receive(ropts) => {
            trace!("receive");

            let stats = receive_positions(cfg, ropts).await?;
            eprintln!("{stats} in {}", humantime::format_duration(start.elapsed()));
        }

        // Handle `resolve`
        //
        SubCommand::Resolve(ropts) => {
            trace!("resolve");

            let table = resolve_position(cfg, ropts).await?;
            println!("{table}");
        }

        // Standalone completion generation
        //
        // NOTE: you can generate UNIX shells completion on Windows and vice-versa.  Not worth
        //       trying to limit depending on the OS.
        //
        SubCommand::Completion(copts) => {
            let generator = copts.shell;
            generate(generator, &mut Opts::command(), NAME, &mut io::stdout());
        }

        // Standalone `version` command
        //
        SubCommand::Version => {
            info!("Listing versions");
            eprintln!("Modules: ");
            eprintln!("\t{}", version());
            eprintln!("\t{}", geoshare_client::version());
            eprintln!("\t{}", geoshare_common::version());
        }
    }
    Ok(())
}

/// Return our version number
///
#[inline]
pub fn version() -> String {
    format!("{}/{}", NAME, VERSION)
}

/// Display banner
///
fn banner() -> Result<()> {
    Ok(eprintln!(
        r##"
{}/{} by {}
{}
"##,
        NAME,
        VERSION,
        AUTHORS,
        crate_description!()
    ))
}
