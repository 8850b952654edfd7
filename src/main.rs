use std::{env, process::exit, time::Duration};

use clap::Parser;
use colored::*;

use wg_limiterd::{PeerLimiterDaemon, VERSION};

#[derive(Debug, Parser)]
#[clap(name = "wg-limiterd", author, version, about)]
struct Opts {
    /// Polling interval in seconds.
    #[clap(long, default_value_t = 1.0)]
    interval: f64,

    /// Enable verbose (debug) logging.
    #[clap(long)]
    verbose: bool,
}

fn main() {
    let opts = Opts::parse();

    if env::var_os("RUST_LOG").is_none() {
        // Set some default log settings.
        env::set_var(
            "RUST_LOG",
            if opts.verbose {
                "wg_limiterd=debug"
            } else {
                "wg_limiterd=info"
            },
        );
    }
    pretty_env_logger::init();

    if unsafe { libc::getuid() } != 0 {
        log::warn!("not running as root; firewall enforcement will likely fail open");
    }

    if !opts.interval.is_finite() || opts.interval <= 0.0 {
        eprintln!(
            "{}: --interval must be a positive number of seconds",
            "invalid arguments".red()
        );
        exit(1);
    }

    log::info!("wg-limiterd {VERSION} starting");
    let mut daemon = match PeerLimiterDaemon::new(Duration::from_secs_f64(opts.interval)) {
        Ok(daemon) => daemon,
        Err(e) => {
            eprintln!("{}: {}", "initialization failed".red(), e);
            exit(1);
        },
    };
    daemon.run();
}
