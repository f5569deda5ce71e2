//! # cryptocomms
//!
//! Entry point for the command-line interface.

use clap::Parser;
use console::style;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cryptocomms::constants::{DEFAULT_SEGNUM_FILE, DEFAULT_WORKERS};
use cryptocomms::{parse_config_file, Result, Session};

const VERSION: &str = env!("CARGO_PKG_VERSION");

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Peer-to-peer secure datagram tunnel
#[derive(Parser)]
#[command(
    name = "cryptocomms",
    version = VERSION,
    about = "Peer-to-peer secure datagram tunnel over authenticated UDP",
    long_about = None,
    after_help = "The configuration file names this host, its peers and their \
                  channels; each channel appears on disk as a pair of FIFOs \
                  (<base>_OUTWARD, <base>_INWARD).\n\n\
                  The segment number files <base>_FIRST and <base>_SECOND must \
                  be initialised with a small positive value before first use, \
                  e.g.:  printf '1\\n1\\n' > segnumfile_FIRST"
)]
struct Cli {
    /// Config file path
    config: String,

    /// Base path of the segment number files
    #[arg(long, default_value = DEFAULT_SEGNUM_FILE)]
    segnum_file: String,

    /// Number of connection worker threads
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Minimal output
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    if let Err(e) = run(&cli) {
        eprintln!("{} Error: {}", style("✗").red().bold(), e);
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = parse_config_file(&cli.config)?;
    let mut session = Session::start(&config, &cli.segnum_file, cli.workers)?;

    setup_signal_handler();

    while RUNNING.load(Ordering::SeqCst) && !session.has_failed() {
        std::thread::sleep(Duration::from_millis(100));
    }

    session.stop();

    if session.has_failed() {
        return Err(cryptocomms::CommsError::Startup(
            "session terminated after an unrecoverable error".to_string(),
        ));
    }
    Ok(())
}

fn setup_signal_handler() {
    unsafe {
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
    }
}

extern "C" fn signal_handler(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}
