//! Thin binary entry point: loads configuration, wraps a raw TUN file
//! descriptor handed to us by whatever launched this process (acquiring
//! that descriptor is explicitly out of scope), and drives
//! `RelayEngine::start`/`stop`.

use clap::Parser;
use relay_core::protect::noop_protect;
use relay_core::tun::RawFdTunDevice;
use relay_core::{RelayEngine, TunDevice};
use relay_support::config::RelayConfig;
use relay_support::logging;
use slog::info;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(about = "Userspace TUN-to-socket relay engine")]
struct Args {
    /// Raw file descriptor of an already-open TUN device in
    /// packet-boundary-preserving mode.
    #[arg(long)]
    tun_fd: i32,

    /// Optional TOML configuration file. Missing sections fall back to
    /// their defaults.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RelayConfig::load(path).unwrap_or_else(|err| {
            eprintln!("failed to load config {}: {}", path.display(), err);
            process::exit(1);
        }),
        None => RelayConfig::default(),
    };

    let log = logging::init(&config.logging.level, config.logging.destination);

    // SAFETY: the caller is responsible for having opened `tun_fd` as a
    // valid TUN device and for not closing it out from under us.
    let tun: Arc<dyn TunDevice> = Arc::new(unsafe { RawFdTunDevice::from_raw_fd(args.tun_fd) });

    // Socket protection is a platform capability this crate doesn't
    // acquire itself; a production launcher would inject the real
    // callback here instead.
    let protect = noop_protect();

    let engine = match RelayEngine::start(tun, protect, config, log.clone()) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("failed to start relay engine: {}", err);
            process::exit(1);
        }
    };

    info!(log, "relay running, press enter to stop");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);

    engine.stop();
}
