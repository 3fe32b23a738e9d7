use bgpmon::{Config, Daemon};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bgpmond", version, about = "BGP monitoring collector")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "bgpmon.toml")]
    config: PathBuf,

    /// Log filter override (e.g. debug, bgpmon=trace)
    #[arg(short, long)]
    log: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let env = match &cli.log {
        Some(filter) => env_logger::Env::default().default_filter_or(filter.clone()),
        None => env_logger::Env::default().default_filter_or("info"),
    };
    env_logger::Builder::from_env(env).init();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("cannot load configuration: {e}");
            std::process::exit(1);
        }
    };
    let monitor_id = config.ensure_monitor_id(&cli.config);

    let daemon = Daemon::start(&config, monitor_id);

    let (stop_sender, stop_receiver) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_sender.send(());
    })
    .expect("install signal handler");

    let _ = stop_receiver.recv();
    daemon.stop();
}
