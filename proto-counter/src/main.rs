use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use env_logger::{Env, Target};

use proto_counter_common::IF_STATS_MAX_ENTRIES;

mod collector;
mod ebpf_loader;
mod metrics;
mod model;
mod replay;
mod store;

#[derive(Parser)]
#[command(name = "proto-counter")]
#[command(about = "Per-protocol ingress packet counters", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the counter program, pin its maps and attach it to an interface
    Attach(AttachCommand),
    /// Periodically read the pinned maps and export per-protocol counters as Prometheus metrics
    Collect(CollectCommand),
    /// Run captured frames through the classifier on host cores and print the totals
    Replay(ReplayCommand),
}

#[derive(Args)]
struct AttachCommand {
    /// Network interface to attach to
    #[arg(long, value_name = "IFACE")]
    iface: String,
    /// Hook the program runs from
    #[arg(long, value_enum, default_value_t = ebpf_loader::AttachPoint::TcIngress)]
    attach_point: ebpf_loader::AttachPoint,
    /// XDP attach mode (ignored for tc)
    #[arg(long, value_enum, default_value_t = ebpf_loader::XdpMode::Skb)]
    xdp_mode: ebpf_loader::XdpMode,
    /// Directory the counter maps are pinned under
    #[arg(long, env = "PROTO_COUNTER_PIN_DIR", default_value = ebpf_loader::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
    /// Maximum number of (interface, protocol) pairs tracked
    #[arg(long, value_name = "COUNT", default_value_t = IF_STATS_MAX_ENTRIES)]
    if_map_entries: u32,
}

#[derive(Args)]
struct CollectCommand {
    /// Directory the counter maps are pinned under
    #[arg(long, env = "PROTO_COUNTER_PIN_DIR", default_value = ebpf_loader::DEFAULT_PIN_DIR)]
    pin_dir: PathBuf,
    /// Seconds between scrapes
    #[arg(long, default_value_t = collector::DEFAULT_INTERVAL_SECS)]
    interval_secs: u64,
    /// Print a single snapshot as JSON lines and exit
    #[arg(long, action = ArgAction::SetTrue)]
    once: bool,
    /// Also print every scrape's deltas as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    /// Address the Prometheus endpoint listens on
    #[arg(long, env = "PROTO_COUNTER_METRICS_ADDR", default_value = metrics::DEFAULT_METRICS_ADDR)]
    metrics_addr: SocketAddr,
}

#[derive(Args)]
struct ReplayCommand {
    /// File with one hex-encoded frame per line
    #[arg(long, value_name = "FILE")]
    input: PathBuf,
    /// Number of simulated cores
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Interface index for lines that do not carry one
    #[arg(long, default_value_t = 0)]
    ifindex: u32,
    /// Maximum number of (interface, protocol) pairs tracked across all workers
    #[arg(long, value_name = "COUNT", default_value_t = IF_STATS_MAX_ENTRIES)]
    if_map_entries: u32,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    if let Err(err) = run().await {
        eprintln!("proto-counter error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Attach(cmd)) => {
            let opts = ebpf_loader::AttachOptions {
                iface: cmd.iface,
                pin_dir: cmd.pin_dir,
                attach_point: cmd.attach_point,
                xdp_mode: cmd.xdp_mode,
                if_map_entries: cmd.if_map_entries,
            };
            ebpf_loader::attach_program(opts).await?;
        }
        Some(Commands::Collect(cmd)) => {
            let opts = collector::CollectOptions {
                pin_dir: cmd.pin_dir,
                interval: Duration::from_secs(cmd.interval_secs),
                once: cmd.once,
                json: cmd.json,
                metrics_addr: cmd.metrics_addr,
            };
            collector::run_collector(opts).await?;
        }
        Some(Commands::Replay(cmd)) => {
            let opts = replay::ReplayOptions {
                input: cmd.input,
                workers: cmd.workers,
                ifindex: cmd.ifindex,
                if_map_entries: cmd.if_map_entries,
            };
            replay::run_replay(opts).await?;
        }
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn collect_defaults() {
        let cli = Cli::try_parse_from(["proto-counter", "collect", "--pin-dir", "/tmp/pins"])
            .expect("parse");
        match cli.command {
            Some(Commands::Collect(cmd)) => {
                assert_eq!(cmd.interval_secs, collector::DEFAULT_INTERVAL_SECS);
                assert_eq!(cmd.pin_dir, PathBuf::from("/tmp/pins"));
                assert!(!cmd.once);
                assert!(!cmd.json);
                assert_eq!(
                    cmd.metrics_addr,
                    metrics::DEFAULT_METRICS_ADDR.parse::<SocketAddr>().expect("addr")
                );
            }
            _ => panic!("expected collect"),
        }
    }

    #[test]
    fn attach_defaults_to_tc_ingress() {
        let cli = Cli::try_parse_from(["proto-counter", "attach", "--iface", "eth0"]).expect("parse");
        match cli.command {
            Some(Commands::Attach(cmd)) => {
                assert_eq!(cmd.attach_point, ebpf_loader::AttachPoint::TcIngress);
                assert_eq!(cmd.if_map_entries, IF_STATS_MAX_ENTRIES);
            }
            _ => panic!("expected attach"),
        }
    }

    #[test]
    fn replay_defaults_to_kernel_table_size() {
        let cli = Cli::try_parse_from(["proto-counter", "replay", "--input", "frames.hex", "--workers", "4"])
            .expect("parse");
        match cli.command {
            Some(Commands::Replay(cmd)) => {
                assert_eq!(cmd.workers, 4);
                assert_eq!(cmd.if_map_entries, IF_STATS_MAX_ENTRIES);
            }
            _ => panic!("expected replay"),
        }
    }
}
