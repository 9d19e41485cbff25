// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! cosched CLI: demo programs for the cooperative scheduler.

mod commands;
mod output;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use cosched_rt::SchedulerConfig;

#[derive(Parser, Debug)]
#[command(name = "cosched", version, about = "Cooperative task scheduler demos", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Print the run report as JSON
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Longest the reactor may block when no task is runnable (default: forever)
    #[arg(long, global = true)]
    poll_timeout_ms: Option<u64>,

    /// Return after this many scheduler passes
    #[arg(long, global = true)]
    pass_budget: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Listener and client tasks exchanging one payload
    Echo {
        /// Use the in-memory network instead of loopback TCP
        #[arg(long)]
        sim: bool,

        #[arg(long, default_value = "PING")]
        payload: String,
    },

    /// Root tasks that each spawn one child
    SpawnTree {
        #[arg(long, default_value_t = 3)]
        roots: usize,
    },

    /// Send the current time to every client, then hang up
    TimeServer {
        #[arg(long, default_value = "0.0.0.0:8888")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 2)]
        backlog: u32,

        /// Stop accepting after this many clients
        #[arg(long)]
        max_clients: Option<usize>,
    },

    /// Serve `Cmd: N` requests from a single client
    CommandServer {
        #[arg(long, default_value = "0.0.0.0:8888")]
        bind: SocketAddr,

        #[arg(long, default_value_t = 2)]
        backlog: u32,

        /// Values reported for `Cmd: 1`
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "65.3,142.7,138.2,160.9,55.4,120.1,38.8"
        )]
        readings: Vec<f64>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .try_init()
        .ok();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    output::init();

    let mut config = SchedulerConfig::new();
    if let Some(ms) = cli.poll_timeout_ms {
        config = config.with_poll_timeout(Duration::from_millis(ms));
    }
    if let Some(passes) = cli.pass_budget {
        config = config.with_pass_budget(passes);
    }
    let opts = commands::RunOptions {
        config,
        json: cli.json,
    };

    match cli.command {
        Commands::Echo { sim, payload } => commands::echo::cmd_echo(&opts, sim, payload.into_bytes()),
        Commands::SpawnTree { roots } => commands::spawn_tree::cmd_spawn_tree(&opts, roots),
        Commands::TimeServer {
            bind,
            backlog,
            max_clients,
        } => commands::time_server::cmd_time_server(&opts, bind, backlog, max_clients),
        Commands::CommandServer {
            bind,
            backlog,
            readings,
        } => commands::command_server::cmd_command_server(&opts, bind, backlog, readings),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "cosched",
            "spawn-tree",
            "--roots",
            "5",
            "-vv",
            "--pass-budget",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.pass_budget, Some(3));
        assert!(matches!(cli.command, Commands::SpawnTree { roots: 5 }));
    }

    #[test]
    fn readings_split_on_commas() {
        let cli = Cli::try_parse_from(["cosched", "command-server", "--readings", "1.5,-999,70"]).unwrap();
        match cli.command {
            Commands::CommandServer { readings, bind, .. } => {
                assert_eq!(readings, vec![1.5, -999.0, 70.0]);
                assert_eq!(bind.port(), 8888);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
