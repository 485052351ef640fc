//! Clap CLI definitions for the duplex demo harness.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  duplex tcp-serve --addr 127.0.0.1:7400          Answer pings over TCP
  duplex tcp-connect --addr 127.0.0.1:7400 -n 5   Send five pings over TCP
  duplex udp-serve --addr 127.0.0.1:7401          Answer pings from many UDP endpoints
  duplex pipe-parent -n 3                         Ping a child process over anonymous pipes

\x1b[1;36mEnvironment:\x1b[0m
  RUST_LOG        Log filter (default: info)
  DUPLEX_SECRET   Pre-shared key; switches to the authenticated handshake";

/// Duplex: handshake-gated typed messaging over TCP, UDP and pipes.
#[derive(Parser)]
#[command(name = "duplex", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.duplex/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Pre-shared key for the authenticated handshake.
    #[arg(long, global = true, env = "DUPLEX_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Name advertised during the handshake.
    #[arg(long, global = true)]
    pub node: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Accept TCP connections and answer pings.
    TcpServe {
        #[arg(long, default_value = "127.0.0.1:7400")]
        addr: SocketAddr,
        /// Exit after the first connection ends.
        #[arg(long)]
        once: bool,
    },
    /// Connect over TCP and send pings.
    TcpConnect {
        #[arg(long, default_value = "127.0.0.1:7400")]
        addr: SocketAddr,
        /// Number of pings.
        #[arg(long, short = 'n', default_value_t = 3)]
        count: u32,
    },
    /// Serve every UDP endpoint that sends to this address.
    UdpServe {
        #[arg(long, default_value = "127.0.0.1:7401")]
        addr: SocketAddr,
        /// Exit after the first peer says goodbye.
        #[arg(long)]
        once: bool,
    },
    /// Send pings to a UDP server.
    UdpConnect {
        #[arg(long, default_value = "127.0.0.1:7401")]
        addr: SocketAddr,
        /// Local address to bind.
        #[arg(long, default_value = "127.0.0.1:0")]
        bind: SocketAddr,
        #[arg(long, short = 'n', default_value_t = 3)]
        count: u32,
    },
    /// Spawn this binary as a child and ping it over anonymous pipes.
    #[cfg(unix)]
    PipeParent {
        #[arg(long, short = 'n', default_value_t = 3)]
        count: u32,
    },
    /// Child side of `pipe-parent`; not meant to be run by hand.
    #[cfg(unix)]
    #[command(hide = true)]
    PipeChild {
        /// `--read <fd> --write <fd>` as appended by the parent.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        handles: Vec<String>,
    },
}
