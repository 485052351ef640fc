//! Duplex CLI: runs the demo protocol over TCP, UDP or anonymous pipes.
//!
//! Every subcommand speaks the same protocol (see [`demo`]); the transport is
//! the only thing that changes.

mod cli;
mod demo;
mod session;

use crate::cli::{Cli, Commands};
use crate::session::SessionContext;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = duplex_wire::load_config(cli.config.as_deref());
    let ctx = SessionContext {
        config,
        node: cli
            .node
            .clone()
            .unwrap_or_else(|| format!("duplex-{}", &uuid::Uuid::new_v4().to_string()[..8])),
        secret: cli.secret.clone().filter(|s| !s.is_empty()),
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = rt.block_on(async move {
        match cli.command {
            Commands::TcpServe { addr, once } => session::tcp_serve(addr, once, ctx).await,
            Commands::TcpConnect { addr, count } => session::tcp_connect(addr, count, ctx).await,
            Commands::UdpServe { addr, once } => session::udp_serve(addr, once, ctx).await,
            Commands::UdpConnect { addr, bind, count } => {
                session::udp_connect(addr, bind, count, ctx).await
            }
            #[cfg(unix)]
            Commands::PipeParent { count } => session::pipe_parent(count, cli.config, ctx).await,
            #[cfg(unix)]
            Commands::PipeChild { handles } => match duplex_wire::PipeHandles::parse(&handles) {
                Ok(handles) => session::pipe_child(handles, ctx).await,
                Err(e) => Err(e),
            },
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
