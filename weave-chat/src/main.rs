// Weave chat: encrypted terminal chat between weave nodes.

mod config;

use std::path::PathBuf;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weave_core::stages::{routed_message, RoutingTable};
use weave_core::transport::TCP;
use weave_core::{Keypair, Network};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Route carrying chat lines.
const CHAT_ROUTE: &str = "msg";

#[derive(Debug, Default)]
struct Args {
    listen_addr: Option<String>,
    config: Option<PathBuf>,
    version: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--laddr" => out.listen_addr = Some(args.next().context("--laddr needs an address")?),
            "--config" => {
                out.config = Some(args.next().context("--config needs a path")?.into())
            }
            other => anyhow::bail!("unknown argument {other}"),
        }
    }
    Ok(out)
}

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Connect(&'a str),
    Say(&'a str),
    Empty,
}

fn parse_command(line: &str) -> Command<'_> {
    let line = line.trim();
    match line {
        "" => Command::Empty,
        "q" => Command::Quit,
        _ => match line.strip_prefix("c ") {
            Some(addr) if !addr.trim().is_empty() => Command::Connect(addr.trim()),
            _ => Command::Say(line),
        },
    }
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("weave-chat {}", VERSION);
        return Ok(());
    }

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(addr) = args.listen_addr {
        cfg.listen_addr = addr;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    info!("generating node key");
    let keypair = tokio::task::spawn_blocking(Keypair::generate).await??;

    let routes = RoutingTable::new().route(CHAT_ROUTE, |peer, msg| {
        println!("{} > {}", peer.remote_addr(), msg.payload_string());
    });
    let network = Network::tcp_builder(cfg.listen_addr.clone(), routes, keypair)
        .config(cfg.network.clone())
        .build();
    network.on_peer_connected(|peer| println!("* {} joined", peer.remote_addr()));
    network.on_peer_disconnected(|peer| println!("* {} left", peer.remote_addr()));
    network.on_peer_error(|peer, err| println!("* {} dropped: {}", peer.remote_addr(), err));

    network.start().await?;
    info!(addr = %cfg.listen_addr, version = VERSION, "weave-chat started");
    for addr in &cfg.bootstrap {
        if let Err(e) = network.connect_to(TCP, addr).await {
            warn!(addr = %addr, error = %e, "bootstrap peer unreachable");
        }
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            res = &mut shutdown => {
                res?;
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        match parse_command(&line) {
            Command::Quit => break,
            Command::Empty => {}
            Command::Connect(addr) => match network.connect_to(TCP, addr).await {
                Ok(peer) => info!(peer = %peer.id(), addr, "connected"),
                Err(e) => println!("* connect {} failed: {}", addr, e),
            },
            Command::Say(text) => {
                let queued = network.broadcast(routed_message(CHAT_ROUTE, text)).await?;
                if queued == 0 {
                    println!("* nobody to talk to; connect with `c <addr>`");
                }
            }
        }
    }

    info!("shutting down");
    network.stop().await?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_flags() {
        let a = args(&["--laddr", "127.0.0.1:4000", "--config", "/tmp/w.toml"]).unwrap();
        assert_eq!(a.listen_addr.as_deref(), Some("127.0.0.1:4000"));
        assert_eq!(a.config, Some(PathBuf::from("/tmp/w.toml")));
        assert!(!a.version);
        assert!(args(&["-V"]).unwrap().version);
        assert!(args(&["--laddr"]).is_err());
        assert!(args(&["--bogus"]).is_err());
    }

    #[test]
    fn commands() {
        assert_eq!(parse_command("q"), Command::Quit);
        assert_eq!(parse_command("  "), Command::Empty);
        assert_eq!(parse_command("c 10.0.0.1:3000"), Command::Connect("10.0.0.1:3000"));
        assert_eq!(parse_command("c "), Command::Say("c"));
        assert_eq!(parse_command("quick question"), Command::Say("quick question"));
    }
}
