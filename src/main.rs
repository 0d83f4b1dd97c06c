use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use sshtun::config::{AuthConfig, Config, GatewayAddr, GatewayConfig, TunnelSpec};
use sshtun::{Dialer, SshDialer, TcpDialer, ThreadedReader, TunnelManager, DEFAULT_BIND_ADDR};
use tokio::io::BufReader;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const PASSWORD_ENV: &str = "SSHTUN_PASSWORD";

#[derive(Parser)]
#[clap(name = "sshtun")]
#[clap(about = "Manage many local port forwards over one SSH session", long_about = None)]
struct Cli {
    /// SSH gateway, [user@]host[:port]
    gateway: Option<GatewayAddr>,

    /// SSH user, if not given in the gateway address
    #[clap(short, long)]
    user: Option<String>,

    /// Private key for public key authentication
    #[clap(short, long, parse(from_os_str))]
    identity: Option<PathBuf>,

    /// Config file (TOML)
    #[clap(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Forward LOCAL_PORT:HOST:PORT at startup; may be repeated
    #[clap(short = 'L', long = "forward")]
    forwards: Vec<TunnelSpec>,

    /// Address the local listeners bind to
    #[clap(long)]
    bind: Option<IpAddr>,

    /// Dial destinations from this host instead of through a gateway
    #[clap(long)]
    direct: bool,

    /// Keep tunnels running without the interactive menu until Ctrl+C
    #[clap(long)]
    no_menu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they don't interleave with the menu on stdout
    let is_atty = atty::is(atty::Stream::Stderr);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from(level)),
        )
        .with_ansi(is_atty)
        .with_writer(std::io::stderr)
        .init();

    match fdlimit::raise_fd_limit() {
        Some(limit) => debug!("Raised open file limit to {}", limit),
        None => debug!("Open file limit unchanged"),
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    let dialer: Arc<dyn Dialer> = if cli.direct {
        info!("Dialing destinations directly, no gateway");
        Arc::new(TcpDialer)
    } else {
        let gateway = gateway_config(&cli, config.gateway.take())?;
        let dialer = SshDialer::connect(&gateway)
            .await
            .with_context(|| format!("Failed to connect to {}:{}", gateway.host, gateway.port))?;
        Arc::new(dialer)
    };

    let bind = cli.bind.or(config.bind).unwrap_or(DEFAULT_BIND_ADDR);
    let manager = TunnelManager::with_bind_addr(dialer, bind);

    for spec in config.tunnels.iter().chain(cli.forwards.iter()) {
        match manager.create_tunnel(spec.local_port, spec.remote.as_str()).await {
            Ok(port) => println!("✓ Tunnel {} -> {} created", port, spec.remote),
            Err(e) => println!("✗ Error: {}", e),
        }
    }

    if cli.no_menu {
        println!("Press Ctrl+C to stop...");
        let _ = tokio::signal::ctrl_c().await;
    } else {
        let stdin = BufReader::new(ThreadedReader::stdin());
        tokio::select! {
            result = sshtun::menu::run(&manager, stdin, tokio::io::stdout()) => {
                if let Err(e) = result {
                    warn!("Menu stopped: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
            }
        }
    }

    println!("Shutting down...");
    manager.shutdown().await;
    println!("Bye!");

    Ok(())
}

/// Combine the config file's gateway with command line values; the command line wins
fn gateway_config(cli: &Cli, from_file: Option<GatewayConfig>) -> Result<GatewayConfig> {
    let addr = cli.gateway.as_ref();
    let user = cli
        .user
        .clone()
        .or_else(|| addr.and_then(|a| a.user.clone()));

    let mut gateway = match (from_file, addr) {
        (Some(mut gateway), addr) => {
            if let Some(addr) = addr {
                gateway.host = addr.host.clone();
                gateway.port = addr.port;
            }
            if let Some(user) = user {
                gateway.user = user;
            }
            gateway
        }
        (None, Some(addr)) => {
            let user = match user {
                Some(user) => user,
                None => prompt_line("SSH user:")?,
            };
            let auth = AuthConfig::Password {
                password: String::new(),
            };
            GatewayConfig::new(addr.host.clone(), addr.port, user, auth)
        }
        (None, None) => bail!("No gateway given; pass [user@]host[:port], --config or --direct"),
    };

    if let Some(path) = &cli.identity {
        gateway.auth = AuthConfig::Key {
            path: path.clone(),
            passphrase: std::env::var(PASSWORD_ENV).ok(),
        };
    } else if let AuthConfig::Password { password } = &mut gateway.auth {
        if password.is_empty() {
            *password = match std::env::var(PASSWORD_ENV) {
                Ok(password) => password,
                Err(_) => prompt_line("SSH password:")?,
            };
        }
    }

    Ok(gateway)
}

/// Read one line from stdin before the runtime's stdin is in use
fn prompt_line(label: &str) -> Result<String> {
    print!("{} ", label);
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}
