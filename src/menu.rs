use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::events::TunnelEvent;
use crate::manager::TunnelManager;

const SEPARATOR_WIDTH: usize = 40;

/// Run the menu until the user quits or `input` reaches EOF.
///
/// Tunnels are left running; tearing them down is up to the caller.
pub async fn run<R, W>(manager: &TunnelManager, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut events = manager.subscribe_errors();

    loop {
        print_events(&mut events, &mut output).await?;
        print_status(manager, &mut output).await?;

        output
            .write_all(
                b"\nChoose an action:\n\
                  1. Add tunnel\n\
                  2. Remove tunnel\n\
                  3. Restart tunnel\n\
                  4. Remove all tunnels\n\
                  5. Quit\n",
            )
            .await?;

        let choice = match prompt(&mut lines, &mut output, "Option:").await? {
            Some(choice) => choice,
            None => return Ok(()),
        };

        let keep_going = match choice.as_str() {
            "1" => add_tunnel(manager, &mut lines, &mut output).await?,
            "2" => remove_tunnel(manager, &mut lines, &mut output).await?,
            "3" => restart_tunnel(manager, &mut lines, &mut output).await?,
            "4" => {
                let stopped = manager.stop_all().await;
                success(&mut output, &format!("Removed {} tunnel(s)", stopped)).await?;
                true
            }
            "5" | "q" | "quit" | "exit" => false,
            "" => true,
            other => {
                failure(&mut output, &format!("Invalid option {:?}", other)).await?;
                true
            }
        };
        if !keep_going {
            return Ok(());
        }
    }
}

async fn add_tunnel<R, W>(manager: &TunnelManager, lines: &mut Lines<R>, output: &mut W) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let port = match prompt_port(lines, output, "Local port:").await? {
        Prompted::Value(port) => port,
        Prompted::Invalid => return Ok(true),
        Prompted::Eof => return Ok(false),
    };
    let remote = match prompt(lines, output, "Remote destination (host:port):").await? {
        Some(remote) => remote,
        None => return Ok(false),
    };

    match manager.create_tunnel(port, remote.as_str()).await {
        Ok(bound) => success(output, &format!("Tunnel {} -> {} created", bound, remote)).await?,
        Err(e) => failure(output, &e.to_string()).await?,
    }
    Ok(true)
}

async fn remove_tunnel<R, W>(
    manager: &TunnelManager,
    lines: &mut Lines<R>,
    output: &mut W,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let port = match prompt_port(lines, output, "Local port to remove:").await? {
        Prompted::Value(port) => port,
        Prompted::Invalid => return Ok(true),
        Prompted::Eof => return Ok(false),
    };

    match manager.stop_tunnel(port).await {
        Ok(()) => success(output, &format!("Tunnel {} removed", port)).await?,
        Err(e) => failure(output, &e.to_string()).await?,
    }
    Ok(true)
}

async fn restart_tunnel<R, W>(
    manager: &TunnelManager,
    lines: &mut Lines<R>,
    output: &mut W,
) -> Result<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let port = match prompt_port(lines, output, "Local port to restart:").await? {
        Prompted::Value(port) => port,
        Prompted::Invalid => return Ok(true),
        Prompted::Eof => return Ok(false),
    };

    match manager.restart_tunnel(port).await {
        Ok(_) => success(output, &format!("Tunnel {} restarted", port)).await?,
        Err(e) => failure(output, &e.to_string()).await?,
    }
    Ok(true)
}

enum Prompted<T> {
    Value(T),
    Invalid,
    Eof,
}

async fn prompt_port<R, W>(lines: &mut Lines<R>, output: &mut W, label: &str) -> Result<Prompted<u16>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let answer = match prompt(lines, output, label).await? {
        Some(answer) => answer,
        None => return Ok(Prompted::Eof),
    };
    match answer.parse::<u16>() {
        Ok(port) => Ok(Prompted::Value(port)),
        Err(_) => {
            failure(output, &format!("Invalid port {:?}", answer)).await?;
            Ok(Prompted::Invalid)
        }
    }
}

async fn prompt<R, W>(lines: &mut Lines<R>, output: &mut W, label: &str) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(format!("{} ", label).as_bytes()).await?;
    output.flush().await?;
    Ok(lines.next_line().await?.map(|line| line.trim().to_string()))
}

async fn success<W: AsyncWrite + Unpin>(output: &mut W, msg: &str) -> Result<()> {
    output.write_all(format!("✓ {}\n", msg).as_bytes()).await?;
    Ok(())
}

async fn failure<W: AsyncWrite + Unpin>(output: &mut W, msg: &str) -> Result<()> {
    output.write_all(format!("✗ Error: {}\n", msg).as_bytes()).await?;
    Ok(())
}

/// Show failures reported by background tasks since the last prompt
async fn print_events<W: AsyncWrite + Unpin>(
    events: &mut broadcast::Receiver<TunnelEvent>,
    output: &mut W,
) -> Result<()> {
    loop {
        match events.try_recv() {
            Ok(event) => failure(output, &event.to_string()).await?,
            Err(TryRecvError::Lagged(missed)) => {
                let note = format!("({} more failures not shown)\n", missed);
                output.write_all(note.as_bytes()).await?;
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
        }
    }
}

async fn print_status<W: AsyncWrite + Unpin>(manager: &TunnelManager, output: &mut W) -> Result<()> {
    let tunnels = manager.list_tunnels().await;

    let mut out = String::from("\nTunnels:\n");
    if tunnels.is_empty() {
        out.push_str("No active tunnels\n");
    }
    for tunnel in tunnels {
        out.push_str(&format!("Local port:  {}\n", tunnel.local_port));
        out.push_str(&format!("Remote:      {}\n", tunnel.remote));
        out.push_str(&format!("Status:      {}\n", tunnel.status));
        out.push_str(&format!("Uptime:      {}\n", format_uptime(tunnel.uptime)));
        out.push_str(&format!(
            "Connections: {} active, {} total\n",
            tunnel.stats.active_connections, tunnel.stats.total_connections
        ));
        out.push_str(&"-".repeat(SEPARATOR_WIDTH));
        out.push('\n');
    }

    output.write_all(out.as_bytes()).await?;
    Ok(())
}

/// Render a duration rounded to whole seconds, e.g. "1h2m3s"
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs() + u64::from(uptime.subsec_millis() >= 500);
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
