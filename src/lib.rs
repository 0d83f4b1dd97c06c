// Many local port forwards over one SSH session.
// Tunnels can be added, removed and restarted without logging in again.

pub mod config;
mod dialer;
mod error;
mod events;
mod input;
mod listener;
mod manager;
pub mod menu;
mod relay;
mod ssh;
mod tunnel;

#[cfg(test)]
mod test_support;

pub use dialer::{split_host_port, BoxedStream, Dialer, Stream, TcpDialer};
pub use error::{DialError, SshError, TunnelError};
pub use events::{EventSink, TunnelEvent};
pub use input::ThreadedReader;
pub use listener::{Binder, Listener, TcpBinder};
pub use manager::{TunnelManager, DEFAULT_BIND_ADDR};
pub use relay::{relay, RelayOutcome, Transfer};
pub use ssh::SshDialer;
pub use tunnel::{StatsSnapshot, TunnelInfo, TunnelStatus};
