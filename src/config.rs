use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::dialer::split_host_port;

const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Contents of the optional config file. Never written back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address local listeners bind to
    pub bind: Option<IpAddr>,
    pub gateway: Option<GatewayConfig>,
    /// Tunnels opened at startup
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
}

impl Config {
    pub async fn from_file(path: &Path) -> Result<Config> {
        let s: String = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read the config {:?}", path))?;
        s.parse()
            .with_context(|| format!("Failed to parse the config {:?}", path))
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        for tunnel in &config.tunnels {
            split_host_port(&tunnel.remote)?;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub auth: AuthConfig,
    /// "SHA256:..." fingerprint the gateway's host key must match
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl GatewayConfig {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            auth,
            host_key_fingerprint: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    Password { password: String },
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::Password { .. } => f
                .debug_struct("Password")
                .field("password", &"<redacted>")
                .finish(),
            AuthConfig::Key { path, passphrase } => f
                .debug_struct("Key")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// A forwarding rule, written `LOCAL_PORT:HOST:PORT` on the command line
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote: String,
}

impl FromStr for TunnelSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (port, remote) = s
            .split_once(':')
            .ok_or_else(|| anyhow!("expected LOCAL_PORT:HOST:PORT, got {:?}", s))?;
        let local_port = port
            .parse()
            .with_context(|| format!("invalid local port {:?}", port))?;
        split_host_port(remote)?;

        Ok(TunnelSpec {
            local_port,
            remote: remote.to_string(),
        })
    }
}

/// Gateway address as given on the command line: `[user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayAddr {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
}

impl FromStr for GatewayAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (user, rest) = match s.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => bail!("empty user in {:?}", s),
            None => (None, s),
        };

        // Bare host, bare IPv6 address, or something with a port
        let (host, port) = if rest.starts_with('[') || rest.matches(':').count() == 1 {
            let (host, port) = split_host_port(rest)?;
            (host.to_string(), port)
        } else {
            (rest.to_string(), DEFAULT_SSH_PORT)
        };
        if host.is_empty() {
            bail!("missing host in {:?}", s);
        }

        Ok(GatewayAddr { user, host, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tunnel_spec() {
        let spec: TunnelSpec = "8080:db.internal:5432".parse().unwrap();
        assert_eq!(spec.local_port, 8080);
        assert_eq!(spec.remote, "db.internal:5432");

        let spec: TunnelSpec = "2222:[fd00::2]:22".parse().unwrap();
        assert_eq!(spec.remote, "[fd00::2]:22");

        assert!("8080".parse::<TunnelSpec>().is_err());
        assert!("http:db.internal:5432".parse::<TunnelSpec>().is_err());
        assert!("8080:db.internal".parse::<TunnelSpec>().is_err());
        assert!("99999:db.internal:5432".parse::<TunnelSpec>().is_err());
    }

    #[test]
    fn test_gateway_addr() {
        let addr: GatewayAddr = "deploy@bastion.example.com:2222".parse().unwrap();
        assert_eq!(addr.user.as_deref(), Some("deploy"));
        assert_eq!(addr.host, "bastion.example.com");
        assert_eq!(addr.port, 2222);

        let addr: GatewayAddr = "bastion.example.com".parse().unwrap();
        assert_eq!(addr.user, None);
        assert_eq!(addr.port, 22);

        let addr: GatewayAddr = "root@[fd00::1]:22".parse().unwrap();
        assert_eq!(addr.host, "fd00::1");

        let addr: GatewayAddr = "fd00::1".parse().unwrap();
        assert_eq!(addr.host, "fd00::1");
        assert_eq!(addr.port, 22);

        assert!("@bastion".parse::<GatewayAddr>().is_err());
        assert!("bastion:ssh".parse::<GatewayAddr>().is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let config: Config = Config::from_str(
            r#"
            bind = "0.0.0.0"

            [gateway]
            host = "bastion.example.com"
            user = "deploy"
            host_key_fingerprint = "SHA256:abc"

            [gateway.auth]
            type = "key"
            path = "/home/deploy/.ssh/id_ed25519"

            [[tunnels]]
            local_port = 8080
            remote = "db.internal:5432"

            [[tunnels]]
            local_port = 6379
            remote = "cache.internal:6379"
            "#,
        )
        .unwrap();

        assert_eq!(config.bind, Some("0.0.0.0".parse().unwrap()));
        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.port, 22);
        assert_eq!(gateway.connect_timeout_secs, 10);
        assert_eq!(gateway.host_key_fingerprint.as_deref(), Some("SHA256:abc"));
        assert_eq!(
            gateway.auth,
            AuthConfig::Key {
                path: "/home/deploy/.ssh/id_ed25519".into(),
                passphrase: None
            }
        );
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[1].remote, "cache.internal:6379");
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!("unknown = 1".parse::<Config>().is_err());
        assert!(Config::from_str(
            r#"
            [[tunnels]]
            local_port = 8080
            remote = "no-port"
            "#
        )
        .is_err());
    }

    #[test]
    fn test_password_is_redacted() {
        let auth = AuthConfig::Password {
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [gateway]
            host = "10.0.0.1"
            port = 2222
            user = "ops"
            auth = {{ type = "password", password = "secret" }}
            "#
        )
        .unwrap();

        let config = Config::from_file(file.path()).await.unwrap();
        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.port, 2222);
        assert!(matches!(gateway.auth, AuthConfig::Password { .. }));
        assert!(config.tunnels.is_empty());

        assert!(Config::from_file(Path::new("/nonexistent/sshtun.toml"))
            .await
            .is_err());
    }
}
