use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::Disconnect;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, GatewayConfig};
use crate::dialer::{split_host_port, BoxedStream, Dialer};
use crate::error::{DialError, SshError};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_MAX: usize = 3;

/// Dials destinations through an authenticated SSH session
pub struct SshDialer {
    handle: client::Handle<ClientHandler>,
    gateway: String,
}

impl SshDialer {
    /// Connect and authenticate to the gateway described by `config`
    pub async fn connect(config: &GatewayConfig) -> Result<Self, SshError> {
        let gateway = format!("{}:{}", config.host, config.port);
        info!("Connecting to SSH gateway {}", gateway);

        let socket_addr = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}: {}", gateway, e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", gateway)))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        };
        let handler = ClientHandler {
            gateway: gateway.clone(),
            pinned_fingerprint: config.host_key_fingerprint.clone(),
        };

        let mut handle = tokio::time::timeout(
            Duration::from_secs(config.connect_timeout_secs),
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connecting to {} timed out", gateway)))??;

        debug!("SSH handshake with {} completed", gateway);

        let authenticated = match &config.auth {
            AuthConfig::Password { password } => handle
                .authenticate_password(&config.user, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthConfig::Key { path, passphrase } => {
                let key = russh::keys::load_secret_key(path, passphrase.as_deref())?;
                let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&config.user, key)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(format!(
                "{} rejected credentials for {}",
                gateway, config.user
            )));
        }

        info!("Authenticated to {} as {}", gateway, config.user);
        Ok(Self { handle, gateway })
    }
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, destination: &str) -> Result<BoxedStream, DialError> {
        let (host, port) = split_host_port(destination)?;
        if self.handle.is_closed() {
            return Err(DialError::Closed);
        }

        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| DialError::Channel {
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Opened channel to {} via {}", destination, self.gateway);
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        if self.handle.is_closed() {
            return;
        }
        info!("Disconnecting from {}", self.gateway);
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            warn!("Failed to disconnect from {}: {}", self.gateway, e);
        }
    }
}

/// russh callbacks for the gateway session
pub struct ClientHandler {
    gateway: String,
    /// Expected "SHA256:..." fingerprint; any key is accepted when unset
    pinned_fingerprint: Option<String>,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();

        match &self.pinned_fingerprint {
            Some(expected) if *expected != fingerprint => {
                warn!(
                    "Host key for {} is {}, expected {}",
                    self.gateway, fingerprint, expected
                );
                Err(SshError::HostKeyRejected(format!(
                    "{} presented {}, expected {}",
                    self.gateway, fingerprint, expected
                )))
            }
            Some(_) => {
                info!("Host key verified for {}", self.gateway);
                Ok(true)
            }
            None => {
                warn!(
                    "Accepting unverified host key for {} ({})",
                    self.gateway, fingerprint
                );
                Ok(true)
            }
        }
    }
}
