//! Builds a running [`PeerNode`] from an [`AgentConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use tracing::{info, warn};

use zlink_core::sqlite_store::SqliteStore;
use zlink_core::{PeerNode, TransferRecord};
use zlink_security::{Ed25519Verifier, PermissionLevel, Signer};
use zlink_transport::{Backoff, TcpTransport, Transport};

use crate::config::AgentConfig;
use crate::handlers;
use crate::identity;

/// A started node plus what it needs to reach its peer.
pub struct Agent {
    pub node: Arc<PeerNode>,
    pub config: AgentConfig,
    /// Transfers found unfinished in the store at startup
    pub recovered: Vec<TransferRecord>,
}

impl Agent {
    /// Open storage, load the identity, start the node and install the
    /// built-in handlers and configured device grants.
    pub async fn start(config: AgentConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let node_config = config.node_config()?;

        let transport = build_transport(&config)?;

        let db_path = config.database_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        let store = SqliteStore::new(&db_path).with_context(|| format!("opening {}", db_path.display()))?;

        let (signer, created) = identity::load_or_create(&config.identity_path())?;
        if !created {
            info!(identity = %signer.identity(), "loaded identity");
        }

        let node = PeerNode::new(
            transport,
            Arc::new(signer),
            Arc::new(Ed25519Verifier),
            Arc::new(store),
            node_config,
        );
        let recovered = node.start().await?;
        handlers::register_builtin(&node).await;
        apply_grants(&node, &config).await?;

        Ok(Self { node, config, recovered })
    }

    /// Identity of the configured peer.
    pub fn peer_identity(&self) -> anyhow::Result<&str> {
        self.config
            .peer
            .identity
            .as_deref()
            .ok_or_else(|| anyhow!("peer.identity is not configured"))
    }

    /// Connect once.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let peer = self.peer_identity()?.to_string();
        self.node.connect(peer).await?;
        Ok(())
    }

    /// Keep trying to connect with the configured backoff until it works or
    /// the attempts run out. Once linked, reconnection is the node's job.
    pub async fn connect_with_backoff(&self) -> anyhow::Result<()> {
        let policy = self.config.node_config()?.connection.reconnection;
        let mut backoff = Backoff::new(policy);
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => match backoff.next_attempt() {
                    Some((attempt, delay)) => {
                        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "initial connect failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e.context(format!("gave up after {} attempts", backoff.attempts()))),
                },
            }
        }
    }

    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }
}

fn build_transport(config: &AgentConfig) -> anyhow::Result<Arc<dyn Transport>> {
    let timeout = Duration::from_millis(config.connection.connect_timeout_ms);
    let transport = match (&config.peer.address, &config.peer.listen) {
        (Some(address), _) => TcpTransport::dial(address.clone()),
        (None, Some(listen)) => TcpTransport::listen(listen.clone()),
        (None, None) => bail!("set peer.address or peer.listen (or ZLINK_PEER / ZLINK_LISTEN)"),
    };
    Ok(Arc::new(transport.with_timeout(timeout)))
}

/// Register configured admins and trusted devices ahead of first contact.
async fn apply_grants(node: &Arc<PeerNode>, config: &AgentConfig) -> anyhow::Result<()> {
    let security = &config.security;
    for identity in &security.admins {
        let trusted = security.trusted.contains(identity);
        node.devices().preauthorize(identity, PermissionLevel::Admin, trusted).await?;
    }
    for identity in security.trusted.iter().filter(|id| !security.admins.contains(id)) {
        let level = config.first_contact_level()?;
        node.devices().preauthorize(identity, level, true).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zlink_security::Ed25519Signer;

    fn config_in(dir: &std::path::Path) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.node.data_dir = Some(dir.to_path_buf());
        config.peer.identity = Some(Ed25519Signer::generate().identity());
        config.peer.address = Some("127.0.0.1:9".into());
        config
    }

    #[tokio::test]
    async fn test_start_requires_a_peer_address() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.peer.address = None;
        assert!(Agent::start(config).await.is_err());
    }

    #[tokio::test]
    async fn test_start_applies_device_grants() {
        let dir = tempfile::tempdir().unwrap();
        let admin = Ed25519Signer::generate().identity();
        let trusted = Ed25519Signer::generate().identity();
        let mut config = config_in(dir.path());
        config.security.admins = vec![admin.clone()];
        config.security.trusted = vec![admin.clone(), trusted.clone()];

        let agent = Agent::start(config).await.unwrap();
        assert!(dir.path().join("identity.key").is_file());
        assert!(dir.path().join("zlink.db").is_file());

        let record = agent.node.devices().get(&admin).await.unwrap();
        assert_eq!(record.permission_level, PermissionLevel::Admin);
        assert!(record.trusted);

        let record = agent.node.devices().get(&trusted).await.unwrap();
        assert_eq!(record.permission_level, PermissionLevel::Authenticated);
        assert!(record.trusted);

        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = Agent::start(config_in(dir.path())).await.unwrap();
        let identity = first.node.identity();
        first.shutdown().await;
        drop(first);

        let second = Agent::start(config_in(dir.path())).await.unwrap();
        assert_eq!(second.node.identity(), identity);
        second.shutdown().await;
    }
}
