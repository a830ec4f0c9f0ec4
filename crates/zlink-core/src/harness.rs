//! Helpers for running two linked nodes in one process.
//!
//! Used by the integration tests and by local smoke runs: both nodes share a
//! [`LoopbackTransport`] pair, so severing and healing the link exercises
//! the reconnect and transfer-pause paths without a network.

use std::sync::Arc;

use zlink_security::{Ed25519Signer, Ed25519Verifier, PermissionLevel, Signer};
use zlink_transport::LoopbackTransport;

use crate::errors::CoreError;
use crate::node::{NodeConfig, PeerNode};
use crate::store::InMemoryStore;

/// Two started, connected nodes.
pub struct LinkedPair {
    pub a: Arc<PeerNode>,
    pub b: Arc<PeerNode>,
    pub store_a: Arc<InMemoryStore>,
    pub store_b: Arc<InMemoryStore>,
    pub transport_a: Arc<LoopbackTransport>,
    pub transport_b: Arc<LoopbackTransport>,
}

impl LinkedPair {
    /// Give each node `level` on the other side, trusted.
    pub async fn authorize_both(&self, level: PermissionLevel) -> Result<(), CoreError> {
        self.a.devices().preauthorize(&self.b.identity(), level, true).await?;
        self.b.devices().preauthorize(&self.a.identity(), level, true).await?;
        Ok(())
    }

    /// Cut the link in both directions until [`LinkedPair::heal`].
    pub fn sever(&self) {
        self.transport_a.sever();
    }

    pub fn heal(&self) {
        self.transport_a.heal();
    }

    pub async fn shutdown(&self) {
        self.a.shutdown().await;
        self.b.shutdown().await;
    }
}

/// Build, start and connect two nodes with fresh identities and stores.
pub async fn linked_pair(config_a: NodeConfig, config_b: NodeConfig) -> Result<LinkedPair, CoreError> {
    let (ta, tb) = LoopbackTransport::pair();
    let transport_a = Arc::new(ta);
    let transport_b = Arc::new(tb);
    let signer_a = Arc::new(Ed25519Signer::generate());
    let signer_b = Arc::new(Ed25519Signer::generate());
    let store_a = Arc::new(InMemoryStore::new());
    let store_b = Arc::new(InMemoryStore::new());

    let a = PeerNode::new(
        transport_a.clone(),
        signer_a.clone(),
        Arc::new(Ed25519Verifier),
        store_a.clone(),
        config_a,
    );
    let b = PeerNode::new(
        transport_b.clone(),
        signer_b.clone(),
        Arc::new(Ed25519Verifier),
        store_b.clone(),
        config_b,
    );
    a.start().await?;
    b.start().await?;

    a.connect(signer_b.identity()).await?;
    b.connect(signer_a.identity()).await?;

    Ok(LinkedPair {
        a,
        b,
        store_a,
        store_b,
        transport_a,
        transport_b,
    })
}
