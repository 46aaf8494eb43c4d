//! Two [ConnectionManager]s of the fixture subnet (nodes 1 and 2) joined by an in-memory
//!  transport. Datagrams are handed to the other side in a task of their own, the way a real
//!  receive path decouples them from the sender.

use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use anyhow::bail;
use async_trait::async_trait;
use tracing::trace;

use crate::cm::cm_config::CmConfig;
use crate::cm::connection_manager::{ConnectionManager, WeakConnectionManager};
use crate::messaging::cm_messages::CmMad;
use crate::messaging::transport::{MadAddress, MadTransport};
use crate::test_util::fabric::{mad_address, static_resolver};


pub struct LoopbackTransport {
    node: u8,
    peer_node: u8,
    peer: OnceLock<WeakConnectionManager>,
    dropping: AtomicBool,
    sent: Mutex<Vec<&'static str>>,
}

impl Debug for LoopbackTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoopbackTransport{{{}->{}}}", self.node, self.peer_node)
    }
}

impl LoopbackTransport {
    fn new(node: u8, peer_node: u8) -> LoopbackTransport {
        LoopbackTransport {
            node,
            peer_node,
            peer: OnceLock::new(),
            dropping: AtomicBool::new(false),
            sent: Default::default(),
        }
    }

    /// Lose every datagram from now on. They are still recorded as sent.
    pub fn set_dropping(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::Release);
    }

    /// names of all messages sent so far, in order
    pub fn sent(&self) -> Vec<&'static str> {
        self.sent.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl MadTransport for LoopbackTransport {
    async fn send(&self, to: MadAddress, mad: &[u8]) -> anyhow::Result<()> {
        if to.remote_lid & 0xff != self.peer_node as u16 {
            bail!("no route to LID {}", to.remote_lid);
        }
        let name = CmMad::deser(mad)?.message.name();
        self.sent.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(name);

        if self.dropping.load(Ordering::Acquire) {
            trace!("dropping {}", name);
            return Ok(());
        }
        let Some(peer) = self.peer.get().and_then(|p| p.upgrade()) else {
            bail!("node {} is gone", self.peer_node);
        };
        let from = mad_address(self.peer_node, self.node as u16);
        let mad = mad.to_vec();
        tokio::spawn(async move {
            peer.receive(&mad, from).await;
        });
        Ok(())
    }
}

pub struct LoopbackNode {
    pub cm: ConnectionManager,
    pub transport: Arc<LoopbackTransport>,
}

/// nodes 1 and 2, connected to each other
pub fn loopback_pair(config: CmConfig) -> anyhow::Result<(LoopbackNode, LoopbackNode)> {
    let node = |id: u8, peer: u8| -> anyhow::Result<LoopbackNode> {
        let transport = Arc::new(LoopbackTransport::new(id, peer));
        let cm = ConnectionManager::new(config.clone(), transport.clone(), Arc::new(static_resolver(id)))?;
        Ok(LoopbackNode { cm, transport })
    };
    let a = node(1, 2)?;
    let b = node(2, 1)?;

    // the transports only hold weak references, so the pair is dropped with the nodes
    let _ = a.transport.peer.set(b.cm.downgrade());
    let _ = b.transport.peer.set(a.cm.downgrade());
    Ok((a, b))
}
