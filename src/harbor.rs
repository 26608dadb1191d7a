//! Inter-node forwarding hook.
//!
//! The core does not speak to other nodes itself: a message whose
//! destination's high byte names a different harbor is wrapped in a
//! [`RemoteMessage`] envelope and pushed to the registered forwarder
//! service, which owns the actual transport.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    context::ServiceContext,
    handle::{Handle, HANDLE_MASK, HANDLE_REMOTE_SHIFT},
    message::{Message, MessageKind, Payload},
    node::Node,
};

/// Remote names are fixed-width on the inter-node wire.
pub const GLOBALNAME_LENGTH: usize = 16;

/// Destination of a remote message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    Handle(Handle),
    /// Global name, truncated to [`GLOBALNAME_LENGTH`] bytes.
    Name(Box<str>),
}

impl RemoteTarget {
    pub fn name(name: &str) -> Self {
        let end = name
            .char_indices()
            .map(|(i, c)| i + c.len_utf8())
            .take_while(|end| *end <= GLOBALNAME_LENGTH)
            .last()
            .unwrap_or(0);
        RemoteTarget::Name(name[..end].into())
    }
}

/// Envelope handed to the forwarder service. The original message kind and
/// session ride on the enclosing [`Message`].
#[derive(Debug)]
pub struct RemoteMessage {
    pub destination: RemoteTarget,
    pub payload: Box<[u8]>,
}

/// Per-node forwarding state.
pub struct Harbor {
    /// Local harbor id shifted into the high byte.
    harbor: Handle,
    remote: Mutex<Option<Arc<ServiceContext>>>,
}

impl Harbor {
    pub fn new(harbor: u32) -> Self {
        Self {
            harbor: (harbor & 0xFF) << HANDLE_REMOTE_SHIFT,
            remote: Mutex::new(None),
        }
    }

    /// A handle is remote when its harbor byte is non-zero and differs
    /// from ours.
    pub fn is_remote(&self, handle: Handle) -> bool {
        let h = handle & !HANDLE_MASK;
        h != self.harbor && h != 0
    }

    /// Register the forwarder service. The context is reserved: it stays
    /// alive past retirement and stops counting against shutdown.
    pub fn start(&self, node: &Node, ctx: &Arc<ServiceContext>) {
        node.context_reserve();
        *self.remote.lock() = Some(ctx.clone());
    }

    /// Hand an envelope to the forwarder. `System` and `Harbor` kinds are
    /// runtime-internal and never cross nodes.
    pub fn send(
        &self,
        node: &Node,
        remote: RemoteMessage,
        kind: MessageKind,
        source: Handle,
        session: i32,
    ) {
        debug_assert!(kind != MessageKind::System && kind != MessageKind::Harbor);
        let Some(ctx) = self.remote.lock().clone() else {
            log::error!(target: "warren::harbor", "remote message dropped: no forwarder registered");
            return;
        };
        ctx.push_message(
            node,
            Message {
                source,
                session,
                kind,
                payload: Payload::Remote(Box::new(remote)),
            },
        );
    }

    /// Drop the forwarder reference on shutdown.
    pub fn exit(&self) {
        *self.remote.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SendFlags;
    use crate::test_support::{spawn_collector, spawn_null_service, test_node};

    #[test]
    fn remote_sends_reach_the_forwarder() {
        let node = test_node();
        let (forwarder, received) = spawn_collector(&node);
        node.harbor().start(&node, &forwarder);

        let sender = spawn_null_service(&node);
        let remote = 0x0200_0001; // harbor 2, we are harbor 1
        let session = sender
            .send(
                0,
                remote,
                MessageKind::Client,
                SendFlags::ALLOC_SESSION,
                0,
                Payload::from(b"over the wire".to_vec()),
            )
            .unwrap();
        assert_eq!(session, 1);

        // the collector records the envelope's kind and source
        crate::test_support::drain(&forwarder);
        let got = received.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, sender.handle());
        assert_eq!(got[0].1, MessageKind::Client);

        node.harbor().exit();
    }

    #[test]
    fn remote_detection() {
        let harbor = Harbor::new(2);
        assert!(!harbor.is_remote(0x0200_0001)); // ours
        assert!(!harbor.is_remote(0x0000_0001)); // harbor 0 is local shorthand
        assert!(harbor.is_remote(0x0100_0001));
        assert!(harbor.is_remote(0xFF00_0001));
    }

    #[test]
    fn global_names_are_truncated() {
        assert_eq!(
            RemoteTarget::name("exactly-16-chars"),
            RemoteTarget::Name("exactly-16-chars".into())
        );
        assert_eq!(
            RemoteTarget::name("name-that-is-way-too-long"),
            RemoteTarget::Name("name-that-is-way".into())
        );
    }
}
