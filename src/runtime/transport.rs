//! Transport boundary and in-process reference transports
//!
//! The core only needs to hand a command to a tier and to know which tiers
//! are reachable. Inbound traffic enters through an [`InboundHandle`].
//!
//! [`MemoryFabric`] models one broker per tier with a request topic (served
//! by the node running on that tier) and a reply topic (fanned out to every
//! client subscribed to that broker). [`RecordingTransport`] captures
//! outbound commands so tests can play the remote side by hand.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::command::Command;
use super::condition::Tier;
use super::error::{TransportError, TransportResult};
use super::event_loop::InboundHandle;

/// Outbound side of the messaging layer
pub trait Transport: Send + Sync {
    /// Publish `command` on the broker of `tier`
    fn send(&self, tier: Tier, command: &Command) -> TransportResult<()>;

    /// Whether `tier` is currently reachable
    fn is_connected(&self, tier: Tier) -> bool;
}

#[derive(Default)]
struct Broker {
    servers: Vec<InboundHandle>,
    clients: Vec<InboundHandle>,
}

/// In-memory set of per-tier brokers
#[derive(Default)]
pub struct MemoryFabric {
    brokers: Mutex<[Broker; 3]>,
}

impl MemoryFabric {
    /// Create an empty fabric
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Subscribe a node to the request topic of `tier`'s broker
    pub fn attach_server(&self, tier: Tier, inbound: InboundHandle) {
        self.brokers.lock()[tier.index()].servers.push(inbound);
    }

    /// Subscribe a node to the reply topic of `tier`'s broker
    pub fn attach_client(&self, tier: Tier, inbound: InboundHandle) {
        self.brokers.lock()[tier.index()].clients.push(inbound);
    }

    /// Transport publishing to the brokers of `links`
    pub fn transport(self: &Arc<Self>, links: &[Tier]) -> MemoryTransport {
        let mut connected = [false; 3];
        for tier in links {
            connected[tier.index()] = true;
        }
        MemoryTransport {
            fabric: self.clone(),
            connected,
        }
    }

    fn publish(&self, tier: Tier, command: &Command) -> TransportResult<()> {
        let brokers = self.brokers.lock();
        let broker = &brokers[tier.index()];
        let subscribers = if command.kind().is_request() {
            &broker.servers
        } else {
            &broker.clients
        };

        let mut delivered = 0;
        for inbound in subscribers {
            match inbound.deliver(tier, command.as_bytes()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!(tier = %tier, error = %e, "subscriber gone"),
            }
        }
        tracing::trace!(tier = %tier, kind = %command.kind(), delivered, "published");
        Ok(())
    }
}

/// One node's connection to a [`MemoryFabric`]
#[derive(Clone)]
pub struct MemoryTransport {
    fabric: Arc<MemoryFabric>,
    connected: [bool; 3],
}

impl Transport for MemoryTransport {
    fn send(&self, tier: Tier, command: &Command) -> TransportResult<()> {
        if !self.is_connected(tier) {
            return Err(TransportError::Unreachable(tier));
        }
        self.fabric.publish(tier, command)
    }

    fn is_connected(&self, tier: Tier) -> bool {
        self.connected[tier.index()]
    }
}

/// Transport that records every outbound command
pub struct RecordingTransport {
    connected: [bool; 3],
    sent: mpsc::UnboundedSender<(Tier, Command)>,
}

impl RecordingTransport {
    /// Create a recorder reaching `links`, plus the stream of sent commands
    pub fn new(links: &[Tier]) -> (Self, mpsc::UnboundedReceiver<(Tier, Command)>) {
        let mut connected = [false; 3];
        for tier in links {
            connected[tier.index()] = true;
        }
        let (sent, rx) = mpsc::unbounded_channel();
        (Self { connected, sent }, rx)
    }
}

impl Transport for RecordingTransport {
    fn send(&self, tier: Tier, command: &Command) -> TransportResult<()> {
        if !self.is_connected(tier) {
            return Err(TransportError::Unreachable(tier));
        }
        self.sent
            .send((tier, command.clone()))
            .map_err(|_| TransportError::Closed("recorder dropped".to_string()))
    }

    fn is_connected(&self, tier: Tier) -> bool {
        self.connected[tier.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::activity::ActivityId;
    use crate::runtime::command::CommandKind;
    use crate::runtime::event_loop::inbound_queue;

    fn command(kind: CommandKind) -> Command {
        Command::new(kind, "true", "f", ActivityId::new("7"), "dev", Vec::new()).unwrap()
    }

    #[tokio::test]
    async fn test_requests_reach_servers_and_replies_reach_clients() {
        let fabric = MemoryFabric::new();
        let (server, mut server_rx) = inbound_queue();
        let (client, mut client_rx) = inbound_queue();
        fabric.attach_server(Tier::Fog, server);
        fabric.attach_client(Tier::Fog, client);

        let transport = fabric.transport(&[Tier::Fog]);
        transport.send(Tier::Fog, &command(CommandKind::RexecAsy)).unwrap();
        transport.send(Tier::Fog, &command(CommandKind::RexecAck)).unwrap();

        let request = server_rx.recv().await.unwrap();
        assert_eq!(request.origin, Tier::Fog);
        assert_eq!(request.command.kind(), CommandKind::RexecAsy);

        let reply = client_rx.recv().await.unwrap();
        assert_eq!(reply.command.kind(), CommandKind::RexecAck);
    }

    #[test]
    fn test_unlinked_tier_is_unreachable() {
        let fabric = MemoryFabric::new();
        let transport = fabric.transport(&[Tier::Device]);
        assert!(!transport.is_connected(Tier::Cloud));
        assert!(matches!(
            transport.send(Tier::Cloud, &command(CommandKind::RexecAsy)),
            Err(TransportError::Unreachable(Tier::Cloud))
        ));
    }

    #[tokio::test]
    async fn test_recording_transport_captures() {
        let (transport, mut rx) = RecordingTransport::new(&[Tier::Fog]);
        transport.send(Tier::Fog, &command(CommandKind::RexecSyn)).unwrap();
        let (tier, sent) = rx.recv().await.unwrap();
        assert_eq!(tier, Tier::Fog);
        assert_eq!(sent.kind(), CommandKind::RexecSyn);
        assert!(transport.send(Tier::Device, &sent).is_err());
    }
}
