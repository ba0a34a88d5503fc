use tokio::sync::broadcast;

/// The node's only coupling to a user interface.
///
/// `notify` receives every line exchanged on any connection. `origin` names
/// the remote party for lines read from the wire and is `None` for lines this
/// node produced. The lifecycle callbacks default to no-ops.
pub trait Observer: Send + Sync {
    fn notify(&self, line: &str, origin: Option<&str>);

    fn outgoing_connected(&self, _remote: &str) {}

    fn outgoing_disconnected(&self) {}

    /// The inbound peer set went from empty to non-empty.
    fn peers_active(&self) {}

    /// The inbound peer set became empty.
    fn peers_drained(&self) {}
}

/// Observer callbacks as values, for fan-out to any number of listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Activity {
        line: String,
        origin: Option<String>,
    },
    OutgoingConnected {
        remote: String,
    },
    OutgoingDisconnected,
    PeersActive,
    PeersDrained,
}

/// Publishes every callback on a broadcast channel. Events sent while nobody
/// is subscribed are dropped.
pub struct EventObserver {
    tx: broadcast::Sender<NodeEvent>,
}

impl EventObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.tx.subscribe()
    }

    fn publish(&self, event: NodeEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventObserver {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Observer for EventObserver {
    fn notify(&self, line: &str, origin: Option<&str>) {
        self.publish(NodeEvent::Activity {
            line: line.to_string(),
            origin: origin.map(str::to_string),
        });
    }

    fn outgoing_connected(&self, remote: &str) {
        self.publish(NodeEvent::OutgoingConnected {
            remote: remote.to_string(),
        });
    }

    fn outgoing_disconnected(&self) {
        self.publish(NodeEvent::OutgoingDisconnected);
    }

    fn peers_active(&self) {
        self.publish(NodeEvent::PeersActive);
    }

    fn peers_drained(&self) {
        self.publish(NodeEvent::PeersDrained);
    }
}
