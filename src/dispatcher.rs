//! Request dispatcher and broadcast fan-out
//!
//! All connection lifecycle events and inbound text frames funnel through
//! one mpsc channel into a single dispatch loop: a message is fully
//! classified, dispatched against storage and (on success) broadcast before
//! the next one is taken, from any connection. That serialization is what
//! keeps registry mutation and storage calls free of interleaving hazards.
//!
//! Routing rules:
//! - renames produce no reply and no broadcast;
//! - a full-data request is answered to the sender only;
//! - successful insert/update/delete is broadcast to every connection,
//!   including the sender, so all clients converge on the server-confirmed
//!   state;
//! - any failure is answered with exactly one error envelope to the sender
//!   and is never broadcast.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{ debug, error, info, warn };

use crate::errors::{ Error, Result };
use crate::protocol::{ classify, ChangeNotification, ClientRequest, ErrorEnvelope, OutboundEvent };
use crate::registry::{ ConnectionId, ConnectionRegistry, OutboundSink };
use crate::storage::Storage;

/// Placeholder echoed as the original message when the connect-time
/// snapshot fails (there is no client message to echo yet)
const ON_CONNECT_MSG: &str = "none (on connection)";

/// One event delivered by the transport layer.
///
/// The sender is always identified by the explicit id assigned at accept
/// time; the dispatcher never inspects the event source.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A transport connection was accepted
    Connected {
        /// Identifier assigned by the transport
        id: ConnectionId,
        /// Sink for frames addressed to this connection
        sink: OutboundSink,
    },
    /// A transport connection went away
    Disconnected {
        /// Identifier of the closed connection
        id: ConnectionId,
    },
    /// A text frame arrived on a connection
    Message {
        /// Identifier of the sending connection
        id: ConnectionId,
        /// Raw frame text
        text: String,
    },
}

/// The protocol state machine: classifies, executes and routes replies
pub struct Dispatcher {
    registry: ConnectionRegistry,
    storage: Arc<dyn Storage>,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry and storage collaborator
    pub fn new(registry: ConnectionRegistry, storage: Arc<dyn Storage>) -> Self {
        Self { registry, storage }
    }

    /// Consume events until the channel closes.
    ///
    /// This is the single logical thread of message handling; run it in
    /// exactly one task.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("event channel closed, dispatch loop ending");
    }

    /// Handle one event to completion
    pub async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { id, sink } => {
                self.registry.register(id, sink);
                info!(%id, clients = self.registry.len(), "connection opened");
                // New clients initialize from a full snapshot
                self.send_all_entries(id, ON_CONNECT_MSG).await;
            }
            ConnectionEvent::Disconnected { id } => {
                self.registry.unregister(id);
                info!(%id, clients = self.registry.len(), "connection closed");
            }
            ConnectionEvent::Message { id, text } => {
                if let Err(e) = self.dispatch_message(id, &text).await {
                    // No confirmed sender, so no reply is possible
                    error!("dropping message: {}", e);
                }
            }
        }
    }

    async fn dispatch_message(&self, id: ConnectionId, text: &str) -> Result<()> {
        if !self.registry.contains(id) {
            return Err(Error::UnknownConnection(id));
        }

        match classify(text) {
            ClientRequest::UserName(name) => {
                debug!(%id, %name, "rename");
                self.registry.rename(id, &name);
            }
            ClientRequest::AllData => {
                self.send_all_entries(id, text).await;
            }
            ClientRequest::Insert { description, number } => {
                match self.storage.insert_entry(&description, number).await {
                    Ok(entry) if entry.is_persisted() => {
                        self.broadcast(&OutboundEvent::Change(ChangeNotification::Insert {
                            entry,
                        }));
                    }
                    Ok(_) => self.report_error(id, text, ""),
                    Err(e) => self.report_error(id, text, &e.to_string()),
                }
            }
            ClientRequest::Update { id: entry_id, description, number } => {
                match self.storage.update_entry(entry_id, &description, number).await {
                    Ok(entry) if entry.is_persisted() => {
                        self.broadcast(&OutboundEvent::Change(ChangeNotification::Update {
                            entry,
                        }));
                    }
                    Ok(_) => self.report_error(id, text, ""),
                    Err(e) => self.report_error(id, text, &e.to_string()),
                }
            }
            ClientRequest::Delete(entry_id) => {
                match self.storage.delete_entry(entry_id).await {
                    Ok(true) => {
                        self.broadcast(&OutboundEvent::Change(ChangeNotification::Delete {
                            id: entry_id,
                        }));
                    }
                    Ok(false) => self.report_error(id, text, ""),
                    Err(e) => self.report_error(id, text, &e.to_string()),
                }
            }
            ClientRequest::Invalid => {
                warn!(%id, "invalid input data");
                self.report_error(id, text, "Invalid input data");
            }
        }
        Ok(())
    }

    /// Reply to one connection with the full record set
    async fn send_all_entries(&self, id: ConnectionId, original_msg: &str) {
        match self.storage.get_entries().await {
            Ok(entries) => self.send_to(id, &OutboundEvent::Snapshot(entries)),
            Err(e) => self.report_error(id, original_msg, &e.to_string()),
        }
    }

    /// Serialize once and send the identical frame to every registered
    /// connection. A dead sink is skipped; it never blocks the rest.
    fn broadcast(&self, event: &OutboundEvent) {
        let text = match event.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize broadcast: {}", e);
                return;
            }
        };
        for (id, sink) in self.registry.snapshot() {
            if sink.send(text.clone()).is_err() {
                debug!(%id, "skipping closed connection during broadcast");
            }
        }
    }

    /// Best-effort error envelope to the originating connection only
    fn report_error(&self, id: ConnectionId, original_msg: &str, error_msg: &str) {
        let event = OutboundEvent::Error(ErrorEnvelope {
            original_msg: original_msg.to_string(),
            error_msg: error_msg.to_string(),
        });
        self.send_to(id, &event);
    }

    fn send_to(&self, id: ConnectionId, event: &OutboundEvent) {
        let Some(sink) = self.registry.sink(id) else {
            warn!(%id, "reply target no longer connected");
            return;
        };
        match event.to_text() {
            Ok(text) => {
                let _ = sink.send(text);
            }
            Err(e) => error!(%id, "failed to serialize reply: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Record;
    use crate::registry::DEFAULT_NAME;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use serde_json::{ json, Value };
    use tokio::sync::mpsc::UnboundedReceiver;

    /// Storage that answers every mutation with the zero-id sentinel and
    /// no error, the ambiguous dual-signal case.
    struct ZeroIdStorage;

    #[async_trait]
    impl Storage for ZeroIdStorage {
        async fn get_entries(&self) -> Result<Vec<Record>> {
            Ok(Vec::new())
        }

        async fn insert_entry(&self, description: &str, number: i64) -> Result<Record> {
            Ok(Record { id: 0, description: description.to_string(), number })
        }

        async fn update_entry(&self, _id: i64, description: &str, number: i64) -> Result<Record> {
            Ok(Record { id: 0, description: description.to_string(), number })
        }

        async fn delete_entry(&self, _id: i64) -> Result<bool> {
            Ok(false)
        }
    }

    /// Storage where every call fails outright.
    struct BrokenStorage;

    #[async_trait]
    impl Storage for BrokenStorage {
        async fn get_entries(&self) -> Result<Vec<Record>> {
            Err(Error::Storage("database unavailable".to_string()))
        }

        async fn insert_entry(&self, _description: &str, _number: i64) -> Result<Record> {
            Err(Error::Storage("database unavailable".to_string()))
        }

        async fn update_entry(&self, _id: i64, _d: &str, _n: i64) -> Result<Record> {
            Err(Error::Storage("database unavailable".to_string()))
        }

        async fn delete_entry(&self, _id: i64) -> Result<bool> {
            Err(Error::Storage("database unavailable".to_string()))
        }
    }

    fn dispatcher_with(storage: Arc<dyn Storage>) -> (Dispatcher, ConnectionRegistry) {
        let registry = ConnectionRegistry::new();
        (Dispatcher::new(registry.clone(), storage), registry)
    }

    /// Connect a client and drain the snapshot it receives on connect.
    async fn connect(dispatcher: &Dispatcher) -> (ConnectionId, UnboundedReceiver<String>) {
        let id = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.handle_event(ConnectionEvent::Connected { id, sink: tx }).await;
        rx.recv().await.unwrap();
        (id, rx)
    }

    async fn send(dispatcher: &Dispatcher, id: ConnectionId, text: &str) {
        dispatcher
            .handle_event(ConnectionEvent::Message { id, text: text.to_string() })
            .await;
    }

    fn next_json(rx: &mut UnboundedReceiver<String>) -> Value {
        let text = rx.try_recv().expect("expected an outgoing frame");
        serde_json::from_str(&text).unwrap()
    }

    fn assert_silent(rx: &mut UnboundedReceiver<String>) {
        assert!(rx.try_recv().is_err(), "expected no outgoing frame");
    }

    #[tokio::test]
    async fn connect_delivers_initial_snapshot() {
        let storage = Arc::new(MemoryStorage::with_entries(vec![Record {
            id: 5,
            description: "milk".to_string(),
            number: 2,
        }]));
        let (dispatcher, _registry) = dispatcher_with(storage);

        let id = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.handle_event(ConnectionEvent::Connected { id, sink: tx }).await;

        assert_eq!(
            next_json(&mut rx),
            json!([{"id":5,"description":"milk","number":2}])
        );
        assert_silent(&mut rx);
    }

    #[tokio::test]
    async fn connect_snapshot_failure_yields_error_envelope() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(BrokenStorage));

        let id = ConnectionId::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.handle_event(ConnectionEvent::Connected { id, sink: tx }).await;

        let reply = next_json(&mut rx);
        assert_eq!(reply["originalMsg"], "none (on connection)");
        assert!(reply["errorMsg"].as_str().unwrap().contains("database unavailable"));
    }

    #[tokio::test]
    async fn rename_changes_name_and_sends_nothing() {
        let (dispatcher, registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (bob, mut bob_rx) = connect(&dispatcher).await;

        send(&dispatcher, alice, r#"{"userName":"Alice"}"#).await;

        assert_eq!(registry.name(alice), Some("Alice".to_string()));
        assert_eq!(registry.name(bob), Some(DEFAULT_NAME.to_string()));
        assert_silent(&mut alice_rx);
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn get_data_replies_to_sender_only() {
        let storage = Arc::new(MemoryStorage::new());
        let (dispatcher, _registry) = dispatcher_with(storage.clone());
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        storage.insert_entry("milk", 2).await.unwrap();
        send(&dispatcher, alice, r#"{"rqtType":"getData","rqtData":null}"#).await;

        assert_eq!(
            next_json(&mut alice_rx),
            json!([{"id":1,"description":"milk","number":2}])
        );
        assert_silent(&mut alice_rx);
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn successful_insert_broadcasts_to_everyone_including_sender() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        send(
            &dispatcher,
            alice,
            r#"{"rqtType":"insert","rqtData":{"description":"milk","number":2}}"#,
        )
        .await;

        let expected = json!({"type":"insert","entry":{"id":1,"description":"milk","number":2}});
        assert_eq!(next_json(&mut alice_rx), expected);
        assert_eq!(next_json(&mut bob_rx), expected);
        assert_silent(&mut alice_rx);
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn zero_id_insert_fails_without_broadcast() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(ZeroIdStorage));
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        let original = r#"{"rqtType":"insert","rqtData":{"description":"milk","number":2}}"#;
        send(&dispatcher, alice, original).await;

        // One envelope to the requester, zero broadcasts; the storage
        // reported no message so the envelope carries an empty one.
        assert_eq!(
            next_json(&mut alice_rx),
            json!({"originalMsg": original, "errorMsg": ""})
        );
        assert_silent(&mut alice_rx);
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn storage_error_reaches_requester_only() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(BrokenStorage));
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        // drain the failed connect-time snapshots
        while alice_rx.try_recv().is_ok() {}
        while bob_rx.try_recv().is_ok() {}

        let original = r#"{"rqtType":"insert","rqtData":{"description":"milk","number":2}}"#;
        send(&dispatcher, alice, original).await;

        let reply = next_json(&mut alice_rx);
        assert_eq!(reply["originalMsg"], original);
        assert!(reply["errorMsg"].as_str().unwrap().contains("database unavailable"));
        assert_silent(&mut alice_rx);
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn successful_update_broadcasts_new_state() {
        let storage = Arc::new(MemoryStorage::new());
        let (dispatcher, _registry) = dispatcher_with(storage.clone());
        let (alice, mut alice_rx) = connect(&dispatcher).await;

        storage.insert_entry("milk", 2).await.unwrap();
        send(
            &dispatcher,
            alice,
            r#"{"rqtType":"update","rqtData":{"id":1,"description":"oat milk","number":3}}"#,
        )
        .await;

        assert_eq!(
            next_json(&mut alice_rx),
            json!({"type":"update","entry":{"id":1,"description":"oat milk","number":3}})
        );
    }

    #[tokio::test]
    async fn confirmed_delete_broadcasts_the_id() {
        let storage = Arc::new(MemoryStorage::with_entries(vec![Record {
            id: 7,
            description: "milk".to_string(),
            number: 2,
        }]));
        let (dispatcher, _registry) = dispatcher_with(storage);
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        send(&dispatcher, alice, r#"{"rqtType":"delete","rqtData":7}"#).await;

        let expected = json!({"type":"delete","id":7});
        assert_eq!(next_json(&mut alice_rx), expected);
        assert_eq!(next_json(&mut bob_rx), expected);
    }

    #[tokio::test]
    async fn unmatched_delete_yields_error_envelope() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (alice, mut alice_rx) = connect(&dispatcher).await;

        send(&dispatcher, alice, r#"{"rqtType":"delete","rqtData":7}"#).await;

        let reply = next_json(&mut alice_rx);
        assert_eq!(reply["originalMsg"], r#"{"rqtType":"delete","rqtData":7}"#);
        assert_silent(&mut alice_rx);
    }

    #[tokio::test]
    async fn invalid_input_is_answered_with_fixed_reason() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        send(&dispatcher, alice, "this is not json").await;

        assert_eq!(
            next_json(&mut alice_rx),
            json!({"originalMsg":"this is not json","errorMsg":"Invalid input data"})
        );
        assert_silent(&mut alice_rx);
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn disconnected_client_misses_subsequent_broadcasts() {
        let (dispatcher, registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (alice, mut alice_rx) = connect(&dispatcher).await;
        let (bob, mut bob_rx) = connect(&dispatcher).await;

        dispatcher.handle_event(ConnectionEvent::Disconnected { id: bob }).await;
        assert_eq!(registry.len(), 1);
        // a second disconnect of the same id is a no-op
        dispatcher.handle_event(ConnectionEvent::Disconnected { id: bob }).await;
        assert_eq!(registry.len(), 1);

        send(
            &dispatcher,
            alice,
            r#"{"rqtType":"insert","rqtData":{"description":"milk","number":2}}"#,
        )
        .await;

        assert_eq!(
            next_json(&mut alice_rx),
            json!({"type":"insert","entry":{"id":1,"description":"milk","number":2}})
        );
        assert_silent(&mut bob_rx);
    }

    #[tokio::test]
    async fn message_from_unknown_connection_is_dropped() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (_alice, mut alice_rx) = connect(&dispatcher).await;

        let ghost = ConnectionId::new();
        send(&dispatcher, ghost, r#"{"rqtType":"getData","rqtData":null}"#).await;

        assert_silent(&mut alice_rx);
    }

    #[tokio::test]
    async fn dead_sink_never_blocks_the_rest_of_a_broadcast() {
        let (dispatcher, _registry) = dispatcher_with(Arc::new(MemoryStorage::new()));
        let (alice, alice_rx) = connect(&dispatcher).await;
        let (_bob, mut bob_rx) = connect(&dispatcher).await;

        // Alice's writer task died but her registry entry is still there
        drop(alice_rx);
        send(
            &dispatcher,
            alice,
            r#"{"rqtType":"insert","rqtData":{"description":"milk","number":2}}"#,
        )
        .await;

        assert_eq!(
            next_json(&mut bob_rx),
            json!({"type":"insert","entry":{"id":1,"description":"milk","number":2}})
        );
    }
}
