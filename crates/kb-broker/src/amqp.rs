//! `AmqpBroker`: the routing scheme laid out in spec §4.5 on top of
//! [`kb_net::HashClient`].
//!
//! ```text
//! signal emit : exchange = "<domain>.signals",      routing_key = "<signalInstanceId>.<signalFunction>"
//! 1:1 call    : exchange = "<domain>.slots",         routing_key = "<slotInstanceId>" (must not contain '|')
//! broadcast   : exchange = "<domain>.global_slots",  routing_key = "" (or "<instanceId>.slotHeartbeat" for heartbeats)
//! ```
//!
//! The slot to invoke is never encoded in the routing key for 1:1/broadcast
//! traffic — only the header's `slotFunctions` field says that (spec §3);
//! the routing key only gets the message to the right queue. Broadcast
//! messages are withheld until `start_reading` unless
//! `set_consume_broadcasts(false)` opted out first; `slotHeartbeat`
//! broadcasts are withheld further, until `start_reading_heartbeats`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use kb_common::envelope::{keys, split_slot_functions, BROADCAST_MARKER};
use kb_common::{ErrorCode, Hash, KaraboError, Result};
use kb_net::{Connection, HashClient};
use kb_serial::BinaryV1Serializer;

use crate::{Broker, ErrorNotifier, MessageHandler};

const HEARTBEAT_SLOT: &str = "slotHeartbeat";

pub struct AmqpBroker {
    urls: Vec<String>,
    domain: String,
    instance_id: String,
    connection: Arc<Connection>,
    client: Arc<HashClient<BinaryV1Serializer>>,
    /// A separate `HashClient` bound to its own `<domain>.<instanceId>:beats`
    /// queue, so heartbeat traffic never competes with the instance's own
    /// slot/signal queue for the `x-max-length`/drop-head overflow budget
    /// (spec §4.5).
    beats_client: Arc<HashClient<BinaryV1Serializer>>,
    read_handler: Mutex<Option<MessageHandler>>,
    error_notifier: Mutex<Option<ErrorNotifier>>,
    /// routing key ("<signalInstanceId>.<signalFunction>") -> local slot
    /// names subscribed to it. Several slots may share one subscription.
    slots_for_signals: Mutex<HashMap<String, HashSet<String>>>,
    consume_broadcasts: AtomicBool,
    reading_started: AtomicBool,
    confirm_publishes: bool,
    self_weak: Mutex<Weak<AmqpBroker>>,
}

impl AmqpBroker {
    pub fn new(urls: Vec<String>, domain: &str, instance_id: &str) -> Arc<Self> {
        Self::new_with_confirm(urls, domain, instance_id, true)
    }

    /// As [`AmqpBroker::new`], but `confirm = false` skips waiting on
    /// publisher-confirm acknowledgments for every publish — the legacy
    /// JMS-equivalent fire-and-forget semantics `kb_broker::JmsBroker`
    /// asks for (spec §9).
    pub(crate) fn new_with_confirm(urls: Vec<String>, domain: &str, instance_id: &str, confirm: bool) -> Arc<Self> {
        let connection = Connection::new(urls.clone());
        let client = HashClient::new(connection.clone(), instance_id, BinaryV1Serializer::new());
        let beats_client =
            HashClient::new(connection.clone(), &format!("{domain}.{instance_id}:beats"), BinaryV1Serializer::new());
        let broker = Arc::new(Self {
            urls,
            domain: domain.to_string(),
            instance_id: instance_id.to_string(),
            connection,
            client,
            beats_client,
            read_handler: Mutex::new(None),
            error_notifier: Mutex::new(None),
            slots_for_signals: Mutex::new(HashMap::new()),
            consume_broadcasts: AtomicBool::new(true),
            reading_started: AtomicBool::new(false),
            confirm_publishes: confirm,
            self_weak: Mutex::new(Weak::new()),
        });
        *broker.self_weak.lock() = Arc::downgrade(&broker);
        broker
    }

    /// Whether `publish`/`publish_with_confirm` should wait for the
    /// broker's publisher-confirm acknowledgment.
    pub(crate) fn wants_confirm(&self) -> bool {
        self.confirm_publishes
    }

    fn self_arc(&self) -> Arc<AmqpBroker> {
        self.self_weak.lock().upgrade().expect("broker outlives its own handlers")
    }

    fn signal_exchange(&self) -> String {
        format!("{}.signals", self.domain)
    }

    fn slot_exchange(&self) -> String {
        format!("{}.slots", self.domain)
    }

    fn global_slot_exchange(&self) -> String {
        format!("{}.global_slots", self.domain)
    }

    fn gui_debug_exchange(&self) -> String {
        format!("{}.karaboGuiDebug", self.domain)
    }

    fn dispatch(&self, slot: &str, header: Hash, body: Hash) {
        if let Some(handler) = self.read_handler.lock().clone() {
            handler(slot.to_string(), header, body);
        }
    }

    /// Dispatch a 1-to-1 or broadcast delivery: per spec §3, the slot(s) to
    /// invoke come from the header's `slotFunctions` field
    /// (`|id1:slotA||id2:slotB|`, or `|*:slotName|` for a broadcast target),
    /// filtered to entries addressed to `for_instance_id` (literally, or via
    /// the `*` broadcast marker) — never from the routing key, which only
    /// routed the message to the right queue.
    fn dispatch_addressed(&self, for_instance_id: &str, header: Hash, body: Hash) {
        let Some(slot_functions) = header.get_str(keys::SLOT_FUNCTIONS) else {
            warn!("delivery has no slotFunctions header, nothing to dispatch");
            return;
        };
        let slots: Vec<String> = split_slot_functions(slot_functions)
            .into_iter()
            .filter(|(id, _)| *id == for_instance_id || *id == BROADCAST_MARKER)
            .map(|(_, slot)| slot.to_string())
            .collect();
        for slot in slots {
            self.dispatch(&slot, header.clone(), body.clone());
        }
    }

    fn notify_error(&self, message: impl Into<String>) {
        if let Some(notifier) = self.error_notifier.lock().clone() {
            notifier(message.into());
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<()> {
        self.connection.connect().await?;
        self.client.raw().ensure_channel().await
    }

    async fn disconnect(&self) {
        self.client.raw().unsubscribe_all().await.ok();
        self.beats_client.raw().unsubscribe_all().await.ok();
        self.connection.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn broker_url(&self) -> String {
        self.urls.join(",")
    }

    fn broker_type(&self) -> &'static str {
        "amqp"
    }

    async fn subscribe_to_remote_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()> {
        let routing_key = format!("{signal_instance_id}.{signal_function}");
        let is_new = {
            let mut map = self.slots_for_signals.lock();
            let entry = map.entry(routing_key.clone()).or_default();
            let was_empty = entry.is_empty();
            entry.insert(slot.to_string());
            was_empty
        };
        if !is_new {
            return Ok(());
        }
        let this_handler = self.self_arc_signal_handler();
        let exchange = self.signal_exchange();
        self.client.subscribe(&exchange, &routing_key, this_handler).await
    }

    async fn unsubscribe_from_remote_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()> {
        let routing_key = format!("{signal_instance_id}.{signal_function}");
        let now_empty = {
            let mut map = self.slots_for_signals.lock();
            if let Some(set) = map.get_mut(&routing_key) {
                set.remove(slot);
                if set.is_empty() {
                    map.remove(&routing_key);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if now_empty {
            let exchange = self.signal_exchange();
            self.client.unsubscribe(&exchange, &routing_key).await?;
        }
        Ok(())
    }

    async fn start_reading(&self, handler: MessageHandler, error_notifier: Option<ErrorNotifier>) -> Result<()> {
        *self.read_handler.lock() = Some(handler);
        *self.error_notifier.lock() = error_notifier;
        self.reading_started.store(true, Ordering::SeqCst);

        let one_to_one_handler = self.self_arc_addressed_handler();
        if let Err(err) = self.client.subscribe(&self.slot_exchange(), &self.instance_id, one_to_one_handler).await {
            self.notify_error(format!("failed to subscribe to 1-to-1 slots: {err}"));
            return Err(err);
        }

        if self.consume_broadcasts.load(Ordering::SeqCst) {
            let broadcast_handler = self.self_arc_addressed_handler();
            if let Err(err) = self.client.subscribe(&self.global_slot_exchange(), "", broadcast_handler).await {
                self.notify_error(format!("failed to subscribe to broadcast slots: {err}"));
                return Err(err);
            }
        }
        Ok(())
    }

    async fn stop_reading(&self) {
        self.reading_started.store(false, Ordering::SeqCst);
        self.client.raw().unsubscribe_all().await.ok();
        self.beats_client.raw().unsubscribe_all().await.ok();
    }

    async fn start_reading_heartbeats(&self) -> Result<()> {
        if !self.reading_started.load(Ordering::SeqCst) {
            return Err(KaraboError::new(ErrorCode::LogicError, "start_reading_heartbeats called before start_reading"));
        }
        self.beats_client.raw().ensure_channel().await?;
        let handler = self.self_arc_heartbeat_handler();
        self.beats_client
            .subscribe(&self.global_slot_exchange(), &format!("*.{HEARTBEAT_SLOT}"), handler)
            .await
    }

    fn set_consume_broadcasts(&self, consume: bool) {
        self.consume_broadcasts.store(consume, Ordering::SeqCst);
    }

    async fn send_signal(&self, signal: &str, sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()> {
        let routing_key = format!("{sender_instance_id}.{signal}");
        self.client.publish_with_confirm(&self.signal_exchange(), &routing_key, header, body, self.wants_confirm()).await
    }

    async fn send_broadcast(&self, slot: &str, sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()> {
        let mut header = header.clone();
        header.set(keys::SLOT_INSTANCE_IDS, format!("|{BROADCAST_MARKER}|"));
        header.set(keys::SLOT_FUNCTIONS, format!("|{BROADCAST_MARKER}:{slot}|"));
        let routing_key = if slot == HEARTBEAT_SLOT { format!("{sender_instance_id}.{slot}") } else { String::new() };
        self.client
            .publish_with_confirm(&self.global_slot_exchange(), &routing_key, &header, body, self.wants_confirm())
            .await
    }

    async fn send_one_to_one(&self, receiver_id: &str, slot: &str, header: &Hash, body: &Hash) -> Result<()> {
        if receiver_id.contains('|') {
            return Err(KaraboError::new(
                ErrorCode::LogicError,
                format!("1-to-1 slot instance id '{receiver_id}' must not contain '|'"),
            ));
        }
        let mut header = header.clone();
        header.set(keys::SLOT_INSTANCE_IDS, format!("|{receiver_id}|"));
        header.set(keys::SLOT_FUNCTIONS, format!("|{receiver_id}:{slot}|"));
        self.client
            .publish_with_confirm(&self.slot_exchange(), receiver_id, &header, body, self.wants_confirm())
            .await
    }

    async fn send_gui_debug(&self, header: &Hash, body: &Hash) -> Result<()> {
        self.client.publish_with_confirm(&self.gui_debug_exchange(), "", header, body, self.wants_confirm()).await
    }
}

impl AmqpBroker {
    /// A handler that dispatches to the slot(s) currently registered for
    /// the routing key the message arrived on (remote signal subscriptions
    /// set up via `subscribe_to_remote_signal`).
    fn self_arc_signal_handler(&self) -> kb_net::HashHandler {
        let this = self.self_arc();
        Arc::new(move |header: Hash, body: Hash, _exchange: String, routing_key: String| {
            let slots: Vec<String> =
                this.slots_for_signals.lock().get(&routing_key).cloned().unwrap_or_default().into_iter().collect();
            for slot in slots {
                this.dispatch(&slot, header.clone(), body.clone());
            }
        })
    }

    /// A handler for 1:1 and broadcast deliveries: dispatches using the
    /// header's `slotFunctions` field, addressed to this instance.
    fn self_arc_addressed_handler(&self) -> kb_net::HashHandler {
        let this = self.self_arc();
        Arc::new(move |header: Hash, body: Hash, _exchange: String, _routing_key: String| {
            let instance_id = this.instance_id.clone();
            this.dispatch_addressed(&instance_id, header, body);
        })
    }

    fn self_arc_heartbeat_handler(&self) -> kb_net::HashHandler {
        let this = self.self_arc();
        Arc::new(move |header: Hash, body: Hash, _exchange: String, _routing_key: String| {
            this.dispatch(HEARTBEAT_SLOT, header, body);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    fn broker() -> Arc<AmqpBroker> {
        AmqpBroker::new(vec!["amqp://localhost:5672".to_string()], "test-domain", "alice")
    }

    #[test]
    fn exchange_names_follow_domain_convention() {
        let b = broker();
        assert_eq!(b.signal_exchange(), "test-domain.signals");
        assert_eq!(b.slot_exchange(), "test-domain.slots");
        assert_eq!(b.global_slot_exchange(), "test-domain.global_slots");
        assert_eq!(b.gui_debug_exchange(), "test-domain.karaboGuiDebug");
    }

    #[test]
    fn dispatch_addressed_uses_slot_functions_header_for_this_instance() {
        let b = broker();
        let calls: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let calls2 = calls.clone();
        *b.read_handler.lock() = Some(Arc::new(move |slot, _h, _b| calls2.lock().unwrap().push(slot)));

        let mut header = Hash::new();
        header.set(keys::SLOT_FUNCTIONS, "|alice:slotDoSomething|");
        b.dispatch_addressed("alice", header, Hash::new());
        assert_eq!(*calls.lock().unwrap(), vec!["slotDoSomething".to_string()]);
    }

    #[test]
    fn dispatch_addressed_ignores_entries_for_other_instances() {
        let b = broker();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        *b.read_handler.lock() = Some(Arc::new(move |_s, _h, _b| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        let mut header = Hash::new();
        header.set(keys::SLOT_FUNCTIONS, "|bob:slotDoSomething|");
        b.dispatch_addressed("alice", header, Hash::new());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dispatch_addressed_matches_broadcast_marker() {
        let b = broker();
        let calls: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let calls2 = calls.clone();
        *b.read_handler.lock() = Some(Arc::new(move |slot, _h, _b| calls2.lock().unwrap().push(slot)));
        let mut header = Hash::new();
        header.set(keys::SLOT_FUNCTIONS, "|*:slotHeartbeat|");
        b.dispatch_addressed("alice", header, Hash::new());
        assert_eq!(*calls.lock().unwrap(), vec!["slotHeartbeat".to_string()]);
    }

    /// Spec §4.5: heartbeats are read through a separate `HashClient` bound
    /// to its own `<domain>.<instanceId>:beats` queue, not the instance's
    /// main slot/signal queue.
    #[test]
    fn heartbeats_use_a_dedicated_queue_distinct_from_the_main_client() {
        let b = broker();
        assert_eq!(b.client.raw().instance_id(), "alice");
        assert_eq!(b.beats_client.raw().instance_id(), "test-domain.alice:beats");
    }

    #[test]
    fn subscribe_to_remote_signal_tracks_multiple_slots_per_routing_key() {
        let b = broker();
        let mut map = b.slots_for_signals.lock();
        map.entry("bob.signalA".to_string()).or_default().insert("slot1".to_string());
        map.entry("bob.signalA".to_string()).or_default().insert("slot2".to_string());
        assert_eq!(map.get("bob.signalA").unwrap().len(), 2);
    }
}
