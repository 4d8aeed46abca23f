//! `SignalSlotable`: the signal/slot dispatch layer over a [`Broker`]
//! (spec §4.6) — signal emission, 1-to-1 calls, request/reply correlation,
//! heartbeats and liveness tracking.

use std::sync::Arc;
use std::time::Duration;

use kb_broker::{Broker, ErrorNotifier, MessageHandler};
use kb_common::envelope::{keys, pseudo_function};
use kb_common::{ErrorCode, Hash, KaraboError, Result};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::heartbeat::{HeartbeatEmitter, InstanceState, LivenessTracker};
use crate::request::PendingRequests;
use crate::signal::SignalRegistry;
use crate::slot::{SlotHandler, SlotRegistry, SlotVisibility};

const REPLY_SLOT: &str = "__reply__";
const HEARTBEAT_SLOT: &str = "slotHeartbeat";

/// How a `SignalSlotable` treats the liveness of instances it talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPolicy {
    /// Don't track liveness of remote instances at all.
    NoTrack,
    /// Track liveness (via heartbeats) but don't attempt to recover a
    /// lapsed subscription automatically.
    Track,
    /// Track liveness and proactively nudge a recheck when there is
    /// reason to believe the instance may have come back.
    Reconnect,
}

pub struct SignalSlotable {
    instance_id: String,
    host_name: String,
    broker: Arc<dyn Broker>,
    slots: SlotRegistry,
    signals: SignalRegistry,
    pending: PendingRequests,
    liveness: Arc<LivenessTracker>,
    heartbeat: HeartbeatEmitter,
    policy: ConnectionPolicy,
    default_request_timeout: Duration,
}

impl SignalSlotable {
    pub fn new(broker: Arc<dyn Broker>, instance_id: &str, host_name: &str, policy: ConnectionPolicy) -> Arc<Self> {
        Arc::new(Self {
            instance_id: instance_id.to_string(),
            host_name: host_name.to_string(),
            broker,
            slots: SlotRegistry::new(),
            signals: SignalRegistry::new(),
            pending: PendingRequests::new(),
            liveness: LivenessTracker::new(),
            heartbeat: HeartbeatEmitter::default(),
            policy,
            default_request_timeout: Duration::from_secs(10),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    pub fn register_signal(&self, name: &str) {
        self.signals.register(name);
    }

    pub fn register_slot(&self, name: &str, visibility: SlotVisibility, handler: SlotHandler) {
        self.slots.register(name, visibility, handler);
    }

    /// Connect the broker, start reading, and spawn the heartbeat
    /// emitter, liveness ticker and request-timeout reaper.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.broker.connect().await?;

        let this = self.clone();
        let error_notifier: ErrorNotifier = {
            let this = self.clone();
            Arc::new(move |message: String| {
                warn!(instance_id = %this.instance_id, %message, "broker read error");
            })
        };
        let handler: MessageHandler = {
            let this = self.clone();
            Arc::new(move |slot: String, header: Hash, body: Hash| {
                let this = this.clone();
                tokio::spawn(async move { this.on_message(slot, header, body).await });
            })
        };
        self.broker.start_reading(handler, Some(error_notifier)).await?;
        self.broker.start_reading_heartbeats().await?;

        tokio::spawn(Self::heartbeat_loop(this.clone()));
        tokio::spawn(Self::liveness_loop(this.clone()));
        tokio::spawn(Self::reaper_loop(this));
        Ok(())
    }

    pub async fn stop(&self) {
        self.broker.stop_reading().await;
        self.broker.disconnect().await;
    }

    async fn heartbeat_loop(this: Arc<Self>) {
        loop {
            tokio::time::sleep(this.heartbeat.interval()).await;
            let mut header = Hash::new();
            header.set(keys::SIGNAL_INSTANCE_ID, this.instance_id.clone());
            header.set(keys::SIGNAL_FUNCTION, HEARTBEAT_SLOT);
            let mut body = Hash::new();
            body.set(keys::HEARTBEAT_INSTANCE_ID, this.instance_id.clone());
            body.set(keys::HEARTBEAT_TIME_TO_LIVE, this.heartbeat.time_to_live_ticks());
            if let Err(err) = this.broker.send_broadcast(HEARTBEAT_SLOT, &this.instance_id, &header, &body).await {
                warn!(instance_id = %this.instance_id, %err, "failed to emit heartbeat");
            }
        }
    }

    async fn liveness_loop(this: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if this.policy == ConnectionPolicy::NoTrack {
                continue;
            }
            let newly_down = this.liveness.tick();
            for instance_id in newly_down {
                debug!(%instance_id, "instance declared down after sustained silence");
            }
        }
    }

    async fn reaper_loop(this: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            this.pending.expire_overdue();
        }
    }

    fn caller_host<'a>(header: &'a Hash) -> Option<&'a str> {
        header.get_str(keys::HOST_NAME)
    }

    async fn on_message(self: Arc<Self>, slot: String, header: Hash, body: Hash) {
        match header.get_str(keys::SIGNAL_FUNCTION) {
            Some(pseudo_function::REPLY) | Some(pseudo_function::REPLY_NO_WAIT) => {
                self.complete_reply(&header, body);
                return;
            }
            _ => {}
        }

        if slot == HEARTBEAT_SLOT {
            if let Some(sender) = header.get_str(keys::SIGNAL_INSTANCE_ID) {
                let time_to_live =
                    body.get_i64(keys::HEARTBEAT_TIME_TO_LIVE).unwrap_or_else(|| self.heartbeat.time_to_live_ticks());
                self.liveness.note_alive(sender, time_to_live);
            }
            return;
        }

        let caller = header.get_str(keys::SIGNAL_INSTANCE_ID).unwrap_or_default().to_string();
        let caller_host = Self::caller_host(&header).map(str::to_string);
        if !self.slots.is_allowed(&slot, &caller, caller_host.as_deref(), &self.host_name) {
            warn!(%slot, %caller, "rejected slot call: not permitted by visibility rule");
            return;
        }

        let wants_reply = matches!(header.get_str(keys::SIGNAL_FUNCTION), Some(pseudo_function::REQUEST));
        match self.slots.invoke(&slot, body).await {
            Ok(reply_body) => {
                if wants_reply {
                    self.send_reply(&header, &caller, reply_body).await;
                }
            }
            Err(err) => {
                warn!(%slot, %err, "slot handler failed");
                if wants_reply {
                    self.send_reply(&header, &caller, error_body(&err)).await;
                }
            }
        }
    }

    fn complete_reply(&self, header: &Hash, body: Hash) {
        let Some(reply_to) = header.get_str(keys::REPLY_TO) else { return };
        let Some((_requester, correlation)) = reply_to.split_once('|') else { return };
        let Ok(id) = Uuid::parse_str(correlation) else { return };
        self.pending.complete(id, header.clone(), body);
    }

    async fn send_reply(&self, request_header: &Hash, requester_instance_id: &str, body: Hash) {
        let reply_to = request_header.get_str(keys::REPLY_TO).unwrap_or_default().to_string();
        let mut reply_header = Hash::new();
        reply_header.set(keys::SIGNAL_FUNCTION, pseudo_function::REPLY);
        reply_header.set(keys::REPLY_FROM, self.instance_id.clone());
        reply_header.set(keys::REPLY_TO, reply_to);
        if let Err(err) = self.broker.send_one_to_one(requester_instance_id, REPLY_SLOT, &reply_header, &body).await {
            warn!(%requester_instance_id, %err, "failed to send reply");
        }
    }

    /// Broadcast `signal_name` with `args` to every subscriber (spec
    /// §4.6: `emit`). Fails with `LogicError` if the signal was never
    /// registered, catching a typo before it reaches the wire.
    pub async fn emit(&self, signal_name: &str, args: Hash) -> Result<()> {
        if !self.signals.has(signal_name) {
            return Err(KaraboError::new(ErrorCode::LogicError, format!("signal '{signal_name}' was never registered")));
        }
        let mut header = Hash::new();
        header.set(keys::SIGNAL_INSTANCE_ID, self.instance_id.clone());
        header.set(keys::SIGNAL_FUNCTION, signal_name);
        self.broker.send_signal(signal_name, &self.instance_id, &header, &args).await
    }

    /// Fire-and-forget call of `slot` on `remote_instance_id` (spec §4.6:
    /// `call`).
    pub async fn call(&self, remote_instance_id: &str, slot: &str, args: Hash) -> Result<()> {
        let mut header = Hash::new();
        header.set(keys::SIGNAL_INSTANCE_ID, self.instance_id.clone());
        header.set(keys::SIGNAL_FUNCTION, pseudo_function::CALL);
        header.set(keys::HOST_NAME, self.host_name.clone());
        self.broker.send_one_to_one(remote_instance_id, slot, &header, &args).await
    }

    /// Call `slot` on `remote_instance_id` and await its reply, or
    /// `ErrorCode::TimedOut` after `timeout` elapses.
    pub async fn request(&self, remote_instance_id: &str, slot: &str, args: Hash, timeout: Option<Duration>) -> Result<(Hash, Hash)> {
        let (correlation_id, reply_fut) = self.pending.register(timeout.unwrap_or(self.default_request_timeout));
        let mut header = Hash::new();
        header.set(keys::SIGNAL_INSTANCE_ID, self.instance_id.clone());
        header.set(keys::SIGNAL_FUNCTION, pseudo_function::REQUEST);
        header.set(keys::HOST_NAME, self.host_name.clone());
        header.set(keys::REPLY_TO, format!("{}|{}", self.instance_id, correlation_id));
        self.broker.send_one_to_one(remote_instance_id, slot, &header, &args).await?;
        reply_fut.await
    }

    pub async fn subscribe_to_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()> {
        self.broker.subscribe_to_remote_signal(slot, signal_instance_id, signal_function).await?;
        if self.policy != ConnectionPolicy::NoTrack {
            self.liveness.track(signal_instance_id);
        }
        Ok(())
    }

    pub async fn unsubscribe_from_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()> {
        self.broker.unsubscribe_from_remote_signal(slot, signal_instance_id, signal_function).await
    }

    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.liveness.state_of(instance_id)
    }

    pub fn set_heartbeat_interval(&self, interval: Duration) {
        self.heartbeat.set_interval(interval);
    }

    /// Forward `(header, body)` onto the GUI debug channel. The core only
    /// exposes this routing; interpreting the payload is the GUI client's
    /// job, which is out of scope here (spec §1).
    pub async fn send_gui_debug(&self, header: Hash, body: Hash) -> Result<()> {
        self.broker.send_gui_debug(&header, &body).await
    }
}

fn error_body(err: &KaraboError) -> Hash {
    let mut body = Hash::new();
    body.set("errorCode", err.code.as_str());
    body.set("errorMessage", err.message.clone());
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotVisibility;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// An in-memory `Broker` fake: `send_*` calls deliver synchronously to
    /// whatever handler the other end of the pair registered, with no
    /// actual network involved. Grounds the "testable properties" from
    /// spec §8 without a live AMQP broker.
    struct PairedFakeBroker {
        peer_handler: AsyncMutex<Option<MessageHandler>>,
        own_handler: AsyncMutex<Option<MessageHandler>>,
        connected: std::sync::atomic::AtomicBool,
    }

    impl PairedFakeBroker {
        fn new_pair() -> (Arc<Self>, Arc<Self>) {
            let a = Arc::new(Self {
                peer_handler: AsyncMutex::new(None),
                own_handler: AsyncMutex::new(None),
                connected: std::sync::atomic::AtomicBool::new(false),
            });
            let b = Arc::new(Self {
                peer_handler: AsyncMutex::new(None),
                own_handler: AsyncMutex::new(None),
                connected: std::sync::atomic::AtomicBool::new(false),
            });
            (a, b)
        }

        async fn link(a: &Arc<Self>, b: &Arc<Self>) {
            // Each side's "peer_handler" is filled in once the other side
            // calls start_reading, wired together right after both join.
            let _ = (a, b);
        }
    }

    #[async_trait]
    impl Broker for PairedFakeBroker {
        async fn connect(&self) -> Result<()> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }
        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn broker_url(&self) -> String {
            "fake://pair".to_string()
        }
        fn broker_type(&self) -> &'static str {
            "fake"
        }
        async fn subscribe_to_remote_signal(&self, _slot: &str, _signal_instance_id: &str, _signal_function: &str) -> Result<()> {
            Ok(())
        }
        async fn unsubscribe_from_remote_signal(&self, _slot: &str, _signal_instance_id: &str, _signal_function: &str) -> Result<()> {
            Ok(())
        }
        async fn start_reading(&self, handler: MessageHandler, _error_notifier: Option<ErrorNotifier>) -> Result<()> {
            *self.own_handler.lock().await = Some(handler);
            Ok(())
        }
        async fn stop_reading(&self) {
            *self.own_handler.lock().await = None;
        }
        async fn start_reading_heartbeats(&self) -> Result<()> {
            Ok(())
        }
        fn set_consume_broadcasts(&self, _consume: bool) {}
        async fn send_signal(&self, signal: &str, _sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()> {
            self.deliver(signal, header, body).await
        }
        async fn send_broadcast(&self, slot: &str, _sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()> {
            self.deliver(slot, header, body).await
        }
        async fn send_one_to_one(&self, _receiver_id: &str, slot: &str, header: &Hash, body: &Hash) -> Result<()> {
            self.deliver(slot, header, body).await
        }
        async fn send_gui_debug(&self, _header: &Hash, _body: &Hash) -> Result<()> {
            Ok(())
        }
    }

    impl PairedFakeBroker {
        async fn deliver(&self, slot: &str, header: &Hash, body: &Hash) -> Result<()> {
            if let Some(handler) = self.peer_handler.lock().await.clone() {
                handler(slot.to_string(), header.clone(), body.clone());
            }
            Ok(())
        }
    }

    async fn wire_pair(a: &Arc<PairedFakeBroker>, b: &Arc<PairedFakeBroker>) {
        let a_handler = a.own_handler.lock().await.clone();
        let b_handler = b.own_handler.lock().await.clone();
        *a.peer_handler.lock().await = b_handler;
        *b.peer_handler.lock().await = a_handler;
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (broker_a, broker_b) = PairedFakeBroker::new_pair();
        let alice = SignalSlotable::new(broker_a.clone(), "alice", "host-a", ConnectionPolicy::NoTrack);
        let bob = SignalSlotable::new(broker_b.clone(), "bob", "host-a", ConnectionPolicy::NoTrack);

        bob.register_slot(
            "slotAdd",
            SlotVisibility::NetworkIdInvariant,
            Arc::new(|body: Hash| {
                Box::pin(async move {
                    let a = body.get("a").and_then(|v| v.as_i64()).unwrap_or(0);
                    let b = body.get("b").and_then(|v| v.as_i64()).unwrap_or(0);
                    let mut reply = Hash::new();
                    reply.set("sum", a + b);
                    Ok(reply)
                })
            }),
        );

        alice.start().await.unwrap();
        bob.start().await.unwrap();
        wire_pair(&broker_a, &broker_b).await;

        let mut args = Hash::new();
        args.set("a", 2i64).set("b", 3i64);
        let (_, reply_body) = alice.request("bob", "slotAdd", args, Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(reply_body.get("sum").and_then(|v| v.as_i64()), Some(5));
    }

    #[tokio::test]
    async fn call_is_rejected_when_slot_visibility_denies_caller() {
        let (broker_a, broker_b) = PairedFakeBroker::new_pair();
        let alice = SignalSlotable::new(broker_a.clone(), "alice", "host-a", ConnectionPolicy::NoTrack);
        let bob = SignalSlotable::new(broker_b.clone(), "bob", "host-a", ConnectionPolicy::NoTrack);

        let invocations = Arc::new(AtomicUsize::new(0));
        let invocations2 = invocations.clone();
        let mut allowed = std::collections::HashSet::new();
        allowed.insert("someone-else".to_string());
        bob.register_slot(
            "slotSecret",
            SlotVisibility::Specific(allowed),
            Arc::new(move |body: Hash| {
                let invocations = invocations2.clone();
                Box::pin(async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Ok(body)
                })
            }),
        );

        alice.start().await.unwrap();
        bob.start().await.unwrap();
        wire_pair(&broker_a, &broker_b).await;

        alice.call("bob", "slotSecret", Hash::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emit_rejects_unregistered_signal() {
        let (broker_a, _broker_b) = PairedFakeBroker::new_pair();
        let alice = SignalSlotable::new(broker_a.clone(), "alice", "host-a", ConnectionPolicy::NoTrack);
        alice.start().await.unwrap();
        let err = alice.emit("signalNeverRegistered", Hash::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LogicError);
    }
}
