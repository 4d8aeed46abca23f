//! `RawClient`: byte-level publish/subscribe on top of one [`Connection`]
//! channel (spec §4.2).
//!
//! `RawClient` owns exactly one `lapin::Channel`, exactly one consumer queue
//! (named after the instance id, per spec §4.2's invariant), and a table of
//! active subscriptions keyed by `(exchange, routingKey pattern)`. It never
//! looks inside a message; the header/body split and `Hash`
//! (de)serialization live one layer up in [`crate::hash_client::HashClient`].

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueUnbindOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, ExchangeKind};
use parking_lot::Mutex;
use tracing::{debug, warn};

use kb_common::{ErrorCode, KaraboError, Result};

use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::connection::{Connection, Revivable};

/// `(payload, exchange, routing_key)`, mirroring the original's
/// `amqpReadHandler(header, body, exchange, key)` so a broker façade can
/// tell which binding delivered a message without re-parsing it.
pub type ReadHandler = Arc<dyn Fn(Vec<u8>, &str, &str) + Send + Sync>;

/// Queue args applied to the instance queue: bounded length with head-drop
/// overflow and a TTL, so a stalled consumer cannot grow its queue without
/// bound (spec §4.2).
const QUEUE_MAX_LENGTH: i32 = 10_000;
const QUEUE_OVERFLOW: &str = "drop-head";
const QUEUE_MESSAGE_TTL_MS: i32 = 120_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionStatus {
    Pending,
    Subscribed,
}

struct Subscription {
    status: SubscriptionStatus,
    handler: ReadHandler,
}

/// Strip line feeds and carriage returns the way the broker does when
/// declaring a queue, so `"id\nbad"` and `"idbad"` share identity (spec
/// §4.2/§8).
pub fn sanitize_instance_id(id: &str) -> String {
    id.chars().filter(|c| *c != '\n' && *c != '\r').collect()
}

/// Match a delivered routing key against an AMQP topic-exchange binding
/// pattern (`*` matches exactly one dot-delimited segment, `#` matches zero
/// or more). Used to figure out which locally-registered subscription(s) a
/// delivery on the shared instance queue belongs to, since one queue may
/// carry several distinct bindings (spec §4.2: one queue per instance).
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.first() {
            None => key.is_empty(),
            Some(&"#") => {
                if pattern.len() == 1 {
                    return true;
                }
                (0..=key.len()).any(|i| go(&pattern[1..], &key[i..]))
            }
            Some(&"*") => !key.is_empty() && go(&pattern[1..], &key[1..]),
            Some(seg) => key.first().map(|k| k == seg).unwrap_or(false) && go(&pattern[1..], &key[1..]),
        }
    }
    go(&pattern, &key)
}

/// A byte-level publish/subscribe client bound to one AMQP channel and one
/// instance queue.
pub struct RawClient {
    connection: Arc<Connection>,
    instance_id: String,
    channel: Mutex<Option<Channel>>,
    status: Mutex<ChannelStatus>,
    consumer_started: Mutex<bool>,
    subscriptions: DashMap<(String, String), Subscription>,
    self_weak: Mutex<Weak<RawClient>>,
}

impl RawClient {
    pub fn new(connection: Arc<Connection>, instance_id: &str) -> Arc<Self> {
        let reconnect_conn = connection.clone();
        let client = Arc::new(Self {
            connection,
            instance_id: sanitize_instance_id(instance_id),
            channel: Mutex::new(None),
            status: Mutex::new(ChannelStatus::Closed),
            consumer_started: Mutex::new(false),
            subscriptions: DashMap::new(),
            self_weak: Mutex::new(Weak::new()),
        });
        *client.self_weak.lock() = Arc::downgrade(&client);
        reconnect_conn.register_for_reconnect_info(Arc::downgrade(&client) as Weak<dyn Revivable>);
        client
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.lock()
    }

    /// The sanitized instance id this client's queue is named after.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Open (or re-open) this client's channel on the underlying
    /// connection. Idempotent: a second call while already open is a
    /// no-op.
    pub async fn ensure_channel(&self) -> Result<()> {
        if self.status() == ChannelStatus::Open {
            return Ok(());
        }
        *self.status.lock() = ChannelStatus::Connecting;
        match self.connection.create_channel().await {
            Ok(channel) => {
                let weak_self = self.self_weak.lock().clone();
                channel.on_error(move |err| {
                    warn!(%err, "amqp channel error, channel discarded");
                    if let Some(this) = weak_self.upgrade() {
                        this.handle_channel_lost();
                    }
                });
                *self.channel.lock() = Some(channel);
                *self.status.lock() = ChannelStatus::Open;
                Ok(())
            }
            Err(err) => {
                *self.status.lock() = ChannelStatus::Closed;
                Err(err)
            }
        }
    }

    /// Discard the current channel and reopen + replay every subscription
    /// once a fresh one can be created. Shared by the channel's own
    /// `on_error` (broker loss, oversized frame, exclusive-consumer
    /// conflict — spec §4.2) and [`Revivable::revive_if_reconnected`]
    /// (a whole-connection reconnect), since both leave this client in the
    /// same stale state.
    fn handle_channel_lost(self: &Arc<Self>) {
        *self.status.lock() = ChannelStatus::Closed;
        *self.channel.lock() = None;
        *self.consumer_started.lock() = false;
        let patterns: Vec<(String, String)> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        debug!(instance_id = %self.instance_id, count = patterns.len(), "reopening channel and replaying subscriptions");
        let this = self.clone();
        self.connection.io_runtime().spawn(async move {
            if let Err(err) = this.ensure_channel().await {
                warn!(%err, "failed to reopen channel");
                return;
            }
            for (exchange, routing_key) in patterns {
                if let Err(err) = this.do_subscribe(&exchange, &routing_key).await {
                    warn!(%exchange, %routing_key, %err, "failed to resubscribe");
                }
            }
        });
    }

    fn channel_handle(&self) -> Result<Channel> {
        self.channel.lock().clone().ok_or_else(|| KaraboError::new(ErrorCode::NotConnected, "channel not open"))
    }

    /// All exchanges are `topic` type, `autodelete`, non-durable (spec §6).
    async fn declare_topic_exchange(&self, channel: &Channel, exchange: &str) -> Result<()> {
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: false, auto_delete: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| KaraboError::with_source(ErrorCode::CreateExchangeError, "exchange_declare failed", e))
    }

    /// The queue name equals the instance id (spec §4.2 invariant: exactly
    /// one consumer queue per instance, regardless of how many
    /// `(exchange, routingKey)` pairs it is bound to).
    fn queue_name(&self) -> &str {
        &self.instance_id
    }

    /// Declare this client's one queue and start its one consumer, if not
    /// already running. Every subsequent subscription only adds a binding
    /// onto this same queue.
    async fn ensure_consumer(self: &Arc<Self>) -> Result<()> {
        if *self.consumer_started.lock() {
            return Ok(());
        }
        let channel = self.channel_handle()?;

        let mut args = FieldTable::default();
        args.insert("x-max-length".into(), AMQPValue::LongInt(QUEUE_MAX_LENGTH));
        args.insert("x-overflow".into(), AMQPValue::LongString(QUEUE_OVERFLOW.into()));
        args.insert("x-message-ttl".into(), AMQPValue::LongInt(QUEUE_MESSAGE_TTL_MS));

        channel
            .queue_declare(
                self.queue_name(),
                QueueDeclareOptions { durable: false, auto_delete: true, ..Default::default() },
                args,
            )
            .await
            .map_err(|e| KaraboError::with_source(ErrorCode::CreateQueueError, "queue_declare failed", e))?;

        let consumer_tag = format!("{}-{}", self.instance_id, uuid::Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                self.queue_name(),
                &consumer_tag,
                BasicConsumeOptions { no_ack: true, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| KaraboError::with_source(ErrorCode::CreateConsumerError, "basic_consume failed", e))?;

        *self.consumer_started.lock() = true;

        let this = self.clone();
        self.connection.io_runtime().spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let exchange = delivery.exchange.as_str().to_string();
                        let routing_key = delivery.routing_key.as_str().to_string();
                        for sub in this.subscriptions.iter() {
                            let (sub_exchange, pattern) = sub.key();
                            if sub_exchange == &exchange
                                && sub.status == SubscriptionStatus::Subscribed
                                && topic_matches(pattern, &routing_key)
                            {
                                (sub.handler)(delivery.data.clone(), &exchange, &routing_key);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "consumer stream error");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Subscribe `handler` to everything published on `exchange` matching
    /// `routing_key` (a topic-exchange pattern, possibly containing `*`/`#`
    /// wildcards). Ensures the instance queue and its single consumer exist,
    /// declares the exchange, and binds the queue to it (spec §4.2).
    pub async fn subscribe(self: &Arc<Self>, exchange: &str, routing_key: &str, handler: ReadHandler) -> Result<()> {
        self.ensure_channel().await?;
        let key = (exchange.to_string(), routing_key.to_string());
        self.subscriptions.insert(key.clone(), Subscription { status: SubscriptionStatus::Pending, handler });
        self.do_subscribe(&key.0, &key.1).await
    }

    async fn do_subscribe(self: &Arc<Self>, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.channel_handle()?;
        self.declare_topic_exchange(&channel, exchange).await?;
        self.ensure_consumer().await?;

        channel
            .queue_bind(self.queue_name(), exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(|e| KaraboError::with_source(ErrorCode::BindQueueError, "queue_bind failed", e))?;

        if let Some(mut entry) = self.subscriptions.get_mut(&(exchange.to_string(), routing_key.to_string())) {
            entry.status = SubscriptionStatus::Subscribed;
        }
        Ok(())
    }

    /// Stop delivery for one `(exchange, routingKey)` pair. If the
    /// subscription never made it past `Pending` (still being set up when
    /// the unsubscribe arrived), it is simply dropped from the table.
    pub async fn unsubscribe(&self, exchange: &str, routing_key: &str) -> Result<()> {
        let existed = self.subscriptions.remove(&(exchange.to_string(), routing_key.to_string()));
        if existed.is_none() {
            return Ok(());
        }
        if let Ok(channel) = self.channel_handle() {
            let _ = channel
                .queue_unbind(self.queue_name(), exchange, routing_key, QueueUnbindOptions::default(), FieldTable::default())
                .await
                .map_err(|e| KaraboError::with_source(ErrorCode::UnbindQueueError, "queue_unbind failed", e));
        }
        Ok(())
    }

    pub async fn unsubscribe_all(&self) -> Result<()> {
        let keys: Vec<(String, String)> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for (exchange, routing_key) in keys {
            self.unsubscribe(&exchange, &routing_key).await?;
        }
        Ok(())
    }

    /// Publish `payload` on `exchange` with `routing_key`. Rejects oversized
    /// payloads up front rather than letting the broker close the channel
    /// on us (spec §4.2). Non-persistent (`delivery_mode = 1`): spec §9
    /// flags that the AMQP path carries no persistence guarantee, unlike
    /// the legacy JMS path's own (also non-persistent) semantics — see
    /// `confirm` below for the one difference between them.
    pub async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        self.publish_with_confirm(exchange, routing_key, payload, true).await
    }

    /// As [`RawClient::publish`], but `confirm = false` fires the message
    /// without waiting for the broker's publisher-confirm acknowledgment —
    /// the legacy JMS-equivalent `NON_PERSISTENT_DELIVERY` fire-and-forget
    /// behavior `kb-broker::JmsBroker` asks for (spec §9).
    pub async fn publish_with_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        confirm: bool,
    ) -> Result<()> {
        if payload.len() > DEFAULT_MAX_MESSAGE_BYTES {
            return Err(KaraboError::new(
                ErrorCode::IoError,
                format!("payload of {} bytes exceeds the {} byte cap", payload.len(), DEFAULT_MAX_MESSAGE_BYTES),
            ));
        }
        self.ensure_channel().await?;
        let channel = self.channel_handle()?;
        self.declare_topic_exchange(&channel, exchange).await?;

        let publish = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(1),
            )
            .await
            .map_err(|e| KaraboError::with_source(ErrorCode::NetworkError, "basic_publish failed", e))?;

        if confirm {
            publish.await.map_err(|e| KaraboError::with_source(ErrorCode::NetworkError, "publisher confirm failed", e))?;
        }
        Ok(())
    }
}

impl Revivable for RawClient {
    fn revive_if_reconnected(&self) {
        let Some(this) = self.self_weak.lock().upgrade() else { return };
        this.handle_channel_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_newlines_and_carriage_returns() {
        assert_eq!(sanitize_instance_id("alice\r\n/1"), "alice/1");
        assert_eq!(sanitize_instance_id("id\nbad"), "idbad");
        assert_eq!(sanitize_instance_id("bob"), "bob");
    }

    #[test]
    fn topic_matches_exact_key() {
        assert!(topic_matches("bob.signalA", "bob.signalA"));
        assert!(!topic_matches("bob.signalA", "bob.signalB"));
    }

    #[test]
    fn topic_matches_single_segment_wildcard() {
        assert!(topic_matches("alice.*", "alice.slotPing"));
        assert!(!topic_matches("alice.*", "alice.slotPing.extra"));
    }

    #[test]
    fn topic_matches_hash_wildcard_any_length() {
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("*.slotHeartbeat", "bob.slotHeartbeat"));
        assert!(!topic_matches("*.slotHeartbeat", "a.b.slotHeartbeat"));
    }

    /// Spec §4.2/§8 scenario 5: an oversize publish fails synchronously
    /// with `IoError` and never reaches `ensure_channel`/the connection, so
    /// this is checkable without a live broker.
    #[tokio::test]
    async fn publish_over_the_size_cap_fails_synchronously_with_io_error() {
        let connection = Connection::new(vec!["amqp://127.0.0.1:1".to_string()]);
        let client = RawClient::new(connection, "alice");
        let oversized = vec![0u8; DEFAULT_MAX_MESSAGE_BYTES + 1];
        let err = client.publish("dom.signals", "alice.signalX", oversized).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::IoError);
        assert_eq!(client.status(), ChannelStatus::Closed);
    }
}
