//! `JmsBroker`: the legacy transport selected by a `tcp://` broker URL.
//!
//! The original ships a real JMS/OpenMQ client. Nothing in this pack
//! provides a JMS crate, and inventing one would mean fabricating a
//! dependency — so this legacy path is expressed as [`AmqpBroker`]
//! wearing a different name and a different exchange-naming convention
//! (`<domain>.legacy.*` instead of `<domain>.*`), with publisher confirms
//! skipped to match the original's fire-and-forget JMS semantics. See
//! `DESIGN.md` for the full rationale.

use std::sync::Arc;

use async_trait::async_trait;

use kb_common::{Hash, Result};

use crate::amqp::AmqpBroker;
use crate::{Broker, ErrorNotifier, MessageHandler};

pub struct JmsBroker {
    inner: Arc<AmqpBroker>,
}

impl JmsBroker {
    pub fn new(urls: Vec<String>, domain: &str, instance_id: &str) -> Arc<Self> {
        let legacy_domain = format!("{domain}.legacy");
        Arc::new(Self { inner: AmqpBroker::new_with_confirm(urls, &legacy_domain, instance_id, false) })
    }
}

#[async_trait]
impl Broker for JmsBroker {
    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn broker_url(&self) -> String {
        self.inner.broker_url()
    }

    fn broker_type(&self) -> &'static str {
        "jms"
    }

    async fn subscribe_to_remote_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()> {
        self.inner.subscribe_to_remote_signal(slot, signal_instance_id, signal_function).await
    }

    async fn unsubscribe_from_remote_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()> {
        self.inner.unsubscribe_from_remote_signal(slot, signal_instance_id, signal_function).await
    }

    async fn start_reading(&self, handler: MessageHandler, error_notifier: Option<ErrorNotifier>) -> Result<()> {
        self.inner.start_reading(handler, error_notifier).await
    }

    async fn stop_reading(&self) {
        self.inner.stop_reading().await
    }

    async fn start_reading_heartbeats(&self) -> Result<()> {
        self.inner.start_reading_heartbeats().await
    }

    fn set_consume_broadcasts(&self, consume: bool) {
        self.inner.set_consume_broadcasts(consume)
    }

    async fn send_signal(&self, signal: &str, sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()> {
        self.inner.send_signal(signal, sender_instance_id, header, body).await
    }

    async fn send_broadcast(&self, slot: &str, sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()> {
        self.inner.send_broadcast(slot, sender_instance_id, header, body).await
    }

    async fn send_one_to_one(&self, receiver_id: &str, slot: &str, header: &Hash, body: &Hash) -> Result<()> {
        self.inner.send_one_to_one(receiver_id, slot, header, body).await
    }

    async fn send_gui_debug(&self, header: &Hash, body: &Hash) -> Result<()> {
        self.inner.send_gui_debug(header, body).await
    }
}

