//! `HashClient`: a [`RawClient`] that speaks `Hash` envelopes instead of
//! raw bytes (spec §4.3).
//!
//! Serializes `(header, body)` into one contiguous buffer via a pluggable
//! [`HashSerializer`] and deserializes incoming bytes back into the pair,
//! handing the result to the caller's handler on the connection's strand so
//! message order is preserved per subscription.

use std::sync::Arc;

use kb_common::envelope::keys;
use kb_common::{ErrorCode, Hash, KaraboError, Result};
use kb_serial::HashSerializer;

use crate::connection::Connection;
use crate::raw_client::{ReadHandler, RawClient};
use crate::strand::Strand;

/// `(header, body, exchange, routing_key)`.
pub type HashHandler = Arc<dyn Fn(Hash, Hash, String, String) + Send + Sync>;

/// A `(header, body)` publish/subscribe client layered on [`RawClient`].
pub struct HashClient<S: HashSerializer> {
    raw: Arc<RawClient>,
    serializer: S,
    strand: Strand,
}

impl<S: HashSerializer + 'static> HashClient<S> {
    pub fn new(connection: Arc<Connection>, instance_id: &str, serializer: S) -> Arc<Self> {
        let strand = Strand::new(connection.io_runtime());
        let raw = RawClient::new(connection, instance_id);
        Arc::new(Self { raw, serializer, strand })
    }

    pub fn raw(&self) -> &Arc<RawClient> {
        &self.raw
    }

    /// Serialize `header` then `body` into one buffer and publish it,
    /// waiting for the broker's publisher-confirm acknowledgment.
    pub async fn publish(&self, exchange: &str, routing_key: &str, header: &Hash, body: &Hash) -> Result<()> {
        self.publish_with_confirm(exchange, routing_key, header, body, true).await
    }

    /// As [`HashClient::publish`], but lets the caller opt out of waiting
    /// for the publisher confirm (`kb-broker::JmsBroker`'s legacy
    /// fire-and-forget semantics; spec §9).
    pub async fn publish_with_confirm(
        &self,
        exchange: &str,
        routing_key: &str,
        header: &Hash,
        body: &Hash,
        confirm: bool,
    ) -> Result<()> {
        let mut buf = Vec::new();
        self.serializer.save(header, &mut buf)?;
        self.serializer.save(body, &mut buf)?;
        self.raw.publish_with_confirm(exchange, routing_key, buf, confirm).await
    }

    /// Subscribe to `(exchange, routing_key)`, deserializing each delivery
    /// back into `(header, body)` on this client's strand before calling
    /// `handler`, so deliveries for this subscription are handled in the
    /// order the broker delivered them even though the underlying consumer
    /// task may race with other subscriptions' tasks.
    pub async fn subscribe(self: &Arc<Self>, exchange: &str, routing_key: &str, handler: HashHandler) -> Result<()>
    where
        S: Clone,
    {
        let serializer = self.serializer.clone();
        let strand = self.strand.clone();
        let read_handler: ReadHandler = Arc::new(move |bytes: Vec<u8>, exchange: &str, routing_key: &str| {
            let serializer = serializer.clone();
            let handler = handler.clone();
            let exchange = exchange.to_string();
            let routing_key = routing_key.to_string();
            strand.post(move || async move {
                match decode_envelope(&serializer, &bytes) {
                    Ok((mut header, body)) => {
                        header.set(keys::EXCHANGE, exchange.clone());
                        header.set(keys::KEY, routing_key.clone());
                        handler(header, body, exchange, routing_key)
                    }
                    Err(err) => tracing::warn!(%err, "dropping undecodable envelope"),
                }
            });
        });
        self.raw.subscribe(exchange, routing_key, read_handler).await
    }

    pub async fn unsubscribe(&self, exchange: &str, routing_key: &str) -> Result<()> {
        self.raw.unsubscribe(exchange, routing_key).await
    }
}

fn decode_envelope<S: HashSerializer>(serializer: &S, bytes: &[u8]) -> Result<(Hash, Hash)> {
    let (header, consumed) = serializer.load(bytes)?;
    if consumed > bytes.len() {
        return Err(KaraboError::new(ErrorCode::IoError, "serializer reported consuming more than available"));
    }
    let body = serializer.load_one_shot(&bytes[consumed..])?;
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kb_serial::BinaryV1Serializer;

    #[test]
    fn decode_envelope_splits_header_and_body() {
        let ser = BinaryV1Serializer::new();
        let mut header = Hash::new();
        header.set("signalInstanceId", "alice");
        let mut body = Hash::new();
        body.set("ok", true);

        let mut buf = Vec::new();
        ser.save(&header, &mut buf).unwrap();
        ser.save(&body, &mut buf).unwrap();

        let (decoded_header, decoded_body) = decode_envelope(&ser, &buf).unwrap();
        assert!(decoded_header.fully_equals(&header));
        assert!(decoded_body.fully_equals(&body));
    }
}
