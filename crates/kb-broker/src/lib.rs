//! The `Broker` façade (spec §4.5): a transport-agnostic signal/slot
//! messaging surface that [`kb_dispatch::SignalSlotable`] drives without
//! knowing whether AMQP, the legacy JMS bridge, or (in tests) an in-memory
//! fake is underneath.

pub mod amqp;
pub mod jms;

use std::sync::Arc;

use async_trait::async_trait;
use kb_common::{Hash, Result};

/// Called for every inbound message this broker delivers: the slot name
/// to invoke, the header, and the body.
pub type MessageHandler = Arc<dyn Fn(String, Hash, Hash) + Send + Sync>;

/// Called when the broker's read loop hits an unrecoverable error.
pub type ErrorNotifier = Arc<dyn Fn(String) + Send + Sync>;

/// Transport-agnostic messaging surface (spec §4.5, §7).
///
/// The original C++ `Broker` pairs a blocking method with an `*Async`
/// sibling for several operations. Every operation here is already
/// non-blocking by virtue of being `async fn`, so that pairing collapses
/// to one method each — see `DESIGN.md` for the rationale.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    fn broker_url(&self) -> String;

    fn broker_type(&self) -> &'static str;

    /// Subscribe `slot` to messages emitted by `signal_instance_id`'s
    /// `signal_function`. Several local slots may subscribe to the same
    /// remote signal; only one underlying transport subscription is made
    /// per `(signal_instance_id, signal_function)` pair.
    async fn subscribe_to_remote_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()>;

    async fn unsubscribe_from_remote_signal(&self, slot: &str, signal_instance_id: &str, signal_function: &str) -> Result<()>;

    /// Begin delivering 1-to-1 and (unless [`Broker::set_consume_broadcasts`]
    /// disabled it) broadcast messages addressed to this instance to
    /// `handler`. `slotHeartbeat` broadcasts are withheld until
    /// [`Broker::start_reading_heartbeats`] is called.
    async fn start_reading(&self, handler: MessageHandler, error_notifier: Option<ErrorNotifier>) -> Result<()>;

    async fn stop_reading(&self);

    async fn start_reading_heartbeats(&self) -> Result<()>;

    /// Opt out of broadcast delivery before calling `start_reading`.
    fn set_consume_broadcasts(&self, consume: bool);

    async fn send_signal(&self, signal: &str, sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()>;

    async fn send_broadcast(&self, slot: &str, sender_instance_id: &str, header: &Hash, body: &Hash) -> Result<()>;

    async fn send_one_to_one(&self, receiver_id: &str, slot: &str, header: &Hash, body: &Hash) -> Result<()>;

    /// Publish onto the GUI debug channel (`<domain>.karaboGuiDebug`, empty
    /// routing key; spec §4.5/§6). The GUI client that reads this channel is
    /// out of scope — the core only exposes the routing, per spec §1.
    async fn send_gui_debug(&self, header: &Hash, body: &Hash) -> Result<()>;
}

pub use amqp::AmqpBroker;
pub use jms::JmsBroker;
