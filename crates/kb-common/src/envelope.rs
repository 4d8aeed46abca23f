//! Header keys and pseudo-function constants for the wire envelope
//! (spec §3: "every message on the wire is a pair `(header: Hash, body:
//! Hash)`").

use crate::hash::Hash;

pub mod keys {
    pub const SIGNAL_INSTANCE_ID: &str = "signalInstanceId";
    pub const SIGNAL_FUNCTION: &str = "signalFunction";
    pub const SLOT_INSTANCE_IDS: &str = "slotInstanceIds";
    pub const SLOT_FUNCTIONS: &str = "slotFunctions";
    pub const REPLY_TO: &str = "replyTo";
    pub const REPLY_FROM: &str = "replyFrom";
    pub const REPLY_INSTANCE_IDS: &str = "replyInstanceIds";
    pub const REPLY_FUNCTIONS: &str = "replyFunctions";
    pub const HOST_NAME: &str = "hostName";
    pub const USER_NAME: &str = "userName";
    pub const EXCHANGE: &str = "exchange";
    pub const KEY: &str = "key";
    pub const ORDER_NUMBER: &str = "orderNumber";
    pub const PRODUCER_TIMESTAMP: &str = "producerTimestamp";

    /// `slotHeartbeat` body fields (spec §4.6/§8 scenario 6): the sender's
    /// id and how many liveness ticks a receiver should keep it `Alive`
    /// for before the next heartbeat is due.
    pub const HEARTBEAT_INSTANCE_ID: &str = "instanceId";
    pub const HEARTBEAT_TIME_TO_LIVE: &str = "timeToLive";
}

/// Pseudo-functions a `signalFunction` header value may take instead of a
/// user-defined signal name.
pub mod pseudo_function {
    pub const CALL: &str = "__call__";
    pub const REQUEST: &str = "__request__";
    pub const REQUEST_NO_WAIT: &str = "__requestNoWait__";
    pub const REPLY: &str = "__reply__";
    pub const REPLY_NO_WAIT: &str = "__replyNoWait__";
}

/// Marker used in `slotInstanceIds`/`slotFunctions` to address every
/// instance (broadcast / global slot).
pub const BROADCAST_MARKER: &str = "*";

/// Join a list of instance ids into the pipe-delimited `slotInstanceIds`
/// form: `|id1|id2|`.
pub fn join_slot_instance_ids<I, S>(ids: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::from("|");
    for id in ids {
        out.push_str(id.as_ref());
        out.push('|');
    }
    out
}

/// Split a pipe-delimited `|id1|id2|` string into its instance ids.
pub fn split_slot_instance_ids(field: &str) -> Vec<&str> {
    field.split('|').filter(|s| !s.is_empty()).collect()
}

/// Join `(instanceId, slotName)` pairs into the `slotFunctions` form
/// `|id1:slotA||id2:slotB|`.
pub fn join_slot_functions<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    for (id, slot) in pairs {
        out.push('|');
        out.push_str(id);
        out.push(':');
        out.push_str(slot);
        out.push('|');
    }
    out
}

/// Split a `slotFunctions` field into `(instanceId, slotName)` pairs.
/// Malformed segments (no `:`) are skipped.
pub fn split_slot_functions(field: &str) -> Vec<(&str, &str)> {
    field
        .split('|')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once(':'))
        .collect()
}

/// An envelope ready to go over the wire: header plus opaque body.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub header: Hash,
    pub body: Hash,
}

impl Envelope {
    pub fn new(header: Hash, body: Hash) -> Self {
        Self { header, body }
    }

    /// Set the `exchange`/`key` fields a receiver fills in to report which
    /// AMQP exchange and routing key actually delivered the message.
    pub fn annotate_delivery(&mut self, exchange: &str, routing_key: &str) {
        self.header.set(keys::EXCHANGE, exchange);
        self.header.set(keys::KEY, routing_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_instance_ids_roundtrip() {
        let joined = join_slot_instance_ids(["alice", "bob"]);
        assert_eq!(joined, "|alice|bob|");
        assert_eq!(split_slot_instance_ids(&joined), vec!["alice", "bob"]);
    }

    #[test]
    fn slot_functions_roundtrip() {
        let joined = join_slot_functions([("alice", "slotA"), ("bob", "slotB")]);
        assert_eq!(joined, "|alice:slotA||bob:slotB|");
        assert_eq!(split_slot_functions(&joined), vec![("alice", "slotA"), ("bob", "slotB")]);
    }

    #[test]
    fn broadcast_marker_parses_as_single_entry() {
        let field = format!("|{}|", BROADCAST_MARKER);
        assert_eq!(split_slot_instance_ids(&field), vec!["*"]);
    }
}
