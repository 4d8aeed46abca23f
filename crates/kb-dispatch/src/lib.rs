pub mod heartbeat;
pub mod request;
pub mod signal;
pub mod signal_slotable;
pub mod slot;

pub use heartbeat::{HeartbeatEmitter, InstanceState, LivenessTracker, DEFAULT_HEARTBEAT_INTERVAL};
pub use request::PendingRequests;
pub use signal::SignalRegistry;
pub use signal_slotable::{ConnectionPolicy, SignalSlotable};
pub use slot::{SlotFuture, SlotHandler, SlotRegistry, SlotVisibility};
