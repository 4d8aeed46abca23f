pub mod config;
pub mod connection;
pub mod hash_client;
pub mod raw_client;
pub mod strand;

pub use config::{BrokerUrl, NetConfig, Transport};
pub use connection::{Connection, ConnectionState, Revivable};
pub use hash_client::{HashClient, HashHandler};
pub use raw_client::{ChannelStatus, RawClient, ReadHandler};
pub use strand::Strand;
