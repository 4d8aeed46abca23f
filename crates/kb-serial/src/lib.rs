pub mod binary;

pub use binary::{BinaryV1Serializer, HashSerializer};
