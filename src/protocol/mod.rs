//! RFB protocol plumbing: wire scalars, connection establishment, and the
//! two message directions.

pub mod client;
pub mod messages;
pub mod wire;
