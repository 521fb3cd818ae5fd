//! Master/slave replication of the global asset set.
//!
//! Pull: a slave periodically sweeps the master's id space shard by shard
//! and fetches whatever it is missing. Push: a master streams freshly
//! stored assets to its slave as they arrive, with pull as the backstop for
//! anything the bounded push queue drops.

pub mod pull;
pub mod push;

pub use pull::PullReplication;
pub use push::PushReplication;
