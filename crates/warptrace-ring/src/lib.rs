//! Sharded multi-producer/single-consumer ring buffer for trace records.
//!
//! Thousands of lockstep producer groups append encoded records into a small,
//! fixed set of per-shard slot arrays; one drainer moves committed slots into
//! the persisted trace stream. Contention is bounded by sharding on the
//! producer's hardware-processor id; ordering across shards is deliberately
//! given up and reconstructed downstream from each record's clock field.

mod layout;
mod ring;

pub use layout::{ShardLayout, DEFAULT_SHARDS, DEFAULT_SLOTS_PER_SHARD};
pub use ring::{Reservation, ShardedRing, WriteError};
