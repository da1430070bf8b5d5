//! Global and per-connection bandwidth limits for async network listeners.
//!
//! [`ThrottledListener`](listener::ThrottledListener) wraps a raw listener and
//! hands out [`ThrottledConnection`](connection::ThrottledConnection)s whose
//! reads and writes are metered through two [token
//! buckets](bucket::TokenBucket): one private to the connection and one shared
//! by every connection of the listener. Both limits can be replaced at runtime
//! without dropping a single connection.
//!
//! No fairness is guaranteed between connections waiting on the shared bucket:
//! whichever happens to check first when tokens accrue gets them.

#![deny(missing_docs)]

pub mod bucket;
pub mod connection;
pub mod limits;
pub mod listener;
pub mod registry;
