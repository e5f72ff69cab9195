//! Wire formats for probes and replies
//!
//! Everything in here is pure: no sockets, no clocks.

pub mod checksum;
pub mod codec;
