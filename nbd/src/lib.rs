//! NBD (Network Block Device) protocol implementation.
//!
//! This crate provides a pure Rust implementation of the client side of the
//! NBD protocol: fixed-newstyle negotiation, structured replies, meta
//! contexts (`base:allocation`, `qemu:dirty-bitmap:*`) and the read-side
//! transmission commands a backup reader needs.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! # Features
//!
//! - `server` - In-memory export server for tests and simulations

pub mod blocking;
mod client;
mod protocol;

#[cfg(any(test, feature = "server"))]
pub mod server;

pub use client::{NbdClient, NbdHandle};
pub use protocol::*;
