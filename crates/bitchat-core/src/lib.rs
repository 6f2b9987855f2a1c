//! # BitChat Core Library
//!
//! Protocol core of a serverless mesh messenger. Devices exchange short
//! signed or end-to-end encrypted packets by flooding them through whatever
//! peers happen to be reachable, with a hop limit and duplicate suppression.
//!
//! ## Core Guarantees
//!
//! - No central server; every node relays for every other node
//! - Private messages are encrypted with keys from a Noise XX handshake
//! - Packet signatures authenticate the original sender across relays
//! - Packets are padded to fixed sizes to blunt traffic analysis
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        engine (actor, events)           │
//! ├──────────────┬──────────────┬───────────┤
//! │   protocol   │    noise     │ transport │
//! ├──────────────┴──────┬───────┴───────────┤
//! │  identity  │ storage │  bloom           │
//! ├─────────────────────┴───────────────────┤
//! │                crypto                   │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod bloom;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod noise;
pub mod protocol;
pub mod storage;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{spawn, EngineEvent, EngineHandle, ProtocolEngine};
pub use error::{Error, Result};
pub use identity::{Identity, PeerId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard upper bound on packet TTL. Larger values are clamped when relaying.
pub const MAX_TTL: u8 = 16;
