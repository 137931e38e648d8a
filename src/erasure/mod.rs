//! Erasure coding engine
//!
//! Splits a payload into k data and m parity fragments with systematic
//! Reed-Solomon coding, and rebuilds it from any k of them.
//!
//! The engine is synchronous and never touches the network.

pub mod config;
pub mod encoder;
pub mod stripe;

pub use config::{ErasureConfig, DEFAULT_FRAGMENT_THRESHOLD, MAX_TOTAL_FRAGMENTS};
pub use encoder::{EncodedFile, Encoder, Fragment, FragmentRole};
pub use stripe::StripePlanner;
