//! # parley-shared
//!
//! Types shared by every Parley crate: identifiers, the realtime wire
//! protocol, identity-provider access tokens and constants.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod token;
pub mod types;

pub use error::{ProtocolError, TokenError};
