//! PostgreSQL wire protocol implementation.
//!
//! This module contains the low-level protocol encoding and decoding. It has
//! no knowledge of sockets, TLS, or connector state — see [`crate::transport`]
//! and [`crate::connector`] for those.
//!
//! # Structure
//!
//! - `backend`: server → client messages (parsing)
//! - `frontend`: client → server messages (encoding)
//! - `codec`: low-level encoding/decoding primitives shared by both halves
//! - `types`: common protocol types (FormatCode, Oid, TransactionIndicator)

pub mod backend;
pub mod codec;
pub mod frontend;
pub mod types;

pub use backend::RawMessage;
pub use types::{FormatCode, Oid, TransactionIndicator};
