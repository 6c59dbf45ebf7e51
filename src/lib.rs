//! A sans-pool PostgreSQL wire-protocol driver core.
//!
//! This crate speaks the PostgreSQL frontend/backend protocol (version 3)
//! over an authenticated, optionally TLS-upgraded TCP session. It owns the
//! connection state machine, the framed byte buffer, the message codec, and
//! transaction-status tracking — the pieces every higher-level API (command
//! objects, row decoders, pooling, transactions) is built on. It does not
//! itself provide a connection pool, a SQL parser, or typed row decoding;
//! those are external collaborators layered on top.
//!
//! # Example
//!
//! ```no_run
//! use pg_core_driver::{Connector, Opts};
//!
//! fn main() -> pg_core_driver::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "postgres".into(),
//!         database: Some("mydb".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let mut conn = Connector::open(&opts)?;
//!     conn.add_query("SELECT 1")?;
//!     conn.send_all()?;
//!     conn.close()?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod buffer;
pub mod connector;
pub mod error;
pub mod feature;
pub mod notify;
pub mod opts;
pub mod protocol;
pub mod transport;

#[cfg(feature = "tokio")]
pub mod tokio_connector;

pub use auth::SaslProvider;
pub use connector::{Connector, ConnectorState, Message, TransactionStatus};
pub use error::{Error, Result, ServerError};
pub use feature::ServerFeatures;
pub use notify::{NotificationBlock, NotificationBlockGuard, NotificationHandler};
pub use opts::{Opts, ServerCompatibilityMode, SslMode};

#[cfg(feature = "tokio")]
pub use tokio_connector::AsyncConnector;
