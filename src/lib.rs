//! Read-only IMAP proxy library
//!
//! Sits between IMAP clients and upstream IMAP servers. A client logs in
//! with a local credential pair; the proxy maps it to a configured
//! upstream account, dials out (plain, TLS, or STARTTLS), logs in with
//! the real credentials, and from then on forwards traffic both ways --
//! enforcing a read-only policy on the wire:
//!
//! - mutating verbs (STORE, COPY, APPEND, ...) are rejected locally,
//! - `SELECT` is rewritten to `EXAMINE`,
//! - LIST/LSUB responses for hidden folders are suppressed,
//! - named folders can be opted back into writes per account.
//!
//! The upstream dialer is a trait ([`Dial`]) so sessions can run against
//! in-memory streams in tests; [`TcpDialer`] is the production
//! implementation.

mod command;
mod config;
mod error;
mod filter;
mod lines;
mod literal;
mod response;
mod server;
mod session;
mod upstream;

pub use config::{Account, Config, ServerConfig};
pub use error::{Error, Result};
pub use lines::LineReader;
pub use server::Server;
pub use session::Session;
pub use upstream::{
    login_upstream, quote_string, AsyncStream, BoxedStream, Dial, TcpDialer, Upstream, PROXY_TAG,
};
