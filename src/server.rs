//! TCP listener and session dispatch
//!
//! Accepts client connections and runs one [`Session`] task per
//! connection. Dropping the server (or the future driving `serve`) stops
//! accepting; live sessions run until their own I/O ends.

use crate::config::Config;
use crate::error::Result;
use crate::session::Session;
use crate::upstream::{Dial, TcpDialer};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, info_span, Instrument};

pub struct Server {
    config: Arc<Config>,
    dialer: Arc<dyn Dial>,
}

impl Server {
    /// A server that dials upstreams over real TCP/TLS.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_dialer(config, Arc::new(TcpDialer))
    }

    /// A server with an injected dialer.
    #[must_use]
    pub fn with_dialer(config: Arc<Config>, dialer: Arc<dyn Dial>) -> Self {
        Self { config, dialer }
    }

    /// Bind the configured listen address and serve.
    ///
    /// # Errors
    ///
    /// Returns the bind or accept error that stopped the loop.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.server.listen).await?;
        info!(listen = %self.config.server.listen, "listening");
        self.serve(listener).await
    }

    /// Accept connections on `listener`, spawning one task per session.
    ///
    /// # Errors
    ///
    /// Returns when `accept` fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(client = %peer, "new connection");
            let session = Session::new(stream, Arc::clone(&self.config), Arc::clone(&self.dialer));
            tokio::spawn(session.run().instrument(info_span!("session", client = %peer)));
        }
    }
}
