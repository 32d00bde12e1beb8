//! Upstream connection establishment
//!
//! Dials the remote IMAP server for an account (plain TCP, implicit TLS,
//! or STARTTLS), validates the server greeting, and logs in with the
//! account's remote credentials under the proxy's own tag.
//!
//! Dialing sits behind the [`Dial`] trait so sessions can be tested
//! against an in-memory upstream; [`TcpDialer`] is the real
//! implementation installed by the server.

use crate::command::trim_crlf;
use crate::config::Account;
use crate::error::{Error, Result};
use crate::lines::LineReader;
use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Tag used for commands the proxy issues on its own behalf.
pub const PROXY_TAG: &str = "proxy0";

/// Any stream a session can proxy to.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// An established upstream connection, split into its two halves. The
/// reader owns all buffering; it is positioned just after the server
/// greeting when returned by a dialer.
pub struct Upstream {
    pub reader: LineReader<ReadHalf<BoxedStream>>,
    pub writer: WriteHalf<BoxedStream>,
}

impl Upstream {
    /// Split a duplex stream into an `Upstream`, reader at the start.
    #[must_use]
    pub fn from_stream(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: LineReader::new(read_half),
            writer: write_half,
        }
    }
}

/// Capability to establish an upstream connection for an account.
pub trait Dial: Send + Sync {
    /// Connect, validate the greeting, and return the stream with its
    /// reader positioned immediately after the greeting line.
    fn dial<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Upstream>>;
}

/// Real dialer: TCP, with optional implicit TLS or STARTTLS upgrade.
#[derive(Debug, Default)]
pub struct TcpDialer;

impl Dial for TcpDialer {
    fn dial<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<Upstream>> {
        Box::pin(dial_tcp(account))
    }
}

async fn dial_tcp(account: &Account) -> Result<Upstream> {
    let addr = format!("{}:{}", account.remote_host, account.remote_port);
    debug!("connecting to upstream at {}", addr);

    let stream: BoxedStream = if account.remote_tls {
        let tcp = TcpStream::connect(&addr).await?;
        Box::new(tls_handshake(account, tcp).await?)
    } else if account.remote_starttls {
        let tcp = starttls_negotiate(&addr).await?;
        Box::new(tls_handshake(account, tcp).await?)
    } else {
        Box::new(TcpStream::connect(&addr).await?)
    };

    let mut upstream = Upstream::from_stream(stream);

    let greeting = upstream
        .reader
        .read_line()
        .await?
        .ok_or_else(|| Error::Upstream("connection closed before greeting".to_string()))?;
    if !greeting.starts_with(b"* OK") && !greeting.starts_with(b"* PREAUTH") {
        return Err(Error::Upstream(format!(
            "unexpected greeting: {}",
            String::from_utf8_lossy(trim_crlf(&greeting))
        )));
    }

    Ok(upstream)
}

/// Plaintext STARTTLS negotiation: read the greeting, request the
/// upgrade, and hand back the raw socket ready for the TLS handshake.
async fn starttls_negotiate(addr: &str) -> Result<TcpStream> {
    let tcp = TcpStream::connect(addr).await?;
    let mut reader = BufReader::new(tcp);

    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(Error::Upstream(
            "starttls: connection closed before greeting".to_string(),
        ));
    }

    reader
        .get_mut()
        .write_all(format!("{PROXY_TAG} STARTTLS\r\n").as_bytes())
        .await?;
    reader.get_mut().flush().await?;

    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(Error::Upstream(
            "starttls: connection closed before response".to_string(),
        ));
    }
    if !contains(&line, b" OK") {
        return Err(Error::Upstream(format!(
            "starttls: server rejected: {}",
            String::from_utf8_lossy(trim_crlf(&line))
        )));
    }

    // The server stays silent until our ClientHello, so the buffer is
    // empty and the raw socket can be recovered for the handshake.
    Ok(reader.into_inner())
}

async fn tls_handshake(
    account: &Account,
    tcp: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let connector = tls_connector(account)?;
    let server_name = ServerName::try_from(account.remote_host.clone())
        .map_err(|e| Error::Tls(format!("invalid server name: {e}")))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Tls(e.to_string()))
}

fn tls_connector(account: &Account) -> Result<TlsConnector> {
    let config = if account.remote_tls_insecure {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
            .with_no_client_auth()
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        let rustls_native_certs::CertificateResult { certs, errors, .. } =
            rustls_native_certs::load_native_certs();
        if let Some(err) = errors.into_iter().next() {
            return Err(Error::Tls(format!("load system root certificates: {err}")));
        }
        let _ = root_store.add_parsable_certificates(certs);
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth()
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Log in to an already-dialed upstream with the account's remote
/// credentials. Reads until the proxy-tagged response arrives; untagged
/// lines before it are ignored.
///
/// # Errors
///
/// Returns `Error::Upstream` if the server closes early or answers the
/// LOGIN with anything but OK.
pub async fn login_upstream(upstream: &mut Upstream, account: &Account) -> Result<()> {
    let command = format!(
        "{PROXY_TAG} LOGIN {} {}\r\n",
        quote_string(&account.remote_user),
        quote_string(&account.remote_password),
    );
    upstream.writer.write_all(command.as_bytes()).await?;
    upstream.writer.flush().await?;

    loop {
        let line = upstream.reader.read_line().await?.ok_or_else(|| {
            Error::Upstream("login: connection closed before tagged response".to_string())
        })?;
        if line.starts_with(format!("{PROXY_TAG} ").as_bytes()) {
            if contains(&line, b" OK") {
                return Ok(());
            }
            return Err(Error::Upstream(format!(
                "login failed: {}",
                String::from_utf8_lossy(trim_crlf(&line))
            )));
        }
    }
}

/// Quote a string per RFC 3501: wrap in double quotes, escaping `\` and `"`.
#[must_use]
pub fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '\\' || c == '"' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// Certificate verifier that accepts all certificates, for upstreams
/// with self-signed certificates (`remote_tls_insecure`).
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
