//! Scripted in-memory upstream for integration testing
//!
//! `ScriptedDialer` implements the proxy's [`Dial`] seam over a
//! `tokio::io::duplex` pair: each dial spawns a task speaking just
//! enough IMAP to exercise a session end-to-end. The fake accepts the
//! proxy's LOGIN, answers LIST/LSUB with a canned folder listing,
//! consumes APPEND literals, plays the IDLE continuation game, and
//! echoes a tagged OK for everything else. Every line it receives is
//! published on a channel so tests can assert exactly what reached the
//! upstream -- and what never did.

#![allow(dead_code)]

use futures::future::BoxFuture;
use imap_proxy::{Account, BoxedStream, Config, Dial, ServerConfig, Session, Upstream};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

/// LIST responses served by the fake upstream.
pub const FOLDER_LIST: [&str; 7] = [
    r#"* LIST (\HasNoChildren) "/" "INBOX""#,
    r#"* LIST (\HasNoChildren) "/" "Sent""#,
    r#"* LIST (\HasNoChildren) "/" "Drafts""#,
    r#"* LIST (\HasChildren) "/" "Archive""#,
    r#"* LIST (\HasNoChildren) "/" "Archive/2024""#,
    r#"* LIST (\HasNoChildren) "/" "Trash""#,
    r#"* LIST (\HasNoChildren) "/" "Spam""#,
];

/// The account every test session logs in with.
pub fn test_config(modify: impl FnOnce(&mut Account)) -> Config {
    let mut account = Account {
        local_user: "reader1".to_string(),
        local_password: "localpass1".to_string(),
        remote_host: "mail.example.com".to_string(),
        remote_port: 993,
        remote_user: "realuser@example.com".to_string(),
        remote_password: "realpass".to_string(),
        remote_tls: true,
        remote_starttls: false,
        remote_tls_insecure: false,
        allowed_folders: vec![],
        blocked_folders: vec![],
        writable_folders: vec![],
    };
    modify(&mut account);
    Config {
        server: ServerConfig {
            listen: "127.0.0.1:0".to_string(),
        },
        accounts: vec![account],
    }
}

/// Dialer handing out in-memory connections to the scripted upstream.
pub struct ScriptedDialer {
    received: mpsc::UnboundedSender<String>,
}

impl ScriptedDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { received: tx }), rx)
    }
}

impl Dial for ScriptedDialer {
    fn dial<'a>(&'a self, _account: &'a Account) -> BoxFuture<'a, imap_proxy::Result<Upstream>> {
        Box::pin(async move {
            let (proxy_side, server_side) = tokio::io::duplex(64 * 1024);
            tokio::spawn(run_fake_upstream(server_side, self.received.clone()));

            let mut upstream = Upstream::from_stream(Box::new(proxy_side) as BoxedStream);
            // Consume the greeting, like the real dialer does.
            upstream.reader.read_line().await?;
            Ok(upstream)
        })
    }
}

async fn run_fake_upstream(stream: DuplexStream, received: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(stream);

    if write_line(&mut reader, "* OK Fake IMAP server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    // LOGIN from the proxy, under its own tag.
    let Some(line) = read_line(&mut reader).await else {
        return;
    };
    let _ = received.send(trim(&line));
    let response = if line.to_uppercase().contains("LOGIN") {
        "proxy0 OK LOGIN completed\r\n"
    } else {
        "proxy0 NO unexpected command\r\n"
    };
    if write_line(&mut reader, response).await.is_err() {
        return;
    }

    // Post-auth command loop.
    loop {
        let Some(line) = read_line(&mut reader).await else {
            return;
        };
        let trimmed = trim(&line);
        let _ = received.send(trimmed.clone());
        let tag = trimmed.split(' ').next().unwrap_or("").to_string();
        let upper = trimmed.to_uppercase();

        if upper.contains(" IDLE") {
            if write_line(&mut reader, "+ idling\r\n").await.is_err() {
                return;
            }
            loop {
                let Some(done) = read_line(&mut reader).await else {
                    return;
                };
                if trim(&done).eq_ignore_ascii_case("DONE") {
                    let response = format!("{tag} OK IDLE terminated\r\n");
                    if write_line(&mut reader, &response).await.is_err() {
                        return;
                    }
                    break;
                }
            }
        } else if upper.contains(" LIST") {
            for entry in FOLDER_LIST {
                if write_line(&mut reader, &format!("{entry}\r\n")).await.is_err() {
                    return;
                }
            }
            let response = format!("{tag} OK LIST completed\r\n");
            if write_line(&mut reader, &response).await.is_err() {
                return;
            }
        } else if upper.contains(" LSUB") {
            for entry in FOLDER_LIST {
                let lsub = entry.replacen("* LIST", "* LSUB", 1);
                if write_line(&mut reader, &format!("{lsub}\r\n")).await.is_err() {
                    return;
                }
            }
            let response = format!("{tag} OK LSUB completed\r\n");
            if write_line(&mut reader, &response).await.is_err() {
                return;
            }
        } else if upper.contains(" APPEND") {
            if let Some(count) = literal_count(&trimmed) {
                let mut body = vec![0u8; count];
                if reader.read_exact(&mut body).await.is_err() {
                    return;
                }
                // Trailing line after the literal payload.
                if read_line(&mut reader).await.is_none() {
                    return;
                }
            }
            let response = format!("{tag} OK APPEND completed\r\n");
            if write_line(&mut reader, &response).await.is_err() {
                return;
            }
        } else if upper.contains(" LOGOUT") {
            let _ = write_line(&mut reader, "* BYE server logging out\r\n").await;
            let _ = write_line(&mut reader, &format!("{tag} OK LOGOUT completed\r\n")).await;
            return;
        } else {
            let response = format!("{tag} OK completed\r\n");
            if write_line(&mut reader, &response).await.is_err() {
                return;
            }
        }
    }
}

/// Byte count of a trailing `{N}` / `{N+}`, if any.
fn literal_count(line: &str) -> Option<usize> {
    let inner = line.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].trim_end_matches('+').parse().ok()
}

fn trim(line: &str) -> String {
    line.trim_end_matches(['\r', '\n']).to_string()
}

async fn read_line(reader: &mut BufReader<DuplexStream>) -> Option<String> {
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line),
    }
}

async fn write_line(reader: &mut BufReader<DuplexStream>, line: &str) -> std::io::Result<()> {
    reader.get_mut().write_all(line.as_bytes()).await?;
    reader.get_mut().flush().await
}

/// One proxy session wired to the scripted upstream, driven through an
/// in-memory client connection.
pub struct TestEnv {
    client: BufReader<DuplexStream>,
    received: mpsc::UnboundedReceiver<String>,
}

/// Spawn a session over duplex streams; `modify` adjusts the account
/// policy before the session starts.
pub fn start_session(modify: impl FnOnce(&mut Account)) -> TestEnv {
    let config = Arc::new(test_config(modify));
    let (dialer, received) = ScriptedDialer::new();
    let (client_side, proxy_side) = tokio::io::duplex(64 * 1024);

    let session = Session::new(proxy_side, config, dialer);
    tokio::spawn(session.run());

    TestEnv {
        client: BufReader::new(client_side),
        received,
    }
}

impl TestEnv {
    /// Read one response line from the proxy.
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.client.read_line(&mut line))
            .await
            .expect("timed out reading from proxy")
            .expect("read from proxy");
        assert!(n > 0, "proxy closed the connection");
        line
    }

    /// Send raw bytes to the proxy.
    pub async fn send(&mut self, data: &str) {
        self.client
            .get_mut()
            .write_all(data.as_bytes())
            .await
            .expect("write to proxy");
        self.client.get_mut().flush().await.expect("flush to proxy");
    }

    /// Read the greeting and complete a LOGIN as `reader1`.
    pub async fn login(&mut self) {
        let greeting = self.read_line().await;
        assert!(
            greeting.contains("* OK imap-proxy ready"),
            "unexpected greeting: {greeting:?}"
        );

        self.send("A001 LOGIN reader1 localpass1\r\n").await;
        let upstream_login = self.expect_upstream("LOGIN").await;
        assert!(
            upstream_login.starts_with("proxy0 LOGIN "),
            "got {upstream_login:?}"
        );
        assert!(
            upstream_login.contains("\"realuser@example.com\" \"realpass\""),
            "got {upstream_login:?}"
        );

        let response = self.read_line().await;
        assert!(
            response.contains("A001 OK LOGIN"),
            "expected LOGIN OK, got {response:?}"
        );
    }

    /// Wait for a command at the upstream containing `substring`
    /// (case-insensitive) and return it.
    pub async fn expect_upstream(&mut self, substring: &str) -> String {
        let cmd = timeout(Duration::from_secs(5), self.received.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for upstream command {substring:?}"))
            .expect("upstream channel closed");
        assert!(
            cmd.to_uppercase().contains(&substring.to_uppercase()),
            "expected upstream command containing {substring:?}, got {cmd:?}"
        );
        cmd
    }

    /// Assert nothing reaches the upstream within a short window.
    pub async fn no_upstream(&mut self) {
        if let Ok(Some(cmd)) = timeout(Duration::from_millis(50), self.received.recv()).await {
            panic!("unexpected upstream command: {cmd:?}");
        }
    }

    /// Read response lines until the tagged completion for `tag`.
    pub async fn read_until_tagged(&mut self, tag: &str) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await;
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                return lines;
            }
        }
    }
}
