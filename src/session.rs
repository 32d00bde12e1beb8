//! Per-connection session engine
//!
//! One `Session` per accepted client connection. The lifecycle is:
//! greeting, pre-auth command loop (CAPABILITY / NOOP / LOGOUT / LOGIN),
//! upstream dial + login on a successful LOGIN, then two concurrent
//! forwarders until either peer goes away:
//!
//! - client -> upstream: parse each command line, apply the read-only
//!   filter plus the per-account folder policy, and forward or reject.
//!   Literal payloads announced by a forwarded line are copied through
//!   in lockstep; literals on rejected lines are drained.
//! - upstream -> client: forward every line, suppressing LIST/LSUB
//!   entries for hidden folders, again transferring literals in lockstep.
//!
//! Teardown drops both stream halves exactly once, whichever direction
//! finished first.

use crate::command::{parse_command, trim_crlf, Command};
use crate::config::{Account, Config};
use crate::filter::{filter, Decision};
use crate::lines::LineReader;
use crate::literal::parse_literal;
use crate::response::parse_list_response;
use crate::upstream::{login_upstream, AsyncStream, BoxedStream, Dial, Upstream};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const GREETING: &[u8] = b"* OK imap-proxy ready\r\n";
const BYE: &[u8] = b"* BYE imap-proxy logging out\r\n";
const CAPABILITY: &[u8] = b"* CAPABILITY IMAP4rev1 IDLE LITERAL+\r\n";

pub struct Session<C: AsyncStream> {
    client_reader: LineReader<ReadHalf<C>>,
    client_writer: WriteHalf<C>,
    config: Arc<Config>,
    dialer: Arc<dyn Dial>,
}

impl<C: AsyncStream> Session<C> {
    pub fn new(client: C, config: Arc<Config>, dialer: Arc<dyn Dial>) -> Self {
        let (read_half, write_half) = tokio::io::split(client);
        Self {
            client_reader: LineReader::new(read_half),
            client_writer: write_half,
            config,
            dialer,
        }
    }

    /// Run the session to completion: greeting, pre-auth loop, and (after
    /// a successful LOGIN) the bidirectional forwarding phase.
    pub async fn run(mut self) {
        if write_flush(&mut self.client_writer, GREETING).await.is_err() {
            debug!("failed to send greeting");
            return;
        }

        let (account, upstream) = loop {
            let line = match self.client_reader.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("client disconnected before login");
                    return;
                }
                Err(e) => {
                    debug!("read from client failed: {e}");
                    return;
                }
            };

            let Ok(cmd) = parse_command(&line) else {
                let tag = best_effort_tag(&line);
                if self
                    .reply(&tagged(tag, "BAD command not recognized"))
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            };

            let result = match cmd.verb.as_str() {
                "CAPABILITY" => {
                    let mut response = CAPABILITY.to_vec();
                    response.extend_from_slice(&tagged(&cmd.tag, "OK CAPABILITY completed"));
                    self.reply(&response).await.map(|()| None)
                }
                "NOOP" => self.reply(&tagged(&cmd.tag, "OK NOOP completed")).await.map(|()| None),
                "LOGOUT" => {
                    let mut response = BYE.to_vec();
                    response.extend_from_slice(&tagged(&cmd.tag, "OK LOGOUT completed"));
                    let _ = self.reply(&response).await;
                    return;
                }
                "LOGIN" => self.handle_login(&cmd).await,
                _ => self
                    .reply(&tagged(&cmd.tag, "BAD command not recognized"))
                    .await
                    .map(|()| None),
            };

            match result {
                Ok(Some(bound)) => break bound,
                Ok(None) => {}
                Err(e) => {
                    debug!("write to client failed: {e}");
                    return;
                }
            }
        };

        run_authenticated(
            self.client_reader,
            self.client_writer,
            account,
            upstream,
        )
        .await;
    }

    /// Process a LOGIN command. On success returns the bound account and
    /// the authenticated upstream; on any failure the client sees only
    /// `NO LOGIN failed` and stays unauthenticated.
    async fn handle_login(&mut self, cmd: &Command) -> io::Result<Option<(Account, Upstream)>> {
        let reject = tagged(&cmd.tag, "NO LOGIN failed");

        let Some((user, password)) = parse_login_args(&cmd.raw) else {
            warn!("LOGIN arguments unparseable");
            self.reply(&reject).await?;
            return Ok(None);
        };

        let Some(account) = self.config.lookup_user(&user).cloned() else {
            warn!(user = %user, "LOGIN for unknown user");
            self.reply(&reject).await?;
            return Ok(None);
        };

        if account.local_password != password {
            warn!(user = %user, "LOGIN with wrong password");
            self.reply(&reject).await?;
            return Ok(None);
        }

        let dialed = self.dialer.dial(&account).await;
        let mut upstream = match dialed {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(user = %user, "upstream dial failed: {e}");
                self.reply(&reject).await?;
                return Ok(None);
            }
        };

        if let Err(e) = login_upstream(&mut upstream, &account).await {
            warn!(user = %user, "upstream login failed: {e}");
            drop(upstream);
            self.reply(&reject).await?;
            return Ok(None);
        }

        info!(user = %user, "login successful");
        self.reply(&tagged(&cmd.tag, "OK LOGIN completed")).await?;
        Ok(Some((account, upstream)))
    }

    async fn reply(&mut self, bytes: &[u8]) -> io::Result<()> {
        write_flush(&mut self.client_writer, bytes).await
    }
}

/// The post-authentication phase: both forwarders race; when either
/// returns, the other is cancelled and all four stream halves drop here,
/// closing each stream exactly once.
async fn run_authenticated<C: AsyncStream>(
    client_reader: LineReader<ReadHalf<C>>,
    client_writer: WriteHalf<C>,
    account: Account,
    upstream: Upstream,
) {
    let account = Arc::new(account);
    let client_writer = Arc::new(Mutex::new(client_writer));

    let downstream = upstream_to_client(upstream.reader, Arc::clone(&client_writer), Arc::clone(&account));
    let upstream_bound = client_to_upstream(
        client_reader,
        upstream.writer,
        Arc::clone(&client_writer),
        Arc::clone(&account),
    );

    tokio::select! {
        () = downstream => debug!("upstream side closed"),
        () = upstream_bound => debug!("client side closed"),
    }
}

/// Upstream -> client forwarder. Suppresses LIST/LSUB responses for
/// hidden folders; literals on suppressed lines are drained so the wire
/// stays in lockstep.
async fn upstream_to_client<C: AsyncStream>(
    mut upstream_reader: LineReader<ReadHalf<BoxedStream>>,
    client_writer: Arc<Mutex<WriteHalf<C>>>,
    account: Arc<Account>,
) {
    loop {
        let line = match upstream_reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!("read from upstream failed: {e}");
                return;
            }
        };

        let suppressed = account.has_folder_filter()
            && parse_list_response(&line).is_some_and(|mailbox| !account.folder_allowed(&mailbox));

        if !suppressed {
            let mut writer = client_writer.lock().await;
            if let Err(e) = write_flush(&mut *writer, &line).await {
                debug!("write to client failed: {e}");
                return;
            }
        }

        if let Some(literal) = parse_literal(&line) {
            let result = if suppressed {
                upstream_reader.discard(literal.count).await
            } else {
                let mut writer = client_writer.lock().await;
                upstream_reader.copy_to(&mut *writer, literal.count).await
            };
            if let Err(e) = result {
                debug!("transfer of upstream literal failed: {e}");
                return;
            }
        }
    }
}

/// Client -> upstream forwarder: the post-auth command loop.
async fn client_to_upstream<C: AsyncStream>(
    mut client_reader: LineReader<ReadHalf<C>>,
    mut upstream_writer: WriteHalf<BoxedStream>,
    client_writer: Arc<Mutex<WriteHalf<C>>>,
    account: Arc<Account>,
) {
    let mut selected_folder: Option<Vec<u8>> = None;

    loop {
        let line = match client_reader.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                debug!("read from client failed: {e}");
                return;
            }
        };

        let cmd = match parse_command(&line) {
            Ok(cmd) => cmd,
            Err(_) => {
                // Unparseable lines may be continuation data of an
                // earlier exchange; forward them untouched.
                if write_flush(&mut upstream_writer, &line).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if cmd.verb == "IDLE" {
            if let Err(e) = forward_idle(&mut client_reader, &mut upstream_writer, &line).await {
                debug!("IDLE forwarding failed: {e}");
                return;
            }
            continue;
        }

        // LOGOUT is answered locally; returning here tears the session
        // down without waiting on the upstream.
        if cmd.verb == "LOGOUT" {
            let mut response = BYE.to_vec();
            response.extend_from_slice(&tagged(&cmd.tag, "OK LOGOUT completed"));
            let mut writer = client_writer.lock().await;
            let _ = write_flush(&mut *writer, &response).await;
            return;
        }

        let mut decision = filter(&cmd);
        apply_writable_override(&mut decision, &cmd, &account, selected_folder.as_deref());

        match decision {
            Decision::Block(reject) => {
                warn!(verb = %cmd.verb, sub_verb = %cmd.sub_verb, "blocked command");
                {
                    let mut writer = client_writer.lock().await;
                    if write_flush(&mut *writer, &reject).await.is_err() {
                        return;
                    }
                }
                // A non-sync literal is already on the wire; drain it.
                // A sync literal was never solicited, so there is
                // nothing to consume.
                if let Some(literal) = parse_literal(&line) {
                    if literal.non_sync && client_reader.discard(literal.count).await.is_err() {
                        return;
                    }
                }
            }
            allow_or_rewrite => {
                if folder_gate_blocked(&cmd, &account) {
                    let mut writer = client_writer.lock().await;
                    if write_flush(&mut *writer, &tagged(&cmd.tag, "NO folder not available"))
                        .await
                        .is_err()
                    {
                        return;
                    }
                    continue;
                }

                let outgoing = match allow_or_rewrite {
                    Decision::Rewrite(rewritten) => {
                        debug!(verb = %cmd.verb, "rewrote command");
                        rewritten
                    }
                    _ => line.clone(),
                };
                if let Err(e) =
                    forward_with_literals(&mut client_reader, &mut upstream_writer, outgoing).await
                {
                    debug!("forward to upstream failed: {e}");
                    return;
                }

                if cmd.verb == "SELECT" || cmd.verb == "EXAMINE" {
                    if let Some(mailbox) = command_mailbox(&cmd) {
                        selected_folder = Some(mailbox);
                    }
                }
            }
        }
    }
}

/// Forward a line upstream, then keep the literal dance going: every
/// forwarded line that announces a literal is followed by exactly that
/// many client bytes and one more line, until a line announces none.
async fn forward_with_literals<C: AsyncStream>(
    client_reader: &mut LineReader<ReadHalf<C>>,
    upstream_writer: &mut WriteHalf<BoxedStream>,
    mut line: Vec<u8>,
) -> io::Result<()> {
    loop {
        let literal = parse_literal(&line);
        write_flush(upstream_writer, &line).await?;

        let Some(literal) = literal else {
            return Ok(());
        };
        client_reader.copy_to(upstream_writer, literal.count).await?;

        line = client_reader.read_line().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "client closed inside literal sequence")
        })?;
    }
}

/// Forward the IDLE command and everything after it until the client
/// sends `DONE`. The `+` continuation and pushed untagged responses
/// travel through the upstream -> client forwarder meanwhile.
async fn forward_idle<C: AsyncStream>(
    client_reader: &mut LineReader<ReadHalf<C>>,
    upstream_writer: &mut WriteHalf<BoxedStream>,
    idle_line: &[u8],
) -> io::Result<()> {
    write_flush(upstream_writer, idle_line).await?;

    loop {
        let line = client_reader.read_line().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "client closed during IDLE")
        })?;
        write_flush(upstream_writer, &line).await?;
        if trim_crlf(&line).eq_ignore_ascii_case(b"DONE") {
            return Ok(());
        }
    }
}

/// Session-level relaxation of the pure filter for writable folders.
/// Only ever downgrades: Rewrite -> Allow for SELECT of a writable
/// mailbox, Block -> Allow for STORE / UID STORE in a writable selected
/// folder and for APPEND targeting a writable mailbox.
fn apply_writable_override(
    decision: &mut Decision,
    cmd: &Command,
    account: &Account,
    selected_folder: Option<&[u8]>,
) {
    if account.writable_folders.is_empty() {
        return;
    }

    match decision {
        Decision::Rewrite(_) if cmd.verb == "SELECT" => {
            if command_mailbox(cmd).is_some_and(|mailbox| account.folder_writable(&mailbox)) {
                *decision = Decision::Allow;
            }
        }
        Decision::Block(_) => {
            let writable = match (cmd.verb.as_str(), cmd.sub_verb.as_str()) {
                ("STORE", _) | ("UID", "STORE") => {
                    selected_folder.is_some_and(|folder| account.folder_writable(folder))
                }
                ("APPEND", _) => {
                    command_mailbox(cmd).is_some_and(|mailbox| account.folder_writable(&mailbox))
                }
                _ => false,
            };
            if writable {
                *decision = Decision::Allow;
            }
        }
        _ => {}
    }
}

/// Local rejection for SELECT/EXAMINE/STATUS on folders hidden by the
/// account's allow/block lists. Nothing reaches the upstream.
fn folder_gate_blocked(cmd: &Command, account: &Account) -> bool {
    if !account.has_folder_filter() {
        return false;
    }
    if !matches!(cmd.verb.as_str(), "SELECT" | "EXAMINE" | "STATUS") {
        return false;
    }
    match command_mailbox(cmd) {
        Some(mailbox) if !mailbox.is_empty() => !account.folder_allowed(&mailbox),
        _ => false,
    }
}

/// The mailbox argument of commands shaped `tag VERB mailbox ...`.
fn command_mailbox(cmd: &Command) -> Option<Vec<u8>> {
    let data = trim_crlf(&cmd.raw);
    let mut parts = data.splitn(3, |&b| b == b' ');
    parts.next()?;
    parts.next()?;
    let args = parts.next()?;
    if args.is_empty() {
        return None;
    }
    let (mailbox, _) = parse_one_arg(args)?;
    Some(mailbox)
}

/// Extract `user` and `password` from a LOGIN command line.
fn parse_login_args(raw: &[u8]) -> Option<(String, String)> {
    let data = trim_crlf(raw);
    let mut parts = data.splitn(3, |&b| b == b' ');
    parts.next()?;
    parts.next()?;
    let args = trim_spaces(parts.next()?);
    if args.is_empty() {
        return None;
    }

    let (user, rest) = parse_one_arg(args)?;
    let rest = trim_spaces(rest);
    if rest.is_empty() {
        return None;
    }
    let (password, _) = parse_one_arg(rest)?;

    Some((
        String::from_utf8(user).ok()?,
        String::from_utf8(password).ok()?,
    ))
}

/// Take one argument off the front of `input`. A leading `"` starts a
/// quoted string running to the next unescaped `"`, decoding `\"` and
/// `\\`; anything else runs to the next space or end of input.
fn parse_one_arg(input: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    if input.first() == Some(&b'"') {
        let mut value = Vec::new();
        let mut i = 1;
        while i < input.len() {
            match input[i] {
                b'\\' if i + 1 < input.len() && matches!(input[i + 1], b'"' | b'\\') => {
                    value.push(input[i + 1]);
                    i += 2;
                }
                b'"' => return Some((value, &input[i + 1..])),
                b => {
                    value.push(b);
                    i += 1;
                }
            }
        }
        return None;
    }

    if input.is_empty() {
        return None;
    }
    match input.iter().position(|&b| b == b' ') {
        Some(i) => Some((input[..i].to_vec(), &input[i + 1..])),
        None => Some((input.to_vec(), &input[input.len()..])),
    }
}

/// The tag to use in a BAD response to an unparseable line: the first
/// token, or the whole trimmed line, or `*`.
fn best_effort_tag(line: &[u8]) -> &[u8] {
    let trimmed = trim_spaces(trim_crlf(line));
    if let Some(i) = trimmed.iter().position(|&b| b == b' ') {
        if i > 0 {
            return &trimmed[..i];
        }
    }
    if !trimmed.is_empty() {
        return trimmed;
    }
    b"*"
}

fn trim_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().take_while(|&&b| b == b' ').count();
    let end = bytes.len() - bytes[start..].iter().rev().take_while(|&&b| b == b' ').count();
    &bytes[start..end]
}

fn tagged(tag: &[u8], text: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(tag.len() + text.len() + 3);
    line.extend_from_slice(tag);
    line.push(b' ');
    line.extend_from_slice(text.as_bytes());
    line.extend_from_slice(b"\r\n");
    line
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
