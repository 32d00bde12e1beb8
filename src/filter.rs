//! Read-only policy filter
//!
//! A pure function from one parsed command to a decision. Session state
//! (selected folder, writable folders) is applied afterwards by the
//! session, which may downgrade a `Block` or `Rewrite` to `Allow`.

use crate::command::Command;

/// What to do with a client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Forward the original line to upstream.
    Allow,
    /// Reject locally with this fully formed response line.
    Block(Vec<u8>),
    /// Forward this replacement line instead of the original.
    Rewrite(Vec<u8>),
}

/// Verbs that mutate mailbox state.
const BLOCKED_VERBS: &[&str] = &[
    "STORE",
    "COPY",
    "MOVE",
    "DELETE",
    "EXPUNGE",
    "APPEND",
    "CREATE",
    "RENAME",
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "AUTHENTICATE",
];

/// UID sub-verbs that mutate mailbox state.
const BLOCKED_UID_SUB_VERBS: &[&str] = &["STORE", "COPY", "MOVE", "EXPUNGE"];

/// Decide whether to allow, block, or rewrite a command in read-only mode.
#[must_use]
pub fn filter(cmd: &Command) -> Decision {
    if cmd.verb == "UID" {
        if BLOCKED_UID_SUB_VERBS.contains(&cmd.sub_verb.as_str()) {
            return Decision::Block(reject_line(
                &cmd.tag,
                "UID subcommand not allowed in read-only mode",
            ));
        }
        return Decision::Allow;
    }

    if BLOCKED_VERBS.contains(&cmd.verb.as_str()) {
        return Decision::Block(reject_line(
            &cmd.tag,
            &format!("{} not allowed in read-only mode", cmd.verb),
        ));
    }

    if cmd.verb == "SELECT" {
        // Positional rewrite: the verb occupies exactly 6 bytes right
        // after "tag ". Tag prefix and argument suffix stay byte-exact.
        let verb_start = cmd.tag.len() + 1;
        let verb_end = verb_start + "SELECT".len();
        let mut rewritten = Vec::with_capacity(cmd.raw.len() + 1);
        rewritten.extend_from_slice(&cmd.raw[..verb_start]);
        rewritten.extend_from_slice(b"EXAMINE");
        rewritten.extend_from_slice(&cmd.raw[verb_end..]);
        return Decision::Rewrite(rewritten);
    }

    Decision::Allow
}

fn reject_line(tag: &[u8], reason: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(tag.len() + reason.len() + 6);
    line.extend_from_slice(tag);
    line.extend_from_slice(b" NO ");
    line.extend_from_slice(reason.as_bytes());
    line.extend_from_slice(b"\r\n");
    line
}
