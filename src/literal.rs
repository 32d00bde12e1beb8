//! IMAP literal detection
//!
//! A command line may announce an octet-counted payload with a trailing
//! `{N}` (synchronizing) or `{N+}` (non-synchronizing, LITERAL+). The
//! announced bytes follow the line on the wire and must be transferred
//! before the next line is read.

use crate::command::trim_crlf;

/// A literal announced at the end of a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Literal {
    pub count: u64,
    /// `{N+}`: the sender transmits immediately, without waiting for a
    /// `+` continuation.
    pub non_sync: bool,
}

/// Scan a line (terminator included or not) for a trailing literal
/// declaration.
#[must_use]
pub fn parse_literal(line: &[u8]) -> Option<Literal> {
    let data = trim_crlf(line);
    if data.is_empty() || data[data.len() - 1] != b'}' {
        return None;
    }

    let close = data.len() - 1;
    let open = data[..close].iter().rposition(|&b| b == b'{')?;

    let mut inner = &data[open + 1..close];
    if inner.is_empty() {
        return None;
    }

    let non_sync = inner[inner.len() - 1] == b'+';
    if non_sync {
        inner = &inner[..inner.len() - 1];
        if inner.is_empty() {
            return None;
        }
    }

    let count = std::str::from_utf8(inner).ok()?.parse::<u64>().ok()?;
    Some(Literal { count, non_sync })
}
