//! IMAP command-line parser
//!
//! The proxy never parses the full IMAP grammar. It only needs the tag,
//! the verb, and (for `UID`) the sub-verb to make a policy decision; the
//! original bytes are kept so allowed commands can be forwarded untouched.

use thiserror::Error;

/// One parsed client command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Client-chosen tag, raw bytes. Empty only for the tagless `DONE`.
    pub tag: Vec<u8>,
    /// Uppercased verb, e.g. `SELECT` or `UID`.
    pub verb: String,
    /// Uppercased sub-verb for `UID` commands, empty otherwise.
    pub sub_verb: String,
    /// The original line including its terminator.
    pub raw: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("missing tag")]
    MissingTag,
    #[error("missing verb")]
    MissingVerb,
}

/// Parse an IMAP command line. The line may include its trailing CRLF.
///
/// # Errors
///
/// Returns `ParseError` for an empty line or a line without a usable tag
/// or verb. A single space-free token parses only as the tagless `DONE`
/// continuation.
pub fn parse_command(line: &[u8]) -> Result<Command, ParseError> {
    if line.is_empty() {
        return Err(ParseError::Empty);
    }

    let raw = line.to_vec();
    let data = trim_crlf(line);
    if data.is_empty() {
        return Err(ParseError::Empty);
    }

    let Some(sp) = data.iter().position(|&b| b == b' ') else {
        // No space: the only valid verb-less line is the IDLE terminator.
        if data.eq_ignore_ascii_case(b"DONE") {
            return Ok(Command {
                tag: Vec::new(),
                verb: "DONE".to_string(),
                sub_verb: String::new(),
                raw,
            });
        }
        return Err(ParseError::MissingVerb);
    };

    let tag = &data[..sp];
    if tag.is_empty() {
        return Err(ParseError::MissingTag);
    }

    let rest = &data[sp + 1..];
    if rest.is_empty() {
        return Err(ParseError::MissingVerb);
    }

    let (verb_bytes, after_verb) = match rest.iter().position(|&b| b == b' ') {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, &rest[rest.len()..]),
    };
    if verb_bytes.is_empty() {
        return Err(ParseError::MissingVerb);
    }
    let verb = uppercase(verb_bytes);

    let mut sub_verb = String::new();
    if verb == "UID" && !after_verb.is_empty() {
        let sub = match after_verb.iter().position(|&b| b == b' ') {
            Some(i) => &after_verb[..i],
            None => after_verb,
        };
        sub_verb = uppercase(sub);
    }

    Ok(Command {
        tag: tag.to_vec(),
        verb,
        sub_verb,
        raw,
    })
}

/// Strip trailing CR and LF bytes.
pub(crate) fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn uppercase(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).to_ascii_uppercase()
}
