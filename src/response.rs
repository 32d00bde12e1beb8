//! LIST/LSUB response parsing
//!
//! The only server responses the proxy inspects are untagged LIST and
//! LSUB lines, of the form:
//!
//! ```text
//! * LIST (\HasNoChildren) "/" "INBOX"
//! ```
//!
//! The mailbox name is extracted so the session can suppress entries for
//! folders the account is not allowed to see.

use crate::command::trim_crlf;

/// Extract the mailbox name from an untagged LIST or LSUB response.
/// Returns `None` if the line is not a LIST/LSUB response.
#[must_use]
pub fn parse_list_response(line: &[u8]) -> Option<Vec<u8>> {
    let data = trim_crlf(line);

    if data.len() < 7 || data[0] != b'*' || data[1] != b' ' {
        return None;
    }
    let rest = &data[2..];

    // Verb: LIST or LSUB, case-insensitive, followed by a space.
    if rest.len() < 5 || rest[4] != b' ' {
        return None;
    }
    let verb = &rest[..4];
    if !verb.eq_ignore_ascii_case(b"LIST") && !verb.eq_ignore_ascii_case(b"LSUB") {
        return None;
    }
    let rest = trim_leading_spaces(&rest[5..]);

    // Parenthesized flag list.
    if rest.first() != Some(&b'(') {
        return None;
    }
    let close = rest.iter().position(|&b| b == b')')?;
    let rest = trim_leading_spaces(&rest[close + 1..]);

    // Hierarchy delimiter: quoted string or NIL.
    let rest = if rest.first() == Some(&b'"') {
        let end = rest[1..].iter().position(|&b| b == b'"')?;
        trim_leading_spaces(&rest[end + 2..])
    } else if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case(b"NIL") {
        trim_leading_spaces(&rest[3..])
    } else {
        return None;
    };

    // Mailbox name: quoted string (with \" and \\ escapes) or atom.
    if rest.is_empty() {
        return None;
    }
    if rest[0] == b'"' {
        let mut name = Vec::new();
        let mut i = 1;
        while i < rest.len() {
            match rest[i] {
                b'\\' if i + 1 < rest.len()
                    && (rest[i + 1] == b'"' || rest[i + 1] == b'\\') =>
                {
                    name.push(rest[i + 1]);
                    i += 2;
                }
                b'"' => return Some(name),
                b => {
                    name.push(b);
                    i += 1;
                }
            }
        }
        return None;
    }
    Some(rest.to_vec())
}

fn trim_leading_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().take_while(|&&b| b == b' ').count();
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mailbox(line: &[u8]) -> Option<Vec<u8>> {
        parse_list_response(line)
    }

    #[test]
    fn quoted_mailbox() {
        assert_eq!(
            mailbox(b"* LIST (\\HasNoChildren) \"/\" \"INBOX\"\r\n"),
            Some(b"INBOX".to_vec())
        );
    }

    #[test]
    fn nested_mailbox() {
        assert_eq!(
            mailbox(b"* LIST () \"/\" \"Archive/2024\"\r\n"),
            Some(b"Archive/2024".to_vec())
        );
    }

    #[test]
    fn lsub_response() {
        assert_eq!(mailbox(b"* LSUB () \"/\" \"Sent\"\r\n"), Some(b"Sent".to_vec()));
    }

    #[test]
    fn empty_quoted_mailbox() {
        assert_eq!(
            mailbox(b"* LIST (\\Noselect) \"/\" \"\"\r\n"),
            Some(Vec::new())
        );
    }

    #[test]
    fn atom_mailbox() {
        assert_eq!(mailbox(b"* LIST () \"/\" INBOX\r\n"), Some(b"INBOX".to_vec()));
    }

    #[test]
    fn nil_delimiter() {
        assert_eq!(mailbox(b"* LIST () NIL INBOX\r\n"), Some(b"INBOX".to_vec()));
    }

    #[test]
    fn verb_is_case_insensitive() {
        assert_eq!(
            mailbox(b"* list () \"/\" \"INBOX\"\r\n"),
            Some(b"INBOX".to_vec())
        );
        assert_eq!(
            mailbox(b"* Lsub () \"/\" \"INBOX\"\r\n"),
            Some(b"INBOX".to_vec())
        );
    }

    #[test]
    fn escaped_quote_in_mailbox() {
        assert_eq!(
            mailbox(b"* LIST () \"/\" \"folder\\\"name\"\r\n"),
            Some(b"folder\"name".to_vec())
        );
    }

    #[test]
    fn escaped_backslash_in_mailbox() {
        assert_eq!(
            mailbox(b"* LIST () \"/\" \"folder\\\\name\"\r\n"),
            Some(b"folder\\name".to_vec())
        );
    }

    #[test]
    fn rejects_non_list_lines() {
        assert_eq!(mailbox(b"* OK completed\r\n"), None);
        assert_eq!(mailbox(b"* 1 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(mailbox(b"A001 OK LIST completed\r\n"), None);
        assert_eq!(mailbox(b"\r\n"), None);
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert_eq!(mailbox(b"* LIST () \"/\" \"INBOX\r\n"), None);
    }
}
