//! Wire framing.
//!
//! One request and one response per connection. Two framings are supported:
//!
//! ```text
//! length:  Request:  <length>\r\n<data of exactly length bytes>
//!          Response: <length>\r\n<data of exactly length bytes>
//!
//!          Request:  5\r\nhello
//!          Response: 5\r\nhello
//!
//! line:    Request:  <data>\n          (a trailing \r is stripped)
//!          Response: <data>\r\n
//! ```
//!
//! Error lines are shared by both framings:
//! - `CLIENT_ERROR <message>\r\n` for bad request content
//! - `SERVER_ERROR overloaded\r\n` when admission is refused

use crate::error::InvalidInput;
use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::ops::Range;

/// Longest accepted length header, digits only (fits any u64).
const MAX_HEADER_DIGITS: usize = 20;

/// How a request is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// `<length>\r\n<data>`
    #[default]
    Length,
    /// Data terminated by `\n`
    Line,
}

/// Result of scanning the read buffer for a complete request.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A whole request is buffered; `payload` indexes into the input.
    Complete { payload: Range<usize> },
    /// Need more bytes.
    Incomplete,
    /// The bytes can never form a valid request.
    Invalid(InvalidInput),
}

/// Scan `input` for one complete request.
pub fn parse(framing: Framing, input: &[u8], max_request_size: usize) -> ParseResult {
    match framing {
        Framing::Length => parse_length(input, max_request_size),
        Framing::Line => parse_line(input, max_request_size),
    }
}

fn parse_length(input: &[u8], max_request_size: usize) -> ParseResult {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_HEADER_DIGITS + 1 => {
            return ParseResult::Invalid(InvalidInput::InvalidLength);
        }
        None => return ParseResult::Incomplete,
    };

    let line = &input[..line_end];
    if line.is_empty() || line.len() > MAX_HEADER_DIGITS || !line.iter().all(u8::is_ascii_digit) {
        return ParseResult::Invalid(InvalidInput::InvalidLength);
    }

    // All ASCII digits, so this is valid UTF-8.
    let length: usize = match std::str::from_utf8(line).ok().and_then(|s| s.parse().ok()) {
        Some(len) => len,
        None => return ParseResult::Invalid(InvalidInput::InvalidLength),
    };

    if length > max_request_size {
        return ParseResult::Invalid(InvalidInput::TooLarge {
            limit: max_request_size,
        });
    }

    let header_len = line_end + 2;
    if input.len() < header_len + length {
        return ParseResult::Incomplete;
    }

    ParseResult::Complete {
        payload: header_len..header_len + length,
    }
}

fn parse_line(input: &[u8], max_request_size: usize) -> ParseResult {
    let newline = match input.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        // Room for the payload plus `\r`.
        None if input.len() > max_request_size + 1 => {
            return ParseResult::Invalid(InvalidInput::TooLarge {
                limit: max_request_size,
            });
        }
        None => return ParseResult::Incomplete,
    };

    let end = if newline > 0 && input[newline - 1] == b'\r' {
        newline - 1
    } else {
        newline
    };

    if end > max_request_size {
        return ParseResult::Invalid(InvalidInput::TooLarge {
            limit: max_request_size,
        });
    }

    ParseResult::Complete { payload: 0..end }
}

/// Frame a successful response body.
pub fn encode_response(framing: Framing, body: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + MAX_HEADER_DIGITS + 2);
    match framing {
        Framing::Length => {
            out.extend_from_slice(format!("{}\r\n", body.len()).as_bytes());
            out.extend_from_slice(body);
        }
        Framing::Line => {
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
    }
    out.freeze()
}

/// Generate a CLIENT_ERROR response.
pub fn client_error(msg: &str) -> Bytes {
    Bytes::from(format!("CLIENT_ERROR {}\r\n", single_line(msg)))
}

/// Generate a SERVER_ERROR response.
pub fn server_error(msg: &str) -> Bytes {
    Bytes::from(format!("SERVER_ERROR {}\r\n", single_line(msg)))
}

pub fn overloaded() -> Bytes {
    server_error("overloaded")
}

/// Keep error messages from breaking the line framing.
fn single_line(msg: &str) -> String {
    msg.replace(['\r', '\n'], " ")
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn test_parse_length_frame() {
        assert_eq!(
            parse(Framing::Length, b"5\r\nhello", MAX),
            ParseResult::Complete { payload: 3..8 }
        );
        // Empty body.
        assert_eq!(
            parse(Framing::Length, b"0\r\n", MAX),
            ParseResult::Complete { payload: 3..3 }
        );
    }

    #[test]
    fn test_parse_length_incomplete() {
        assert_eq!(parse(Framing::Length, b"", MAX), ParseResult::Incomplete);
        assert_eq!(parse(Framing::Length, b"12", MAX), ParseResult::Incomplete);
        assert_eq!(parse(Framing::Length, b"5\r\nhel", MAX), ParseResult::Incomplete);
    }

    #[test]
    fn test_parse_length_invalid() {
        assert_eq!(
            parse(Framing::Length, b"abc\r\n", MAX),
            ParseResult::Invalid(InvalidInput::InvalidLength)
        );
        assert_eq!(
            parse(Framing::Length, b"-1\r\n", MAX),
            ParseResult::Invalid(InvalidInput::InvalidLength)
        );
        assert_eq!(
            parse(Framing::Length, b"\r\n", MAX),
            ParseResult::Invalid(InvalidInput::InvalidLength)
        );
        // A header that never ends.
        assert_eq!(
            parse(Framing::Length, b"1234567890123456789012345", MAX),
            ParseResult::Invalid(InvalidInput::InvalidLength)
        );
    }

    #[test]
    fn test_parse_length_too_large() {
        assert_eq!(
            parse(Framing::Length, b"2048\r\n", MAX),
            ParseResult::Invalid(InvalidInput::TooLarge { limit: MAX })
        );
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse(Framing::Line, b"hello\r\n", MAX),
            ParseResult::Complete { payload: 0..5 }
        );
        assert_eq!(
            parse(Framing::Line, b"hello\n", MAX),
            ParseResult::Complete { payload: 0..5 }
        );
        assert_eq!(
            parse(Framing::Line, b"\n", MAX),
            ParseResult::Complete { payload: 0..0 }
        );
        assert_eq!(parse(Framing::Line, b"hello", MAX), ParseResult::Incomplete);
    }

    #[test]
    fn test_parse_line_too_large() {
        assert_eq!(
            parse(Framing::Line, b"abcdefgh", 4),
            ParseResult::Invalid(InvalidInput::TooLarge { limit: 4 })
        );
        assert_eq!(
            parse(Framing::Line, b"abcdef\n", 4),
            ParseResult::Invalid(InvalidInput::TooLarge { limit: 4 })
        );
        assert_eq!(
            parse(Framing::Line, b"abcd\r\n", 4),
            ParseResult::Complete { payload: 0..4 }
        );
    }

    #[test]
    fn test_encode_response() {
        assert_eq!(&encode_response(Framing::Length, b"hello")[..], b"5\r\nhello");
        assert_eq!(&encode_response(Framing::Length, b"")[..], b"0\r\n");
        assert_eq!(&encode_response(Framing::Line, b"hello")[..], b"hello\r\n");
    }

    #[test]
    fn test_error_lines() {
        assert_eq!(&client_error("bad\r\ninput")[..], b"CLIENT_ERROR bad  input\r\n");
        assert_eq!(&overloaded()[..], b"SERVER_ERROR overloaded\r\n");
    }
}
