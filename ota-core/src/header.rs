//! Incremental scanning of an HTTP response header block.
//!
//! The scanner never looks past the bytes it is given. A header block whose
//! terminating blank line has not arrived yet is reported as incomplete so the
//! caller can wait for more bytes.

use crate::error::HeaderError;

const CONTENT_LENGTH: &[u8] = b"content-length";

/// Index one past the first `delim` in `buf`, or `None` if it is not there yet.
pub fn find_delimiter(buf: &[u8], delim: u8) -> Option<usize> {
    buf.iter().position(|&b| b == delim).map(|i| i + 1)
}

/// What is known about the header block after scanning the bytes received so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderScan<'a> {
    /// First complete line of the response, without its terminator.
    pub status_line: Option<&'a str>,
    pub content_length: Option<u64>,
    /// Bytes up to and including the blank line, once it has been seen.
    pub header_len: Option<usize>,
}

/// Scan complete header lines in `buf`.
///
/// Lines are terminated by `\n`; the block ends at the first line that is exactly `\r\n`.
pub fn scan(buf: &[u8]) -> Result<HeaderScan<'_>, HeaderError> {
    let mut result = HeaderScan::default();
    let mut pos = 0;

    while let Some(line_len) = find_delimiter(&buf[pos..], b'\n') {
        let line = &buf[pos..pos + line_len];

        if line == b"\r\n" {
            result.header_len = Some(pos + line_len);
            return Ok(result);
        }

        let text = trim_line_end(line);
        if pos == 0 {
            result.status_line = core::str::from_utf8(text).ok();
        } else if result.content_length.is_none() {
            result.content_length = parse_content_length(text)?;
        }

        pos += line_len;
    }

    Ok(result)
}

/// Parse a `Content-Length` header line, returning `None` for any other header.
pub fn parse_content_length(line: &[u8]) -> Result<Option<u64>, HeaderError> {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return Ok(None);
    };

    let name = line[..colon].trim_ascii();
    if !name.eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }

    let value = line[colon + 1..].trim_ascii();
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return Err(HeaderError::MalformedContentLength);
    }

    value
        .iter()
        .try_fold(0u64, |acc, &digit| {
            acc.checked_mul(10)?.checked_add(u64::from(digit - b'0'))
        })
        .map(Some)
        .ok_or(HeaderError::MalformedContentLength)
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
