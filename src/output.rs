//! Output interpretation: turning subprocess stdout into an HTTP response head and body
//!
//! Three framing behaviours are supported, selected with [`OutputMode`]:
//!
//! - [`OutputMode::Verbatim`]: the output is the body; default headers, status 200.
//! - [`OutputMode::Replace`]: leading `Key: Value` lines override the default
//!   headers. Scanning stops quietly at the first blank line, the first line
//!   that is not a header, an over-long line, or end of output.
//! - [`OutputMode::Cgi`]: CGI/1.1 framing. A header block terminated by a
//!   blank line is mandatory and all headers come from the subprocess.
//!
//! Interpreters only read the header block. The rest of the output is
//! returned as an [`OutputBody`] for the caller to stream.

use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::StatusCode;
use serde::Deserialize;
use std::io::Cursor;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, Chain};
use tracing::debug;

/// Maximum size of one header line, terminator included
pub const MAX_HEADER_LINE: usize = 1024;

/// Body left over after the header block: any bytes consumed during the scan
/// that belong to the body, followed by the unread rest of the output.
pub type OutputBody<R> = Chain<Cursor<Vec<u8>>, BufReader<R>>;

/// How subprocess output is turned into a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Send default headers and the raw output (for executables unaware of CGI)
    #[default]
    Verbatim,
    /// Let leading header lines replace default header values
    Replace,
    /// Conform to CGI/1.1 output framing
    #[serde(alias = "strict")]
    Cgi,
}

/// Errors produced while reading the header block
#[derive(Debug, thiserror::Error)]
pub enum InterpretError {
    #[error("error reading headers: {0}")]
    Io(#[from] std::io::Error),

    #[error("bogus status (short): {0:?}")]
    ShortStatus(String),

    #[error("bogus status: {0:?}")]
    BadStatus(String),

    #[error("long header line from subprocess")]
    LongHeaderLine,

    #[error("no headers")]
    NoHeaders,

    #[error("missing required Content-Type in headers")]
    MissingContentType,
}

/// Response head plus the remaining output
pub struct Interpreted<R> {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: OutputBody<R>,
}

impl<R> std::fmt::Debug for Interpreted<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreted")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Verbatim => "verbatim",
            OutputMode::Replace => "replace",
            OutputMode::Cgi => "cgi",
        }
    }

    /// Read the response head from `stdout`.
    ///
    /// `defaults` is never modified; modes that override headers work on a copy.
    pub async fn interpret<R>(
        &self,
        defaults: &HeaderMap,
        stdout: R,
    ) -> Result<Interpreted<R>, InterpretError>
    where
        R: AsyncRead + Unpin,
    {
        let reader = BufReader::with_capacity(MAX_HEADER_LINE, stdout);
        match self {
            OutputMode::Verbatim => Ok(Interpreted {
                status: StatusCode::OK,
                headers: defaults.clone(),
                body: Cursor::new(Vec::new()).chain(reader),
            }),
            OutputMode::Replace => replace_headers(defaults, reader).await,
            OutputMode::Cgi => cgi_headers(reader).await,
        }
    }
}

async fn replace_headers<R>(
    defaults: &HeaderMap,
    mut reader: BufReader<R>,
) -> Result<Interpreted<R>, InterpretError>
where
    R: AsyncRead + Unpin,
{
    let mut headers = defaults.clone();
    let mut status = None;
    // Bytes read during the scan that turned out to be body content
    let mut leftover = Vec::new();

    loop {
        let raw = match read_line(&mut reader, MAX_HEADER_LINE).await? {
            Line::Eof => break,
            Line::TooLong(partial) => {
                debug!(len = partial.len(), "cgi: long line ends header scan");
                leftover = partial;
                break;
            }
            Line::Complete(raw) => raw,
        };

        let line = trim_eol(&raw);
        if line.is_empty() {
            break;
        }

        match split_header(line) {
            Some(HeaderLine::Status(value)) => status = Some(parse_status(&value)?),
            Some(HeaderLine::Field(name, value)) => {
                headers.insert(name, value);
            }
            None => {
                // Body started without a separating blank line
                leftover = raw;
                break;
            }
        }
    }

    Ok(Interpreted {
        status: status.unwrap_or(StatusCode::OK),
        headers,
        body: Cursor::new(leftover).chain(reader),
    })
}

async fn cgi_headers<R>(mut reader: BufReader<R>) -> Result<Interpreted<R>, InterpretError>
where
    R: AsyncRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut status = None;
    let mut header_lines = 0usize;
    let mut saw_blank_line = false;

    loop {
        let raw = match read_line(&mut reader, MAX_HEADER_LINE).await? {
            Line::Eof => break,
            Line::TooLong(_) => return Err(InterpretError::LongHeaderLine),
            Line::Complete(raw) => raw,
        };

        let line = trim_eol(&raw);
        if line.is_empty() {
            saw_blank_line = true;
            break;
        }
        header_lines += 1;

        match split_header(line) {
            Some(HeaderLine::Status(value)) => status = Some(parse_status(&value)?),
            Some(HeaderLine::Field(name, value)) => {
                headers.append(name, value);
            }
            None => {
                tracing::warn!(line = %String::from_utf8_lossy(line), "cgi: bogus header line");
            }
        }
    }

    if header_lines == 0 || !saw_blank_line {
        return Err(InterpretError::NoHeaders);
    }

    if status.is_none() && headers.contains_key(LOCATION) {
        status = Some(StatusCode::FOUND);
    }

    if status.is_none() && !headers.contains_key(CONTENT_TYPE) {
        return Err(InterpretError::MissingContentType);
    }

    Ok(Interpreted {
        status: status.unwrap_or(StatusCode::OK),
        headers,
        body: Cursor::new(Vec::new()).chain(reader),
    })
}

/// Parse a `Status` header value: three leading digits, the rest is a reason phrase.
pub fn parse_status(value: &str) -> Result<StatusCode, InterpretError> {
    let Some(code) = value.get(..3) else {
        return Err(if value.len() < 3 {
            InterpretError::ShortStatus(value.to_string())
        } else {
            InterpretError::BadStatus(value.to_string())
        });
    };

    if !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InterpretError::BadStatus(value.to_string()));
    }

    code.parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| InterpretError::BadStatus(value.to_string()))
}

enum HeaderLine {
    Status(String),
    Field(HeaderName, HeaderValue),
}

/// Split `Key: Value` on the first colon. Both trimmed parts must be non-empty
/// and form a valid header.
fn split_header(line: &[u8]) -> Option<HeaderLine> {
    let colon = line.iter().position(|&b| b == b':')?;
    let key = line[..colon].trim_ascii();
    let value = line[colon + 1..].trim_ascii();
    if key.is_empty() || value.is_empty() {
        return None;
    }

    if key.eq_ignore_ascii_case(b"status") {
        let value = std::str::from_utf8(value).ok()?;
        return Some(HeaderLine::Status(value.to_string()));
    }

    let name = HeaderName::from_bytes(key).ok()?;
    let value = HeaderValue::from_bytes(value).ok()?;
    Some(HeaderLine::Field(name, value))
}

enum Line {
    /// A full line including its terminator (missing only at end of output)
    Complete(Vec<u8>),
    /// The first `limit` bytes of a line that did not fit
    TooLong(Vec<u8>),
    Eof,
}

async fn read_line<R>(reader: &mut R, limit: usize) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if raw.is_empty() {
                Line::Eof
            } else {
                Line::Complete(raw)
            });
        }

        let room = limit - raw.len();
        match available.iter().position(|&b| b == b'\n') {
            Some(i) if i < room => {
                raw.extend_from_slice(&available[..=i]);
                reader.consume(i + 1);
                return Ok(Line::Complete(raw));
            }
            _ => {
                let take = available.len().min(room);
                raw.extend_from_slice(&available[..take]);
                reader.consume(take);
                if raw.len() >= limit {
                    return Ok(Line::TooLong(raw));
                }
            }
        }
    }
}

fn trim_eol(raw: &[u8]) -> &[u8] {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers
    }

    async fn run(
        mode: OutputMode,
        defaults: &HeaderMap,
        output: &'static [u8],
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>), InterpretError> {
        let mut interpreted = mode.interpret(defaults, output).await?;
        let mut body = Vec::new();
        interpreted.body.read_to_end(&mut body).await?;
        Ok((interpreted.status, interpreted.headers, body))
    }

    #[tokio::test]
    async fn test_verbatim_ignores_header_lines() {
        let output = b"Content-Type: text/html\r\n\r\nBODY";
        let (status, headers, body) = run(OutputMode::Verbatim, &defaults(), output).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers, defaults());
        assert_eq!(body, output);
    }

    #[tokio::test]
    async fn test_replace_overwrites_defaults() {
        let output = b"Content-Type: text/html\r\nX-Test: PASS\r\n\r\nBODY";
        let (status, headers, body) = run(OutputMode::Replace, &defaults(), output).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(headers.get("x-test").unwrap(), "PASS");
        assert_eq!(body, b"BODY");
    }

    #[tokio::test]
    async fn test_replace_does_not_touch_shared_defaults() {
        let shared = defaults();
        let first = b"Content-Type: text/html\nX-Leak: first\n\nhello";
        let (_, headers, _) = run(OutputMode::Replace, &shared, first).await.unwrap();
        assert_eq!(headers.get("x-leak").unwrap(), "first");

        let (_, headers, body) = run(OutputMode::Replace, &shared, b"plain body").await.unwrap();
        assert_eq!(shared, defaults());
        assert!(headers.get("x-leak").is_none());
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(body, b"plain body");
    }

    #[tokio::test]
    async fn test_replace_body_without_headers() {
        let output = b"just some text\nsecond line\n";
        let (status, headers, body) = run(OutputMode::Replace, &defaults(), output).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers, defaults());
        assert_eq!(body, output);
    }

    #[tokio::test]
    async fn test_replace_headers_without_blank_line() {
        let output = b"Content-Type: text/html\nX-Test: PASS\n<p>hi</p>\n";
        let (_, headers, body) = run(OutputMode::Replace, &defaults(), output).await.unwrap();

        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(headers.get("x-test").unwrap(), "PASS");
        assert_eq!(body, b"<p>hi</p>\n");
    }

    #[tokio::test]
    async fn test_replace_empty_value_is_body() {
        let output = b"Note:\nrest";
        let (_, headers, body) = run(OutputMode::Replace, &defaults(), output).await.unwrap();

        assert_eq!(headers, defaults());
        assert_eq!(body, output);
    }

    #[tokio::test]
    async fn test_replace_status_only() {
        let output = b"Status: 404 Not Found\n\nmissing";
        let (status, headers, body) = run(OutputMode::Replace, &defaults(), output).await.unwrap();

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers, defaults());
        assert_eq!(body, b"missing");
    }

    #[tokio::test]
    async fn test_replace_bad_status_is_error() {
        let err = run(OutputMode::Replace, &defaults(), b"Status: abc\n\n").await.unwrap_err();
        assert!(matches!(err, InterpretError::BadStatus(_)));

        let err = run(OutputMode::Replace, &defaults(), b"Status: 20\n\n").await.unwrap_err();
        assert!(matches!(err, InterpretError::ShortStatus(_)));
    }

    #[tokio::test]
    async fn test_replace_long_line_stops_scan() {
        let mut output = b"X-First: yes\n".to_vec();
        output.extend(std::iter::repeat(b'a').take(MAX_HEADER_LINE + 100));
        output.extend_from_slice(b"\ntail");
        let output: &'static [u8] = Box::leak(output.into_boxed_slice());

        let (status, headers, body) = run(OutputMode::Replace, &defaults(), output).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-first").unwrap(), "yes");
        assert_eq!(body, &output[b"X-First: yes\n".len()..]);
    }

    #[tokio::test]
    async fn test_replace_eof_during_scan() {
        let (status, headers, body) =
            run(OutputMode::Replace, &defaults(), b"X-Only: header").await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("x-only").unwrap(), "header");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_cgi_requires_headers() {
        let err = run(OutputMode::Cgi, &defaults(), b"no headers here").await.unwrap_err();
        assert!(matches!(err, InterpretError::NoHeaders));

        let err = run(OutputMode::Cgi, &defaults(), b"\nbody").await.unwrap_err();
        assert!(matches!(err, InterpretError::NoHeaders));

        let err = run(OutputMode::Cgi, &defaults(), b"Content-Type: text/html\n").await.unwrap_err();
        assert!(matches!(err, InterpretError::NoHeaders));
    }

    #[tokio::test]
    async fn test_cgi_ignores_defaults() {
        let output = b"Content-Type: text/html\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n<html>";
        let (status, headers, body) = run(OutputMode::Cgi, &defaults(), output).await.unwrap();

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/html");
        assert_eq!(headers.get_all("set-cookie").iter().count(), 2);
        assert_eq!(body, b"<html>");
    }

    #[tokio::test]
    async fn test_cgi_missing_content_type() {
        let err = run(OutputMode::Cgi, &defaults(), b"X-Other: 1\n\nbody").await.unwrap_err();
        assert!(matches!(err, InterpretError::MissingContentType));
    }

    #[tokio::test]
    async fn test_cgi_status_without_content_type() {
        let (status, _, _) = run(OutputMode::Cgi, &defaults(), b"Status: 204 No Content\n\n")
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_cgi_location_implies_redirect() {
        let output = b"Location: http://example.com/\n\n";
        let (status, headers, _) = run(OutputMode::Cgi, &defaults(), output).await.unwrap();
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(headers.get(LOCATION).unwrap(), "http://example.com/");

        let output = b"Status: 301 Moved\nLocation: /new\n\n";
        let (status, _, _) = run(OutputMode::Cgi, &defaults(), output).await.unwrap();
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
    }

    #[tokio::test]
    async fn test_cgi_long_line_is_error() {
        let output: &'static [u8] =
            Box::leak(vec![b'x'; MAX_HEADER_LINE * 2].into_boxed_slice());
        let err = run(OutputMode::Cgi, &defaults(), output).await.unwrap_err();
        assert!(matches!(err, InterpretError::LongHeaderLine));
    }

    #[tokio::test]
    async fn test_cgi_skips_bogus_lines() {
        let output = b"Content-Type: text/plain\nnot a header\n\nok";
        let (status, headers, body) = run(OutputMode::Cgi, &defaults(), output).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.len(), 1);
        assert_eq!(body, b"ok");
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("200").unwrap(), StatusCode::OK);
        assert_eq!(parse_status("404 Not Found").unwrap(), StatusCode::NOT_FOUND);
        assert!(matches!(parse_status("99"), Err(InterpretError::ShortStatus(_))));
        assert!(matches!(parse_status("+12"), Err(InterpretError::BadStatus(_))));
        assert!(matches!(parse_status("0000"), Err(InterpretError::BadStatus(_))));
        assert!(matches!(parse_status("é12"), Err(InterpretError::BadStatus(_))));
    }

    #[test]
    fn test_output_mode_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: OutputMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"replace\"").unwrap();
        assert_eq!(parsed.mode, OutputMode::Replace);
        let parsed: Wrapper = toml::from_str("mode = \"strict\"").unwrap();
        assert_eq!(parsed.mode, OutputMode::Cgi);
    }
}
