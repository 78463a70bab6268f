// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parses an RFC 3875 CGI response out of whatever an application wrote to
//! its stdout: a block of `Name: value` header lines, a blank line, then
//! the body. Ported from `original_source/http.go`'s `ProcessResponse`.

use crate::error::{ClientError, ClientResult};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest header line this core will buffer before giving up on a
/// runaway application (spec §4.7).
const MAX_HEADER_LINE: usize = 1024;

/// The parsed head of a CGI response. The body remains in `reader`,
/// un-consumed.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

/// Reads and parses the header block from `reader`, leaving the reader
/// positioned at the start of the body.
///
/// An application that produces no parseable header block at all (for
/// example: closes its stdout immediately) is a [`ClientError::NoHeaderBlock`].
/// A `Status:` header whose value doesn't start with a 3-digit code is a
/// [`ClientError::MalformedStatus`]. Anything else defaults to `200 OK`.
pub async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> ClientResult<ResponseHead> {
    let mut headers = HeaderMap::new();
    let mut saw_any_line = false;
    let mut status_value: Option<String> = None;

    loop {
        let line = read_header_line(reader).await?;
        let Some(line) = line else {
            if !saw_any_line {
                return Err(ClientError::NoHeaderBlock);
            }
            break;
        };
        if line.is_empty() {
            break;
        }
        saw_any_line = true;

        let Some((name, value)) = line.split_once(':') else {
            tracing::warn!(line = %line, "skipping malformed CGI header line");
            continue;
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("status") {
            status_value = Some(value.to_string());
            continue;
        }

        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let status = match status_value {
        None => StatusCode::OK,
        Some(raw) => parse_status(&raw)?,
    };

    Ok(ResponseHead { status, headers })
}

/// Parses `"200 OK"`-style status values; only the leading 3-digit code
/// matters, matching `original_source/http.go`'s `fmt.Sscanf("%d", ...)`.
fn parse_status(raw: &str) -> ClientResult<StatusCode> {
    let code = raw
        .split_whitespace()
        .next()
        .ok_or_else(|| ClientError::MalformedStatus(raw.to_string()))?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ClientError::MalformedStatus(raw.to_string()));
    }
    StatusCode::from_bytes(code.as_bytes()).map_err(|_| ClientError::MalformedStatus(raw.to_string()))
}

/// Reads one `\n`- or `\r\n`-terminated line, with no terminator included.
/// `Ok(None)` at end of input.
async fn read_header_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> ClientResult<Option<String>> {
    let mut raw = Vec::new();
    let n = reader
        .read_until(b'\n', &mut raw)
        .await
        .map_err(ClientError::Io)?;
    if n == 0 {
        return Ok(None);
    }
    if raw.len() > MAX_HEADER_LINE {
        return Err(ClientError::HeaderLineTooLong);
    }
    while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn parses_headers_and_defaults_to_200() {
        let body = b"Content-Type: text/html\r\nX-Foo: bar\r\n\r\n<html></html>";
        let mut reader = BufReader::new(&body[..]);
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(head.headers.get("content-type").unwrap(), "text/html");
        assert_eq!(head.headers.get("x-foo").unwrap(), "bar");

        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut rest)
            .await
            .unwrap();
        assert_eq!(rest, b"<html></html>");
    }

    #[tokio::test]
    async fn status_header_overrides_and_is_not_forwarded() {
        let body = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nnope";
        let mut reader = BufReader::new(&body[..]);
        let head = read_head(&mut reader).await.unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert!(head.headers.get("status").is_none());
    }

    #[tokio::test]
    async fn malformed_status_is_an_error() {
        let body = b"Status: nope\r\n\r\nbody";
        let mut reader = BufReader::new(&body[..]);
        let err = read_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, ClientError::MalformedStatus(_)));
    }

    #[tokio::test]
    async fn empty_output_has_no_header_block() {
        let body: &[u8] = b"";
        let mut reader = BufReader::new(body);
        let err = read_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, ClientError::NoHeaderBlock));
    }

    #[tokio::test]
    async fn repeated_headers_are_appended_not_overwritten() {
        let body = b"Set-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n";
        let mut reader = BufReader::new(&body[..]);
        let head = read_head(&mut reader).await.unwrap();
        let values: Vec<_> = head.headers.get_all("set-cookie").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[tokio::test]
    async fn oversized_header_line_is_rejected() {
        let mut body = vec![b'x'; MAX_HEADER_LINE + 10];
        body.extend_from_slice(b": y\r\n\r\n");
        let mut reader = BufReader::new(&body[..]);
        let err = read_head(&mut reader).await.unwrap_err();
        assert!(matches!(err, ClientError::HeaderLineTooLong));
    }
}
