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

//! Bridges an inbound HTTP request to a [`Requester`] and back, following
//! `original_source/http.go`'s `HTTPEnv`/`ServeHTTP`. This module knows
//! nothing about any particular HTTP server; it works in terms of the
//! framework-agnostic `http` crate types, so any server that can hand over
//! a method, URI, header map and body reader can sit in front of it.

use crate::error::ClientError;
use crate::requester::Requester;
use crate::response;
use http::{HeaderMap, Method, Response, StatusCode, Uri};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};

/// The pieces of an inbound request `HTTPEnv` needs. Left to the caller to
/// assemble from whatever HTTP server crate it's embedded in.
pub struct RequestMeta<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    /// `Host` header, already split or defaulted by the caller; used to
    /// fill `SERVER_NAME`/`SERVER_PORT`.
    pub host: &'a str,
    /// The peer address, used to fill `REMOTE_ADDR`.
    pub remote_addr: &'a str,
}

/// `true` if `start` already carries a `key=...` entry — callers' starting
/// env entries take precedence over anything the adaptor would otherwise
/// emit, so such a key is never overwritten.
fn has_key(start: &[String], key: &str) -> bool {
    start
        .iter()
        .any(|entry| entry.split_once('=').is_some_and(|(name, _)| name == key))
}

/// Builds the CGI environment for one request: `start` first, then the
/// standard HTTP/CGI variables (skipping any already present in `start`),
/// then one `HTTP_<NAME>` entry per header. `body` is the already-buffered
/// request body, used to compute `CONTENT_LENGTH` when no `Content-Length`
/// header was sent.
///
/// The `HTTP_` transform follows `original_source/http.go`'s
/// `strings.Replace(upper, "-", "_", 1)` literally: only the *first*
/// hyphen in a multi-word header name becomes an underscore (so
/// `X-Forwarded-For` becomes `HTTP_X_FORWARDED-FOR`, not
/// `HTTP_X_FORWARDED_FOR`). This looks like a quirk, not a design choice,
/// but it's the original's actual behavior and CGI scripts written against
/// it may depend on it.
pub fn build_env(start: &[String], meta: &RequestMeta<'_>, body: &[u8]) -> Vec<String> {
    let mut env: Vec<String> = start.to_vec();
    let set = |env: &mut Vec<String>, key: &str, value: String| {
        if !has_key(start, key) {
            env.push(format!("{key}={value}"));
        }
    };

    set(&mut env, "SCRIPT_NAME", String::new());
    set(&mut env, "REQUEST_METHOD", meta.method.to_string());
    set(&mut env, "SERVER_PROTOCOL", "HTTP/1.1".to_string());
    set(&mut env, "GATEWAY_INTERFACE", "CGI/1.1".to_string());
    set(&mut env, "REQUEST_URI", meta.uri.to_string());
    set(&mut env, "REMOTE_ADDR", meta.remote_addr.to_string());

    let (host, port) = match meta.host.rsplit_once(':') {
        Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => (h, p.to_string()),
        _ => (meta.host, "80".to_string()),
    };
    set(&mut env, "SERVER_NAME", host.to_string());
    set(&mut env, "SERVER_PORT", port);

    if let Some(query) = meta.uri.query() {
        if !query.is_empty() {
            set(&mut env, "QUERY_STRING", query.to_string());
        }
    }
    if let Some(ct) = meta.headers.get(http::header::CONTENT_TYPE) {
        if let Ok(ct) = ct.to_str() {
            set(&mut env, "CONTENT_TYPE", ct.to_string());
        }
    }
    let content_length = match meta.headers.get(http::header::CONTENT_LENGTH) {
        Some(cl) => cl.to_str().ok().map(str::to_string),
        None => Some(body.len().to_string()),
    };
    if let Some(cl) = content_length {
        set(&mut env, "CONTENT_LENGTH", cl);
    }

    for (name, value) in meta.headers.iter() {
        let Ok(value) = value.to_str() else { continue };
        let upper = name.as_str().to_ascii_uppercase();
        let cgi_name = match upper.find('-') {
            Some(i) => format!("{}_{}", &upper[..i], &upper[i + 1..]),
            None => upper,
        };
        set(&mut env, &format!("HTTP_{cgi_name}"), value.to_string());
    }

    env
}

/// Runs one request through `requester` and builds the HTTP response from
/// its CGI output. Any transport- or protocol-level failure becomes a
/// `500` response carrying the error text, matching
/// `original_source/http.go`'s `http.Error` fallback — there should be
/// nothing in stdout to conflict with it, since the error means the
/// application never produced a usable header block.
pub async fn serve<R: Requester + ?Sized>(
    requester: &R,
    start: &[String],
    meta: &RequestMeta<'_>,
    body: &mut (dyn AsyncRead + Unpin + Send),
) -> Response<Vec<u8>> {
    let mut buffered_body = Vec::new();
    if let Err(e) = body.read_to_end(&mut buffered_body).await {
        return error_response(&ClientError::Io(e));
    }
    let env = build_env(start, meta, &buffered_body);

    let (stdout_w, stdout_r) = tokio::io::duplex(64 * 1024);
    let (stderr_w, stderr_r) = tokio::io::duplex(4096);

    let request_fut = async move {
        let mut stdout_w = stdout_w;
        let mut stderr_w = stderr_w;
        let mut body_reader: &[u8] = &buffered_body;
        let result = requester
            .request(&env, &mut body_reader, &mut stdout_w, &mut stderr_w)
            .await;
        let _ = stdout_w.shutdown().await;
        let _ = stderr_w.shutdown().await;
        result
    };

    let stderr_fut = async move {
        let mut stderr_r = stderr_r;
        let mut collected = Vec::new();
        let _ = stderr_r.read_to_end(&mut collected).await;
        collected
    };

    let mut body_reader = BufReader::new(stdout_r);
    let head_fut = response::read_head(&mut body_reader);

    let (request_result, head_result, stderr_bytes) =
        tokio::join!(request_fut, head_fut, stderr_fut);

    if !stderr_bytes.is_empty() {
        tracing::debug!(
            stderr = %String::from_utf8_lossy(&stderr_bytes),
            "application wrote to stderr"
        );
    }

    if let Err(e) = request_result {
        return error_response(&e);
    }

    let head = match head_result {
        Ok(head) => head,
        Err(e) => return error_response(&e),
    };

    let mut body = Vec::new();
    if let Err(e) = body_reader.read_to_end(&mut body).await {
        return error_response(&ClientError::Io(e));
    }

    let mut builder = Response::builder().status(head.status);
    *builder.headers_mut().unwrap() = head.headers;
    builder.body(body).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Vec::new())
            .unwrap()
    })
}

fn error_response(e: &ClientError) -> Response<Vec<u8>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(e.to_string().into_bytes())
        .unwrap()
}
