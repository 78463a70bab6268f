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

//! SCGI transport: netstring-framed headers over a plain TCP connection.
//! Ported from `original_source/scgi.go`'s `SCGIRequester`.

use crate::requester::{split_env_entry, Requester};
use crate::ClientResult;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

/// Speaks SCGI to a single application address, opening a fresh TCP
/// connection per request.
pub struct ScgiRequester<A> {
    addr: A,
}

impl<A: ToSocketAddrs + Clone + Send + Sync> ScgiRequester<A> {
    pub fn new(addr: A) -> Self {
        Self { addr }
    }
}

/// Builds the netstring-framed header block: `CONTENT_LENGTH` first (SCGI
/// requires it), then the literal `SCGI` version pair, then every other
/// env entry in input order. Each pair is `NAME\0VALUE\0`.
fn build_header_block(env: &[String]) -> BytesMut {
    let mut header = BytesMut::new();

    let pairs: Vec<(&str, &str)> = env.iter().filter_map(|e| split_env_entry(e)).collect();

    if let Some((_, value)) = pairs.iter().find(|(name, _)| *name == "CONTENT_LENGTH") {
        push_pair(&mut header, "CONTENT_LENGTH", value);
    } else {
        push_pair(&mut header, "CONTENT_LENGTH", "0");
    }
    push_pair(&mut header, "SCGI", "1");
    for (name, value) in &pairs {
        if *name != "CONTENT_LENGTH" {
            push_pair(&mut header, name, value);
        }
    }

    header
}

fn push_pair(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put(name.as_bytes());
    buf.put_u8(0);
    buf.put(value.as_bytes());
    buf.put_u8(0);
}

/// Frames `header` as a Bernstein netstring: `<len>:<bytes>,`.
fn netstring(header: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(header.len() + 16);
    out.put(header.len().to_string().as_bytes());
    out.put_u8(b':');
    out.put(header);
    out.put_u8(b',');
    out
}

#[async_trait]
impl<A: ToSocketAddrs + Clone + Send + Sync> Requester for ScgiRequester<A> {
    async fn request(
        &self,
        env: &[String],
        stdin: &mut (dyn AsyncRead + Unpin + Send),
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> ClientResult<()> {
        let mut conn = TcpStream::connect(self.addr.clone()).await?;

        let header = build_header_block(env);
        conn.write_all(&netstring(&header)).await?;
        tokio::io::copy(stdin, &mut conn).await?;

        // Some applications need the write side closed to recognize the
        // end of the request; best effort per spec §4.5.
        if let Err(e) = conn.shutdown().await {
            tracing::debug!(error = %e, "SCGI half-close failed, proceeding anyway");
        }

        if let Err(e) = io::copy(&mut conn, stdout).await {
            let _ = stderr.write_all(e.to_string().as_bytes()).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_block_puts_content_length_first() {
        let env = vec![
            "REQUEST_METHOD=POST".to_string(),
            "CONTENT_LENGTH=14".to_string(),
        ];
        let header = build_header_block(&env);
        assert!(header.starts_with(b"CONTENT_LENGTH\x0014\x00"));
        assert!(header[18..].starts_with(b"SCGI\x001\x00"));
        assert!(header.ends_with(b"REQUEST_METHOD\x00POST\x00"));
    }

    #[test]
    fn defaults_content_length_to_zero() {
        let env = vec!["REQUEST_METHOD=GET".to_string()];
        let header = build_header_block(&env);
        assert!(header.starts_with(b"CONTENT_LENGTH\x000\x00"));
    }

    #[test]
    fn netstring_framing() {
        let framed = netstring(b"abc");
        assert_eq!(&framed[..], b"3:abc,");
    }
}
