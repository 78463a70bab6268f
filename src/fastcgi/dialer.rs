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

//! How a [`super::FastCgiRequester`] opens a fresh connection to the
//! application. Two implementations, ported from `original_source/dialer.go`:
//! a plain network dialer, and a dialer that spawns the application once
//! and hands it a private listening socket over its standard input (the
//! `spawn-fcgi`/PHP-FPM convention).

use async_trait::async_trait;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::{Child, Command};

/// A connected, bidirectional byte stream to the application.
pub trait ConnStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnStream for T {}

/// Opens a fresh connection to the application. Implementations may be
/// called concurrently, once per admitted request.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> tokio::io::Result<Box<dyn ConnStream>>;
}

/// Dials a TCP or Unix-domain address directly; the application is
/// assumed to already be listening.
pub enum NetDialer {
    Tcp(String),
    Unix(PathBuf),
}

#[async_trait]
impl Dialer for NetDialer {
    async fn dial(&self) -> tokio::io::Result<Box<dyn ConnStream>> {
        match self {
            NetDialer::Tcp(addr) => Ok(Box::new(TcpStream::connect(addr).await?)),
            NetDialer::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }
}

/// Spawns the application once, passing it a private Unix-domain listening
/// socket as its standard input (`FCGI_LISTENSOCK_FILENO`). Subsequent
/// dials connect to that socket as a client.
pub struct StdinDialer {
    socket_path: PathBuf,
    // Kept alive only to hold the listening socket open and so `close`
    // can unlink it; this side never accepts on it.
    _listener: std::os::unix::net::UnixListener,
    child: tokio::sync::Mutex<Child>,
}

impl StdinDialer {
    /// Spawns `program` with a freshly bound private socket on its stdin.
    /// The socket's filename is generated from 8 bytes of randomness in
    /// the system temp directory, as `fcgi<hex>`.
    pub async fn spawn(program: &str, args: &[String]) -> tokio::io::Result<Self> {
        let socket_path = random_socket_path();

        let listener = std::os::unix::net::UnixListener::bind(&socket_path)?;
        let child_stdin = listener.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::from(std::os::unix::io::OwnedFd::from(child_stdin)));
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        tracing::debug!(program, path = %socket_path.display(), "spawning FastCGI application with stdin socket");
        let child = cmd.spawn()?;

        Ok(Self {
            socket_path,
            _listener: listener,
            child: tokio::sync::Mutex::new(child),
        })
    }

    /// Tears down the socket file, the listener, and the child process.
    pub async fn close(&self) {
        let _ = std::fs::remove_file(&self.socket_path);
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
    }
}

#[async_trait]
impl Dialer for StdinDialer {
    async fn dial(&self) -> tokio::io::Result<Box<dyn ConnStream>> {
        Ok(Box::new(UnixStream::connect(&self.socket_path).await?))
    }
}

fn random_socket_path() -> PathBuf {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let name = format!("fcgi{}", hex_encode(&bytes));
    std::env::temp_dir().join(name)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).unwrap();
    }
    s
}

#[allow(dead_code)]
fn is_private_socket(path: &Path) -> bool {
    path.starts_with(std::env::temp_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_filenames_follow_the_fcgi_hex_convention() {
        let path = random_socket_path();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("fcgi"));
        assert_eq!(name.len(), "fcgi".len() + 16);
        assert!(is_private_socket(&path));
    }
}
