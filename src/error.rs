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

//! Error types shared by every transport.
//!
//! The taxonomy follows the three failure classes a gateway adapter can
//! hit: the transport itself (dial/spawn/socket failures), the wire
//! protocol (a malformed or truncated FastCGI frame), and the application
//! (a non-zero CGI exit, a CGI response with no header block). A fourth
//! variant, `AdmissionTimeout`, is declared but never constructed by this
//! core — it's reserved for a future bounded-wait admission policy.

use crate::record::ProtocolStatus;

/// Result type alias used throughout this crate.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while driving a CGI, FastCGI, or SCGI request.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Dial failure, socket read/write failure, or child-process spawn
    /// failure.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// The record header declared a protocol version this core doesn't
    /// speak.
    #[error("unknown FastCGI protocol version {version}")]
    UnknownVersion { version: u8 },

    /// A record's content would not fit in the 16-bit content-length
    /// field.
    #[error("record content of {len} bytes exceeds the 65535 byte limit")]
    ContentTooLarge { len: usize },

    /// The connection closed, or produced fewer bytes than a record
    /// header promised, mid-frame.
    #[error("short read while decoding a FastCGI record")]
    ShortRead,

    /// A record arrived for a request id this connection has no live slot
    /// for (protocol violation, not a routine "request finished" race).
    #[error("record for unknown request id `{id}` on this connection")]
    UnknownRequestId { id: u16 },

    /// `EndRequest` carried a protocol status other than
    /// `RequestComplete`.
    #[error("request ended with protocol status {protocol_status:?}; app status {app_status}")]
    EndRequestFailed {
        protocol_status: ProtocolStatus,
        app_status: u32,
    },

    /// The CGI/FastCGI/SCGI application exited with a non-zero status.
    #[error("application exited with status {0}")]
    ApplicationExit(std::process::ExitStatus),

    /// The application's output stream had no parseable RFC 3875 header
    /// block at all.
    #[error("CGI response had no parseable header block")]
    NoHeaderBlock,

    /// The application emitted a `Status:` header whose value didn't
    /// start with a three-digit status code.
    #[error("CGI response had a malformed Status header: {0:?}")]
    MalformedStatus(String),

    /// A single header line exceeded the 1024-octet bound this core
    /// enforces against runaway applications.
    #[error("CGI response header line exceeded the length bound")]
    HeaderLineTooLong,

    /// Reserved for a future bounded-wait admission policy; this core
    /// never times out admission (spec §7).
    #[error("timed out waiting for an admission slot")]
    AdmissionTimeout,
}
