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

//! The single abstraction all three transports implement.

use crate::error::ClientResult;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Bridges an environment and a request body to an application and its
/// response, regardless of which gateway protocol carries it.
///
/// `env` is an ordered sequence of `NAME=VALUE` strings, matching CGI's
/// `execve`-style environment convention (and `original_source/`'s `[]string`
/// env). Entries without an `=` are silently dropped by every
/// implementation (spec §4.4).
#[async_trait]
pub trait Requester: Send + Sync {
    /// Runs one request to completion, blocking until the application has
    /// produced end-of-response.
    async fn request(
        &self,
        env: &[String],
        stdin: &mut (dyn AsyncRead + Unpin + Send),
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> ClientResult<()>;
}

/// Splits `"NAME=VALUE"` into `(name, value)`, the convention every
/// transport's environment handling follows. Returns `None` for entries
/// without an `=`, which callers silently drop per spec §4.4.
pub(crate) fn split_env_entry(entry: &str) -> Option<(&str, &str)> {
    entry.split_once('=')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_name_value() {
        assert_eq!(split_env_entry("FOO=bar"), Some(("FOO", "bar")));
        assert_eq!(split_env_entry("FOO="), Some(("FOO", "")));
        assert_eq!(split_env_entry("FOO=a=b"), Some(("FOO", "a=b")));
        assert_eq!(split_env_entry("NOVALUE"), None);
    }
}
