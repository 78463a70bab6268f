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

//! Plain CGI (RFC 3875) transport: spawn a child process per request and
//! wire its standard streams to the caller's.

use crate::error::ClientError;
use crate::requester::{split_env_entry, Requester};
use crate::ClientResult;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

/// Runs a CGI binary directly, one child process per request.
pub struct CgiRequester {
    program: String,
    args: Vec<String>,
}

impl CgiRequester {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Requester for CgiRequester {
    async fn request(
        &self,
        env: &[String],
        stdin: &mut (dyn AsyncRead + Unpin + Send),
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> ClientResult<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        for entry in env {
            if let Some((name, value)) = split_env_entry(entry) {
                cmd.env(name, value);
            }
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!(program = %self.program, "spawning CGI child");
        let mut child = cmd.spawn()?;

        let mut child_stdin = child.stdin.take().expect("piped stdin");
        let mut child_stdout = child.stdout.take().expect("piped stdout");
        let mut child_stderr = child.stderr.take().expect("piped stderr");

        let (stdin_result, stdout_result, stderr_result) = tokio::join!(
            async {
                let r = tokio::io::copy(stdin, &mut child_stdin).await;
                drop(child_stdin);
                r
            },
            tokio::io::copy(&mut child_stdout, stdout),
            tokio::io::copy(&mut child_stderr, stderr),
        );
        stdin_result?;
        stdout_result?;
        stderr_result?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(ClientError::ApplicationExit(status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_program_and_captures_output() {
        let requester = CgiRequester::new("sh", vec!["-c".into(), "cat; echo done >&2".into()]);
        let env = vec!["REQUEST_METHOD=GET".into()];
        let mut stdin: &[u8] = b"hello";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        requester
            .request(&env, &mut stdin, &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(stdout, b"hello");
        assert_eq!(stderr, b"done\n");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let requester = CgiRequester::new("sh", vec!["-c".into(), "exit 3".into()]);
        let env = Vec::new();
        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        let err = requester
            .request(&env, &mut stdin, &mut stdout, &mut stderr)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ApplicationExit(_)));
    }

    #[tokio::test]
    async fn env_reaches_the_child() {
        let requester = CgiRequester::new("sh", vec!["-c".into(), "printf %s \"$GREETING\"".into()]);
        let env = vec!["GREETING=hi there".into(), "IGNORED_NO_EQUALS".into()];
        let mut stdin: &[u8] = b"";
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        requester
            .request(&env, &mut stdin, &mut stdout, &mut stderr)
            .await
            .unwrap();
        assert_eq!(stdout, b"hi there");
    }
}
