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

//! The FastCGI transport: dials a fresh connection per request, admits it
//! against a shared in-flight ceiling, and speaks the record protocol
//! through [`conn::Connection`].

pub(crate) mod conn;
pub mod dialer;
pub(crate) mod slot;

use crate::error::ClientResult;
use crate::requester::Requester;
use async_trait::async_trait;
use dialer::Dialer;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

struct Admission {
    in_flight: Mutex<usize>,
    max: usize,
    notify: Notify,
}

impl Admission {
    fn new(max: usize) -> Self {
        Self {
            in_flight: Mutex::new(0),
            max,
            notify: Notify::new(),
        }
    }

    /// Blocks until a slot is free, then takes it. One mutex and one
    /// condition variable guard both the counter and (indirectly, via the
    /// caller dialing only after this returns) the connections it gates,
    /// per spec §5's shared-resource policy.
    async fn acquire(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let mut n = self.in_flight.lock().unwrap();
                if *n < self.max {
                    *n += 1;
                    return;
                }
            }
            notified.await;
        }
    }

    fn release(&self) {
        let mut n = self.in_flight.lock().unwrap();
        *n = n.saturating_sub(1);
        drop(n);
        self.notify.notify_one();
    }
}

/// Speaks FastCGI to an application reachable through a [`Dialer`],
/// admitting at most `max_requests` concurrent requests.
pub struct FastCgiRequester {
    dialer: Box<dyn Dialer>,
    admission: Admission,
}

impl FastCgiRequester {
    pub fn new(dialer: Box<dyn Dialer>, max_requests: usize) -> Self {
        Self {
            dialer,
            admission: Admission::new(max_requests.max(1)),
        }
    }

    /// Advisory `FCGI_GET_VALUES` probe (spec §4.6): asks the application
    /// for the named variables, but never fails the caller — connection,
    /// protocol, or timeout errors are logged and an empty result is
    /// returned instead.
    pub async fn get_values(&self, names: &[&str]) -> Vec<(String, String)> {
        let attempt = async {
            let stream = self.dialer.dial().await?;
            let conn = conn::Connection::open(stream);
            conn.get_values(names).await
        };

        match tokio::time::timeout(Duration::from_secs(1), attempt).await {
            Ok(Ok(pairs)) => pairs,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "GetValues probe failed, ignoring");
                Vec::new()
            }
            Err(_) => {
                tracing::debug!("GetValues probe timed out, ignoring");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Requester for FastCgiRequester {
    async fn request(
        &self,
        env: &[String],
        stdin: &mut (dyn AsyncRead + Unpin + Send),
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> ClientResult<()> {
        self.admission.acquire().await;
        let result = async {
            let stream = self.dialer.dial().await?;
            let conn = conn::Connection::open(stream);
            conn.request(env, stdin, stdout, stderr).await
        }
        .await;
        self.admission.release();
        result
    }
}
