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

//! One FastCGI connection: a writer half shared by whoever is currently
//! sending a request, and a reader task that demultiplexes incoming
//! records by request id and feeds them to the right [`StreamProducer`]s.
//!
//! Per spec, this core opens one connection per request and never asks
//! the application to keep it open, so in practice only one request slot
//! is ever live at a time here — but the dispatch machinery is the same
//! one a multiplexing client would need, so it stays general rather than
//! special-cased to "exactly one".

use crate::error::{ClientError, ClientResult};
use crate::fastcgi::dialer::ConnStream;
use crate::fastcgi::slot::SlotTable;
use crate::record::{
    self, write_begin_request, write_name_value, EndRequest, Header, Record, RecordType, Role,
};
use crate::stream::{buffered_stream, BufferedStream, RecordWriter, StreamProducer};
use std::sync::Mutex as StdMutex;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

struct RequestSlot {
    stdout: StreamProducer,
    stderr: StreamProducer,
    done: oneshot::Sender<ClientResult<()>>,
}

struct Shared {
    slots: StdMutex<SlotTable<RequestSlot>>,
    mgmt: StdMutex<Option<oneshot::Sender<Vec<u8>>>>,
}

/// A live connection to one FastCGI application process.
pub(crate) struct Connection {
    writer: AsyncMutex<WriteHalf<Box<dyn ConnStream>>>,
    shared: std::sync::Arc<Shared>,
    reader_task: JoinHandle<()>,
}

impl Connection {
    pub(crate) fn open(stream: Box<dyn ConnStream>) -> std::sync::Arc<Self> {
        let (read_half, write_half): (ReadHalf<Box<dyn ConnStream>>, _) = split(stream);
        let shared = std::sync::Arc::new(Shared {
            slots: StdMutex::new(SlotTable::new()),
            mgmt: StdMutex::new(None),
        });

        let reader_shared = shared.clone();
        let reader_task = tokio::spawn(async move {
            run_reader(read_half, reader_shared).await;
        });

        std::sync::Arc::new(Self {
            writer: AsyncMutex::new(write_half),
            shared,
            reader_task,
        })
    }

    /// Sends a `GetValues` management record and waits (with the caller's
    /// own timeout) for its `GetValuesResult`.
    pub(crate) async fn get_values(&self, names: &[&str]) -> ClientResult<Vec<(String, String)>> {
        let mut content = Vec::new();
        for name in names {
            write_name_value(&mut content, name, "").await?;
        }

        let (tx, rx) = oneshot::channel();
        *self.shared.mgmt.lock().unwrap() = Some(tx);

        {
            let mut w = self.writer.lock().await;
            Header::write_record(&mut *w, RecordType::GetValues, 0, &content).await?;
            w.flush().await?;
        }

        let body = rx.await.map_err(|_| ClientError::ShortRead)?;
        Ok(record::parse_all_pairs(&body))
    }

    /// Runs one request to completion: allocates a slot, sends
    /// `BeginRequest` + `Params` + `Stdin`, and concurrently drains the
    /// application's `Stdout`/`Stderr` into the caller's sinks while
    /// awaiting the `EndRequest` outcome.
    pub(crate) async fn request(
        &self,
        env: &[String],
        stdin: &mut (dyn AsyncRead + Unpin + Send),
        stdout: &mut (dyn AsyncWrite + Unpin + Send),
        stderr: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> ClientResult<()> {
        let (stdout_tx, stdout_rx) = buffered_stream();
        let (stderr_tx, stderr_rx) = buffered_stream();
        let (done_tx, done_rx) = oneshot::channel();

        let request_id = {
            let mut slots = self.shared.slots.lock().unwrap();
            slots.allocate(RequestSlot {
                stdout: stdout_tx,
                stderr: stderr_tx,
                done: done_tx,
            })
        };

        let write_result = self.send_request(request_id, env, stdin).await;

        let copy_stdout = copy_stream(stdout_rx, stdout);
        let copy_stderr = copy_stream(stderr_rx, stderr);

        if let Err(e) = write_result {
            self.shared.slots.lock().unwrap().free(request_id);
            return Err(e);
        }

        let (end_result, stdout_result, stderr_result) =
            tokio::join!(done_rx, copy_stdout, copy_stderr);

        stdout_result?;
        stderr_result?;
        end_result.map_err(|_| ClientError::ShortRead)?
    }

    async fn send_request(
        &self,
        request_id: u16,
        env: &[String],
        stdin: &mut (dyn AsyncRead + Unpin + Send),
    ) -> ClientResult<()> {
        let mut w = self.writer.lock().await;
        write_begin_request(&mut *w, request_id, Role::Responder).await?;

        {
            let mut params = RecordWriter::new(&mut *w, RecordType::Params, request_id);
            let mut buf = Vec::new();
            for entry in env {
                if let Some((name, value)) = crate::requester::split_env_entry(entry) {
                    write_name_value(&mut buf, name, value).await?;
                }
            }
            params.write(&buf).await?;
            params.close().await?;
        }

        {
            let mut stdin_writer = RecordWriter::new(&mut *w, RecordType::Stdin, request_id);
            stdin_writer.write_from(stdin).await?;
            stdin_writer.close().await?;
        }

        w.flush().await?;
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn copy_stream(
    stream: BufferedStream, out: &mut (dyn AsyncWrite + Unpin + Send),
) -> ClientResult<()> {
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await;
        if n == 0 {
            return Ok(());
        }
        out.write_all(&buf[..n]).await?;
    }
}

async fn run_reader(mut read_half: ReadHalf<Box<dyn ConnStream>>, shared: std::sync::Arc<Shared>) {
    loop {
        let record = match record::read_record(&mut read_half).await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "FastCGI connection reader exiting");
                break;
            }
        };
        dispatch(record, &shared);
    }
    teardown(&shared);
}

fn dispatch(record: Record, shared: &Shared) {
    match record.r#type {
        RecordType::Stdout => with_slot(shared, record.request_id, |slot| slot.stdout.push(&record.content)),
        RecordType::Stderr => with_slot(shared, record.request_id, |slot| slot.stderr.push(&record.content)),
        RecordType::EndRequest => {
            let Some(slot) = shared.slots.lock().unwrap().free(record.request_id) else {
                tracing::debug!(id = record.request_id, "EndRequest for unknown request id");
                return;
            };
            slot.stdout.close();
            slot.stderr.close();
            let result = EndRequest::decode(&record.content).and_then(EndRequest::into_result);
            let _ = slot.done.send(result);
        }
        RecordType::GetValuesResult => {
            if let Some(tx) = shared.mgmt.lock().unwrap().take() {
                let _ = tx.send(record.content);
            }
        }
        RecordType::Unknown => {
            tracing::trace!(request_id = record.request_id, "ignoring unknown management record");
        }
        other => {
            tracing::debug!(?other, id = record.request_id, "unexpected record type from application");
        }
    }
}

fn with_slot(shared: &Shared, id: u16, f: impl FnOnce(&RequestSlot)) {
    let slots = shared.slots.lock().unwrap();
    match slots.get(id) {
        Some(slot) => f(slot),
        None => tracing::debug!(id, "record for unknown request id"),
    }
}

fn teardown(shared: &Shared) {
    for slot in shared.slots.lock().unwrap().drain() {
        slot.stdout.close();
        slot.stderr.close();
        let _ = slot.done.send(Err(ClientError::ShortRead));
    }
    if let Some(tx) = shared.mgmt.lock().unwrap().take() {
        let _ = tx.send(Vec::new());
    }
}
