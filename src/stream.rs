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

//! The two halves of the FastCGI stream multiplexer.
//!
//! [`RecordWriter`] turns writes into a typed, per-request sequence of
//! records on an owned byte sink — this is how `Params`, `Stdin` and
//! `Data` get onto the wire. [`BufferedStream`] is the other direction: a
//! byte-buffer fed by whatever task is demultiplexing the connection's
//! incoming records, read by whatever task actually wants the bytes. It's
//! built on a mutex-guarded buffer plus a `tokio::sync::Notify`, the async
//! equivalent of the condition variable `original_source/streams.go` uses,
//! rather than an unbounded channel: the producer hands in arbitrary-size
//! slices and the consumer wants to read arbitrary-size slices, and a
//! message-oriented channel would force either side to re-chunk.

use crate::error::ClientResult;
use crate::record::{Header, RecordType, MAX_LENGTH};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Notify;

/// Frames writes as FastCGI records of `record_type` on `request_id`.
///
/// Every non-empty write produces exactly one record (content split into
/// `MAX_LENGTH`-sized records if it doesn't fit in one). Writes are taken
/// by `&mut self`, so Rust's exclusive-borrow rule is what gives this the
/// "mutually serialized" guarantee spec §4.2 asks for — there is no
/// separate internal lock.
pub(crate) struct RecordWriter<'w, W> {
    writer: &'w mut W,
    record_type: RecordType,
    request_id: u16,
}

impl<'w, W: AsyncWrite + Unpin> RecordWriter<'w, W> {
    pub(crate) fn new(writer: &'w mut W, record_type: RecordType, request_id: u16) -> Self {
        Self {
            writer,
            record_type,
            request_id,
        }
    }

    /// Writes `content` as one or more records. A zero-length `content` is
    /// a no-op — an empty record means stream-close, so it's never
    /// produced by an ordinary write (spec §4.2).
    pub(crate) async fn write(&mut self, content: &[u8]) -> ClientResult<()> {
        if content.is_empty() {
            return Ok(());
        }
        for chunk in content.chunks(MAX_LENGTH) {
            Header::write_record(self.writer, self.record_type, self.request_id, chunk).await?;
        }
        Ok(())
    }

    /// Copies `reader` to end-of-input, each buffer's worth becoming one
    /// record.
    pub(crate) async fn write_from<R: AsyncRead + Unpin>(&mut self, mut reader: R) -> ClientResult<()> {
        let mut buf = vec![0u8; MAX_LENGTH];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            Header::write_record(self.writer, self.record_type, self.request_id, &buf[..n])
                .await?;
        }
        Ok(())
    }

    /// Emits the empty-content record that signals end-of-stream.
    pub(crate) async fn close(self) -> ClientResult<()> {
        Header::write_record(self.writer, self.record_type, self.request_id, &[]).await
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    buf: VecDeque<u8>,
    closed: bool,
}

/// The producer half of a [`BufferedStream`]: pushes demultiplexed record
/// payloads in, and closes the stream once the source record type's
/// empty-content terminator arrives.
#[derive(Clone)]
pub(crate) struct StreamProducer {
    shared: Arc<Shared>,
}

/// The consumer half: a byte source that blocks until bytes are available
/// or the stream has closed, draining whatever is left before signalling
/// end-of-input. Safe for single-producer, single-consumer use; never
/// busy-waits.
pub(crate) struct BufferedStream {
    shared: Arc<Shared>,
}

pub(crate) fn buffered_stream() -> (StreamProducer, BufferedStream) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buf: VecDeque::new(),
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        StreamProducer {
            shared: shared.clone(),
        },
        BufferedStream { shared },
    )
}

impl StreamProducer {
    pub(crate) fn push(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut state = self.shared.state.lock().unwrap();
        state.buf.extend(bytes);
        drop(state);
        self.shared.notify.notify_waiters();
    }

    pub(crate) fn close(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.shared.notify.notify_waiters();
    }
}

impl BufferedStream {
    /// Reads whatever is buffered, blocking if nothing is and the stream
    /// isn't closed yet. Returns `0` only at end-of-stream, after the
    /// buffer has been fully drained.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> usize {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if !state.buf.is_empty() {
                    let n = buf.len().min(state.buf.len());
                    for slot in buf.iter_mut().take(n) {
                        *slot = state.buf.pop_front().unwrap();
                    }
                    return n;
                }
                if state.closed {
                    return 0;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::read_record;

    #[tokio::test]
    async fn stream_writer_framing() {
        let mut conn = Vec::new();
        {
            let mut w = RecordWriter::new(&mut conn, RecordType::Stdout, 3);
            w.write(b"Foo!").await.unwrap();
            w.write(b"This is data").await.unwrap();
            w.write(b"\x00\x01abc").await.unwrap();
            w.close().await.unwrap();
        }

        let expected: &[u8] = &[
            0x01, 0x06, 0x00, 0x03, 0x00, 0x04, 0x04, 0x00, b'F', b'o', b'o', b'!', 0x00, 0x00,
            0x00, 0x00, //
            0x01, 0x06, 0x00, 0x03, 0x00, 0x0C, 0x04, 0x00, b'T', b'h', b'i', b's', b' ', b'i',
            b's', b' ', b'd', b'a', b't', b'a', 0x00, 0x00, 0x00, 0x00, //
            0x01, 0x06, 0x00, 0x03, 0x00, 0x05, 0x03, 0x00, 0x00, 0x01, b'a', b'b', b'c', 0x00,
            0x00, 0x00, //
            0x01, 0x06, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(conn, expected);
    }

    #[tokio::test]
    async fn zero_length_write_is_suppressed() {
        let mut conn = Vec::new();
        let mut w = RecordWriter::new(&mut conn, RecordType::Params, 1);
        w.write(b"").await.unwrap();
        assert!(conn.is_empty());
    }

    #[tokio::test]
    async fn buffered_stream_blocks_until_data_then_drains_on_close() {
        let (tx, rx) = buffered_stream();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let n = rx.read(&mut buf).await;
            let first = buf[..n].to_vec();
            let n = rx.read(&mut buf).await;
            assert_eq!(n, 0, "stream should be at EOF");
            first
        });

        tokio::task::yield_now().await;
        tx.push(b"hello");
        tx.close();

        let got = reader.await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn record_writer_chunks_oversized_content() {
        let mut conn = Vec::new();
        let big = vec![7u8; MAX_LENGTH + 10];
        {
            let mut w = RecordWriter::new(&mut conn, RecordType::Stdin, 9);
            w.write(&big).await.unwrap();
            w.close().await.unwrap();
        }
        let mut cursor = std::io::Cursor::new(conn);
        let first = read_record(&mut cursor).await.unwrap();
        assert_eq!(first.content.len(), MAX_LENGTH);
        let second = read_record(&mut cursor).await.unwrap();
        assert_eq!(second.content.len(), 10);
        let third = read_record(&mut cursor).await.unwrap();
        assert!(third.content.is_empty());
    }
}
