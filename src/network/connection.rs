// Copyright 2025 jonefeewang@gmail.com
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

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::network::{ConnectionHandle, RecvBuffer, Session};
use crate::service::NetworkConfig;
use crate::utils::panic_message;
use crate::{AppError, AppResult, Shutdown};

/// Per-connection engine settings.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub recv_buffer_size: usize,
    pub recv_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            recv_buffer_size: 16384 * 2,
            recv_timeout: Duration::from_millis(50),
            write_timeout: Duration::from_millis(500),
        }
    }
}

impl From<&NetworkConfig> for ConnectionOptions {
    fn from(config: &NetworkConfig) -> Self {
        ConnectionOptions {
            recv_buffer_size: config.recv_buffer_size,
            recv_timeout: config.recv_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Drives one duplex stream for its whole lifetime.
///
/// The engine reads into a fixed buffer under a short read deadline, hands buffered bytes
/// to the session's decode hook until it asks for more, writes any replies under the write
/// deadline, and calls the idle hook whenever a read times out without data. Whatever ends
/// the loop (peer close, transport or protocol fault, close signal, shutdown, or a panic
/// inside a hook) the session's clean hook runs once and the stream is shut down.
pub struct Connection<T, S> {
    stream: T,
    peer: String,
    buffer: RecvBuffer,
    session: S,
    handle: ConnectionHandle,
    write_timeout: Duration,
    shutdown: Option<Shutdown>,
}

impl<T, S> fmt::Debug for Connection<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.handle.id())
            .field("peer", &self.peer)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

impl<T, S> Connection<T, S>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
    S: Session,
{
    pub fn new(
        stream: T,
        peer: impl Into<String>,
        session: S,
        options: &ConnectionOptions,
    ) -> Connection<T, S> {
        let handle = ConnectionHandle::new(options.recv_timeout);
        Connection::with_handle(stream, peer, session, handle, options)
    }

    /// For sessions that need the handle before the connection exists.
    pub fn with_handle(
        stream: T,
        peer: impl Into<String>,
        session: S,
        handle: ConnectionHandle,
        options: &ConnectionOptions,
    ) -> Connection<T, S> {
        Connection {
            stream,
            peer: peer.into(),
            buffer: RecvBuffer::with_capacity(options.recv_buffer_size),
            session,
            handle,
            write_timeout: options.write_timeout,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Connection<T, S> {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Runs the engine to completion and tears the connection down.
    ///
    /// Returns `Ok` when the peer closed or the connection was asked to stop, the fault
    /// otherwise. A panic inside a hook is reported as `IllegalStateError`.
    pub async fn run(mut self) -> AppResult<()> {
        let connection_id = self.handle.id();
        debug!(connection_id, peer = %self.peer, "connection engine started");

        let outcome = AssertUnwindSafe(self.io_loop()).catch_unwind().await;
        let result = match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                if err.is_disconnect() {
                    info!(connection_id, peer = %self.peer, "connection dropped: {}", err);
                } else {
                    warn!(connection_id, peer = %self.peer, "connection error: {}", err);
                }
                Err(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(connection_id, peer = %self.peer, "session panicked: {}", message);
                Err(AppError::IllegalStateError(format!(
                    "session panicked: {}",
                    message
                )))
            }
        };

        self.teardown().await;
        result
    }

    async fn io_loop(&mut self) -> AppResult<()> {
        let control = self.handle.clone();
        loop {
            if control.is_closed() {
                debug!(connection_id = control.id(), "close signal received");
                return Ok(());
            }
            let recv_timeout = control.recv_timeout();

            let read = tokio::select! {
                biased;
                _ = control.closed() => {
                    debug!(connection_id = control.id(), "close signal received");
                    return Ok(());
                }
                _ = wait_shutdown(&mut self.shutdown) => {
                    debug!(connection_id = control.id(), "connection exit read loop after recv shutdown signal");
                    return Ok(());
                }
                res = time::timeout(recv_timeout, self.stream.read(self.buffer.unfilled_mut())) => res,
            };

            let read_bytes = match read {
                // a read deadline is not an error, give the session a chance to push output
                Err(_elapsed) => {
                    if let Some(output) = self.session.idle().await? {
                        self.write_reply(&output).await?;
                    }
                    continue;
                }
                Ok(Err(err)) => return Err(err.into()),
                Ok(Ok(0)) => {
                    info!(
                        connection_id = control.id(),
                        peer = %self.peer,
                        "client close the connection with {} bytes buffered",
                        self.buffer.len()
                    );
                    return Ok(());
                }
                Ok(Ok(n)) => n,
            };
            self.buffer.commit(read_bytes);
            trace!(connection_id = control.id(), "read {} bytes", read_bytes);

            let total_decoded = self.decode_buffered().await?;
            self.buffer.compact(total_decoded);
            trace!(
                connection_id = control.id(),
                "decoded {} bytes, {} left in recv buffer of {}",
                total_decoded,
                self.buffer.len(),
                self.buffer.capacity()
            );

            if self.buffer.is_full() {
                return Err(AppError::BufferOverflow(self.buffer.len()));
            }
        }
    }

    /// Decodes as many messages as the buffer holds; returns the bytes consumed.
    async fn decode_buffered(&mut self) -> AppResult<usize> {
        let mut consumed = 0;
        while consumed < self.buffer.len() {
            let remaining = self.buffer.len() - consumed;
            let decoded = self
                .session
                .decode(&self.buffer.filled()[consumed..])
                .await?;
            let (decode_len, reply) = decoded.into_parts();
            if decode_len == 0 {
                break;
            }
            if decode_len > remaining {
                return Err(AppError::MalformedProtocol(format!(
                    "session consumed {} bytes but only {} were buffered",
                    decode_len, remaining
                )));
            }
            consumed += decode_len;
            if let Some(reply) = reply {
                self.write_reply(&reply).await?;
            }
        }
        Ok(consumed)
    }

    async fn write_reply(&mut self, data: &[u8]) -> AppResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let write_timeout = self.write_timeout;
        let stream = &mut self.stream;
        let write = async {
            stream.write_all(data).await?;
            stream.flush().await
        };
        match time::timeout(write_timeout, write).await {
            Ok(Ok(())) => {
                trace!(connection_id = self.handle.id(), "write bytes:{}", data.len());
                Ok(())
            }
            Ok(Err(err)) => Err(AppError::DetailedIoError(format!(
                "write to {} failed: {}",
                self.peer, err
            ))),
            Err(_) => Err(AppError::WriteTimeout(write_timeout)),
        }
    }

    async fn teardown(&mut self) {
        let connection_id = self.handle.id();
        self.handle.close();

        if let Err(payload) = AssertUnwindSafe(self.session.clean())
            .catch_unwind()
            .await
        {
            error!(
                connection_id,
                "session clean panicked: {}",
                panic_message(payload.as_ref())
            );
        }

        match time::timeout(self.write_timeout, self.stream.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(connection_id, "stream shutdown: {}", err),
            Err(_) => debug!(connection_id, "stream shutdown timed out"),
        }
        info!(connection_id, peer = %self.peer, "client exit");
    }
}

impl<T, S> Connection<T, S>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Session + 'static,
{
    pub fn spawn(self) -> (ConnectionHandle, JoinHandle<AppResult<()>>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }
}

async fn wait_shutdown(shutdown: &mut Option<Shutdown>) {
    match shutdown {
        Some(shutdown) => shutdown.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use rstest::rstest;
    use tokio::io::{duplex, DuplexStream};
    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::network::Decoded;

    /// u16 length-prefixed frames. `!` as first payload byte panics, `?` fails decode,
    /// `>` claims one byte more than was buffered.
    struct Probe {
        decoded: mpsc::UnboundedSender<Bytes>,
        cleaned: Arc<AtomicUsize>,
        idle_calls: Arc<AtomicUsize>,
        idle_output: Option<Bytes>,
        idle_fails: bool,
        echo: bool,
    }

    impl Probe {
        fn new() -> (Probe, mpsc::UnboundedReceiver<Bytes>, Arc<AtomicUsize>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let cleaned = Arc::new(AtomicUsize::new(0));
            let probe = Probe {
                decoded: tx,
                cleaned: cleaned.clone(),
                idle_calls: Arc::new(AtomicUsize::new(0)),
                idle_output: None,
                idle_fails: false,
                echo: false,
            };
            (probe, rx, cleaned)
        }
    }

    impl Session for Probe {
        async fn decode(&mut self, buf: &[u8]) -> AppResult<Decoded> {
            if buf.len() < 2 {
                return Ok(Decoded::incomplete());
            }
            let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
            if buf.len() < 2 + len {
                return Ok(Decoded::incomplete());
            }
            let payload = Bytes::copy_from_slice(&buf[2..2 + len]);
            match payload.first() {
                Some(b'!') => panic!("poisoned frame"),
                Some(b'?') => {
                    return Err(AppError::MalformedProtocol("rejected frame".to_string()))
                }
                Some(b'>') => return Ok(Decoded::consumed(buf.len() + 1)),
                _ => {}
            }
            let _ = self.decoded.send(payload.clone());
            let decoded = Decoded::consumed(2 + len);
            Ok(if self.echo {
                decoded.with_reply(payload)
            } else {
                decoded
            })
        }

        async fn idle(&mut self) -> AppResult<Option<Bytes>> {
            self.idle_calls.fetch_add(1, Ordering::SeqCst);
            if self.idle_fails {
                return Err(AppError::IllegalStateError("idle failed".to_string()));
            }
            Ok(self.idle_output.take())
        }

        async fn clean(&mut self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut out = (payload.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn options(recv_buffer_size: usize) -> ConnectionOptions {
        ConnectionOptions {
            recv_buffer_size,
            recv_timeout: Duration::from_millis(20),
            write_timeout: Duration::from_millis(500),
        }
    }

    fn start(probe: Probe, buffer: usize) -> (DuplexStream, ConnectionHandle, JoinHandle<AppResult<()>>) {
        let (client, server) = duplex(256);
        let (handle, join) = Connection::new(server, "duplex", probe, &options(buffer)).spawn();
        (client, handle, join)
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    #[case(usize::MAX)]
    #[tokio::test]
    async fn reassembles_across_read_boundaries(#[case] chunk: usize) {
        let (probe, mut decoded, cleaned) = Probe::new();
        let (mut client, handle, join) = start(probe, 64);

        let mut wire = frame(b"hello");
        wire.extend(frame(b"a slightly longer second message"));
        wire.extend(frame(b""));
        let chunk = chunk.min(wire.len());
        for piece in wire.chunks(chunk) {
            client.write_all(piece).await.unwrap();
            time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(decoded.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(
            decoded.recv().await.unwrap(),
            Bytes::from_static(b"a slightly longer second message")
        );
        assert_eq!(decoded.recv().await.unwrap(), Bytes::new());

        handle.close();
        join.await.unwrap().unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reply_is_written_back() {
        let (mut probe, _decoded, _cleaned) = Probe::new();
        probe.echo = true;
        let (mut client, handle, join) = start(probe, 64);

        client.write_all(&frame(b"ping")).await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");

        handle.close();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_output_is_flushed_without_input() {
        let (mut probe, _decoded, _cleaned) = Probe::new();
        probe.idle_output = Some(Bytes::from_static(b"tick"));
        let (mut client, handle, join) = start(probe, 64);

        let mut out = [0u8; 4];
        time::timeout(Duration::from_secs(2), client.read_exact(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&out, b"tick");

        handle.close();
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn decode_error_tears_down_and_cleans() {
        let (probe, _decoded, cleaned) = Probe::new();
        let (mut client, _handle, join) = start(probe, 64);

        client.write_all(&frame(b"?bad")).await.unwrap();
        let result = join.await.unwrap();
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);

        // stream is closed on our side
        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn panic_in_decode_is_contained() {
        let (probe, _decoded, cleaned) = Probe::new();
        let (mut client, _handle, join) = start(probe, 64);

        client.write_all(&frame(b"!boom")).await.unwrap();
        let result = join.await.expect("engine task must not propagate the panic");
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn peer_close_runs_cleanup() {
        let (probe, _decoded, cleaned) = Probe::new();
        let (client, handle, join) = start(probe, 64);

        drop(client);
        join.await.unwrap().unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn shutdown_signal_runs_cleanup() {
        let (notify, _) = broadcast::channel(1);
        let (probe, _decoded, cleaned) = Probe::new();
        let (_client, server) = duplex(64);
        let connection = Connection::new(server, "duplex", probe, &options(64))
            .with_shutdown(Shutdown::subscribe(&notify));
        let (_handle, join) = connection.spawn();

        notify.send(()).unwrap();
        join.await.unwrap().unwrap();
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_full_buffer_overflows() {
        let (probe, _decoded, cleaned) = Probe::new();
        let (mut client, _handle, join) = start(probe, 8);

        // header announces 100 bytes, buffer only holds 8
        let mut wire = 100u16.to_be_bytes().to_vec();
        wire.extend_from_slice(b"abcdef");
        client.write_all(&wire).await.unwrap();

        let result = join.await.unwrap();
        assert!(matches!(result, Err(AppError::BufferOverflow(8))));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn over_consuming_decode_is_malformed() {
        let (probe, _decoded, cleaned) = Probe::new();
        let (mut client, _handle, join) = start(probe, 64);

        client.write_all(&frame(b">greedy")).await.unwrap();
        let result = join.await.unwrap();
        assert!(matches!(result, Err(AppError::MalformedProtocol(_))));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn idle_error_tears_down_and_cleans() {
        let (mut probe, _decoded, cleaned) = Probe::new();
        probe.idle_fails = true;
        let idle_calls = probe.idle_calls.clone();
        let (mut client, handle, join) = start(probe, 64);

        let result = time::timeout(Duration::from_secs(2), join)
            .await
            .expect("idle failure must end the connection")
            .unwrap();
        assert!(matches!(result, Err(AppError::IllegalStateError(_))));
        assert_eq!(idle_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
        assert!(handle.is_closed());

        let mut rest = Vec::new();
        assert_eq!(client.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_update_changes_idle_cadence() {
        let (probe, _decoded, _cleaned) = Probe::new();
        let idle_calls = probe.idle_calls.clone();
        let (_client, handle, join) = start(probe, 64);

        // 20ms deadline
        time::sleep(Duration::from_secs(1)).await;
        let fast = idle_calls.swap(0, Ordering::SeqCst);
        assert!(fast >= 40, "expected ~50 idle turns, got {}", fast);

        handle.update_read_deadline(Duration::from_millis(200));
        time::sleep(Duration::from_secs(1)).await;
        let slow = idle_calls.load(Ordering::SeqCst);
        assert!((3..=7).contains(&slow), "expected ~5 idle turns, got {}", slow);

        handle.close();
        join.await.unwrap().unwrap();
    }
}
