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

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::network::ConnectionHandle;
use crate::AppError;
use crate::AppResult;

use super::Shutdown;

/// A freshly accepted stream plus what its connection needs to be controlled.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub handle: ConnectionHandle,
    pub shutdown: Shutdown,
}

/// Turns accepted streams into running connections.
///
/// `serve` owns the stream for the connection's whole lifetime; the server holds one
/// connection permit until it returns.
pub trait SessionFactory: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn serve(&self, accepted: Accepted) -> impl Future<Output = AppResult<()>> + Send;
}

#[derive(Debug)]
pub struct Server<F> {
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    factory: Arc<F>,
    recv_timeout: Duration,
}

impl<F: SessionFactory> Server<F> {
    pub fn new(
        listener: TcpListener,
        max_connection: usize,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        factory: F,
        recv_timeout: Duration,
    ) -> Self {
        Server {
            listener,
            limit_connections: Arc::new(Semaphore::new(max_connection)),
            notify_shutdown,
            shutdown_complete_tx,
            factory: Arc::new(factory),
            recv_timeout,
        }
    }

    /// Binds `address` and builds a server on it.
    pub async fn bind(
        address: &str,
        max_connection: usize,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        factory: F,
        recv_timeout: Duration,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind {} server to address: {} - Error: {}",
                factory.name(),
                address,
                err
            );
            error!("{}", error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        info!("{} server binding to {} for listening", factory.name(), address);
        Ok(Server::new(
            listener,
            max_connection,
            notify_shutdown,
            shutdown_complete_tx,
            factory,
            recv_timeout,
        ))
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until shutdown is signalled or accepting keeps failing.
    ///
    /// Each connection acquires a permit first, so at most `max_connection` run at once,
    /// and runs on its own task holding a shutdown-complete sender. Connections observe
    /// the shutdown broadcast themselves; returning from here does not stop them.
    pub async fn run(&self) -> AppResult<()> {
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let name = self.factory.name();

        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.limit_connections.clone().acquire_owned() => permit
                    .map_err(|e| AppError::Accept(format!("connection limiter closed: {}", e)))?,
            };

            let (socket, peer) = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = self.accept() => accepted?,
            };
            if let Err(e) = socket.set_nodelay(true) {
                debug!("set nodelay for {}: {}", peer, e);
            }

            let accepted = Accepted {
                stream: socket,
                peer,
                handle: ConnectionHandle::new(self.recv_timeout),
                shutdown: Shutdown::subscribe(&self.notify_shutdown),
            };
            let connection_id = accepted.handle.id();
            debug!("{} accept new connection {} from {}", name, connection_id, peer);

            let factory = self.factory.clone();
            let shutdown_complete_tx = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = factory.serve(accepted).await {
                    warn!(connection_id, "{} connection error: {}", factory.name(), err);
                }
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
                drop(shutdown_complete_tx);
            });
        }
        info!("{} server stop accepting", name);
        Ok(())
    }

    async fn accept(&self) -> AppResult<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(AppError::Accept(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed, retry in {}s: {}", backoff, err);
                }
            }

            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

impl<F> Drop for Server<F> {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[derive(Debug, Default)]
    struct Greeter {
        served: AtomicUsize,
    }

    impl SessionFactory for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        async fn serve(&self, mut accepted: Accepted) -> AppResult<()> {
            self.served.fetch_add(1, Ordering::SeqCst);
            accepted.stream.write_all(b"hi").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn serves_connections_until_shutdown() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel::<()>(1);
        let server = Server::bind(
            "127.0.0.1:0",
            4,
            notify_shutdown.clone(),
            complete_tx,
            Greeter::default(),
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let server = Arc::new(server);
        let running = tokio::spawn({
            let server = server.clone();
            async move { server.run().await }
        });

        for _ in 0..2 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let mut buf = [0u8; 2];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hi");
        }
        assert_eq!(server.factory.served.load(Ordering::SeqCst), 2);

        notify_shutdown.send(()).unwrap();
        running.await.unwrap().unwrap();
        drop(server);
        assert!(complete_rx.recv().await.is_none());
    }
}
