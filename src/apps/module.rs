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
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::route::{Command, Endpoint, EndpointRef, LogicalId, RelayQueue, RouteBus};
use crate::service::RelayConfig;
use crate::utils::panic_message;
use crate::{AppResult, Shutdown};

/// Server-side component addressed through the route bus by its instance id.
///
/// `handle` runs on the module's own worker task, one command at a time, in arrival
/// order. An error or a panic is logged and the worker moves on to the next command.
pub trait Module: Send + 'static {
    fn name(&self) -> &str;

    fn instance_id(&self) -> u32;

    fn handle(
        &mut self,
        cmd: Command,
        bus: &RouteBus,
    ) -> impl Future<Output = AppResult<()>> + Send;
}

#[derive(Debug)]
struct ModuleEndpoint {
    name: String,
    instance_id: u32,
    inbound: mpsc::Sender<Command>,
}

impl Endpoint for ModuleEndpoint {
    fn instance_id(&self) -> u32 {
        self.instance_id
    }

    fn logical_id(&self) -> LogicalId {
        self.instance_id
    }

    fn deliver(&self, cmd: Command) {
        if let Err(e) = self.inbound.try_send(cmd) {
            warn!("module {} inbound rejected command: {}", self.name, e);
        }
    }

    fn is_internal(&self) -> bool {
        true
    }
}

/// Running module: registered endpoint, relay pump and worker task.
#[derive(Debug, Clone)]
pub struct ModuleHost {
    name: String,
    endpoint: EndpointRef,
}

impl ModuleHost {
    /// Registers `module` on the bus and starts its tasks.
    ///
    /// Commands delivered to the module land in a bounded inbound channel; a relay queue
    /// moves them into the worker's channel, holding them up to the relay TTL while the
    /// worker is busy.
    pub async fn spawn<M: Module>(
        module: M,
        bus: &RouteBus,
        channel_capacity: usize,
        relay: &RelayConfig,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<ModuleHost> {
        let name = module.name().to_string();
        let instance_id = module.instance_id();
        let (inbound_tx, inbound_rx) = mpsc::channel(channel_capacity);
        let (work_tx, work_rx) = mpsc::channel(channel_capacity);

        let endpoint: EndpointRef = Arc::new(ModuleEndpoint {
            name: name.clone(),
            instance_id,
            inbound: inbound_tx,
        });

        let relay_queue = RelayQueue::new(format!("module-{}", name), relay);
        let pump_shutdown = Shutdown::subscribe(notify_shutdown);
        let pump_complete_tx = shutdown_complete_tx.clone();
        let pump_name = name.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_queue.pump(inbound_rx, work_tx, pump_shutdown).await {
                warn!("module {} relay stopped: {}", pump_name, e);
            }
            drop(pump_complete_tx);
        });

        let worker = Worker {
            module,
            bus: bus.clone(),
            endpoint: endpoint.clone(),
            work_rx,
            shutdown: Shutdown::subscribe(notify_shutdown),
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        tokio::spawn(worker.run());

        bus.register(endpoint.clone(), true).await?;
        info!("module {} started with instance id {}", name, instance_id);
        Ok(ModuleHost { name, endpoint })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_id(&self) -> u32 {
        self.endpoint.instance_id()
    }

    /// The endpoint registered on the bus; delivering to it bypasses the dispatcher.
    pub fn endpoint(&self) -> EndpointRef {
        self.endpoint.clone()
    }
}

struct Worker<M> {
    module: M,
    bus: RouteBus,
    endpoint: EndpointRef,
    work_rx: mpsc::Receiver<Command>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<M: Module> Worker<M> {
    async fn run(mut self) {
        debug!("module {} worker started", self.module.name());
        loop {
            let cmd = tokio::select! {
                _ = self.shutdown.recv() => break,
                cmd = self.work_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            let seq = cmd.seq();
            let outcome = AssertUnwindSafe(self.module.handle(cmd, &self.bus))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("module {} failed on cmd#{}: {}", self.module.name(), seq, e),
                Err(payload) => error!(
                    "module {} panicked on cmd#{}: {}",
                    self.module.name(),
                    seq,
                    panic_message(payload.as_ref())
                ),
            }
        }

        if !self.shutdown.is_shutdown() {
            if let Err(e) = self.bus.unregister(self.endpoint.clone()).await {
                debug!("module {} unregister skipped: {}", self.module.name(), e);
            }
        }
        debug!("module {} worker exit", self.module.name());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time;

    use super::*;
    use crate::route::MailboxEndpoint;
    use crate::service::RouteConfig;
    use crate::AppError;

    /// Answers every command with the same payload, panics on `boom`, fails on `fail`.
    struct Echo;

    impl Module for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn instance_id(&self) -> u32 {
            20
        }

        async fn handle(&mut self, cmd: Command, bus: &RouteBus) -> AppResult<()> {
            match cmd.payload().as_ref() {
                b"boom" => panic!("echo exploded"),
                b"fail" => Err(AppError::InvalidValue("fail".to_string())),
                _ => {
                    bus.forward(Command::new(20, cmd.from_id(), cmd.kind(), cmd.payload().clone()))
                        .await
                }
            }
        }
    }

    #[tokio::test]
    async fn module_survives_errors_and_panics() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let bus = RouteBus::start(&RouteConfig::default(), &notify_shutdown, complete_tx.clone());
        let host = ModuleHost::spawn(
            Echo,
            &bus,
            16,
            &RelayConfig::default(),
            &notify_shutdown,
            complete_tx,
        )
        .await
        .unwrap();
        assert_eq!(host.instance_id(), 20);
        assert_eq!(host.name(), "echo");

        let (client, mut rx) = MailboxEndpoint::new(crate::route::alloc_instance_id(), 300, 8);
        bus.register(Arc::new(client), false).await.unwrap();
        bus.sync().await.unwrap();

        for payload in ["boom", "fail", "hello"] {
            bus.forward(Command::new(300, 20, 5, Bytes::from_static(payload.as_bytes())))
                .await
                .unwrap();
        }

        let reply = time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.from_id(), 20);
        assert_eq!(reply.payload(), &Bytes::from_static(b"hello"));
        notify_shutdown.send(()).unwrap();
    }
}
