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

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, trace};

use crate::route::{Command, Destination, EndpointRef, LogicalId, KIND_OFFLINE};
use crate::service::RouteConfig;
use crate::utils::panic_message;
use crate::{AppError, AppResult, Shutdown};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    Online,
    Offline,
}

/// Lifecycle event passed to notify handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyContext {
    pub logical_id: LogicalId,
    pub instance_id: u32,
    pub kind: NotifyKind,
}

pub type NotifyHandler = Arc<dyn Fn(&NotifyContext) + Send + Sync>;

/// Registry sizes, as seen by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    pub clients: usize,
    pub modules: usize,
    pub notify_handlers: usize,
}

enum RouteRequest {
    Register { endpoint: EndpointRef, module: bool },
    Unregister { endpoint: EndpointRef },
    AddNotifyHandler { name: String, handler: NotifyHandler },
    CloseAllClients,
    Stats(oneshot::Sender<RouteStats>),
}

impl fmt::Debug for RouteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteRequest::Register { endpoint, module } => f
                .debug_struct("Register")
                .field("endpoint", endpoint)
                .field("module", module)
                .finish(),
            RouteRequest::Unregister { endpoint } => f
                .debug_struct("Unregister")
                .field("endpoint", endpoint)
                .finish(),
            RouteRequest::AddNotifyHandler { name, .. } => f
                .debug_struct("AddNotifyHandler")
                .field("name", name)
                .finish(),
            RouteRequest::CloseAllClients => f.write_str("CloseAllClients"),
            RouteRequest::Stats(_) => f.write_str("Stats"),
        }
    }
}

/// Handle to the route dispatcher.
///
/// The registry lives inside a single task; every operation here is a message on one of
/// two bounded queues: registration traffic and dispatch traffic. Each queue is FIFO,
/// there is no ordering between them. Use [`RouteBus::sync`] when a caller needs its
/// earlier registrations applied before it dispatches.
#[derive(Debug, Clone)]
pub struct RouteBus {
    register_tx: mpsc::Sender<RouteRequest>,
    dispatch_tx: mpsc::Sender<Command>,
}

impl RouteBus {
    /// Spawns the dispatcher. It runs until the shutdown broadcast or until every handle
    /// is dropped.
    pub fn start(
        config: &RouteConfig,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> RouteBus {
        let (register_tx, register_rx) = mpsc::channel(config.register_channel_capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_channel_capacity);

        let dispatcher = Dispatcher {
            clients: HashMap::with_capacity(1024),
            modules: HashMap::with_capacity(16),
            notify_handlers: BTreeMap::new(),
            register_rx,
            dispatch_rx,
            shutdown: Shutdown::subscribe(notify_shutdown),
            _shutdown_complete_tx: shutdown_complete_tx,
        };
        tokio::spawn(dispatcher.run());

        RouteBus {
            register_tx,
            dispatch_tx,
        }
    }

    /// Registers a client under its logical id, or a module under its instance id.
    /// A later registration under the same key replaces the earlier one.
    pub async fn register(&self, endpoint: EndpointRef, as_module: bool) -> AppResult<()> {
        debug!(
            "call route register {} logical:{} instance:{}",
            if as_module { "module" } else { "client" },
            endpoint.logical_id(),
            endpoint.instance_id()
        );
        self.send_request(RouteRequest::Register {
            endpoint,
            module: as_module,
        })
        .await
    }

    pub async fn unregister(&self, endpoint: EndpointRef) -> AppResult<()> {
        self.send_request(RouteRequest::Unregister { endpoint }).await
    }

    /// Queues a command for dispatch, waiting while the dispatch queue is full.
    pub async fn forward(&self, cmd: Command) -> AppResult<()> {
        self.dispatch_tx
            .send(cmd)
            .await
            .map_err(|e| AppError::ChannelSendError(format!("route bus stopped, drop {}", e.0)))
    }

    /// Non-waiting variant of [`RouteBus::forward`]; hands the command back when the
    /// queue is saturated.
    pub fn try_forward(&self, cmd: Command) -> Result<(), Command> {
        self.dispatch_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(cmd) | mpsc::error::TrySendError::Closed(cmd) => cmd,
        })
    }

    pub async fn register_notify_handler<F>(&self, name: &str, handler: F) -> AppResult<()>
    where
        F: Fn(&NotifyContext) + Send + Sync + 'static,
    {
        info!("register handler:{} to route", name);
        self.send_request(RouteRequest::AddNotifyHandler {
            name: name.to_string(),
            handler: Arc::new(handler),
        })
        .await
    }

    /// Asks every registered client endpoint to close.
    pub async fn close_all_clients(&self) -> AppResult<()> {
        self.send_request(RouteRequest::CloseAllClients).await
    }

    /// Registry sizes. Travels the registration queue, so every registration sent
    /// before this call has been applied when it returns.
    pub async fn stats(&self) -> AppResult<RouteStats> {
        let (tx, rx) = oneshot::channel();
        self.send_request(RouteRequest::Stats(tx)).await?;
        rx.await
            .map_err(|e| AppError::ChannelRecvError(format!("route stats: {}", e)))
    }

    /// Waits until all registration requests sent so far are applied.
    pub async fn sync(&self) -> AppResult<()> {
        self.stats().await.map(|_| ())
    }

    /// A bus whose queues nobody drains, so every request past `capacity` waits forever.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (RouteBus, DetachedQueues) {
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(capacity);
        (
            RouteBus {
                register_tx,
                dispatch_tx,
            },
            DetachedQueues {
                _register_rx: register_rx,
                _dispatch_rx: dispatch_rx,
            },
        )
    }

    async fn send_request(&self, request: RouteRequest) -> AppResult<()> {
        self.register_tx.send(request).await.map_err(|e| {
            AppError::ChannelSendError(format!("route bus stopped, drop {:?}", e.0))
        })
    }
}

#[cfg(test)]
pub(crate) struct DetachedQueues {
    _register_rx: mpsc::Receiver<RouteRequest>,
    _dispatch_rx: mpsc::Receiver<Command>,
}

/// Sole owner of the registry.
struct Dispatcher {
    clients: HashMap<LogicalId, EndpointRef>,
    modules: HashMap<u32, EndpointRef>,
    notify_handlers: BTreeMap<String, NotifyHandler>,
    register_rx: mpsc::Receiver<RouteRequest>,
    dispatch_rx: mpsc::Receiver<Command>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl Dispatcher {
    async fn run(mut self) {
        info!("route dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!("route prepare to exit");
                    break;
                }
                request = self.register_rx.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        // all handles are gone, nothing can register or forward anymore
                        while let Ok(cmd) = self.dispatch_rx.try_recv() {
                            self.dispatch(cmd);
                        }
                        info!("route handles dropped, dispatcher exit");
                        break;
                    }
                },
                Some(cmd) = self.dispatch_rx.recv() => self.dispatch(cmd),
            }
        }
        debug!(
            "route dispatcher stopped with {} clients and {} modules registered",
            self.clients.len(),
            self.modules.len()
        );
    }

    fn handle_request(&mut self, request: RouteRequest) {
        match request {
            RouteRequest::Register {
                endpoint,
                module: true,
            } => {
                let id = endpoint.instance_id();
                debug!("add module:{} to route", id);
                self.modules.insert(id, endpoint);
            }
            RouteRequest::Register {
                endpoint,
                module: false,
            } => {
                let id = endpoint.logical_id();
                let instance_id = endpoint.instance_id();
                if let Some(previous) = self.clients.insert(id, endpoint) {
                    if previous.instance_id() != instance_id {
                        info!(
                            "client:{} re-registered, instance {} replaces {}",
                            id,
                            instance_id,
                            previous.instance_id()
                        );
                    }
                }
                debug!("add client:{} to route", id);
                self.notify(NotifyContext {
                    logical_id: id,
                    instance_id,
                    kind: NotifyKind::Online,
                });
            }
            RouteRequest::Unregister { endpoint } => self.remove(endpoint),
            RouteRequest::AddNotifyHandler { name, handler } => {
                self.notify_handlers.insert(name, handler);
            }
            RouteRequest::CloseAllClients => {
                debug!("notify all {} clients to exit", self.clients.len());
                for client in self.clients.values() {
                    let client = client.clone();
                    guarded("close", client.logical_id(), move || client.close());
                }
            }
            RouteRequest::Stats(reply) => {
                let _ = reply.send(RouteStats {
                    clients: self.clients.len(),
                    modules: self.modules.len(),
                    notify_handlers: self.notify_handlers.len(),
                });
            }
        }
    }

    fn remove(&mut self, endpoint: EndpointRef) {
        let instance_id = endpoint.instance_id();
        if endpoint.is_internal() {
            if self.modules.remove(&instance_id).is_some() {
                info!("remove module:{} from route", instance_id);
            }
            return;
        }

        let id = endpoint.logical_id();
        match self.clients.get(&id) {
            Some(current) if current.instance_id() == instance_id => {
                self.clients.remove(&id);
                info!("remove client:{} from route", id);
            }
            Some(current) => {
                debug!(
                    "ignore unregister of client:{} instance {}, instance {} is registered",
                    id,
                    instance_id,
                    current.instance_id()
                );
                return;
            }
            None => {
                debug!("ignore unregister of unknown client:{}", id);
                return;
            }
        }

        self.notify(NotifyContext {
            logical_id: id,
            instance_id,
            kind: NotifyKind::Offline,
        });
        for module in self.modules.values() {
            let offline = Command::new(id, module.instance_id(), KIND_OFFLINE, Bytes::new());
            deliver_to(module, offline);
        }
    }

    fn notify(&self, context: NotifyContext) {
        for (name, handler) in &self.notify_handlers {
            let handler = handler.clone();
            let context = &context;
            guarded(name, context.logical_id, move || handler(context));
        }
    }

    fn dispatch(&self, cmd: Command) {
        trace!("got new {}", cmd);
        match cmd.destination() {
            Destination::Unicast(to) => self.dispatch_unicast(*to, cmd),
            Destination::Group(group) => {
                for &to in group.iter() {
                    self.dispatch_unicast(to, cmd.retarget(to));
                }
            }
        }
    }

    fn dispatch_unicast(&self, to: LogicalId, cmd: Command) {
        // modules shadow clients that share their id
        if let Some(module) = self.modules.get(&to) {
            deliver_to(module, cmd);
            return;
        }
        match self.clients.get(&to) {
            Some(client) => {
                trace!("route msg from:{} to:{}", cmd.from_id(), to);
                deliver_to(client, cmd);
            }
            None => {
                info!("{} from:{} to:{} is offline", cmd, cmd.from_id(), to);
            }
        }
    }
}

fn deliver_to(endpoint: &EndpointRef, cmd: Command) {
    let endpoint = endpoint.clone();
    let id = endpoint.logical_id();
    guarded("deliver", id, move || endpoint.deliver(cmd));
}

/// Runs endpoint or handler code without letting its panics reach the dispatcher.
fn guarded<F: FnOnce()>(what: &str, id: LogicalId, f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        error!(
            "{} for {} panicked: {}",
            what,
            id,
            panic_message(payload.as_ref())
        );
    }
}
