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

use tokio::sync::{broadcast, mpsc};
use tokio::runtime::Runtime;
use tokio::signal;
use tracing::{debug, error, info, trace};

use crate::apps::{start_presence, GatewayFactory, TunnelFactory};
use crate::route::RouteBus;
use crate::service::{global_config, Server, ServerConfig, SessionFactory};
use crate::AppResult;

/// Process wiring: route bus, presence module, gateway server and the optional tunnel.
#[derive(Debug, Default)]
pub struct Broker;

impl Broker {
    pub fn new() -> Self {
        Broker
    }

    /// Runs until ctrl-c, then shuts everything down and waits for it to finish.
    pub fn start(&mut self, rt: &Runtime) -> AppResult<()> {
        rt.block_on(Self::run(global_config(), async {
            if let Err(e) = signal::ctrl_c().await {
                error!("listen for ctrl-c failed: {}", e);
            }
            info!("get shutdown signal");
        }))?;
        info!("broker shutdown complete");
        Ok(())
    }

    async fn run(config: &ServerConfig, stop: impl Future<Output = ()>) -> AppResult<()> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

        let bus = RouteBus::start(&config.route, &notify_shutdown, shutdown_complete_tx.clone());
        let presence =
            start_presence(&bus, config, &notify_shutdown, shutdown_complete_tx.clone()).await?;

        let gateway = Server::bind(
            &config.network.listen_address(),
            config.network.max_connection,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
            GatewayFactory::new(bus.clone(), config),
            config.network.recv_timeout(),
        )
        .await?;

        let tunnel = if config.tunnel.enabled {
            info!(
                "tunnel enabled: {} -> {}",
                config.tunnel.listen, config.tunnel.upstream
            );
            Some(
                Server::bind(
                    &config.tunnel.listen,
                    config.network.max_connection,
                    notify_shutdown.clone(),
                    shutdown_complete_tx.clone(),
                    TunnelFactory::new(config),
                    config.network.recv_timeout(),
                )
                .await?,
            )
        } else {
            None
        };
        drop(shutdown_complete_tx);

        tokio::select! {
            res = gateway.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "failed to accept");
                }
            }
            res = run_optional(tunnel.as_ref()) => {
                if let Err(err) = res {
                    error!(cause = %err, "tunnel failed to accept");
                }
            }
            _ = stop => {}
        }

        // clients first, so their cleanup still finds a running bus
        if let Err(e) = bus.close_all_clients().await {
            debug!("close all clients skipped: {}", e);
        }
        if notify_shutdown.send(()).is_err() {
            debug!("no task was listening for shutdown");
        }
        drop(gateway);
        drop(tunnel);
        drop(presence);
        drop(bus);

        // wait for shutdown complete
        trace!("waiting for shutdown complete...");
        let _ = shutdown_complete_rx.recv().await;
        Ok(())
    }
}

async fn run_optional<F: SessionFactory>(server: Option<&Server<F>>) -> AppResult<()> {
    match server {
        Some(server) => server.run().await,
        None => std::future::pending().await,
    }
}
