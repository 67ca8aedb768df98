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

use std::path::Path;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

pub static GLOBAL_CONFIG: OnceCell<ServerConfig> = OnceCell::new();

/// Process-wide configuration, falling back to defaults when nothing was loaded.
pub fn global_config() -> &'static ServerConfig {
    GLOBAL_CONFIG.get_or_init(ServerConfig::default)
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub id: i32,
    pub name: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            id: 0,
            name: "netbus".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// fixed size of every connection's receive buffer
    pub recv_buffer_size: usize,
    pub recv_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub max_package_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            ip: "127.0.0.1".to_string(),
            port: 9090,
            max_connection: 1024,
            recv_buffer_size: 16384 * 2,
            recv_timeout_ms: 50,
            write_timeout_ms: 500,
            max_package_size: 16384,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouteConfig {
    pub register_channel_capacity: usize,
    pub dispatch_channel_capacity: usize,
}

impl Default for RouteConfig {
    fn default() -> Self {
        RouteConfig {
            register_channel_capacity: 1024,
            dispatch_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// queued commands older than this are discarded
    pub ttl_secs: u64,
    /// how long one delivery attempt may wait for the sink
    pub attempt_window_ms: u64,
    pub max_queued: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            ttl_secs: 30,
            attempt_window_ms: 200,
            max_queued: 4096,
        }
    }
}

impl RelayConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
    pub fn attempt_window(&self) -> Duration {
        Duration::from_millis(self.attempt_window_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub mailbox_capacity: usize,
    pub module_channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            mailbox_capacity: 256,
            module_channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    pub listen: String,
    pub upstream: String,
    pub channel_capacity: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            enabled: false,
            listen: "127.0.0.1:1080".to_string(),
            upstream: "127.0.0.1:8080".to_string(),
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub route: RouteConfig,
    pub relay: RelayConfig,
    pub gateway: GatewayConfig,
    pub tunnel: TunnelConfig,
}

impl ServerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("NETBUS").separator("__"))
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    fn validate(&self) -> AppResult<()> {
        if self.network.max_package_size + 4 > self.network.recv_buffer_size {
            return Err(AppError::InvalidValue(format!(
                "recv_buffer_size {} cannot hold a frame of max_package_size {}",
                self.network.recv_buffer_size, self.network.max_package_size
            )));
        }
        if self.route.dispatch_channel_capacity == 0 || self.route.register_channel_capacity == 0
        {
            return Err(AppError::InvalidValue(
                "route channel capacity must be positive".to_string(),
            ));
        }
        if self.gateway.mailbox_capacity == 0 || self.tunnel.channel_capacity == 0 {
            return Err(AppError::InvalidValue(
                "mailbox and tunnel capacities must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
