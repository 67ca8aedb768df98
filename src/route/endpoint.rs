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

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::network::ConnectionHandle;
use crate::route::{Command, LogicalId};

/// Instance ids below this value are reserved for statically numbered modules.
pub const FIRST_DYNAMIC_INSTANCE_ID: u32 = 1024;

static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(FIRST_DYNAMIC_INSTANCE_ID);

pub fn alloc_instance_id() -> u32 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Something the route bus can deliver commands to.
///
/// `deliver` is called on the dispatcher task and must never wait.
pub trait Endpoint: Send + Sync + Debug {
    fn instance_id(&self) -> u32;

    fn logical_id(&self) -> LogicalId;

    fn deliver(&self, cmd: Command);

    /// Internal modules report `true`; they are keyed by instance id.
    fn is_internal(&self) -> bool {
        false
    }

    fn close(&self) {}
}

pub type EndpointRef = Arc<dyn Endpoint>;

/// Endpoint backed by a bounded channel, drained by whoever owns the receiver.
///
/// A full mailbox drops the command; the owner is expected to drain it on every idle
/// tick of its connection.
#[derive(Debug)]
pub struct MailboxEndpoint {
    instance_id: u32,
    logical_id: LogicalId,
    internal: bool,
    mailbox: mpsc::Sender<Command>,
    connection: Option<ConnectionHandle>,
}

impl MailboxEndpoint {
    pub fn new(
        instance_id: u32,
        logical_id: LogicalId,
        capacity: usize,
    ) -> (MailboxEndpoint, mpsc::Receiver<Command>) {
        let (mailbox, rx) = mpsc::channel(capacity);
        let endpoint = MailboxEndpoint {
            instance_id,
            logical_id,
            internal: false,
            mailbox,
            connection: None,
        };
        (endpoint, rx)
    }

    pub fn internal(mut self) -> MailboxEndpoint {
        self.internal = true;
        self
    }

    /// `close` will then stop that connection.
    pub fn with_connection(mut self, connection: ConnectionHandle) -> MailboxEndpoint {
        self.connection = Some(connection);
        self
    }
}

impl Endpoint for MailboxEndpoint {
    fn instance_id(&self) -> u32 {
        self.instance_id
    }

    fn logical_id(&self) -> LogicalId {
        self.logical_id
    }

    fn deliver(&self, cmd: Command) {
        match self.mailbox.try_send(cmd) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(cmd)) => {
                warn!(
                    "mailbox of {} (instance {}) is full, drop {}",
                    self.logical_id, self.instance_id, cmd
                );
            }
            Err(mpsc::error::TrySendError::Closed(cmd)) => {
                debug!(
                    "mailbox of {} (instance {}) is closed, drop {}",
                    self.logical_id, self.instance_id, cmd
                );
            }
        }
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    fn close(&self) {
        if let Some(connection) = &self.connection {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    #[test]
    fn full_mailbox_drops_without_blocking() {
        let (endpoint, mut rx) = MailboxEndpoint::new(alloc_instance_id(), 5, 1);
        endpoint.deliver(Command::new(1, 5, 1, Bytes::from_static(b"first")));
        endpoint.deliver(Command::new(1, 5, 1, Bytes::from_static(b"second")));

        assert_eq!(rx.try_recv().unwrap().payload(), &Bytes::from_static(b"first"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn close_reaches_connection() {
        let handle = ConnectionHandle::new(Duration::from_millis(50));
        let (endpoint, _rx) = MailboxEndpoint::new(alloc_instance_id(), 5, 1);
        let endpoint = endpoint.with_connection(handle.clone());
        assert!(!endpoint.is_internal());
        endpoint.close();
        assert!(handle.is_closed());
    }

    #[test]
    fn dynamic_instance_ids_skip_reserved_range() {
        let a = alloc_instance_id();
        let b = alloc_instance_id();
        assert!(a >= FIRST_DYNAMIC_INSTANCE_ID);
        assert!(b > a);
    }
}
