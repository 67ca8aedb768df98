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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// The only parts of a running connection that other tasks may touch.
///
/// Cloning is cheap; all clones control the same connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    close: CancellationToken,
    recv_timeout_ms: Arc<AtomicU64>,
}

impl ConnectionHandle {
    pub fn new(recv_timeout: Duration) -> ConnectionHandle {
        ConnectionHandle {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            close: CancellationToken::new(),
            recv_timeout_ms: Arc::new(AtomicU64::new(recv_timeout.as_millis() as u64)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Asks the engine to stop. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Takes effect from the next read.
    pub fn update_read_deadline(&self, recv_timeout: Duration) {
        let millis = (recv_timeout.as_millis() as u64).max(1);
        self.recv_timeout_ms.store(millis, Ordering::Relaxed);
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_close_is_shared() {
        let a = ConnectionHandle::new(Duration::from_millis(50));
        let b = ConnectionHandle::new(Duration::from_millis(50));
        assert_ne!(a.id(), b.id());

        let a2 = a.clone();
        a2.close();
        a2.close();
        assert!(a.is_closed());
        assert!(!b.is_closed());
    }

    #[test]
    fn read_deadline_update_is_visible_to_clones() {
        let handle = ConnectionHandle::new(Duration::from_millis(50));
        let clone = handle.clone();
        clone.update_read_deadline(Duration::from_millis(250));
        assert_eq!(handle.recv_timeout(), Duration::from_millis(250));

        handle.update_read_deadline(Duration::ZERO);
        assert_eq!(clone.recv_timeout(), Duration::from_millis(1));
    }
}
