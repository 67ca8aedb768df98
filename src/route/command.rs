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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

pub type LogicalId = u32;
pub type CommandKind = u16;

/// Kinds at or above this value are produced by the bus and its modules.
pub const KIND_RESERVED_BASE: CommandKind = 0xFF00;
/// Sent by the bus to every module when a client leaves; `from` is the departed id.
pub const KIND_OFFLINE: CommandKind = 0xFF01;
/// Injected into modules that track presence when a client comes online.
pub const KIND_ONLINE: CommandKind = 0xFF02;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_seq() -> u64 {
    NEXT_SEQ.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Unicast(LogicalId),
    Group(Arc<[LogicalId]>),
}

/// Addressed message exchanged through the route bus. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    from: LogicalId,
    to: Destination,
    kind: CommandKind,
    payload: Bytes,
    seq: u64,
}

impl Command {
    pub fn new(
        from: LogicalId,
        to: LogicalId,
        kind: CommandKind,
        payload: impl Into<Bytes>,
    ) -> Command {
        Command {
            from,
            to: Destination::Unicast(to),
            kind,
            payload: payload.into(),
            seq: next_seq(),
        }
    }

    pub fn broadcast(
        from: LogicalId,
        group: impl Into<Arc<[LogicalId]>>,
        kind: CommandKind,
        payload: impl Into<Bytes>,
    ) -> Command {
        Command {
            from,
            to: Destination::Group(group.into()),
            kind,
            payload: payload.into(),
            seq: next_seq(),
        }
    }

    pub fn from_id(&self) -> LogicalId {
        self.from
    }

    /// Destination of a unicast command, `None` for a group.
    pub fn to_id(&self) -> Option<LogicalId> {
        match self.to {
            Destination::Unicast(to) => Some(to),
            Destination::Group(_) => None,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.to
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Unicast copy for one member of a group; keeps the sequence id.
    pub(crate) fn retarget(&self, to: LogicalId) -> Command {
        Command {
            from: self.from,
            to: Destination::Unicast(to),
            kind: self.kind,
            payload: self.payload.clone(),
            seq: self.seq,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.to {
            Destination::Unicast(to) => write!(
                f,
                "cmd#{} kind:{:#06x} from:{} to:{} len:{}",
                self.seq,
                self.kind,
                self.from,
                to,
                self.payload.len()
            ),
            Destination::Group(group) => write!(
                f,
                "cmd#{} kind:{:#06x} from:{} group:{:?} len:{}",
                self.seq,
                self.kind,
                self.from,
                group,
                self.payload.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_ids_increase() {
        let a = Command::new(1, 2, 7, Bytes::new());
        let b = Command::new(1, 2, 7, Bytes::new());
        assert!(b.seq() > a.seq());
    }

    #[test]
    fn retarget_keeps_identity_but_not_group() {
        let group: Vec<LogicalId> = vec![3, 4, 5];
        let cmd = Command::broadcast(9, group, 11, "hi");
        assert_eq!(cmd.to_id(), None);

        let copy = cmd.retarget(4);
        assert_eq!(copy.to_id(), Some(4));
        assert_eq!(copy.seq(), cmd.seq());
        assert_eq!(copy.from_id(), 9);
        assert_eq!(copy.payload(), &Bytes::from_static(b"hi"));
    }

    #[test]
    fn display_is_compact() {
        let cmd = Command::new(7, 9, 0x10, "ping");
        let text = cmd.to_string();
        assert!(text.contains("from:7 to:9"));
        assert!(text.contains("kind:0x0010"));
    }
}
