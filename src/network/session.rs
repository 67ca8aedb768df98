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

use bytes::Bytes;

use crate::AppResult;

/// Result of one decode step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    consumed: usize,
    reply: Option<Bytes>,
}

impl Decoded {
    /// Not enough bytes buffered yet for a complete message.
    pub fn incomplete() -> Decoded {
        Decoded::default()
    }

    pub fn consumed(consumed: usize) -> Decoded {
        Decoded {
            consumed,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: Bytes) -> Decoded {
        if !reply.is_empty() {
            self.reply = Some(reply);
        }
        self
    }

    pub fn bytes_consumed(&self) -> usize {
        self.consumed
    }

    pub fn reply(&self) -> Option<&Bytes> {
        self.reply.as_ref()
    }

    pub fn into_parts(self) -> (usize, Option<Bytes>) {
        (self.consumed, self.reply)
    }
}

/// Protocol hooks driven by a [`Connection`](super::Connection).
///
/// Every hook is optional; the defaults discard input, produce no idle output and clean
/// nothing. Hooks run inline on the connection's own task, so any await inside them must
/// be bounded by a short deadline. A protocol that changes phase (handshake, then data)
/// keeps the phase as internal state of its session.
pub trait Session: Send {
    /// Decodes at most one message from the front of `buf`.
    ///
    /// Returning zero consumed bytes asks for more input; an error tears the connection
    /// down because the stream can no longer be trusted to be in sync.
    fn decode(&mut self, buf: &[u8]) -> impl Future<Output = AppResult<Decoded>> + Send {
        let len = buf.len();
        async move { Ok(Decoded::consumed(len)) }
    }

    /// Called whenever a read times out without data. Returned bytes are written out.
    fn idle(&mut self) -> impl Future<Output = AppResult<Option<Bytes>>> + Send {
        async { Ok(None) }
    }

    /// Called exactly once when the connection is torn down, whatever the reason.
    fn clean(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }
}
