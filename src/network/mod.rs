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

//! Network Module Implementation
//!
//! This module provides the per-connection byte-stream engine and the session seam that
//! protocol implementations plug into.
//!
//! # Architecture
//!
//! The module is built on tokio's async I/O primitives and consists of:
//! - `Connection`: owns one duplex stream and runs the read/decode/write loop
//! - `Session`: the decode/idle/clean hooks a protocol supplies
//! - `RecvBuffer`: the fixed-capacity receive buffer with compaction
//! - `ConnectionHandle`: close signal and read-deadline control for other tasks
//!
//! # Features
//!
//! - Incremental frame reassembly across arbitrary read boundaries
//! - Idle callbacks on read timeouts for externally sourced output
//! - Bounded write deadlines
//! - Cleanup on every exit path, panics included

pub use buffer::RecvBuffer;
pub use connection::{Connection, ConnectionOptions};
pub use handle::ConnectionHandle;
pub use session::{Decoded, Session};

mod buffer;
mod connection;
mod handle;
mod session;
