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

/// Fixed-capacity receive buffer.
///
/// Bytes are read into [`RecvBuffer::unfilled_mut`], made visible with
/// [`RecvBuffer::commit`], and once the session has decoded a prefix of them,
/// [`RecvBuffer::compact`] moves the undecoded tail back to offset 0. The buffer never
/// grows: a full buffer the session cannot make progress on is an overflow.
#[derive(Debug)]
pub struct RecvBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl RecvBuffer {
    pub fn with_capacity(capacity: usize) -> RecvBuffer {
        RecvBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Buffered, not yet consumed bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` bytes written into the unfilled tail as buffered.
    pub fn commit(&mut self, n: usize) {
        assert!(
            self.len + n <= self.data.len(),
            "commit {} bytes overflows buffer of {} with {} buffered",
            n,
            self.data.len(),
            self.len
        );
        self.len += n;
    }

    /// Drops the first `consumed` bytes and moves the remainder to the start.
    pub fn compact(&mut self, consumed: usize) {
        let consumed = consumed.min(self.len);
        if consumed == 0 {
            return;
        }
        if consumed < self.len {
            self.data.copy_within(consumed..self.len, 0);
        }
        self.len -= consumed;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn fill(buffer: &mut RecvBuffer, bytes: &[u8]) {
        buffer.unfilled_mut()[..bytes.len()].copy_from_slice(bytes);
        buffer.commit(bytes.len());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(4)]
    #[case(9)]
    #[case(10)]
    fn compact_preserves_unconsumed_tail(#[case] consumed: usize) {
        let mut buffer = RecvBuffer::with_capacity(16);
        let payload: Vec<u8> = (0u8..10).collect();
        fill(&mut buffer, &payload);

        buffer.compact(consumed);

        assert_eq!(buffer.len(), payload.len() - consumed);
        assert_eq!(buffer.filled(), &payload[consumed..]);
        assert_eq!(buffer.unfilled_mut().len(), 16 - buffer.len());
    }

    #[test]
    fn repeated_fill_and_compact() {
        let mut buffer = RecvBuffer::with_capacity(8);
        fill(&mut buffer, b"abcdef");
        buffer.compact(4);
        assert_eq!(buffer.filled(), b"ef");

        fill(&mut buffer, b"ghijkl");
        assert!(buffer.is_full());
        assert_eq!(buffer.filled(), b"efghijkl");

        buffer.compact(8);
        assert!(buffer.is_empty());
        assert_eq!(buffer.unfilled_mut().len(), 8);
    }

    #[test]
    fn over_compaction_is_clamped() {
        let mut buffer = RecvBuffer::with_capacity(4);
        fill(&mut buffer, b"xy");
        buffer.compact(10);
        assert!(buffer.is_empty());
    }

    #[test]
    #[should_panic(expected = "overflows buffer")]
    fn commit_past_capacity_panics() {
        let mut buffer = RecvBuffer::with_capacity(4);
        buffer.commit(5);
    }
}
