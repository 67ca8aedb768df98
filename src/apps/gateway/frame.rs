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

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::route::{Command, CommandKind, LogicalId};
use crate::AppError::Incomplete;
use crate::{AppError, AppResult};

/// `u32 body_len`
pub const LENGTH_FIELD_SIZE: usize = 4;
/// `u16 kind | u32 from | u32 to`
pub const HEADER_SIZE: usize = 10;

/// One gateway frame: `u32 body_len | u16 kind | u32 from | u32 to | payload`, big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub kind: CommandKind,
    pub from: LogicalId,
    pub to: LogicalId,
    pub payload: Bytes,
}

impl CommandFrame {
    pub fn new(kind: CommandKind, from: LogicalId, to: LogicalId, payload: impl Into<Bytes>) -> Self {
        CommandFrame {
            kind,
            from,
            to,
            payload: payload.into(),
        }
    }

    /// Returns the total frame length once `buffer` holds a whole frame.
    pub fn check(buffer: &[u8], max_package_size: usize) -> AppResult<usize> {
        if buffer.len() < LENGTH_FIELD_SIZE {
            return Err(Incomplete);
        }
        let mut length_field = &buffer[..LENGTH_FIELD_SIZE];
        let body_size = length_field.get_u32() as usize;
        if body_size < HEADER_SIZE {
            return Err(AppError::MalformedProtocol(format!(
                "frame body of {} bytes is shorter than its header",
                body_size
            )));
        }
        if body_size > max_package_size {
            return Err(AppError::MalformedProtocol(format!(
                "Frame of length {} is too large.",
                body_size
            )));
        }
        if buffer.len() < body_size + LENGTH_FIELD_SIZE {
            return Err(Incomplete);
        }
        Ok(body_size + LENGTH_FIELD_SIZE)
    }

    /// Parses the frame at the start of `buffer`; `None` when more bytes are needed.
    pub fn parse(buffer: &[u8], max_package_size: usize) -> AppResult<Option<(CommandFrame, usize)>> {
        match CommandFrame::check(buffer, max_package_size) {
            Ok(frame_len) => {
                let mut body = &buffer[LENGTH_FIELD_SIZE..frame_len];
                let kind = body.get_u16();
                let from = body.get_u32();
                let to = body.get_u32();
                let frame = CommandFrame {
                    kind,
                    from,
                    to,
                    payload: Bytes::copy_from_slice(body),
                };
                Ok(Some((frame, frame_len)))
            }
            Err(AppError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn encoded_len(&self) -> usize {
        LENGTH_FIELD_SIZE + HEADER_SIZE + self.payload.len()
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32((HEADER_SIZE + self.payload.len()) as u32);
        buf.put_u16(self.kind);
        buf.put_u32(self.from);
        buf.put_u32(self.to);
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}

impl From<&Command> for CommandFrame {
    fn from(cmd: &Command) -> Self {
        CommandFrame {
            kind: cmd.kind(),
            from: cmd.from_id(),
            to: cmd.to_id().unwrap_or_default(),
            payload: cmd.payload().clone(),
        }
    }
}

/// Group payload: `u16 count | count * u32 id | message`.
pub fn encode_group(ids: &[LogicalId], message: &[u8]) -> AppResult<Bytes> {
    let count = u16::try_from(ids.len()).map_err(|_| {
        AppError::InvalidValue(format!(
            "group of {} members, at most {} fit",
            ids.len(),
            u16::MAX
        ))
    })?;
    let mut buf = BytesMut::with_capacity(2 + ids.len() * 4 + message.len());
    buf.put_u16(count);
    for id in ids {
        buf.put_u32(*id);
    }
    buf.put_slice(message);
    Ok(buf.freeze())
}

pub fn decode_group(payload: &Bytes) -> AppResult<(Vec<LogicalId>, Bytes)> {
    let mut body = payload.clone();
    if body.remaining() < 2 {
        return Err(AppError::MalformedProtocol(
            "group payload without member count".to_string(),
        ));
    }
    let count = body.get_u16() as usize;
    if body.remaining() < count * 4 {
        return Err(AppError::MalformedProtocol(format!(
            "group payload announces {} members but carries {} bytes",
            count,
            body.remaining()
        )));
    }
    let ids = (0..count).map(|_| body.get_u32()).collect();
    Ok((ids, body))
}

/// Sorted id list payload: `count * u32 id`.
pub fn decode_id_list(payload: &[u8]) -> AppResult<Vec<LogicalId>> {
    if payload.len() % 4 != 0 {
        return Err(AppError::MalformedProtocol(format!(
            "id list of {} bytes",
            payload.len()
        )));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|mut chunk| chunk.get_u32())
        .collect())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const MAX: usize = 16 * 1024;

    #[test]
    fn parse_reads_header_and_payload() {
        let frame = CommandFrame::new(3, 7, 9, "ping");
        let mut wire = BytesMut::new();
        frame.write_to(&mut wire);
        wire.put_slice(b"trailing");

        let (parsed, used) = CommandFrame::parse(&wire, MAX).unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(used, 4 + 10 + 4);
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(4)]
    #[case(13)]
    fn parse_waits_for_whole_frame(#[case] available: usize) {
        let wire = CommandFrame::new(3, 7, 9, "ping").encode();
        assert!(CommandFrame::parse(&wire[..available], MAX).unwrap().is_none());
    }

    #[rstest]
    #[case(9, "shorter than its header")]
    #[case(MAX + 1, "too large")]
    fn parse_rejects_bad_length(#[case] body_len: usize, #[case] reason: &str) {
        let mut wire = BytesMut::new();
        wire.put_u32(body_len as u32);
        wire.put_slice(&[0u8; 16]);
        match CommandFrame::parse(&wire, MAX) {
            Err(AppError::MalformedProtocol(msg)) => assert!(msg.contains(reason), "{}", msg),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn group_payload_splits_members_and_message() {
        let payload = encode_group(&[4, 5], b"hello").unwrap();
        let (ids, message) = decode_group(&payload).unwrap();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(&message[..], b"hello");

        let truncated = payload.slice(..5);
        assert!(decode_group(&truncated).is_err());
    }

    #[test]
    fn group_count_must_fit_the_header() {
        let largest: Vec<LogicalId> = (0..u16::MAX as LogicalId).collect();
        let payload = encode_group(&largest, b"").unwrap();
        assert_eq!(decode_group(&payload).unwrap().0.len(), u16::MAX as usize);

        let too_many: Vec<LogicalId> = (0..=u16::MAX as LogicalId).collect();
        assert!(matches!(
            encode_group(&too_many, b"lost"),
            Err(AppError::InvalidValue(_))
        ));
    }

    #[test]
    fn id_list_must_be_whole_ids() {
        assert_eq!(decode_id_list(&[0, 0, 0, 7, 0, 0, 0, 9]).unwrap(), vec![7, 9]);
        assert!(decode_id_list(&[0, 0, 7]).is_err());
    }
}
