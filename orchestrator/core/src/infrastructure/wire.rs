// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Message Wire Codec
//!
//! Newline-delimited JSON framing for protocol [`Message`]s over any
//! ordered byte stream. Each frame is one JSON object on one line.
//!
//! Decoding runs the full field check of [`Message::from_json`], so a peer
//! sending an unknown type or a field outside its type's contract gets a
//! [`ProtocolError`] instead of a message.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};

use crate::domain::protocol::{Message, ProtocolError};

/// Longest accepted line; step output is chunked well below this
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

pub struct MessageCodec {
    lines: LinesCodec,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_FRAME_LENGTH),
        }
    }

    fn parse(line: &str) -> Result<Message, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Message::from_json(value)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn lines_error(err: LinesCodecError) -> ProtocolError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            ProtocolError::Malformed(format!("frame longer than {} bytes", MAX_FRAME_LENGTH))
        }
        LinesCodecError::Io(e) => e.into(),
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.lines.decode(src).map_err(lines_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Self::parse(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            match self.lines.decode_eof(src).map_err(lines_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Self::parse(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let line = serde_json::to_string(&message.to_json())
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        self.lines.encode(line, dst).map_err(lines_error)
    }
}

/// Wraps a byte stream in the message codec
pub fn framed<T>(io: T) -> Framed<T, MessageCodec>
where
    T: AsyncRead + AsyncWrite,
{
    Framed::new(io, MessageCodec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::protocol::MessageType;
    use futures::{SinkExt, StreamExt};

    #[tokio::test]
    async fn test_messages_cross_a_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let mut client = framed(client);
        let mut server = framed(server);

        client
            .send(Message::build_request("s1", "defs", "master", "systems/base", None))
            .await
            .unwrap();
        client.send(Message::exec_cancel("s1")).await.unwrap();

        let first = server.next().await.unwrap().unwrap();
        assert_eq!(first.message_type(), MessageType::BuildRequest);
        assert_eq!(first.get_str("morphology"), Some("systems/base"));
        let second = server.next().await.unwrap().unwrap();
        assert_eq!(second, Message::exec_cancel("s1"));
    }

    #[test]
    fn test_decode_rejects_contract_violation() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"exec-cancel\",\"id\":\"1\",\"force\":true}\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::FieldNotAllowed { ref field, .. } if field == "force"));
    }

    #[test]
    fn test_decode_rejects_non_json() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&b"hello\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_partial_frame_waits_for_newline() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Message::step_started("1", "abc", "w1"), &mut buf)
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 5);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let message = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(message.get_str("worker_name"), Some("w1"));
    }
}
