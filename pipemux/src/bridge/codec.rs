//! Framed codecs for the physical stream and the control channel.
//!
//! Both use LengthDelimitedCodec for framing. `FrameCodec` carries the binary
//! multiplexer frames; `JsonCodec` carries serde_json control messages inside
//! the control channel's byte stream.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, logical channels).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::frame::{
    ChannelId, ChannelRole, FRAME_HEADER_LEN, Frame, MAX_DATA_PAYLOAD, MAX_FRAME_BODY,
    MalformedFrame, kind,
};

/// Codec for multiplexer frames: `len:u32 | channel:u32 | kind:u8 | payload`.
///
/// Decoding yields `Err(MalformedFrame)` items for bodies that can be
/// attributed to a channel but are otherwise invalid; only a broken length
/// prefix or a truncated header surfaces as an `io::Error`.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BODY)
                .new_codec(),
        }
    }
}

fn decode_body(mut body: BytesMut) -> Result<Result<Frame, MalformedFrame>, io::Error> {
    if body.len() < FRAME_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame body too short: {} bytes", body.len()),
        ));
    }
    let channel = ChannelId::new(body.get_u32());
    let frame_kind = body.get_u8();
    let malformed = |reason: String| Ok(Err(MalformedFrame { channel, reason }));

    let frame = match frame_kind {
        kind::OPEN => {
            if body.len() != 1 {
                return malformed(format!("open payload must be 1 byte, got {}", body.len()));
            }
            let byte = body.get_u8();
            match ChannelRole::from_wire(byte) {
                Some(role) => Frame::Open { channel, role },
                None => return malformed(format!("unknown channel role {byte}")),
            }
        }
        kind::DATA => Frame::Data {
            channel,
            payload: body.freeze(),
        },
        kind::ACK => {
            if body.len() != 4 {
                return malformed(format!("ack payload must be 4 bytes, got {}", body.len()));
            }
            Frame::Ack {
                channel,
                bytes: body.get_u32(),
            }
        }
        kind::EOF => Frame::Eof { channel },
        kind::CLOSE => Frame::Close { channel },
        kind::ERROR => Frame::Error {
            channel,
            message: String::from_utf8_lossy(&body).into_owned(),
        },
        other => return malformed(format!("unknown frame kind {other}")),
    };
    Ok(Ok(frame))
}

impl Decoder for FrameCodec {
    type Item = Result<Frame, MalformedFrame>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(body) => decode_body(body).map(Some),
            None => Ok(None),
        }
    }
}

/// Cut `message` to at most `max` bytes without splitting a UTF-8 sequence.
fn truncate_utf8(message: &str, max: usize) -> &str {
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let channel = frame.channel().get();
        let body = match frame {
            Frame::Open { role, .. } => {
                let mut body = header(channel, kind::OPEN, 1);
                body.put_u8(role.to_wire());
                body
            }
            Frame::Data { payload, .. } => {
                if payload.len() > MAX_DATA_PAYLOAD {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("data payload of {} bytes exceeds frame limit", payload.len()),
                    ));
                }
                let mut body = header(channel, kind::DATA, payload.len());
                body.put_slice(&payload);
                body
            }
            Frame::Ack { bytes, .. } => {
                let mut body = header(channel, kind::ACK, 4);
                body.put_u32(bytes);
                body
            }
            Frame::Eof { .. } => header(channel, kind::EOF, 0),
            Frame::Close { .. } => header(channel, kind::CLOSE, 0),
            Frame::Error { message, .. } => {
                let message = truncate_utf8(&message, MAX_DATA_PAYLOAD);
                let mut body = header(channel, kind::ERROR, message.len());
                body.put_slice(message.as_bytes());
                body
            }
        };
        self.inner.encode(body.freeze(), dst)
    }
}

fn header(channel: u32, frame_kind: u8, payload_len: usize) -> BytesMut {
    let mut body = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
    body.put_u32(channel);
    body.put_u8(frame_kind);
    body
}

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding control message");
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{ControlEvent, ControlRequest, RequestId};

    fn raw_frame(channel: u32, frame_kind: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u32((FRAME_HEADER_LEN + payload.len()) as u32);
        buf.put_u32(channel);
        buf.put_u8(frame_kind);
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn interleaved_frames_keep_per_channel_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let a = ChannelId::new(2);
        let b = ChannelId::new(3);

        let frames = vec![
            Frame::Open { channel: a, role: ChannelRole::ExecStdout },
            Frame::Data { channel: a, payload: Bytes::from_static(b"one") },
            Frame::Open { channel: b, role: ChannelRole::SocketData },
            Frame::Data { channel: b, payload: Bytes::from_static(b"x") },
            Frame::Data { channel: a, payload: Bytes::from_static(b"two") },
            Frame::Ack { channel: b, bytes: 4096 },
            Frame::Eof { channel: a },
            Frame::Close { channel: a },
            Frame::Error { channel: b, message: "boom".to_string() },
        ];
        for frame in frames.clone() {
            codec.encode(frame, &mut buf).unwrap();
        }

        let mut decoded = Vec::new();
        while let Some(item) = codec.decode(&mut buf).unwrap() {
            decoded.push(item.unwrap());
        }
        assert_eq!(decoded, frames);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_waits_for_more_bytes() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(
                Frame::Data { channel: ChannelId::new(4), payload: Bytes::from_static(b"hello") },
                &mut full,
            )
            .unwrap();

        let mut partial = full.split_to(6);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        let frame = codec.decode(&mut partial).unwrap().unwrap().unwrap();
        assert_eq!(frame.channel(), ChannelId::new(4));
    }

    #[test]
    fn unknown_kind_is_malformed_not_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = raw_frame(9, 42, b"");
        buf.unsplit(raw_frame(2, kind::EOF, b""));

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            first,
            Err(MalformedFrame { channel: ChannelId::new(9), reason: "unknown frame kind 42".into() })
        );
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, Ok(Frame::Eof { channel: ChannelId::new(2) }));
    }

    #[test]
    fn bad_role_and_bad_ack_are_malformed() {
        let mut codec = FrameCodec::new();
        let mut buf = raw_frame(3, kind::OPEN, &[99]);
        buf.unsplit(raw_frame(3, kind::ACK, &[0, 1]));

        let open = codec.decode(&mut buf).unwrap().unwrap().unwrap_err();
        assert_eq!(open.reason, "unknown channel role 99");
        let ack = codec.decode(&mut buf).unwrap().unwrap().unwrap_err();
        assert_eq!(ack.reason, "ack payload must be 4 bytes, got 2");
    }

    #[test]
    fn truncated_header_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0, 1]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_length_prefix_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_BODY + 1) as u32);
        buf.put_slice(&[0; 16]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_data_is_rejected_on_encode() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let frame = Frame::Data {
            channel: ChannelId::new(2),
            payload: Bytes::from(vec![0u8; MAX_DATA_PAYLOAD + 1]),
        };
        let err = codec.encode(frame, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn long_error_messages_are_truncated_on_char_boundary() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        let message = "é".repeat(MAX_DATA_PAYLOAD);
        codec
            .encode(Frame::Error { channel: ChannelId::new(5), message }, &mut buf)
            .unwrap();
        match codec.decode(&mut buf).unwrap().unwrap().unwrap() {
            Frame::Error { message, .. } => {
                assert!(message.len() <= MAX_DATA_PAYLOAD);
                assert!(message.chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn json_codec_control_request() {
        let mut codec = JsonCodec::<ControlRequest>::new();
        let mut buf = BytesMut::new();

        let request = RequestId::new();
        codec
            .encode(ControlRequest::OpenSocket { request }, &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(decoded, ControlRequest::OpenSocket { request: r } if r == request));
    }

    #[test]
    fn json_codec_control_event() {
        let mut codec = JsonCodec::<ControlEvent>::new();
        let mut buf = BytesMut::new();

        let request = RequestId::new();
        codec
            .encode(ControlEvent::ExecFinished { request, exit_code: 3 }, &mut buf)
            .unwrap();
        match codec.decode(&mut buf).unwrap().unwrap() {
            ControlEvent::ExecFinished { request: r, exit_code } => {
                assert_eq!(r, request);
                assert_eq!(exit_code, 3);
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn json_codec_rejects_garbage() {
        let mut codec = JsonCodec::<ControlEvent>::new();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_slice(b"{x}");
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decoder_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
                let mut codec = FrameCodec::new();
                let mut buf = BytesMut::from(&data[..]);
                // Stop at the first fatal error, as the reader task does.
                while let Ok(Some(_)) = codec.decode(&mut buf) {}
            }
        }
    }
}
