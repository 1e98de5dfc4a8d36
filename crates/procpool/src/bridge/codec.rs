//! Framed codec for worker communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! Framing errors are fatal to the stream. A well-framed payload that does not
//! decode is yielded as `Ok(Some(Err(IpcError::Protocol)))` so the reader keeps
//! going.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::IpcError;

/// Codec that frames messages with length prefix and serializes with JSON.
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
    type Item = Result<T, IpcError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| IpcError::protocol(format!("invalid message type: {}", e)));
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
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > 100_000 {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Message, RequestId, ResponseStatus};
    use serde_json::json;

    #[test]
    fn codec_roundtrip_response() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();

        let resp = Message::Response {
            request_id: RequestId::new(12),
            status: ResponseStatus::Ok,
            content: json!({"n": 1}),
        };
        codec.encode(resp.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert_eq!(decoded, resp);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Message>::new();
        let mut full = BytesMut::new();
        codec.encode(Message::ping(), &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap().unwrap();
        assert_eq!(decoded, Message::Ping);
    }

    #[test]
    fn unknown_tag_is_protocol_error_and_stream_continues() {
        let mut framing = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        framing
            .encode(Bytes::from_static(br#"{"type":"shout"}"#), &mut buf)
            .unwrap();

        let mut codec = JsonCodec::<Message>::new();
        codec.encode(Message::pong(), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, Err(IpcError::Protocol(_))));

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(second, Message::Pong);
    }
}
