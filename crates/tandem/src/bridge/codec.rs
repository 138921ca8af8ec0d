//! Framed JSON codec for remote calls.
//!
//! Frames are a 4-byte big-endian length prefix followed by a serde_json body.
//! Works over any AsyncRead/AsyncWrite; in practice the exporter's Unix sockets.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. Code-service replies carry whole resource
/// files, so this is generous, but a corrupt length prefix must not make us
/// allocate gigabytes.
pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

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
        Self::with_max_frame_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = body.len(), "Encoding frame");
        self.inner.encode(Bytes::from(body), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{MasterCall, Reply};

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = JsonCodec::<Reply>::new();
        let mut full = BytesMut::new();
        codec
            .encode(Reply::ok(serde_json::json!({"n": 1})), &mut full)
            .unwrap();

        // Feed everything but the last byte: no item yet, nothing consumed incorrectly.
        let last = full.split_off(full.len() - 1);
        assert!(codec.decode(&mut full).unwrap().is_none());

        full.unsplit(last);
        let decoded = codec.decode(&mut full).unwrap().unwrap();
        assert_eq!(decoded.into_result().unwrap(), serde_json::json!({"n": 1}));
        assert!(full.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = JsonCodec::<MasterCall>::new();
        let mut buf = BytesMut::new();
        codec.encode(MasterCall::CheckAlive, &mut buf).unwrap();
        codec
            .encode(
                MasterCall::ReportStartupError {
                    cause: "boom".to_string(),
                },
                &mut buf,
            )
            .unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(MasterCall::CheckAlive)
        ));
        match codec.decode(&mut buf).unwrap() {
            Some(MasterCall::ReportStartupError { cause }) => assert_eq!(cause, "boom"),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn malformed_json_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"{not json"), &mut buf).unwrap();

        let mut codec = JsonCodec::<MasterCall>::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<Reply>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Reply::error("x".repeat(64)), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
