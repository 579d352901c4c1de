//! Newline-delimited JSON framing for plugin channels.

use std::marker::PhantomData;

use bytes::BytesMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::error::{ProtoError, Result};

/// Maximum size of a single frame. A batch of alerts travels as one frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A codec that reads and writes one JSON value of type `T` per line.
///
/// Blank lines are skipped on decode. Lines that are not a valid `T` are a
/// [`ProtoError::Decoding`] unless the codec was told to skip them.
#[derive(Debug)]
pub struct JsonLinesCodec<T> {
    lines: LinesCodec,
    max_length: usize,
    skip_invalid: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonLinesCodec<T> {
    /// Creates a codec with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    /// Creates a codec with a custom frame limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
            skip_invalid: false,
            _marker: PhantomData,
        }
    }

    /// Chooses whether undecodable lines are logged and skipped instead of
    /// failing the stream.
    pub const fn set_skip_invalid(&mut self, skip: bool) {
        self.skip_invalid = skip;
    }

    fn map_err(&self, err: LinesCodecError) -> ProtoError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtoError::FrameTooLong {
                max: self.max_length,
            },
            LinesCodecError::Io(e) => ProtoError::Io(e),
        }
    }

    /// Parses one line. `Ok(None)` means the line was skipped.
    fn parse(&self, line: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match serde_json::from_str(line) {
            Ok(item) => Ok(Some(item)),
            Err(e) if self.skip_invalid => {
                warn!(error = %e, len = line.len(), "skipping undecodable line");
                Ok(None)
            }
            Err(e) => Err(ProtoError::Decoding(e.to_string())),
        }
    }
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Some(item) = self.parse(&line)? {
                        return Ok(Some(item));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_err(e)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<T>> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Some(item) = self.parse(&line)? {
                        return Ok(Some(item));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return Err(self.map_err(e)),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = ProtoError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item).map_err(|e| ProtoError::Encoding(e.to_string()))?;
        if line.len() > self.max_length {
            return Err(ProtoError::FrameTooLong {
                max: self.max_length,
            });
        }
        self.lines.encode(line, dst).map_err(|e| self.map_err(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Alert;
    use crate::messages::{BrokerMessage, PluginMessage};

    #[test]
    fn decodes_one_message_per_line() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ack\",\"id\":1}\n{\"type\":\"ack\",\"id\":2}\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 1 })
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 2 })
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn partial_line_waits_for_more_input() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ack\""[..]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b",\"id\":9}\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 9 })
        );
    }

    #[test]
    fn skips_blank_lines() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        let mut buf = BytesMut::from(&b"\n  \n{\"type\":\"ack\",\"id\":5}\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 5 })
        );
    }

    #[test]
    fn decode_eof_accepts_unterminated_last_line() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"ack\",\"id\":3}"[..]);

        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 3 })
        );
    }

    #[test]
    fn garbage_is_a_decoding_error() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtoError::Decoding(_))
        ));
    }

    #[test]
    fn skipping_codec_resumes_after_garbage() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        codec.set_skip_invalid(true);
        let mut buf =
            BytesMut::from(&br#"debug: sending mail
{"type":"nope"}
{"type":"ack","id":4}
"#[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 4 })
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn skipping_codec_at_eof() {
        let mut codec = JsonLinesCodec::<PluginMessage>::new();
        codec.set_skip_invalid(true);
        let mut buf = BytesMut::from(&br#"{"type":"ack","id":1}
trailing noise"#[..]);

        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(PluginMessage::Ack { id: 1 })
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encodes_with_trailing_newline() {
        let mut codec = JsonLinesCodec::<BrokerMessage>::new();
        let mut buf = BytesMut::new();

        codec.encode(BrokerMessage::Shutdown, &mut buf).unwrap();

        assert_eq!(&buf[..], b"{\"type\":\"shutdown\"}\n");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonLinesCodec::<BrokerMessage>::with_max_length(32);
        let mut buf = BytesMut::new();
        let msg = BrokerMessage::Notify {
            id: 1,
            plugin: "a-rather-long-plugin-name".to_string(),
            alerts: vec![Alert::default(); 4],
        };

        assert!(matches!(
            codec.encode(msg, &mut buf),
            Err(ProtoError::FrameTooLong { max: 32 })
        ));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Frames survive arbitrary read boundaries.
            #[test]
            fn any_chunking_yields_the_same_frames(
                ids in proptest::collection::vec(any::<u64>(), 1..16),
                chunk in 1usize..24,
            ) {
                let mut encoder = JsonLinesCodec::<PluginMessage>::new();
                let mut wire = BytesMut::new();
                for id in &ids {
                    encoder.encode(PluginMessage::Ack { id: *id }, &mut wire).unwrap();
                }

                let mut decoder = JsonLinesCodec::<PluginMessage>::new();
                let mut buf = BytesMut::new();
                let mut decoded = Vec::new();
                for piece in wire.chunks(chunk) {
                    buf.extend_from_slice(piece);
                    while let Some(msg) = decoder.decode(&mut buf).unwrap() {
                        decoded.push(msg.id());
                    }
                }

                let expected: Vec<_> = ids.into_iter().map(Some).collect();
                prop_assert_eq!(decoded, expected);
                prop_assert!(buf.is_empty());
            }
        }
    }
}
