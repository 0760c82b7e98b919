//! Newline-delimited JSON framing for reply records.
//!
//! Wire format:
//! - one [`RemoteReply`] per record, rendered as single-line JSON
//! - records separated by `\n` (a trailing `\r` is tolerated)
//! - blank records are skipped
//! - records longer than the configured maximum are a framing error

use command_reply_core::reply::{ProtocolError, RemoteReply, ReplyEnvelope};
use thiserror::Error;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Errors produced while framing or decoding reply records.
#[derive(Error, Debug)]
pub enum CodecError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record exceeded the maximum length
    #[error("Reply record exceeds {max_len} bytes")]
    RecordTooLong {
        /// Configured maximum
        max_len: usize,
    },

    /// The record is not a valid reply
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Codec turning a byte stream into [`RemoteReply`] records and back.
#[derive(Debug, Clone)]
pub struct ReplyCodec {
    lines: LinesCodec,
    max_len: usize,
}

impl ReplyCodec {
    /// Create a codec accepting records of up to `max_len` bytes.
    #[must_use]
    pub fn new(max_len: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_len),
            max_len,
        }
    }

    fn parse(line: Option<String>) -> Result<Option<Option<RemoteReply>>, CodecError> {
        match line {
            None => Ok(None),
            Some(line) if line.trim().is_empty() => Ok(Some(None)),
            Some(line) => Ok(Some(Some(RemoteReply::from_json(&line)?))),
        }
    }
}

fn lines_error(err: LinesCodecError, max_len: usize) -> CodecError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => CodecError::RecordTooLong { max_len },
        LinesCodecError::Io(e) => CodecError::Io(e),
    }
}

impl Decoder for ReplyCodec {
    type Item = RemoteReply;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self
                .lines
                .decode(src)
                .map_err(|e| lines_error(e, self.max_len))?;
            match Self::parse(line)? {
                None => return Ok(None),
                Some(None) => {}
                Some(Some(reply)) => return Ok(Some(reply)),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let line = self
                .lines
                .decode_eof(src)
                .map_err(|e| lines_error(e, self.max_len))?;
            match Self::parse(line)? {
                None => return Ok(None),
                Some(None) => {}
                Some(Some(reply)) => return Ok(Some(reply)),
            }
        }
    }
}

impl Encoder<RemoteReply> for ReplyCodec {
    type Error = CodecError;

    fn encode(&mut self, item: RemoteReply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = item.to_json()?;
        if json.len() > self.max_len {
            return Err(CodecError::RecordTooLong {
                max_len: self.max_len,
            });
        }
        self.lines
            .encode(json, dst)
            .map_err(|e| lines_error(e, self.max_len))
    }
}

impl Encoder<ReplyEnvelope> for ReplyCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ReplyEnvelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        <Self as Encoder<RemoteReply>>::encode(self, item.into(), dst)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use command_reply_core::command::{CommandId, CommandResult, CommandStatus};

    fn executed(id: &str) -> ReplyEnvelope {
        ReplyEnvelope::Executed(CommandResult::new(
            CommandStatus::Success,
            CommandId::new(id),
            "agg",
        ))
    }

    #[test]
    fn decodes_one_record_per_line() {
        let mut codec = ReplyCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(executed("a"), &mut buf).unwrap();
        codec.encode(executed("b"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command_result.unwrap().command_id.as_str(), "a");
        assert_eq!(second.command_result.unwrap().command_id.as_str(), "b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn waits_for_the_delimiter() {
        let mut codec = ReplyCodec::new(1024);
        let mut buf = BytesMut::from(&br#"{"code":7"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"}\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().code, 7);
    }

    #[test]
    fn skips_blank_records() {
        let mut codec = ReplyCodec::new(1024);
        let mut buf = BytesMut::from(&b"\n  \n{\"code\":2}\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().code, 2);
    }

    #[test]
    fn last_record_without_delimiter_is_decoded_at_eof() {
        let mut codec = ReplyCodec::new(1024);
        let mut buf = BytesMut::from(&br#"{"code":1}"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.decode_eof(&mut buf).unwrap().unwrap().code, 1);
    }

    #[test]
    fn malformed_record_is_a_protocol_error() {
        let mut codec = ReplyCodec::new(1024);
        let mut buf = BytesMut::from(&b"{oops\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::Protocol(ProtocolError::Malformed(_)))
        ));
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut codec = ReplyCodec::new(16);
        let mut buf = BytesMut::from(&[b'x'; 64][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::RecordTooLong { max_len: 16 })
        ));
    }
}
