/// IRC line codec: frames a TCP byte stream into raw protocol lines.
///
/// Splits on `\n` (an optional preceding `\r` is dropped), hands each line to
/// the dispatcher untouched, fails on lines over [`MAX_LINE_LENGTH`] so the
/// connection gets closed, and serializes outgoing [`Message`]s with `\r\n`
/// termination. Tokenising is left to [`super::parse`] because it depends on
/// whether the line came from a client or a server link.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::Message;

/// Longest line the protocol allows, excluding `\r\n`.
pub const MAX_LINE_LENGTH: usize = 510;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line longer than {MAX_LINE_LENGTH} bytes")]
    LineTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames raw lines on `\n` boundaries.
#[derive(Debug, Default)]
pub struct LineCodec;

impl Decoder for LineCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|&b| b == b'\n') else {
                if src.len() > MAX_LINE_LENGTH + 1 {
                    return Err(CodecError::LineTooLong);
                }
                return Ok(None);
            };

            let mut line = src.split_to(pos);
            src.advance(1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
    }
}

impl Encoder<Message> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}
