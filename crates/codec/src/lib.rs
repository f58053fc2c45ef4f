//! ## Asset exchange wire protocol
//!
//! Every record on a connection is a varint length prefix followed by a one
//! byte message tag and the message body. Bodies are keyed fields (see
//! [`wire`]) so unknown fields and identifier types pass through decoders
//! unharmed. The framing is transport-agnostic: the same records flow over
//! TCP and local stream sockets.

pub mod message;
pub mod wire;

use std::str::Utf8Error;

use bytes::{BufMut, BytesMut};

use crate::message::{Message, MessageType};

/// Upper bound on one framed record. A longer length prefix is treated as a
/// corrupted stream and is fatal to the connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    InvalidInput,
    FrameTooLarge(usize),
    UnknownMessageType(u8),
    UnknownStatus(u64),
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

/// Append one framed record for `message`.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use bithorde_codec::{encode, message::{Message, Ping}};
///
/// let mut buf = BytesMut::new();
/// encode(&Message::Ping(Ping), &mut buf);
///
/// // Length 1: just the tag byte of an empty message.
/// assert_eq!(&buf[..], &[0x01, 0x0a]);
/// ```
pub fn encode(message: &Message, buf: &mut BytesMut) {
    let mut body = BytesMut::new();
    message.encode_body(&mut body);

    wire::put_uvarint(buf, (body.len() + 1) as u64);
    buf.put_u8(message.message_type().into());
    buf.extend_from_slice(&body);
}

/// Incremental frame decoder over a growable receive buffer.
///
/// Feed raw transport bytes with [`Decoder::extend`], then drain complete
/// records with [`Decoder::decode`] until it returns `None`. A record is
/// consumed whole or not at all.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use bithorde_codec::{encode, Decoder, message::{HandShake, Message}};
///
/// let msg = Message::HandShake(HandShake {
///     proto_version: 2,
///     name: "panda".to_string(),
///     challenge: None,
/// });
///
/// let mut buf = BytesMut::new();
/// encode(&msg, &mut buf);
///
/// let mut decoder = Decoder::default();
/// decoder.extend(&buf[..3]);
/// assert_eq!(decoder.decode().unwrap(), None);
///
/// decoder.extend(&buf[3..]);
/// assert_eq!(decoder.decode().unwrap(), Some(msg));
/// assert_eq!(decoder.decode().unwrap(), None);
/// ```
#[derive(Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    /// Append raw bytes read from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writable spare capacity view, for zero-copy reads into the buffer.
    pub fn buffer(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Decode exactly one complete record, or return `None` when more bytes
    /// are needed.
    pub fn decode(&mut self) -> Result<Option<Message>, Error> {
        let mut cursor: &[u8] = &self.buf;
        let frame_len = match wire::try_get_uvarint(&mut cursor)? {
            Some(value) => usize::try_from(value).map_err(|_| Error::InvalidInput)?,
            None => return Ok(None),
        };

        if frame_len == 0 {
            return Err(Error::InvalidInput);
        }

        if frame_len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge(frame_len));
        }

        if cursor.len() < frame_len {
            return Ok(None);
        }

        let prefix_len = self.buf.len() - cursor.len();
        let record = self.buf.split_to(prefix_len + frame_len).split_off(prefix_len);

        let tag = record[0];
        let message_type =
            MessageType::try_from(tag).map_err(|_| Error::UnknownMessageType(tag))?;

        Message::decode_body(message_type, &record[1..]).map(Some)
    }
}
