//! Typed protocol messages and their body encodings.
//!
//! Every message travels as one framed record (see the crate root). The body
//! layout is protobuf-style keyed fields so that optional fields and fields
//! added by newer peers decode cleanly on older ones.

use std::fmt;

use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{Error, wire};

/// Record tag identifying the message type, the first byte of every framed
/// record.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum MessageType {
    HandShake = 1,
    BindRead = 2,
    AssetStatus = 3,
    ReadRequest = 5,
    ReadResponse = 6,
    BindWrite = 7,
    DataSegment = 8,
    HandShakeConfirmed = 9,
    Ping = 10,
}

/// Outcome code carried by [`AssetStatus`] and [`ReadResponse`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
pub enum Status {
    None = 0,
    Success = 1,
    NotFound = 2,
    InvalidHandle = 3,
    WouldLoop = 4,
    Disconnected = 5,
    Timeout = 6,
    NoResources = 7,
    Error = 8,
}

impl Status {
    /// Whether this status permanently ends a binding. `Timeout` and
    /// `Disconnected` are transient; the binding may still converge.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::NotFound | Status::InvalidHandle | Status::WouldLoop | Status::Error
        )
    }
}

/// Hash algorithm discriminator of an [`Identifier`].
///
/// Kept open so that identifier types this node does not know are carried
/// through unchanged rather than dropped.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashType(pub u32);

impl HashType {
    pub const TREE_TIGER: HashType = HashType(1);
    pub const SHA1: HashType = HashType(2);
}

impl fmt::Debug for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HashType::TREE_TIGER => write!(f, "TreeTiger"),
            HashType::SHA1 => write!(f, "Sha1"),
            HashType(other) => write!(f, "HashType({})", other),
        }
    }
}

/// One (hash algorithm, digest) naming of an asset.
///
/// A set of identifiers describes a single asset under several algorithms;
/// two sets refer to the same asset when any pair matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    pub hash: HashType,
    pub id: Bytes,
}

impl Identifier {
    pub fn new(hash: HashType, id: impl Into<Bytes>) -> Self {
        Self { hash, id: id.into() }
    }

    fn encode(&self, buf: &mut BytesMut) {
        wire::put_varint(buf, 1, self.hash.0 as u64);
        wire::put_len(buf, 2, &self.id);
    }

    fn decode(mut body: &[u8]) -> Result<Self, Error> {
        let mut hash = HashType(0);
        let mut id = Bytes::new();

        while !body.is_empty() {
            match wire::get_key(&mut body)? {
                (1, wire::VARINT) => hash = HashType(wire::get_u32(&mut body)?),
                (2, wire::LEN) => id = Bytes::copy_from_slice(wire::get_len(&mut body)?),
                (_, wire_type) => wire::skip(&mut body, wire_type)?,
            }
        }

        Ok(Self { hash, id })
    }
}

/// Whether two identifier sets name the same asset.
///
/// # Test
///
/// ```
/// use bithorde_codec::message::{HashType, Identifier, overlaps};
///
/// let a = [Identifier::new(HashType::SHA1, vec![1, 2, 3])];
/// let b = [
///     Identifier::new(HashType::TREE_TIGER, vec![9, 9]),
///     Identifier::new(HashType::SHA1, vec![1, 2, 3]),
/// ];
/// let c = [Identifier::new(HashType::SHA1, vec![4])];
///
/// assert!(overlaps(&a, &b));
/// assert!(!overlaps(&a, &c));
/// ```
pub fn overlaps(a: &[Identifier], b: &[Identifier]) -> bool {
    a.iter().any(|x| b.contains(x))
}

/// Session greeting, the first record on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandShake {
    pub proto_version: u32,
    pub name: String,
    /// Reserved for challenge-response authentication. A peer presenting a
    /// challenge is refused.
    pub challenge: Option<Bytes>,
}

/// Bind a handle to an asset by identifier set, rebind it, or (with an empty
/// identifier set) ask the peer to confirm a release.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindRead {
    pub handle: u32,
    pub ids: Vec<Identifier>,
    pub timeout: u32,
    pub uuid: u64,
}

/// Peer's view of one bound handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetStatus {
    pub handle: u32,
    pub status: Status,
    pub size: Option<u64>,
    pub ids: Vec<Identifier>,
}

impl Default for AssetStatus {
    fn default() -> Self {
        Self {
            handle: 0,
            status: Status::None,
            size: None,
            ids: Vec::new(),
        }
    }
}

/// One read of a byte range from a bound asset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRequest {
    pub reqid: u32,
    pub handle: u32,
    pub offset: u64,
    pub size: u32,
    pub timeout: u32,
}

/// Completion of a [`ReadRequest`], matched by reqid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub reqid: u32,
    pub status: Status,
    pub offset: Option<u64>,
    pub content: Option<Bytes>,
}

impl Default for ReadResponse {
    fn default() -> Self {
        Self {
            reqid: 0,
            status: Status::None,
            offset: None,
            content: None,
        }
    }
}

/// Bind a handle for upload, either of streamed data (`size` bytes of
/// [`DataSegment`]s to follow) or of a server-local file link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindWrite {
    pub handle: u32,
    pub size: u64,
    pub link_path: Option<String>,
}

/// One chunk of streamed upload data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataSegment {
    pub handle: u32,
    pub offset: u64,
    pub content: Bytes,
}

/// Reserved. Receiving it closes the connection in this protocol revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandShakeConfirmed;

/// Connection liveness probe; answered in kind, with priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ping;

/// Any protocol message, tagged with its [`MessageType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandShake(HandShake),
    BindRead(BindRead),
    AssetStatus(AssetStatus),
    ReadRequest(ReadRequest),
    ReadResponse(ReadResponse),
    BindWrite(BindWrite),
    DataSegment(DataSegment),
    HandShakeConfirmed(HandShakeConfirmed),
    Ping(Ping),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::HandShake(_) => MessageType::HandShake,
            Message::BindRead(_) => MessageType::BindRead,
            Message::AssetStatus(_) => MessageType::AssetStatus,
            Message::ReadRequest(_) => MessageType::ReadRequest,
            Message::ReadResponse(_) => MessageType::ReadResponse,
            Message::BindWrite(_) => MessageType::BindWrite,
            Message::DataSegment(_) => MessageType::DataSegment,
            Message::HandShakeConfirmed(_) => MessageType::HandShakeConfirmed,
            Message::Ping(_) => MessageType::Ping,
        }
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            Message::HandShake(msg) => {
                wire::put_varint(buf, 1, msg.proto_version as u64);
                wire::put_len(buf, 2, msg.name.as_bytes());
                if let Some(challenge) = &msg.challenge {
                    wire::put_len(buf, 3, challenge);
                }
            }
            Message::BindRead(msg) => {
                wire::put_varint(buf, 1, msg.handle as u64);
                for id in &msg.ids {
                    wire::put_message(buf, 2, |body| id.encode(body));
                }
                wire::put_varint(buf, 3, msg.timeout as u64);
                wire::put_varint(buf, 4, msg.uuid);
            }
            Message::AssetStatus(msg) => {
                wire::put_varint(buf, 1, msg.handle as u64);
                wire::put_varint(buf, 2, u8::from(msg.status) as u64);
                if let Some(size) = msg.size {
                    wire::put_varint(buf, 3, size);
                }
                for id in &msg.ids {
                    wire::put_message(buf, 4, |body| id.encode(body));
                }
            }
            Message::ReadRequest(msg) => {
                wire::put_varint(buf, 1, msg.reqid as u64);
                wire::put_varint(buf, 2, msg.handle as u64);
                wire::put_varint(buf, 3, msg.offset);
                wire::put_varint(buf, 4, msg.size as u64);
                wire::put_varint(buf, 5, msg.timeout as u64);
            }
            Message::ReadResponse(msg) => {
                wire::put_varint(buf, 1, msg.reqid as u64);
                wire::put_varint(buf, 2, u8::from(msg.status) as u64);
                if let Some(offset) = msg.offset {
                    wire::put_varint(buf, 3, offset);
                }
                if let Some(content) = &msg.content {
                    wire::put_len(buf, 4, content);
                }
            }
            Message::BindWrite(msg) => {
                wire::put_varint(buf, 1, msg.handle as u64);
                wire::put_varint(buf, 2, msg.size);
                if let Some(link) = &msg.link_path {
                    wire::put_len(buf, 3, link.as_bytes());
                }
            }
            Message::DataSegment(msg) => {
                wire::put_varint(buf, 1, msg.handle as u64);
                wire::put_varint(buf, 2, msg.offset);
                wire::put_len(buf, 3, &msg.content);
            }
            Message::HandShakeConfirmed(_) | Message::Ping(_) => {}
        }
    }

    pub(crate) fn decode_body(message_type: MessageType, mut body: &[u8]) -> Result<Self, Error> {
        Ok(match message_type {
            MessageType::HandShake => {
                let mut msg = HandShake::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.proto_version = wire::get_u32(&mut body)?,
                        (2, wire::LEN) => {
                            msg.name = std::str::from_utf8(wire::get_len(&mut body)?)?.to_owned()
                        }
                        (3, wire::LEN) => {
                            msg.challenge = Some(Bytes::copy_from_slice(wire::get_len(&mut body)?))
                        }
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::HandShake(msg)
            }
            MessageType::BindRead => {
                let mut msg = BindRead::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.handle = wire::get_u32(&mut body)?,
                        (2, wire::LEN) => {
                            msg.ids.push(Identifier::decode(wire::get_len(&mut body)?)?)
                        }
                        (3, wire::VARINT) => msg.timeout = wire::get_u32(&mut body)?,
                        (4, wire::VARINT) => msg.uuid = wire::get_uvarint(&mut body)?,
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::BindRead(msg)
            }
            MessageType::AssetStatus => {
                let mut msg = AssetStatus::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.handle = wire::get_u32(&mut body)?,
                        (2, wire::VARINT) => msg.status = decode_status(&mut body)?,
                        (3, wire::VARINT) => msg.size = Some(wire::get_uvarint(&mut body)?),
                        (4, wire::LEN) => {
                            msg.ids.push(Identifier::decode(wire::get_len(&mut body)?)?)
                        }
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::AssetStatus(msg)
            }
            MessageType::ReadRequest => {
                let mut msg = ReadRequest::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.reqid = wire::get_u32(&mut body)?,
                        (2, wire::VARINT) => msg.handle = wire::get_u32(&mut body)?,
                        (3, wire::VARINT) => msg.offset = wire::get_uvarint(&mut body)?,
                        (4, wire::VARINT) => msg.size = wire::get_u32(&mut body)?,
                        (5, wire::VARINT) => msg.timeout = wire::get_u32(&mut body)?,
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::ReadRequest(msg)
            }
            MessageType::ReadResponse => {
                let mut msg = ReadResponse::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.reqid = wire::get_u32(&mut body)?,
                        (2, wire::VARINT) => msg.status = decode_status(&mut body)?,
                        (3, wire::VARINT) => msg.offset = Some(wire::get_uvarint(&mut body)?),
                        (4, wire::LEN) => {
                            msg.content = Some(Bytes::copy_from_slice(wire::get_len(&mut body)?))
                        }
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::ReadResponse(msg)
            }
            MessageType::BindWrite => {
                let mut msg = BindWrite::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.handle = wire::get_u32(&mut body)?,
                        (2, wire::VARINT) => msg.size = wire::get_uvarint(&mut body)?,
                        (3, wire::LEN) => {
                            msg.link_path =
                                Some(std::str::from_utf8(wire::get_len(&mut body)?)?.to_owned())
                        }
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::BindWrite(msg)
            }
            MessageType::DataSegment => {
                let mut msg = DataSegment::default();
                while !body.is_empty() {
                    match wire::get_key(&mut body)? {
                        (1, wire::VARINT) => msg.handle = wire::get_u32(&mut body)?,
                        (2, wire::VARINT) => msg.offset = wire::get_uvarint(&mut body)?,
                        (3, wire::LEN) => {
                            msg.content = Bytes::copy_from_slice(wire::get_len(&mut body)?)
                        }
                        (_, wire_type) => wire::skip(&mut body, wire_type)?,
                    }
                }

                Message::DataSegment(msg)
            }
            MessageType::HandShakeConfirmed => {
                skip_all(body)?;
                Message::HandShakeConfirmed(HandShakeConfirmed)
            }
            MessageType::Ping => {
                skip_all(body)?;
                Message::Ping(Ping)
            }
        })
    }
}

fn decode_status(body: &mut &[u8]) -> Result<Status, Error> {
    let raw = wire::get_uvarint(body)?;
    u8::try_from(raw)
        .ok()
        .and_then(|raw| Status::try_from(raw).ok())
        .ok_or(Error::UnknownStatus(raw))
}

fn skip_all(mut body: &[u8]) -> Result<(), Error> {
    while !body.is_empty() {
        let (_, wire_type) = wire::get_key(&mut body)?;
        wire::skip(&mut body, wire_type)?;
    }

    Ok(())
}

impl From<HandShake> for Message {
    fn from(msg: HandShake) -> Self {
        Message::HandShake(msg)
    }
}

impl From<BindRead> for Message {
    fn from(msg: BindRead) -> Self {
        Message::BindRead(msg)
    }
}

impl From<AssetStatus> for Message {
    fn from(msg: AssetStatus) -> Self {
        Message::AssetStatus(msg)
    }
}

impl From<ReadRequest> for Message {
    fn from(msg: ReadRequest) -> Self {
        Message::ReadRequest(msg)
    }
}

impl From<ReadResponse> for Message {
    fn from(msg: ReadResponse) -> Self {
        Message::ReadResponse(msg)
    }
}

impl From<BindWrite> for Message {
    fn from(msg: BindWrite) -> Self {
        Message::BindWrite(msg)
    }
}

impl From<DataSegment> for Message {
    fn from(msg: DataSegment) -> Self {
        Message::DataSegment(msg)
    }
}

impl From<Ping> for Message {
    fn from(msg: Ping) -> Self {
        Message::Ping(msg)
    }
}
