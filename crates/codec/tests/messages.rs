use anyhow::Result;
use bytes::{Bytes, BytesMut};

use bithorde_codec::{
    Decoder, Error, MAX_FRAME_SIZE, encode,
    message::{
        AssetStatus, BindRead, BindWrite, DataSegment, HandShake, HashType, Identifier, Message,
        Ping, ReadRequest, ReadResponse, Status,
    },
    wire,
};

fn sample_ids() -> Vec<Identifier> {
    vec![
        Identifier::new(HashType::TREE_TIGER, vec![0xaa; 24]),
        Identifier::new(HashType::SHA1, vec![0xbb; 20]),
    ]
}

fn roundtrip(msg: Message) -> Result<()> {
    let mut buf = BytesMut::new();
    encode(&msg, &mut buf);

    let mut decoder = Decoder::default();
    decoder.extend(&buf);

    assert_eq!(decoder.decode()?, Some(msg));
    assert_eq!(decoder.decode()?, None);
    Ok(())
}

#[test]
fn test_roundtrip_all_message_types() -> Result<()> {
    roundtrip(Message::HandShake(HandShake {
        proto_version: 2,
        name: "node-a".to_string(),
        challenge: None,
    }))?;

    roundtrip(Message::HandShake(HandShake {
        proto_version: 2,
        name: String::new(),
        challenge: Some(Bytes::from_static(b"\x00\x01\x02")),
    }))?;

    roundtrip(Message::BindRead(BindRead {
        handle: 7,
        ids: sample_ids(),
        timeout: 500,
        uuid: u64::MAX,
    }))?;

    // Release re-confirmation: empty identifier set.
    roundtrip(Message::BindRead(BindRead {
        handle: 7,
        ids: vec![],
        timeout: 500,
        uuid: 1,
    }))?;

    roundtrip(Message::AssetStatus(AssetStatus {
        handle: 7,
        status: Status::Success,
        size: Some(1024),
        ids: sample_ids(),
    }))?;

    roundtrip(Message::AssetStatus(AssetStatus {
        handle: 9,
        status: Status::NotFound,
        size: None,
        ids: vec![],
    }))?;

    roundtrip(Message::ReadRequest(ReadRequest {
        reqid: 1,
        handle: 7,
        offset: 1 << 40,
        size: 64 * 1024,
        timeout: 2000,
    }))?;

    roundtrip(Message::ReadResponse(ReadResponse {
        reqid: 1,
        status: Status::Success,
        offset: Some(1 << 40),
        content: Some(Bytes::from_static(b"payload")),
    }))?;

    roundtrip(Message::ReadResponse(ReadResponse {
        reqid: 2,
        status: Status::Timeout,
        offset: None,
        content: None,
    }))?;

    roundtrip(Message::BindWrite(BindWrite {
        handle: 3,
        size: 4096,
        link_path: Some("/srv/assets/movie.mkv".to_string()),
    }))?;

    roundtrip(Message::DataSegment(DataSegment {
        handle: 3,
        offset: 65536,
        content: Bytes::from(vec![0x5a; 64 * 1024]),
    }))?;

    roundtrip(Message::Ping(Ping))?;
    Ok(())
}

#[test]
fn test_concatenated_frames_decode_in_order() -> Result<()> {
    let first = Message::BindRead(BindRead {
        handle: 1,
        ids: sample_ids(),
        timeout: 500,
        uuid: 42,
    });
    let second = Message::Ping(Ping);

    let mut buf = BytesMut::new();
    encode(&first, &mut buf);
    encode(&second, &mut buf);

    let mut decoder = Decoder::default();
    decoder.extend(&buf);

    assert_eq!(decoder.decode()?, Some(first));
    assert_eq!(decoder.decode()?, Some(second));
    assert_eq!(decoder.decode()?, None);
    Ok(())
}

#[test]
fn test_byte_at_a_time_feed_never_yields_partial_records() -> Result<()> {
    let msg = Message::AssetStatus(AssetStatus {
        handle: 5,
        status: Status::Success,
        size: Some(99),
        ids: sample_ids(),
    });

    let mut buf = BytesMut::new();
    encode(&msg, &mut buf);

    let mut decoder = Decoder::default();
    for (index, byte) in buf.iter().enumerate() {
        decoder.extend(&[*byte]);
        let decoded = decoder.decode()?;
        if index + 1 < buf.len() {
            assert_eq!(decoded, None);
        } else {
            assert_eq!(decoded, Some(msg.clone()));
        }
    }

    Ok(())
}

#[test]
fn test_unknown_identifier_types_round_trip() -> Result<()> {
    let exotic = Identifier::new(HashType(77), vec![0x01, 0x02]);
    let msg = Message::BindRead(BindRead {
        handle: 2,
        ids: vec![exotic.clone()],
        timeout: 100,
        uuid: 7,
    });

    let mut buf = BytesMut::new();
    encode(&msg, &mut buf);

    let mut decoder = Decoder::default();
    decoder.extend(&buf);

    match decoder.decode()? {
        Some(Message::BindRead(decoded)) => assert_eq!(decoded.ids, vec![exotic]),
        other => panic!("unexpected decode result: {:?}", other),
    }

    Ok(())
}

#[test]
fn test_unknown_fields_are_skipped() -> Result<()> {
    // A Ping body carrying a field from some future revision.
    let mut body = BytesMut::new();
    wire::put_varint(&mut body, 15, 1234);
    wire::put_len(&mut body, 16, b"future");

    let mut buf = BytesMut::new();
    wire::put_uvarint(&mut buf, (body.len() + 1) as u64);
    buf.extend_from_slice(&[10]);
    buf.extend_from_slice(&body);

    let mut decoder = Decoder::default();
    decoder.extend(&buf);
    assert_eq!(decoder.decode()?, Some(Message::Ping(Ping)));
    Ok(())
}

#[test]
fn test_oversized_frame_is_fatal() {
    let mut buf = BytesMut::new();
    wire::put_uvarint(&mut buf, (MAX_FRAME_SIZE + 1) as u64);

    let mut decoder = Decoder::default();
    decoder.extend(&buf);

    assert_eq!(
        decoder.decode(),
        Err(Error::FrameTooLarge(MAX_FRAME_SIZE + 1))
    );
}

#[test]
fn test_unknown_tag_is_fatal() {
    let mut decoder = Decoder::default();
    decoder.extend(&[0x01, 0x04]);

    assert_eq!(decoder.decode(), Err(Error::UnknownMessageType(4)));
}

#[test]
fn test_zero_length_frame_is_fatal() {
    let mut decoder = Decoder::default();
    decoder.extend(&[0x00]);

    assert_eq!(decoder.decode(), Err(Error::InvalidInput));
}

#[test]
fn test_status_terminality() {
    for status in [
        Status::NotFound,
        Status::InvalidHandle,
        Status::WouldLoop,
        Status::Error,
    ] {
        assert!(status.is_terminal());
    }

    for status in [
        Status::None,
        Status::Success,
        Status::Disconnected,
        Status::Timeout,
        Status::NoResources,
    ] {
        assert!(!status.is_terminal());
    }
}
