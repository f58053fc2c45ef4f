use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail, ensure};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    time::{sleep, timeout},
};

use codec::message::{
    AssetStatus, BindRead, HandShake, HashType, Identifier, Message, Ping, Status,
};
use bithorde_service::{
    MemoryStore, Router, Session, SessionEvent, SessionOptions, StreamIo,
    session::PROTO_VERSION,
};

const TICK: Duration = Duration::from_secs(2);

fn pipe() -> (Box<dyn StreamIo>, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    (Box::new(near), far)
}

fn linked_pipe() -> (Box<dyn StreamIo>, Box<dyn StreamIo>) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    (Box::new(near), Box::new(far))
}

fn client_options(name: &str) -> SessionOptions {
    SessionOptions {
        name: name.to_string(),
        bind_timeout: Duration::from_millis(200),
        refresh_multiplier: 2,
        resolver: None,
    }
}

fn server_options(name: &str, router: Arc<Router>) -> SessionOptions {
    SessionOptions {
        resolver: Some(router),
        ..client_options(name)
    }
}

fn tiger_id(byte: u8) -> Identifier {
    Identifier::new(HashType::TREE_TIGER, vec![byte; 24])
}

fn sha1_id(byte: u8) -> Identifier {
    Identifier::new(HashType::SHA1, vec![byte; 20])
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

async fn expect_authenticated(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
) -> Result<String> {
    match timeout(TICK, events.recv()).await? {
        Some(SessionEvent::Authenticated { peer }) => Ok(peer),
        other => bail!("expected authentication, got {:?}", other),
    }
}

/// Raw scripted peer, for tests that need exact control over wire timing.
struct TestPeer {
    stream: DuplexStream,
    decoder: codec::Decoder,
}

impl TestPeer {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            decoder: codec::Decoder::default(),
        }
    }

    async fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        let mut buf = BytesMut::new();
        codec::encode(&message.into(), &mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Message> {
        timeout(TICK, async {
            loop {
                if let Some(message) = self.decoder.decode()? {
                    return Ok(message);
                }

                let mut chunk = [0u8; 4096];
                let read = self.stream.read(&mut chunk).await?;
                ensure!(read > 0, "peer saw eof");
                self.decoder.extend(&chunk[..read]);
            }
        })
        .await?
    }

    /// Answer the session's greeting under `name`.
    async fn handshake(&mut self, name: &str) -> Result<HandShake> {
        let greeting = match self.recv().await? {
            Message::HandShake(msg) => msg,
            other => bail!("expected handshake, got {:?}", other),
        };
        ensure!(greeting.proto_version == PROTO_VERSION);

        self.send(HandShake {
            proto_version: PROTO_VERSION,
            name: name.to_string(),
            challenge: None,
        })
        .await?;

        Ok(greeting)
    }

    async fn recv_bind_read(&mut self) -> Result<BindRead> {
        match self.recv().await? {
            Message::BindRead(msg) => Ok(msg),
            other => bail!("expected bind read, got {:?}", other),
        }
    }
}

// S1: both sides learn the peer's configured name, nothing else happens.
#[tokio::test]
async fn test_handshake_success() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (b, mut b_events) = Session::spawn(client_options("B"));

    let (a_io, b_io) = linked_pipe();
    a.attach(a_io).await?;
    b.attach(b_io).await?;

    assert_eq!(expect_authenticated(&mut a_events).await?, "B");
    assert_eq!(expect_authenticated(&mut b_events).await?, "A");
    Ok(())
}

// S2: binding toward a storeless node answers NotFound and frees the handle.
#[tokio::test]
async fn test_bind_and_miss() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (b, _b_events) = Session::spawn(server_options("B", Router::new(vec![])));

    let (a_io, b_io) = linked_pipe();
    a.attach(a_io).await?;
    b.attach(b_io).await?;
    expect_authenticated(&mut a_events).await?;

    let mut asset = a.bind_read(vec![tiger_id(0xaa)], None).await?;
    let update = timeout(TICK, asset.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::NotFound);
    assert_eq!(update.handle, None);

    let diagnostics = a.diagnostics().await?;
    assert_eq!(diagnostics.bindings, 0);
    assert_eq!(diagnostics.tombstones, 0);
    Ok(())
}

// S3: bind against a stocked store, then read a range.
#[tokio::test]
async fn test_bind_and_hit() -> Result<()> {
    let content = pattern(1024);
    let store = Arc::new(MemoryStore::default());
    store.insert(vec![tiger_id(0xaa), sha1_id(0xbb)], content.clone());

    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (b, _b_events) = Session::spawn(server_options("B", Router::new(vec![store])));

    let (a_io, b_io) = linked_pipe();
    a.attach(a_io).await?;
    b.attach(b_io).await?;
    expect_authenticated(&mut a_events).await?;

    // Bind under one algorithm; the peer reports the whole identifier set.
    let mut asset = a.bind_read(vec![tiger_id(0xaa)], None).await?;
    let update = timeout(TICK, asset.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Success);
    assert_eq!(update.size, Some(1024));
    assert!(update.ids.contains(&sha1_id(0xbb)));
    assert_eq!(asset.size(), Some(1024));

    let reply = asset.read(0, 256, TICK).await?;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.offset, 0);
    assert_eq!(&reply.content[..], &content[..256]);

    let reply = asset.read(1000, 256, TICK).await?;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(&reply.content[..], &content[1000..]);
    Ok(())
}

// S4: a miss at B is satisfied through its upstream session to C.
#[tokio::test]
async fn test_forwarded_hit() -> Result<()> {
    let content = pattern(4096);
    let store = Arc::new(MemoryStore::default());
    store.insert(vec![tiger_id(0xcc)], content.clone());

    // C serves from its store.
    let (c, _c_events) = Session::spawn(server_options("C", Router::new(vec![store])));

    // B has no store, but an authenticated client session toward C.
    let (b_upstream, mut b_upstream_events) = Session::spawn(client_options("B"));
    let (up_io, c_io) = linked_pipe();
    b_upstream.attach(up_io).await?;
    c.attach(c_io).await?;
    expect_authenticated(&mut b_upstream_events).await?;

    let router = Router::new(vec![]);
    router.add_upstream("C", b_upstream.clone());
    let (b, _b_events) = Session::spawn(server_options("B", router));

    let (a_io, b_io) = linked_pipe();
    let (a, mut a_events) = Session::spawn(client_options("A"));
    a.attach(a_io).await?;
    b.attach(b_io).await?;
    expect_authenticated(&mut a_events).await?;

    let mut asset = a.bind_read(vec![tiger_id(0xcc)], None).await?;
    let update = timeout(TICK, asset.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Success);
    assert_eq!(update.size, Some(4096));

    let reply = asset.read(100, 200, TICK).await?;
    assert_eq!(reply.status, Status::Success);
    assert_eq!(reply.offset, 100);
    assert_eq!(&reply.content[..], &content[100..300]);

    // A miss at C propagates back as NotFound.
    let mut missing = a.bind_read(vec![tiger_id(0xdd)], None).await?;
    let update = timeout(TICK, missing.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::NotFound);
    Ok(())
}

// S5: a released handle stays reserved until the peer acknowledges.
#[tokio::test]
async fn test_release_roundtrip() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (a_io, peer_io) = pipe();
    a.attach(a_io).await?;

    let mut peer = TestPeer::new(peer_io);
    peer.handshake("B").await?;
    expect_authenticated(&mut a_events).await?;

    let mut first = a.bind_read(vec![tiger_id(0x01)], None).await?;
    let bind = peer.recv_bind_read().await?;
    assert_eq!(bind.handle, 1);
    peer.send(AssetStatus {
        handle: 1,
        status: Status::Success,
        size: Some(7),
        ids: vec![tiger_id(0x01)],
    })
    .await?;
    let update = timeout(TICK, first.next_status()).await?.unwrap();
    assert_eq!(update.handle, Some(1));

    // Release: an empty-set bind goes out, but no acknowledgement yet.
    first.release().await;
    let release = peer.recv_bind_read().await?;
    assert_eq!(release.handle, 1);
    assert!(release.ids.is_empty());

    // Handle 1 must not be reused while the release is unconfirmed.
    let _second = a.bind_read(vec![tiger_id(0x02)], None).await?;
    let bind = peer.recv_bind_read().await?;
    assert_eq!(bind.handle, 2);

    let diagnostics = a.diagnostics().await?;
    assert_eq!(diagnostics.tombstones, 1);

    // The peer acknowledges; only now is handle 1 free again.
    peer.send(AssetStatus {
        handle: 1,
        status: Status::NotFound,
        size: None,
        ids: vec![],
    })
    .await?;

    timeout(TICK, async {
        while a.diagnostics().await?.tombstones != 0 {
            sleep(Duration::from_millis(10)).await;
        }
        Ok::<_, bithorde_service::Error>(())
    })
    .await??;

    let _third = a.bind_read(vec![tiger_id(0x03)], None).await?;
    let bind = peer.recv_bind_read().await?;
    assert_eq!(bind.handle, 1);
    Ok(())
}

// S6: disconnect delivers exactly one DISCONNECTED per bound read asset, and
// a reconnect rebinds them onto the lowest handles.
#[tokio::test]
async fn test_disconnect_and_reconnect() -> Result<()> {
    let content = pattern(512);
    let store = Arc::new(MemoryStore::default());
    store.insert(vec![tiger_id(0x0a)], content.clone());
    store.insert(vec![tiger_id(0x0b)], pattern(256));

    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (b1, _b1_events) = Session::spawn(server_options("B", Router::new(vec![store.clone()])));

    let (a_io, b_io) = linked_pipe();
    a.attach(a_io).await?;
    b1.attach(b_io).await?;
    expect_authenticated(&mut a_events).await?;

    let mut one = a.bind_read(vec![tiger_id(0x0a)], None).await?;
    let mut two = a.bind_read(vec![tiger_id(0x0b)], None).await?;
    assert_eq!(
        timeout(TICK, one.next_status()).await?.unwrap().handle,
        Some(1)
    );
    assert_eq!(
        timeout(TICK, two.next_status()).await?.unwrap().handle,
        Some(2)
    );

    // Drop the transport from B's side.
    b1.close().await?;

    let update = timeout(TICK, one.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Disconnected);
    assert_eq!(update.handle, None);
    let update = timeout(TICK, two.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Disconnected);

    match timeout(TICK, a_events.recv()).await? {
        Some(SessionEvent::Disconnected) => {}
        other => bail!("expected disconnect, got {:?}", other),
    }

    // Reconnect: both assets are re-announced on the lowest free handles.
    let (b2, _b2_events) = Session::spawn(server_options("B", Router::new(vec![store])));
    let (a_io, b_io) = linked_pipe();
    a.attach(a_io).await?;
    b2.attach(b_io).await?;
    expect_authenticated(&mut a_events).await?;

    let update = timeout(TICK, one.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Success);
    assert_eq!(update.handle, Some(1));
    let update = timeout(TICK, two.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Success);
    assert_eq!(update.handle, Some(2));

    let reply = one.read(0, 512, TICK).await?;
    assert_eq!(&reply.content[..], &content[..]);
    Ok(())
}

#[tokio::test]
async fn test_ping_is_answered() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (a_io, peer_io) = pipe();
    a.attach(a_io).await?;

    let mut peer = TestPeer::new(peer_io);
    peer.handshake("B").await?;
    expect_authenticated(&mut a_events).await?;

    peer.send(Ping).await?;
    match peer.recv().await? {
        Message::Ping(_) => Ok(()),
        other => bail!("expected ping reply, got {:?}", other),
    }
}

// A bind without any answer within the refresh window synthesizes TIMEOUT;
// the asset decides to retry.
#[tokio::test]
async fn test_bind_timeout_and_rebind() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (a_io, peer_io) = pipe();
    a.attach(a_io).await?;

    let mut peer = TestPeer::new(peer_io);
    peer.handshake("B").await?;
    expect_authenticated(&mut a_events).await?;

    let mut asset = a
        .bind_read(vec![tiger_id(0x42)], Some(Duration::from_millis(50)))
        .await?;
    let bind = peer.recv_bind_read().await?;
    assert_eq!(bind.timeout, 50);

    let update = timeout(TICK, asset.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Timeout);
    assert_eq!(update.handle, Some(bind.handle));

    // Retry: same handle, fresh uuid.
    asset.rebind().await?;
    let again = peer.recv_bind_read().await?;
    assert_eq!(again.handle, bind.handle);
    assert_ne!(again.uuid, bind.uuid);
    Ok(())
}

// Client-side upload streaming: segments flow after the peer accepts, and
// the final status carries the hashed identifiers.
#[tokio::test]
async fn test_upload_streaming() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (a_io, peer_io) = pipe();
    a.attach(a_io).await?;

    let mut peer = TestPeer::new(peer_io);
    peer.handshake("B").await?;
    expect_authenticated(&mut a_events).await?;

    let mut upload = a.bind_write(11, None).await?;
    let bind = match peer.recv().await? {
        Message::BindWrite(msg) => msg,
        other => bail!("expected bind write, got {:?}", other),
    };
    assert_eq!(bind.size, 11);
    assert_eq!(bind.link_path, None);

    peer.send(AssetStatus {
        handle: bind.handle,
        status: Status::Success,
        size: None,
        ids: vec![],
    })
    .await?;
    let update = timeout(TICK, upload.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::Success);
    assert!(update.ids.is_empty());

    upload.write(0, Bytes::from_static(b"hello ")).await?;
    upload.write(6, Bytes::from_static(b"world")).await?;

    let mut received = BytesMut::from(&[0u8; 11][..]);
    for _ in 0..2 {
        match peer.recv().await? {
            Message::DataSegment(segment) => {
                let offset = segment.offset as usize;
                received[offset..offset + segment.content.len()]
                    .copy_from_slice(&segment.content);
            }
            other => bail!("expected data segment, got {:?}", other),
        }
    }
    assert_eq!(&received[..], b"hello world");

    peer.send(AssetStatus {
        handle: bind.handle,
        status: Status::Success,
        size: Some(11),
        ids: vec![sha1_id(0x5e)],
    })
    .await?;
    let update = timeout(TICK, upload.next_status()).await?.unwrap();
    assert_eq!(update.ids, vec![sha1_id(0x5e)]);
    assert_eq!(upload.ids(), &[sha1_id(0x5e)]);
    Ok(())
}

// No configured store can ingest a data stream, so the server refuses.
#[tokio::test]
async fn test_streamed_upload_is_refused_without_ingesting_store() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (b, _b_events) = Session::spawn(server_options("B", Router::new(vec![])));

    let (a_io, b_io) = linked_pipe();
    a.attach(a_io).await?;
    b.attach(b_io).await?;
    expect_authenticated(&mut a_events).await?;

    let mut upload = a.bind_write(64, None).await?;
    let update = timeout(TICK, upload.next_status()).await?.unwrap();
    assert_eq!(update.status, Status::NoResources);
    Ok(())
}

// Asset-bearing messages before authentication are protocol errors.
#[tokio::test]
async fn test_bind_before_handshake_closes_connection() -> Result<()> {
    let (a, mut a_events) = Session::spawn(client_options("A"));
    let (a_io, peer_io) = pipe();
    a.attach(a_io).await?;

    let mut peer = TestPeer::new(peer_io);
    // Swallow A's greeting but bind without answering it.
    match peer.recv().await? {
        Message::HandShake(_) => {}
        other => bail!("expected handshake, got {:?}", other),
    }
    peer.send(BindRead {
        handle: 1,
        ids: vec![tiger_id(0x01)],
        timeout: 500,
        uuid: 7,
    })
    .await?;

    match timeout(TICK, a_events.recv()).await? {
        Some(SessionEvent::Disconnected) => Ok(()),
        other => bail!("expected disconnect, got {:?}", other),
    }
}

// A released binding while disconnected frees its handle immediately; the
// peer is assumed to have lost the state with the transport.
#[tokio::test]
async fn test_release_without_connection_is_local() -> Result<()> {
    let (a, _a_events) = Session::spawn(client_options("A"));

    let asset = a.bind_read(vec![tiger_id(0x01)], None).await?;
    let diagnostics = a.diagnostics().await?;
    assert_eq!(diagnostics.bindings, 1);

    asset.release().await;

    timeout(TICK, async {
        loop {
            let diagnostics = a.diagnostics().await?;
            if diagnostics.bindings == 0 && diagnostics.tombstones == 0 {
                return Ok::<_, bithorde_service::Error>(());
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    Ok(())
}
