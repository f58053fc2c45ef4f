use std::time::Duration;

use anyhow::{Result, bail};
use bytes::Bytes;
use tokio::{
    io::AsyncReadExt,
    time::{sleep, timeout},
};

use bithorde_service::connection::{Connection, SEND_QUEUE_SOFT_CAP};
use codec::message::{DataSegment, Message, Ping};

const TICK: Duration = Duration::from_secs(2);

fn segment(handle: u32, len: usize) -> Message {
    Message::DataSegment(DataSegment {
        handle,
        offset: 0,
        content: Bytes::from(vec![handle as u8; len]),
    })
}

async fn recv_all(mut stream: tokio::io::DuplexStream, count: usize) -> Result<Vec<Message>> {
    let mut decoder = codec::Decoder::default();
    let mut messages = Vec::new();

    timeout(TICK, async {
        while messages.len() < count {
            if let Some(message) = decoder.decode()? {
                messages.push(message);
                continue;
            }

            let mut chunk = [0u8; 4096];
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                bail!("eof after {} messages", messages.len());
            }
            decoder.extend(&chunk[..read]);
        }

        Ok(())
    })
    .await??;

    Ok(messages)
}

// A prioritized message overtakes queued bulk messages, but not the one
// already handed to the transport.
#[tokio::test]
async fn test_prioritized_send_overtakes_queued_messages() -> Result<()> {
    // Tiny pipe: the writer stalls inside the first bulk frame.
    let (near, far) = tokio::io::duplex(64);
    let conn = Connection::spawn(Box::new(near));
    let sender = conn.sender();

    assert!(sender.send(&segment(1, 1024), false));
    sleep(Duration::from_millis(50)).await;

    assert!(sender.send(&segment(2, 1024), false));
    assert!(sender.send(&segment(3, 1024), false));
    assert!(sender.send(&Message::Ping(Ping), true));

    let messages = recv_all(far, 4).await?;
    match (&messages[0], &messages[1], &messages[2], &messages[3]) {
        (
            Message::DataSegment(first),
            Message::Ping(_),
            Message::DataSegment(third),
            Message::DataSegment(fourth),
        ) => {
            assert_eq!(first.handle, 1);
            assert_eq!(third.handle, 2);
            assert_eq!(fourth.handle, 3);
        }
        other => bail!("unexpected delivery order: {:?}", other),
    }

    drop(conn);
    Ok(())
}

// The queue's soft cap rejects bulk sends; writable ticks once it drains.
#[tokio::test]
async fn test_backpressure_and_writable_signal() -> Result<()> {
    let (near, far) = tokio::io::duplex(64);
    let conn = Connection::spawn(Box::new(near));
    let sender = conn.sender();
    let mut writable = sender.writable();

    // One frame stalls in the transport, the cap's worth queue up.
    let mut accepted = 0;
    let mut rejected = false;
    for _ in 0..(SEND_QUEUE_SOFT_CAP + 16) {
        if sender.send(&segment(7, 512), false) {
            accepted += 1;
        } else {
            rejected = true;
            break;
        }
    }
    assert!(rejected, "queue never filled");
    assert!(accepted >= SEND_QUEUE_SOFT_CAP);

    // Control messages still pass on the priority lane.
    assert!(sender.send(&Message::Ping(Ping), true));

    // Draining the peer side frees capacity and fires writable.
    let drain = tokio::spawn(recv_all(far, accepted + 1));
    timeout(TICK, writable.changed()).await??;
    assert!(sender.send(&segment(9, 16), false));

    drain.await??;
    drop(conn);
    Ok(())
}

// Closing is idempotent and sends stop being accepted.
#[tokio::test]
async fn test_close_rejects_sends() -> Result<()> {
    let (near, _far) = tokio::io::duplex(64);
    let conn = Connection::spawn(Box::new(near));
    let sender = conn.sender();

    sender.close();
    sender.close();
    assert!(sender.is_closed());
    assert!(!sender.send(&Message::Ping(Ping), true));
    Ok(())
}
