//! Message-level duplex transport.
//!
//! A [`Connection`] owns one byte stream. The read half feeds the codec and
//! yields whole messages in wire order; the write half is drained by a
//! dedicated task from a two-lane outbound queue, so every spawned worker
//! funnels its replies through the same serialization point.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Notify, watch},
};

use codec::{Decoder, encode, message::Message};

/// Any stream a connection can run over: TCP, local sockets, or in-memory
/// pipes in tests.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Soft cap on queued outbound messages. Control messages on the priority
/// lane bypass it so a saturated bulk stream cannot starve acknowledgements.
pub const SEND_QUEUE_SOFT_CAP: usize = 64;

#[derive(Default)]
struct SendQueue {
    priority: VecDeque<Bytes>,
    normal: VecDeque<Bytes>,
}

impl SendQueue {
    fn pop(&mut self) -> Option<Bytes> {
        self.priority.pop_front().or_else(|| self.normal.pop_front())
    }
}

struct Shared {
    queue: Mutex<SendQueue>,
    starved: AtomicBool,
    closed: AtomicBool,
    writer_wakeup: Notify,
    closed_notify: Notify,
    writable: watch::Sender<u64>,
}

impl Shared {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.writer_wakeup.notify_one();
            self.closed_notify.notify_waiters();
        }
    }
}

/// Read side of a live connection, owned by its session.
pub struct Connection {
    reader: ReadHalf<Box<dyn StreamIo>>,
    decoder: Decoder,
    shared: Arc<Shared>,
}

impl Connection {
    /// Take ownership of a stream and start the writer task.
    pub fn spawn(stream: Box<dyn StreamIo>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            queue: Mutex::new(SendQueue::default()),
            starved: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            writer_wakeup: Notify::new(),
            closed_notify: Notify::new(),
            writable: watch::channel(0).0,
        });

        tokio::spawn(write_loop(writer, shared.clone()));

        Self {
            reader,
            decoder: Decoder::default(),
            shared,
        }
    }

    pub fn sender(&self) -> ConnectionSender {
        ConnectionSender {
            shared: self.shared.clone(),
        }
    }

    /// Next inbound message in wire order. `None` means disconnected: EOF,
    /// transport error, local close, or a fatal framing error.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }

            match self.decoder.decode() {
                Ok(Some(message)) => return Some(message),
                Ok(None) => {}
                Err(err) => {
                    log::warn!("closing connection on protocol error: {}", err);
                    self.shared.close();
                    return None;
                }
            }

            tokio::select! {
                read = self.reader.read_buf(self.decoder.buffer()) => match read {
                    Ok(0) => {
                        self.shared.close();
                        return None;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::debug!("connection read error: {}", err);
                        self.shared.close();
                        return None;
                    }
                },
                _ = self.shared.closed_notify.notified() => return None,
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Cloneable send half; the outbound queue is the single serialization point
/// of a connection.
#[derive(Clone)]
pub struct ConnectionSender {
    shared: Arc<Shared>,
}

impl ConnectionSender {
    /// Enqueue one message. Returns false when the queue is at capacity (or
    /// the connection is gone); the caller is expected to wait on
    /// [`ConnectionSender::writable`] and retry. Nothing is silently dropped.
    ///
    /// Prioritized messages go on the head lane: they overtake queued bulk
    /// messages but never one already handed to the transport.
    pub fn send(&self, message: &Message, prioritized: bool) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut frame = BytesMut::new();
        encode(message, &mut frame);
        let frame = frame.freeze();

        {
            let mut queue = self.shared.queue.lock();
            if prioritized {
                queue.priority.push_back(frame);
            } else {
                if queue.normal.len() >= SEND_QUEUE_SOFT_CAP {
                    self.shared.starved.store(true, Ordering::Release);
                    return false;
                }

                queue.normal.push_back(frame);
            }
        }

        self.shared.writer_wakeup.notify_one();
        true
    }

    /// Watch that ticks whenever the queue leaves the full state.
    pub fn writable(&self) -> watch::Receiver<u64> {
        self.shared.writable.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Idempotent. Pending queue contents are discarded unsent.
    pub fn close(&self) {
        self.shared.close();
    }
}

async fn write_loop(mut writer: WriteHalf<Box<dyn StreamIo>>, shared: Arc<Shared>) {
    loop {
        let frame = shared.queue.lock().pop();

        match frame {
            Some(frame) => {
                if writer.write_all(&frame).await.is_err() {
                    shared.close();
                    break;
                }

                if shared.starved.load(Ordering::Acquire)
                    && shared.queue.lock().normal.len() < SEND_QUEUE_SOFT_CAP
                {
                    shared.starved.store(false, Ordering::Release);
                    shared.writable.send_modify(|epoch| *epoch += 1);
                }
            }
            None => {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }

                shared.writer_wakeup.notified().await;
            }
        }
    }

    let _ = writer.shutdown().await;
}
