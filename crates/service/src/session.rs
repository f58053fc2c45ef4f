//! Per-peer session state machine.
//!
//! One task per session owns every table: bindings by wire handle, served
//! assets by the peer's handles, outstanding read requests by request id, and
//! both allocators. User-facing handles ([`ReadAsset`], [`UploadAsset`],
//! [`Session`]) talk to the task over a command channel, so the task is the
//! single writer and no state is shared across suspension points.

use std::{sync::{Arc, atomic::{AtomicU64, Ordering}}, time::Duration};

use ahash::AHashMap;
use bytes::Bytes;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::Instant,
};

use codec::message::{
    self, HandShake, Identifier, Message, Ping, ReadRequest, ReadResponse, Status,
};

use crate::{
    Error,
    asset::{Asset, AssetKey, ReadAsset, ReadReply, StatusUpdate, UploadAsset},
    connection::{Connection, ConnectionSender, StreamIo},
    handles::HandleAllocator,
    routing::Router,
};

/// Only protocol revision this node speaks.
pub const PROTO_VERSION: u32 = 2;

/// Wire timeout of a bind when the caller does not pick one.
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_millis(500);

/// Multiplier from a bind's peer-visible timeout to the local status-refresh
/// timer.
pub const DEFAULT_REFRESH_MULTIPLIER: u32 = 2;

pub struct SessionOptions {
    /// Name announced in the handshake.
    pub name: String,
    /// Default peer-visible bind timeout.
    pub bind_timeout: Duration,
    /// Local refresh timer is `bind_timeout * refresh_multiplier`.
    pub refresh_multiplier: u32,
    /// Present on serving nodes: where inbound binds are resolved.
    pub resolver: Option<Arc<Router>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "bithorde".to_string(),
            bind_timeout: DEFAULT_BIND_TIMEOUT,
            refresh_multiplier: DEFAULT_REFRESH_MULTIPLIER,
            resolver: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Handshake completed; the peer introduced itself under this name.
    Authenticated { peer: String },
    /// The transport is gone. Every bound ReadAsset has been told exactly
    /// once; a new transport may be attached to resume.
    Disconnected,
}

/// Point-in-time view of one session's tables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDiagnostics {
    pub peer_name: Option<String>,
    pub authenticated: bool,
    pub bindings: usize,
    pub tombstones: usize,
    pub served: usize,
    pub requests: usize,
}

pub(crate) enum Command {
    Connect(Box<dyn StreamIo>),
    BindRead {
        key: AssetKey,
        ids: Vec<Identifier>,
        timeout: Option<Duration>,
        status: mpsc::UnboundedSender<StatusUpdate>,
    },
    BindWrite {
        key: AssetKey,
        size: u64,
        link: Option<String>,
        status: mpsc::UnboundedSender<StatusUpdate>,
    },
    Rebind {
        key: AssetKey,
    },
    Read {
        key: AssetKey,
        offset: u64,
        size: u32,
        timeout: Duration,
        reply: oneshot::Sender<Result<ReadReply, Error>>,
    },
    WriteSegment {
        key: AssetKey,
        offset: u64,
        content: Bytes,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Release {
        key: AssetKey,
    },
    Diagnostics(oneshot::Sender<SessionDiagnostics>),
    Close,
}

/// Completions of spawned resolver work, re-entering the session task.
enum Internal {
    Resolved {
        handle: u32,
        nonce: u64,
        asset: Option<Arc<dyn Asset>>,
        miss: Status,
    },
}

/// Cloneable handle to a session task.
///
/// The task runs until every handle (sessions and assets) is dropped;
/// dropping the last one tears the connection down.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<Command>,
    writable: watch::Receiver<u64>,
    next_key: Arc<AtomicU64>,
}

impl Session {
    /// Start the session task. Events carry handshake completion and
    /// disconnects; the session is idle until a transport is attached.
    pub fn spawn(options: SessionOptions) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (writable_tx, writable_rx) = watch::channel(0);

        let machine = Machine {
            options,
            commands: command_rx,
            events: event_tx,
            internal_tx,
            internal_rx,
            writable: writable_tx,
            conn: None,
            sender: None,
            phase: Phase::Connecting,
            peer_name: None,
            bindings: AHashMap::new(),
            keys: AHashMap::new(),
            served: AHashMap::new(),
            resolving: AHashMap::new(),
            requests: AHashMap::new(),
            handle_alloc: HandleAllocator::new(1),
            reqid_alloc: HandleAllocator::new(1),
        };

        tokio::spawn(machine.run());

        (
            Session {
                commands: command_tx,
                writable: writable_rx,
                next_key: Arc::new(AtomicU64::new(1)),
            },
            event_rx,
        )
    }

    /// Attach a fresh transport. Replaces (and sweeps) any previous one;
    /// surviving read bindings are re-announced once the handshake lands.
    pub async fn attach(&self, stream: Box<dyn StreamIo>) -> Result<(), Error> {
        self.send(Command::Connect(stream)).await
    }

    /// Bind a ReadAsset toward the peer by identifier set.
    pub async fn bind_read(
        &self,
        ids: Vec<Identifier>,
        timeout: Option<Duration>,
    ) -> Result<ReadAsset, Error> {
        let key = self.allocate_key();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        self.send(Command::BindRead {
            key,
            ids: ids.clone(),
            timeout,
            status: status_tx,
        })
        .await?;

        Ok(ReadAsset::new(
            key,
            ids,
            status_rx,
            self.commands.clone(),
            self.writable.clone(),
        ))
    }

    /// Bind an UploadAsset: streamed data of `size` bytes, or link-mode when
    /// `link` names a path local to the peer.
    pub async fn bind_write(
        &self,
        size: u64,
        link: Option<String>,
    ) -> Result<UploadAsset, Error> {
        let key = self.allocate_key();
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        self.send(Command::BindWrite {
            key,
            size,
            link: link.clone(),
            status: status_tx,
        })
        .await?;

        Ok(UploadAsset::new(
            key,
            size,
            link,
            status_rx,
            self.commands.clone(),
            self.writable.clone(),
        ))
    }

    /// Close the current transport, if any. The session object survives and
    /// can be re-attached.
    pub async fn close(&self) -> Result<(), Error> {
        self.send(Command::Close).await
    }

    pub async fn diagnostics(&self) -> Result<SessionDiagnostics, Error> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Diagnostics(reply_tx)).await?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }

    fn allocate_key(&self) -> AssetKey {
        AssetKey(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    async fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Connected,
    AwaitingAuth,
    Authenticated,
}

struct ClientBound {
    key: AssetKey,
    ids: Vec<Identifier>,
    status: mpsc::UnboundedSender<StatusUpdate>,
}

struct WriteBound {
    key: AssetKey,
    size: u64,
    link: Option<String>,
    status: mpsc::UnboundedSender<StatusUpdate>,
}

enum BindingState {
    Read(ClientBound),
    Write(WriteBound),
    /// Tombstone: released locally, handle reserved until the peer confirms.
    Releasing,
}

struct Binding {
    state: BindingState,
    timeout: Duration,
    uuid: u64,
    deadline: Option<Instant>,
}

struct ServedBinding {
    asset: Arc<dyn Asset>,
}

struct PendingRead {
    handle: u32,
    reply: oneshot::Sender<Result<ReadReply, Error>>,
}

enum Turn {
    Command(Option<Command>),
    Internal(Option<Internal>),
    Message(Option<Message>),
    Timer,
}

struct Machine {
    options: SessionOptions,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    writable: watch::Sender<u64>,
    conn: Option<Connection>,
    sender: Option<ConnectionSender>,
    phase: Phase,
    peer_name: Option<String>,
    /// Handles we allocated: our outgoing binds.
    bindings: AHashMap<u32, Binding>,
    keys: AHashMap<AssetKey, u32>,
    /// Handles the peer allocated: assets we serve to it.
    served: AHashMap<u32, ServedBinding>,
    /// Peer handles with a resolver lookup in flight, by nonce.
    resolving: AHashMap<u32, u64>,
    requests: AHashMap<u32, PendingRead>,
    handle_alloc: HandleAllocator,
    reqid_alloc: HandleAllocator,
}

impl Machine {
    async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();

            let turn = tokio::select! {
                command = self.commands.recv() => Turn::Command(command),
                internal = self.internal_rx.recv() => Turn::Internal(internal),
                message = async {
                    match self.conn.as_mut() {
                        Some(conn) => conn.recv().await,
                        None => std::future::pending().await,
                    }
                } => Turn::Message(message),
                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => Turn::Timer,
            };

            match turn {
                Turn::Command(Some(command)) => self.handle_command(command),
                Turn::Command(None) => break,
                Turn::Internal(Some(internal)) => self.handle_internal(internal),
                Turn::Internal(None) => {}
                Turn::Message(Some(message)) => self.handle_message(message),
                Turn::Message(None) => self.on_disconnected(),
                Turn::Timer => self.on_timer(),
            }
        }

        if self.conn.is_some() {
            self.on_disconnected();
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(stream) => self.cmd_connect(stream),
            Command::BindRead {
                key,
                ids,
                timeout,
                status,
            } => self.cmd_bind_read(key, ids, timeout, status),
            Command::BindWrite {
                key,
                size,
                link,
                status,
            } => self.cmd_bind_write(key, size, link, status),
            Command::Rebind { key } => self.cmd_rebind(key),
            Command::Read {
                key,
                offset,
                size,
                timeout,
                reply,
            } => self.cmd_read(key, offset, size, timeout, reply),
            Command::WriteSegment {
                key,
                offset,
                content,
                reply,
            } => self.cmd_write_segment(key, offset, content, reply),
            Command::Release { key } => self.cmd_release(key),
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Close => {
                if let Some(sender) = &self.sender {
                    sender.close();
                }
            }
        }
    }

    fn diagnostics(&self) -> SessionDiagnostics {
        let tombstones = self
            .bindings
            .values()
            .filter(|binding| matches!(binding.state, BindingState::Releasing))
            .count();

        SessionDiagnostics {
            peer_name: self.peer_name.clone(),
            authenticated: self.phase == Phase::Authenticated,
            bindings: self.bindings.len() - tombstones,
            tombstones,
            served: self.served.len(),
            requests: self.requests.len(),
        }
    }

    fn cmd_connect(&mut self, stream: Box<dyn StreamIo>) {
        if self.conn.is_some() {
            self.on_disconnected();
        }

        let conn = Connection::spawn(stream);
        self.sender = Some(conn.sender());
        self.conn = Some(conn);
        self.phase = Phase::Connected;

        // Forward per-connection writable ticks onto the session-lifetime
        // watch that asset handles hold.
        let conn_writable = self.sender.as_ref().map(|sender| sender.writable());
        if let Some(mut conn_writable) = conn_writable {
            let session_writable = self.writable.clone();
            tokio::spawn(async move {
                while conn_writable.changed().await.is_ok() {
                    session_writable.send_modify(|epoch| *epoch += 1);
                }
            });
        }

        self.send(
            HandShake {
                proto_version: PROTO_VERSION,
                name: self.options.name.clone(),
                challenge: None,
            },
            true,
        );
        self.phase = Phase::AwaitingAuth;

        // Writable fires once after a successful connection.
        self.writable.send_modify(|epoch| *epoch += 1);
    }

    fn cmd_bind_read(
        &mut self,
        key: AssetKey,
        ids: Vec<Identifier>,
        timeout: Option<Duration>,
        status: mpsc::UnboundedSender<StatusUpdate>,
    ) {
        let timeout = timeout.unwrap_or(self.options.bind_timeout);
        let deadline = Some(Instant::now() + self.refresh_interval(timeout));
        let handle = self.handle_alloc.allocate();
        let uuid = rand::random();

        self.keys.insert(key, handle);
        self.bindings.insert(
            handle,
            Binding {
                state: BindingState::Read(ClientBound { key, ids, status }),
                timeout,
                uuid,
                deadline,
            },
        );

        if self.phase == Phase::Authenticated {
            self.announce_binding(handle);
        }
    }

    fn cmd_bind_write(
        &mut self,
        key: AssetKey,
        size: u64,
        link: Option<String>,
        status: mpsc::UnboundedSender<StatusUpdate>,
    ) {
        let timeout = self.options.bind_timeout;
        let deadline = Some(Instant::now() + self.refresh_interval(timeout));
        let handle = self.handle_alloc.allocate();

        self.keys.insert(key, handle);
        self.bindings.insert(
            handle,
            Binding {
                state: BindingState::Write(WriteBound {
                    key,
                    size,
                    link,
                    status,
                }),
                timeout,
                uuid: rand::random(),
                deadline,
            },
        );

        if self.phase == Phase::Authenticated {
            self.announce_binding(handle);
        }
    }

    fn cmd_rebind(&mut self, key: AssetKey) {
        let Some(&handle) = self.keys.get(&key) else {
            return;
        };

        if let Some(binding) = self.bindings.get_mut(&handle) {
            binding.uuid = rand::random();
        }

        if self.phase == Phase::Authenticated {
            self.announce_binding(handle);
        }
    }

    fn cmd_read(
        &mut self,
        key: AssetKey,
        offset: u64,
        size: u32,
        timeout: Duration,
        reply: oneshot::Sender<Result<ReadReply, Error>>,
    ) {
        let Some(&handle) = self.keys.get(&key) else {
            let _ = reply.send(Err(Error::NotBound));
            return;
        };

        if !matches!(
            self.bindings.get(&handle).map(|binding| &binding.state),
            Some(BindingState::Read(_))
        ) {
            let _ = reply.send(Err(Error::NotBound));
            return;
        }

        if self.phase != Phase::Authenticated {
            let _ = reply.send(Err(Error::Disconnected));
            return;
        }

        let reqid = self.reqid_alloc.allocate();
        let sent = self.send(
            ReadRequest {
                reqid,
                handle,
                offset,
                size,
                timeout: timeout.as_millis() as u32,
            },
            false,
        );

        if !sent {
            self.reqid_alloc.free(reqid);
            let _ = reply.send(Err(Error::QueueFull));
            return;
        }

        self.requests.insert(reqid, PendingRead { handle, reply });
    }

    fn cmd_write_segment(
        &mut self,
        key: AssetKey,
        offset: u64,
        content: Bytes,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        let Some(&handle) = self.keys.get(&key) else {
            let _ = reply.send(Err(Error::NotBound));
            return;
        };

        if !matches!(
            self.bindings.get(&handle).map(|binding| &binding.state),
            Some(BindingState::Write(_))
        ) {
            let _ = reply.send(Err(Error::NotBound));
            return;
        }

        if self.phase != Phase::Authenticated {
            let _ = reply.send(Err(Error::Disconnected));
            return;
        }

        let sent = self.send(
            message::DataSegment {
                handle,
                offset,
                content,
            },
            false,
        );

        let _ = reply.send(if sent { Ok(()) } else { Err(Error::QueueFull) });
    }

    fn cmd_release(&mut self, key: AssetKey) {
        let Some(handle) = self.keys.remove(&key) else {
            return;
        };

        if self.phase != Phase::Authenticated {
            // The peer has (or will) lose the bound state with the transport.
            self.bindings.remove(&handle);
            self.handle_alloc.free(handle);
            return;
        }

        let timeout = self.options.bind_timeout;
        let deadline = Some(Instant::now() + self.refresh_interval(timeout));
        let uuid = rand::random();

        let Some(binding) = self.bindings.get_mut(&handle) else {
            return;
        };
        binding.state = BindingState::Releasing;
        binding.uuid = uuid;
        binding.timeout = timeout;
        binding.deadline = deadline;

        self.send(
            message::BindRead {
                handle,
                ids: Vec::new(),
                timeout: timeout.as_millis() as u32,
                uuid,
            },
            false,
        );
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Resolved {
                handle,
                nonce,
                asset,
                miss,
            } => {
                if self.resolving.get(&handle) != Some(&nonce) {
                    // Superseded by a later bind or swept by a disconnect.
                    return;
                }
                self.resolving.remove(&handle);

                match asset {
                    Some(asset) => {
                        let status = message::AssetStatus {
                            handle,
                            status: Status::Success,
                            size: Some(asset.size()),
                            ids: asset.ids(),
                        };
                        self.served.insert(handle, ServedBinding { asset });
                        self.send(status, true);
                    }
                    None => {
                        self.send(
                            message::AssetStatus {
                                handle,
                                status: miss,
                                size: None,
                                ids: Vec::new(),
                            },
                            true,
                        );
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::HandShake(msg) => self.on_handshake(msg),
            Message::Ping(_) => {
                self.send(Ping, true);
            }
            Message::HandShakeConfirmed(_) => {
                log::warn!("unsupported: challenge-response handshakes");
                self.close_connection();
            }
            other if self.phase != Phase::Authenticated => {
                log::warn!(
                    "protocol error: {:?} before authentication",
                    other.message_type()
                );
                self.close_connection();
            }
            Message::BindRead(msg) => self.on_bind_read(msg),
            Message::AssetStatus(msg) => self.on_asset_status(msg),
            Message::ReadRequest(msg) => self.on_read_request(msg),
            Message::ReadResponse(msg) => self.on_read_response(msg),
            Message::BindWrite(msg) => self.on_bind_write(msg),
            Message::DataSegment(_) => {
                log::warn!("unsupported: inbound data segment pushes");
                self.close_connection();
            }
        }
    }

    fn on_handshake(&mut self, msg: HandShake) {
        if self.phase != Phase::AwaitingAuth {
            log::warn!("protocol error: handshake in state {:?}", self.phase);
            self.close_connection();
            return;
        }

        if msg.proto_version < PROTO_VERSION {
            log::warn!(
                "peer {:?} speaks protocol version {}, need >= {}",
                msg.name,
                msg.proto_version,
                PROTO_VERSION
            );
            self.close_connection();
            return;
        }

        if msg.challenge.is_some() {
            log::warn!("peer {:?} requires a challenge, not supported", msg.name);
            self.close_connection();
            return;
        }

        self.phase = Phase::Authenticated;
        self.peer_name = Some(msg.name.clone());

        // Re-announce everything bound before (or across) this transport.
        let mut handles: Vec<u32> = self.bindings.keys().copied().collect();
        handles.sort_unstable();
        for handle in handles {
            if let Some(binding) = self.bindings.get_mut(&handle) {
                binding.uuid = rand::random();
            }
            self.announce_binding(handle);
        }

        let _ = self.events.send(SessionEvent::Authenticated { peer: msg.name });
    }

    /// Send the wire message matching a binding's current state, and arm its
    /// refresh timer.
    fn announce_binding(&mut self, handle: u32) {
        let Some(binding) = self.bindings.get_mut(&handle) else {
            return;
        };

        let refresh =
            binding.timeout * self.options.refresh_multiplier.max(1);
        binding.deadline = Some(Instant::now() + refresh);

        let message = match &binding.state {
            BindingState::Read(bound) => Message::BindRead(message::BindRead {
                handle,
                ids: bound.ids.clone(),
                timeout: binding.timeout.as_millis() as u32,
                uuid: binding.uuid,
            }),
            BindingState::Releasing => Message::BindRead(message::BindRead {
                handle,
                ids: Vec::new(),
                timeout: binding.timeout.as_millis() as u32,
                uuid: binding.uuid,
            }),
            BindingState::Write(bound) => Message::BindWrite(message::BindWrite {
                handle,
                size: bound.size,
                link_path: bound.link.clone(),
            }),
        };

        if let Some(sender) = &self.sender {
            sender.send(&message, false);
        }
    }

    fn on_asset_status(&mut self, msg: message::AssetStatus) {
        let Some(binding) = self.bindings.get_mut(&msg.handle) else {
            log::warn!(
                "asset status {:?} for unmapped handle {}",
                msg.status,
                msg.handle
            );
            return;
        };

        binding.deadline = None;

        // The sender is cloned out so removals below never race a live
        // borrow of the table.
        let bound = match &binding.state {
            BindingState::Read(bound) => Some((bound.status.clone(), bound.key)),
            BindingState::Write(bound) => Some((bound.status.clone(), bound.key)),
            BindingState::Releasing => None,
        };

        match bound {
            Some((status, key)) => {
                let removed = msg.status.is_terminal();
                let _ = status.send(StatusUpdate {
                    status: msg.status,
                    size: msg.size,
                    ids: msg.ids,
                    handle: (!removed).then_some(msg.handle),
                });

                if removed {
                    self.keys.remove(&key);
                    self.bindings.remove(&msg.handle);
                    self.handle_alloc.free(msg.handle);
                }
            }
            None => {
                if msg.status == Status::Success {
                    log::warn!(
                        "status OK received for handle {} supposedly closed or re-written",
                        msg.handle
                    );
                } else {
                    self.bindings.remove(&msg.handle);
                    self.handle_alloc.free(msg.handle);
                }
            }
        }
    }

    fn on_read_response(&mut self, msg: ReadResponse) {
        let Some(pending) = self.requests.remove(&msg.reqid) else {
            log::warn!("read response with unknown request id {}", msg.reqid);
            return;
        };

        self.reqid_alloc.free(msg.reqid);

        if !self.bindings.contains_key(&pending.handle) {
            log::warn!(
                "read response {} for handle {} no longer mapped",
                msg.reqid,
                pending.handle
            );
            return;
        }

        let _ = pending.reply.send(Ok(ReadReply {
            status: msg.status,
            offset: msg.offset.unwrap_or(0),
            content: msg.content.unwrap_or_default(),
        }));
    }

    fn on_bind_read(&mut self, msg: message::BindRead) {
        let Some(resolver) = self.options.resolver.clone() else {
            log::warn!("unsupported: inbound bind requests on a client session");
            self.send(
                message::AssetStatus {
                    handle: msg.handle,
                    status: Status::Error,
                    size: None,
                    ids: Vec::new(),
                },
                true,
            );
            return;
        };

        if msg.ids.is_empty() {
            // Release confirmation: drop whatever we had and say so.
            self.resolving.remove(&msg.handle);
            self.served.remove(&msg.handle);
            self.send(
                message::AssetStatus {
                    handle: msg.handle,
                    status: Status::NotFound,
                    size: None,
                    ids: Vec::new(),
                },
                true,
            );
            return;
        }

        if let Some(existing) = self.served.get(&msg.handle) {
            if message::overlaps(&existing.asset.ids(), &msg.ids) {
                // Idempotent rebind of the same asset; re-report it.
                self.send(
                    message::AssetStatus {
                        handle: msg.handle,
                        status: Status::Success,
                        size: Some(existing.asset.size()),
                        ids: existing.asset.ids(),
                    },
                    true,
                );
                return;
            }

            // Rebind to a different asset: close the old one first.
            self.served.remove(&msg.handle);
        }

        let nonce = rand::random();
        self.resolving.insert(msg.handle, nonce);

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let asset = resolver.find_asset(&msg.ids).await;
            let _ = internal.send(Internal::Resolved {
                handle: msg.handle,
                nonce,
                asset,
                miss: Status::NotFound,
            });
        });
    }

    fn on_read_request(&mut self, msg: ReadRequest) {
        let Some(serving) = self.served.get(&msg.handle) else {
            self.send(
                ReadResponse {
                    reqid: msg.reqid,
                    status: Status::InvalidHandle,
                    offset: None,
                    content: None,
                },
                true,
            );
            return;
        };

        let Some(sender) = self.sender.clone() else {
            return;
        };

        let asset = serving.asset.clone();
        tokio::spawn(async move {
            let budget = Duration::from_millis(msg.timeout.max(1) as u64);
            let reply = match tokio::time::timeout(budget, asset.read(msg.offset, msg.size)).await {
                Ok(result) => ReadResponse {
                    reqid: msg.reqid,
                    status: result.status,
                    offset: Some(result.offset),
                    content: Some(result.content),
                },
                Err(_) => ReadResponse {
                    reqid: msg.reqid,
                    status: Status::Timeout,
                    offset: None,
                    content: None,
                },
            };

            // Bulk data takes the normal lane; wait out congestion.
            let mut writable = sender.writable();
            let message = Message::ReadResponse(reply);
            while !sender.send(&message, false) {
                if sender.is_closed() || writable.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    fn on_bind_write(&mut self, msg: message::BindWrite) {
        let Some(resolver) = self.options.resolver.clone() else {
            log::warn!("unsupported: inbound upload requests on a client session");
            self.send(
                message::AssetStatus {
                    handle: msg.handle,
                    status: Status::Error,
                    size: None,
                    ids: Vec::new(),
                },
                true,
            );
            return;
        };

        let Some(link) = msg.link_path else {
            // Streamed uploads need an ingesting store, which no configured
            // store provides.
            log::warn!("rejecting streamed upload for handle {}", msg.handle);
            self.send(
                message::AssetStatus {
                    handle: msg.handle,
                    status: Status::NoResources,
                    size: None,
                    ids: Vec::new(),
                },
                true,
            );
            return;
        };

        let nonce = rand::random();
        self.resolving.insert(msg.handle, nonce);

        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let asset = match resolver.link_asset(link.into()).await {
                Ok(asset) => Some(asset),
                Err(err) => {
                    log::warn!("link ingestion failed: {}", err);
                    None
                }
            };

            let _ = internal.send(Internal::Resolved {
                handle: msg.handle,
                nonce,
                asset,
                miss: Status::Error,
            });
        });
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .bindings
            .iter()
            .filter(|(_, binding)| binding.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(&handle, _)| handle)
            .collect();

        for handle in expired {
            let refresh = self.refresh_interval(self.options.bind_timeout);
            let mut reconfirm = None;

            let Some(binding) = self.bindings.get_mut(&handle) else {
                continue;
            };
            binding.deadline = None;

            match &binding.state {
                BindingState::Read(bound) => {
                    // No status within the refresh window: the asset decides
                    // whether to retry or surface the failure.
                    let _ = bound.status.send(StatusUpdate {
                        status: Status::Timeout,
                        size: None,
                        ids: Vec::new(),
                        handle: Some(handle),
                    });
                }
                BindingState::Write(bound) => {
                    let _ = bound.status.send(StatusUpdate {
                        status: Status::Timeout,
                        size: None,
                        ids: Vec::new(),
                        handle: Some(handle),
                    });
                }
                BindingState::Releasing => {
                    // Re-confirm the release until the peer acknowledges.
                    binding.uuid = rand::random();
                    binding.deadline = Some(now + refresh);
                    reconfirm = Some((binding.uuid, binding.timeout));
                }
            }

            if let Some((uuid, timeout)) = reconfirm {
                self.send(
                    message::BindRead {
                        handle,
                        ids: Vec::new(),
                        timeout: timeout.as_millis() as u32,
                        uuid,
                    },
                    false,
                );
            }
        }
    }

    fn on_disconnected(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.close();
        }
        self.conn = None;
        self.phase = Phase::Connecting;
        self.peer_name = None;

        // Outstanding reads complete as disconnected.
        for (_, pending) in self.requests.drain() {
            let _ = pending.reply.send(Ok(ReadReply::failed(Status::Disconnected)));
        }
        self.reqid_alloc.reset();

        // Served assets and in-flight resolutions die with the transport.
        self.served.clear();
        self.resolving.clear();

        // Sweep our bindings: read assets survive for rebinding and hear
        // about the loss exactly once; everything else is dropped silently.
        let mut survivors: Vec<(u32, Binding)> = Vec::new();
        for (handle, binding) in self.bindings.drain() {
            match binding.state {
                BindingState::Read(_) => survivors.push((handle, binding)),
                BindingState::Write(_) | BindingState::Releasing => {}
            }
        }

        self.keys.clear();
        self.handle_alloc.reset();

        survivors.sort_by_key(|(handle, _)| *handle);
        for (_, mut binding) in survivors {
            let handle = self.handle_alloc.allocate();
            binding.deadline = None;

            if let BindingState::Read(bound) = &binding.state {
                let _ = bound.status.send(StatusUpdate {
                    status: Status::Disconnected,
                    size: None,
                    ids: Vec::new(),
                    handle: None,
                });
                self.keys.insert(bound.key, handle);
            }

            self.bindings.insert(handle, binding);
        }

        let _ = self.events.send(SessionEvent::Disconnected);
    }

    fn close_connection(&mut self) {
        if let Some(sender) = &self.sender {
            sender.close();
        }
    }

    fn refresh_interval(&self, timeout: Duration) -> Duration {
        timeout * self.options.refresh_multiplier.max(1)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.bindings
            .values()
            .filter_map(|binding| binding.deadline)
            .min()
    }

    fn send(&self, message: impl Into<Message>, prioritized: bool) -> bool {
        match &self.sender {
            Some(sender) => sender.send(&message.into(), prioritized),
            None => false,
        }
    }
}
