//! Server engine.
//!
//! Waits for clients on the bound endpoint and answers their three-phase
//! handshake. Inbound datagrams that fail authentication or decoding are
//! logged and dropped; protocol-level failures detected after decryption are
//! answered with an error envelope.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::Result;
use crate::iface::{self, AddrFamily};
use crate::keystore::PubKeys;
use crate::protocol::{self, MsgType, Request, Response};
use crate::session::{SessionContext, SessionTable, DEFAULT_SESSION_DURATION, DEFAULT_SWEEP_INTERVAL};
use crate::transport::{self, Groups};

/// Default datagram buffer size; must match the clients'.
pub const DEFAULT_BUF_SIZE: usize = 1024;

/// Default server name, used by clients to pick the right public key.
pub const DEFAULT_NAME: &str = "master";

/// The user half of the protocol: receives the peer address and its decoded
/// request, produces the response payload.
pub type Protocol =
    Arc<dyn Fn(SocketAddr, Request) -> Result<Response> + Send + Sync>;

/// Server configuration. Zero values fall back to the documented defaults
/// when the server starts.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Interface to bind on; `None` selects the first multicast or
    /// broadcast capable interface.
    pub interface: Option<String>,
    /// Skip the multicast group even when the interface supports it.
    pub disable_multicast: bool,
    /// Address family restriction.
    pub family: AddrFamily,
    /// Port to listen on; 0 lets the OS choose.
    pub port: u16,
    /// Datagram buffer size; 0 means [`DEFAULT_BUF_SIZE`].
    pub buf_size: usize,
    /// Session TTL; zero means 24 hours.
    pub session_duration: Duration,
    /// Server name; empty means [`DEFAULT_NAME`].
    pub name: String,
    /// Multicast group addresses.
    pub groups: Groups,
}

/// Discovery server: answers requests, confirms sessions, and refreshes
/// them on keepalives.
pub struct Server {
    config: ServerConfig,
    private_key: RsaPrivateKey,
    pub_keys: Arc<PubKeys>,
    protocol: Protocol,
    running: Option<Running>,
    port: u16,
    family: AddrFamily,
}

struct Running {
    sessions: Arc<SessionTable>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        private_key: RsaPrivateKey,
        pub_keys: Arc<PubKeys>,
        protocol: Protocol,
    ) -> Self {
        let family = config.family;
        Self {
            config,
            private_key,
            pub_keys,
            protocol,
            running: None,
            port: 0,
            family,
        }
    }

    /// Binds the endpoint and starts the read loop in the background.
    pub async fn start(&mut self) -> Result<()> {
        if self.config.buf_size == 0 {
            self.config.buf_size = DEFAULT_BUF_SIZE;
        }
        if self.config.session_duration.is_zero() {
            self.config.session_duration = DEFAULT_SESSION_DURATION;
        }
        if self.config.name.is_empty() {
            self.config.name = DEFAULT_NAME.to_string();
        }

        let iface = iface::resolve(self.config.interface.as_deref())?;
        let (socket, port, family) = transport::bind_server(
            &iface,
            self.config.family,
            self.config.port,
            &self.config.groups,
            self.config.disable_multicast,
        )
        .await?;
        self.port = port;
        self.config.family = family;
        self.family = family;

        let sessions = Arc::new(SessionTable::new(
            self.config.session_duration,
            DEFAULT_SWEEP_INTERVAL,
        ));

        let engine = Arc::new(Engine {
            socket: Arc::new(socket),
            name: self.config.name.clone(),
            buf_size: self.config.buf_size,
            private_key: self.private_key.clone(),
            pub_keys: self.pub_keys.clone(),
            sessions: sessions.clone(),
            arrivals: Mutex::new(Vec::new()),
            protocol: self.protocol.clone(),
        });

        let cancel = CancellationToken::new();
        let task = tokio::spawn(engine.run(cancel.clone()));

        self.running = Some(Running {
            sessions,
            cancel,
            task,
        });
        Ok(())
    }

    /// The port actually bound, available after [`Server::start`].
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The concrete address family adopted at bind time.
    pub fn family(&self) -> AddrFamily {
        self.family
    }

    /// Stops the read loop, then closes the session table.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            let _ = running.task.await;
            running.sessions.close().await;
        }
        Ok(())
    }
}

/// Shared state of the read loop and its handlers.
struct Engine {
    socket: Arc<UdpSocket>,
    name: String,
    buf_size: usize,
    private_key: RsaPrivateKey,
    pub_keys: Arc<PubKeys>,
    sessions: Arc<SessionTable>,
    /// Peer addresses of confirmed sessions, in confirmation order. The
    /// list length at request-handling time is the sequence number stamped
    /// on a new session.
    arrivals: Mutex<Vec<SocketAddr>>,
    protocol: Protocol,
}

impl Engine {
    /// Reads datagrams and decodes, authenticates, and opens them inline;
    /// anything that fails up to that point is dropped silently. Only the
    /// matched handler runs as its own task.
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut buf = vec![0u8; self.buf_size];
        loop {
            let (n, peer) = tokio::select! {
                _ = cancel.cancelled() => return,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::debug!("server receive failed: {}", e);
                        continue;
                    }
                },
            };

            let msg = match Envelope::decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(_) => {
                    tracing::debug!("can't decode data from {}", peer);
                    continue;
                }
            };

            let pubkey = match self.pub_keys.get(&msg.from).await {
                Ok(key) => key,
                Err(_) => {
                    tracing::debug!("invalid sender {} from {}", msg.from, peer);
                    continue;
                }
            };

            let plain = match msg.open(&pubkey, &self.private_key) {
                Ok(plain) => plain,
                Err(e) => {
                    tracing::debug!("invalid message from {}: {}", peer, e);
                    continue;
                }
            };

            let (typ, body) = match protocol::decode_typed(&plain) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!("bad payload from {}: {}", peer, e);
                    continue;
                }
            };

            let engine = self.clone();
            let from = msg.from;
            let body = body.to_vec();
            tokio::spawn(async move {
                match typ {
                    MsgType::Req => engine.request(peer, &from, &pubkey, &body).await,
                    MsgType::Confirm => engine.confirm(peer, &from, &pubkey, &body).await,
                    MsgType::KeepAlive => engine.keepalive(peer, &from, &pubkey, &body).await,
                }
            });
        }
    }

    /// First phase: run the user callback, then hand out the session. An
    /// unknown request id mints a fresh session stamped with the current
    /// arrivals count; a known id replays its stored triple.
    async fn request(&self, peer: SocketAddr, to: &str, tokey: &RsaPublicKey, body: &[u8]) {
        let req: Request = match protocol::decode_body(body) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("error decoding request: {}", e)).await;
                return;
            }
        };
        let req_id = req.id.clone();

        let mut resp = match (self.protocol)(peer, req) {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("protocol fail: {}", e)).await;
                return;
            }
        };

        match self.sessions.get(&req_id).await {
            Err(_) => {
                let id = Uuid::new_v4().to_string();
                resp.id = id.clone();
                resp.ip = peer.to_string();
                // Length before any append: the sequence of this session.
                resp.seq = self.arrivals.lock().await.len() as u16;
                let ctx = SessionContext {
                    id,
                    seq: resp.seq,
                    peer,
                };
                if let Err(e) = self.sessions.register(ctx).await {
                    tracing::debug!("protocol fail for {}: {}", peer, e);
                    self.send_err(peer, format!("protocol fail: {}", e)).await;
                    return;
                }
            }
            Ok(ctx) => {
                resp.id = ctx.id;
                resp.ip = ctx.peer.to_string();
                resp.seq = ctx.seq;
            }
        }

        self.send_resp(resp, to, tokey, peer).await;
    }

    /// Second phase: append the session's peer to the arrivals list and
    /// echo its triple back.
    async fn confirm(&self, peer: SocketAddr, to: &str, tokey: &RsaPublicKey, body: &[u8]) {
        let Some(ctx) = self.lookup(peer, body).await else {
            return;
        };
        self.arrivals.lock().await.push(ctx.peer);
        self.send_resp(
            Response {
                id: ctx.id,
                seq: ctx.seq,
                ip: ctx.peer.to_string(),
                data: Vec::new(),
            },
            to,
            tokey,
            peer,
        )
        .await;
    }

    /// Steady state: the lookup refreshes the TTL; the arrivals list is
    /// untouched.
    async fn keepalive(&self, peer: SocketAddr, to: &str, tokey: &RsaPublicKey, body: &[u8]) {
        let Some(ctx) = self.lookup(peer, body).await else {
            return;
        };
        self.send_resp(
            Response {
                id: ctx.id,
                seq: ctx.seq,
                ip: ctx.peer.to_string(),
                data: Vec::new(),
            },
            to,
            tokey,
            peer,
        )
        .await;
    }

    /// Decodes a bare session id and fetches its context, answering with an
    /// error envelope when either step fails.
    async fn lookup(&self, peer: SocketAddr, body: &[u8]) -> Option<SessionContext> {
        let id: String = match protocol::decode_body(body) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("error decoding id: {}", e)).await;
                return None;
            }
        };
        match self.sessions.get(&id).await {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("id is invalid: {}", e)).await;
                None
            }
        }
    }

    /// Seals and sends a response, falling back to an error envelope when
    /// the encoded message cannot be built or does not fit the buffer.
    async fn send_resp(&self, resp: Response, to: &str, tokey: &RsaPublicKey, peer: SocketAddr) {
        let plain = match rmp_serde::to_vec_named(&resp) {
            Ok(plain) => plain,
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("error encoding response: {}", e)).await;
                return;
            }
        };

        let msg = match Envelope::seal(&self.name, to, &self.private_key, tokey, &plain) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("error creating new response message: {}", e))
                    .await;
                return;
            }
        };

        let buf = match msg.encode() {
            Ok(buf) => buf,
            Err(e) => {
                tracing::debug!("protocol fail for {}: {}", peer, e);
                self.send_err(peer, format!("error encoding response: {}", e)).await;
                return;
            }
        };

        if buf.len() > self.buf_size {
            tracing::debug!("protocol fail for {}: response is too big ({})", peer, buf.len());
            self.send_err(peer, format!("response is too long {}", buf.len()))
                .await;
            return;
        }

        if let Err(e) = self.socket.send_to(&buf, peer).await {
            tracing::debug!("send to {} failed: {}", peer, e);
        }
    }

    /// Sends an error envelope; the text reaches the peer verbatim.
    async fn send_err(&self, peer: SocketAddr, text: String) {
        let msg = Envelope::error(text);
        let buf = match msg.encode() {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!("error encoding error response: {}", e);
                return;
            }
        };
        if buf.len() > self.buf_size {
            tracing::error!("error response is too long ({})", buf.len());
            return;
        }
        if let Err(e) = self.socket.send_to(&buf, peer).await {
            tracing::error!("error sending error response: {}", e);
        }
    }
}
