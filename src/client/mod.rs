//! Client engine.
//!
//! Drives the three-phase handshake: send a request, adopt the session id
//! from the response, confirm it, then keep the session alive from a
//! background task. Per-operation deadlines turn into retries inside the
//! discovery loop; the loop itself is bounded by the outer timeout.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{LanscoutError, Result};
use crate::iface::{self, AddrFamily};
use crate::protocol::{self, MsgType, Request, Response};
use crate::server::DEFAULT_BUF_SIZE;
use crate::transport::{self, Groups};

/// Default server port clients target.
pub const DEFAULT_PORT: u16 = 3456;

/// Default total time a discovery keeps retrying.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default per-operation UDP deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

/// Default keepalive period.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

/// The user half of the protocol: produces the request payload for a
/// destination.
pub type RequestFn = Arc<dyn Fn(SocketAddr) -> Result<Request> + Send + Sync>;

/// Client configuration. Zero values fall back to the documented defaults
/// when discovery starts.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Interface to send from; `None` selects the first multicast or
    /// broadcast capable interface.
    pub interface: Option<String>,
    /// Skip the multicast group even when the interface supports it.
    pub disable_multicast: bool,
    /// Address family restriction.
    pub family: AddrFamily,
    /// Server port; 0 means [`DEFAULT_PORT`].
    pub port: u16,
    /// Datagram buffer size; 0 means the server's default. Must match the
    /// server.
    pub buf_size: usize,
    /// Total time discovery keeps retrying; zero means [`DEFAULT_TIMEOUT`].
    pub timeout: Duration,
    /// Per-operation UDP deadline; zero means [`DEFAULT_DEADLINE`].
    pub deadline: Duration,
    /// Keepalive period; zero means [`DEFAULT_KEEPALIVE`].
    pub keepalive: Duration,
    /// This client's name; picks the matching public key on the server.
    pub name: String,
    /// The server's name; envelopes from anyone else are rejected.
    pub server_name: String,
    /// Multicast group addresses.
    pub groups: Groups,
    /// Session id to resume; `None` mints a fresh one.
    pub id: Option<String>,
}

/// Discovery client. One instance holds one session: repeated calls to
/// [`Client::discover`] reuse the same id and get the same sequence back.
pub struct Client {
    config: ClientConfig,
    private_key: RsaPrivateKey,
    server_key: RsaPublicKey,
    request: RequestFn,
    id: String,
    keepalive_task: Option<KeepaliveHandle>,
}

struct KeepaliveHandle {
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// Everything needed to seal, send, receive, and open one exchange; shared
/// with the keepalive task.
struct Exchange {
    name: String,
    server_name: String,
    private_key: RsaPrivateKey,
    server_key: RsaPublicKey,
    buf_size: usize,
    deadline: Duration,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        private_key: RsaPrivateKey,
        server_key: RsaPublicKey,
        request: RequestFn,
    ) -> Self {
        let id = config.id.clone().unwrap_or_default();
        Self {
            config,
            private_key,
            server_key,
            request,
            id,
            keepalive_task: None,
        }
    }

    /// The current session id; empty until the first discovery.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Locates the server and returns its response.
    ///
    /// Tries each allowed address of the selected interface; addresses the
    /// interface cannot host are skipped, everything else is decisive. On
    /// success a keepalive task holds the session open until
    /// [`Client::close`].
    pub async fn discover(&mut self) -> Result<Response> {
        self.normalize();
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }

        // A previous discovery may have left its keepalive task running.
        self.stop_keepalive().await;

        let iface = iface::resolve(self.config.interface.as_deref())?;
        let exchange = Arc::new(Exchange {
            name: self.config.name.clone(),
            server_name: self.config.server_name.clone(),
            private_key: self.private_key.clone(),
            server_key: self.server_key.clone(),
            buf_size: self.config.buf_size,
            deadline: self.config.deadline,
        });

        for addr in iface::candidate_addrs(&iface, self.config.family) {
            match self.try_addr(&iface, addr, &exchange).await {
                Err(LanscoutError::CantFindInterface) => continue,
                decisive => return decisive,
            }
        }
        Err(LanscoutError::NoUsableAddress)
    }

    /// Stops the keepalive task (a rendezvous: waits for its acknowledgement),
    /// releasing the session socket.
    pub async fn close(&mut self) -> Result<()> {
        self.stop_keepalive().await;
        Ok(())
    }

    fn normalize(&mut self) {
        let cfg = &mut self.config;
        if cfg.port == 0 {
            cfg.port = DEFAULT_PORT;
        }
        if cfg.buf_size == 0 {
            cfg.buf_size = DEFAULT_BUF_SIZE;
        }
        if cfg.timeout.is_zero() {
            cfg.timeout = DEFAULT_TIMEOUT;
        }
        if cfg.deadline.is_zero() {
            cfg.deadline = DEFAULT_DEADLINE;
        }
        if cfg.keepalive.is_zero() {
            cfg.keepalive = DEFAULT_KEEPALIVE;
        }
    }

    /// Runs the handshake loop over one candidate address until it succeeds
    /// or the outer timeout lapses. I/O timeouts loop; other errors abort.
    async fn try_addr(
        &mut self,
        iface: &pnet_datalink::NetworkInterface,
        addr: IpAddr,
        exchange: &Arc<Exchange>,
    ) -> Result<Response> {
        let local = transport::sock_addr(&addr, 0, iface)
            .map_err(|_| LanscoutError::CantFindInterface)?;
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|_| LanscoutError::CantFindInterface)?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let dst = transport::client_destination(
            iface,
            &addr,
            self.config.port,
            &self.config.groups,
            self.config.disable_multicast,
        )
        .map_err(|_| LanscoutError::CantFindInterface)?;

        tracing::debug!("local ip {}", socket.local_addr()?);
        tracing::debug!("try to contact server in {}", dst);

        let end = Instant::now() + self.config.timeout;
        while Instant::now() <= end {
            let mut req = (self.request)(dst)?;
            req.id = self.id.clone();
            req.ip = socket.local_addr()?.to_string();

            match exchange.send_typed(&socket, MsgType::Req, &req, dst).await {
                Err(LanscoutError::IoTimeout) => {
                    tracing::error!("send to {} timed out", dst);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }

            let resp = match exchange.response(&socket).await {
                Err(LanscoutError::IoTimeout) => {
                    tracing::error!("no response from {}", dst);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(resp) => resp,
            };
            self.id = resp.id.clone();

            match exchange
                .send_typed(&socket, MsgType::Confirm, &resp.id, dst)
                .await
            {
                Err(LanscoutError::IoTimeout) => {
                    tracing::error!("send to {} timed out", dst);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(()) => {}
            }

            let confirmation = match exchange.response(&socket).await {
                Err(LanscoutError::IoTimeout) => {
                    tracing::error!("no response from {}", dst);
                    continue;
                }
                Err(e) => return Err(e),
                Ok(confirmation) => confirmation,
            };
            if confirmation.id != resp.id {
                return Err(LanscoutError::WrongResponse);
            }

            self.spawn_keepalive(socket, dst, exchange.clone());
            return Ok(resp);
        }
        Err(LanscoutError::ServerNotFound)
    }

    fn spawn_keepalive(&mut self, socket: Arc<UdpSocket>, dst: SocketAddr, exchange: Arc<Exchange>) {
        let (stop_tx, mut stop_rx) = mpsc::channel::<oneshot::Sender<()>>(1);
        let id = self.id.clone();
        let period = self.config.keepalive;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        tracing::debug!("send keep alive to {}", dst);
                        if let Err(e) = keepalive_once(&exchange, &socket, &id, dst).await {
                            tracing::error!("keep alive to {} failed: {}", dst, e);
                            return;
                        }
                    }
                    ack = stop_rx.recv() => {
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        return;
                    }
                }
            }
        });

        self.keepalive_task = Some(KeepaliveHandle { stop_tx, task });
    }

    async fn stop_keepalive(&mut self) {
        if let Some(handle) = self.keepalive_task.take() {
            let (ack_tx, ack_rx) = oneshot::channel();
            // A send failure means the task already ended on its own.
            if handle.stop_tx.send(ack_tx).await.is_ok() {
                let _ = ack_rx.await;
            }
            let _ = handle.task.await;
        }
    }
}

async fn keepalive_once(
    exchange: &Exchange,
    socket: &UdpSocket,
    id: &str,
    dst: SocketAddr,
) -> Result<()> {
    exchange
        .send_typed(socket, MsgType::KeepAlive, &id.to_string(), dst)
        .await?;
    exchange.response(socket).await?;
    Ok(())
}

impl Exchange {
    /// Seals a typed payload and sends it under the I/O deadline.
    async fn send_typed<T: Serialize>(
        &self,
        socket: &UdpSocket,
        typ: MsgType,
        val: &T,
        dst: SocketAddr,
    ) -> Result<()> {
        let plain = protocol::encode_typed(typ, val)?;
        let msg = Envelope::seal(
            &self.name,
            &self.server_name,
            &self.private_key,
            &self.server_key,
            &plain,
        )?;
        let buf = msg.encode()?;
        if buf.len() > self.buf_size {
            return Err(LanscoutError::TooBig(buf.len()));
        }

        match tokio::time::timeout(self.deadline, socket.send_to(&buf, dst)).await {
            Err(_) => Err(LanscoutError::IoTimeout),
            Ok(sent) => {
                sent?;
                Ok(())
            }
        }
    }

    /// Reads one envelope under the I/O deadline and opens it.
    ///
    /// An embedded error propagates verbatim; an envelope from anyone but
    /// the expected server, or addressed to someone else, is rejected.
    async fn response(&self, socket: &UdpSocket) -> Result<Response> {
        let mut buf = vec![0u8; self.buf_size];
        let (n, peer) = match tokio::time::timeout(self.deadline, socket.recv_from(&mut buf)).await
        {
            Err(_) => return Err(LanscoutError::IoTimeout),
            Ok(received) => received?,
        };
        tracing::debug!("response from {} with size {}", peer, n);

        let msg = Envelope::decode(&buf[..n])?;
        if let Some(err) = msg.err {
            return Err(LanscoutError::Remote(err));
        }
        if msg.from != self.server_name {
            return Err(LanscoutError::WrongServerName);
        }
        if msg.to != self.name {
            return Err(LanscoutError::NotForMe);
        }

        let plain = msg.open(&self.server_key, &self.private_key)?;
        protocol::decode_body(&plain)
    }
}
