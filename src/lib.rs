//! LAN service discovery over UDP multicast, broadcast, or loopback.
//!
//! A [`Client`] locates an unknown [`Server`] on the same link and
//! establishes a persistent session keyed by a server-minted UUID:
//! - three-phase handshake: request → confirm → keepalive loop
//! - every datagram is an [`Envelope`]: chunked RSA-OAEP encryption under
//!   the recipient's key, RSA-PSS signature per chunk under the sender's
//! - the server keeps a TTL-swept [`SessionTable`] and stamps each session
//!   with its arrival sequence number
//! - the transport picks multicast, broadcast, or unicast-loopback mode
//!   from the selected interface's capabilities
//!
//! Both sides plug in their half of the application protocol as plain
//! callbacks: the client's produces the request payload, the server's turns
//! a request into a response.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lanscout::{
//!     Capability, Client, ClientConfig, LanscoutError, PubKeys, Request, Response, Server,
//!     ServerConfig,
//! };
//!
//! # async fn run(
//! #     server_key: rsa::RsaPrivateKey,
//! #     client_key: rsa::RsaPrivateKey,
//! # ) -> lanscout::Result<()> {
//! let interface = lanscout::discover_interface(Capability::Multicast)?;
//!
//! let keys = Arc::new(PubKeys::new());
//! keys.put("alice", rsa::RsaPublicKey::from(&client_key)).await;
//!
//! let mut server = Server::new(
//!     ServerConfig { interface: Some(interface.clone()), ..Default::default() },
//!     server_key.clone(),
//!     keys,
//!     Arc::new(|_peer, req: Request| {
//!         if req.data != b"request" {
//!             return Err(LanscoutError::Protocol("protocol error".to_string()));
//!         }
//!         Ok(Response { data: b"msg".to_vec(), ..Default::default() })
//!     }),
//! );
//! server.start().await?;
//!
//! let mut client = Client::new(
//!     ClientConfig {
//!         interface: Some(interface),
//!         port: server.port(),
//!         name: "alice".to_string(),
//!         server_name: "master".to_string(),
//!         ..Default::default()
//!     },
//!     client_key,
//!     rsa::RsaPublicKey::from(&server_key),
//!     Arc::new(|_dst| Ok(Request { data: b"request".to_vec(), ..Default::default() })),
//! );
//! let resp = client.discover().await?;
//! assert_eq!(resp.data, b"msg");
//!
//! client.close().await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod envelope;
pub mod error;
pub mod iface;
pub mod keystore;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use client::{Client, ClientConfig, RequestFn};
pub use envelope::Envelope;
pub use error::{LanscoutError, Result};
pub use iface::{discover_interface, AddrFamily, Capability};
pub use keystore::PubKeys;
pub use protocol::{MsgType, Request, Response};
pub use server::{Protocol, Server, ServerConfig};
pub use session::{SessionContext, SessionTable};
pub use transport::Groups;
