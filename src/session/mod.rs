//! Server-side session table.
//!
//! Sessions are keyed by the UUID minted on their first request and expire
//! after a TTL that every successful lookup refreshes. A background sweeper
//! removes expired entries; shutdown is a rendezvous, so [`SessionTable::close`]
//! returns only after the sweeper has acknowledged and stopped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;

use crate::error::{LanscoutError, Result};

/// How long a session lives without a refreshing lookup.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// How often the sweeper scans for expired sessions.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// One client session as the server tracks it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub id: String,
    pub seq: u16,
    pub peer: SocketAddr,
}

struct Entry {
    ctx: SessionContext,
    deadline: Instant,
}

/// TTL-indexed map of session id → session context.
pub struct SessionTable {
    sessions: Arc<RwLock<HashMap<String, Entry>>>,
    duration: Duration,
    close_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl SessionTable {
    /// Creates the table and starts its sweeper task.
    pub fn new(duration: Duration, sweep_interval: Duration) -> Self {
        let sessions: Arc<RwLock<HashMap<String, Entry>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let (close_tx, mut close_rx) = mpsc::channel::<oneshot::Sender<()>>(1);

        let swept = sessions.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        swept.write().await.retain(|_, entry| entry.deadline >= now);
                    }
                    ack = close_rx.recv() => {
                        if let Some(ack) = ack {
                            let _ = ack.send(());
                        }
                        return;
                    }
                }
            }
        });

        Self {
            sessions,
            duration,
            close_tx,
        }
    }

    /// Inserts a new session keyed by its id.
    pub async fn register(&self, ctx: SessionContext) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&ctx.id) {
            return Err(LanscoutError::CtxAlreadyRegistered);
        }
        let deadline = Instant::now() + self.duration;
        sessions.insert(ctx.id.clone(), Entry { ctx, deadline });
        Ok(())
    }

    /// Looks up a session and refreshes its TTL.
    ///
    /// The refresh mutates the deadline, so lookups take the write lock.
    pub async fn get(&self, id: &str) -> Result<SessionContext> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(id).ok_or(LanscoutError::CtxNotFound)?;
        entry.deadline = Instant::now() + self.duration;
        Ok(entry.ctx.clone())
    }

    /// Removes a session.
    pub async fn del(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .remove(id)
            .map(|_| ())
            .ok_or(LanscoutError::CtxNotFound)
    }

    /// Stops the sweeper, returning once it has acknowledged.
    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.close_tx.send(ack_tx).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    #[cfg(test)]
    async fn deadline_of(&self, id: &str) -> Option<Instant> {
        self.sessions.read().await.get(id).map(|e| e.deadline)
    }
}
