// ────────────────────────────────
// src/server/listener.rs
// Encapsulates low‑level TCP bind/accept plus the explicit close contract
// the dispatcher's accept loop relies on.
// ────────────────────────────────
use crate::server::connection::Connection;
use anyhow::{Context, Result};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The socket was closed by its controller. Expected, terminal.
    #[error("listening socket closed")]
    Closed,

    #[error("accept failed: {0}")]
    Io(#[from] io::Error),
}

impl AcceptError {
    pub fn is_closed(&self) -> bool {
        matches!(self, AcceptError::Closed)
    }
}

/// Shared handle to a bound TCP listener.
///
/// `close` is the cancellation primitive for the accept loop: it marks the
/// socket closed and makes every pending and future `accept` return
/// [`AcceptError::Closed`] promptly. The OS socket itself is released when
/// the last handle is dropped.
#[derive(Clone)]
pub struct ListeningSocket {
    inner: Arc<Inner>,
}

struct Inner {
    listener: TcpListener,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

pub async fn bind_tcp(addr: SocketAddr) -> Result<ListeningSocket> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind listener on {}", addr))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read bound listener address")?;
    let (closed, _) = watch::channel(false);

    tracing::debug!(%local_addr, "listener bound");

    Ok(ListeningSocket {
        inner: Arc::new(Inner {
            listener,
            local_addr,
            closed,
        }),
    })
}

impl ListeningSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Returns `true` only for the call that actually closed the socket.
    pub fn close(&self) -> bool {
        let closed_now = self.inner.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });

        if closed_now {
            tracing::info!(local_addr = %self.inner.local_addr, "listening socket closed");
        }
        closed_now
    }

    pub async fn accept(&self) -> Result<Connection, AcceptError> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(AcceptError::Closed);
        }

        tokio::select! {
            biased;

            _ = closed.changed() => Err(AcceptError::Closed),
            accepted = self.inner.listener.accept() => {
                let (stream, peer) = accepted?;
                Ok(Connection::new(stream, peer))
            }
        }
    }
}
