// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::config::{ServerConfig, DEFAULT_READ_BUFFER_SIZE};
use crate::metrics::MetricsCollector;
use crate::server::dispatcher::start_accepting;
use crate::server::listener::{bind_tcp, ListeningSocket};
use crate::server::reader::{ChunkSink, ConnectionReader, LogSink};
use crate::shutdown::{ShutdownCoordinator, ShutdownError};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Builder pattern so `main.rs` (or a test) can pick the sink and limits.
pub struct ServerBuilder {
    addr: SocketAddr,
    read_buffer_size: usize,
    shutdown_timeout: Option<Duration>,
    sink: Option<Arc<dyn ChunkSink>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            shutdown_timeout: None,
            sink: None,
            metrics: None,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.listen_addr)
            .with_read_buffer_size(config.read_buffer_size)
            .with_shutdown_timeout(config.shutdown_timeout())
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Bounds [`Server::wait_for_shutdown`] and [`Server::shutdown`].
    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Where received chunks go. Defaults to [`LogSink`].
    pub fn with_sink(mut self, sink: Arc<dyn ChunkSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Consume the builder, bind the listener and start the dispatcher.
    ///
    /// A bind failure is returned here and no task is started.
    pub async fn start(self) -> Result<Server> {
        let listener = bind_tcp(self.addr).await?;
        tracing::info!("TCP server listening on {}", listener.local_addr());

        let sink = self.sink.unwrap_or_else(|| Arc::new(LogSink));
        let reader = ConnectionReader::new(sink)
            .with_buffer_size(self.read_buffer_size)
            .with_metrics(self.metrics.clone());

        let coordinator = ShutdownCoordinator::new();
        let dispatcher = start_accepting(
            listener.clone(),
            Arc::new(reader),
            coordinator.completions(),
            self.metrics,
        );

        Ok(Server {
            listener,
            coordinator,
            dispatcher: Some(dispatcher),
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Handle held by whoever started the server.
pub struct Server {
    listener: ListeningSocket,
    coordinator: ShutdownCoordinator,
    dispatcher: Option<JoinHandle<u64>>,
    shutdown_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections the dispatcher accepted, one reader each.
    pub accepted: u64,
    /// Completion signals observed: `accepted + 1`.
    pub signals: u64,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn listener(&self) -> &ListeningSocket {
        &self.listener
    }

    /// Closes the listening socket, which ends the accept loop. Idempotent.
    pub fn close(&self) -> bool {
        self.listener.close()
    }

    /// Blocks until `expected` completion signals have arrived in total.
    pub async fn wait_for_shutdown(&mut self, expected: u64) -> Result<(), ShutdownError> {
        match self.shutdown_timeout {
            Some(limit) => self.coordinator.wait_for_timeout(expected, limit).await,
            None => {
                self.coordinator.wait_for(expected).await;
                Ok(())
            }
        }
    }

    /// Closes the listener, waits for the dispatcher and every reader it
    /// spawned, then releases the listening socket.
    pub async fn shutdown(mut self) -> Result<ShutdownReport, ShutdownError> {
        self.close();

        let accepted = match self.dispatcher.take() {
            Some(dispatcher) => dispatcher.await?,
            None => 0,
        };
        let expected = accepted + 1;
        self.wait_for_shutdown(expected).await?;

        let report = ShutdownReport {
            accepted,
            signals: self.coordinator.received(),
        };
        tracing::info!(
            accepted = report.accepted,
            signals = report.signals,
            "shutdown complete"
        );

        drop(self.listener);
        Ok(report)
    }
}
