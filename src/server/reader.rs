// src/server/reader.rs
use crate::config::DEFAULT_READ_BUFFER_SIZE;
use crate::metrics::MetricsCollector;
use crate::server::connection::Connection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a reader's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// End-of-stream: the peer closed its write side.
    PeerClosed,
    /// Any other read error.
    Failed(io::ErrorKind),
}

/// Receives what a reader observes on its connection.
pub trait ChunkSink: Send + Sync + 'static {
    fn on_chunk(&self, peer: SocketAddr, chunk: &[u8]);

    /// Called after the connection has been closed.
    fn on_close(&self, _peer: SocketAddr, _outcome: ReadOutcome) {}
}

/// Logs every received chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ChunkSink for LogSink {
    fn on_chunk(&self, peer: SocketAddr, chunk: &[u8]) {
        info!(%peer, len = chunk.len(), "received: \"{}\"", chunk.escape_ascii());
    }
}

/// Drains one connection until end-of-stream or error, then closes it.
pub struct ConnectionReader {
    buffer_size: usize,
    sink: Arc<dyn ChunkSink>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl ConnectionReader {
    pub fn new(sink: Arc<dyn ChunkSink>) -> Self {
        Self {
            buffer_size: DEFAULT_READ_BUFFER_SIZE,
            sink,
            metrics: None,
        }
    }

    /// A zero size is bumped to one byte so a read can never report a
    /// spurious end-of-stream.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsCollector>>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub async fn run(&self, mut conn: Connection) -> ReadOutcome {
        let peer = conn.peer_addr();
        let mut buffer = vec![0u8; self.buffer_size];

        if let Some(metrics) = &self.metrics {
            metrics.increment_active_connections();
        }

        let outcome = loop {
            match conn.read_chunk(&mut buffer).await {
                Ok(0) => {
                    debug!(%peer, "peer closed connection");
                    break ReadOutcome::PeerClosed;
                }
                Ok(n) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_bytes_received(n);
                    }
                    self.sink.on_chunk(peer, &buffer[..n]);
                }
                Err(err) => {
                    warn!(%peer, %err, "read failed");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_read_error();
                    }
                    break ReadOutcome::Failed(err.kind());
                }
            }
        };

        conn.close().await;

        if let Some(metrics) = &self.metrics {
            metrics.decrement_active_connections();
        }
        self.sink.on_close(peer, outcome);

        outcome
    }
}

impl Default for ConnectionReader {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::listener::bind_tcp;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u8>>);

    impl ChunkSink for Collect {
        fn on_chunk(&self, _peer: SocketAddr, chunk: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(chunk);
        }
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_log_sink_records_escaped_bytes() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let peer = SocketAddr::from(([127, 0, 0, 1], 4000));
        tracing::subscriber::with_default(subscriber, || {
            LogSink.on_chunk(peer, b"Hello\n");
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains(r#"received: "Hello\n""#), "{output}");
        assert!(output.contains("len=6"), "{output}");
        assert!(output.contains("peer=127.0.0.1:4000"), "{output}");
    }

    #[test]
    fn test_zero_buffer_size_is_bumped() {
        let reader = ConnectionReader::default().with_buffer_size(0);
        assert_eq!(reader.buffer_size(), 1);
    }

    #[tokio::test]
    async fn test_small_buffer_reassembles_payload() {
        let listener = bind_tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let conn = listener.accept().await.unwrap();

        client.write_all(b"fragmented payload").await.unwrap();
        drop(client);

        let sink = Arc::new(Collect::default());
        let reader = ConnectionReader::new(sink.clone()).with_buffer_size(3);

        assert_eq!(reader.run(conn).await, ReadOutcome::PeerClosed);
        assert_eq!(sink.0.lock().unwrap().as_slice(), b"fragmented payload");
    }
}
