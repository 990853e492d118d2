// src/server/dispatcher.rs
use crate::metrics::MetricsCollector;
use crate::server::listener::{AcceptError, ListeningSocket};
use crate::server::reader::ConnectionReader;
use crate::shutdown::CompletionSender;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};

/// Starts the accept loop on its own task and returns immediately.
///
/// Every accepted connection gets its own reader task holding one
/// completion token; the loop holds one more for itself. The loop ends when
/// `listener` is closed or accept fails, and the join handle yields the
/// number of connections accepted. Nothing here limits how many readers
/// run at once.
pub fn start_accepting(
    listener: ListeningSocket,
    reader: Arc<ConnectionReader>,
    completions: CompletionSender,
    metrics: Option<Arc<MetricsCollector>>,
) -> JoinHandle<u64> {
    let span = info_span!("dispatcher", local_addr = %listener.local_addr());
    tokio::spawn(accept_loop(listener, reader, completions, metrics).instrument(span))
}

async fn accept_loop(
    listener: ListeningSocket,
    reader: Arc<ConnectionReader>,
    completions: CompletionSender,
    metrics: Option<Arc<MetricsCollector>>,
) -> u64 {
    let done = completions.token();
    let mut accepted = 0u64;

    info!("accepting connections");

    loop {
        match listener.accept().await {
            Ok(conn) => {
                accepted += 1;
                if let Some(metrics) = &metrics {
                    metrics.record_accept();
                }

                let span = info_span!("connection", id = %conn.id(), peer = %conn.peer_addr());
                let reader = reader.clone();
                let token = completions.token();

                // One task per connection; the dispatcher never waits on it.
                tokio::spawn(
                    async move {
                        reader.run(conn).await;
                        token.signal();
                    }
                    .instrument(span),
                );
            }
            Err(AcceptError::Closed) => {
                info!(accepted, "listener closed, accept loop exiting");
                break;
            }
            Err(err) => {
                error!(%err, accepted, "accept failed, accept loop exiting");
                if let Some(metrics) = &metrics {
                    metrics.record_accept_error();
                }
                break;
            }
        }
    }

    done.signal();
    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;
    use crate::server::listener::bind_tcp;
    use crate::shutdown::ShutdownCoordinator;
    use std::net::SocketAddr;
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_closed_before_start_signals_once() {
        let listener = bind_tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let mut coordinator = ShutdownCoordinator::new();

        listener.close();
        let handle = start_accepting(
            listener.clone(),
            Arc::new(ConnectionReader::default()),
            coordinator.completions(),
            None,
        );

        assert_eq!(handle.await.unwrap(), 0);
        coordinator
            .wait_for_timeout(1, Duration::from_secs(5))
            .await
            .unwrap();

        // Nothing else may arrive.
        assert!(coordinator
            .wait_for_timeout(2, Duration::from_millis(100))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_dispatcher_does_not_wait_for_readers() {
        let listener = bind_tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let registry = MetricsRegistry::new().unwrap();
        let metrics = registry.collector();
        let mut coordinator = ShutdownCoordinator::new();
        let handle = start_accepting(
            listener.clone(),
            Arc::new(ConnectionReader::default()),
            coordinator.completions(),
            Some(metrics.clone()),
        );

        // Both clients stay open, so their readers stay blocked in read.
        let first = TcpStream::connect(listener.local_addr()).await.unwrap();
        let second = TcpStream::connect(listener.local_addr()).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while metrics.connections_accepted_total.get() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connections were never accepted");

        listener.close();
        let accepted = timeout(Duration::from_secs(5), handle)
            .await
            .expect("dispatcher kept running after close")
            .unwrap();
        assert_eq!(accepted, 2);

        // Only the dispatcher has finished.
        assert!(coordinator
            .wait_for_timeout(2, Duration::from_millis(100))
            .await
            .is_err());
        assert_eq!(coordinator.received(), 1);

        drop(first);
        drop(second);
        coordinator
            .wait_for_timeout(3, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
