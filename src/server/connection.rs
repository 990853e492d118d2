// src/server/connection.rs
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

/// One accepted TCP stream, owned by exactly one reader.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    stream: Option<TcpStream>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            local: stream.local_addr().ok(),
            stream: Some(stream),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Reads the next chunk into `buf`. `Ok(0)` is end-of-stream.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )),
        }
    }

    /// Shuts the stream down and releases it. Returns `false` if it was
    /// already closed.
    pub async fn close(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };

        // The peer may already have reset the socket.
        if let Err(err) = stream.shutdown().await {
            tracing::debug!(peer = %self.peer, %err, "shutdown on close failed");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use crate::server::listener::bind_tcp;
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_read_then_eof_then_double_close() {
        let listener = bind_tcp(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut conn = listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        drop(client);

        let mut buf = [0u8; 16];
        let mut received = Vec::new();
        loop {
            let n = conn.read_chunk(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, b"ping");

        assert!(conn.close().await);
        assert!(!conn.close().await);
        assert!(conn.is_closed());
        assert!(conn.read_chunk(&mut buf).await.is_err());
    }
}
