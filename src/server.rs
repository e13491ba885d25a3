//! Loopback TCP echo server.
//!
//! Accepts connections on a background task and serves each one on its
//! own task. Every chunk read from a connection is written straight back
//! to it, unmodified, until the peer closes or an I/O error occurs.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Read buffer size
pub const BUFFER_SIZE: usize = 1024;

/// Listen backlog for the accept queue
const BACKLOG: i32 = 1024;

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How a connection came to an end.
///
/// The peer sees the same thing in every case: its connection is closed.
#[derive(Debug)]
pub enum Disconnect {
    /// The peer shut down its write side.
    Eof,
    /// The peer went away mid-stream (reset, aborted, broken pipe).
    PeerGone(io::ErrorKind),
    /// Any other I/O failure.
    Failed(io::Error),
}

impl From<io::Error> for Disconnect {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => Disconnect::PeerGone(e.kind()),
            _ => Disconnect::Failed(e),
        }
    }
}

/// Echo server bound to a local address
pub struct EchoServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl EchoServer {
    /// Bind the listening socket.
    ///
    /// Pass port 0 to let the OS pick a free port; `local_addr` reports the
    /// one it chose. Must be called from within a tokio runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(addr)?)?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Echo server bound");

        Ok(EchoServer {
            listener,
            local_addr,
        })
    }

    /// Address the server is actually listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop on a detached background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Accept connections forever.
    pub async fn run(self) {
        let listener = self.listener;
        serve(|| listener.accept()).await
    }
}

/// Accept loop: one echo task per accepted connection.
///
/// A failed accept (aborted handshake, out of descriptors) is logged and
/// the loop keeps going after a short pause.
async fn serve<F, Fut, S>(mut accept: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(S, SocketAddr)>>,
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "New connection");

                tokio::spawn(async move {
                    match handle_connection(stream).await {
                        Disconnect::Eof => trace!(peer = %peer, "Connection closed by client"),
                        Disconnect::PeerGone(kind) => {
                            trace!(peer = %peer, ?kind, "Client went away")
                        }
                        Disconnect::Failed(e) => {
                            debug!(peer = %peer, error = %e, "Connection error")
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Echo everything read from `stream` back to it.
///
/// Returns once the peer closes or an I/O error occurs; the stream is
/// dropped (closed) on return.
pub async fn handle_connection<S>(mut stream: S) -> Disconnect
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buffer.clear();
        match stream.read_buf(&mut buffer).await {
            Ok(0) => return Disconnect::Eof,
            Ok(_) => {}
            Err(e) => return e.into(),
        }

        if let Err(e) = stream.write_all(&buffer).await {
            return e.into();
        }
    }
}

/// Create the listening socket with `SO_REUSEADDR`.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    async fn start() -> SocketAddr {
        let server = EchoServer::bind(loopback()).unwrap();
        let addr = server.local_addr();
        server.spawn();
        addr
    }

    #[tokio::test]
    async fn test_echo_single_chunk() {
        let mock = tokio_test::io::Builder::new()
            .read(b"ping")
            .write(b"ping")
            .build();

        assert!(matches!(handle_connection(mock).await, Disconnect::Eof));
    }

    #[tokio::test]
    async fn test_echo_preserves_chunks_in_order() {
        let mock = tokio_test::io::Builder::new()
            .read(b"hello ")
            .write(b"hello ")
            .read(&[0x00, 0xff, 0x0a])
            .write(&[0x00, 0xff, 0x0a])
            .read(b"world")
            .write(b"world")
            .build();

        assert!(matches!(handle_connection(mock).await, Disconnect::Eof));
    }

    #[tokio::test]
    async fn test_large_chunk_read_in_buffer_sized_pieces() {
        let payload = vec![0xabu8; BUFFER_SIZE + 24];
        let mock = tokio_test::io::Builder::new()
            .read(&payload)
            .write(&payload[..BUFFER_SIZE])
            .write(&payload[BUFFER_SIZE..])
            .build();

        assert!(matches!(handle_connection(mock).await, Disconnect::Eof));
    }

    #[tokio::test]
    async fn test_immediate_eof() {
        let mock = tokio_test::io::Builder::new().build();
        assert!(matches!(handle_connection(mock).await, Disconnect::Eof));
    }

    #[tokio::test]
    async fn test_reset_is_peer_gone() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abc")
            .write(b"abc")
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();

        assert!(matches!(
            handle_connection(mock).await,
            Disconnect::PeerGone(io::ErrorKind::ConnectionReset)
        ));
    }

    #[tokio::test]
    async fn test_write_error_stops_handler() {
        let mock = tokio_test::io::Builder::new()
            .read(b"abc")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();

        assert!(matches!(
            handle_connection(mock).await,
            Disconnect::PeerGone(io::ErrorKind::BrokenPipe)
        ));
    }

    #[tokio::test]
    async fn test_unexpected_error_is_failed() {
        let mock = tokio_test::io::Builder::new()
            .read_error(io::Error::new(io::ErrorKind::Other, "boom"))
            .build();

        match handle_connection(mock).await {
            Disconnect::Failed(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let server = EchoServer::bind(loopback()).unwrap();
        let addr = server.local_addr();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails() {
        let first = std::net::TcpListener::bind(loopback()).unwrap();
        let taken = first.local_addr().unwrap();
        assert!(EchoServer::bind(taken).is_err());
    }

    #[tokio::test]
    async fn test_echo_over_tcp() {
        let addr = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_half_close_closes_server_side() {
        let addr = start().await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"last words").await.unwrap();
        client.shutdown().await.unwrap();

        // read_to_end only returns once the server closes its side
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut received))
            .await
            .expect("server did not close the connection")
            .unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let addr = start().await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        a.write_all(b"from-a").await.unwrap();
        b.write_all(b"from-b!").await.unwrap();
        a.write_all(b"+more").await.unwrap();

        let mut buf_a = [0u8; 11];
        a.read_exact(&mut buf_a).await.unwrap();
        assert_eq!(&buf_a, b"from-a+more");

        b.shutdown().await.unwrap();
        let mut buf_b = Vec::new();
        b.read_to_end(&mut buf_b).await.unwrap();
        assert_eq!(buf_b, b"from-b!");
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_listener() {
        let (client, server_side) = tokio::io::duplex(64);
        let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, 40000));
        let mut accepts = std::collections::VecDeque::from(vec![
            Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
            Err(io::Error::new(io::ErrorKind::Other, "too many open files")),
            Ok((server_side, peer)),
        ]);

        tokio::spawn(serve(move || {
            let next = accepts.pop_front();
            async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            }
        }));

        let mut client = client;
        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("connection after accept errors was not served")
            .unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_many_concurrent_clients() {
        let addr = start().await;

        let clients: Vec<_> = (0..16u8)
            .map(|id| {
                tokio::spawn(async move {
                    let mut stream = TcpStream::connect(addr).await.unwrap();
                    let payload: Vec<u8> = (0..200).map(|i| id.wrapping_add(i)).collect();
                    stream.write_all(&payload).await.unwrap();
                    stream.shutdown().await.unwrap();

                    let mut echoed = Vec::new();
                    stream.read_to_end(&mut echoed).await.unwrap();
                    assert_eq!(echoed, payload);
                })
            })
            .collect();

        for client in clients {
            client.await.unwrap();
        }
    }
}
