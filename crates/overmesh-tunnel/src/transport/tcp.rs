//! TCP transport
//!
//! Frames are length-prefixed on the stream:
//! [Length: 4 bytes BE][Frame: bincode]

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{TunnelError, TunnelResult};
use crate::message::Frame;

use super::{Socket, Transport, TransportListener};

/// Maximum frame size on the wire
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// TCP transport factory
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str) -> TunnelResult<Box<dyn Socket>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!("dialed {}", addr);
        Ok(Box::new(TcpSocket::new(stream)?))
    }

    async fn listen(&self, addr: &str) -> TunnelResult<Box<dyn TransportListener>> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?.to_string();
        debug!("listening on {}", addr);
        Ok(Box::new(TcpTransportListener { listener, addr }))
    }
}

/// One framed TCP connection
struct TcpSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    remote: String,
    local: String,
}

impl TcpSocket {
    fn new(stream: TcpStream) -> TunnelResult<Self> {
        let remote = stream.peer_addr()?.to_string();
        let local = stream.local_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            remote,
            local,
        })
    }
}

#[async_trait]
impl Socket for TcpSocket {
    async fn send(&self, frame: &Frame) -> TunnelResult<()> {
        let body = frame.to_bytes()?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge {
                size: body.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        trace!("sent {} bytes to {}", body.len(), self.remote);
        Ok(())
    }

    async fn recv(&self) -> TunnelResult<Frame> {
        let mut reader = self.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TunnelError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        trace!("received {} bytes from {}", len, self.remote);

        Frame::from_bytes(&body)
    }

    fn remote(&self) -> String {
        self.remote.clone()
    }

    fn local(&self) -> String {
        self.local.clone()
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Bound TCP listener
struct TcpTransportListener {
    listener: TcpListener,
    addr: String,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> TunnelResult<Box<dyn Socket>> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("accepted connection from {}", peer);
        Ok(Box::new(TcpSocket::new(stream)?))
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_listen_roundtrip() {
        let transport = TcpTransport::new();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();

        let client = transport.dial(&addr).await.unwrap();

        let mut frame = Frame::with_body(b"ping".to_vec());
        frame.set_header("X-Test", "1");
        client.send(&frame).await.unwrap();

        let server = listener.accept().await.unwrap();
        let received = server.recv().await.unwrap();
        assert_eq!(received, frame);

        // and back the other way
        let reply = Frame::with_body(b"pong".to_vec());
        server.send(&reply).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_recv_fails_after_peer_close() {
        let transport = TcpTransport::new();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.addr();

        let client = transport.dial(&addr).await.unwrap();
        let server = listener.accept().await.unwrap();

        client.close().await;
        assert!(server.recv().await.is_err());
    }
}
