//! TCP transport: one socket, split into a framed reader and a raw writer.

use futures_util::StreamExt;
use rmpv::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tracing::debug;

use crate::rpc::client::RpcClientError;
use crate::rpc::codec::MsgpackCodec;

/// Connection establishment for the agent RPC socket.
#[derive(Debug, Clone, Copy)]
pub struct Transport;

impl Transport {
    /// Connects to `host:port` and splits the socket into its two halves.
    pub async fn connect(
        host: &str,
        port: u16,
    ) -> Result<(TransportReader, TransportWriter), RpcClientError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| RpcClientError::Connect {
                addr: format_addr(host, port),
                source,
            })?;
        stream.set_nodelay(true)?;
        debug!(event = "rpc_transport_connected", host, port);

        let (read, write) = stream.into_split();
        Ok((
            TransportReader {
                frames: FramedRead::new(read, MsgpackCodec),
            },
            TransportWriter { half: Some(write) },
        ))
    }
}

pub(crate) fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Read side of the socket, yielding one decoded value per call.
#[derive(Debug)]
pub struct TransportReader {
    frames: FramedRead<OwnedReadHalf, MsgpackCodec>,
}

impl TransportReader {
    /// Reads the next message. `Ok(None)` means the peer closed the stream
    /// cleanly between messages.
    pub async fn read_message(&mut self) -> Result<Option<Value>, RpcClientError> {
        self.frames.next().await.transpose()
    }
}

/// Write side of the socket.
#[derive(Debug)]
pub struct TransportWriter {
    half: Option<OwnedWriteHalf>,
}

impl TransportWriter {
    /// Writes a complete frame and returns the number of bytes written.
    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize, RpcClientError> {
        let half = self.half.as_mut().ok_or(RpcClientError::ConnectionClosed)?;
        half.write_all(bytes).await?;
        Ok(bytes.len())
    }

    /// Shuts down the write side. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut half) = self.half.take() {
            let _ = half.shutdown().await;
        }
    }
}
