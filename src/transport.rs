use std::io;
use std::sync::Arc;

use mavlink::ardupilotmega::MavMessage;
use mavlink::MavHeader;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::warn;

use crate::frame::{encode_frame, FrameDecoder};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("read failed: {0}")]
    Read(io::Error),
    #[error("write failed: {0}")]
    Write(io::Error),
    #[error("link closed by peer")]
    Closed,
    #[error("not connected")]
    NotConnected,
}

/// Open the TCP link to the autopilot and split it into the receive side
/// (owned by the session loop) and the raw write half (installed into the
/// shared `MavSender`).
pub async fn connect(host: &str, port: u16) -> Result<(FrameReader, OwnedWriteHalf), TransportError> {
    let addr = format!("{host}:{port}");
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| TransportError::Connect { addr, source })?;
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    Ok((FrameReader::new(read_half), write_half))
}

/// Receive side of the link: reads bytes off the socket and yields decoded
/// frames. Frames that fail to decode are logged and dropped without
/// disturbing the stream.
pub struct FrameReader {
    half: OwnedReadHalf,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl FrameReader {
    fn new(half: OwnedReadHalf) -> Self {
        Self {
            half,
            decoder: FrameDecoder::new(),
            buf: vec![0u8; 4096],
        }
    }

    pub async fn recv_frame(&mut self) -> Result<(MavHeader, MavMessage), TransportError> {
        loop {
            while let Some(result) = self.decoder.next_frame() {
                match result {
                    Ok(frame) => return Ok(frame),
                    Err(e) => warn!("dropping frame: {e}"),
                }
            }

            let n = self
                .half
                .read(&mut self.buf)
                .await
                .map_err(TransportError::Read)?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.decoder.extend(&self.buf[..n]);
        }
    }
}

struct SenderInner {
    half: Option<OwnedWriteHalf>,
    sequence: u8,
}

/// Shared, reconnect-aware write handle. The link manager installs the write
/// half of each new connection and clears it on loss; the command tracker and
/// monitor send through the same handle for the whole session. Carries our
/// source ids and the outgoing sequence counter.
#[derive(Clone)]
pub struct MavSender {
    system_id: u8,
    component_id: u8,
    inner: Arc<Mutex<SenderInner>>,
}

impl MavSender {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
            inner: Arc::new(Mutex::new(SenderInner {
                half: None,
                sequence: 0,
            })),
        }
    }

    pub async fn install(&self, half: OwnedWriteHalf) {
        let mut inner = self.inner.lock().await;
        inner.half = Some(half);
    }

    /// Drop the write half. Shuts the socket down so a blocked peer read
    /// observes the close.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(mut half) = inner.half.take() {
            let _ = half.shutdown().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.half.is_some()
    }

    pub async fn send(&self, msg: &MavMessage) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        if inner.half.is_none() {
            return Err(TransportError::NotConnected);
        }

        let header = MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: inner.sequence,
        };
        inner.sequence = inner.sequence.wrapping_add(1);

        let bytes = encode_frame(header, msg)
            .map_err(|e| TransportError::Write(io::Error::other(e.to_string())))?;
        match inner.half.as_mut() {
            Some(half) => half.write_all(&bytes).await.map_err(TransportError::Write),
            None => Err(TransportError::NotConnected),
        }
    }
}
