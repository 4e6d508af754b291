// TCP Transport Implementation
// Length-prefixed postcard frames carrying versioned sync messages
//
// Frame: u32 big-endian length, then that many bytes. Frames above the
// configured cap are refused before the body is read.

use crate::sync::{Request, Response, SyncResponder};
use crate::transport::{PeerChannel, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

// ============================================================================
// FRAMING
// ============================================================================

/// Write one frame
pub async fn write_frame<W>(writer: &mut W, bytes: &[u8], max: usize) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: bytes.len(),
            max,
        });
    }
    let len = u32::try_from(bytes.len()).map_err(|_| TransportError::FrameTooLarge {
        size: bytes.len(),
        max,
    })?;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .write_all(bytes)
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    Ok(())
}

/// Read one frame
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let size = u32::from_be_bytes(len) as usize;
    if size > max {
        return Err(TransportError::FrameTooLarge { size, max });
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

// ============================================================================
// TCP CHANNEL
// ============================================================================

/// Client side: one lazily opened connection per peer
pub struct TcpChannel {
    address: String,
    connect_timeout: Duration,
    max_frame_bytes: usize,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpChannel {
    pub fn new(address: &str, max_frame_bytes: usize) -> Self {
        Self {
            address: address.to_string(),
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes,
            stream: Mutex::new(None),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream, TransportError> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true).ok();
        debug!(address = %self.address, "connected to peer");
        Ok(stream)
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        request: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        write_frame(stream, request, self.max_frame_bytes).await?;
        read_frame(stream, self.max_frame_bytes).await
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn request(&self, request: Request) -> Result<Response, TransportError> {
        let bytes = request.to_bytes()?;
        let mut guard = self.stream.lock().await;

        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        // A broken connection is dropped; the next request reconnects
        let reply = self.exchange(&mut stream, &bytes).await?;
        *guard = Some(stream);

        Ok(Response::from_bytes(&reply)?)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

// ============================================================================
// TCP SERVER
// ============================================================================

/// Accepts connections and answers requests with a [`SyncResponder`]
pub struct TcpSyncServer {
    listener: TcpListener,
    responder: Arc<SyncResponder>,
    max_frame_bytes: usize,
}

impl TcpSyncServer {
    /// Bind to an address (`host:port`, port 0 for a random one)
    pub async fn bind(
        address: &str,
        responder: Arc<SyncResponder>,
        max_frame_bytes: usize,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            listener,
            responder,
            max_frame_bytes,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|e| TransportError::InvalidAddress(e.to_string()))
    }

    /// Serve until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(address = ?self.listener.local_addr().ok(), "sync server listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        let responder = self.responder.clone();
                        let max = self.max_frame_bytes;
                        tokio::spawn(async move {
                            serve_connection(stream, peer, responder, max).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("sync server stopped");
    }

    /// Run on a background task
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    responder: Arc<SyncResponder>,
    max_frame_bytes: usize,
) {
    debug!(%peer, "peer connected");
    loop {
        let frame = match read_frame(&mut stream, max_frame_bytes).await {
            Ok(frame) => frame,
            Err(TransportError::NotConnected) => break,
            Err(e) => {
                warn!(%peer, error = %e, "dropping connection");
                break;
            }
        };

        let response = match Request::from_bytes(&frame) {
            Ok(request) => {
                let responder = responder.clone();
                match tokio::task::spawn_blocking(move || responder.handle(request)).await {
                    Ok(response) => response,
                    Err(e) => Response::Error {
                        message: format!("responder task failed: {}", e),
                    },
                }
            }
            Err(e) => Response::Error {
                message: e.to_string(),
            },
        };

        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%peer, error = %e, "failed to encode response");
                break;
            }
        };
        if let Err(e) = write_frame(&mut stream, &bytes, max_frame_bytes).await {
            warn!(%peer, error = %e, "failed to send response");
            break;
        }
    }
    debug!(%peer, "peer disconnected");
}
