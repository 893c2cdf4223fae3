use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    net::{TcpStream, ToSocketAddrs},
    sync::watch,
};
use tracing::{debug, info};

use crate::{BufferServerSubscriber, ReadControl, StreamCodec};

/// Read side switch driven by a subscriber's flow control.
#[derive(Clone)]
pub struct ReadGate {
    suspended: Arc<watch::Sender<bool>>,
}

impl Default for ReadGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            suspended: Arc::new(tx),
        }
    }

    pub fn is_suspended(&self) -> bool {
        *self.suspended.borrow()
    }

    /// Returns once reads are allowed.
    pub async fn wait_resumed(&self) {
        let mut rx = self.suspended.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|suspended| !*suspended).await;
    }
}

impl ReadControl for ReadGate {
    fn suspend_read(&self) {
        self.suspended.send_replace(true);
    }

    fn resume_read(&self) {
        self.suspended.send_replace(false);
    }
}

/// Reads one length-prefixed frame. `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let read = reader
            .read(&mut prefix[filled..])
            .await
            .context("reading frame length")?;
        if read == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(anyhow!(
                "stream ended after {} of 4 frame length bytes",
                filled
            ));
        }
        filled += read;
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_frame_bytes {
        return Err(anyhow!(
            "frame of {} bytes exceeds the {} byte limit",
            len,
            max_frame_bytes
        ));
    }
    let mut buf = BytesMut::zeroed(len);
    reader
        .read_exact(&mut buf)
        .await
        .with_context(|| format!("reading frame body of {} bytes", len))?;
    Ok(Some(buf.freeze()))
}

/// Feeds frames from a byte stream into a subscriber, pausing while the gate
/// is suspended.
pub struct FrameReader<R> {
    reader: R,
    gate: ReadGate,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, gate: ReadGate, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            gate,
            max_frame_bytes,
        }
    }

    /// Runs until the stream ends. Returns the number of frames read.
    pub async fn pump<C: StreamCodec>(&mut self, subscriber: &BufferServerSubscriber<C>) -> Result<u64> {
        let mut frames = 0;
        loop {
            if self.gate.is_suspended() {
                debug!(subscriber = subscriber.id(), "reads suspended");
                self.gate.wait_resumed().await;
                debug!(subscriber = subscriber.id(), "reads resumed");
            }
            match read_frame(&mut self.reader, self.max_frame_bytes).await? {
                Some(frame) => {
                    subscriber.on_message(&frame);
                    frames += 1;
                }
                None => break,
            }
        }
        info!(subscriber = subscriber.id(), frames, "buffer server stream ended");
        Ok(frames)
    }
}

pub type TcpTransport = FrameReader<TcpStream>;

impl FrameReader<TcpStream> {
    pub async fn connect<A: ToSocketAddrs>(addr: A, gate: ReadGate, max_frame_bytes: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("connecting to buffer server")?;
        stream.set_nodelay(true)?;
        info!(peer = %stream.peer_addr()?, "connected to buffer server");
        Ok(Self::new(stream, gate, max_frame_bytes))
    }
}
