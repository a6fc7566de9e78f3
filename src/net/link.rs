use std::net::SocketAddr;

use quinn::{Connecting, RecvStream, SendStream, VarInt};
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    wire::{FrameHeader, Request, Response, HEADER_LEN},
    MAX_FRAME_LEN,
};
use crate::error::Error::{self, *};

/// Links are the QUIC connections between a run driver, the broker and the
/// compute nodes. Every call opens a fresh bidirectional stream, so calls
/// issued concurrently on one link never wait for each other.
///
/// Can be cloned to obtain another handle to the same link.
#[derive(Clone)]
pub struct Link {
    conn: quinn::Connection,
    remote_addr: SocketAddr,
}

impl Link {
    /// Completes an in-progress connection.
    pub async fn new(in_progress: Connecting) -> Result<Self, Error> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("link", remote = %remote_addr);
        async move {
            debug!("establishing QUIC connection");
            let conn = in_progress.await?;
            debug!("connected via QUIC");
            Ok(Link { conn, remote_addr })
        }
        .instrument(span)
        .await
    }

    /// Sends one request and waits for its response. A `Failed` response
    /// from the peer is turned into [`Error::Remote`].
    pub async fn call(&self, request: &Request) -> Result<Response, Error> {
        let span = debug_span!(
            "call",
            remote = %self.remote_addr,
            op = request.name()
        );
        async move {
            let (raw_tx, raw_rx) = self.conn.open_bi().await?;
            let mut send_stream = FrameSendStream::new(raw_tx);
            let mut recv_stream = FrameRecvStream::new(raw_rx);

            send_stream.send(&request.encode().await?).await?;
            send_stream.finish().await?;
            trace!("request sent");

            let payload = recv_stream.receive().await?;
            match Response::decode(&payload).await? {
                Response::Failed(reason) => Err(Remote(reason)),
                response => Ok(response),
            }
        }
        .instrument(span)
        .await
    }

    /// Closes the link. Calls still in flight fail.
    pub fn close(&self, reason: &[u8]) {
        self.conn.close(VarInt::from_u32(0), reason);
    }

    pub fn conn(&self) -> &quinn::Connection {
        &self.conn
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

pub struct FrameSendStream(SendStream);

impl FrameSendStream {
    pub fn new(stream: SendStream) -> Self {
        Self(stream)
    }

    /// Writes one `sent_at | len | payload` frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), Error> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_FRAME_LEN)
            .ok_or(MessageLengthOverflowed(u32::MAX))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&FrameHeader::now(len).to_bytes());
        buf.extend_from_slice(payload);
        self.0.write_all(&buf).await?;
        Ok(())
    }

    /// Finishes the stream, resolving once the peer has acknowledged every
    /// byte written to it.
    pub async fn finish(&mut self) -> Result<(), Error> {
        self.0.finish().await?;
        Ok(())
    }
}

pub struct FrameRecvStream(RecvStream);

impl FrameRecvStream {
    pub fn new(stream: RecvStream) -> Self {
        Self(stream)
    }

    /// Reads one frame and returns its payload.
    pub async fn receive(&mut self) -> Result<Vec<u8>, Error> {
        let mut header_buf = [0u8; HEADER_LEN];
        self.0.read_exact(&mut header_buf).await?;
        let header = FrameHeader::from_bytes(&header_buf);
        if header.len > MAX_FRAME_LEN {
            Err(MessageLengthOverflowed(header.len))?
        }
        trace!(
            age_us = header.age_micros(),
            len = header.len,
            "frame arriving"
        );

        let mut payload = vec![0u8; header.len as usize];
        self.0.read_exact(&mut payload).await?;
        Ok(payload)
    }
}
