use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use async_trait::async_trait;
use quinn::{Connecting, RecvStream, SendStream, VarInt};
use rustls::{Certificate, PrivateKey};
use tokio::{select, sync::watch};
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    link::{FrameRecvStream, FrameSendStream, Link},
    tls,
    wire::{Request, Response},
    SERVER_NAME,
};
use crate::error::Error;

/// Something that answers requests arriving at an [`Endpoint`].
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response, Error>;
}

/// A QUIC endpoint. Serving endpoints accept links and answer each stream
/// with a [`Service`]; every endpoint can also dial out.
pub struct Endpoint {
    ep: quinn::Endpoint,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl Endpoint {
    /// Creates a serving endpoint bound to `socket_addr` using a freshly
    /// generated certificate.
    pub fn server(socket_addr: SocketAddr) -> Result<Self, Error> {
        let (chain, key) = tls::self_signed()?;
        Self::server_with_cert(socket_addr, chain, key)
    }

    /// Creates a serving endpoint bound to `socket_addr` presenting the
    /// given certificate chain.
    pub fn server_with_cert(
        socket_addr: SocketAddr,
        chain: Vec<Certificate>,
        key: PrivateKey,
    ) -> Result<Self, Error> {
        let server_config = tls::server_config(chain, key)?;
        let mut ep = quinn::Endpoint::server(server_config, socket_addr)?;
        ep.set_default_client_config(tls::client_config());
        Ok(Self::from_quinn(ep))
    }

    /// Creates a dial-only endpoint on an ephemeral port of the same address
    /// family as `remote`.
    pub fn client_for(remote: SocketAddr) -> Result<Self, Error> {
        let local = match remote.ip() {
            IpAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            IpAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let mut ep = quinn::Endpoint::client(local)?;
        ep.set_default_client_config(tls::client_config());
        Ok(Self::from_quinn(ep))
    }

    fn from_quinn(ep: quinn::Endpoint) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ep,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.ep.local_addr()
    }

    /// Dials `remote` and returns the established link.
    pub async fn connect(&self, remote: SocketAddr) -> Result<Link, Error> {
        Link::new(self.ep.connect(remote, SERVER_NAME)?).await
    }

    /// Asks a running [`Endpoint::serve`] loop to stop.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Accepts links and answers their streams until the endpoint is shut
    /// down, either through [`Endpoint::shutdown`] or by acknowledging a
    /// request for which [`Request::ends_service`] holds. Closes the
    /// endpoint before returning.
    pub async fn serve<S: Service>(&self, service: Arc<S>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!(addr = ?self.ep.local_addr().ok(), "serving");
        while !*shutdown_rx.borrow_and_update() {
            select! {
                incoming = self.ep.accept() => {
                    let Some(in_progress) = incoming else { break };
                    tokio::spawn(Self::handle_link(
                        in_progress,
                        service.clone(),
                        self.shutdown_tx.clone(),
                    ));
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("shutting down");
        self.ep.close(VarInt::from_u32(0), b"shutdown");
        self.ep.wait_idle().await;
    }

    /// Completes an incoming link and spawns a task per stream opened on it.
    async fn handle_link<S: Service>(
        in_progress: Connecting,
        service: Arc<S>,
        shutdown_tx: Arc<watch::Sender<bool>>,
    ) {
        let link = match Link::new(in_progress).await {
            Ok(link) => link,
            Err(e) => {
                debug!("incoming link failed: {e}");
                return;
            }
        };
        let span = debug_span!("link", remote = %link.remote_addr());
        async move {
            loop {
                match link.conn().accept_bi().await {
                    Ok((raw_tx, raw_rx)) => {
                        let stream = Self::handle_stream(
                            raw_tx,
                            raw_rx,
                            service.clone(),
                            shutdown_tx.clone(),
                        );
                        tokio::spawn(stream.in_current_span());
                    }
                    Err(e) => {
                        debug!("link closed: {e}");
                        break;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn handle_stream<S: Service>(
        raw_tx: SendStream,
        raw_rx: RecvStream,
        service: Arc<S>,
        shutdown_tx: Arc<watch::Sender<bool>>,
    ) {
        let mut send_stream = FrameSendStream::new(raw_tx);
        let mut recv_stream = FrameRecvStream::new(raw_rx);
        let request = match recv_stream.receive().await {
            Ok(payload) => Request::decode(&payload).await,
            Err(e) => Err(e),
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping unreadable request: {e}");
                return;
            }
        };

        let op = request.name();
        let ends_service = request.ends_service();
        let response =
            service.handle(request).await.unwrap_or_else(|e| {
                warn!(op, "request failed: {e}");
                Response::Failed(e.to_string())
            });
        // only an acknowledged shutdown stops the endpoint
        let ends_service = ends_service && response == Response::Ack;

        let replied = async {
            send_stream.send(&response.encode().await?).await?;
            send_stream.finish().await
        }
        .await;
        if let Err(e) = replied {
            warn!(op, "could not reply: {e}");
        }

        if ends_service {
            debug!(op, "service ending");
            shutdown_tx.send_replace(true);
        }
    }
}
