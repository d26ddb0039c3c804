//! TCP server for line search queries.
//!
//! Binds the configured address, optionally wraps accepted connections in
//! TLS, and serves each connection on its own task. The accept loop never
//! waits on a client: handshakes, reads and dataset lookups all happen on
//! the spawned task.

use crate::config::Config;
use crate::dataset::DatasetStore;
use crate::error::{ConnectionError, ServerError};
use crate::handler::{handle_connection, Limits, Outcome};
use crate::tls;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Ceiling on completing a TLS handshake
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pending connection backlog for the listening socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Arc<Config>,
    dataset: Arc<DatasetStore>,
    tls: Option<TlsAcceptor>,
    limits: Limits,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance.
    ///
    /// Loads the dataset and TLS material up front; any failure here is
    /// fatal and nothing has been bound yet.
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let dataset = DatasetStore::open(&config.dataset_path, config.reread_on_query).await?;
        let tls = config.tls.as_ref().map(tls::load_acceptor).transpose()?;

        Ok(Server {
            limits: Limits::new(config.max_payload),
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            dataset: Arc::new(dataset),
            tls,
            config: Arc::new(config),
        })
    }

    /// Bind and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Bind the listening socket with `SO_REUSEADDR`.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let address = self.config.listen_address();
        let addr = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| ServerError::Resolve {
                address: address.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ServerError::Resolve {
                address: address.clone(),
                reason: "no addresses found".to_string(),
            })?;

        let listener =
            create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            address = %local_addr,
            tls = self.tls.is_some(),
            mode = ?self.dataset.mode(),
            max_payload = self.limits.max_payload,
            "Server listening"
        );
        Ok(listener)
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Accept errors are logged and the loop continues. In-flight
    /// connections are left to finish on their own tasks.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(|e| ServerError::Shutdown(e.to_string()))?
                }
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let dataset = Arc::clone(&self.dataset);
                    let tls = self.tls.clone();
                    let limits = self.limits;

                    tokio::spawn(async move {
                        if let Err(e) = dispatch(stream, peer, tls, &dataset, &limits).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Shutting down listener");
        Ok(())
    }
}

/// Run one accepted connection, performing the TLS handshake first if
/// enabled.
async fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    dataset: &DatasetStore,
    limits: &Limits,
) -> Result<Outcome, ConnectionError> {
    stream.set_nodelay(true)?;

    match tls {
        Some(acceptor) => {
            let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| ConnectionError::HandshakeTimeout(HANDSHAKE_TIMEOUT))?
                .map_err(ConnectionError::Handshake)?;
            handle_connection(stream, peer, dataset, limits).await
        }
        None => handle_connection(stream, peer, dataset, limits).await,
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
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
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
