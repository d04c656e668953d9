//! Accept loop shared by the PAC and interception servers
//!
//! Each server owns a [`ListenerHandle`]. Closing (or dropping) the handle
//! stops the accept loop and releases the port; connections that are already
//! being served keep running until they finish on their own.

use crate::error::{RelayError, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owned handle to a running accept loop
#[derive(Debug)]
pub struct ListenerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait until the listening socket is closed.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("{} accept loop ended abnormally: {}", self.name, e);
            }
        }
    }
}

/// A bound socket together with the address it was bound to
#[derive(Debug)]
pub struct BoundListener {
    addr: SocketAddr,
    listener: TcpListener,
}

impl BoundListener {
    /// Address requested at bind time, possibly with port 0
    pub fn requested_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Bind a listening socket, mapping failures to `ListenBind`.
pub async fn bind(addr: SocketAddr) -> Result<BoundListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| RelayError::ListenBind { addr, source })?;

    Ok(BoundListener { addr, listener })
}

/// Run `handler` for every accepted connection until the handle is closed.
pub fn spawn<H, Fut>(name: &'static str, bound: BoundListener, handler: H) -> Result<ListenerHandle>
where
    H: Fn(TcpStream, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let BoundListener { addr, listener } = bound;
    let local_addr = listener
        .local_addr()
        .map_err(|source| RelayError::ListenBind { addr, source })?;

    let (tx, mut rx) = oneshot::channel::<()>();
    let handler = Arc::new(handler);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut rx => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        let connection = handler(stream, remote_addr);
                        tokio::spawn(async move {
                            if let Err(e) = connection.await {
                                debug!("{} connection error from {}: {:#}", name, remote_addr, e);
                            }
                        });
                    }
                    Err(e) => warn!("{} accept error: {}", name, e),
                },
            }
        }

        info!("{} listener on {} closed", name, local_addr);
    });

    Ok(ListenerHandle {
        name,
        local_addr,
        shutdown: Some(tx),
        task: Some(task),
    })
}
