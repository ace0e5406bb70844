//! Public listener and connection relay.
//!
//! Every accepted client connection waits for an idle worker, leases it and
//! is relayed byte-for-byte to the worker's loopback listener. Workers close
//! the connection after one response, so a lease lasts exactly one request.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::Pool;

/// Attempts to reach a leased worker before the client is dropped.
const MAX_CONNECT_ATTEMPTS: usize = 3;

/// Pause after a failed `accept` (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accept client connections until `cancel` fires, then drop the listener.
///
/// `cancel` also abandons connections still waiting for a worker.
pub(crate) async fn accept_loop(listener: TcpListener, pool: Arc<Pool>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&pool),
                        cancel.clone(),
                    ));
                }
                Err(err) => {
                    warn!(%err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    drop(listener);
    info!("stopped accepting connections");
}

/// Hand one client connection to an idle worker.
async fn serve_connection(
    client: TcpStream,
    peer: SocketAddr,
    pool: Arc<Pool>,
    cancel: CancellationToken,
) {
    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        let Some(lease) = pool.acquire(&cancel).await else {
            debug!(%peer, "shutting down; dropping queued connection");
            return;
        };

        match TcpStream::connect(lease.addr).await {
            Ok(upstream) => {
                let outcome = relay(client, upstream).await;
                debug!(%peer, slot = lease.slot, ?outcome, "connection finished");
                return;
            }
            Err(err) => {
                // The worker is going away; its exit reaches the monitor.
                warn!(%peer, slot = lease.slot, attempt, %err, "worker unreachable");
            }
        }
    }
    warn!(%peer, "no reachable worker; dropping connection");
}

/// How a relayed connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayOutcome {
    /// The worker's response was forwarded in full.
    Completed(u64),
    /// The worker died or the relay failed; the client was reset.
    Aborted,
}

/// Pipe bytes between `client` and `upstream` until the worker closes its
/// side.
///
/// The client's own half-close is not forwarded, since a worker treats EOF
/// as an abandoned request. If the worker goes away without sending anything
/// the client connection is reset rather than closed.
pub(crate) async fn relay(client: TcpStream, upstream: TcpStream) -> RelayOutcome {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let copied = {
        let backward = tokio::io::copy(&mut upstream_read, &mut client_write);
        tokio::pin!(backward);
        let early = {
            let forward = tokio::io::copy(&mut client_read, &mut upstream_write);
            tokio::select! {
                res = &mut backward => Some(res),
                res = forward => res.err().map(Err),
            }
        };
        match early {
            Some(res) => res,
            None => backward.await,
        }
    };

    match copied {
        Ok(bytes) if bytes > 0 => {
            let _ = client_write.shutdown().await;
            RelayOutcome::Completed(bytes)
        }
        Ok(_) => {
            reset(client_read, client_write);
            RelayOutcome::Aborted
        }
        Err(err) => {
            debug!(%err, "relay failed");
            reset(client_read, client_write);
            RelayOutcome::Aborted
        }
    }
}

/// Close the client connection with an RST.
#[allow(deprecated)]
fn reset(read: tokio::net::tcp::OwnedReadHalf, write: tokio::net::tcp::OwnedWriteHalf) {
    if let Ok(stream) = read.reunite(write) {
        if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
            debug!(%err, "cannot set zero linger");
        }
    }
}
