//! TCP reply listener.
//!
//! Accepts connections on the configured address, frames each byte stream
//! into reply records with [`ReplyCodec`], and hands every record to the
//! [`ReplyRouter`]. The listener does no correlation itself, so slow network
//! peers never hold up result resolution and vice versa.
//!
//! A malformed record or a connection error closes that connection only.

use crate::codec::{CodecError, ReplyCodec};
use crate::worker::ReplyRouter;
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A bound reply listener that has not started accepting yet.
#[derive(Debug)]
pub struct ReplyListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_record_len: usize,
}

impl ReplyListener {
    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr, max_record_len: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(bind_addr = %local_addr, "Reply listener bound");
        Ok(Self {
            listener,
            local_addr,
            max_record_len,
        })
    }

    /// The address actually bound (resolves port `0`).
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start accepting connections on a background task.
    ///
    /// The task stops accepting as soon as `token` is cancelled, closes every
    /// open connection, and releases the socket before completing.
    #[must_use]
    pub fn spawn(self, router: ReplyRouter, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(router, token))
    }

    async fn accept_loop(self, router: ReplyRouter, token: CancellationToken) {
        let connections = TaskTracker::new();

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        tracing::trace!(peer = %peer_addr, "Accepted reply connection");
                        connections.spawn(handle_connection(
                            stream,
                            peer_addr,
                            self.max_record_len,
                            router.clone(),
                            token.child_token(),
                        ));
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to accept reply connection");
                    }
                },
            }
        }

        drop(self.listener);
        connections.close();
        connections.wait().await;
        tracing::info!(bind_addr = %self.local_addr, "Reply listener closed");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_record_len: usize,
    router: ReplyRouter,
    token: CancellationToken,
) {
    let mut records = FramedRead::new(stream, ReplyCodec::new(max_record_len));
    let mut routed = 0_u64;

    loop {
        let next = tokio::select! {
            () = token.cancelled() => break,
            next = records.next() => next,
        };

        match next {
            Some(Ok(reply)) => {
                if router.route(reply) {
                    routed += 1;
                }
            }
            Some(Err(CodecError::Protocol(e))) => {
                tracing::warn!(peer = %peer_addr, error = %e, "Malformed reply record, closing connection");
                metrics::counter!(crate::metrics::REPLIES_REJECTED, "reason" => "malformed").increment(1);
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(peer = %peer_addr, error = %e, "Reply connection failed, closing connection");
                break;
            }
            None => break,
        }
    }

    tracing::debug!(peer = %peer_addr, routed, "Reply connection closed");
}
