//! Client side of the reply protocol.
//!
//! Command handlers on the far side of the transport use [`ReplySender`] to
//! report results back to the node that issued the command.

use crate::codec::{CodecError, ReplyCodec};
use crate::config::DEFAULT_MAX_RECORD_LEN;
use command_reply_core::command::CommandResult;
use command_reply_core::reply::{EventHandledMessage, RemoteReply, ReplyEnvelope};
use futures::SinkExt;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::FramedWrite;

/// A connection to a reply listener.
#[derive(Debug)]
pub struct ReplySender {
    sink: FramedWrite<TcpStream, ReplyCodec>,
    peer_addr: SocketAddr,
}

impl ReplySender {
    /// Connect to the listener at `addr`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the connection cannot be established.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        Self::connect_with_max_len(addr, DEFAULT_MAX_RECORD_LEN).await
    }

    /// Connect with a custom record length limit.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the connection cannot be established.
    pub async fn connect_with_max_len(addr: SocketAddr, max_len: usize) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %addr, "Connected to reply listener");
        Ok(Self {
            sink: FramedWrite::new(stream, ReplyCodec::new(max_len)),
            peer_addr: addr,
        })
    }

    /// Address of the listener this sender writes to.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Report that a command finished executing.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the record cannot be encoded or written.
    pub async fn send_executed(&mut self, result: CommandResult) -> Result<(), CodecError> {
        self.send(ReplyEnvelope::Executed(result)).await
    }

    /// Report that the events of a command have been handled.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the record cannot be encoded or written.
    pub async fn send_event_handled(&mut self, message: EventHandledMessage) -> Result<(), CodecError> {
        self.send(ReplyEnvelope::EventHandled(message)).await
    }

    /// Send a classified reply and flush it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the record cannot be encoded or written.
    pub async fn send(&mut self, envelope: ReplyEnvelope) -> Result<(), CodecError> {
        tracing::trace!(
            command_id = %envelope.command_id(),
            kind = %envelope.kind(),
            "Sending reply"
        );
        self.sink.send(envelope).await
    }

    /// Send a record exactly as given, including unknown kinds or missing
    /// payloads.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the record cannot be encoded or written.
    pub async fn send_raw(&mut self, reply: RemoteReply) -> Result<(), CodecError> {
        self.sink.send(reply).await
    }

    /// Flush and close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if the final flush fails.
    pub async fn close(mut self) -> Result<(), CodecError> {
        <FramedWrite<TcpStream, ReplyCodec> as SinkExt<RemoteReply>>::close(&mut self.sink).await
    }
}
