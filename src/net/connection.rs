use crate::actor::ActorClient;
use crate::net::{BoxedStream, RawStream};
use crate::protocol::{Command, CommandDecodeError};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};

/// ConnectionId names one registered connection for the lifetime of the
/// process. Ids are handed out by the protocol engine and never reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error("transport failure: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Malformed(#[from] CommandDecodeError),
    #[error("connection closed by peer")]
    Closed,
}

/// ConnectionHandle is the write side of a registered connection. Commands
/// queue onto the connection's dedicated writer task, so concurrent writers
/// are serialized per connection. Cloning shares the same queue.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `command` for writing. Returns false if the connection's writer
    /// has already shut down; the matching close event reaches the engine
    /// through the reader side.
    pub(crate) fn write_command(&self, command: Command) -> bool {
        self.outbound.send(command).is_ok()
    }
}

/// Splits `stream` into a reader task (frames flow to the actor as events)
/// and a writer task (frames drain from the returned handle's queue).
pub(crate) fn spawn_connection(
    id: ConnectionId,
    stream: BoxedStream,
    actor_client: ActorClient,
    logger: slog::Logger,
) -> ConnectionHandle {
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();

    tokio::task::spawn(write_loop(id, write_half, outbound_rx, logger.clone()));
    tokio::task::spawn(read_loop(id, read_half, actor_client, logger));

    ConnectionHandle { id, outbound }
}

async fn read_loop(
    id: ConnectionId,
    read_half: tokio::io::ReadHalf<BoxedStream>,
    actor_client: ActorClient,
    logger: slog::Logger,
) {
    let mut frames = FramedRead::new(read_half, LengthDelimitedCodec::new());
    loop {
        let closed_with = match frames.next().await {
            Some(Ok(frame)) => match Command::decode(&frame) {
                Ok(command) => {
                    slog::trace!(logger, "{} received '{}'", id, command.kind());
                    if actor_client.command_received(id, command).await {
                        continue;
                    }
                    // Engine is gone; nothing left to report to.
                    return;
                }
                Err(e) => Some(WireError::from(e)),
            },
            Some(Err(e)) => Some(WireError::from(e)),
            None => None,
        };

        let _ = actor_client.connection_closed(id, closed_with).await;
        return;
    }
}

async fn write_loop(
    id: ConnectionId,
    write_half: tokio::io::WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    logger: slog::Logger,
) {
    let mut frames = FramedWrite::new(write_half, LengthDelimitedCodec::new());
    while let Some(command) = outbound.recv().await {
        if let Err(e) = frames.send(command.encode()).await {
            // The reader half observes the same failure and notifies the
            // engine; this task only has to stop.
            slog::debug!(logger, "{} write failed: {}", id, e);
            return;
        }
    }
}

/// FramedConnection is the sequential request/response view of a stream:
/// used by the handshake dialer and by the client library, where one task
/// owns the connection outright.
pub(crate) struct FramedConnection<S> {
    inner: Framed<S, LengthDelimitedCodec>,
}

impl FramedConnection<TcpStream> {
    pub(crate) async fn connect(endpoint: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(endpoint).await?;
        Ok(FramedConnection::new(stream))
    }
}

impl<S: RawStream> FramedConnection<S> {
    pub(crate) fn new(stream: S) -> Self {
        FramedConnection {
            inner: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    pub(crate) async fn send(&mut self, command: &Command) -> Result<(), WireError> {
        self.inner.send(command.encode()).await?;
        Ok(())
    }

    pub(crate) async fn recv(&mut self) -> Result<Command, WireError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Command::decode(&frame)?),
            Some(Err(e)) => Err(WireError::from(e)),
            None => Err(WireError::Closed),
        }
    }

    pub(crate) fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProposalId;

    #[tokio::test]
    async fn framed_connections_exchange_commands() {
        let (near, far) = tokio::io::duplex(1024);
        let mut near = FramedConnection::new(near);
        let mut far = FramedConnection::new(far);

        let sent = Command::Prepare {
            proposal_id: ProposalId::new(7),
        };
        near.send(&sent).await.unwrap();
        assert_eq!(far.recv().await.unwrap(), sent);
    }

    #[tokio::test]
    async fn dropping_one_end_surfaces_closed() {
        let (near, far) = tokio::io::duplex(1024);
        let mut near = FramedConnection::new(near);
        drop(far);

        match near.recv().await {
            Err(WireError::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }
}
