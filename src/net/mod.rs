mod connection;

pub(crate) use connection::spawn_connection;
pub(crate) use connection::ConnectionHandle;
pub(crate) use connection::ConnectionId;
pub(crate) use connection::FramedConnection;
pub(crate) use connection::WireError;

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can carry framed commands. In production this is always a
/// `TcpStream`; tests substitute in-memory duplex pipes.
pub(crate) trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<S> RawStream for S where S: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) type BoxedStream = Box<dyn RawStream>;
