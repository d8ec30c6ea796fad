//! The submitting client. It holds the quorum's endpoints, discovers which
//! node currently leads through the same handshake the servers use among
//! themselves, and turns each submission into an awaitable reply.

use crate::net::{FramedConnection, WireError};
use crate::protocol::{Command, ErrorCode};
use crate::quorum::NodeState;
use bytes::Bytes;
use rand::Rng;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct ClientOptions {
    /// How many times one submission is attempted before its error is
    /// surfaced. Default: 10.
    pub attempt_limit: Option<usize>,
    /// Base pause between attempts; a random jitter of up to half the base
    /// is added so retrying clients do not stampede. Default: 200ms.
    pub retry_delay: Option<Duration>,
    /// How long to wait for the leader's reply to one submission.
    /// Default: 10s.
    pub reply_timeout: Option<Duration>,
    /// How long one leader-discovery probe may take. Default: 3s.
    pub probe_timeout: Option<Duration>,
}

struct ClientOptionsValidated {
    attempt_limit: usize,
    retry_delay: Duration,
    reply_timeout: Duration,
    probe_timeout: Duration,
}

impl ClientOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.attempt_limit == 0 {
            return Err("attempt limit must be at least 1");
        }
        if self.retry_delay.is_zero() || self.reply_timeout.is_zero() || self.probe_timeout.is_zero() {
            return Err("delays and timeouts must be non-zero");
        }

        Ok(())
    }
}

impl TryFrom<ClientOptions> for ClientOptionsValidated {
    type Error = &'static str;

    fn try_from(options: ClientOptions) -> Result<Self, Self::Error> {
        let values = ClientOptionsValidated {
            attempt_limit: options.attempt_limit.unwrap_or(10),
            retry_delay: options.retry_delay.unwrap_or(Duration::from_millis(200)),
            reply_timeout: options.reply_timeout.unwrap_or(Duration::from_secs(10)),
            probe_timeout: options.probe_timeout.unwrap_or(Duration::from_secs(3)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid client options: {0}")]
pub struct InvalidClientOptions(&'static str);

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("no quorum member could be reached")]
    QuorumUnreachable,
    #[error("the contacted node is not the leader")]
    IncorrectProposal,
    #[error("the quorum returned divergent responses; the workload handler is not deterministic")]
    InconsistentResponse,
    #[error("a quorum peer became unreachable mid-round")]
    PeerUnreachable,
    #[error("timed out waiting for the node's reply")]
    ReplyTimeout,
    #[error("connection to the node failed: {0}")]
    Transport(#[source] io::Error),
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
    #[error("the node violated the wire protocol")]
    ProtocolViolation,
    #[error("the client has shut down")]
    ClientClosed,
}

impl From<WireError> for SubmitError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Io(io) => SubmitError::Transport(io),
            WireError::Malformed(_) => SubmitError::ProtocolViolation,
            WireError::Closed => SubmitError::ConnectionClosed,
        }
    }
}

impl From<ErrorCode> for SubmitError {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::IncorrectProposal => SubmitError::IncorrectProposal,
            ErrorCode::InconsistentResponse => SubmitError::InconsistentResponse,
            ErrorCode::PeerUnreachable => SubmitError::PeerUnreachable,
        }
    }
}

struct Submission {
    workload: Bytes,
    reply: oneshot::Sender<Result<Bytes, SubmitError>>,
}

/// One queued submission's eventual reply.
pub struct PendingReply {
    receiver: oneshot::Receiver<Result<Bytes, SubmitError>>,
}

impl Future for PendingReply {
    type Output = Result<Bytes, SubmitError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.receiver).poll(cx)) {
            Ok(result) => Poll::Ready(result),
            Err(_) => Poll::Ready(Err(SubmitError::ClientClosed)),
        }
    }
}

/// Client submits workloads to the quorum. Submissions are processed
/// strictly in order by a single worker task, so several may be queued
/// up-front and awaited later.
pub struct Client {
    sender: mpsc::UnboundedSender<Submission>,
    known_leader: watch::Receiver<Option<SocketAddr>>,
}

impl Client {
    pub fn new(
        endpoints: Vec<SocketAddr>,
        logger: slog::Logger,
        options: ClientOptions,
    ) -> Result<Self, InvalidClientOptions> {
        let options = ClientOptionsValidated::try_from(options).map_err(InvalidClientOptions)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (leader_tx, known_leader) = watch::channel(None);

        let worker = ClientWorker {
            endpoints,
            options,
            logger,
            leader_tx,
            conn: None,
        };
        tokio::task::spawn(worker.run(receiver));

        Ok(Client { sender, known_leader })
    }

    /// Queues one workload. The reply arrives through the returned future;
    /// dropping the future abandons the reply but not the submission.
    pub fn submit(&self, workload: Bytes) -> PendingReply {
        let (reply, receiver) = oneshot::channel();
        // A failed send drops `reply`, which resolves the future with
        // ClientClosed.
        let _ = self.sender.send(Submission { workload, reply });

        PendingReply { receiver }
    }

    /// Submits one workload and waits for its reply.
    pub async fn send(&self, workload: Bytes) -> Result<Bytes, SubmitError> {
        self.submit(workload).await
    }

    /// The node the worker most recently confirmed as leader, if any.
    pub fn known_leader(&self) -> Option<SocketAddr> {
        *self.known_leader.borrow()
    }
}

struct ClientWorker {
    endpoints: Vec<SocketAddr>,
    options: ClientOptionsValidated,
    logger: slog::Logger,
    leader_tx: watch::Sender<Option<SocketAddr>>,
    conn: Option<FramedConnection<TcpStream>>,
}

impl ClientWorker {
    async fn run(mut self, mut submissions: mpsc::UnboundedReceiver<Submission>) {
        while let Some(submission) = submissions.recv().await {
            let result = self.submit_with_retries(submission.workload).await;
            let _ = submission.reply.send(result);
        }
    }

    async fn submit_with_retries(&mut self, workload: Bytes) -> Result<Bytes, SubmitError> {
        let mut last_error = SubmitError::QuorumUnreachable;

        for attempt in 0..self.options.attempt_limit {
            if attempt > 0 {
                tokio::time::sleep(self.jittered_retry_delay()).await;
            }

            match self.try_submit(&workload).await {
                Ok(response) => return Ok(response),
                // Retrying cannot fix a non-deterministic handler.
                Err(e @ SubmitError::InconsistentResponse) => return Err(e),
                Err(e) => {
                    slog::debug!(self.logger, "Submission attempt {} failed: {}", attempt + 1, e);
                    self.forget_leader();
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    fn jittered_retry_delay(&self) -> Duration {
        let base = self.options.retry_delay;
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2));
        base + Duration::from_millis(jitter_ms)
    }

    fn forget_leader(&mut self) {
        self.conn = None;
        let _ = self.leader_tx.send(None);
    }

    async fn try_submit(&mut self, workload: &Bytes) -> Result<Bytes, SubmitError> {
        if self.conn.is_none() {
            self.discover().await?;
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(SubmitError::QuorumUnreachable);
        };

        conn.send(&Command::Request {
            workload: workload.clone(),
        })
        .await?;

        let reply = tokio::time::timeout(self.options.reply_timeout, conn.recv())
            .await
            .map_err(|_| SubmitError::ReplyTimeout)??;

        match reply {
            Command::Accepted { workload, .. } => Ok(workload),
            Command::Error { code } => Err(SubmitError::from(code)),
            other => {
                slog::warn!(self.logger, "Unexpected '{}' reply to a submission", other.kind());
                Err(SubmitError::ProtocolViolation)
            }
        }
    }

    /// Walks the quorum looking for the node that claims leadership. If no
    /// one does, settles for any reachable node: its refusal tells the
    /// caller more than giving up here would.
    async fn discover(&mut self) -> Result<(), SubmitError> {
        let mut fallback = None;

        for endpoint in self.endpoints.clone() {
            match self.probe(endpoint).await {
                Ok((conn, NodeState::Leader)) => {
                    slog::debug!(self.logger, "Leader discovered at {}", endpoint);
                    self.conn = Some(conn);
                    let _ = self.leader_tx.send(Some(endpoint));
                    return Ok(());
                }
                Ok((conn, _)) => {
                    if fallback.is_none() {
                        fallback = Some((endpoint, conn));
                    }
                }
                Err(e) => {
                    slog::debug!(self.logger, "Probe of {} failed: {}", endpoint, e);
                }
            }
        }

        match fallback {
            Some((endpoint, conn)) => {
                slog::debug!(self.logger, "No node claims leadership; trying {}", endpoint);
                self.conn = Some(conn);
                Ok(())
            }
            None => Err(SubmitError::QuorumUnreachable),
        }
    }

    async fn probe(&self, endpoint: SocketAddr) -> Result<(FramedConnection<TcpStream>, NodeState), SubmitError> {
        let exchange = async {
            let mut conn = FramedConnection::connect(endpoint)
                .await
                .map_err(SubmitError::Transport)?;
            conn.send(&Command::HandshakeStart).await?;

            match conn.recv().await? {
                Command::HandshakeResponse { host_state, .. } => Ok((conn, host_state)),
                _ => Err(SubmitError::ProtocolViolation),
            }
        };

        tokio::time::timeout(self.options.probe_timeout, exchange)
            .await
            .map_err(|_| SubmitError::ReplyTimeout)?
    }
}
