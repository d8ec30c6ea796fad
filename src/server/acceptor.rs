use crate::actor::ActorClient;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Accepts inbound connections (peers and clients alike; they are told
/// apart by what they send) and hands them to the protocol task. Runs until
/// the node handle drops its shutdown sender or the protocol task goes
/// away.
pub(crate) async fn run_acceptor(
    listener: TcpListener,
    actor_client: ActorClient,
    mut shutdown: oneshot::Receiver<()>,
    logger: slog::Logger,
) {
    loop {
        tokio::select! {
            // Resolves (with a recv error) once the sender side drops.
            _ = &mut shutdown => {
                slog::info!(logger, "Listener shutting down");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    if !actor_client.inbound_connection(Box::new(stream), remote_addr).await {
                        return;
                    }
                }
                Err(e) => {
                    // Transient accept failures (fd pressure and the like)
                    // are not fatal to the node.
                    slog::warn!(logger, "Failed to accept connection: {}", e);
                }
            }
        }
    }
}
