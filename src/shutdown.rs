use tokio::sync::broadcast;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

pub type ShutdownSender = broadcast::Sender<()>;
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// Single signal fan-out.
const SHUTDOWN_CHANNEL_CAPACITY: usize = 1;

#[must_use]
pub fn shutdown_channel() -> ShutdownSender {
    let (tx, _) = broadcast::channel::<()>(SHUTDOWN_CHANNEL_CAPACITY);
    tx
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => Some(term),
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                None
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            () = async {
                match term.as_mut() {
                    Some(term) => { term.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
