use tracing::warn;
use xapi_client::CancelToken;

/// Wire SIGINT/SIGTERM to a cancellation token. In-flight transfers
/// observe the token between chunks, cancel their hypervisor task and
/// clean up before the pool loop exits.
pub fn install() -> CancelToken {
    let token = CancelToken::new();
    let flag = token.clone();

    tokio::spawn(async move {
        let terminate = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut signal) => {
                        signal.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            std::future::pending::<()>().await;
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = terminate => {},
        }

        warn!("Termination requested, aborting in-flight operations...");
        flag.cancel();
    });

    token
}
