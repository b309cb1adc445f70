use log;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/*
 * Returns the process-wide context. It is cancelled on the first SIGINT or
 * SIGTERM; API calls and loops select on it to stop early.
 */
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
	let mut sigterm = match signal(SignalKind::terminate()) {
	    Ok(sigterm) => sigterm,
	    Err(err) => {
		log::error!("Unable to install SIGTERM handler: {}", err);
		return;
	    }
	};

	tokio::select! {
	    _ = tokio::signal::ctrl_c() => log::info!("Received SIGINT, shutting down"),
	    _ = sigterm.recv() => log::info!("Received SIGTERM, shutting down"),
	}
	trigger.cancel();
    });

    token
}
