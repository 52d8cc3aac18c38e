use std::error::Error;

use tokio_util::sync::CancellationToken;

use crate::relay::{RelayConfig, RelayServer};

/// Run the rendezvous relay until interrupted.
///
/// The relay pairs authenticated senders and receivers on shared slot keys
/// and forwards frames between them without inspecting payloads. All state is
/// in memory; a restart simply starts with an empty mailbox.
pub async fn run(port: u16, password: String, app_id: String) -> Result<(), Box<dyn Error>> {
    let config = RelayConfig {
        address: format!("0.0.0.0:{}", port),
        password,
        app_id,
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("interrupt received, shutting down");
            interrupt.cancel();
        }
    });

    println!("Relay listening on {}", config.address);
    RelayServer::new(config).start(cancel).await?;
    Ok(())
}
