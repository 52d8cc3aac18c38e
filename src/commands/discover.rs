use std::error::Error;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::discovery::ServiceDiscoverer;

/// Look for cooperating peers on the local network, or announce this one.
pub async fn run(announce: bool, payload: String, seconds: u64) -> Result<(), Box<dyn Error>> {
    let discoverer = ServiceDiscoverer {
        time_limit: Duration::from_secs(seconds),
        broadcast_delay: Duration::from_millis(500),
        ..Default::default()
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    if announce {
        println!("Announcing on the local network for {}s...", seconds);
        discoverer.broadcast_service(&cancel, payload.as_bytes()).await?;
        return Ok(());
    }

    println!("Searching the local network for {}s...", seconds);
    let services = discoverer.find_services(&cancel, payload.as_bytes()).await?;
    if services.is_empty() {
        println!("No services found.");
        return Ok(());
    }

    for service in services {
        println!(
            "{}  {}",
            service.address,
            String::from_utf8_lossy(&service.payload_response)
        );
    }
    Ok(())
}
