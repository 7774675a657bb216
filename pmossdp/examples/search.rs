//! Envoie un M-SEARCH et affiche les annonces reçues jusqu'à Ctrl+C.
//!
//! ```text
//! cargo run -p pmossdp --example search -- [search_target]
//! ```

use std::env;

use anyhow::Result;
use pmossdp::{NotificationType, SEARCH_ALL, SsdpConfig, SsdpProtocol};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let target = env::args().nth(1).unwrap_or_else(|| SEARCH_ALL.to_string());
    let ssdp = SsdpProtocol::new(&SsdpConfig::load(None)?)?;
    let mut notifications = ssdp.subscribe_notifications();

    // Mis en file jusqu'à l'adhésion au groupe multicast
    ssdp.search(target.as_str()).await?;
    ssdp.start().await?;

    println!("Listening for SSDP events. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            Some(event) = notifications.recv() => {
                let n = &event.notification;
                let tag = match n.kind() {
                    Some(NotificationType::Dead) => "BYEBYE",
                    _ => "ALIVE",
                };
                println!(
                    "[{}] from={} usn={} nt={} location={}",
                    tag,
                    event.from,
                    n.usn().unwrap_or_default(),
                    n.subject().unwrap_or_default(),
                    n.headers().get("LOCATION").unwrap_or_default()
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ssdp.stop().await;
    Ok(())
}
