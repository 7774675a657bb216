//! Annonce un device fictif sur le réseau jusqu'à Ctrl+C.
//!
//! ```text
//! cargo run -p pmossdp --example advertise -- [config.yaml]
//! ```

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use pmossdp::{Notification, SsdpConfig, SsdpProtocol};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEVICE_TYPE: &str = "urn:schemas-upnp-org:device:MediaServer:1";

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();

    let config_path = env::args().nth(1).map(PathBuf::from);
    let config = SsdpConfig::load(config_path.as_deref())?;
    let ssdp = SsdpProtocol::new(&config).context("Invalid SSDP configuration")?;

    let udn = format!("uuid:{}", uuid::Uuid::new_v4());
    let location = "http://127.0.0.1:8080/description.xml";
    for (nt, usn) in [
        ("upnp:rootdevice".to_string(), format!("{udn}::upnp:rootdevice")),
        (udn.clone(), udn.clone()),
        (DEVICE_TYPE.to_string(), format!("{udn}::{DEVICE_TYPE}")),
    ] {
        let mut announce = Notification::alive(nt, usn);
        announce.set_interval(Duration::from_secs(60));
        announce.headers_mut().set("LOCATION", location);
        ssdp.notify(&announce, true).await?;
    }

    ssdp.start().await?;
    info!("📡 Advertising {} (Ctrl+C to stop)", udn);

    let mut searches = ssdp.subscribe_searches();
    loop {
        tokio::select! {
            Some(event) = searches.recv() => {
                println!(
                    "[M-SEARCH] from={} st={}",
                    event.from,
                    event.request.subject().unwrap_or_default()
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    ssdp.stop().await;
    Ok(())
}
