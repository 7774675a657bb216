use std::net::SocketAddr;

use thiserror::Error;

/// Erreurs remontées à l'appelant par le moteur SSDP.
///
/// Seules les conditions fatales au moment de l'appel apparaissent ici ;
/// les échecs transitoires (join multicast, ré-émissions périodiques,
/// byebye à l'arrêt) sont journalisés et absorbés.
#[derive(Error, Debug)]
pub enum SsdpError {
    #[error("SSDP protocol already started")]
    AlreadyStarted,

    #[error("Cannot bind SSDP socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid multicast address: {0}")]
    InvalidMulticastAddress(String),

    #[error("Invalid network interface: {0}")]
    InvalidInterface(String),

    #[error("Invalid multicast port: {0}")]
    InvalidPort(u16),

    #[error("Failed to send SSDP message to {target}: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Notification {0} cannot be persisted (not ssdp:alive)")]
    NotPersistable(String),
}

impl SsdpError {
    pub fn send(target: SocketAddr, source: std::io::Error) -> Self {
        SsdpError::Send { target, source }
    }
}
