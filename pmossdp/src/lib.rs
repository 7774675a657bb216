//! # pmossdp - Simple Service Discovery Protocol
//!
//! Moteur SSDP complet : annonces `NOTIFY`, recherches `M-SEARCH` et réponses
//! de recherche, échangées en UDP multicast sur le groupe SSDP.
//!
//! ## Fonctionnalités
//!
//! - ✅ Codec des trois formes de messages (repli des en-têtes, casse ignorée)
//! - ✅ Annonces persistantes ré-émises à 90 % de leur durée de validité
//! - ✅ Réponse unicast aux M-SEARCH pour les annonces correspondantes
//! - ✅ Filtrage de l'écho de nos propres annonces
//! - ✅ Adhésion au groupe multicast réessayée jusqu'au succès
//! - ✅ Arrêt propre avec `ssdp:byebye`
//!
//! ## Architecture
//!
//! - [`SsdpProtocol`] : moteur, surface publique (`notify`, `search`, `start`, `stop`)
//! - [`NotificationRegistry`] : annonces persistantes et leurs timers
//! - [`MulticastTransport`] : sockets UDP et appartenance au groupe
//! - [`codec`] : analyse et sérialisation des messages
//! - [`SsdpConfig`] : configuration YAML + variables d'environnement
//!
//! ## Constantes SSDP
//!
//! - **Multicast Address**: 239.255.255.250:1900
//! - **Intervalle par défaut**: 30 secondes

pub mod codec;
pub mod config;
pub mod errors;
pub mod events;
pub mod headers;
pub mod notification;
pub mod protocol;
pub mod registry;
pub mod search;
pub mod signature;
pub mod transport;

pub use codec::{Message, SsdpMessage};
pub use config::SsdpConfig;
pub use errors::SsdpError;
pub use events::{NotificationEvent, SearchEvent};
pub use headers::HeaderMap;
pub use notification::{DEFAULT_INTERVAL, Notification, NotificationType};
pub use protocol::{SendOutcome, SsdpProtocol};
pub use registry::{AnnouncementSink, NotificationRegistry, PersistentNotification};
pub use search::{SEARCH_ALL, SearchRequest, SearchResponse};
pub use signature::{ProductInfo, server_signature};
pub use transport::{GroupJoiner, MulticastTransport, TransportConfig, TransportState};

/// Adresse multicast SSDP
pub const SSDP_MULTICAST_ADDR: &str = "239.255.255.250";

/// Port SSDP
pub const SSDP_PORT: u16 = 1900;
