//! # Moteur SSDP
//!
//! [`SsdpProtocol`] relie le codec, le registre des annonces persistantes et
//! le transport multicast :
//!
//! - `notify()` émet une annonce et, si demandé, la ré-émet périodiquement
//! - `search()` émet un M-SEARCH (mis en file tant que le groupe n'est pas rejoint)
//! - les annonces et réponses reçues des autres participants sont diffusées
//!   aux abonnés de [`SsdpProtocol::subscribe_notifications`]
//! - les M-SEARCH reçus reçoivent une réponse unicast pour chaque annonce
//!   persistante correspondante, puis sont diffusés aux abonnés de
//!   [`SsdpProtocol::subscribe_searches`]
//!
//! À l'arrêt, un `ssdp:byebye` est émis pour chaque annonce persistante.
//!
//! ## Exemple
//!
//! ```no_run
//! use pmossdp::{Notification, SsdpConfig, SsdpProtocol};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let ssdp = SsdpProtocol::new(&SsdpConfig::default())?;
//! let mut notifications = ssdp.subscribe_notifications();
//!
//! let announce = Notification::alive(
//!     "urn:schemas-upnp-org:device:MediaServer:1",
//!     "uuid:1234::urn:schemas-upnp-org:device:MediaServer:1",
//! );
//! ssdp.notify(&announce, true).await?;
//! ssdp.start().await?;
//! ssdp.search("ssdp:all").await?;
//!
//! while let Some(event) = notifications.recv().await {
//!     println!("{} from {}", event.notification.key(), event.from);
//! }
//! ssdp.stop().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::{self, Message};
use crate::config::SsdpConfig;
use crate::errors::SsdpError;
use crate::events::{EventBus, NotificationEvent, SearchEvent};
use crate::headers::HeaderMap;
use crate::notification::{DEFAULT_INTERVAL, Notification, NotificationType};
use crate::registry::NotificationRegistry;
use crate::search::SearchRequest;
use crate::transport::{Datagram, MulticastTransport};

/// Intervalle minimal d'une annonce persistante
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Résultat d'un envoi `notify()` / `search()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Message émis immédiatement
    Sent,
    /// M-SEARCH mis en file jusqu'à l'adhésion au groupe
    Queued,
    /// Transport arrêté : rien n'est émis, l'annonce persistante le sera au
    /// prochain `start()`
    Deferred,
}

struct ProtocolInner {
    signature: String,
    host: String,
    transport: Arc<MulticastTransport>,
    registry: NotificationRegistry,
    notifications: EventBus<NotificationEvent>,
    searches: EventBus<SearchEvent>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Moteur SSDP
pub struct SsdpProtocol {
    inner: Arc<ProtocolInner>,
}

impl SsdpProtocol {
    /// Construit le moteur depuis une configuration validée
    pub fn new(config: &SsdpConfig) -> Result<Self, SsdpError> {
        let transport = MulticastTransport::new(config.transport_config()?);
        Ok(Self::with_transport(Arc::new(transport), config.signature()))
    }

    /// Construit le moteur sur un transport déjà configuré
    pub fn with_transport(transport: Arc<MulticastTransport>, signature: impl Into<String>) -> Self {
        let registry = NotificationRegistry::new(transport.clone());
        Self {
            inner: Arc::new(ProtocolInner {
                signature: signature.into(),
                host: transport.group().to_string(),
                transport,
                registry,
                notifications: EventBus::new(),
                searches: EventBus::new(),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Signature placée dans `SERVER` / `USER-AGENT`
    pub fn signature(&self) -> &str {
        &self.inner.signature
    }

    pub fn transport(&self) -> &Arc<MulticastTransport> {
        &self.inner.transport
    }

    pub fn started(&self) -> bool {
        self.inner.transport.is_started()
    }

    /// Annonces persistantes enregistrées (telles qu'émises)
    pub fn persistent_notifications(&self) -> Vec<Notification> {
        self.inner
            .registry
            .entries()
            .into_iter()
            .map(|entry| entry.notification)
            .collect()
    }

    /// Annonces et réponses de recherche reçues des autres participants
    pub fn subscribe_notifications(&self) -> UnboundedReceiver<NotificationEvent> {
        self.inner.notifications.subscribe()
    }

    /// Requêtes M-SEARCH reçues
    pub fn subscribe_searches(&self) -> UnboundedReceiver<SearchEvent> {
        self.inner.searches.subscribe()
    }

    /// Émet une annonce.
    ///
    /// Un `ssdp:byebye` retire d'abord l'annonce persistante de même clé.
    /// Avec `persist`, une annonce `ssdp:alive` est enregistrée et ré-émise à
    /// 90 % de sa durée de validité tant que le moteur tourne.
    pub async fn notify(
        &self,
        notification: &Notification,
        persist: bool,
    ) -> Result<SendOutcome, SsdpError> {
        let inner = &self.inner;
        let key = notification.key();

        if notification.kind() == Some(NotificationType::Dead)
            && inner.registry.unregister(&key).is_some()
        {
            debug!("📌 Persistent notification retracted: {}", key);
        }

        let mut outgoing = notification.clone();
        inner.stamp(outgoing.headers_mut(), "SERVER");

        let persist = persist && outgoing.is_alive();
        if persist && outgoing.interval().is_none_or(|i| i < MIN_INTERVAL) {
            outgoing.set_interval(DEFAULT_INTERVAL);
        }

        let message: Arc<[u8]> = outgoing.to_string().into_bytes().into();
        let started = inner.transport.is_started();
        if persist {
            inner
                .registry
                .register(outgoing, Arc::clone(&message), started)?;
        }

        if !started {
            debug!("⏸️ SSDP not started, NOTIFY deferred: {}", key);
            return Ok(SendOutcome::Deferred);
        }

        inner.transport.send(&message, None).await?;
        Ok(SendOutcome::Sent)
    }

    /// Émet un M-SEARCH, ou le met en file tant que le groupe multicast n'est
    /// pas rejoint.
    pub async fn search(
        &self,
        request: impl Into<SearchRequest>,
    ) -> Result<SendOutcome, SsdpError> {
        let inner = &self.inner;
        let mut request = request.into();
        inner.stamp(request.headers_mut(), "USER-AGENT");

        let message: Arc<[u8]> = request.to_string().into_bytes().into();
        if inner.transport.queue_until_joined(Arc::clone(&message)) {
            debug!(
                "⏳ M-SEARCH queued until group join: {}",
                request.subject().unwrap_or_default()
            );
            return Ok(SendOutcome::Queued);
        }

        inner.transport.send(&message, None).await?;
        Ok(SendOutcome::Sent)
    }

    /// Démarre le transport, le traitement des messages reçus, puis arme et
    /// émet chaque annonce persistante.
    pub async fn start(&self) -> Result<(), SsdpError> {
        let inner = &self.inner;
        let (tx, rx) = unbounded_channel();
        inner.transport.start(tx).await?;

        let dispatcher = spawn_dispatcher(Arc::downgrade(inner), rx);
        if let Some(previous) = inner.dispatcher.lock().replace(dispatcher) {
            previous.abort();
        }

        let entries = inner.registry.arm_all();
        for entry in &entries {
            if let Err(e) = inner.transport.send(&entry.message, None).await {
                warn!("❌ Failed to announce {}: {}", entry.key(), e);
            }
        }

        info!(
            "✅ SSDP protocol started on {} ({} persistent notification(s))",
            inner.host,
            entries.len()
        );
        Ok(())
    }

    /// Arrêt gracieux : un `ssdp:byebye` par annonce persistante, puis
    /// fermeture du transport.
    ///
    /// Les annonces restent enregistrées et sont ré-émises au prochain
    /// `start()`. Sans effet si le moteur n'est pas démarré.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.transport.is_started() {
            inner.transport.stop();
            return;
        }

        let entries = inner.registry.disarm_all();
        let byebyes = entries.iter().map(|entry| {
            let bye = entry.notification.dead();
            let transport = Arc::clone(&inner.transport);
            async move {
                let message = bye.to_string();
                if let Err(e) = transport.send(message.as_bytes(), None).await {
                    warn!("❌ Failed to send byebye for {}: {}", bye.key(), e);
                }
            }
        });
        join_all(byebyes).await;
        debug!("👋 {} byebye(s) sent", entries.len());

        if let Some(dispatcher) = inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
        inner.transport.stop();
        info!("🛑 SSDP protocol stopped");
    }
}

impl ProtocolInner {
    /// Renseigne `HOST` et la signature s'ils sont absents
    fn stamp(&self, headers: &mut HeaderMap, signature_header: &str) {
        headers.set_default("HOST", self.host.as_str());
        headers.set_default(signature_header, self.signature.as_str());
    }

    async fn process_message(&self, payload: &[u8], from: SocketAddr) {
        let Some(message) = codec::parse_bytes(payload) else {
            trace!("Ignoring non-SSDP datagram from {}", from);
            return;
        };

        match message {
            Message::SearchRequest(request) => self.answer_search(request, from).await,
            message => {
                let Some(notification) = message.into_notification() else {
                    return;
                };
                let key = notification.key();
                if self.registry.contains(&key) {
                    trace!("Ignoring own announcement echo {} from {}", key, from);
                    return;
                }
                debug!("📥 SSDP notification from {}: {}", from, key);
                self.notifications
                    .broadcast(NotificationEvent { notification, from });
            }
        }
    }

    async fn answer_search(&self, request: SearchRequest, from: SocketAddr) {
        debug!(
            "🔍 M-SEARCH from {} for {}",
            from,
            request.subject().unwrap_or_default()
        );

        for entry in self.registry.entries() {
            if !request.matches(entry.notification.subject()) {
                continue;
            }
            let response = entry.notification.to_search_response();
            let message = response.to_string();
            if let Err(e) = self.transport.send(message.as_bytes(), Some(from)).await {
                warn!("❌ Failed to answer M-SEARCH from {}: {}", from, e);
            }
        }

        self.searches.broadcast(SearchEvent { request, from });
    }
}

impl Drop for ProtocolInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

/// Traite les datagrammes reçus un par un, dans leur ordre d'arrivée
fn spawn_dispatcher(
    weak: Weak<ProtocolInner>,
    mut inbound: UnboundedReceiver<Datagram>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(datagram) = inbound.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.process_message(&datagram.payload, datagram.from).await;
        }
    })
}
