//! Canaux d'événements du moteur SSDP

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::notification::Notification;
use crate::search::SearchRequest;

/// Annonce (ou réponse de recherche) reçue d'un autre participant
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub notification: Notification,
    pub from: SocketAddr,
}

/// Requête M-SEARCH reçue
#[derive(Debug, Clone)]
pub struct SearchEvent {
    pub request: SearchRequest,
    pub from: SocketAddr,
}

/// Diffusion d'événements vers un nombre quelconque d'abonnés.
///
/// Les abonnés dont le récepteur a été fermé sont retirés à la diffusion
/// suivante.
#[derive(Clone)]
pub(crate) struct EventBus<T: Clone> {
    subscribers: Arc<Mutex<Vec<UnboundedSender<T>>>>,
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self) -> UnboundedReceiver<T> {
        let (tx, rx) = unbounded_channel::<T>();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn broadcast(&self, event: T) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
