//! Registre des annonces persistantes
//!
//! Chaque annonce `ssdp:alive` persistante est indexée par sa clé
//! (`NT=...|USN=...`) et conserve son message sérialisé ainsi que, lorsque le
//! transport est démarré, une tâche de ré-émission périodique.
//!
//! La période de ré-émission vaut 90 % de la durée de validité annoncée, de
//! sorte qu'un rafraîchissement parvienne aux écouteurs avant l'expiration
//! de leur copie.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::errors::SsdpError;
use crate::notification::{DEFAULT_INTERVAL, Notification};

/// Destination des ré-émissions périodiques (le groupe multicast)
#[async_trait]
pub trait AnnouncementSink: Send + Sync + 'static {
    async fn announce(&self, message: Arc<[u8]>) -> Result<(), SsdpError>;
}

/// Annonce persistante telle que vue de l'extérieur du registre
#[derive(Debug, Clone)]
pub struct PersistentNotification {
    pub notification: Notification,
    pub message: Arc<[u8]>,
}

impl PersistentNotification {
    pub fn key(&self) -> String {
        self.notification.key()
    }

    /// Période de ré-émission : intervalle annoncé moins 10 %
    pub fn period(&self) -> Duration {
        let interval = self.notification.interval().unwrap_or(DEFAULT_INTERVAL);
        interval - interval / 10
    }
}

struct Slot {
    entry: PersistentNotification,
    timer: Option<JoinHandle<()>>,
}

impl Slot {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Registre des annonces persistantes de ce moteur.
///
/// Au plus un timer actif par clé ; aucune entrée `ssdp:byebye`.
pub struct NotificationRegistry {
    sink: Arc<dyn AnnouncementSink>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl NotificationRegistry {
    pub fn new(sink: Arc<dyn AnnouncementSink>) -> Self {
        Self {
            sink,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Enregistre (ou remplace) une annonce persistante.
    ///
    /// Un timer déjà actif pour la même clé est annulé avant tout. Si
    /// `started`, un nouveau timer est armé ; sa première émission a lieu
    /// après une période complète.
    pub fn register(
        &self,
        notification: Notification,
        message: Arc<[u8]>,
        started: bool,
    ) -> Result<PersistentNotification, SsdpError> {
        let key = notification.key();
        if !notification.is_alive() {
            return Err(SsdpError::NotPersistable(key));
        }

        let entry = PersistentNotification {
            notification,
            message,
        };

        let mut slots = self.slots.lock();
        if let Some(mut previous) = slots.remove(&key) {
            previous.disarm();
        }

        let timer = started.then(|| self.spawn_timer(&entry));
        debug!("📌 Persistent notification registered: {}", key);
        slots.insert(
            key,
            Slot {
                entry: entry.clone(),
                timer,
            },
        );
        Ok(entry)
    }

    /// Annule le timer et retire l'entrée
    pub fn unregister(&self, key: &str) -> Option<PersistentNotification> {
        let mut slot = self.slots.lock().remove(key)?;
        slot.disarm();
        debug!("📌 Persistent notification removed: {}", key);
        Some(slot.entry)
    }

    pub fn lookup(&self, key: &str) -> Option<PersistentNotification> {
        self.slots.lock().get(key).map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Instantané des entrées
    pub fn entries(&self) -> Vec<PersistentNotification> {
        self.slots
            .lock()
            .values()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Arme le timer de chaque entrée (en remplaçant un timer existant)
    pub fn arm_all(&self) -> Vec<PersistentNotification> {
        let mut slots = self.slots.lock();
        let mut armed = Vec::with_capacity(slots.len());
        for slot in slots.values_mut() {
            slot.disarm();
            slot.timer = Some(self.spawn_timer(&slot.entry));
            armed.push(slot.entry.clone());
        }
        armed
    }

    /// Annule tous les timers sans retirer les entrées
    pub fn disarm_all(&self) -> Vec<PersistentNotification> {
        let mut slots = self.slots.lock();
        slots
            .values_mut()
            .map(|slot| {
                slot.disarm();
                slot.entry.clone()
            })
            .collect()
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.timer.is_some())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn spawn_timer(&self, entry: &PersistentNotification) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let message = Arc::clone(&entry.message);
        let key = entry.key();
        let period = entry.period();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match sink.announce(Arc::clone(&message)).await {
                    Ok(()) => debug!("🔁 NOTIFY re-sent: {}", key),
                    Err(e) => warn!("❌ Failed to re-send NOTIFY for {}: {}", key, e),
                }
            }
        })
    }
}

impl Drop for NotificationRegistry {
    fn drop(&mut self) {
        for slot in self.slots.get_mut().values_mut() {
            slot.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        sent: AtomicUsize,
    }

    #[async_trait]
    impl AnnouncementSink for CountingSink {
        async fn announce(&self, _message: Arc<[u8]>) -> Result<(), SsdpError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl AnnouncementSink for FailingSink {
        async fn announce(&self, _message: Arc<[u8]>) -> Result<(), SsdpError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(SsdpError::send(
                "239.255.255.250:1900".parse().unwrap(),
                std::io::Error::other("network unreachable"),
            ))
        }
    }

    fn alive(interval: Duration) -> (Notification, Arc<[u8]>) {
        let mut n = Notification::alive("urn:x", "uuid:1::urn:x");
        n.set_interval(interval);
        let message: Arc<[u8]> = n.to_string().into_bytes().into();
        (n, message)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_ninety_percent_of_interval() {
        let sink = Arc::new(CountingSink::default());
        let registry = NotificationRegistry::new(sink.clone());
        let (n, message) = alive(Duration::from_secs(10));

        let entry = registry.register(n, message, true).unwrap();
        assert_eq!(entry.period(), Duration::from_secs(9));

        tokio::time::sleep(Duration::from_millis(8_900)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_not_started_does_not_arm() {
        let sink = Arc::new(CountingSink::default());
        let registry = NotificationRegistry::new(sink.clone());
        let (n, message) = alive(Duration::from_secs(2));
        let key = n.key();

        registry.register(n, message, false).unwrap();
        assert!(registry.contains(&key));
        assert!(!registry.is_armed(&key));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregister_replaces_timer() {
        let sink = Arc::new(CountingSink::default());
        let registry = NotificationRegistry::new(sink.clone());

        let (n, message) = alive(Duration::from_secs(10));
        registry.register(n.clone(), message.clone(), true).unwrap();
        registry.register(n, message, true).unwrap();
        assert_eq!(registry.len(), 1);

        // Un seul timer actif : une seule émission par période
        tokio::time::sleep(Duration::from_millis(9_100)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_stops_resends() {
        let sink = Arc::new(CountingSink::default());
        let registry = NotificationRegistry::new(sink.clone());
        let (n, message) = alive(Duration::from_secs(2));
        let key = n.key();

        registry.register(n, message, true).unwrap();
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);

        assert!(registry.unregister(&key).is_some());
        assert!(registry.lookup(&key).is_none());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);
        assert!(registry.unregister(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_do_not_break_schedule() {
        let sink = Arc::new(FailingSink {
            attempts: AtomicUsize::new(0),
        });
        let registry = NotificationRegistry::new(sink.clone());
        let (n, message) = alive(Duration::from_secs(2));

        registry.register(n, message, true).unwrap();
        tokio::time::sleep(Duration::from_millis(1_800 * 3 + 100)).await;
        assert_eq!(sink.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dead_notification_is_refused() {
        let registry = NotificationRegistry::new(Arc::new(CountingSink::default()));
        let (n, message) = alive(Duration::from_secs(2));

        let result = registry.register(n.dead(), message, false);
        assert!(matches!(result, Err(SsdpError::NotPersistable(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_disarm_all() {
        let sink = Arc::new(CountingSink::default());
        let registry = NotificationRegistry::new(sink.clone());
        let (n, message) = alive(Duration::from_secs(2));
        let key = n.key();
        registry.register(n, message, false).unwrap();

        assert_eq!(registry.arm_all().len(), 1);
        assert!(registry.is_armed(&key));

        let entries = registry.disarm_all();
        assert_eq!(entries.len(), 1);
        assert!(!registry.is_armed(&key));
        assert!(registry.contains(&key));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.sent.load(Ordering::SeqCst), 0);
    }
}
