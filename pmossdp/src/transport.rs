//! Transport UDP multicast
//!
//! Deux sockets :
//!
//! * la socket multicast, liée au port SSDP, qui reçoit les annonces et les
//!   recherches du groupe ;
//! * une socket unicast éphémère, créée au premier envoi, qui porte tous les
//!   envois (groupe multicast ou réponse directe à un demandeur) et reçoit
//!   les réponses unicast à nos propres M-SEARCH.
//!
//! ```text
//! Closed --start()--> Binding --bind ok--> Bound --join ok--> Joined
//!    ^                   |                   |  \__join ko: retry every 5 s
//!    |                   +--bind ko (fatal)  |
//!    +-------------------- stop() -----------+
//! ```
//!
//! L'échec d'adhésion au groupe n'est jamais fatal : la tentative est répétée
//! à intervalle fixe, sans limite (un device peut démarrer avant que son
//! interface réseau ne soit prête).

use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

use crate::errors::SsdpError;
use crate::registry::AnnouncementSink;

/// Période de nouvelle tentative d'adhésion au groupe multicast
pub const DEFAULT_JOIN_RETRY: Duration = Duration::from_secs(5);

const MIN_JOIN_RETRY: Duration = Duration::from_millis(1);

const RECV_BUFFER_SIZE: usize = 8192;
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// État du transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Binding,
    /// Socket liée, adhésion au groupe en attente
    Bound,
    Joined,
}

/// Datagramme reçu sur l'une des sockets
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub from: SocketAddr,
}

/// Adhésion au groupe multicast.
///
/// L'implémentation par défaut ([`SocketJoiner`]) appelle directement
/// `IP_ADD_MEMBERSHIP` sur la socket de réception.
pub trait GroupJoiner: Send + Sync + 'static {
    fn join(&self, socket: &UdpSocket, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()>;

    fn leave(&self, socket: &UdpSocket, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SocketJoiner;

impl GroupJoiner for SocketJoiner {
    fn join(&self, socket: &UdpSocket, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        socket.join_multicast_v4(group, interface)
    }

    fn leave(&self, socket: &UdpSocket, group: Ipv4Addr, interface: Ipv4Addr) -> io::Result<()> {
        socket.leave_multicast_v4(group, interface)
    }
}

/// Paramètres réseau du transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Groupe multicast et port SSDP
    pub group: SocketAddrV4,
    /// Interface locale (`0.0.0.0` : laissée au système)
    pub interface: Ipv4Addr,
    pub multicast_ttl: u32,
    pub join_retry: Duration,
}

impl TransportConfig {
    pub fn new(group: SocketAddrV4) -> Self {
        Self {
            group,
            interface: Ipv4Addr::UNSPECIFIED,
            multicast_ttl: 2,
            join_retry: DEFAULT_JOIN_RETRY,
        }
    }
}

struct Link {
    state: TransportState,
    socket: Option<Arc<UdpSocket>>,
    unicast: Option<Arc<UdpSocket>>,
    inbound: Option<UnboundedSender<Datagram>>,
    pending: VecDeque<Arc<[u8]>>,
    join_retry: Option<JoinHandle<()>>,
    receivers: Vec<JoinHandle<()>>,
}

impl Link {
    fn new() -> Self {
        Self {
            state: TransportState::Closed,
            socket: None,
            unicast: None,
            inbound: None,
            pending: VecDeque::new(),
            join_retry: None,
            receivers: Vec::new(),
        }
    }

    fn release(&mut self) {
        if let Some(retry) = self.join_retry.take() {
            retry.abort();
        }
        for receiver in self.receivers.drain(..) {
            receiver.abort();
        }
        self.unicast = None;
        self.socket = None;
        self.inbound = None;
    }
}

/// Transport multicast SSDP
pub struct MulticastTransport {
    config: TransportConfig,
    joiner: Arc<dyn GroupJoiner>,
    link: Mutex<Link>,
}

impl MulticastTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self::with_joiner(config, Arc::new(SocketJoiner))
    }

    pub fn with_joiner(config: TransportConfig, joiner: Arc<dyn GroupJoiner>) -> Self {
        Self {
            config,
            joiner,
            link: Mutex::new(Link::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Adresse de destination par défaut (groupe multicast)
    pub fn group(&self) -> SocketAddr {
        SocketAddr::V4(self.config.group)
    }

    pub fn state(&self) -> TransportState {
        self.link.lock().state
    }

    pub fn is_started(&self) -> bool {
        self.state() != TransportState::Closed
    }

    pub fn is_joined(&self) -> bool {
        self.state() == TransportState::Joined
    }

    /// Nombre de recherches en attente d'adhésion au groupe
    pub fn pending_searches(&self) -> usize {
        self.link.lock().pending.len()
    }

    /// Ouvre la socket multicast puis tente d'adhérer au groupe.
    ///
    /// Les datagrammes reçus sont poussés dans `inbound`. Un échec de bind est
    /// fatal ; un échec d'adhésion programme une nouvelle tentative.
    pub async fn start(
        self: &Arc<Self>,
        inbound: UnboundedSender<Datagram>,
    ) -> Result<(), SsdpError> {
        {
            let mut link = self.link.lock();
            if link.state != TransportState::Closed {
                return Err(SsdpError::AlreadyStarted);
            }
            link.state = TransportState::Binding;
        }

        let bind_addr = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::UNSPECIFIED,
            self.config.group.port(),
        ));
        let socket = match self.bind_multicast_socket(bind_addr) {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                self.link.lock().state = TransportState::Closed;
                warn!("❌ Cannot bind SSDP socket on {}: {}", bind_addr, source);
                return Err(SsdpError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };

        {
            let mut link = self.link.lock();
            link.receivers
                .push(spawn_receiver(Arc::clone(&socket), inbound.clone()));
            link.socket = Some(socket);
            link.inbound = Some(inbound);
            link.state = TransportState::Bound;
        }
        info!("✅ SSDP socket bound on {}", bind_addr);

        if !self.join().await {
            self.schedule_join_retry();
        }
        Ok(())
    }

    /// Ferme les sockets et annule la tentative d'adhésion en cours.
    ///
    /// Sans effet si le transport est déjà fermé.
    pub fn stop(&self) {
        let mut link = self.link.lock();
        if link.state == TransportState::Joined {
            if let Some(socket) = &link.socket {
                if let Err(e) =
                    self.joiner
                        .leave(socket, *self.config.group.ip(), self.config.interface)
                {
                    debug!("Cannot leave multicast group {}: {}", self.config.group, e);
                }
            }
        }
        link.release();
        if link.state != TransportState::Closed {
            link.state = TransportState::Closed;
            info!("🛑 SSDP transport stopped");
        }
    }

    /// Met un message en file tant que le groupe n'est pas rejoint.
    ///
    /// Retourne `false` si le groupe est déjà rejoint : l'appelant envoie
    /// alors directement.
    pub fn queue_until_joined(&self, message: Arc<[u8]>) -> bool {
        let mut link = self.link.lock();
        if link.state == TransportState::Joined {
            return false;
        }
        link.pending.push_back(message);
        true
    }

    /// Envoie un message au groupe multicast ou à `target`
    pub async fn send(&self, message: &[u8], target: Option<SocketAddr>) -> Result<(), SsdpError> {
        let target = target.unwrap_or_else(|| self.group());
        let socket = self
            .unicast_socket()
            .map_err(|e| SsdpError::send(target, e))?;
        socket
            .send_to(message, target)
            .await
            .map_err(|e| SsdpError::send(target, e))?;
        debug!(
            "📤 SSDP message sent to {}\n{}",
            target,
            String::from_utf8_lossy(message)
        );
        Ok(())
    }

    /// Tente d'adhérer au groupe ; en cas de succès vide la file d'attente.
    async fn join(self: &Arc<Self>) -> bool {
        let socket = {
            let link = self.link.lock();
            match (link.state, &link.socket) {
                (TransportState::Bound, Some(socket)) => Arc::clone(socket),
                (state, _) => return state == TransportState::Joined,
            }
        };

        match self
            .joiner
            .join(&socket, *self.config.group.ip(), self.config.interface)
        {
            Ok(()) => {
                info!(
                    "✅ Joined multicast group {} on {}",
                    self.config.group.ip(),
                    self.config.interface
                );
                self.flush_pending().await;
                true
            }
            Err(e) => {
                warn!(
                    "⚠️ Cannot join multicast group {} ({}), retrying in {:?}",
                    self.config.group.ip(),
                    e,
                    self.config.join_retry
                );
                false
            }
        }
    }

    /// Envoie les recherches en attente, une à une et dans l'ordre de
    /// soumission, puis passe à l'état `Joined` une fois la file vide.
    ///
    /// L'état est relu avant chaque envoi : un `stop()` concurrent
    /// interrompt la purge et laisse le reste de la file en place.
    async fn flush_pending(&self) {
        loop {
            let message = {
                let mut link = self.link.lock();
                if link.state != TransportState::Bound {
                    return;
                }
                match link.pending.pop_front() {
                    Some(message) => message,
                    None => {
                        link.state = TransportState::Joined;
                        return;
                    }
                }
            };

            if let Err(e) = self.send(&message, None).await {
                warn!("❌ Failed to flush pending M-SEARCH: {}", e);
            }
        }
    }

    fn schedule_join_retry(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.join_retry.max(MIN_JOIN_RETRY);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                if !transport.is_started() {
                    break;
                }
                if transport.join().await {
                    // Le handle est relâché sans abort : c'est la tâche courante
                    transport.link.lock().join_retry.take();
                    break;
                }
            }
        });

        let mut link = self.link.lock();
        if let Some(previous) = link.join_retry.replace(handle) {
            previous.abort();
        }
    }

    fn bind_multicast_socket(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.set_multicast_loop_v4(true)?;

        let socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(socket)
    }

    /// Socket d'envoi, créée à la demande
    fn unicast_socket(&self) -> io::Result<Arc<UdpSocket>> {
        let mut link = self.link.lock();
        if let Some(socket) = &link.unicast {
            return Ok(Arc::clone(socket));
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(self.config.interface, 0)).into())?;
        socket.set_multicast_ttl_v4(self.config.multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
        if !self.config.interface.is_unspecified() {
            socket.set_multicast_if_v4(&self.config.interface)?;
        }

        let socket: std::net::UdpSocket = socket.into();
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        if let Some(inbound) = &link.inbound {
            let receiver = spawn_receiver(Arc::clone(&socket), inbound.clone());
            link.receivers.push(receiver);
        }
        debug!("SSDP send socket ready on {:?}", socket.local_addr());
        link.unicast = Some(Arc::clone(&socket));
        Ok(socket)
    }
}

#[async_trait]
impl AnnouncementSink for MulticastTransport {
    async fn announce(&self, message: Arc<[u8]>) -> Result<(), SsdpError> {
        self.send(&message, None).await
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.link.get_mut().release();
    }
}

fn spawn_receiver(socket: Arc<UdpSocket>, inbound: UnboundedSender<Datagram>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    let datagram = Datagram {
                        payload: buf[..n].to_vec(),
                        from,
                    };
                    if inbound.send(datagram).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("❌ SSDP read error: {}", e);
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    /// Échoue `failures` fois avant de réussir
    struct FlakyJoiner {
        failures: usize,
        attempts: AtomicUsize,
    }

    impl FlakyJoiner {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                attempts: AtomicUsize::new(0),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }
    }

    impl GroupJoiner for FlakyJoiner {
        fn join(&self, _: &UdpSocket, _: Ipv4Addr, _: Ipv4Addr) -> io::Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                Err(io::Error::other("no multicast route"))
            } else {
                Ok(())
            }
        }

        fn leave(&self, _: &UdpSocket, _: Ipv4Addr, _: Ipv4Addr) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> TransportConfig {
        let mut config = TransportConfig::new(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 0));
        config.join_retry = Duration::from_millis(20);
        config
    }

    #[tokio::test]
    async fn test_join_is_retried_until_success() {
        let joiner = FlakyJoiner::new(2);
        let transport = Arc::new(MulticastTransport::with_joiner(test_config(), joiner.clone()));
        let (tx, _rx) = unbounded_channel();

        transport.start(tx).await.unwrap();
        assert_eq!(transport.state(), TransportState::Bound);
        assert_eq!(joiner.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.state(), TransportState::Joined);
        assert_eq!(joiner.attempts(), 3);

        // Plus de nouvelle tentative après le succès
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(joiner.attempts(), 3);
        transport.stop();
    }

    #[tokio::test]
    async fn test_pending_searches_flush_on_join() {
        let transport = Arc::new(MulticastTransport::with_joiner(test_config(), FlakyJoiner::new(1)));
        let (tx, _rx) = unbounded_channel();

        assert!(transport.queue_until_joined(Arc::from(&b"first"[..])));
        assert!(transport.queue_until_joined(Arc::from(&b"second"[..])));
        assert_eq!(transport.pending_searches(), 2);

        transport.start(tx).await.unwrap();
        assert_eq!(transport.pending_searches(), 2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(transport.is_joined());
        assert_eq!(transport.pending_searches(), 0);
        assert!(!transport.queue_until_joined(Arc::from(&b"third"[..])));
        transport.stop();
    }

    /// Arrête le transport pendant l'adhésion au groupe
    #[derive(Default)]
    struct StoppingJoiner {
        transport: OnceLock<Weak<MulticastTransport>>,
    }

    impl GroupJoiner for StoppingJoiner {
        fn join(&self, _: &UdpSocket, _: Ipv4Addr, _: Ipv4Addr) -> io::Result<()> {
            if let Some(transport) = self.transport.get().and_then(Weak::upgrade) {
                transport.stop();
            }
            Ok(())
        }

        fn leave(&self, _: &UdpSocket, _: Ipv4Addr, _: Ipv4Addr) -> io::Result<()> {
            Ok(())
        }
    }

    /// Port UDP libre au moment de l'appel
    fn free_port() -> u16 {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        socket.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_pending_searches_sent_once_in_order_after_join() {
        // Le « groupe » est l'adresse de boucle locale sur le port de la
        // socket de réception : le transport reçoit ses propres envois.
        let port = free_port();
        let mut config = TransportConfig::new(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        config.join_retry = Duration::from_millis(150);
        let joiner = FlakyJoiner::new(2);
        let transport = Arc::new(MulticastTransport::with_joiner(config, joiner.clone()));
        let (tx, mut rx) = unbounded_channel();

        for message in [&b"first"[..], b"second", b"third"] {
            assert!(transport.queue_until_joined(Arc::from(message)));
        }
        transport.start(tx).await.unwrap();

        // Rien n'est émis tant que le groupe n'est pas rejoint
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(joiner.attempts() < 3);
        assert!(rx.try_recv().is_err());
        assert_eq!(transport.pending_searches(), 3);

        let mut received = Vec::new();
        while received.len() < 3 {
            let datagram = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("pending search not flushed")
                .unwrap();
            received.push(datagram.payload);
        }
        assert_eq!(
            received,
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert!(transport.is_joined());

        // Une seule émission par recherche
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
        transport.stop();
    }

    #[tokio::test]
    async fn test_stop_during_join_keeps_queue_and_sockets_closed() {
        let joiner = Arc::new(StoppingJoiner::default());
        let transport = Arc::new(MulticastTransport::with_joiner(test_config(), joiner.clone()));
        let _ = joiner.transport.set(Arc::downgrade(&transport));
        let (tx, _rx) = unbounded_channel();

        assert!(transport.queue_until_joined(Arc::from(&b"first"[..])));
        assert!(transport.queue_until_joined(Arc::from(&b"second"[..])));
        transport.start(tx).await.unwrap();

        assert_eq!(transport.state(), TransportState::Closed);
        assert_eq!(transport.pending_searches(), 2);
        assert!(transport.link.lock().unicast.is_none());
    }

    #[tokio::test]
    async fn test_zero_join_retry_still_retries() {
        let mut config = test_config();
        config.join_retry = Duration::ZERO;
        let joiner = FlakyJoiner::new(1);
        let transport = Arc::new(MulticastTransport::with_joiner(config, joiner.clone()));
        let (tx, _rx) = unbounded_channel();

        transport.start(tx).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.is_joined());
        assert_eq!(joiner.attempts(), 2);
        transport.stop();
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let transport = Arc::new(MulticastTransport::with_joiner(test_config(), FlakyJoiner::new(0)));
        let (tx, _rx) = unbounded_channel();

        transport.start(tx.clone()).await.unwrap();
        assert!(transport.is_joined());
        assert!(matches!(
            transport.start(tx.clone()).await,
            Err(SsdpError::AlreadyStarted)
        ));

        transport.stop();
        assert_eq!(transport.state(), TransportState::Closed);
        transport.stop();
        assert_eq!(transport.state(), TransportState::Closed);

        transport.start(tx).await.unwrap();
        assert!(transport.is_started());
        transport.stop();
    }

    #[tokio::test]
    async fn test_stop_cancels_join_retry() {
        let joiner = FlakyJoiner::new(usize::MAX);
        let transport = Arc::new(MulticastTransport::with_joiner(test_config(), joiner.clone()));
        let (tx, _rx) = unbounded_channel();

        transport.start(tx).await.unwrap();
        transport.stop();
        let attempts = joiner.attempts();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(joiner.attempts(), attempts);
    }

    #[tokio::test]
    async fn test_bind_failure_is_fatal() {
        let blocker = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let config = TransportConfig::new(SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), port));
        let transport = Arc::new(MulticastTransport::with_joiner(config, FlakyJoiner::new(0)));
        let (tx, _rx) = unbounded_channel();

        let result = transport.start(tx).await;
        assert!(matches!(result, Err(SsdpError::Bind { .. })));
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_unicast_send() {
        let transport = MulticastTransport::new(test_config());
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = peer.local_addr().unwrap();

        transport.send(b"HTTP/1.1 200 OK\r\n\r\n", Some(target)).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"HTTP/1.1 200 OK\r\n\r\n");
    }
}
