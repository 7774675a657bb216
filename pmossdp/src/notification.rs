//! Message NOTIFY (annonce `ssdp:alive` / retrait `ssdp:byebye`)

use std::fmt;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::codec::{self, SsdpMessage};
use crate::headers::HeaderMap;
use crate::search::SearchResponse;

/// Durée de validité par défaut d'une annonce
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

static MAX_AGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)max-age="?([1-9][0-9]*)"#).expect("valid max-age pattern"));

/// Sous-type d'une notification (en-tête `NTS`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    Alive,
    Dead,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Alive => "ssdp:alive",
            NotificationType::Dead => "ssdp:byebye",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("ssdp:alive") {
            Some(NotificationType::Alive)
        } else if value.eq_ignore_ascii_case("ssdp:byebye") {
            Some(NotificationType::Dead)
        } else {
            None
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification SSDP : vue typée sur un [`HeaderMap`].
///
/// Les propriétés dérivées (`subject`, `usn`, `kind`, `interval`) lisent et
/// écrivent directement les en-têtes `NT`, `USN`, `NTS` et `CACHE-CONTROL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    headers: HeaderMap,
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

impl Notification {
    /// Crée une notification `ssdp:alive` avec un intervalle de 30 s
    pub fn new() -> Self {
        Self::with_headers(HeaderMap::new())
    }

    /// Crée une annonce `ssdp:alive` pour un sujet et un USN
    pub fn alive(subject: impl Into<String>, usn: impl Into<String>) -> Self {
        let mut n = Self::new();
        n.set_subject(subject);
        n.set_usn(usn);
        n
    }

    /// Construit une notification sur des en-têtes fournis par l'appelant.
    ///
    /// `NTS` et `CACHE-CONTROL` ne reçoivent leur valeur par défaut que s'ils
    /// sont absents (ou, pour `CACHE-CONTROL`, illisibles).
    pub fn with_headers(headers: HeaderMap) -> Self {
        let mut n = Self { headers };
        if !n.headers.contains("NTS") {
            n.set_kind(NotificationType::Alive);
        }
        if n.interval().is_none() {
            n.set_interval(DEFAULT_INTERVAL);
        }
        n
    }

    /// Enveloppe des en-têtes tels quels (messages reçus du réseau)
    pub fn from_headers(headers: HeaderMap) -> Self {
        Self { headers }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }

    /// Sous-type `NTS`.
    ///
    /// Un `NTS` absent vaut `ssdp:alive` ; `None` si la valeur est inconnue.
    pub fn kind(&self) -> Option<NotificationType> {
        match self.headers.get("NTS") {
            Some(value) => NotificationType::parse(value),
            None => Some(NotificationType::Alive),
        }
    }

    pub fn set_kind(&mut self, kind: NotificationType) {
        self.headers.set("NTS", kind.as_str());
    }

    pub fn is_alive(&self) -> bool {
        self.kind() == Some(NotificationType::Alive)
    }

    /// Type de service ou de device annoncé (`NT`)
    pub fn subject(&self) -> Option<&str> {
        self.headers.get("NT")
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.headers.set("NT", subject);
    }

    /// Unique Service Name (`USN`)
    pub fn usn(&self) -> Option<&str> {
        self.headers.get("USN")
    }

    pub fn set_usn(&mut self, usn: impl Into<String>) {
        self.headers.set("USN", usn);
    }

    /// Durée de validité extraite de `CACHE-CONTROL: max-age=<s>`.
    ///
    /// `None` si l'en-tête est absent, si `max-age` est nul ou illisible.
    pub fn interval(&self) -> Option<Duration> {
        let value = self.headers.get("CACHE-CONTROL")?;
        let caps = MAX_AGE.captures(value)?;
        let seconds: u64 = caps[1].parse().ok()?;
        Some(Duration::from_secs(seconds))
    }

    /// Réécrit `CACHE-CONTROL` en `max-age=<secondes arrondies>`
    pub fn set_interval(&mut self, interval: Duration) {
        let seconds = (interval.as_millis() + 500) / 1000;
        self.headers.set("CACHE-CONTROL", format!("max-age={}", seconds));
    }

    /// Identité logique de l'annonce : `NT=<subject>|USN=<usn>`.
    ///
    /// Deux notifications désignent la même annonce si et seulement si leurs
    /// clés sont égales.
    pub fn key(&self) -> String {
        format!(
            "NT={}|USN={}",
            self.subject().unwrap_or_default(),
            self.usn().unwrap_or_default()
        )
    }

    /// Copie indépendante de la notification, passée en `ssdp:byebye`
    pub fn dead(&self) -> Notification {
        let mut bye = self.clone();
        bye.set_kind(NotificationType::Dead);
        bye
    }

    /// Réponse à un M-SEARCH pour cette annonce.
    ///
    /// Les en-têtes sont copiés, `NT` et `NTS` retirés, `ST`/`USN`/`S`
    /// renseignés depuis le sujet et l'USN.
    pub fn to_search_response(&self) -> SearchResponse {
        let mut headers = self.headers.clone();
        headers.remove("NT");
        headers.remove("NTS");
        let mut response = SearchResponse::with_headers(headers);
        response.set_subject(self.subject().unwrap_or_default());
        response.set_usn(self.usn().unwrap_or_default());
        response
    }
}

impl SsdpMessage for Notification {
    const START_LINE: &'static str = "NOTIFY * HTTP/1.1";

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::serialize(self))
    }
}
