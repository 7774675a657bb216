//! Requête M-SEARCH et réponse `HTTP/1.1 200 OK`

use std::fmt;

use crate::codec::{self, SsdpMessage};
use crate::headers::HeaderMap;

/// Sujet de recherche spécial : tous les devices et services
pub const SEARCH_ALL: &str = "ssdp:all";

/// Requête M-SEARCH.
///
/// Valeurs par défaut : `MAN: "ssdp:discover"`, `MX: 1`, `ST: ssdp:all`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    headers: HeaderMap,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self::with_headers(HeaderMap::new())
    }
}

impl SearchRequest {
    /// Requête pour un sujet donné (`ST`)
    pub fn new(subject: impl Into<String>) -> Self {
        let mut request = Self::default();
        request.set_subject(subject);
        request
    }

    /// Complète des en-têtes fournis avec `MAN`, `MX` et `ST` s'ils manquent
    pub fn with_headers(mut headers: HeaderMap) -> Self {
        headers.set_default("MAN", "\"ssdp:discover\"");
        headers.set_default("MX", "1");
        headers.set_default("ST", SEARCH_ALL);
        Self { headers }
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

    pub fn subject(&self) -> Option<&str> {
        self.headers.get("ST")
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.headers.set("ST", subject);
    }

    /// Vrai si la requête vise tous les sujets ou exactement `subject`
    pub fn matches(&self, subject: Option<&str>) -> bool {
        match self.subject() {
            Some(SEARCH_ALL) => true,
            Some(st) => subject == Some(st),
            None => false,
        }
    }
}

impl From<&str> for SearchRequest {
    fn from(subject: &str) -> Self {
        SearchRequest::new(subject)
    }
}

impl From<String> for SearchRequest {
    fn from(subject: String) -> Self {
        SearchRequest::new(subject)
    }
}

impl SsdpMessage for SearchRequest {
    const START_LINE: &'static str = "M-SEARCH * HTTP/1.1";

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl fmt::Display for SearchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::serialize(self))
    }
}

/// Réponse unicast à un M-SEARCH.
///
/// L'USN est écrit à la fois dans `USN` et dans `S` (compatibilité avec les
/// anciens control points).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    headers: HeaderMap,
}

impl SearchResponse {
    /// Construit une réponse en réconciliant `S` et `USN` si un seul est présent
    pub fn with_headers(mut headers: HeaderMap) -> Self {
        let s = headers.get("S").map(str::to_string);
        let usn = headers.get("USN").map(str::to_string);
        match (s, usn) {
            (Some(s), None) => headers.set("USN", s),
            (None, Some(usn)) => headers.set("S", usn),
            _ => {}
        }
        Self { headers }
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

    pub fn subject(&self) -> Option<&str> {
        self.headers.get("ST")
    }

    pub fn set_subject(&mut self, subject: impl Into<String>) {
        self.headers.set("ST", subject);
    }

    /// USN de la réponse (`USN`, à défaut `S`)
    pub fn usn(&self) -> Option<&str> {
        self.headers.get("USN").or_else(|| self.headers.get("S"))
    }

    pub fn set_usn(&mut self, usn: impl Into<String>) {
        let usn = usn.into();
        self.headers.set("S", usn.clone());
        self.headers.set("USN", usn);
    }
}

impl SsdpMessage for SearchResponse {
    const START_LINE: &'static str = "HTTP/1.1 200 OK";

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl fmt::Display for SearchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&codec::serialize(self))
    }
}
