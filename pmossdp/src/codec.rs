//! Codec texte des messages SSDP
//!
//! Les trois formes de messages partagent la même grammaire : une ligne de
//! requête ou de statut, puis des lignes d'en-têtes (éventuellement repliées),
//! terminées par une ligne vide.
//!
//! ```text
//! NOTIFY * HTTP/1.1        -> Notification
//! M-SEARCH * HTTP/1.1      -> SearchRequest
//! HTTP/1.1 200 OK          -> SearchResponse
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::trace;

use crate::headers::HeaderMap;
use crate::notification::Notification;
use crate::search::{SearchRequest, SearchResponse};

static REQUEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^([a-z-]+)\s(.+?)\sHTTP/[0-9]+\.[0-9]+$").expect("valid request-line pattern")
});

static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^HTTP/[0-9]+\.[0-9]+\s+([0-9]+)(?:\s.*)?$").expect("valid status-line pattern")
});

static FIELD_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([!#$%&'*+.^_`|~0-9A-Za-z-]+):\s*(.*)$").expect("valid header-field pattern")
});

/// Message SSDP sérialisable : une ligne de départ fixe et des en-têtes
pub trait SsdpMessage {
    const START_LINE: &'static str;

    fn headers(&self) -> &HeaderMap;
}

/// Message SSDP reconnu
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Notification(Notification),
    SearchRequest(SearchRequest),
    SearchResponse(SearchResponse),
}

impl Message {
    /// Texte prêt à émettre
    pub fn serialize(&self) -> String {
        match self {
            Message::Notification(n) => serialize(n),
            Message::SearchRequest(r) => serialize(r),
            Message::SearchResponse(r) => serialize(r),
        }
    }

    /// Vue `Notification` d'un NOTIFY ou d'une réponse de recherche.
    ///
    /// Pour une réponse, `ST` devient le sujet (`NT`), `USN`/`S` l'USN ; les
    /// champs `S` et `ST` sont retirés. Une requête M-SEARCH donne `None`.
    pub fn into_notification(self) -> Option<Notification> {
        match self {
            Message::Notification(n) => Some(n),
            Message::SearchResponse(response) => {
                let subject = response.subject().map(str::to_string);
                let usn = response.usn().map(str::to_string);
                let mut headers = response.headers().clone();
                headers.remove("S");
                headers.remove("ST");
                if let Some(usn) = usn {
                    headers.set("USN", usn);
                }
                let mut n = Notification::with_headers(headers);
                if let Some(subject) = subject {
                    n.set_subject(subject);
                }
                Some(n)
            }
            Message::SearchRequest(_) => None,
        }
    }
}

impl From<Notification> for Message {
    fn from(n: Notification) -> Self {
        Message::Notification(n)
    }
}

impl From<SearchRequest> for Message {
    fn from(r: SearchRequest) -> Self {
        Message::SearchRequest(r)
    }
}

impl From<SearchResponse> for Message {
    fn from(r: SearchResponse) -> Self {
        Message::SearchResponse(r)
    }
}

/// Sérialise un message : ligne de départ, une ligne par en-tête dans
/// l'ordre du conteneur, puis `CRLF CRLF`.
pub fn serialize<M: SsdpMessage>(message: &M) -> String {
    format!("{}\r\n{}\r\n", M::START_LINE, message.headers())
}

/// Décode un datagramme brut (UTF-8 invalide remplacé)
pub fn parse_bytes(bytes: &[u8]) -> Option<Message> {
    parse(&String::from_utf8_lossy(bytes))
}

/// Décode le texte d'un message SSDP.
///
/// Retourne `None` pour tout ce qui n'est ni un NOTIFY, ni un M-SEARCH, ni
/// une réponse `200` : ce n'est pas une erreur, l'appelant ignore le message.
pub fn parse(text: &str) -> Option<Message> {
    let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let first_line = lines.next()?.trim();
    let headers = parse_headers(lines);

    if let Some(caps) = REQUEST_LINE.captures(first_line) {
        let method = &caps[1];
        if method.eq_ignore_ascii_case("NOTIFY") {
            return Some(Message::Notification(Notification::from_headers(headers)));
        }
        if method.eq_ignore_ascii_case("M-SEARCH") {
            return Some(Message::SearchRequest(SearchRequest::with_headers(headers)));
        }
        trace!("Ignoring SSDP request with method {}", method);
        return None;
    }

    if let Some(caps) = STATUS_LINE.captures(first_line) {
        if &caps[1] == "200" {
            return Some(Message::SearchResponse(SearchResponse::from_headers(headers)));
        }
        trace!("Ignoring SSDP response with status {}", &caps[1]);
        return None;
    }

    trace!("Unknown SSDP start line: '{}'", first_line);
    None
}

/// Replie les lignes d'en-têtes dans un [`HeaderMap`].
///
/// Une ligne `Nom: valeur` ouvre un champ, une ligne commençant par un blanc
/// prolonge le champ courant, toute autre ligne clôt le champ courant et est
/// ignorée.
fn parse_headers<'a, I>(lines: I) -> HeaderMap
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = HeaderMap::new();
    let mut current: Option<(String, String)> = None;

    for line in lines {
        if let Some(caps) = FIELD_LINE.captures(line) {
            if let Some((name, value)) = current.take() {
                headers.set(name, value);
            }
            current = Some((caps[1].to_string(), caps[2].to_string()));
        } else if line.starts_with([' ', '\t']) && current.is_some() {
            if let Some((_, value)) = current.as_mut() {
                value.push_str(line);
            }
        } else if let Some((name, value)) = current.take() {
            headers.set(name, value);
        }
    }

    if let Some((name, value)) = current {
        headers.set(name, value);
    }
    headers
}
