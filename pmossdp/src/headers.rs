//! Conteneur d'en-têtes SSDP
//!
//! Les noms de champs sont comparés sans tenir compte de la casse, mais la
//! casse de la première écriture est conservée. L'ordre d'insertion est
//! significatif : c'est lui qui détermine l'ordre des lignes sérialisées.

use std::fmt;

/// Table d'en-têtes ordonnée et insensible à la casse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    /// Crée un conteneur vide
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Indique si un champ existe (quelle que soit la casse demandée)
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Retourne la valeur d'un champ
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|i| self.fields[i].1.as_str())
    }

    /// Définit la valeur d'un champ.
    ///
    /// Si un champ de même nom existe déjà, sa valeur est remplacée sur place
    /// (même nom d'origine, même position). Sinon le champ est ajouté en fin
    /// de table avec la casse fournie.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(i) => self.fields[i].1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Définit un champ uniquement s'il est absent
    pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if !self.contains(&name) {
            self.fields.push((name, value.into()));
        }
    }

    /// Supprime un champ et retourne son ancienne valeur
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|i| self.fields.remove(i).1)
    }

    /// Itère sur les champs dans l'ordre d'insertion, avec leur casse d'origine
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for HeaderMap
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }
}

/// Une ligne `Name: value` par champ, terminée par CRLF
impl fmt::Display for HeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}
