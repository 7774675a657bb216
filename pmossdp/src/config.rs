//! # Configuration du moteur SSDP
//!
//! La configuration est construite en trois couches :
//! 1. la configuration par défaut embarquée (`pmossdp.yaml`)
//! 2. un fichier YAML optionnel fourni par l'application
//! 3. les variables d'environnement `PMOSSDP_CONFIG__<SECTION>__<CLE>`
//!
//! ## Usage
//!
//! ```no_run
//! use pmossdp::SsdpConfig;
//!
//! let config = SsdpConfig::load(Some("ssdp.yaml".as_ref()))?;
//! let group = config.multicast_group()?;
//! println!("SSDP group: {}", group);
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::env;
use std::fs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use crate::errors::SsdpError;
use crate::signature::{ProductInfo, server_signature};
use crate::transport::TransportConfig;

// Configuration par défaut intégrée
const DEFAULT_CONFIG: &str = include_str!("pmossdp.yaml");

const ENV_PREFIX: &str = "PMOSSDP_CONFIG__";

/// Paramètres du groupe multicast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub address: String,
    pub port: u16,
    pub interface: String,
    pub ttl: u32,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            address: crate::SSDP_MULTICAST_ADDR.to_string(),
            port: crate::SSDP_PORT,
            interface: Ipv4Addr::UNSPECIFIED.to_string(),
            ttl: 2,
        }
    }
}

/// Identité du produit ; à défaut, celle de ce crate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductConfig {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Configuration du moteur SSDP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SsdpConfig {
    pub multicast: MulticastConfig,
    /// Période de nouvelle tentative d'adhésion au groupe (ms)
    pub join_retry_ms: u64,
    pub product: ProductConfig,
    /// Signature imposée, remplace la signature calculée
    pub signature: Option<String>,
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            multicast: MulticastConfig::default(),
            join_retry_ms: 5000,
            product: ProductConfig::default(),
            signature: None,
        }
    }
}

impl SsdpConfig {
    /// Charge la configuration : défauts embarqués, fichier optionnel, puis
    /// variables d'environnement.
    ///
    /// Un fichier absent n'est pas une erreur ; un fichier illisible ou
    /// invalide en est une.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let external = match path {
            Some(path) if path.exists() => {
                info!(config_file=%path.display(), "Loaded SSDP config file");
                Some(fs::read_to_string(path)?)
            }
            Some(path) => {
                info!(config_file=%path.display(), "SSDP config file not found, using defaults");
                None
            }
            None => None,
        };

        let mut value = Self::merged_value(external.as_deref())?;
        apply_env_overrides(&mut value, env::vars());
        Self::from_value(value)
    }

    /// Construit une configuration depuis un document YAML (fusionné avec
    /// les défauts, sans variables d'environnement)
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::from_value(Self::merged_value(Some(yaml))?)
    }

    fn merged_value(external: Option<&str>) -> Result<Value> {
        let mut value: Value = serde_yaml::from_str(DEFAULT_CONFIG)?;
        if let Some(yaml) = external {
            let external: Value = serde_yaml::from_str(yaml)?;
            if !matches!(external, Value::Mapping(_) | Value::Null) {
                return Err(anyhow!("SSDP configuration must be a YAML mapping"));
            }
            merge_yaml(&mut value, &lower_keys_value(external));
        }
        Ok(lower_keys_value(value))
    }

    fn from_value(value: Value) -> Result<Self> {
        let config: SsdpConfig = serde_yaml::from_value(value)?;
        debug!(?config, "SSDP configuration");
        Ok(config)
    }

    /// Groupe multicast validé.
    ///
    /// L'adresse doit être une adresse IPv4 multicast, le port non nul.
    pub fn multicast_group(&self) -> Result<SocketAddrV4, SsdpError> {
        let address: Ipv4Addr = self
            .multicast
            .address
            .trim()
            .parse()
            .map_err(|_| SsdpError::InvalidMulticastAddress(self.multicast.address.clone()))?;
        if !address.is_multicast() {
            return Err(SsdpError::InvalidMulticastAddress(
                self.multicast.address.clone(),
            ));
        }
        if self.multicast.port == 0 {
            return Err(SsdpError::InvalidPort(self.multicast.port));
        }
        Ok(SocketAddrV4::new(address, self.multicast.port))
    }

    pub fn interface(&self) -> Result<Ipv4Addr, SsdpError> {
        self.multicast
            .interface
            .trim()
            .parse()
            .map_err(|_| SsdpError::InvalidInterface(self.multicast.interface.clone()))
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms.max(1))
    }

    /// Paramètres réseau validés pour le transport
    pub fn transport_config(&self) -> Result<TransportConfig, SsdpError> {
        let mut config = TransportConfig::new(self.multicast_group()?);
        config.interface = self.interface()?;
        config.multicast_ttl = self.multicast.ttl;
        config.join_retry = self.join_retry();
        Ok(config)
    }

    pub fn product(&self) -> ProductInfo {
        let default = ProductInfo::default();
        ProductInfo::new(
            self.product.name.clone().unwrap_or(default.name),
            self.product.version.clone().unwrap_or(default.version),
        )
    }

    /// Signature `SERVER` / `USER-AGENT` des messages émis
    pub fn signature(&self) -> String {
        match &self.signature {
            Some(signature) if !signature.trim().is_empty() => signature.clone(),
            _ => server_signature(&self.product()),
        }
    }
}

/// Fusionne récursivement `external` dans `default`.
///
/// Les mappings sont fusionnés clé par clé ; scalaires et séquences sont
/// remplacés.
fn merge_yaml(default: &mut Value, external: &Value) {
    match (default, external) {
        (Value::Mapping(dmap), Value::Mapping(emap)) => {
            for (k, v) in emap {
                match dmap.get_mut(k) {
                    Some(dv) => merge_yaml(dv, v),
                    None => {
                        dmap.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (d, e) => *d = e.clone(),
    }
}

/// Applique les variables `PMOSSDP_CONFIG__<SECTION>__<CLE>`.
///
/// La valeur est d'abord lue comme un scalaire YAML ; si la configuration
/// obtenue ne se désérialise plus (`1.0` pour une version, par exemple), la
/// chaîne brute est conservée.
fn apply_env_overrides<I>(config: &mut Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (key, value) in vars {
        let Some(path) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        let key_path: Vec<String> = path.split("__").map(str::to_lowercase).collect();
        let key_path: Vec<&str> = key_path.iter().map(String::as_str).collect();
        debug!(env_var=%key, "Applying SSDP config override");

        let mut candidate = config.clone();
        set_value(&mut candidate, &key_path, convert_env_value(&value));
        if serde_yaml::from_value::<SsdpConfig>(candidate.clone()).is_ok() {
            *config = candidate;
        } else {
            set_value(config, &key_path, Value::String(value));
        }
    }
}

fn set_value(data: &mut Value, path: &[&str], value: Value) {
    let Some((first, rest)) = path.split_first() else {
        *data = value;
        return;
    };
    if !matches!(data, Value::Mapping(_)) {
        *data = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(map) = data {
        let entry = map
            .entry(Value::String(first.to_string()))
            .or_insert(Value::Null);
        set_value(entry, rest, value);
    }
}

fn convert_env_value(value: &str) -> Value {
    if let Ok(parsed) = serde_yaml::from_str::<Value>(value) {
        return parsed;
    }
    Value::String(value.to_string())
}

fn lower_keys_value(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut new_map = Mapping::new();
            for (k, v) in map {
                let k = match k {
                    Value::String(s) => Value::String(s.to_lowercase()),
                    other => other,
                };
                new_map.insert(k, lower_keys_value(v));
            }
            Value::Mapping(new_map)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(lower_keys_value).collect()),
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_defaults() {
        let config = SsdpConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SsdpConfig::default());
        assert_eq!(
            config.multicast_group().unwrap(),
            SocketAddrV4::new(Ipv4Addr::new(239, 255, 255, 250), 1900)
        );
        assert_eq!(config.join_retry(), Duration::from_secs(5));
        assert_eq!(config.product().name, "pmossdp");
    }

    #[test]
    fn test_partial_file_is_merged_with_defaults() {
        let config = SsdpConfig::from_yaml_str("Multicast:\n  Port: 1901\nsignature: Test/1.0\n").unwrap();
        assert_eq!(config.multicast.port, 1901);
        assert_eq!(config.multicast.address, "239.255.255.250");
        assert_eq!(config.signature(), "Test/1.0");
    }

    #[test]
    fn test_env_overrides() {
        let mut value = SsdpConfig::merged_value(None).unwrap();
        apply_env_overrides(
            &mut value,
            vec![
                ("PMOSSDP_CONFIG__MULTICAST__PORT".to_string(), "41900".to_string()),
                ("PMOSSDP_CONFIG__PRODUCT__NAME".to_string(), "demo".to_string()),
                ("UNRELATED".to_string(), "1".to_string()),
            ],
        );
        let config = SsdpConfig::from_value(value).unwrap();
        assert_eq!(config.multicast.port, 41900);
        assert_eq!(config.product().name, "demo");
        assert!(config.signature().ends_with(&format!("demo/{}", env!("CARGO_PKG_VERSION"))));
    }

    #[test]
    fn test_env_overrides_keep_numeric_looking_strings() {
        let mut value = SsdpConfig::merged_value(None).unwrap();
        apply_env_overrides(
            &mut value,
            vec![
                ("PMOSSDP_CONFIG__PRODUCT__VERSION".to_string(), "1.10".to_string()),
                ("PMOSSDP_CONFIG__PRODUCT__NAME".to_string(), "2024".to_string()),
                ("PMOSSDP_CONFIG__MULTICAST__TTL".to_string(), "4".to_string()),
            ],
        );
        let config = SsdpConfig::from_value(value).unwrap();
        assert_eq!(config.product.version.as_deref(), Some("1.10"));
        assert_eq!(config.product.name.as_deref(), Some("2024"));
        assert_eq!(config.multicast.ttl, 4);
        assert!(config.signature().ends_with("2024/1.10"));

        let mut value = SsdpConfig::merged_value(None).unwrap();
        apply_env_overrides(
            &mut value,
            vec![("PMOSSDP_CONFIG__SIGNATURE".to_string(), "1.0".to_string())],
        );
        let config = SsdpConfig::from_value(value).unwrap();
        assert_eq!(config.signature(), "1.0");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssdp.yaml");
        fs::write(&path, "join_retry_ms: 250\nmulticast:\n  ttl: 4\n").unwrap();

        let config = SsdpConfig::load(Some(&path)).unwrap();
        assert_eq!(config.join_retry(), Duration::from_millis(250));
        assert_eq!(config.multicast.ttl, 4);

        let missing = dir.path().join("missing.yaml");
        assert!(SsdpConfig::load(Some(&missing)).is_ok());
    }

    #[test]
    fn test_invalid_group_is_rejected() {
        let mut config = SsdpConfig::default();
        config.multicast.address = "192.168.1.10".to_string();
        assert!(matches!(
            config.multicast_group(),
            Err(SsdpError::InvalidMulticastAddress(_))
        ));

        config.multicast.address = "not-an-address".to_string();
        assert!(config.transport_config().is_err());

        let mut config = SsdpConfig::default();
        config.multicast.port = 0;
        assert!(matches!(config.multicast_group(), Err(SsdpError::InvalidPort(0))));

        let mut config = SsdpConfig::default();
        config.multicast.interface = "eth0".to_string();
        assert!(matches!(config.interface(), Err(SsdpError::InvalidInterface(_))));
    }
}
