//! Signature `SERVER` / `USER-AGENT` des messages émis

/// Identité du produit embarquée dans la signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductInfo {
    pub name: String,
    pub version: String,
}

impl ProductInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for ProductInfo {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    }
}

/// Jeton `<OS>/<version>` en tête de la signature (`Linux/6.5.0`,
/// `Macos/15.1`, `Windows/Unknown`...)
pub fn os_string() -> String {
    let info = os_info::get();
    let version = match info.version() {
        os_info::Version::Unknown => "Unknown".to_string(),
        version => version.to_string(),
    };
    format!("{:?}/{}", info.os_type(), version)
}

/// Signature complète : `<OS>/<version> UPnP/1.1 SSDP/1.0 <produit>/<version>`
pub fn server_signature(product: &ProductInfo) -> String {
    format!(
        "{} UPnP/1.1 SSDP/1.0 {}/{}",
        os_string(),
        product.name,
        product.version
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_ends_with_product() {
        let product = ProductInfo::new("pmossdp-test", "1.2.3");
        let signature = server_signature(&product);

        assert!(signature.contains(" UPnP/1.1 SSDP/1.0 "));
        assert!(signature.ends_with("pmossdp-test/1.2.3"));
        assert!(signature.starts_with(&os_string()));
    }

    #[test]
    fn test_os_token_has_type_and_version() {
        let token = os_string();
        let (os, version) = token.split_once('/').unwrap();
        assert!(!os.is_empty());
        assert!(!version.is_empty());
    }

    #[test]
    fn test_default_product_is_crate() {
        let product = ProductInfo::default();
        assert_eq!(product.name, "pmossdp");
        assert!(!product.version.is_empty());
    }
}
