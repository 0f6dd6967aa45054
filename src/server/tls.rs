use crate::options::{ClientAuth, TlsFlags};
use crate::server::error::ConfigError;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{NoServerSessionStorage, StoresServerSessions, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

/// The TLS settings used to secure data connections: a ready-made rustls server configuration and
/// the client certificate mode it was built with.
///
/// A capability can be attached to a [`DataConnectionPolicy`](crate::DataConnectionPolicy) or be
/// inherited from the listener; see
/// [`resolve_effective_tls`](crate::DataConnectionPolicy::resolve_effective_tls).
#[derive(Clone)]
pub struct TlsCapability {
    config: Arc<ServerConfig>,
    client_auth: ClientAuth,
}

impl fmt::Debug for TlsCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsCapability").field("client_auth", &self.client_auth).finish()
    }
}

impl TlsCapability {
    /// Wraps an existing rustls configuration. `client_auth` should reflect the client certificate
    /// verifier configured in it.
    pub fn new(config: Arc<ServerConfig>, client_auth: ClientAuth) -> TlsCapability {
        TlsCapability { config, client_auth }
    }

    /// Builds a capability from PEM encoded files. `trust_store` holds the CA certificates client
    /// certificates are checked against and is required unless `client_auth` is
    /// [`ClientAuth::None`].
    pub fn from_pem_files<P: AsRef<Path>>(
        certs_file: P,
        key_file: P,
        trust_store: Option<P>,
        client_auth: ClientAuth,
        flags: TlsFlags,
    ) -> Result<TlsCapability, ConfigError> {
        let certs = load_certs(certs_file.as_ref())?;
        let key = PrivateKeyDer::from_pem_file(key_file.as_ref()).map_err(|e| ConfigError::tls("could not load private key", e))?;

        let mut versions: Vec<&'static SupportedProtocolVersion> = vec![];
        if flags.contains(TlsFlags::V1_2) {
            versions.push(&rustls::version::TLS12);
        }
        if flags.contains(TlsFlags::V1_3) {
            versions.push(&rustls::version::TLS13);
        }
        if versions.is_empty() {
            return Err(ConfigError::tls("no TLS version enabled", "TlsFlags must contain V1_2 or V1_3"));
        }

        let provider = crypto_provider()?;
        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_protocol_versions(&versions)
            .map_err(|e| ConfigError::tls("unsupported protocol versions", e))?;

        let builder = match client_auth {
            ClientAuth::None => builder.with_no_client_auth(),
            ClientAuth::Want | ClientAuth::Need => {
                let Some(trust_store) = trust_store else {
                    return Err(ConfigError::tls(
                        format!("client auth '{client_auth}' requires a trust store"),
                        "no CA certificates configured",
                    ));
                };
                let mut roots = RootCertStore::empty();
                for cert in load_certs(trust_store.as_ref())? {
                    roots.add(cert).map_err(|e| ConfigError::tls("invalid CA certificate", e))?;
                }
                let mut verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider);
                if client_auth == ClientAuth::Want {
                    verifier = verifier.allow_unauthenticated();
                }
                let verifier = verifier.build().map_err(|e| ConfigError::tls("could not build client verifier", e))?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let mut config = builder
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::tls("certificate and key do not form a valid pair", e))?;

        // Support session resumption with server side state (Session IDs)
        config.session_storage = if flags.contains(TlsFlags::RESUMPTION_SESS_ID) {
            TlsSessionCache::new(1024)
        } else {
            Arc::new(NoServerSessionStorage {})
        };

        Ok(TlsCapability::new(Arc::new(config), client_auth))
    }

    /// The client certificate mode.
    pub fn client_auth(&self) -> ClientAuth {
        self.client_auth
    }

    /// The underlying rustls configuration.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }

    pub(crate) fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| ConfigError::tls(format!("could not read certificates from {}", path.display()), e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::tls(format!("malformed certificate in {}", path.display()), e))?;
    if certs.is_empty() {
        return Err(ConfigError::tls(format!("no certificates found in {}", path.display()), "empty PEM file"));
    }
    Ok(certs)
}

#[cfg(feature = "aws_lc_rs")]
fn crypto_provider() -> Result<Arc<CryptoProvider>, ConfigError> {
    Ok(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

#[cfg(all(feature = "ring", not(feature = "aws_lc_rs")))]
fn crypto_provider() -> Result<Arc<CryptoProvider>, ConfigError> {
    Ok(Arc::new(rustls::crypto::ring::default_provider()))
}

#[cfg(not(any(feature = "ring", feature = "aws_lc_rs")))]
fn crypto_provider() -> Result<Arc<CryptoProvider>, ConfigError> {
    CryptoProvider::get_default()
        .cloned()
        .ok_or_else(|| ConfigError::tls("no crypto provider", "enable the ring or aws_lc_rs feature or install a default provider"))
}

/// Stores the session IDs the server assigned to clients, so that data connections can resume
/// the TLS session of the control connection.
#[derive(Debug)]
struct TlsSessionCache {
    cache: moka::sync::Cache<Vec<u8>, Vec<u8>>,
}

impl TlsSessionCache {
    /// Make a new TlsSessionCache. `size` is the maximum number of stored sessions.
    fn new(size: u64) -> Arc<TlsSessionCache> {
        Arc::new(TlsSessionCache {
            cache: moka::sync::CacheBuilder::new(size).time_to_idle(Duration::from_secs(5 * 60)).build(),
        })
    }
}

impl StoresServerSessions for TlsSessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.cache.insert(key, value);
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.cache.get(key)
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        // rustls takes the entry on every resumption. FTP clients resume the control channel
        // session once per data connection, so the entry must survive.
        self.cache.get(key)
    }

    fn can_cache(&self) -> bool {
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rustls::server::ResolvesServerCertUsingSni;

    /// A capability without certificates. Good enough to test TLS selection, not for handshakes.
    pub(crate) fn dummy_capability(client_auth: ClientAuth) -> TlsCapability {
        let config = ServerConfig::builder_with_provider(crypto_provider().unwrap())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(ResolvesServerCertUsingSni::new()));
        TlsCapability::new(Arc::new(config), client_auth)
    }

    /// A capability for `localhost` with a freshly generated self-signed certificate, and a client
    /// configuration that trusts it. Client certificates are checked against the same certificate.
    pub(crate) fn self_signed(client_auth: ClientAuth) -> (TlsCapability, Arc<rustls::ClientConfig>) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_file = dir.path().join("cert.pem");
        let key_file = dir.path().join("key.pem");
        std::fs::write(&cert_file, certified.cert.pem()).unwrap();
        std::fs::write(&key_file, certified.signing_key.serialize_pem()).unwrap();
        let trust_store = (client_auth != ClientAuth::None).then(|| cert_file.clone());
        let tls = TlsCapability::from_pem_files(cert_file, key_file, trust_store, client_auth, TlsFlags::default()).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(certified.cert.der().clone()).unwrap();
        let client = rustls::ClientConfig::builder_with_provider(crypto_provider().unwrap())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        (tls, Arc::new(client))
    }

    #[test]
    fn pem_files_build_a_capability() {
        let (tls, _) = self_signed(ClientAuth::Need);
        assert_eq!(tls.client_auth(), ClientAuth::Need);
    }

    #[test]
    fn missing_files_are_config_errors() {
        let err = TlsCapability::from_pem_files("/nonexistent/cert.pem", "/nonexistent/key.pem", None, ClientAuth::None, TlsFlags::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::Tls { .. }));
    }

    #[test]
    fn session_cache_keeps_entries_on_take() {
        let cache = TlsSessionCache::new(8);
        assert!(cache.put(b"id".to_vec(), b"state".to_vec()));
        assert_eq!(cache.take(b"id"), Some(b"state".to_vec()));
        assert_eq!(cache.get(b"id"), Some(b"state".to_vec()));
    }

    #[test]
    fn capability_reports_client_auth() {
        let tls = dummy_capability(ClientAuth::Want);
        assert_eq!(tls.client_auth(), ClientAuth::Want);
        assert!(Arc::ptr_eq(&tls.server_config(), &tls.server_config()));
    }
}
