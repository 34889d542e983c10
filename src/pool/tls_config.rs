//! Shared TLS configuration, immutable after setup.
//!
//! One [`TlsContext`] is built per pool and shared by every connection
//! through the `Arc`-based rustls configs. The same identity (certificate
//! plus private key) serves both roles: it is presented as the server
//! certificate on accepted connections and as the client certificate on
//! outbound ones when the peer asks for it.

use crate::config::{get_namespaced_bool, get_namespaced_string};
use crate::error::Error;
use ::config::Config;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

/// Refcounted TLS settings shared by all connections of a pool.
#[derive(Clone)]
pub struct TlsContext {
    server: Option<Arc<ServerConfig>>,
    client: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsContext {
    /// Builds a context from configuration keys.
    ///
    /// `tls_ca_cert` is required and verifies the peer in both directions.
    /// `tls_cert`/`tls_key` provide the local identity; without them the
    /// pool can only originate connections, not accept them. Keys follow
    /// the usual `{name}.{key}` namespacing.
    pub fn from_config(config: &Config, name: &str) -> Result<Self, Error> {
        let ca_path = get_namespaced_string(config, name, "tls_ca_cert")
            .map_err(|_| Error::TlsContextMissing)?;

        let identity = match (
            get_namespaced_string(config, name, "tls_cert"),
            get_namespaced_string(config, name, "tls_key"),
        ) {
            (Ok(cert_path), Ok(key_path)) => Some((
                load_certs(&cert_path)?,
                load_private_key(&key_path)?,
            )),
            _ => None,
        };

        let require_client_auth =
            get_namespaced_bool(config, name, "tls_require_client_auth").unwrap_or(false);

        let server_name = get_namespaced_string(config, name, "tls_server_name")
            .unwrap_or_else(|_| "localhost".to_string());

        Self::from_parts(identity, load_certs(&ca_path)?, require_client_auth, &server_name)
    }

    /// Builds a context from in-memory certificate material.
    pub fn from_parts(
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
        ca_certs: Vec<CertificateDer<'static>>,
        require_client_auth: bool,
        server_name: &str,
    ) -> Result<Self, Error> {
        if ca_certs.is_empty() {
            return Err(Error::TlsInvalidCertificate(
                "No CA certificates provided".to_string(),
            ));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| Error::TlsInvalidCertificate(e.to_string()))?;
        }
        let roots = Arc::new(roots);

        let server = match &identity {
            Some((chain, key)) => {
                let builder = ServerConfig::builder();
                let builder = if require_client_auth {
                    let verifier = WebPkiClientVerifier::builder(roots.clone())
                        .build()
                        .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
                    builder.with_client_cert_verifier(verifier)
                } else {
                    builder.with_no_client_auth()
                };
                let config = builder
                    .with_single_cert(chain.clone(), key.clone_key())
                    .map_err(|e| Error::TlsConfigBuild(e.to_string()))?;
                Some(Arc::new(config))
            }
            None => None,
        };

        let client_builder = ClientConfig::builder().with_root_certificates(roots);
        let client = match identity {
            Some((chain, key)) => client_builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| Error::TlsConfigBuild(e.to_string()))?,
            None => client_builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::TlsInvalidServerName(server_name.to_string()))?;

        Ok(Self {
            server,
            client: Arc::new(client),
            server_name,
        })
    }

    pub(crate) fn server_config(&self) -> Result<Arc<ServerConfig>, Error> {
        self.server.clone().ok_or(Error::TlsServerIdentityMissing)
    }

    pub(crate) fn client_config(&self) -> Arc<ClientConfig> {
        self.client.clone()
    }

    pub(crate) fn server_name(&self) -> ServerName<'static> {
        self.server_name.clone()
    }

    /// Whether the context carries a local identity for the server role.
    pub fn has_server_identity(&self) -> bool {
        self.server.is_some()
    }
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsCertificateLoad {
        path: path.to_string(),
        source: e,
    })?;
    let chain: Vec<CertificateDer> = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::TlsInvalidCertificate(format!("Failed to parse certificates: {e}")))?;
    if chain.is_empty() {
        return Err(Error::TlsInvalidCertificate(
            "No certificates found in file".to_string(),
        ));
    }
    Ok(chain)
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = File::open(path).map_err(|e| Error::TlsKeyLoad {
        path: path.to_string(),
        source: e,
    })?;
    private_key(&mut BufReader::new(file))
        .map_err(|e| Error::TlsInvalidKey(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| Error::TlsInvalidKey("No private key found in file".to_string()))
}
