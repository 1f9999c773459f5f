//! TLS options configuration.
//!
//! By default, a `Client` verifies peers against the bundled webpki roots.
//! Verification can be pointed at a custom CA bundle, handed a
//! pre-configured [`rustls::ClientConfig`], or disabled outright for
//! development servers. Client certificates are supplied as an
//! [`Identity`].
//!
//! When `trust_env` is enabled on the client, `SSL_CERT_FILE` and
//! `SSL_CERT_DIR` override the default roots and `SSLKEYLOGFILE` turns on
//! the TLS key log.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::CryptoProvider,
    ClientConfig, DigitallySignedStruct, KeyLogFile, RootCertStore, SignatureScheme,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

use crate::error::Error;

/// How to verify the server's certificate chain.
#[derive(Clone, Debug, Default)]
pub(crate) enum Verify {
    /// Verify against the default roots (webpki, or env overrides).
    #[default]
    Enabled,
    /// Do not verify. Vulnerable to MITM; development use only.
    Disabled,
    /// Verify against a PEM bundle at this path.
    CaBundle(PathBuf),
}

/// A client certificate and private key.
pub struct Identity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Parse a PEM buffer containing a certificate chain and a private key.
    ///
    /// The buffer may contain the certificate(s) and key in any order.
    pub fn from_pem(pem: &[u8]) -> crate::Result<Identity> {
        let certs = rustls_pemfile::certs(&mut io::Cursor::new(pem))
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::builder)?;
        let key = rustls_pemfile::private_key(&mut io::Cursor::new(pem))
            .map_err(Error::builder)?
            .ok_or_else(|| Error::builder("no private key found in PEM"))?;
        if certs.is_empty() {
            return Err(Error::builder("no certificates found in PEM"));
        }
        Ok(Identity { certs, key })
    }

    /// Read a certificate chain and private key from two PEM files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> crate::Result<Identity> {
        let mut pem = fs::read(cert_path.as_ref()).map_err(Error::builder)?;
        pem.push(b'\n');
        pem.extend(fs::read(key_path.as_ref()).map_err(Error::builder)?);
        Identity::from_pem(&pem)
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Identity {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Identity").finish()
    }
}

/// Assembled TLS settings for a client.
#[derive(Clone, Debug, Default)]
pub(crate) struct TlsConfig {
    pub(crate) verify: Verify,
    pub(crate) identity: Option<Identity>,
    pub(crate) preconfigured: Option<Arc<ClientConfig>>,
    pub(crate) trust_env: bool,
    pub(crate) http2: bool,
}

impl TlsConfig {
    /// Build the rustls client configuration, with the ALPN offer derived
    /// from whether HTTP/2 is enabled.
    pub(crate) fn build(&self) -> crate::Result<Arc<ClientConfig>> {
        let mut config = match &self.preconfigured {
            Some(config) => ClientConfig::clone(config),
            None => self.assemble()?,
        };

        config.alpn_protocols = if self.http2 {
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        } else {
            vec![b"http/1.1".to_vec()]
        };

        if self.trust_env {
            // KeyLogFile is inert unless SSLKEYLOGFILE is set.
            config.key_log = Arc::new(KeyLogFile::new());
        }

        Ok(Arc::new(config))
    }

    fn assemble(&self) -> crate::Result<ClientConfig> {
        let builder = ClientConfig::builder();

        let config = match &self.verify {
            Verify::Disabled => {
                let provider = Arc::new(rustls::crypto::ring::default_provider());
                let builder = builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)));
                match &self.identity {
                    Some(identity) => builder
                        .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
                        .map_err(Error::builder)?,
                    None => builder.with_no_client_auth(),
                }
            }
            verify => {
                let roots = self.load_roots(verify)?;
                let builder = builder.with_root_certificates(roots);
                match &self.identity {
                    Some(identity) => builder
                        .with_client_auth_cert(identity.certs.clone(), identity.key.clone_key())
                        .map_err(Error::builder)?,
                    None => builder.with_no_client_auth(),
                }
            }
        };

        Ok(config)
    }

    fn load_roots(&self, verify: &Verify) -> crate::Result<RootCertStore> {
        if let Verify::CaBundle(path) = verify {
            return load_pem_bundle(path);
        }

        if self.trust_env {
            if let Some(path) = std::env::var_os("SSL_CERT_FILE") {
                return load_pem_bundle(Path::new(&path));
            }
            if let Some(dir) = std::env::var_os("SSL_CERT_DIR") {
                return load_pem_dir(Path::new(&dir));
            }
        }

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Ok(roots)
    }
}

fn load_pem_bundle(path: &Path) -> crate::Result<RootCertStore> {
    let pem = fs::read(path).map_err(|e| {
        Error::builder(format!(
            "could not read TLS CA bundle {}: {e}",
            path.display()
        ))
    })?;
    let mut roots = RootCertStore::empty();
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut io::Cursor::new(pem)) {
        let cert = cert.map_err(Error::builder)?;
        if roots.add(cert).is_ok() {
            added += 1;
        }
    }
    if added == 0 {
        return Err(Error::builder(format!(
            "no usable certificates in CA bundle {}",
            path.display()
        )));
    }
    Ok(roots)
}

fn load_pem_dir(dir: &Path) -> crate::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let entries = fs::read_dir(dir).map_err(Error::builder)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "pem" || ext == "crt") {
            if let Ok(pem) = fs::read(&path) {
                for cert in rustls_pemfile::certs(&mut io::Cursor::new(pem)).flatten() {
                    let _ = roots.add(cert);
                }
            }
        }
    }
    if roots.is_empty() {
        return Err(Error::builder(format!(
            "no usable certificates in SSL_CERT_DIR {}",
            dir.display()
        )));
    }
    Ok(roots)
}

pub(crate) fn server_name(host: &str) -> crate::Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|_| Error::tls(format!("invalid server name: {host}")))
}

/// Accepts any server certificate. Signatures are still checked against the
/// presented (unverified) certificate so gross corruption is rejected.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_offer_follows_http2_toggle() {
        let config = TlsConfig {
            http2: true,
            ..TlsConfig::default()
        };
        let built = config.build().unwrap();
        assert_eq!(built.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let config = TlsConfig {
            http2: false,
            ..TlsConfig::default()
        };
        let built = config.build().unwrap();
        assert_eq!(built.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn disabled_verification_builds() {
        let config = TlsConfig {
            verify: Verify::Disabled,
            http2: true,
            ..TlsConfig::default()
        };
        assert!(config.build().is_ok());
    }

    #[test]
    fn missing_ca_bundle_errors() {
        let config = TlsConfig {
            verify: Verify::CaBundle(PathBuf::from("/definitely/not/here.pem")),
            ..TlsConfig::default()
        };
        let err = config.build().unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn server_name_accepts_dns_and_ip() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("bad name!").is_err());
    }
}
