//! rustls configuration for the engine: roots from the installed bundle, flag-driven
//! verification, and the optional server identity.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use kmapi_core::{KmError, SslFlags};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use super::EngineSettings;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Parse the PEM bundle handed over at init. Unparsable entries are skipped.
pub(super) fn roots_from_pem(pem: &str) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let mut reader = io::Cursor::new(pem.as_bytes());
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader).filter_map(|c| c.ok()).collect();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        tracing::warn!(added, ignored, "skipped unusable trust anchors");
    }
    roots
}

/// Client config for a connection with `flags`. Any ALLOW_* flag turns certificate
/// verification off entirely; rustls has no partial relaxations.
pub(super) fn client_config(roots: Arc<RootCertStore>, flags: SslFlags) -> Result<ClientConfig, KmError> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|_| KmError::SslError)?;
    let config = if flags.relaxes_verification() {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(config)
}

pub(super) fn server_config(settings: &EngineSettings) -> Result<ServerConfig, KmError> {
    let (chain, key) = settings.identity.as_ref().ok_or(KmError::InvalidState)?;
    ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|_| KmError::SslError)?
        .with_no_client_auth()
        .with_single_cert(chain.clone(), key.clone_key())
        .map_err(|e| {
            tracing::warn!(error = %e, "server identity rejected");
            KmError::SslError
        })
}

/// SNI / verification name: the override if set, else the dialed host.
pub(super) fn server_name(override_name: Option<&str>, host: &str) -> Result<ServerName<'static>, KmError> {
    let name = override_name.unwrap_or(host);
    ServerName::try_from(name.to_string()).map_err(|_| KmError::InvalidParam)
}

/// Certificate chain and private key from PEM files, for server-side handshakes.
pub fn load_identity(
    cert: &Path,
    key: &Path,
) -> io::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader = BufReader::new(File::open(cert)?);
    let chain = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    let mut reader = BufReader::new(File::open(key)?);
    let key = rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key in {}", key.display()),
        )
    })?;
    Ok((chain, key))
}

/// Accepts any server certificate. Only installed when the endpoint asked for it.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bundle_gives_empty_store() {
        assert!(roots_from_pem("").is_empty());
    }

    #[test]
    fn garbage_is_skipped() {
        let pem = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        assert!(roots_from_pem(pem).is_empty());
    }

    #[test]
    fn server_name_prefers_override() {
        let name = server_name(Some("api.example.test"), "10.0.0.1").unwrap();
        assert_eq!(name, ServerName::try_from("api.example.test").unwrap());
        assert!(server_name(None, "10.0.0.1").is_ok());
        assert_eq!(server_name(None, "bad name!"), Err(KmError::InvalidParam));
    }

    #[test]
    fn both_verification_modes_build() {
        let roots = Arc::new(RootCertStore::empty());
        assert!(client_config(roots.clone(), SslFlags::ENABLE).is_ok());
        assert!(client_config(roots, SslFlags::ENABLE | SslFlags::ALLOW_SELF_SIGNED_CERT).is_ok());
    }

    #[test]
    fn server_role_needs_identity() {
        let err = server_config(&EngineSettings::default()).unwrap_err();
        assert_eq!(err, KmError::InvalidState);
    }
}
