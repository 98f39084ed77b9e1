//! Host trust store extraction and the PEM bundle handed to the engine at init.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----\n";
const PEM_END: &str = "-----END CERTIFICATE-----\n";
const PEM_LINE: usize = 64;

/// Well-known CA bundle locations across Linux distributions (Debian, Fedora, openSUSE, Alpine).
const SYSTEM_BUNDLES: &[&str] = &[
    "/etc/ssl/certs/ca-certificates.crt",
    "/etc/pki/tls/certs/ca-bundle.crt",
    "/etc/ssl/ca-bundle.pem",
    "/etc/pki/tls/cacert.pem",
    "/etc/ssl/cert.pem",
];

/// Source of trusted root certificates, as DER.
pub trait TrustStore: Send + Sync {
    fn load_roots(&self) -> io::Result<Vec<Vec<u8>>>;
}

/// The host's system trust store: the first readable CA bundle file.
#[derive(Debug, Clone)]
pub struct SystemTrustStore {
    paths: Vec<PathBuf>,
}

impl Default for SystemTrustStore {
    fn default() -> Self {
        Self {
            paths: SYSTEM_BUNDLES.iter().map(PathBuf::from).collect(),
        }
    }
}

impl SystemTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one explicit PEM file instead of the system locations.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            paths: vec![path.into()],
        }
    }
}

impl TrustStore for SystemTrustStore {
    fn load_roots(&self) -> io::Result<Vec<Vec<u8>>> {
        for path in &self.paths {
            if !path.exists() {
                continue;
            }
            let mut reader = BufReader::new(File::open(path)?);
            let certs = rustls_pemfile::certs(&mut reader)
                .map(|c| c.map(|der| der.to_vec()))
                .collect::<io::Result<Vec<_>>>()?;
            tracing::debug!(path = %path.display(), count = certs.len(), "loaded trust store");
            return Ok(certs);
        }
        tracing::debug!("no system trust store found");
        Ok(Vec::new())
    }
}

/// Fixed set of roots; also the empty store.
#[derive(Debug, Clone, Default)]
pub struct StaticTrustStore(pub Vec<Vec<u8>>);

impl TrustStore for StaticTrustStore {
    fn load_roots(&self) -> io::Result<Vec<Vec<u8>>> {
        Ok(self.0.clone())
    }
}

/// Concatenated PEM certificates. Zero certificates is the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustBundle {
    pem: String,
    count: usize,
}

impl TrustBundle {
    pub fn from_der<I, C>(certs: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: AsRef<[u8]>,
    {
        let mut bundle = TrustBundle::default();
        for der in certs {
            write_pem(&mut bundle.pem, der.as_ref());
            bundle.count += 1;
        }
        bundle
    }

    /// Build from a store. An unreadable store yields an empty bundle.
    pub fn load(store: &dyn TrustStore) -> Self {
        match store.load_roots() {
            Ok(certs) => Self::from_der(certs),
            Err(e) => {
                tracing::warn!(error = %e, "trust store unreadable, continuing with empty bundle");
                Self::default()
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pem
    }

    pub fn cert_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

fn write_pem(out: &mut String, der: &[u8]) {
    let body = STANDARD.encode(der);
    out.push_str(PEM_BEGIN);
    // base64 output is ASCII, so byte chunks are valid str boundaries
    for line in body.as_bytes().chunks(PEM_LINE) {
        out.push_str(std::str::from_utf8(line).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(PEM_END);
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_store_gives_empty_bundle() {
        let bundle = TrustBundle::load(&StaticTrustStore::default());
        assert!(bundle.is_empty());
        assert_eq!(bundle.as_str(), "");
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let store = SystemTrustStore::with_file("/nonexistent/kmapi/ca.pem");
        assert!(store.load_roots().unwrap().is_empty());
    }

    #[test]
    fn blocks_are_back_to_back() {
        let bundle = TrustBundle::from_der([vec![1u8; 10], vec![2u8; 10]]);
        assert_eq!(bundle.cert_count(), 2);
        assert!(bundle.as_str().contains("-----END CERTIFICATE-----\n-----BEGIN CERTIFICATE-----\n"));
        assert!(bundle.as_str().ends_with(PEM_END));
    }

    proptest! {
        #[test]
        fn pem_lines_wrap_at_64_and_parse_back(ders in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..300), 0..4)) {
            let bundle = TrustBundle::from_der(&ders);
            for line in bundle.as_str().lines() {
                prop_assert!(line.len() <= PEM_LINE || line.starts_with("-----"));
            }
            let mut reader = io::Cursor::new(bundle.as_str().as_bytes());
            let parsed = rustls_pemfile::certs(&mut reader)
                .map(|c| c.map(|d| d.to_vec()))
                .collect::<io::Result<Vec<_>>>()
                .unwrap();
            prop_assert_eq!(parsed, ders);
        }
    }
}
