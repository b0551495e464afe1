//! rustls client configuration shared by the TLS, QUIC and HTTPS transports.

use ferrous_forward_domain::{DomainError, TlsSettings};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

pub const ALPN_DOT: &[u8] = b"dns";
pub const ALPN_DOQ: &[u8] = b"doq";
pub const ALPN_H3: &[u8] = b"h3";
pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn read_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, DomainError> {
    let file = File::open(path)
        .map_err(|e| DomainError::ConfigError(format!("Failed to open {}: {}", path, e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| DomainError::ConfigError(format!("Invalid PEM in {}: {}", path, e)))
}

fn read_key(path: &str) -> Result<PrivateKeyDer<'static>, DomainError> {
    let file = File::open(path)
        .map_err(|e| DomainError::ConfigError(format!("Failed to open {}: {}", path, e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| DomainError::ConfigError(format!("Invalid PEM in {}: {}", path, e)))?
        .ok_or_else(|| DomainError::ConfigError(format!("No private key in {}", path)))
}

fn root_store(settings: &TlsSettings) -> Result<RootCertStore, DomainError> {
    let mut roots = RootCertStore::empty();
    match &settings.ca_file {
        Some(path) => {
            let (added, _ignored) = roots.add_parsable_certificates(read_certs(path)?);
            if added == 0 {
                return Err(DomainError::ConfigError(format!(
                    "No usable CA certificates in {}",
                    path
                )));
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

/// Builds a client config advertising `alpn`.
pub fn build_client_config(
    settings: &TlsSettings,
    alpn: &[&[u8]],
) -> Result<ClientConfig, DomainError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| DomainError::ConfigError(format!("TLS protocol setup failed: {}", e)))?;

    let builder = if settings.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        builder.with_root_certificates(root_store(settings)?)
    };

    let mut config = match (&settings.client_cert_file, &settings.client_key_file) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .map_err(|e| DomainError::ConfigError(format!("Invalid client certificate: {}", e)))?,
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(DomainError::ConfigError(
                "client-cert-file and client-key-file must be set together".into(),
            ))
        }
    };

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config.resumption = rustls::client::Resumption::in_memory_sessions(64);
    Ok(config)
}

pub fn server_name(name: &str) -> Result<ServerName<'static>, DomainError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| DomainError::ConfigError(format!("Invalid TLS server name '{}': {}", name, e)))
}

/// Accepts any certificate; signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
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
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_given_alpn() {
        let config = build_client_config(&TlsSettings::default(), &[ALPN_DOT]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"dns".to_vec()]);
    }

    #[test]
    fn test_insecure_config_builds() {
        let settings = TlsSettings {
            insecure_skip_verify: true,
            ..TlsSettings::default()
        };
        assert!(build_client_config(&settings, &[ALPN_DOQ]).is_ok());
    }

    #[test]
    fn test_half_client_auth_rejected() {
        let settings = TlsSettings {
            client_cert_file: Some("/tmp/cert.pem".into()),
            ..TlsSettings::default()
        };
        assert!(build_client_config(&settings, &[ALPN_DOT]).is_err());
    }

    #[test]
    fn test_missing_ca_file() {
        let settings = TlsSettings {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..TlsSettings::default()
        };
        assert!(build_client_config(&settings, &[ALPN_DOT]).is_err());
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("dns.google").is_ok());
        assert!(server_name("1.1.1.1").is_ok());
        assert!(server_name("bad name").is_err());
    }
}
