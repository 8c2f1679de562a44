//! TLS settings shared by the network providers.
//!
//! One `ssl_mode` string from the configuration drives both the rustls
//! connector handed to deadpool-postgres and the tiberius encryption level.

use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::error::{MigrateError, Result};
use crate::logging::{LogSink, SharedSink};

/// Transport security mode, following libpq's `sslmode` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Plain TCP.
    Disable,
    /// Encrypt without validating the server certificate.
    #[default]
    Require,
    /// Validate the certificate chain.
    VerifyCa,
    /// Validate the certificate chain and host name.
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disable" | "false" => Ok(SslMode::Disable),
            "require" | "" | "true" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(MigrateError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub fn verifies_certificate(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    /// Encryption level for SQL Server connections.
    pub fn mssql_encryption(&self) -> tiberius::EncryptionLevel {
        if self.requires_tls() {
            tiberius::EncryptionLevel::Required
        } else {
            tiberius::EncryptionLevel::NotSupported
        }
    }
}

/// Builds the rustls connector for PostgreSQL.
pub struct TlsBuilder {
    ssl_mode: SslMode,
}

impl TlsBuilder {
    pub fn new(ssl_mode: SslMode) -> Self {
        Self { ssl_mode }
    }

    /// Connector for deadpool-postgres, or `None` when TLS is disabled.
    pub fn build(&self, log: &SharedSink) -> Result<Option<MakeRustlsConnect>> {
        if !self.ssl_mode.requires_tls() {
            log.warn("TLS is disabled; credentials are sent in plaintext");
            return Ok(None);
        }
        Ok(Some(MakeRustlsConnect::new(self.client_config(log))))
    }

    fn client_config(&self, log: &SharedSink) -> ClientConfig {
        if self.ssl_mode.verifies_certificate() {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            log.warn(
                "ssl_mode=require encrypts the connection but does not verify the server \
                 certificate; use verify-full outside trusted networks",
            );
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth()
        }
    }
}

/// Verifier for `ssl_mode=require`: encryption without authentication.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ECDSA_NISTP521_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("REQUIRE").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert!(SslMode::parse("sometimes").is_err());
    }

    #[test]
    fn test_mssql_encryption() {
        assert!(matches!(
            SslMode::Disable.mssql_encryption(),
            tiberius::EncryptionLevel::NotSupported
        ));
        assert!(matches!(
            SslMode::VerifyFull.mssql_encryption(),
            tiberius::EncryptionLevel::Required
        ));
    }

    #[test]
    fn test_builder_warns_when_disabled() {
        let sink = Arc::new(MemorySink::new());
        let log: SharedSink = sink.clone();
        assert!(TlsBuilder::new(SslMode::Disable).build(&log).unwrap().is_none());
        assert!(sink.contains("plaintext"));
    }

    #[test]
    fn test_builder_require_warns_about_verification() {
        let sink = Arc::new(MemorySink::new());
        let log: SharedSink = sink.clone();
        assert!(TlsBuilder::new(SslMode::Require).build(&log).unwrap().is_some());
        assert!(sink.contains("does not verify"));
    }
}
