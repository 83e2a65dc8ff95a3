//! TLS material for web listeners.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::ServerConfig;
use tracing::info;

use crate::error::GatewayError;
use crate::proxy::TlsPolicy;

/// Load the certificate chain and key named by `policy` into a server
/// config offering `h2` and `http/1.1`.
pub fn load_server_config(policy: &TlsPolicy) -> Result<Arc<ServerConfig>, GatewayError> {
    let cert_file = File::open(&policy.cert_file).map_err(|e| {
        GatewayError::Tls(format!(
            "failed to open certificate file {}: {}",
            policy.cert_file, e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::Tls(format!("failed to parse certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(GatewayError::Tls(format!(
            "no certificates found in {}",
            policy.cert_file
        )));
    }

    let key_file = File::open(&policy.key_file).map_err(|e| {
        GatewayError::Tls(format!("failed to open key file {}: {}", policy.key_file, e))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| GatewayError::Tls(format!("failed to parse private key: {}", e)))?
        .ok_or_else(|| {
            GatewayError::Tls(format!("no private key found in {}", policy.key_file))
        })?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| GatewayError::Tls(format!("unsupported protocol versions: {}", e)))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| GatewayError::Tls(format!("invalid certificate or key: {}", e)))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(
        cert_file = %policy.cert_file,
        domains = policy.domains.len(),
        "TLS certificate loaded"
    );
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(cert_file: String, key_file: String) -> TlsPolicy {
        TlsPolicy {
            enabled: true,
            cert_file,
            key_file,
            domains: vec!["secure.example.com".to_string()],
        }
    }

    #[test]
    fn test_loads_self_signed_pair() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["secure.example.com".into()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let config = load_server_config(&policy(
            cert_path.display().to_string(),
            key_path.display().to_string(),
        ))
        .unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_missing_files_are_tls_errors() {
        let err = load_server_config(&policy(
            "/nonexistent/cert.pem".to_string(),
            "/nonexistent/key.pem".to_string(),
        ))
        .unwrap_err();
        assert_eq!(err.reason_code(), "tls_config_failed");
    }

    #[test]
    fn test_key_file_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["secure.example.com".into()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();

        // The certificate file has no private key in it.
        let err = load_server_config(&policy(
            cert_path.display().to_string(),
            cert_path.display().to_string(),
        ))
        .unwrap_err();
        assert!(matches!(err, GatewayError::Tls(_)));
    }
}
