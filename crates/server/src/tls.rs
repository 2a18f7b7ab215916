use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::TlsAcceptor;

/// Where a generated self-signed certificate is published for clients to
/// pin (`talkwire-client --tls-cert`).
const SELF_SIGNED_PEM_PATH: &str = "/tmp/talkwire-server-cert.pem";

/// A ready TLS acceptor plus the PEM file clients can pin against.
pub struct TlsSetup {
    pub acceptor: TlsAcceptor,
    pub cert_pem_path: PathBuf,
}

/// Build the server TLS stack. With both paths configured the certificate
/// chain and key are loaded from disk; otherwise a self-signed certificate
/// is generated and its PEM written to a well-known path for pinning.
pub fn setup(cert_path: Option<&str>, key_path: Option<&str>) -> Result<TlsSetup> {
    let (certs, key, cert_pem_path) = match (cert_path, key_path) {
        (Some(cert), Some(key)) => {
            let certs = read_cert_chain(Path::new(cert))?;
            let key = read_private_key(Path::new(key))?;
            tracing::info!("Loaded TLS certificate from {cert}");
            (certs, key, PathBuf::from(cert))
        }
        _ => {
            let (certs, key) = self_signed(&["localhost".to_string()])?;
            let pem_path = PathBuf::from(SELF_SIGNED_PEM_PATH);
            publish_pem(&pem_path, &certs[0])?;
            tracing::info!(
                "Generated self-signed TLS certificate, PEM at {}",
                pem_path.display()
            );
            (certs, key, pem_path)
        }
    };

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(TlsSetup {
        acceptor: TlsAcceptor::from(Arc::new(config)),
        cert_pem_path,
    })
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read TLS cert: {}", path.display()))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .context("Failed to parse TLS certificate PEM")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read TLS key: {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .context("Failed to parse TLS private key PEM")?
        .with_context(|| format!("No private key found in {}", path.display()))
}

/// Self-signed certificate for the given hostnames, always including the
/// v4 and v6 loopback addresses so local clients verify.
fn self_signed(
    hostnames: &[String],
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::new(hostnames.to_vec())
        .context("Failed to create certificate params")?;
    params.subject_alt_names.push(SanType::IpAddress(
        std::net::Ipv4Addr::LOCALHOST.into(),
    ));
    params.subject_alt_names.push(SanType::IpAddress(
        std::net::Ipv6Addr::LOCALHOST.into(),
    ));

    let key_pair = KeyPair::generate().context("Failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("Failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert_der], key_der))
}

fn publish_pem(path: &Path, cert: &CertificateDer<'static>) -> Result<()> {
    let pem = pem::encode(&pem::Pem::new("CERTIFICATE", cert.to_vec()));
    std::fs::write(path, pem.as_bytes())
        .with_context(|| format!("Failed to write cert PEM to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_cert_parses_back_from_pem() {
        let (certs, _key) = self_signed(&["localhost".to_string()]).unwrap();
        assert_eq!(certs.len(), 1);

        let dir = std::env::temp_dir().join(format!("talkwire-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cert.pem");
        publish_pem(&path, &certs[0]).unwrap();

        let reparsed = read_cert_chain(&path).unwrap();
        assert_eq!(reparsed[0], certs[0]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_cert_file_is_an_error() {
        assert!(read_cert_chain(Path::new("/nonexistent/cert.pem")).is_err());
    }

    #[test]
    fn key_file_without_a_key_is_an_error() {
        let dir = std::env::temp_dir().join(format!("talkwire-tls-nokey-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.pem");
        std::fs::write(&path, "").unwrap();

        assert!(read_private_key(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
