// Links are encrypted because QUIC requires it, not because peers are
// authenticated: every endpoint serves either a certificate it generated at
// start-up or one loaded from PEM files, and clients accept whatever
// certificate the server presents.

use std::{fs::File, io::BufReader, path::Path, sync::Arc, time::SystemTime};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};

use super::{KEEP_ALIVE, SERVER_NAME};
use crate::error::Error;

/// Generates a throwaway certificate for [`SERVER_NAME`].
pub fn self_signed() -> Result<(Vec<Certificate>, PrivateKey), Error> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
    let der = cert.serialize_der()?;
    let key = cert.serialize_private_key_der();
    Ok((vec![Certificate(der)], PrivateKey(key)))
}

/// Loads a certificate chain and a PKCS#8 (or RSA) private key from PEM
/// files.
pub fn load_pem(
    cert: &Path,
    key: &Path,
) -> Result<(Vec<Certificate>, PrivateKey), Error> {
    let mut reader = BufReader::new(File::open(cert)?);
    let chain = rustls_pemfile::certs(&mut reader)?
        .into_iter()
        .map(Certificate)
        .collect::<Vec<_>>();
    if chain.is_empty() {
        Err(rustls::Error::General(format!(
            "no certificates in {}",
            cert.display()
        )))?
    }

    let mut reader = BufReader::new(File::open(key)?);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
    if keys.is_empty() {
        let mut reader = BufReader::new(File::open(key)?);
        keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
    }
    if keys.len() != 1 {
        Err(rustls::Error::General(format!(
            "expected exactly one private key in {}",
            key.display()
        )))?
    }
    Ok((chain, PrivateKey(keys.remove(0))))
}

/// Shared transport settings. Keep-alives stop a connection from idling out
/// while a long call is outstanding on it.
fn transport_config() -> Arc<quinn::TransportConfig> {
    let mut transport_config = quinn::TransportConfig::default();
    transport_config.keep_alive_interval(Some(KEEP_ALIVE));
    Arc::new(transport_config)
}

pub fn server_config(
    chain: Vec<Certificate>,
    key: PrivateKey,
) -> Result<quinn::ServerConfig, Error> {
    let mut server_config = quinn::ServerConfig::with_single_cert(chain, key)?;
    server_config.transport_config(transport_config());
    Ok(server_config)
}

pub fn client_config() -> quinn::ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(transport_config());
    client_config
}

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
