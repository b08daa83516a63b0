//! Insecure TLS support.
//!
//! Generates a throwaway self-signed certificate at startup so drivers that
//! insist on TLS can connect. Nothing here is suitable for production; the
//! flag exists for compatibility testing only.

use std::sync::Arc;

use rustls::pki_types::PrivateKeyDer;
use tokio_rustls::TlsAcceptor;

pub type TlsError = Box<dyn std::error::Error + Send + Sync>;

pub fn self_signed_acceptor() -> Result<TlsAcceptor, TlsError> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])?;

    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::try_from(certified.key_pair.serialize_der())
        .map_err(|e| -> TlsError { format!("private key: {e}").into() })?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptor_builds() {
        assert!(self_signed_acceptor().is_ok());
    }
}
