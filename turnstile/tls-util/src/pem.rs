use std::ops::Not;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::Item;

use crate::error::FromPemError;

/// Parses a certificate chain from the given PEM bytes.
///
/// 1. PEM items of other types are ignored.
/// 2. At least one certificate is required.
/// 3. Certificates are not verified in any way.
pub fn parse_cert_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, FromPemError> {
    let mut reader = pem;
    let cert_chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>();

    match cert_chain {
        Ok(cert_chain) if cert_chain.is_empty().not() => Ok(cert_chain),
        Ok(..) => Err(FromPemError::NoCertFound),
        Err(error) => Err(FromPemError::ParseError(error)),
    }
}

/// Parses a private key from the given PEM bytes.
///
/// 1. PEM items of other types are ignored.
/// 2. Exactly one private key is required.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, FromPemError> {
    let mut reader = pem;
    let mut found_key = None;

    for entry in rustls_pemfile::read_all(&mut reader) {
        let key = match entry {
            Ok(Item::Pkcs1Key(key)) => PrivateKeyDer::Pkcs1(key),
            Ok(Item::Pkcs8Key(key)) => PrivateKeyDer::Pkcs8(key),
            Ok(Item::Sec1Key(key)) => PrivateKeyDer::Sec1(key),
            Ok(..) => continue,
            Err(error) => return Err(FromPemError::ParseError(error)),
        };

        if found_key.replace(key).is_some() {
            return Err(FromPemError::MultipleKeysFound);
        }
    }

    found_key.ok_or(FromPemError::NoKeyFound)
}
