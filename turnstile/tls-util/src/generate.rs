use rcgen::{
    BasicConstraints, CertificateParams, CertifiedKey, DnType, DnValue, Error,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

use crate::providers::CertAndKeyPem;

/// Generates a new self-signed CA [`CertifiedKey`] with a random [`KeyPair`].
pub fn generate_ca(name: &str) -> Result<CertifiedKey, Error> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(Vec::new())?;
    params
        .distinguished_name
        .push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign];

    let cert = params.self_signed(&key_pair)?;

    Ok(CertifiedKey { cert, key_pair })
}

/// Generates a serving certificate for the given DNS name or IP address,
/// signed by `issuer`.
pub fn generate_server_cert(name: &str, issuer: &CertifiedKey) -> Result<CertifiedKey, Error> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(vec![name.to_string()])?;
    params
        .distinguished_name
        .push(DnType::CommonName, DnValue::Utf8String(name.to_string()));
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let cert = params.signed_by(&key_pair, &issuer.cert, &issuer.key_pair)?;

    Ok(CertifiedKey { cert, key_pair })
}

/// Generates a client certificate encoding a Kubernetes-style identity,
/// signed by `issuer`.
///
/// The user name goes into the subject CN and each group becomes an O entry,
/// which is the convention the API server's client-cert authenticator uses.
pub fn generate_client_cert(
    user: &str,
    groups: &[&str],
    issuer: &CertifiedKey,
) -> Result<CertifiedKey, Error> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(Vec::new())?;
    params
        .distinguished_name
        .push(DnType::CommonName, DnValue::Utf8String(user.to_string()));
    for group in groups {
        params.distinguished_name.push(
            DnType::OrganizationName,
            DnValue::Utf8String(group.to_string()),
        );
    }
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let cert = params.signed_by(&key_pair, &issuer.cert, &issuer.key_pair)?;

    Ok(CertifiedKey { cert, key_pair })
}

/// Serializes the given [`CertifiedKey`] into the PEM pair consumed by
/// [`ServingCertProvider`](crate::ServingCertProvider) implementations.
pub fn cert_and_key_pem(certified: &CertifiedKey) -> CertAndKeyPem {
    CertAndKeyPem {
        cert: certified.cert.pem().into_bytes(),
        key: certified.key_pair.serialize_pem().into_bytes(),
    }
}
