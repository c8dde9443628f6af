use std::{fmt, sync::Arc, sync::Mutex};

use rustls::{
    crypto::CryptoProvider,
    pki_types::{CertificateDer, UnixTime},
    server::{
        danger::{ClientCertVerified, ClientCertVerifier},
        ResolvesServerCert, WebPkiClientVerifier,
    },
    sign::CertifiedKey,
    DigitallySignedStruct, DistinguishedName, Error as TlsError, ServerConfig, SignatureScheme,
};
use turnstile_tls_util::{
    parse_cert_chain, parse_private_key, union_root_store, CaBundleProvider, CertAndKeyPem,
    ServingCertProvider,
};

use crate::error::ProxyError;

/// Name of HTTP/2 in the ALPN protocol.
pub(crate) const HTTP_2_ALPN_NAME: &[u8] = b"h2";
/// Name of HTTP/1.1 in the ALPN protocol.
pub(crate) const HTTP_1_1_ALPN_NAME: &[u8] = b"http/1.1";

/// Builds the rustls [`ServerConfig`] for the proxy's listener.
///
/// Both the serving certificate and the client-CA union are resolved on
/// every handshake, so rotation of either provider takes effect without a
/// restart.
pub(crate) fn server_config(
    serving_cert: Arc<dyn ServingCertProvider>,
    signer_ca: Arc<dyn CaBundleProvider>,
    upstream_ca: Arc<dyn CaBundleProvider>,
    crypto: Arc<CryptoProvider>,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let verifier = Arc::new(UnionClientCertVerifier {
        signer_ca,
        upstream_ca,
        crypto: crypto.clone(),
    });
    let resolver = Arc::new(DynamicCertResolver {
        provider: serving_cert,
        crypto: crypto.clone(),
        cached: Mutex::new(None),
    });

    let mut config = ServerConfig::builder_with_provider(crypto)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![HTTP_2_ALPN_NAME.to_vec(), HTTP_1_1_ALPN_NAME.to_vec()];

    Ok(Arc::new(config))
}

/// Serves whatever certificate the provider currently holds.
///
/// The parsed [`CertifiedKey`] is cached and only rebuilt when the PEM bytes
/// change, so steady-state handshakes do not re-parse.
struct DynamicCertResolver {
    provider: Arc<dyn ServingCertProvider>,
    crypto: Arc<CryptoProvider>,
    cached: Mutex<Option<(CertAndKeyPem, Arc<CertifiedKey>)>>,
}

impl DynamicCertResolver {
    fn build(&self, pair: &CertAndKeyPem) -> Result<Arc<CertifiedKey>, TlsError> {
        let cert_chain = parse_cert_chain(&pair.cert)
            .map_err(|error| TlsError::General(error.to_string()))?;
        let key_der = parse_private_key(&pair.key)
            .map_err(|error| TlsError::General(error.to_string()))?;
        let signing_key = self.crypto.key_provider.load_private_key(key_der)?;

        Ok(Arc::new(CertifiedKey::new(cert_chain, signing_key)))
    }
}

impl ResolvesServerCert for DynamicCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        let pair = self
            .provider
            .current()
            .inspect_err(|error| {
                tracing::error!(%error, "No serving certificate is currently available.")
            })
            .ok()?;

        let mut cached = self.cached.lock().expect("lock poisoned");
        if let Some((cached_pair, key)) = cached.as_ref() {
            if *cached_pair == pair {
                return Some(key.clone());
            }
        }

        let key = self
            .build(&pair)
            .inspect_err(|error| {
                tracing::error!(%error, "Current serving certificate failed to parse.")
            })
            .ok()?;
        *cached = Some((pair, key.clone()));

        Some(key)
    }
}

impl fmt::Debug for DynamicCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicCertResolver").finish_non_exhaustive()
    }
}

/// Validates client certificates against the union of the proxy signer CA
/// and the upstream cluster's client CA.
///
/// The union is composed at validation time rather than at startup, so
/// either bundle may rotate underneath us. Clients without a certificate
/// are allowed through and authenticate by other means (or not at all).
struct UnionClientCertVerifier {
    signer_ca: Arc<dyn CaBundleProvider>,
    upstream_ca: Arc<dyn CaBundleProvider>,
    crypto: Arc<CryptoProvider>,
}

impl ClientCertVerifier for UnionClientCertVerifier {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // Hints would have to be re-derived per handshake to stay in sync
        // with the rotating bundles; sending none is always valid.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        let signer_bundle = self.signer_ca.current_bundle();
        let upstream_bundle = self.upstream_ca.current_bundle();
        let roots =
            union_root_store([signer_bundle.as_slice(), upstream_bundle.as_slice()]);

        if roots.is_empty() {
            return Err(TlsError::General(
                "no client CA trust anchors are currently available".to_string(),
            ));
        }

        let verifier = WebPkiClientVerifier::builder_with_provider(roots.into(), self.crypto.clone())
            .build()
            .map_err(|error| TlsError::General(error.to_string()))?;

        verifier.verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.crypto
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl fmt::Debug for UnionClientCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionClientCertVerifier")
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use turnstile_tls_util::{
        cert_and_key_pem, generate_ca, generate_client_cert, StaticCaProvider,
    };

    use super::*;

    fn crypto() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::aws_lc_rs::default_provider())
    }

    fn verify(
        verifier: &UnionClientCertVerifier,
        cert: &rcgen::CertifiedKey,
    ) -> Result<ClientCertVerified, TlsError> {
        let der = cert.cert.der().clone();
        verifier.verify_client_cert(&der, &[], UnixTime::now())
    }

    #[test]
    fn union_accepts_certs_from_either_ca() {
        let signer_ca = generate_ca("signer").unwrap();
        let upstream_ca = generate_ca("upstream").unwrap();
        let third_ca = generate_ca("third").unwrap();

        let verifier = UnionClientCertVerifier {
            signer_ca: Arc::new(StaticCaProvider::new(
                cert_and_key_pem(&signer_ca).cert,
            )),
            upstream_ca: Arc::new(StaticCaProvider::new(
                cert_and_key_pem(&upstream_ca).cert,
            )),
            crypto: crypto(),
        };

        let from_signer = generate_client_cert("alice", &["devs"], &signer_ca).unwrap();
        let from_upstream = generate_client_cert("bob", &[], &upstream_ca).unwrap();
        let from_third = generate_client_cert("mallory", &[], &third_ca).unwrap();

        assert!(verify(&verifier, &from_signer).is_ok());
        assert!(verify(&verifier, &from_upstream).is_ok());
        assert!(verify(&verifier, &from_third).is_err());
    }

    #[test]
    fn rotated_bundle_is_picked_up_without_restart() {
        let old_ca = generate_ca("old").unwrap();
        let new_ca = generate_ca("new").unwrap();

        let signer_provider = Arc::new(StaticCaProvider::new(cert_and_key_pem(&old_ca).cert));
        let verifier = UnionClientCertVerifier {
            signer_ca: signer_provider.clone(),
            upstream_ca: Arc::new(StaticCaProvider::default()),
            crypto: crypto(),
        };

        let client = generate_client_cert("carol", &[], &new_ca).unwrap();
        assert!(verify(&verifier, &client).is_err());

        signer_provider.set(cert_and_key_pem(&new_ca).cert);
        assert!(verify(&verifier, &client).is_ok());
    }

    #[test]
    fn empty_union_rejects_presented_certs() {
        let verifier = UnionClientCertVerifier {
            signer_ca: Arc::new(StaticCaProvider::default()),
            upstream_ca: Arc::new(StaticCaProvider::default()),
            crypto: crypto(),
        };

        let ca = generate_ca("ca").unwrap();
        let client = generate_client_cert("dave", &[], &ca).unwrap();
        assert!(verify(&verifier, &client).is_err());
    }
}
