//! TLS utilities shared by turnstile components.
//!
//! The proxy consumes certificate material from rotatable [`providers`],
//! so the parsing helpers in this crate operate on in-memory PEM bytes
//! rather than on files. File access only happens inside the file-backed
//! provider implementations.

mod bundle;
mod error;
mod generate;
mod pem;
mod providers;

pub use bundle::union_root_store;
pub use error::{FromPemError, ProviderError};
pub use generate::{cert_and_key_pem, generate_ca, generate_client_cert, generate_server_cert};
pub use pem::{parse_cert_chain, parse_private_key};
pub use providers::{
    CaBundleProvider, CertAndKeyPem, FileCaProvider, FileCertProvider, ServingCertProvider,
    StaticCaProvider, StaticCertProvider,
};
