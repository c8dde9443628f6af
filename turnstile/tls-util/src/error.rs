use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that can occur when parsing a certificate chain or a private key
/// from PEM bytes.
#[derive(Error, Debug)]
pub enum FromPemError {
    #[error("failed to parse PEM data: {0}")]
    ParseError(#[source] io::Error),
    #[error("no certificate was found in the PEM data")]
    NoCertFound,
    #[error("no private key was found in the PEM data")]
    NoKeyFound,
    #[error("multiple private keys were found in the PEM data")]
    MultipleKeysFound,
}

/// Errors that can occur when reading current material from a certificate
/// or CA bundle provider.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("failed to read `{path}`: {error}")]
    ReadError {
        #[source]
        error: io::Error,
        path: PathBuf,
    },
    #[error("no certificate material has been published yet")]
    Empty,
}
