//! End-to-end tests for the impersonation proxy: a real TLS listener in
//! front of a fake upstream API server, with the upstream reviews mocked
//! through the construction seams.

pub(crate) mod support;
