use rustls::RootCertStore;

/// Builds a [`RootCertStore`] from the union of the given PEM bundles.
///
/// Parsing is best-effort, see [`RootCertStore::add_parsable_certificates`].
/// Invalid entries are logged and skipped, so one bad bundle cannot take
/// down the other trust root. Empty bundles are allowed and contribute
/// nothing.
pub fn union_root_store<'a, I>(bundles: I) -> RootCertStore
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut root_store = RootCertStore::empty();

    for bundle in bundles {
        if bundle.is_empty() {
            continue;
        }

        let mut reader = bundle;
        let certs = rustls_pemfile::certs(&mut reader).filter_map(|result| {
            result
                .inspect_err(|error| {
                    tracing::error!(
                        %error,
                        "Failed to parse a PEM entry when building a root cert store.",
                    )
                })
                .ok()
        });

        let (added, ignored) = root_store.add_parsable_certificates(certs);

        if ignored > 0 {
            tracing::warn!(
                added,
                "Ignored {ignored} invalid certificate(s) when building a root cert store."
            );
        }
    }

    root_store
}
