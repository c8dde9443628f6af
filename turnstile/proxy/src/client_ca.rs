use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{runtime::watcher, Api};
use tokio_util::sync::CancellationToken;
use turnstile_tls_util::StaticCaProvider;

const CLIENT_CA_NAMESPACE: &str = "kube-system";
const CLIENT_CA_CONFIGMAP: &str = "extension-apiserver-authentication";
const CLIENT_CA_KEY: &str = "client-ca-file";

/// Keeps `provider` in sync with the upstream cluster's client-CA bundle.
///
/// The bundle lives in the `extension-apiserver-authentication` ConfigMap
/// and rotates with the cluster; the watch keeps the union verifier current
/// without restarts. Startup does not wait for the first observation, an
/// absent ConfigMap simply leaves this side of the union empty.
pub(crate) fn spawn_watch(
    client: kube::Client,
    provider: Arc<StaticCaProvider>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown.cancelled() => {}
            _ = watch(client, provider) => {}
        }
    });
}

async fn watch(client: kube::Client, provider: Arc<StaticCaProvider>) {
    let api: Api<ConfigMap> = Api::namespaced(client, CLIENT_CA_NAMESPACE);
    let config =
        watcher::Config::default().fields(&format!("metadata.name={CLIENT_CA_CONFIGMAP}"));

    let mut stream = std::pin::pin!(watcher(api, config));
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Apply(config_map) | watcher::Event::InitApply(config_map)) => {
                let bundle = config_map
                    .data
                    .as_ref()
                    .and_then(|data| data.get(CLIENT_CA_KEY))
                    .map(|pem| pem.clone().into_bytes())
                    .unwrap_or_default();

                tracing::debug!(
                    bytes = bundle.len(),
                    "Observed the upstream client CA bundle.",
                );
                provider.set(bundle);
            }
            Ok(watcher::Event::Delete(..)) => {
                tracing::warn!("The upstream client CA ConfigMap was deleted.");
                provider.set(Vec::new());
            }
            Ok(watcher::Event::Init | watcher::Event::InitDone) => {}
            Err(error) => {
                tracing::warn!(%error, "Upstream client CA watch failed, retrying.");
            }
        }
    }
}
