//! [`ClusterDriver`] over the Kubernetes API.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, PostParams, WatchEvent, WatchParams};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::driver::ClusterDriver;
use crate::error::{DriverError, DriverResult};
use crate::manifest::{build_pod, observe};
use crate::types::*;

pub struct KubeDriver {
    api: Api<Pod>,
    namespace: String,
    channel_capacity: usize,
}

impl KubeDriver {
    /// Connect with the in-cluster or kubeconfig credentials.
    pub async fn connect(namespace: &str, channel_capacity: usize) -> DriverResult<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| DriverError::Client(e.to_string()))?;
        Ok(Self::with_client(client, namespace, channel_capacity))
    }

    pub fn with_client(client: Client, namespace: &str, channel_capacity: usize) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            channel_capacity,
        }
    }

    fn list_params() -> ListParams {
        ListParams::default().labels(&managed_selector())
    }
}

#[async_trait]
impl ClusterDriver for KubeDriver {
    async fn create_pod(&self, req: &PodRequest) -> DriverResult<PodRef> {
        let pod = build_pod(req)?;
        match self.api.create(&PostParams::default(), &pod).await {
            Ok(_) => {
                info!(pod = %req.name, template = %req.template_id, "pod created");
            }
            // A retried create whose first attempt landed.
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                debug!(pod = %req.name, "pod already exists");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(PodRef {
            name: req.name.clone(),
            namespace: self.namespace.clone(),
        })
    }

    async fn delete_pod(&self, pod: &PodRef) -> DriverResult<()> {
        match self.api.delete(&pod.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %pod.name, "pod deleted");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                debug!(pod = %pod.name, "pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pods(&self) -> DriverResult<Vec<PodObservation>> {
        let pods = self.api.list(&Self::list_params()).await?;
        Ok(pods.items.iter().map(observe).collect())
    }

    async fn watch(&self) -> DriverResult<mpsc::Receiver<PodLifecycleEvent>> {
        // Start from the current resource version so the caller's resync
        // covers everything before the watch.
        let listed = self.api.list(&Self::list_params().limit(1)).await?;
        let mut resource_version = listed.metadata.resource_version.unwrap_or_default();

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let api = self.api.clone();
        tokio::spawn(async move {
            let params = WatchParams::default().labels(&managed_selector());
            loop {
                let stream = match api.watch(&params, &resource_version).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(error = %e, "pod watch could not be (re)established");
                        return;
                    }
                };
                let mut stream = stream.boxed();
                loop {
                    let item = match stream.try_next().await {
                        Ok(Some(item)) => item,
                        // Server-side timeout; continue from the last version seen.
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "pod watch stream failed");
                            return;
                        }
                    };
                    let (kind, pod) = match item {
                        WatchEvent::Added(pod) => (PodEventKind::Added, pod),
                        WatchEvent::Modified(pod) => (PodEventKind::Modified, pod),
                        WatchEvent::Deleted(pod) => (PodEventKind::Deleted, pod),
                        WatchEvent::Bookmark(bm) => {
                            resource_version = bm.metadata.resource_version;
                            continue;
                        }
                        WatchEvent::Error(e) => {
                            // 410 Gone and friends: the caller resubscribes and resyncs.
                            warn!(error = ?e, "pod watch returned an error");
                            return;
                        }
                    };
                    if let Some(rv) = pod.metadata.resource_version.clone() {
                        resource_version = rv;
                    }
                    let event = PodLifecycleEvent {
                        kind,
                        pod: observe(&pod),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
