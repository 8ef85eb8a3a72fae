//! The [`ClusterDriver`] contract.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DriverResult;
use crate::types::*;

/// Pod primitives of the workload platform.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Create the pod. Creating a pod that already exists is success.
    async fn create_pod(&self, req: &PodRequest) -> DriverResult<PodRef>;

    /// Delete the pod. Deleting a missing pod is success.
    async fn delete_pod(&self, pod: &PodRef) -> DriverResult<()>;

    /// Every managed pod currently known to the cluster.
    async fn list_pods(&self) -> DriverResult<Vec<PodObservation>>;

    /// Start a watch. Events arrive on a bounded channel fed by a producer
    /// task; the channel closes when the watch disconnects. Events may be
    /// duplicated across resubscriptions.
    async fn watch(&self) -> DriverResult<mpsc::Receiver<PodLifecycleEvent>>;
}
