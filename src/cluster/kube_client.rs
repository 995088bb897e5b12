//! kube-rs backed [`ClusterClient`]

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{
    ClusterClient, ClusterError, ClusterObject, ContainerState, LabelQuery, ObjectKind, ObjectRef,
    PodObservation,
};

/// Interval between checks while a replaced Job terminates
const GONE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Cluster client talking to a real API server within one namespace
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    /// Create a client scoped to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api(&self, kind: ObjectKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource(kind))
    }

    /// Poll until a deleted object has left the API server
    ///
    /// The caller's call timeout bounds the wait.
    async fn wait_gone(
        &self,
        api: &Api<DynamicObject>,
        object: &ClusterObject,
    ) -> Result<(), ClusterError> {
        poll_until_gone(GONE_POLL_INTERVAL, || async {
            let present = api
                .get_opt(&object.name)
                .await
                .map_err(|e| map_err(object.kind, &object.name, e))?
                .is_some();
            if present {
                debug!(kind = %object.kind, name = %object.name, "waiting for old object to terminate");
            }
            Ok(present)
        })
        .await
    }

    fn decode(object: &ClusterObject) -> Result<DynamicObject, ClusterError> {
        serde_json::from_value(object.body.clone()).map_err(|e| ClusterError::Api {
            code: 400,
            message: format!("invalid {} manifest '{}': {}", object.kind, object.name, e),
        })
    }
}

fn api_resource(kind: ObjectKind) -> ApiResource {
    match kind {
        ObjectKind::Deployment => ApiResource::erase::<Deployment>(&()),
        ObjectKind::Service => ApiResource::erase::<Service>(&()),
        ObjectKind::Job => ApiResource::erase::<Job>(&()),
        ObjectKind::CronJob => ApiResource::erase::<CronJob>(&()),
    }
}

/// Call `present` every `interval` until it reports the object gone
async fn poll_until_gone<F, Fut>(interval: Duration, mut present: F) -> Result<(), ClusterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ClusterError>>,
{
    while present().await? {
        tokio::time::sleep(interval).await;
    }
    Ok(())
}

/// Map a kube error onto the orchestrator's conflict / not-found distinction
fn map_err(kind: ObjectKind, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ae) => ClusterError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => ClusterError::Kube(other),
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        let obj = Self::decode(object)?;
        self.api(object.kind)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(object.kind, &object.name, e))?;
        debug!(kind = %object.kind, name = %object.name, "created");
        Ok(())
    }

    async fn replace(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        let api = self.api(object.kind);

        if object.kind == ObjectKind::Job {
            // Job pod templates are immutable; replacing means recreating.
            api.delete(&object.name, &DeleteParams::background())
                .await
                .map_err(|e| map_err(object.kind, &object.name, e))?;
            self.wait_gone(&api, object).await?;
            return self.create(object).await;
        }

        let current = api
            .get(&object.name)
            .await
            .map_err(|e| map_err(object.kind, &object.name, e))?;

        let mut obj = Self::decode(object)?;
        obj.metadata.resource_version = current.metadata.resource_version.clone();

        if object.kind == ObjectKind::Service {
            // clusterIP is allocated by the server and immutable
            if let (Some(ip), Some(spec)) = (
                current.data.pointer("/spec/clusterIP").cloned(),
                obj.data.get_mut("spec").and_then(|s| s.as_object_mut()),
            ) {
                spec.insert("clusterIP".to_string(), ip);
            }
        }

        api.replace(&object.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(object.kind, &object.name, e))?;
        debug!(kind = %object.kind, name = %object.name, "replaced");
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        self.api(kind)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_err(kind, name, e))?;
        debug!(kind = %kind, name = %name, "deleted");
        Ok(())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        query: &LabelQuery,
    ) -> Result<Vec<ObjectRef>, ClusterError> {
        let params = ListParams::default().labels(&query.to_selector());
        let list = self
            .api(kind)
            .list(&params)
            .await
            .map_err(|e| map_err(kind, "<list>", e))?;

        Ok(list
            .items
            .into_iter()
            .map(|obj| ObjectRef {
                kind,
                name: obj.name_any(),
                labels: obj.labels().clone(),
            })
            .collect())
    }

    async fn list_pods(&self, query: &LabelQuery) -> Result<Vec<PodObservation>, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = ListParams::default().labels(&query.to_selector());
        let pods = api.list(&params).await.map_err(|e| match e {
            kube::Error::Api(ae) => ClusterError::Api {
                code: ae.code,
                message: ae.message,
            },
            other => ClusterError::Kube(other),
        })?;

        Ok(pods.items.into_iter().map(observe_pod).collect())
    }
}

fn observe_pod(pod: Pod) -> PodObservation {
    let name = pod.name_any();
    let labels = pod.labels().clone();
    let status = pod.status.unwrap_or_default();

    let containers = status
        .container_statuses
        .unwrap_or_default()
        .into_iter()
        .filter_map(|cs| {
            let state = cs.state?;
            if state.running.is_some() {
                Some(ContainerState::Running)
            } else if let Some(waiting) = state.waiting {
                Some(ContainerState::Waiting {
                    reason: waiting.reason,
                })
            } else {
                state.terminated.map(|t| ContainerState::Terminated {
                    exit_code: t.exit_code,
                })
            }
        })
        .collect();

    PodObservation {
        name,
        phase: status.phase,
        labels,
        containers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState as K8sState, ContainerStateRunning, ContainerStateTerminated,
        ContainerStateWaiting, ContainerStatus, PodStatus,
    };

    fn status(state: K8sState) -> ContainerStatus {
        ContainerStatus {
            name: "main".to_string(),
            state: Some(state),
            ..Default::default()
        }
    }

    #[test]
    fn observe_pod_maps_container_states() {
        let pod = Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("cam-porch-abc".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: Some(vec![
                    status(K8sState {
                        running: Some(ContainerStateRunning::default()),
                        ..Default::default()
                    }),
                    status(K8sState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("CrashLoopBackOff".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    status(K8sState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 137,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let obs = observe_pod(pod);
        assert_eq!(obs.name, "cam-porch-abc");
        assert_eq!(obs.phase.as_deref(), Some("Running"));
        assert_eq!(
            obs.containers,
            vec![
                ContainerState::Running,
                ContainerState::Waiting {
                    reason: Some("CrashLoopBackOff".to_string())
                },
                ContainerState::Terminated { exit_code: 137 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_job_is_awaited_until_gone() {
        let mut checks = 0;
        let started = tokio::time::Instant::now();
        poll_until_gone(GONE_POLL_INTERVAL, || {
            checks += 1;
            let still_terminating = checks < 4;
            async move { Ok(still_terminating) }
        })
        .await
        .unwrap();

        assert_eq!(checks, 4);
        assert_eq!(started.elapsed(), GONE_POLL_INTERVAL * 3);
    }

    #[tokio::test]
    async fn gone_check_errors_propagate() {
        let err = poll_until_gone(GONE_POLL_INTERVAL, || async {
            Err(ClusterError::Api {
                code: 403,
                message: "forbidden".to_string(),
            })
        })
        .await
        .unwrap_err();
        assert!(!err.is_not_found());
    }

    #[test]
    fn observe_pod_without_status() {
        let obs = observe_pod(Pod::default());
        assert!(obs.phase.is_none());
        assert!(obs.containers.is_empty());
    }

    #[test]
    fn api_resources_point_at_native_groups() {
        assert_eq!(api_resource(ObjectKind::Deployment).api_version, "apps/v1");
        assert_eq!(api_resource(ObjectKind::Service).api_version, "v1");
        assert_eq!(api_resource(ObjectKind::CronJob).plural, "cronjobs");
    }
}
