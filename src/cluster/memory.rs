//! In-memory cluster
//!
//! Behaves like an API server for the subset of semantics the orchestrator
//! relies on: names are unique per kind (create conflicts), delete of a
//! missing object is not-found, label selectors filter lists, and deleting a
//! workload controller takes its pods with it. Tests drive pod state
//! explicitly and can inject one-shot failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ClusterClient, ClusterError, ClusterObject, ContainerState, LabelQuery, ObjectKind, ObjectRef,
    PodObservation,
};

/// Operation an injected failure applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// `create`
    Create,
    /// `replace`
    Replace,
    /// `delete`
    Delete,
    /// `list`
    List,
    /// `list_pods`
    ListPods,
}

/// Failure to return from the next matching call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InjectedError {
    /// API server rejection with this status code
    Api(u16),
    /// Call timeout
    Timeout,
}

impl InjectedError {
    fn into_error(self) -> ClusterError {
        match self {
            InjectedError::Api(code) => ClusterError::Api {
                code,
                message: "injected failure".to_string(),
            },
            InjectedError::Timeout => ClusterError::Timeout,
        }
    }
}

struct Injection {
    op: Op,
    kind: Option<ObjectKind>,
    error: InjectedError,
}

struct StoredPod {
    owner: (ObjectKind, String),
    observation: PodObservation,
}

/// Cluster state held in memory
#[derive(Default)]
pub struct InMemoryCluster {
    objects: Mutex<BTreeMap<(ObjectKind, String), ClusterObject>>,
    pods: Mutex<BTreeMap<String, StoredPod>>,
    injections: Mutex<Vec<Injection>>,
    pod_seq: AtomicUsize,
    creates: AtomicUsize,
    replaces: AtomicUsize,
    deletes: AtomicUsize,
}

impl InMemoryCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next matching call fail once
    ///
    /// `kind = None` matches any object kind.
    pub fn fail_next(&self, op: Op, kind: Option<ObjectKind>, error: InjectedError) {
        self.injections.lock().push(Injection { op, kind, error });
    }

    fn take_injection(&self, op: Op, kind: Option<ObjectKind>) -> Option<ClusterError> {
        let mut injections = self.injections.lock();
        let idx = injections
            .iter()
            .position(|i| i.op == op && (i.kind.is_none() || kind.is_none() || i.kind == kind))?;
        Some(injections.remove(idx).error.into_error())
    }

    /// Put an object directly, bypassing create semantics
    pub fn insert_object(&self, object: ClusterObject) {
        self.objects
            .lock()
            .insert((object.kind, object.name.clone()), object);
    }

    /// Fetch a stored object
    pub fn get(&self, kind: ObjectKind, name: &str) -> Option<ClusterObject> {
        self.objects.lock().get(&(kind, name.to_string())).cloned()
    }

    /// Whether an object exists
    pub fn contains(&self, kind: ObjectKind, name: &str) -> bool {
        self.objects.lock().contains_key(&(kind, name.to_string()))
    }

    /// All stored objects
    pub fn objects(&self) -> Vec<ClusterObject> {
        self.objects.lock().values().cloned().collect()
    }

    /// Number of stored objects of one kind
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.objects.lock().keys().filter(|(k, _)| *k == kind).count()
    }

    /// Successful create calls so far
    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Successful replace calls so far
    pub fn replace_calls(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    /// Successful delete calls so far
    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Schedule a pod for the given controller object
    ///
    /// The pod inherits the controller's pod template labels, the same way the
    /// Deployment/Job controllers label the pods they create. Returns the pod
    /// name, or `None` if the controller does not exist.
    pub fn start_pod(
        &self,
        kind: ObjectKind,
        name: &str,
        phase: &str,
        containers: Vec<ContainerState>,
    ) -> Option<String> {
        let labels = self.get(kind, name)?.template_labels();
        let seq = self.pod_seq.fetch_add(1, Ordering::SeqCst);
        let pod_name = format!("{name}-{seq:05}");
        self.pods.lock().insert(
            pod_name.clone(),
            StoredPod {
                owner: (kind, name.to_string()),
                observation: PodObservation {
                    name: pod_name.clone(),
                    phase: Some(phase.to_string()),
                    labels,
                    containers,
                },
            },
        );
        Some(pod_name)
    }

    /// Overwrite the observed state of an existing pod
    pub fn set_pod_state(&self, pod: &str, phase: &str, containers: Vec<ContainerState>) -> bool {
        match self.pods.lock().get_mut(pod) {
            Some(stored) => {
                stored.observation.phase = Some(phase.to_string());
                stored.observation.containers = containers;
                true
            }
            None => false,
        }
    }

    /// Drop a controller's pods without touching the controller
    ///
    /// Simulates node failure, OOM-kill or eviction.
    pub fn kill_pods(&self, kind: ObjectKind, name: &str) -> usize {
        let mut pods = self.pods.lock();
        let before = pods.len();
        pods.retain(|_, p| p.owner != (kind, name.to_string()));
        before - pods.len()
    }

    /// Number of pods currently present
    pub fn pod_count(&self) -> usize {
        self.pods.lock().len()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        if let Some(err) = self.take_injection(Op::Create, Some(object.kind)) {
            return Err(err);
        }
        let mut objects = self.objects.lock();
        let key = (object.kind, object.name.clone());
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: object.kind,
                name: object.name.clone(),
            });
        }
        objects.insert(key, object.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(&self, object: &ClusterObject) -> Result<(), ClusterError> {
        if let Some(err) = self.take_injection(Op::Replace, Some(object.kind)) {
            return Err(err);
        }
        let mut objects = self.objects.lock();
        match objects.get_mut(&(object.kind, object.name.clone())) {
            Some(existing) => {
                *existing = object.clone();
                self.replaces.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ClusterError::NotFound {
                kind: object.kind,
                name: object.name.clone(),
            }),
        }
    }

    async fn delete(&self, kind: ObjectKind, name: &str) -> Result<(), ClusterError> {
        if let Some(err) = self.take_injection(Op::Delete, Some(kind)) {
            return Err(err);
        }
        let removed = self.objects.lock().remove(&(kind, name.to_string()));
        if removed.is_none() {
            return Err(ClusterError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        if kind != ObjectKind::Service {
            self.kill_pods(kind, name);
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(
        &self,
        kind: ObjectKind,
        query: &LabelQuery,
    ) -> Result<Vec<ObjectRef>, ClusterError> {
        if let Some(err) = self.take_injection(Op::List, Some(kind)) {
            return Err(err);
        }
        Ok(self
            .objects
            .lock()
            .values()
            .filter(|o| o.kind == kind)
            .filter_map(|o| {
                let labels = o.labels();
                query.matches(&labels).then(|| ObjectRef {
                    kind,
                    name: o.name.clone(),
                    labels,
                })
            })
            .collect())
    }

    async fn list_pods(&self, query: &LabelQuery) -> Result<Vec<PodObservation>, ClusterError> {
        if let Some(err) = self.take_injection(Op::ListPods, None) {
            return Err(err);
        }
        Ok(self
            .pods
            .lock()
            .values()
            .filter(|p| query.matches(&p.observation.labels))
            .map(|p| p.observation.clone())
            .collect())
    }
}
