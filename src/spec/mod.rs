//! Workload spec generation
//!
//! [`SpecGenerator`] turns a [`Workload`] row into the cluster objects that
//! run it. Generation is pure: the same row always renders the same objects,
//! with names from [`naming`] and node pinning from [`placement`].
//!
//! What gets rendered depends on kind and protocol:
//!
//! - long-running kinds get a Deployment fronted by a Service
//! - `agent-task` gets a Job, `cron` a CronJob, neither with a Service
//! - device-bound cameras also get a paired recorder Deployment + Service,
//!   labeled `owned-by=<camera id>` and reading the camera's relay stream

pub mod naming;
pub mod placement;
pub mod protocol;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::{ImageConfig, OrchestratorConfig};
use crate::model::{Workload, WorkloadKind};
use crate::workload::{
    Container, ContainerPort, Controller, CronJob, CronJobSpec, Deployment, DeploymentSpec,
    DeploymentStrategy, EnvVar, GeneratedWorkload, HostPathVolumeSource, Job, JobSpec,
    JobTemplateSpec, LabelSelector, ObjectMeta, ObjectSet, PodMeta, PodSpec, PodTemplateSpec,
    ResourceQuantity, ResourceRequirements, SecurityContext, Service, ServicePort, ServiceSpec,
    Volume, VolumeMount,
};
use crate::Error;

use self::placement::{Placement, StaticTolerations, TolerationResolver};
use self::protocol::{ImageRole, ProtocolProfile, RELAY_PORT};

/// Name of the device volume on device-bound pods
const DEVICE_VOLUME: &str = "device";

/// Container name for every generated pod
const MAIN_CONTAINER: &str = "main";

/// Generates cluster objects for workloads
#[derive(Clone)]
pub struct SpecGenerator {
    namespace: String,
    product: String,
    images: ImageConfig,
    default_node: Option<String>,
    tolerations: Arc<dyn TolerationResolver>,
}

impl SpecGenerator {
    /// Create a generator with an explicit placement policy
    pub fn new(config: &OrchestratorConfig, tolerations: Arc<dyn TolerationResolver>) -> Self {
        Self {
            namespace: config.namespace.clone(),
            product: config.product.clone(),
            images: config.images.clone(),
            default_node: config.default_node.clone(),
            tolerations,
        }
    }

    /// Create a generator whose tolerations come from configured node taints
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config,
            Arc::new(StaticTolerations::new(config.taints_by_node())),
        )
    }

    /// Value of the `app` label
    pub fn product(&self) -> &str {
        &self.product
    }

    /// Whether the workload's protocol owns a node-local device
    pub fn is_device_bound(&self, workload: &Workload) -> Result<bool, Error> {
        Ok(protocol::lookup(workload)?.device_bound)
    }

    /// Render every object backing `workload`
    pub fn generate(&self, workload: &Workload) -> Result<GeneratedWorkload, Error> {
        let profile = protocol::lookup(workload)?;
        validate(workload, profile)?;

        let placement = placement::resolve(
            workload,
            profile.device_bound,
            self.default_node.as_deref(),
            self.tolerations.as_ref(),
        )?;

        let primary = self.primary_set(workload, profile, &placement)?;
        let paired = (profile.device_bound && workload.kind == WorkloadKind::Camera)
            .then(|| self.paired_set(workload, &placement));

        Ok(GeneratedWorkload { primary, paired })
    }

    fn primary_set(
        &self,
        workload: &Workload,
        profile: &ProtocolProfile,
        placement: &Placement,
    ) -> Result<ObjectSet, Error> {
        let name = naming::primary_name(workload);
        let labels = naming::primary_labels(&self.product, workload);

        let mut container = Container {
            name: MAIN_CONTAINER.to_string(),
            image: profile.image.image(&self.images).to_string(),
            args: (profile.args)(workload),
            env: vec![
                EnvVar::new("WORKLOAD_ID", workload.id.to_string()),
                EnvVar::new("WORKLOAD_NAME", workload.name.clone()),
            ],
            ports: profile
                .port
                .iter()
                .map(|(port_name, port)| ContainerPort {
                    name: Some(port_name.to_string()),
                    container_port: *port,
                })
                .collect(),
            resources: resources(workload),
            volume_mounts: Vec::new(),
            security_context: None,
        };

        let mut pod = PodSpec {
            node_selector: placement.node_selector(),
            tolerations: placement.tolerations.clone(),
            ..Default::default()
        };

        if profile.device_bound {
            let device_path = workload.config.device_path.clone().unwrap_or_default();
            container.volume_mounts.push(VolumeMount {
                name: DEVICE_VOLUME.to_string(),
                mount_path: device_path.clone(),
            });
            container.security_context = Some(SecurityContext {
                privileged: Some(true),
            });
            pod.volumes.push(Volume {
                name: DEVICE_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: device_path,
                    type_: Some("CharDevice".to_string()),
                }),
            });
        }

        pod.containers.push(container);

        let controller = match workload.kind {
            WorkloadKind::AgentTask => {
                pod.restart_policy = Some("Never".to_string());
                Controller::Job(Job {
                    api_version: "batch/v1".to_string(),
                    kind: "Job".to_string(),
                    metadata: self.meta(&name, &labels),
                    spec: job_spec(template(&labels, pod)),
                })
            }
            WorkloadKind::Cron => {
                pod.restart_policy = Some("OnFailure".to_string());
                let schedule = workload.config.schedule.clone().unwrap_or_default();
                Controller::CronJob(CronJob {
                    api_version: "batch/v1".to_string(),
                    kind: "CronJob".to_string(),
                    metadata: self.meta(&name, &labels),
                    spec: CronJobSpec {
                        schedule,
                        concurrency_policy: Some("Forbid".to_string()),
                        job_template: JobTemplateSpec {
                            spec: job_spec(template(&labels, pod)),
                        },
                    },
                })
            }
            _ => {
                let strategy = if profile.device_bound {
                    "Recreate"
                } else {
                    "RollingUpdate"
                };
                Controller::Deployment(self.deployment(&name, &labels, pod, strategy))
            }
        };

        let service = match (&controller, profile.port) {
            (Controller::Deployment(_), Some((port_name, port))) => {
                Some(self.service(&name, &labels, port_name, port))
            }
            _ => None,
        };

        Ok(ObjectSet {
            controller,
            service,
        })
    }

    fn paired_set(&self, owner: &Workload, placement: &Placement) -> ObjectSet {
        let name = naming::paired_name(owner);
        let labels = naming::paired_labels(&self.product, owner);
        let source = format!(
            "http://{}:{}/stream",
            naming::primary_name(owner),
            RELAY_PORT
        );

        let container = Container {
            name: MAIN_CONTAINER.to_string(),
            image: ImageRole::Recorder.image(&self.images).to_string(),
            args: vec![
                "--source".to_string(),
                source,
                "--listen".to_string(),
                format!(":{}", protocol::RECORDER_PORT),
            ],
            env: vec![
                EnvVar::new("WORKLOAD_ID", owner.id.to_string()),
                EnvVar::new("WORKLOAD_NAME", owner.name.clone()),
            ],
            ports: vec![ContainerPort {
                name: Some("control".to_string()),
                container_port: protocol::RECORDER_PORT,
            }],
            resources: None,
            volume_mounts: Vec::new(),
            security_context: None,
        };

        let pod = PodSpec {
            containers: vec![container],
            node_selector: placement.node_selector(),
            tolerations: placement.tolerations.clone(),
            ..Default::default()
        };

        ObjectSet {
            controller: Controller::Deployment(self.deployment(
                &name,
                &labels,
                pod,
                "RollingUpdate",
            )),
            service: Some(self.service(&name, &labels, "control", protocol::RECORDER_PORT)),
        }
    }

    fn meta(&self, name: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta::new(name, &self.namespace, labels.clone())
    }

    fn deployment(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        pod: PodSpec,
        strategy: &str,
    ) -> Deployment {
        Deployment {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            metadata: self.meta(name, labels),
            spec: DeploymentSpec {
                replicas: 1,
                selector: LabelSelector {
                    match_labels: labels.clone(),
                },
                template: template(labels, pod),
                strategy: Some(DeploymentStrategy {
                    type_: strategy.to_string(),
                }),
            },
        }
    }

    fn service(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        port_name: &str,
        port: u16,
    ) -> Service {
        Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: self.meta(name, labels),
            spec: ServiceSpec {
                selector: labels.clone(),
                ports: vec![ServicePort {
                    name: Some(port_name.to_string()),
                    port,
                    target_port: Some(port),
                }],
            },
        }
    }
}

fn validate(workload: &Workload, profile: &ProtocolProfile) -> Result<(), Error> {
    if workload.name.trim().is_empty() {
        return Err(Error::validation("workload name must not be empty"));
    }
    if profile.requires_source && workload.config.source.is_none() {
        return Err(Error::validation(format!(
            "protocol '{}' requires a source",
            profile.name
        )));
    }
    if profile.device_bound && workload.config.device_path.is_none() {
        return Err(Error::validation(format!(
            "protocol '{}' requires a device path",
            profile.name
        )));
    }
    if !profile.device_bound && workload.config.device_path.is_some() {
        return Err(Error::validation(format!(
            "protocol '{}' does not take a device path",
            profile.name
        )));
    }
    if workload.kind == WorkloadKind::Cron && workload.config.schedule.is_none() {
        return Err(Error::validation("cron workloads require a schedule"));
    }
    Ok(())
}

fn template(labels: &BTreeMap<String, String>, spec: PodSpec) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: PodMeta {
            labels: labels.clone(),
            annotations: BTreeMap::new(),
        },
        spec,
    }
}

fn job_spec(template: PodTemplateSpec) -> JobSpec {
    JobSpec {
        backoff_limit: Some(0),
        ttl_seconds_after_finished: None,
        template,
    }
}

fn resources(workload: &Workload) -> Option<ResourceRequirements> {
    let limits = &workload.config.resources;
    if limits.is_empty() {
        return None;
    }
    let quantity = ResourceQuantity {
        cpu: limits.cpu.clone(),
        memory: limits.memory.clone(),
    };
    Some(ResourceRequirements {
        requests: Some(quantity.clone()),
        limits: Some(quantity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ObjectKind;
    use crate::model::{ResourceLimits, WorkloadConfig};
    use crate::workload::Toleration;

    fn generator() -> SpecGenerator {
        let config = OrchestratorConfig {
            node_taints: vec!["edge1=edge=true:NoSchedule".parse().unwrap()],
            ..Default::default()
        };
        SpecGenerator::from_config(&config)
    }

    fn usb_camera() -> Workload {
        Workload::new(
            "Front Porch",
            WorkloadKind::Camera,
            WorkloadConfig {
                protocol: "usb".to_string(),
                device_path: Some("/dev/video0".to_string()),
                node: Some("edge1".to_string()),
                framerate: Some(15),
                resources: ResourceLimits {
                    cpu: Some("500m".to_string()),
                    memory: None,
                },
                ..Default::default()
            },
        )
    }

    fn agent(kind: WorkloadKind, schedule: Option<&str>) -> Workload {
        Workload::new(
            "Nightly Digest",
            kind,
            WorkloadConfig {
                protocol: "agent".to_string(),
                schedule: schedule.map(str::to_string),
                ..Default::default()
            },
        )
    }

    // =========================================================================
    // Device-bound cameras
    // =========================================================================

    #[test]
    fn story_usb_camera_renders_primary_and_paired_recorder() {
        let cam = usb_camera();
        let generated = generator().generate(&cam).unwrap();

        let kinds: Vec<_> = generated
            .to_objects()
            .unwrap()
            .into_iter()
            .map(|o| (o.kind, o.name))
            .collect();
        let short = cam.short_id();
        assert_eq!(
            kinds,
            vec![
                (ObjectKind::Deployment, format!("cam-front-porch-{short}")),
                (ObjectKind::Service, format!("cam-front-porch-{short}")),
                (ObjectKind::Deployment, format!("rec-front-porch-{short}")),
                (ObjectKind::Service, format!("rec-front-porch-{short}")),
            ]
        );
    }

    #[test]
    fn story_device_pod_mounts_char_device_privileged_on_its_node() {
        let generated = generator().generate(&usb_camera()).unwrap();
        let objects = generated.primary.to_objects().unwrap();
        let pod = &objects[0].body["spec"]["template"]["spec"];

        assert_eq!(pod["volumes"][0]["hostPath"]["path"], "/dev/video0");
        assert_eq!(pod["volumes"][0]["hostPath"]["type"], "CharDevice");
        assert_eq!(pod["containers"][0]["securityContext"]["privileged"], true);
        assert_eq!(pod["containers"][0]["volumeMounts"][0]["mountPath"], "/dev/video0");
        assert_eq!(pod["nodeSelector"]["kubernetes.io/hostname"], "edge1");
        assert_eq!(pod["tolerations"][0]["key"], "edge");
        assert_eq!(pod["containers"][0]["resources"]["limits"]["cpu"], "500m");
        assert_eq!(objects[0].body["spec"]["strategy"]["type"], "Recreate");
    }

    #[test]
    fn story_paired_recorder_reads_camera_service_and_shares_node() {
        let cam = usb_camera();
        let generated = generator().generate(&cam).unwrap();
        let paired = generated.paired.unwrap().to_objects().unwrap();

        let labels = paired[0].labels();
        assert_eq!(labels[naming::LABEL_OWNED_BY], cam.id.to_string());
        assert_eq!(labels["camera-id"], cam.id.to_string());
        assert_eq!(labels[naming::LABEL_COMPONENT], "recorder");
        assert_eq!(paired[0].template_labels(), labels);

        let pod = &paired[0].body["spec"]["template"]["spec"];
        let args: Vec<String> = serde_json::from_value(pod["containers"][0]["args"].clone()).unwrap();
        assert_eq!(
            args[1],
            format!("http://{}:{}/stream", naming::primary_name(&cam), RELAY_PORT)
        );
        assert_eq!(pod["nodeSelector"]["kubernetes.io/hostname"], "edge1");
        assert!(pod.get("volumes").is_none());
    }

    #[test]
    fn story_device_bound_without_node_is_rejected() {
        let mut cam = usb_camera();
        cam.config.node = None;
        assert!(matches!(
            generator().generate(&cam).unwrap_err(),
            Error::Validation(_)
        ));
    }

    // =========================================================================
    // Network cameras and agents
    // =========================================================================

    #[test]
    fn story_network_camera_has_no_paired_recorder_or_device() {
        let cam = Workload::new(
            "Driveway",
            WorkloadKind::Camera,
            WorkloadConfig {
                protocol: "rtsp".to_string(),
                source: Some("rtsp://10.0.0.9/live".to_string()),
                ..Default::default()
            },
        );
        let generated = generator().generate(&cam).unwrap();
        assert!(generated.paired.is_none());
        assert!(!generator().is_device_bound(&cam).unwrap());

        let objects = generated.to_objects().unwrap();
        assert_eq!(objects.len(), 2);
        let pod = &objects[0].body["spec"]["template"]["spec"];
        assert!(pod.get("nodeSelector").is_none());
        assert!(pod.get("volumes").is_none());
        assert_eq!(objects[0].body["spec"]["strategy"]["type"], "RollingUpdate");
    }

    #[test]
    fn story_network_camera_requires_source() {
        let cam = Workload::new(
            "Driveway",
            WorkloadKind::Camera,
            WorkloadConfig {
                protocol: "http".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(
            generator().generate(&cam).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn story_agent_task_is_a_job_without_service() {
        let task = agent(WorkloadKind::AgentTask, None);
        let generated = generator().generate(&task).unwrap();
        assert!(generated.primary.service.is_none());
        let objects = generated.to_objects().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].kind, ObjectKind::Job);
        assert!(objects[0].name.starts_with("task-nightly-digest-"));
        assert_eq!(
            objects[0].body["spec"]["template"]["spec"]["restartPolicy"],
            "Never"
        );
    }

    #[test]
    fn story_cron_is_a_cron_job_and_needs_schedule() {
        let cron = agent(WorkloadKind::Cron, Some("0 3 * * *"));
        let objects = generator().generate(&cron).unwrap().to_objects().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].kind, ObjectKind::CronJob);
        assert_eq!(objects[0].body["spec"]["schedule"], "0 3 * * *");
        assert_eq!(
            objects[0].template_labels()["cron-id"],
            cron.id.to_string()
        );

        let unscheduled = agent(WorkloadKind::Cron, None);
        assert!(matches!(
            generator().generate(&unscheduled).unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[test]
    fn story_default_node_pins_floating_workloads() {
        let config = OrchestratorConfig {
            default_node: Some("core1".to_string()),
            ..Default::default()
        };
        let generated = SpecGenerator::from_config(&config)
            .generate(&agent(WorkloadKind::Agent, None))
            .unwrap();
        let objects = generated.to_objects().unwrap();
        assert_eq!(
            objects[0].body["spec"]["template"]["spec"]["nodeSelector"]["kubernetes.io/hostname"],
            "core1"
        );
        assert_eq!(objects[1].kind, ObjectKind::Service);
    }

    #[test]
    fn story_unknown_protocol_fails_before_rendering() {
        let mut cam = usb_camera();
        cam.config.protocol = "firewire".to_string();
        assert!(matches!(
            generator().generate(&cam).unwrap_err(),
            Error::UnsupportedProtocol { .. }
        ));
    }

    #[test]
    fn story_generation_is_deterministic() {
        let cam = usb_camera();
        assert_eq!(
            generator().generate(&cam).unwrap(),
            generator().generate(&cam).unwrap()
        );
    }

    #[test]
    fn story_custom_resolver_drives_tolerations() {
        struct Everywhere;
        impl TolerationResolver for Everywhere {
            fn tolerations_for(&self, node: &str) -> Vec<Toleration> {
                vec![Toleration {
                    key: Some(format!("site/{node}")),
                    operator: Some("Exists".to_string()),
                    value: None,
                    effect: None,
                }]
            }
        }
        let gen = SpecGenerator::new(&OrchestratorConfig::default(), Arc::new(Everywhere));
        let generated = gen.generate(&usb_camera()).unwrap();
        let Controller::Deployment(d) = &generated.primary.controller else {
            panic!("expected deployment");
        };
        assert_eq!(
            d.spec.template.spec.tolerations[0].key.as_deref(),
            Some("site/edge1")
        );
    }
}
