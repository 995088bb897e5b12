//! Deterministic resource names and the labels every managed object carries

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::cluster::LabelQuery;
use crate::model::{Workload, WorkloadKind};

/// Longest name Kubernetes accepts for a Service (DNS-1123 label)
pub const MAX_NAME_LEN: usize = 63;

/// Longest CronJob name; the controller appends an 11-character suffix to
/// the Jobs it spawns
pub const MAX_CRONJOB_NAME_LEN: usize = 52;

/// Product label key
pub const LABEL_APP: &str = "app";

/// Component label key
pub const LABEL_COMPONENT: &str = "component";

/// Label key linking a paired secondary object to the workload that owns it
pub const LABEL_OWNED_BY: &str = "owned-by";

/// Pod template annotation bumped to trigger a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "camfleet.io/restartedAt";

/// Lower-case the display name and collapse anything non-alphanumeric to `-`
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("workload");
    }
    slug
}

/// Name length limit for a workload kind's primary objects
pub fn max_name_len(kind: WorkloadKind) -> usize {
    match kind {
        WorkloadKind::Cron => MAX_CRONJOB_NAME_LEN,
        _ => MAX_NAME_LEN,
    }
}

/// `<prefix>-<slug>-<shortid>`, truncated to fit `max_len`
pub fn resource_name(prefix: &str, display_name: &str, short_id: &str, max_len: usize) -> String {
    let budget = max_len.saturating_sub(prefix.len() + short_id.len() + 2);
    let slug = slugify(display_name);
    let slug = slug[..slug.len().min(budget)].trim_end_matches('-');
    format!("{prefix}-{slug}-{short_id}")
}

/// Name of a workload's own objects
pub fn primary_name(workload: &Workload) -> String {
    resource_name(
        workload.kind.name_prefix(),
        &workload.name,
        &workload.short_id(),
        max_name_len(workload.kind),
    )
}

/// Name of the recorder objects paired to a camera
pub fn paired_name(workload: &Workload) -> String {
    resource_name(
        WorkloadKind::Recorder.name_prefix(),
        &workload.name,
        &workload.short_id(),
        MAX_NAME_LEN,
    )
}

/// A group of objects listed together by the sweeper
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    /// A workload's own objects, keyed by `<kind>-id`
    Primary(WorkloadKind),
    /// Recorders paired to cameras, keyed by `owned-by`
    Paired,
}

impl Family {
    /// Every family the orchestrator manages
    pub fn all() -> Vec<Family> {
        WorkloadKind::ALL
            .into_iter()
            .map(Family::Primary)
            .chain(std::iter::once(Family::Paired))
            .collect()
    }

    /// Label that carries the owning workload id
    pub fn owner_label(&self) -> String {
        match self {
            Family::Primary(kind) => kind.id_label(),
            Family::Paired => LABEL_OWNED_BY.to_string(),
        }
    }

    /// Value of the component label
    pub fn component(&self) -> &'static str {
        match self {
            Family::Primary(kind) => kind.as_str(),
            Family::Paired => WorkloadKind::Recorder.as_str(),
        }
    }

    /// Selector for this family, optionally narrowed to one owner
    pub fn query(&self, product: &str, owner: Option<Uuid>) -> LabelQuery {
        let q = LabelQuery::new()
            .eq(LABEL_APP, product)
            .eq(LABEL_COMPONENT, self.component());
        let q = match self {
            Family::Primary(_) => q.lacks(LABEL_OWNED_BY),
            Family::Paired => q,
        };
        match owner {
            Some(id) => q.eq(self.owner_label(), id.to_string()),
            None => q.has(self.owner_label()),
        }
    }
}

/// Labels for a workload's own objects
pub fn primary_labels(product: &str, workload: &Workload) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), product.to_string()),
        (
            LABEL_COMPONENT.to_string(),
            workload.kind.as_str().to_string(),
        ),
        (workload.kind.id_label(), workload.id.to_string()),
    ])
}

/// Labels for the recorder paired to a camera
pub fn paired_labels(product: &str, owner: &Workload) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_APP.to_string(), product.to_string()),
        (
            LABEL_COMPONENT.to_string(),
            WorkloadKind::Recorder.as_str().to_string(),
        ),
        (owner.kind.id_label(), owner.id.to_string()),
        (LABEL_OWNED_BY.to_string(), owner.id.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkloadConfig;

    #[test]
    fn slugify_collapses_and_trims() {
        assert_eq!(slugify("Front Porch"), "front-porch");
        assert_eq!(slugify("  Garage -- Left!! "), "garage-left");
        assert_eq!(slugify("CAM_01"), "cam-01");
        assert_eq!(slugify("!!!"), "workload");
        assert_eq!(slugify("café door"), "caf-door");
    }

    #[test]
    fn resource_name_fits_dns_label() {
        let long = "a very long camera name ".repeat(10);
        let name = resource_name("cam", &long, "1a2b3c4d", MAX_NAME_LEN);
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(name.starts_with("cam-a-very-long"));
        assert!(name.ends_with("-1a2b3c4d"));
        assert!(!name.contains("--"));
    }

    #[test]
    fn cron_names_leave_room_for_job_suffix() {
        let cron = Workload::new("x".repeat(80), WorkloadKind::Cron, WorkloadConfig::default());
        let name = primary_name(&cron);
        assert!(name.len() <= MAX_CRONJOB_NAME_LEN, "{name} is {} chars", name.len());
        assert!(name.starts_with("cron-xxx"));
        assert!(name.ends_with(&cron.short_id()));

        let agent = Workload::new("x".repeat(80), WorkloadKind::Agent, WorkloadConfig::default());
        assert_eq!(primary_name(&agent).len(), MAX_NAME_LEN);
    }

    #[test]
    fn same_name_distinct_ids_get_distinct_names() {
        let a = Workload::new("Porch", WorkloadKind::Camera, WorkloadConfig::default());
        let b = Workload::new("Porch", WorkloadKind::Camera, WorkloadConfig::default());
        assert_ne!(primary_name(&a), primary_name(&b));
        assert_eq!(primary_name(&a), primary_name(&a));
        assert!(paired_name(&a).starts_with("rec-porch-"));
    }

    #[test]
    fn family_queries() {
        let id = Uuid::new_v4();
        let q = Family::Primary(WorkloadKind::Camera).query("camfleet", Some(id));
        assert_eq!(
            q.to_selector(),
            format!("app=camfleet,camera-id={id},component=camera,!owned-by")
        );

        let q = Family::Paired.query("camfleet", None);
        assert_eq!(q.to_selector(), "app=camfleet,component=recorder,owned-by");

        assert_eq!(Family::all().len(), WorkloadKind::ALL.len() + 1);
    }

    #[test]
    fn paired_labels_carry_owner() {
        let cam = Workload::new("Porch", WorkloadKind::Camera, WorkloadConfig::default());
        let labels = paired_labels("camfleet", &cam);
        assert_eq!(labels[LABEL_OWNED_BY], cam.id.to_string());
        assert_eq!(labels["camera-id"], cam.id.to_string());
        assert_eq!(labels[LABEL_COMPONENT], "recorder");
        assert!(Family::Paired.query("camfleet", Some(cam.id)).matches(&labels));
        assert!(!Family::Primary(WorkloadKind::Recorder)
            .query("camfleet", None)
            .matches(&labels));
    }
}
