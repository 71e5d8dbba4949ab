//! Environment identity, naming, and lifecycle state
//!
//! Every cluster resource belonging to an environment is addressed by a name
//! derived from the identity tuple, so creation and deletion never need a
//! lookup. The same tuple yields the route key used by the routing table and
//! the labels used to rediscover environments after a restart.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Prefix for every environment resource handle
pub const RESOURCE_PREFIX: &str = "hive";

/// Kubernetes object names (and label values) are capped at 63 characters
pub const MAX_NAME_LEN: usize = 63;

/// Label selecting all environment workloads
pub const LABEL_APP: &str = "app";
/// Value of [`LABEL_APP`] on environment workloads
pub const LABEL_APP_ENVIRONMENT: &str = "hive-environment";
/// Label carrying the normalised course name
pub const LABEL_COURSE: &str = "hive.dev/course";
/// Label carrying the normalised assignment name
pub const LABEL_ASSIGNMENT: &str = "hive.dev/assignment";
/// Label carrying the student id
pub const LABEL_STUDENT: &str = "hive.dev/student";
/// Standard managed-by label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`]
pub const LABEL_MANAGED_BY_HIVE: &str = "hive";

/// Lowercase a display name and collapse whitespace runs into `-`.
///
/// "Intro to CS" becomes "intro-to-cs".
pub fn normalize_segment(raw: &str) -> String {
    raw.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

fn validate_segment(field: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::validation_for_field(field, format!("{field} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(Error::validation_for_field(
            field,
            format!("{field} '{value}' exceeds {MAX_NAME_LEN} characters"),
        ));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::validation_for_field(
            field,
            format!("{field} '{value}' may only contain lowercase letters, digits, and '-'"),
        ));
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(Error::validation_for_field(
            field,
            format!("{field} '{value}' must start and end with an alphanumeric character"),
        ));
    }
    Ok(())
}

/// Identity of one student's environment within a course assignment
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentId {
    /// Normalised course name
    pub course: String,
    /// Normalised assignment name
    pub assignment: String,
    /// Student id (e.g. NetID)
    pub student: String,
}

impl EnvironmentId {
    /// Normalise and validate an identity tuple
    pub fn new(
        course: impl AsRef<str>,
        assignment: impl AsRef<str>,
        student: impl AsRef<str>,
    ) -> Result<Self, Error> {
        let id = Self {
            course: normalize_segment(course.as_ref()),
            assignment: normalize_segment(assignment.as_ref()),
            student: normalize_segment(student.as_ref()),
        };

        validate_segment("course", &id.course)?;
        validate_segment("assignment", &id.assignment)?;
        validate_segment("student", &id.student)?;

        let name = id.resource_name();
        if name.len() > MAX_NAME_LEN {
            return Err(Error::validation(format!(
                "resource name '{name}' exceeds {MAX_NAME_LEN} characters"
            )));
        }
        Ok(id)
    }

    /// Handle shared by the environment's workload and endpoint
    pub fn resource_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            RESOURCE_PREFIX, self.course, self.assignment, self.student
        )
    }

    /// Key under which the environment is routed by the shared proxy
    pub fn route_key(&self) -> String {
        format!("{}/{}/{}", self.course, self.assignment, self.student)
    }

    /// Labels stamped on every resource of this environment
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_APP.to_string(), LABEL_APP_ENVIRONMENT.to_string()),
            (LABEL_COURSE.to_string(), self.course.clone()),
            (LABEL_ASSIGNMENT.to_string(), self.assignment.clone()),
            (LABEL_STUDENT.to_string(), self.student.clone()),
            (
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_HIVE.to_string(),
            ),
        ])
    }

    /// Recover an identity from resource labels.
    ///
    /// Returns `None` for resources that are not environment workloads or
    /// whose labels no longer form a valid identity.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Option<Self> {
        if labels.get(LABEL_APP).map(String::as_str) != Some(LABEL_APP_ENVIRONMENT) {
            return None;
        }
        Self::new(
            labels.get(LABEL_COURSE)?,
            labels.get(LABEL_ASSIGNMENT)?,
            labels.get(LABEL_STUDENT)?,
        )
        .ok()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.route_key())
    }
}

/// Everything needed to create an environment
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Identity tuple
    pub id: EnvironmentId,
    /// Container image reference
    pub image: String,
    /// Desired replica count
    pub replicas: i32,
}

impl EnvironmentDescriptor {
    /// Build a single-replica descriptor, validating the image reference
    pub fn new(id: EnvironmentId, image: impl Into<String>) -> Result<Self, Error> {
        Self::with_replicas(id, image, 1)
    }

    /// Build a descriptor with an explicit replica count
    pub fn with_replicas(
        id: EnvironmentId,
        image: impl Into<String>,
        replicas: i32,
    ) -> Result<Self, Error> {
        let image = image.into();
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return Err(Error::validation_for_field(
                "image",
                format!("invalid image reference '{image}'"),
            ));
        }
        if replicas < 1 {
            return Err(Error::validation_for_field(
                "replicas",
                format!("replicas must be at least 1, got {replicas}"),
            ));
        }
        Ok(Self {
            id,
            image,
            replicas,
        })
    }
}

/// Lifecycle status of a tracked environment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvironmentStatus {
    /// Creation in progress, or address not yet resolved
    Pending,
    /// Workload and endpoint exist
    Ready,
    /// Teardown in progress
    Deleting,
    /// Creation failed or teardown left resources behind
    Failed,
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Ready => "Ready",
            Self::Deleting => "Deleting",
            Self::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// An environment as tracked by the coordinator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Identity tuple
    pub id: EnvironmentId,
    /// Container image reference
    pub image: String,
    /// Desired replica count
    pub replicas: i32,
    /// Current lifecycle status
    pub status: EnvironmentStatus,
    /// Resolved backend address once the endpoint reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_address: Option<String>,
}

impl Environment {
    /// A freshly requested environment
    pub fn pending(descriptor: &EnvironmentDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            image: descriptor.image.clone(),
            replicas: descriptor.replicas,
            status: EnvironmentStatus::Pending,
            backend_address: None,
        }
    }
}
