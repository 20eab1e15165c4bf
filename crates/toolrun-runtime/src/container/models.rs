//! Wire models for the container engine API.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Label carrying the owning process id on every container this crate creates.
pub const PROCESS_LABEL: &str = "toolrun.process";

/// Image label holding the tool name used for grouping.
pub const NAME_LABEL: &str = "name";

/// Image label holding the tool version used by `latest_by_version`.
pub const VERSION_LABEL: &str = "version";

/// Container creation request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub labels: BTreeMap<String, String>,
    /// Engine-specific body fields merged over the generated request body.
    pub overrides: Option<Map<String, Value>>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Engine request body for `POST /containers/create`.
    ///
    /// Override keys replace generated keys; nested objects (e.g. `HostConfig`)
    /// are merged one level deep.
    pub fn to_create_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("Image".into(), Value::String(self.image.clone()));
        if let Some(args) = &self.args {
            body.insert(
                "Cmd".into(),
                Value::Array(args.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(env) = &self.env {
            body.insert(
                "Env".into(),
                Value::Array(
                    env.iter()
                        .map(|(k, v)| Value::String(format!("{k}={v}")))
                        .collect(),
                ),
            );
        }
        if !self.labels.is_empty() {
            body.insert(
                "Labels".into(),
                Value::Object(
                    self.labels
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect(),
                ),
            );
        }
        if let Some(overrides) = &self.overrides {
            for (key, value) in overrides {
                match (body.get_mut(key), value) {
                    (Some(Value::Object(existing)), Value::Object(incoming)) => {
                        for (k, v) in incoming {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                    _ => {
                        body.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        Value::Object(body)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CreateContainerResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Warnings", default)]
    pub warnings: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ContainerState {
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "Paused", default)]
    pub paused: bool,
    #[serde(rename = "Restarting", default)]
    pub restarting: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: Option<i64>,
    #[serde(rename = "StartedAt", default)]
    pub started_at: Option<String>,
    #[serde(rename = "FinishedAt", default)]
    pub finished_at: Option<String>,
}

impl ContainerState {
    /// A container in any of these states must be killed before removal.
    pub fn is_active(&self) -> bool {
        self.running || self.paused || self.restarting
    }
}

/// Result of `GET /containers/{id}/json`, reduced to what the scheduler reads.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ContainerInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Image", default)]
    pub image: String,
    #[serde(rename = "State", default)]
    pub state: ContainerState,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Labels", default)]
    pub labels: Option<HashMap<String, String>>,
    /// Unix seconds.
    #[serde(rename = "Created", default)]
    pub created: i64,
}

impl ImageSummary {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .as_ref()
            .and_then(|labels| labels.get(key))
            .map(String::as_str)
    }

    /// Tool name: the `name` label, else the repository of the first tag.
    pub fn tool_name(&self) -> Option<String> {
        if let Some(name) = self.label(NAME_LABEL) {
            return Some(name.to_string());
        }
        self.repo_tags
            .as_ref()
            .and_then(|tags| tags.iter().find(|t| t.as_str() != "<none>:<none>"))
            .map(|tag| split_repo_tag(tag).0.to_string())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.repo_tags
            .as_ref()
            .map(|tags| tags.iter().any(|t| split_repo_tag(t).1 == Some(tag)))
            .unwrap_or(false)
    }
}

/// Split `registry:5000/repo:tag` into repository and tag.
pub(crate) fn split_repo_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rfind(':') {
        Some(idx) if !reference[idx + 1..].contains('/') => {
            (&reference[..idx], Some(&reference[idx + 1..]))
        }
        _ => (reference, None),
    }
}

/// Result of `GET /images/{id}/json`. Only the stable fields are typed.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags", default)]
    pub repo_tags: Option<Vec<String>>,
    #[serde(rename = "Created", default)]
    pub created: Option<String>,
    #[serde(rename = "Config", default)]
    pub config: Option<Value>,
}

/// Image listing selection. At most one mode applies, in field order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageListOptions {
    pub name: Option<String>,
    #[serde(default)]
    pub only_latest: bool,
    #[serde(default)]
    pub latest_by_version: bool,
    #[serde(default)]
    pub latest_by_created: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct EventActor {
    #[serde(rename = "ID", default)]
    pub id: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: HashMap<String, String>,
}

/// One record of the engine's `/events` stream.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RuntimeEventRecord {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
    /// Legacy top-level id, still emitted by engines for container events.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "timeNano", default)]
    pub time_nano: Option<i64>,
}

impl RuntimeEventRecord {
    pub fn container_id(&self) -> Option<&str> {
        if !self.actor.id.is_empty() {
            return Some(&self.actor.id);
        }
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}
