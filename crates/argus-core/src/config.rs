//! The YAML config file: settings, defaults, global notifiers/webhooks and
//! the ordered `service:` mapping.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{ArgusError, Result};
use crate::io::atomic_write;
use crate::notify::NotifyConfig;
use crate::service::{ServiceConfig, ServiceDefaults};
use crate::settings::Settings;
use crate::webhook::WebHookConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub service: ServiceDefaults,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub settings: Settings,
    pub defaults: Defaults,
    pub notify: BTreeMap<String, NotifyConfig>,
    pub webhook: BTreeMap<String, WebHookConfig>,
    /// Service IDs in the order they appear in the file.
    pub order: Vec<String>,
    pub service: HashMap<String, ServiceConfig>,
}

/// On-disk shape. `service` stays a raw mapping so its key order survives.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    defaults: Defaults,
    #[serde(default)]
    notify: BTreeMap<String, NotifyConfig>,
    #[serde(default)]
    webhook: BTreeMap<String, WebHookConfig>,
    #[serde(default)]
    service: Mapping,
}

impl Config {
    /// Read `path` and apply `ARGUS_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ArgusError::ConfigNotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut config = Self::from_yaml(&text)?;
        config.settings.apply_env();
        tracing::debug!(path = %path.display(), services = config.order.len(), "config loaded");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: RawConfig = serde_yaml::from_str(text)?;

        let mut order = Vec::with_capacity(raw.service.len());
        let mut service = HashMap::with_capacity(raw.service.len());
        for (key, value) in raw.service {
            let id = match key {
                Value::String(s) => s,
                other => {
                    return Err(ArgusError::InvalidConfig(format!(
                        "service key {other:?} is not a string"
                    )))
                }
            };
            let parsed: ServiceConfig = serde_yaml::from_value(value).map_err(|e| {
                ArgusError::InvalidConfig(format!("service.{id}: {e}"))
            })?;
            order.push(id.clone());
            service.insert(id, parsed);
        }

        Ok(Self {
            settings: raw.settings,
            defaults: raw.defaults,
            notify: raw.notify,
            webhook: raw.webhook,
            order,
            service,
        })
    }

    /// Every problem found, each prefixed with its config path. Empty when
    /// the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.settings.validate();
        let mut names: HashMap<&str, &str> = HashMap::new();

        for id in &self.order {
            let Some(svc) = self.service.get(id) else {
                problems.push(format!("service.{id}: listed in order but not defined"));
                continue;
            };
            problems.extend(svc.validate(id, &self.defaults.service, &self.notify, &self.webhook));

            let name = svc.display_name(id);
            if let Some(existing) = names.insert(name, id) {
                problems.push(format!(
                    "service.{id}.name: {name:?} is already used by {existing:?}"
                ));
            }
        }
        problems
    }

    /// Render to YAML, keeping `order` and leaving out anything unset.
    pub fn render(&self) -> Result<String> {
        let mut root = Mapping::new();
        insert_pruned(&mut root, "settings", serde_yaml::to_value(&self.settings)?);
        insert_pruned(&mut root, "defaults", serde_yaml::to_value(&self.defaults)?);
        insert_pruned(&mut root, "notify", serde_yaml::to_value(&self.notify)?);
        insert_pruned(&mut root, "webhook", serde_yaml::to_value(&self.webhook)?);

        let mut services = Mapping::new();
        for id in &self.order {
            if let Some(svc) = self.service.get(id) {
                services.insert(Value::String(id.clone()), service_value(svc)?);
            }
        }
        if !services.is_empty() {
            root.insert(Value::String("service".into()), Value::Mapping(services));
        }

        Ok(serde_yaml::to_string(&Value::Mapping(root))?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write(path, self.render()?.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Pruning
// ---------------------------------------------------------------------------

/// Drop nulls and empty collections, recursively. Returns true when `value`
/// itself ended up empty.
fn prune(value: &mut Value) -> bool {
    match value {
        Value::Null => true,
        Value::Mapping(map) => {
            let empty: Vec<Value> = map
                .iter_mut()
                .filter_map(|(k, v)| prune(v).then(|| k.clone()))
                .collect();
            for key in empty {
                map.remove(&key);
            }
            map.is_empty()
        }
        Value::Sequence(seq) => seq.is_empty(),
        _ => false,
    }
}

fn insert_pruned(root: &mut Mapping, key: &str, mut value: Value) {
    if !prune(&mut value) {
        root.insert(Value::String(key.into()), value);
    }
}

/// A service entry. `notify.<id>: {}` and `webhook.<id>: {}` are kept, since
/// an empty reference means "use the global definition as-is".
fn service_value(svc: &ServiceConfig) -> Result<Value> {
    let mut value = serde_yaml::to_value(svc)?;
    let Value::Mapping(map) = &mut value else {
        return Ok(value);
    };

    let mut references = Vec::new();
    for key in ["notify", "webhook"] {
        if let Some(Value::Mapping(children)) = map.remove(key) {
            let kept: Mapping = children
                .into_iter()
                .map(|(id, mut child)| {
                    if prune(&mut child) {
                        child = Value::Mapping(Mapping::new());
                    }
                    (id, child)
                })
                .collect();
            references.push((key, kept));
        }
    }
    prune(&mut value);
    if let Value::Mapping(map) = &mut value {
        for (key, children) in references {
            if !children.is_empty() {
                map.insert(Value::String(key.into()), Value::Mapping(children));
            }
        }
    }
    Ok(value)
}
