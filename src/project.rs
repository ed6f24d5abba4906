//! Project lifecycle and per-module settings storage.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no settings stored for module {0}")]
    NotFound(String),
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_yaml::Error),
    #[error("settings backend failed: {0}")]
    Backend(String),
}

/// Stores one settings blob per module.
pub trait SettingsRepository: Send + Sync {
    fn upsert(&self, module: &str, settings: serde_yaml::Value) -> Result<(), RepositoryError>;

    /// Returns [`RepositoryError::NotFound`] if nothing was stored for
    /// `module`.
    fn find_by_module(&self, module: &str) -> Result<serde_yaml::Value, RepositoryError>;
}

/// Serializes `settings` and stores them under `module`.
pub fn save_settings<T: Serialize>(
    repo: &dyn SettingsRepository,
    module: &str,
    settings: &T,
) -> Result<(), RepositoryError> {
    repo.upsert(module, serde_yaml::to_value(settings)?)
}

/// Loads and deserializes the settings stored under `module`.
pub fn load_settings<T: DeserializeOwned>(
    repo: &dyn SettingsRepository,
    module: &str,
) -> Result<T, RepositoryError> {
    Ok(serde_yaml::from_value(repo.find_by_module(module)?)?)
}

/// In-process settings repository.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    settings: RwLock<HashMap<String, serde_yaml::Value>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsRepository for MemoryRepository {
    fn upsert(&self, module: &str, settings: serde_yaml::Value) -> Result<(), RepositoryError> {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.to_string(), settings);
        Ok(())
    }

    fn find_by_module(&self, module: &str) -> Result<serde_yaml::Value, RepositoryError> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(module.to_string()))
    }
}

/// Failure reported by a lifecycle observer.
pub type ObserverError = Box<dyn StdError + Send + Sync>;

/// Called with the project name on open or close.
pub type Observer = Arc<dyn Fn(&str) -> Result<(), ObserverError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("invalid project name: {0:?}")]
    InvalidName(String),
    #[error("no project is open")]
    NotOpen,
    #[error("{} project observer(s) failed: {}", .0.len(), .0.join("; "))]
    Observers(Vec<String>),
}

/// A project and whether it is the active one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub name: String,
    pub is_active: bool,
}

/// Owns the active project and notifies observers when it changes.
pub struct Target {
    repo: Arc<dyn SettingsRepository>,
    active: RwLock<Option<String>>,
    on_open: RwLock<Vec<Observer>>,
    on_close: RwLock<Vec<Observer>>,
}

impl Target {
    pub fn new(repo: Arc<dyn SettingsRepository>) -> Self {
        Self {
            repo,
            active: RwLock::new(None),
            on_open: RwLock::new(Vec::new()),
            on_close: RwLock::new(Vec::new()),
        }
    }

    pub fn repository(&self) -> &Arc<dyn SettingsRepository> {
        &self.repo
    }

    pub fn on_open(&self, observer: Observer) {
        self.on_open
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn on_close(&self, observer: Observer) {
        self.on_close
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// The active project, if any.
    pub fn active(&self) -> Option<Project> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|name| Project {
                name: name.clone(),
                is_active: true,
            })
    }

    /// Opens `name`, closing the currently active project first.
    ///
    /// Every observer runs even if an earlier one fails; failures are
    /// returned together after the project has switched.
    pub fn open(&self, name: &str) -> Result<Project, ProjectError> {
        let name = name.trim();
        if !valid_name(name) {
            return Err(ProjectError::InvalidName(name.to_string()));
        }

        let mut failures = Vec::new();
        let previous = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(name.to_string());
        if let Some(previous) = previous {
            failures.extend(notify(&self.on_close, &previous));
        }
        failures.extend(notify(&self.on_open, name));
        info!("project {} opened", name);

        let project = Project {
            name: name.to_string(),
            is_active: true,
        };
        if failures.is_empty() {
            Ok(project)
        } else {
            Err(ProjectError::Observers(failures))
        }
    }

    /// Closes the active project.
    pub fn close(&self) -> Result<(), ProjectError> {
        let name = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ProjectError::NotOpen)?;

        let failures = notify(&self.on_close, &name);
        info!("project {} closed", name);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProjectError::Observers(failures))
        }
    }
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == ' ' || c == '-' || c == '_')
}

/// Runs every observer outside the registry lock so they may call back
/// into the target.
fn notify(observers: &RwLock<Vec<Observer>>, name: &str) -> Vec<String> {
    let observers = observers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();

    observers
        .iter()
        .filter_map(|observer| match observer(name) {
            Ok(()) => None,
            Err(e) => {
                warn!("project {} observer failed: {}", name, e);
                Some(e.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct InterceptSettings {
        enabled: bool,
        hosts: Vec<String>,
    }

    fn target() -> Target {
        Target::new(Arc::new(MemoryRepository::new()))
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Observer {
        let log = Arc::clone(log);
        Arc::new(move |name: &str| -> Result<(), ObserverError> {
            log.lock().unwrap().push(format!("{tag}:{name}"));
            Ok(())
        })
    }

    #[test]
    fn missing_module_is_not_found() {
        let repo = MemoryRepository::new();
        assert!(matches!(
            repo.find_by_module("intercept"),
            Err(RepositoryError::NotFound(m)) if m == "intercept"
        ));
    }

    #[test]
    fn settings_round_trip_through_repository() {
        let repo = MemoryRepository::new();
        let settings = InterceptSettings {
            enabled: true,
            hosts: vec!["example.internal".into()],
        };
        save_settings(&repo, "intercept", &settings).unwrap();
        let loaded: InterceptSettings = load_settings(&repo, "intercept").unwrap();
        assert_eq!(loaded, settings);

        let replaced = InterceptSettings {
            enabled: false,
            hosts: Vec::new(),
        };
        save_settings(&repo, "intercept", &replaced).unwrap();
        let loaded: InterceptSettings = load_settings(&repo, "intercept").unwrap();
        assert_eq!(loaded, replaced);
    }

    #[test]
    fn open_switches_projects_and_notifies() {
        let log = Arc::default();
        let target = target();
        target.on_open(recording(&log, "open"));
        target.on_close(recording(&log, "close"));

        target.open("alpha").unwrap();
        target.open("beta").unwrap();
        target.close().unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["open:alpha", "close:alpha", "open:beta", "close:beta"]
        );
        assert!(target.active().is_none());
    }

    /// A failing observer is reported but the others still run.
    #[test]
    fn observer_failure_does_not_stop_others() {
        let log = Arc::default();
        let target = target();
        target.on_open(Arc::new(|_: &str| -> Result<(), ObserverError> {
            Err("disk full".into())
        }));
        target.on_open(recording(&log, "open"));

        let err = target.open("alpha").unwrap_err();
        assert!(matches!(&err, ProjectError::Observers(f) if f == &["disk full"]));
        assert_eq!(*log.lock().unwrap(), vec!["open:alpha"]);
        assert_eq!(target.active().unwrap().name, "alpha");
    }

    #[test]
    fn observers_may_read_the_target() {
        let target = Arc::new(target());
        let seen = Arc::new(Mutex::new(None));
        let (t, s) = (Arc::downgrade(&target), Arc::clone(&seen));
        target.on_open(Arc::new(move |_: &str| -> Result<(), ObserverError> {
            *s.lock().unwrap() = t.upgrade().and_then(|t| t.active());
            Ok(())
        }));

        target.open("alpha").unwrap();
        assert_eq!(seen.lock().unwrap().as_ref().unwrap().name, "alpha");
    }

    #[test]
    fn invalid_names_and_double_close() {
        let target = target();
        assert!(matches!(target.open("  "), Err(ProjectError::InvalidName(_))));
        assert!(matches!(target.open("a/b"), Err(ProjectError::InvalidName(_))));
        assert!(matches!(target.close(), Err(ProjectError::NotOpen)));

        target.open("my project").unwrap();
        target.close().unwrap();
        assert!(matches!(target.close(), Err(ProjectError::NotOpen)));
    }
}
