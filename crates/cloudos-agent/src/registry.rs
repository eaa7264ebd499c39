use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use cloudos_action::ActionMap;
use tokio::io::AsyncWriteExt;

use crate::argv;
use crate::error::RegistryError;

/// Installed on first run, or whenever the store cannot be read.
pub fn builtin_actions() -> ActionMap {
    let mut out = ActionMap::new();
    for (name, argv) in [
        ("restart_nginx", &["sudo", "systemctl", "restart", "nginx"][..]),
        ("stop_nginx", &["sudo", "systemctl", "stop", "nginx"][..]),
        ("start_nginx", &["sudo", "systemctl", "start", "nginx"][..]),
        ("get_logs", &["tail", "-n", "50", "/var/log/syslog"][..]),
        ("update_system", &["sudo", "apt", "update"][..]),
        ("whoami", &["whoami"][..]),
    ] {
        out.insert(
            name.to_string(),
            argv.iter().map(|s| s.to_string()).collect(),
        );
    }
    out
}

/// Durable allowlist of named actions.
///
/// Readers grab an immutable snapshot; writers are serialized by `write_gate` for the
/// whole validate -> persist -> publish sequence, so a failed write never becomes
/// visible.
#[derive(Debug)]
pub struct ActionRegistry {
    path: PathBuf,
    snapshot: RwLock<Arc<ActionMap>>,
    write_gate: tokio::sync::Mutex<()>,
}

impl ActionRegistry {
    /// Wraps an explicit mapping. Nothing is written until the first mutation.
    pub fn with_actions(path: impl Into<PathBuf>, actions: ActionMap) -> Self {
        Self {
            path: path.into(),
            snapshot: RwLock::new(Arc::new(actions)),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Reads the store at `path`. Never fails: a missing store is seeded with the
    /// built-in defaults, an unreadable one is logged and replaced in memory by them.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let actions = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<ActionMap>(&bytes) {
                Ok(map) => {
                    let map = drop_empty(map);
                    tracing::info!(path = %path.display(), actions = map.len(), "action registry loaded");
                    map
                }
                Err(e) => {
                    tracing::error!(
                        path = %path.display(),
                        error = %e,
                        "action registry is corrupt; falling back to built-in actions"
                    );
                    builtin_actions()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let defaults = builtin_actions();
                match persist(&path, &defaults).await {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "seeded action registry with built-in actions")
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to seed action registry")
                    }
                }
                defaults
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    "action registry unreadable; falling back to built-in actions"
                );
                builtin_actions()
            }
        };

        Self::with_actions(path, actions)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current mapping. Cheap; later mutations do not affect the returned value.
    pub fn list(&self) -> Arc<ActionMap> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Vec<String>> {
        self.list().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.list().contains_key(name)
    }

    /// Rewrites the store from the current mapping.
    pub async fn save(&self) -> Result<(), RegistryError> {
        let _gate = self.write_gate.lock().await;
        persist(&self.path, &self.list()).await
    }

    /// Tokenizes `raw_command` and stores it under `name`, replacing any prior entry.
    /// The registry is untouched unless the new mapping was persisted.
    pub async fn add(&self, name: &str, raw_command: &str) -> Result<Vec<String>, RegistryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let argv = argv::split(raw_command)?;
        let Some(program) = argv.first() else {
            return Err(RegistryError::EmptyCommand);
        };
        if resolve_program(program).await.is_none() {
            return Err(RegistryError::ProgramNotFound(program.clone()));
        }

        let _gate = self.write_gate.lock().await;
        let mut next = (*self.list()).clone();
        let replaced = next.insert(name.to_string(), argv.clone()).is_some();
        persist(&self.path, &next).await?;
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(next);

        tracing::info!(action = %name, argv = ?argv, replaced, "action registered");
        Ok(argv)
    }
}

fn drop_empty(map: ActionMap) -> ActionMap {
    map.into_iter()
        .filter(|(name, argv)| {
            let keep = !name.trim().is_empty() && !argv.is_empty();
            if !keep {
                tracing::warn!(action = %name, "skipping action with empty name or command");
            }
            keep
        })
        .collect()
}

async fn persist(path: &Path, actions: &ActionMap) -> Result<(), RegistryError> {
    let io_err = |source: std::io::Error| RegistryError::Persist {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut data = serde_json::to_vec_pretty(actions)?;
    data.push(b'\n');

    let mut f = tokio::fs::File::create(&tmp).await.map_err(io_err)?;
    f.write_all(&data).await.map_err(io_err)?;
    f.sync_all().await.map_err(io_err)?;
    drop(f);
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

/// Locates `program` the way `execvp` would: paths with a slash are used as-is, bare
/// names are searched on `PATH`.
pub async fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let p = PathBuf::from(program);
        return is_executable(&p).await.then_some(p);
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
async fn is_executable(p: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(p)
        .await
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
async fn is_executable(p: &Path) -> bool {
    tokio::fs::metadata(p)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
