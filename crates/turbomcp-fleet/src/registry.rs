//! Durable store of server configurations
//!
//! The registry keeps every [`ServerConfig`] in memory and, when backed by a
//! file, mirrors it to a single JSON document mapping server id to config.
//! Reads only touch the in-memory map. Every mutation is serialized by one
//! async lock owned by this registry instance; the new document is written
//! to a temporary file and renamed into place before memory is updated, so a
//! rejected or failed write never becomes visible.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::ServerConfig;
use crate::error::{FleetError, FleetResult};

type ServerMap = BTreeMap<String, ServerConfig>;

/// Registry of server configurations
#[derive(Debug)]
pub struct Registry {
    path: Option<PathBuf>,
    servers: RwLock<ServerMap>,
    write_lock: Mutex<()>,
}

impl Registry {
    /// Registry persisted at `path`; call [`Registry::load`] to read it
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            servers: RwLock::new(ServerMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Registry without persistence
    pub fn in_memory() -> Self {
        Self {
            path: None,
            servers: RwLock::new(ServerMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replace the in-memory contents with the persisted document
    ///
    /// A missing file is an empty registry. Entries that fail validation
    /// are kept but logged, so a hand-edited file never loses data.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load(&self) -> FleetResult<usize> {
        let _guard = self.write_lock.lock().await;
        let Some(path) = &self.path else {
            return Ok(self.servers.read().len());
        };

        let mut servers = match tokio::fs::read_to_string(path).await {
            Ok(raw) if raw.trim().is_empty() => ServerMap::new(),
            Ok(raw) => serde_json::from_str::<ServerMap>(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ServerMap::new(),
            Err(e) => return Err(e.into()),
        };

        for (id, config) in &mut servers {
            if config.id != *id {
                config.id.clone_from(id);
            }
            let errors = config.validate();
            if !errors.is_empty() {
                tracing::warn!(server_id = %id, errors = ?errors, "Registry entry failed validation");
            }
        }

        let count = servers.len();
        *self.servers.write() = servers;
        tracing::info!(path = %path.display(), servers = count, "Registry loaded");
        Ok(count)
    }

    /// Write the current contents to the backing file
    ///
    /// # Errors
    ///
    /// Returns an error if the document cannot be written.
    pub async fn persist(&self) -> FleetResult<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.servers.read().clone();
        self.write_document(&snapshot).await
    }

    async fn write_document(&self, servers: &ServerMap) -> FleetResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_vec_pretty(servers)?;
        let temp_path = path.with_extension("json.tmp");
        {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&temp_path, path).await?;

        tracing::debug!(path = %path.display(), servers = servers.len(), "Registry persisted");
        Ok(())
    }

    /// Problems that would stop `config` from being registered
    ///
    /// Combines the config's own shape checks with name uniqueness against
    /// the other registered servers. Has no side effects.
    pub fn validate(&self, config: &ServerConfig) -> Vec<String> {
        let mut errors = config.validate();
        let servers = self.servers.read();
        if servers
            .values()
            .any(|other| other.name == config.name && other.id != config.id)
        {
            errors.push(format!("a server named '{}' already exists", config.name));
        }
        errors
    }

    /// Add a new server and return its id
    ///
    /// An empty id is replaced with a generated one.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the config is malformed, or its name or id is
    /// already taken; nothing is persisted in that case.
    pub async fn register(&self, mut config: ServerConfig) -> FleetResult<String> {
        let _guard = self.write_lock.lock().await;

        if config.id.trim().is_empty() {
            config.id = uuid::Uuid::new_v4().to_string();
        }

        let mut errors = self.validate(&config);
        let mut next = self.servers.read().clone();
        if next.contains_key(&config.id) {
            errors.push(format!("a server with id '{}' already exists", config.id));
        }
        if !errors.is_empty() {
            return Err(FleetError::validation(errors));
        }

        let id = config.id.clone();
        next.insert(id.clone(), config);
        self.write_document(&next).await?;
        *self.servers.write() = next;

        tracing::info!(server_id = %id, "Server registered");
        Ok(id)
    }

    /// Remove a server; `false` if it was not registered
    ///
    /// # Errors
    ///
    /// Returns an error only if the updated document cannot be written.
    pub async fn unregister(&self, id: &str) -> FleetResult<bool> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.servers.read().clone();
        if next.remove(id).is_none() {
            return Ok(false);
        }
        self.write_document(&next).await?;
        *self.servers.write() = next;

        tracing::info!(server_id = %id, "Server unregistered");
        Ok(true)
    }

    /// Replace the config of `id`; `false` if it was not registered
    ///
    /// The stored id is kept whatever `config.id` says.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the new config is malformed or its name
    /// belongs to another server.
    pub async fn update(&self, id: &str, mut config: ServerConfig) -> FleetResult<bool> {
        let _guard = self.write_lock.lock().await;

        if !self.servers.read().contains_key(id) {
            return Ok(false);
        }

        config.id = id.to_string();
        let errors = self.validate(&config);
        if !errors.is_empty() {
            return Err(FleetError::validation(errors));
        }

        let mut next = self.servers.read().clone();
        next.insert(config.id.clone(), config);
        self.write_document(&next).await?;
        *self.servers.write() = next;

        tracing::debug!(server_id = %id, "Server config updated");
        Ok(true)
    }

    /// Flip the enabled flag of `id` in place; `false` if it was not registered
    ///
    /// Only the flag changes, so a concurrent [`Registry::update`] is never
    /// overwritten with an older config.
    ///
    /// # Errors
    ///
    /// Returns an error only if the updated document cannot be written.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> FleetResult<bool> {
        let _guard = self.write_lock.lock().await;

        let mut next = self.servers.read().clone();
        let Some(config) = next.get_mut(id) else {
            return Ok(false);
        };
        config.enabled = enabled;
        self.write_document(&next).await?;
        *self.servers.write() = next;

        tracing::debug!(server_id = %id, enabled, "Server enabled flag updated");
        Ok(true)
    }

    /// Config registered under `id`
    pub fn get(&self, id: &str) -> Option<ServerConfig> {
        self.servers.read().get(id).cloned()
    }

    /// Config registered under `name`
    pub fn get_by_name(&self, name: &str) -> Option<ServerConfig> {
        self.servers
            .read()
            .values()
            .find(|config| config.name == name)
            .cloned()
    }

    /// Every registered config, sorted by name
    pub fn list_all(&self) -> Vec<ServerConfig> {
        let mut configs: Vec<ServerConfig> = self.servers.read().values().cloned().collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        configs
    }

    /// Number of registered servers
    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    /// Whether no server is registered
    pub fn is_empty(&self) -> bool {
        self.servers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn registry_in(dir: &TempDir) -> Registry {
        Registry::new(dir.path().join("fleet.json"))
    }

    #[tokio::test]
    async fn test_register_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        let config = ServerConfig::stdio("files", "npx", vec!["fs-server".into()]);
        let id = registry.register(config.clone()).await.unwrap();
        assert!(!id.is_empty());

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored, config.with_id(id.clone()));
        assert_eq!(registry.get_by_name("files").unwrap().id, id);

        assert!(registry.unregister(&id).await.unwrap());
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected_and_not_persisted() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);

        registry
            .register(ServerConfig::http("api", "http://localhost:8080"))
            .await
            .unwrap();
        let err = registry
            .register(ServerConfig::sse("api", "http://localhost:9090/sse"))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation { .. }));

        let reloaded = registry_in(&dir);
        assert_eq!(reloaded.load().await.unwrap(), 1);
        let only = reloaded.get_by_name("api").unwrap();
        assert_eq!(only.connection.target(), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_missing_required_field_is_rejected() {
        let registry = Registry::in_memory();
        let err = registry
            .register(ServerConfig::http("api", ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a url"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = Registry::in_memory();
        let id = registry
            .register(ServerConfig::stdio("echo", "cat", vec![]))
            .await
            .unwrap();

        assert!(registry.unregister(&id).await.unwrap());
        assert!(!registry.unregister(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_keeps_id_and_checks_names() {
        let registry = Registry::in_memory();
        let a = registry
            .register(ServerConfig::stdio("a", "cat", vec![]))
            .await
            .unwrap();
        registry
            .register(ServerConfig::stdio("b", "cat", vec![]))
            .await
            .unwrap();

        let renamed = ServerConfig::stdio("a2", "cat", vec![]).with_id("ignored");
        assert!(registry.update(&a, renamed).await.unwrap());
        assert_eq!(registry.get(&a).unwrap().name, "a2");
        assert!(registry.get("ignored").is_none());

        let clash = ServerConfig::stdio("b", "cat", vec![]);
        assert!(registry.update(&a, clash).await.is_err());

        let unknown = ServerConfig::stdio("c", "cat", vec![]);
        assert!(!registry.update("missing", unknown).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_enabled_keeps_concurrent_update() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        let id = registry
            .register(ServerConfig::http("api", "http://localhost:8080"))
            .await
            .unwrap();

        let moved = ServerConfig::http("api", "http://localhost:9090");
        let (updated, toggled) =
            tokio::join!(registry.update(&id, moved), registry.set_enabled(&id, false));
        assert!(updated.unwrap());
        assert!(toggled.unwrap());
        assert_eq!(
            registry.get(&id).unwrap().connection.target(),
            "http://localhost:9090"
        );

        assert!(registry.set_enabled(&id, false).await.unwrap());
        let reloaded = registry_in(&dir);
        reloaded.load().await.unwrap();
        let stored = reloaded.get(&id).unwrap();
        assert!(!stored.enabled);
        assert_eq!(stored.connection.target(), "http://localhost:9090");

        assert!(!registry.set_enabled("missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_survives_restart() {
        let dir = TempDir::new().unwrap();
        let registry = registry_in(&dir);
        registry
            .register(ServerConfig::stdio("one", "cat", vec![]).with_id("s1"))
            .await
            .unwrap();
        registry
            .register(
                ServerConfig::http("two", "https://example.com/mcp")
                    .with_id("s2")
                    .with_enabled(false),
            )
            .await
            .unwrap();

        let reloaded = registry_in(&dir);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(reloaded.list_all(), registry.list_all());
        assert!(!dir.path().join("fleet.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new(dir.path().join("nested").join("fleet.json"));
        assert_eq!(registry.load().await.unwrap(), 0);

        registry
            .register(ServerConfig::stdio("one", "cat", vec![]))
            .await
            .unwrap();
        assert!(dir.path().join("nested").join("fleet.json").exists());
    }
}
