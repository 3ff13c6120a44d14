use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::application::{PatchApplication, RemoteInvocation};
use crate::destination::{FileDestination, PatchSource};
use crate::installation::PatchInstallation;
use crate::patch_file::VerifyMode;

/// Persisted key/value settings, grouped like sections of an INI file.
pub trait SettingsStore: Send + Sync {
    fn load_setting(&self, group: &str, name: &str) -> Option<String>;

    fn save_setting(&self, group: &str, name: &str, value: &str) -> Result<()>;
}

type Groups = BTreeMap<String, BTreeMap<String, String>>;

/// Settings kept in a TOML file, one table per group.
#[derive(Debug)]
pub struct TomlSettings {
    path: PathBuf,
    groups: Mutex<Groups>,
}

impl TomlSettings {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("helios")
            .join("settings.toml")
    }

    /// Open the settings file; a missing file starts out empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let groups = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings: {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("Invalid settings file: {}", path.display()))?
        } else {
            Groups::new()
        };
        Ok(Self {
            path,
            groups: Mutex::new(groups),
        })
    }
}

impl SettingsStore for TomlSettings {
    fn load_setting(&self, group: &str, name: &str) -> Option<String> {
        let groups = self.groups.lock().ok()?;
        groups.get(group)?.get(name).cloned()
    }

    fn save_setting(&self, group: &str, name: &str, value: &str) -> Result<()> {
        let mut groups = self
            .groups
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?;
        groups
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        let text = toml::to_string(&*groups).context("Failed to serialize settings")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&self.path, text)
            .with_context(|| format!("Failed to write settings: {}", self.path.display()))
    }
}

/// Settings that live only as long as the process.
#[derive(Debug, Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<(String, String), String>>,
}

impl SettingsStore for MemorySettings {
    fn load_setting(&self, group: &str, name: &str) -> Option<String> {
        let values = self.values.lock().ok()?;
        values.get(&(group.to_string(), name.to_string())).cloned()
    }

    fn save_setting(&self, group: &str, name: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))?
            .insert((group.to_string(), name.to_string()), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Unique name, also used on the command line.
    pub key: String,
    pub root: PathBuf,
    /// Installed simulator version; patches for newer versions are ignored.
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_remote: bool,
}

fn default_true() -> bool {
    true
}

/// Which patches go where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchingConfiguration {
    pub patch_set: String,
    pub strict_verification: bool,
    /// Lock files and write journals. `load` defaults it to `state/` next to
    /// the configuration file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Searched in order.
    pub sources: Vec<PatchSource>,
    pub destinations: Vec<DestinationConfig>,
}

impl Default for PatchingConfiguration {
    fn default() -> Self {
        Self {
            patch_set: "Helios".to_string(),
            strict_verification: false,
            state_dir: None,
            sources: vec![default_source()],
            destinations: Vec::new(),
        }
    }
}

/// `<documents>/Helios/Patches/DCS` over `<program dir>/Patches/DCS`.
pub fn default_source() -> PatchSource {
    let documents = dirs::document_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir);
    let program_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    PatchSource {
        user: documents.join("Helios").join("Patches").join("DCS"),
        installed: program_dir.join("Patches").join("DCS"),
    }
}

impl PatchingConfiguration {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("helios")
            .join("patching.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration: {}", path.display()))?;
        let mut config: Self =
            toml::from_str(&text).with_context(|| format!("Invalid configuration: {}", path.display()))?;
        if config.sources.is_empty() {
            config.sources.push(default_source());
        }
        if config.state_dir.is_none() {
            config.state_dir = path.parent().map(|parent| parent.join("state"));
        }
        debug!(
            "Loaded {} destinations from {}",
            config.destinations.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, text).with_context(|| format!("Failed to write configuration: {}", path.display()))
    }

    pub fn destination(&self, key: &str) -> Option<&DestinationConfig> {
        self.destinations.iter().find(|d| d.key == key)
    }

    /// Where destinations keep their lock files and write journals.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("helios")
                .join("state")
        })
    }

    pub fn verify_mode(&self) -> VerifyMode {
        if self.strict_verification {
            VerifyMode::Strict
        } else {
            VerifyMode::Heuristic
        }
    }

    pub fn build_application(&self, destination: &DestinationConfig) -> PatchApplication {
        let target = Arc::new(FileDestination::new(
            destination.key.clone(),
            destination.root.clone(),
            destination.version.clone(),
            self.state_dir(),
        ));
        let mut application = PatchApplication::new(
            destination.key.clone(),
            target,
            destination.enabled,
            destination.use_remote,
            &self.patch_set,
            &self.sources,
        );
        application.set_verify_mode(self.verify_mode());
        application
    }

    /// One application per destination, with saved settings applied.
    pub fn build_installation(
        &self,
        settings: Arc<dyn SettingsStore>,
        remote: Option<RemoteInvocation>,
    ) -> PatchInstallation {
        let mut installation = PatchInstallation::new(settings);
        for destination in &self.destinations {
            let mut application = self.build_application(destination);
            if let Some(remote) = &remote {
                application.set_remote(remote.clone());
            }
            installation.on_added(application);
        }
        installation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::PatchDestination;

    #[test]
    fn test_parse_with_defaults() {
        let config: PatchingConfiguration = toml::from_str(
            r#"
            [[destinations]]
            key = "dcs"
            root = "/games/DCS World"
            "#,
        )
        .unwrap();
        assert_eq!(config.patch_set, "Helios");
        assert_eq!(config.sources.len(), 1);
        assert!(config.sources[0].user.ends_with("Helios/Patches/DCS"));
        let dcs = config.destination("dcs").unwrap();
        assert!(dcs.enabled);
        assert!(!dcs.use_remote);
        assert_eq!(dcs.version, None);
        assert_eq!(config.verify_mode(), VerifyMode::Heuristic);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("patching.toml");
        let config = PatchingConfiguration {
            patch_set: "Viewports".into(),
            strict_verification: true,
            state_dir: Some(dir.path().join("state")),
            sources: vec![PatchSource {
                user: dir.path().join("user"),
                installed: dir.path().join("installed"),
            }],
            destinations: vec![DestinationConfig {
                key: "openbeta".into(),
                root: dir.path().join("dcs"),
                version: Some("002_007".into()),
                enabled: false,
                use_remote: true,
            }],
        };
        config.save(&path).unwrap();
        assert_eq!(PatchingConfiguration::load(&path).unwrap(), config);
    }

    #[test]
    fn test_state_dir_defaults_next_to_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patching.toml");
        std::fs::write(&path, "patch_set = \"Helios\"\n").unwrap();
        let config = PatchingConfiguration::load(&path).unwrap();
        assert_eq!(config.state_dir(), dir.path().join("state"));

        let application = config.build_application(&DestinationConfig {
            key: "dcs".into(),
            root: dir.path().join("dcs"),
            version: None,
            enabled: true,
            use_remote: false,
        });
        assert!(application
            .destination()
            .journal_path()
            .unwrap()
            .starts_with(dir.path().join("state")));
    }

    #[test]
    fn test_toml_settings_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let settings = TomlSettings::open(&path).unwrap();
        assert_eq!(settings.load_setting("Patching", "PatchExclusions"), None);
        settings.save_setting("Patching", "PatchExclusions", "[\"a.lua\"]").unwrap();
        settings.save_setting("Destination.dcs", "Enabled", "false").unwrap();

        let reopened = TomlSettings::open(&path).unwrap();
        assert_eq!(
            reopened.load_setting("Patching", "PatchExclusions").as_deref(),
            Some("[\"a.lua\"]")
        );
        assert_eq!(reopened.load_setting("Destination.dcs", "Enabled").as_deref(), Some("false"));
    }

    #[test]
    fn test_memory_settings() {
        let settings = MemorySettings::default();
        settings.save_setting("g", "n", "v").unwrap();
        assert_eq!(settings.load_setting("g", "n").as_deref(), Some("v"));
        assert_eq!(settings.load_setting("g", "other"), None);
    }
}
