use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::error::{PatchError, Result};
use crate::patch_list::PatchList;
use crate::util;

/// A pair of patch roots searched together: the user's own patches take
/// precedence over the ones shipped with the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSource {
    pub user: PathBuf,
    pub installed: PathBuf,
}

/// A place patches are applied to, typically one simulator installation.
pub trait PatchDestination: Send + Sync {
    fn description(&self) -> &str;

    fn root_folder(&self) -> &Path;

    /// Take the exclusive lock guarding this destination against concurrent patching.
    fn try_lock(&self) -> Result<()>;

    fn try_unlock(&self) -> Result<()>;

    /// Current content of a target file, `None` if it does not exist here.
    fn try_get_source(&self, target_path: &str) -> Result<Option<String>>;

    fn try_write_patched(&self, target_path: &str, patched: &str) -> Result<()>;

    /// Pick the patches of `patch_set` under `source` that suit this destination.
    /// `selected_version` is raised when the chosen version is higher than it.
    fn select_patches(
        &self,
        source: &PatchSource,
        selected_version: &mut Option<String>,
        patch_set: &str,
    ) -> Result<Option<PatchList>>;

    /// Where a write journal for this destination is persisted, if anywhere.
    fn journal_path(&self) -> Option<PathBuf> {
        None
    }
}

/// A lock file this young may still be waiting for its owner's PID.
const LOCK_WRITE_GRACE: Duration = Duration::from_secs(5);

/// A destination backed by a directory tree on the local file system.
///
/// The lock file and write journal live in `state_dir`, named after a hash of
/// the root, so every process configured alike (including the elevated
/// helper) agrees on them. The lock file holds the owner's PID and is
/// reclaimed once that process is gone.
#[derive(Debug)]
pub struct FileDestination {
    description: String,
    root: PathBuf,
    installed_version: Option<String>,
    state_dir: PathBuf,
    state_stem: PathBuf,
    holds_lock: AtomicBool,
}

impl FileDestination {
    pub fn new(
        description: impl Into<String>,
        root: impl Into<PathBuf>,
        installed_version: Option<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        let root = root.into();
        let state_dir = state_dir.into();
        let canonical = root.canonicalize().unwrap_or_else(|_| root.clone());
        let digest = blake3::hash(canonical.to_string_lossy().as_bytes()).to_hex();
        let state_stem = state_dir.join(format!("helios-patching-{}", &digest.as_str()[..16]));
        Self {
            description: description.into(),
            root,
            installed_version,
            state_dir,
            state_stem,
            holds_lock: AtomicBool::new(false),
        }
    }

    pub fn installed_version(&self) -> Option<&str> {
        self.installed_version.as_deref()
    }

    fn lock_path(&self) -> PathBuf {
        self.state_stem.with_extension("lock")
    }

    fn create_lock(path: &Path) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        write!(file, "{}", std::process::id())?;
        file.flush()
    }

    /// A lock file whose owner has exited, or that never got an owner.
    fn is_stale(path: &Path) -> bool {
        match std::fs::read_to_string(path) {
            Ok(text) => match text.trim().parse::<u32>() {
                Ok(owner) => !process_alive(owner),
                Err(_) => std::fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok())
                    .is_some_and(|age| age > LOCK_WRITE_GRACE),
            },
            Err(_) => false,
        }
    }

    fn target(&self, target_path: &str) -> PathBuf {
        target_path
            .split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn is_compatible(&self, version: &str) -> bool {
        self.installed_version
            .as_deref()
            .map_or(true, |installed| version <= installed)
    }

    /// Version directories under `root` that contain `patch_set`.
    fn versions_in(root: &Path, patch_set: &str) -> BTreeSet<String> {
        let Ok(read_dir) = std::fs::read_dir(root) else {
            return BTreeSet::new();
        };
        read_dir
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(patch_set).is_dir())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect()
    }
}

impl PatchDestination for FileDestination {
    fn description(&self) -> &str {
        &self.description
    }

    fn root_folder(&self) -> &Path {
        &self.root
    }

    fn try_lock(&self) -> Result<()> {
        let path = self.lock_path();
        std::fs::create_dir_all(&self.state_dir).map_err(|e| PatchError::io(&self.state_dir, e))?;
        let mut reclaimed = false;
        loop {
            match Self::create_lock(&path) {
                Ok(()) => {
                    self.holds_lock.store(true, Ordering::SeqCst);
                    debug!("Locked {} via {}", self.description, path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if reclaimed || !Self::is_stale(&path) {
                        return Err(PatchError::Locked(self.description.clone()));
                    }
                    warn!(
                        "Reclaiming stale lock on {} left by a process that no longer runs",
                        self.description
                    );
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(PatchError::io(path, e)),
                    }
                    reclaimed = true;
                }
                Err(e) => return Err(PatchError::io(path, e)),
            }
        }
    }

    fn try_unlock(&self) -> Result<()> {
        let path = self.lock_path();
        self.holds_lock.store(false, Ordering::SeqCst);
        std::fs::remove_file(&path).map_err(|e| PatchError::io(path, e))
    }

    fn try_get_source(&self, target_path: &str) -> Result<Option<String>> {
        let path = self.target(target_path);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| PatchError::Encoding(path.clone()))?;
                Ok(Some(util::strip_bom(&text).to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PatchError::io(path, e)),
        }
    }

    fn try_write_patched(&self, target_path: &str, patched: &str) -> Result<()> {
        let path = self.target(target_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PatchError::io(parent, e))?;
        }
        std::fs::write(&path, patched.as_bytes()).map_err(|e| PatchError::io(path, e))
    }

    fn select_patches(
        &self,
        source: &PatchSource,
        selected_version: &mut Option<String>,
        patch_set: &str,
    ) -> Result<Option<PatchList>> {
        let mut candidates = Self::versions_in(&source.user, patch_set);
        candidates.extend(Self::versions_in(&source.installed, patch_set));

        let Some(version) = candidates.into_iter().filter(|v| self.is_compatible(v)).max() else {
            debug!(
                "No compatible {} patches for {} in {}",
                patch_set,
                self.description,
                util::anonymize_path(&source.installed)
            );
            return Ok(None);
        };

        let user_dir = source.user.join(&version).join(patch_set);
        let installed_dir = source.installed.join(&version).join(patch_set);
        let list = PatchList::load_patches(&user_dir, &installed_dir)?;

        if selected_version.as_deref().map_or(true, |current| version.as_str() > current) {
            *selected_version = Some(version);
        } else {
            warn!(
                "Patch version {} for {} is not newer than {}",
                version,
                self.description,
                selected_version.as_deref().unwrap_or_default()
            );
        }
        Ok(Some(list))
    }

    fn journal_path(&self) -> Option<PathBuf> {
        Some(self.state_stem.with_extension("journal"))
    }
}

impl Drop for FileDestination {
    fn drop(&mut self) {
        if self.holds_lock.load(Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(self.lock_path()) {
                warn!("Failed to release lock on {}: {}", self.description, e);
            }
        }
    }
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_patch(root: &Path, version: &str, set: &str, target: &str) {
        let path = root.join(version).join(set).join(format!("{}.gpatch", target));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "@@ -1,3 +1,4 @@\n abc\n+d\n").unwrap();
    }

    #[test]
    fn test_read_write_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", dir.path(), None, state.path());
        assert_eq!(dest.try_get_source("Scripts/Export.lua").unwrap(), None);
        dest.try_write_patched("Scripts/Export.lua", "abc").unwrap();
        assert_eq!(dest.try_get_source("Scripts/Export.lua").unwrap().as_deref(), Some("abc"));
        assert!(dir.path().join("Scripts").join("Export.lua").is_file());
    }

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", dir.path(), None, state.path());
        let other = FileDestination::new("other handle", dir.path(), None, state.path());
        dest.try_lock().unwrap();
        assert!(matches!(other.try_lock(), Err(PatchError::Locked(_))));
        dest.try_unlock().unwrap();
        other.try_lock().unwrap();
        other.try_unlock().unwrap();
    }

    #[test]
    fn test_lock_and_journal_live_in_state_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let nested = state.path().join("helios").join("state");
        let dest = FileDestination::new("test", dir.path(), None, &nested);
        assert!(dest.journal_path().unwrap().starts_with(&nested));
        dest.try_lock().unwrap();
        let locks: Vec<_> = fs::read_dir(&nested).unwrap().filter_map(|e| e.ok()).collect();
        assert_eq!(locks.len(), 1);
        assert_eq!(
            fs::read_to_string(locks[0].path()).unwrap(),
            std::process::id().to_string()
        );
        dest.try_unlock().unwrap();
    }

    #[test]
    fn test_lock_of_exited_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", dir.path(), None, state.path());
        fs::write(dest.lock_path(), u32::MAX.to_string()).unwrap();
        dest.try_lock().unwrap();
        assert_eq!(
            fs::read_to_string(dest.lock_path()).unwrap(),
            std::process::id().to_string()
        );
        dest.try_unlock().unwrap();
    }

    #[test]
    fn test_fresh_ownerless_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", dir.path(), None, state.path());
        fs::write(dest.lock_path(), "").unwrap();
        assert!(matches!(dest.try_lock(), Err(PatchError::Locked(_))));
    }

    #[test]
    fn test_dropped_holder_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", dir.path(), None, state.path());
        dest.try_lock().unwrap();
        drop(dest);

        let again = FileDestination::new("test", dir.path(), None, state.path());
        again.try_lock().unwrap();
        again.try_unlock().unwrap();
    }

    #[test]
    fn test_select_highest_compatible_version() {
        let patches = tempfile::tempdir().unwrap();
        let source = PatchSource {
            user: patches.path().join("user"),
            installed: patches.path().join("installed"),
        };
        write_patch(&source.installed, "002_005", "Helios", "a.lua");
        write_patch(&source.installed, "002_007", "Helios", "b.lua");
        write_patch(&source.installed, "002_009", "Helios", "c.lua");

        let root = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", root.path(), Some("002_008".into()), root.path().join(".state"));
        let mut selected = None;
        let list = dest.select_patches(&source, &mut selected, "Helios").unwrap().unwrap();
        assert_eq!(selected.as_deref(), Some("002_007"));
        assert_eq!(list.target_paths().collect::<Vec<_>>(), vec!["b.lua"]);
    }

    #[test]
    fn test_select_nothing_for_other_patch_set() {
        let patches = tempfile::tempdir().unwrap();
        let source = PatchSource {
            user: patches.path().join("user"),
            installed: patches.path().join("installed"),
        };
        write_patch(&source.installed, "002_005", "Viewports", "a.lua");
        let root = tempfile::tempdir().unwrap();
        let dest = FileDestination::new("test", root.path(), None, root.path().join(".state"));
        let mut selected = None;
        assert!(dest.select_patches(&source, &mut selected, "Helios").unwrap().is_none());
        assert!(selected.is_none());
    }
}
