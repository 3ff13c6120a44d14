use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::PatchApplication;
use crate::config::SettingsStore;
use crate::journal::WriteJournal;
use crate::status::{has_errors, worst_severity, Severity, StatusCode, StatusReportItem};

const SETTINGS_GROUP: &str = "Patching";
const EXCLUSIONS_SETTING: &str = "PatchExclusions";
const REPAIR_HINT: &str =
    "Run the simulator's repair utility to restore its original files, then try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationPromptResult {
    Ok,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallationResult {
    Success,
    Canceled,
    Fatal,
}

/// How `install` and `uninstall` talk to whoever started them.
pub trait InstallationCallbacks {
    fn failure(&mut self, title: &str, message: &str, details: &[StatusReportItem]);

    /// Ask whether to go ahead despite the warnings in `details`.
    fn danger_prompt(&mut self, title: &str, message: &str, details: &[StatusReportItem]) -> InstallationPromptResult;

    fn success(&mut self, title: &str, message: &str, details: &[StatusReportItem]);
}

/// One distinct target path across all destinations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchedPath {
    pub path: String,
    pub excluded: bool,
}

/// A single edit to the sorted path list, for mirroring into a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChange {
    Inserted(usize, String),
    Removed(usize, String),
}

/// Every destination's patch application, installed and removed together.
pub struct PatchInstallation {
    applications: BTreeMap<String, PatchApplication>,
    status: StatusCode,
    patched_paths: Vec<PatchedPath>,
    exclusions: BTreeSet<String>,
    settings: Arc<dyn SettingsStore>,
}

impl PatchInstallation {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        let exclusions = settings
            .load_setting(SETTINGS_GROUP, EXCLUSIONS_SETTING)
            .and_then(|value| match serde_json::from_str(&value) {
                Ok(set) => Some(set),
                Err(e) => {
                    warn!("Ignoring unreadable {} setting: {}", EXCLUSIONS_SETTING, e);
                    None
                }
            })
            .unwrap_or_default();
        Self {
            applications: BTreeMap::new(),
            status: StatusCode::NotApplicable,
            patched_paths: Vec::new(),
            exclusions,
            settings,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn applications(&self) -> impl Iterator<Item = &PatchApplication> {
        self.applications.values()
    }

    pub fn application(&self, key: &str) -> Option<&PatchApplication> {
        self.applications.get(key)
    }

    pub fn application_mut(&mut self, key: &str) -> Option<&mut PatchApplication> {
        self.applications.get_mut(key)
    }

    pub fn patched_paths(&self) -> &[PatchedPath] {
        &self.patched_paths
    }

    pub fn exclusions(&self) -> &BTreeSet<String> {
        &self.exclusions
    }

    /// Take over an application, applying saved overrides and exclusions.
    pub fn on_added(&mut self, mut application: PatchApplication) -> Vec<PathChange> {
        let group = destination_group(application.key());
        if let Some(enabled) = self.load_flag(&group, "Enabled") {
            application.set_enabled(enabled);
        }
        if let Some(use_remote) = self.load_flag(&group, "UseRemote") {
            application.set_use_remote(use_remote);
        }
        application.set_exclusions(self.exclusions.clone());
        application.check_applied();
        info!("{} added with status {}", application.key(), application.status());
        self.applications.insert(application.key().to_string(), application);
        self.update_status()
    }

    pub fn on_removed(&mut self, key: &str) -> Vec<PathChange> {
        if self.applications.remove(key).is_none() {
            warn!("No destination {} to remove", key);
        }
        self.update_status()
    }

    pub fn on_enabled(&mut self, key: &str) -> Vec<PathChange> {
        self.set_enabled(key, true)
    }

    pub fn on_disabled(&mut self, key: &str) -> Vec<PathChange> {
        self.set_enabled(key, false)
    }

    pub fn set_use_remote(&mut self, key: &str, use_remote: bool) {
        let Some(application) = self.applications.get_mut(key) else {
            warn!("No destination {}", key);
            return;
        };
        application.set_use_remote(use_remote);
        self.save_flag(&destination_group(key), "UseRemote", use_remote);
    }

    fn set_enabled(&mut self, key: &str, enabled: bool) -> Vec<PathChange> {
        match self.applications.get_mut(key) {
            Some(application) => {
                application.set_enabled(enabled);
                self.save_flag(&destination_group(key), "Enabled", enabled);
            }
            None => warn!("No destination {}", key),
        }
        self.update_status()
    }

    /// Exclude `path` from (or return it to) every destination and save the choice.
    pub fn set_excluded(&mut self, path: &str, excluded: bool) -> anyhow::Result<()> {
        let changed = if excluded {
            self.exclusions.insert(path.to_string())
        } else {
            self.exclusions.remove(path)
        };
        if !changed {
            return Ok(());
        }
        if let Some(entry) = self.patched_paths.iter_mut().find(|p| p.path == path) {
            entry.excluded = excluded;
        }
        for application in self.applications.values_mut() {
            application.set_exclusions(self.exclusions.clone());
            application.check_applied();
        }
        self.update_status();
        let value = serde_json::to_string(&self.exclusions)?;
        self.settings.save_setting(SETTINGS_GROUP, EXCLUSIONS_SETTING, &value)
    }

    /// Recompute the aggregate status and the list of patched paths.
    pub fn update_status(&mut self) -> Vec<PathChange> {
        self.status = aggregate_status(
            self.applications
                .values()
                .filter(|a| a.is_enabled())
                .map(PatchApplication::status),
        );
        let desired: BTreeSet<String> = self
            .applications
            .values()
            .flat_map(|a| a.patches().target_paths().map(str::to_string))
            .collect();
        sync_paths(&mut self.patched_paths, &desired, &self.exclusions)
    }

    /// Simulate every enabled destination, ask about warnings, then write.
    /// A failure while writing undoes the destinations already written.
    pub fn install(&mut self, callbacks: &mut dyn InstallationCallbacks) -> InstallationResult {
        let mut preview = Vec::new();
        for application in self.applications.values().filter(|a| a.is_enabled()) {
            preview.extend(application.simulate());
        }
        if has_errors(&preview) {
            self.update_status();
            callbacks.failure(
                "Patch installation failed",
                "Some patches cannot be applied. No files were changed.",
                &preview,
            );
            return InstallationResult::Fatal;
        }
        if worst_severity(&preview) == Severity::Warning
            && callbacks.danger_prompt(
                "Apply imprecise patches?",
                "Some files differ from what the patches expect. The patches can still be applied, but the result should be reviewed.",
                &preview,
            ) == InstallationPromptResult::Cancel
        {
            info!("Installation canceled after simulation");
            return InstallationResult::Canceled;
        }

        let mut results = Vec::new();
        let mut journals: Vec<(String, WriteJournal)> = Vec::new();
        let mut remote_done: Vec<String> = Vec::new();
        let mut failed = None;
        for (key, application) in self.applications.iter_mut().filter(|(_, a)| a.is_enabled()) {
            let written = if application.use_remote() {
                let written = application.remote_apply();
                if !has_errors(&written) {
                    remote_done.push(key.clone());
                }
                written
            } else {
                let mut journal = WriteJournal::new(application.destination().as_ref());
                let written = application.apply_staged(&mut journal);
                journals.push((key.clone(), journal));
                written
            };
            let ok = !has_errors(&written);
            results.extend(written);
            if !ok {
                failed = Some(key.clone());
                break;
            }
        }

        if let Some(failed) = failed {
            warn!("Installation failed in {}; rolling back", failed);
            for (key, mut journal) in journals {
                if let Some(application) = self.applications.get_mut(&key) {
                    results.extend(journal.rollback(application.destination().as_ref()));
                    if key != failed {
                        application.check_applied();
                    }
                }
            }
            for key in remote_done {
                if let Some(application) = self.applications.get_mut(&key) {
                    results.extend(application.remote_revert());
                }
            }
            self.update_status();
            callbacks.failure(
                "Patch installation failed",
                "Patches could not be written. Changes already made were rolled back.",
                &results,
            );
            return InstallationResult::Fatal;
        }

        for (_, journal) in journals.iter_mut() {
            journal.commit();
        }
        self.update_status();
        if self.status == StatusCode::UpToDate {
            callbacks.success("Patches installed", "All patches were installed.", &results);
            InstallationResult::Success
        } else {
            callbacks.failure(
                "Patch installation incomplete",
                &format!("Patches were written, but the installation is {}.", self.status),
                &results,
            );
            InstallationResult::Fatal
        }
    }

    /// Revert every enabled destination, stopping at the first failure.
    pub fn uninstall(&mut self, callbacks: &mut dyn InstallationCallbacks) -> InstallationResult {
        let mut results = Vec::new();
        let mut failed = None;
        for application in self.applications.values_mut().filter(|a| a.is_enabled()) {
            let reverted = application.revert();
            let ok = !has_errors(&reverted);
            results.extend(reverted);
            if !ok {
                failed = Some(application.key().to_string());
                break;
            }
        }
        if let Some(failed) = failed {
            results.push(
                StatusReportItem::error(format!("patches could not be removed from {}", failed))
                    .with_recommendation(REPAIR_HINT),
            );
            self.update_status();
            callbacks.failure("Patch removal failed", "Patches could not be removed.", &results);
            return InstallationResult::Fatal;
        }

        self.update_status();
        let incomplete: Vec<&str> = self
            .applications
            .values()
            .filter(|a| a.is_enabled())
            .filter(|a| !matches!(a.status(), StatusCode::OutOfDate | StatusCode::NotApplicable))
            .map(PatchApplication::key)
            .collect();
        if incomplete.is_empty() {
            callbacks.success("Patches removed", "All patches were removed.", &results);
            InstallationResult::Success
        } else {
            callbacks.failure(
                "Patch removal incomplete",
                &format!("Patches are still present in {}.", incomplete.join(", ")),
                &results,
            );
            InstallationResult::Fatal
        }
    }

    fn load_flag(&self, group: &str, name: &str) -> Option<bool> {
        self.settings.load_setting(group, name)?.parse().ok()
    }

    fn save_flag(&self, group: &str, name: &str, value: bool) {
        if let Err(e) = self.settings.save_setting(group, name, &value.to_string()) {
            warn!("Failed to save {}.{}: {:#}", group, name, e);
        }
    }
}

fn destination_group(key: &str) -> String {
    format!("Destination.{}", key)
}

/// Incompatible and ResetRequired win outright; otherwise OutOfDate beats
/// UpToDate, and NotApplicable remains when nothing applies.
pub fn aggregate_status(statuses: impl IntoIterator<Item = StatusCode>) -> StatusCode {
    let mut aggregate = StatusCode::NotApplicable;
    for status in statuses {
        match status {
            StatusCode::Incompatible | StatusCode::ResetRequired => return status,
            StatusCode::OutOfDate => aggregate = StatusCode::OutOfDate,
            StatusCode::UpToDate if aggregate != StatusCode::OutOfDate => aggregate = StatusCode::UpToDate,
            _ => {}
        }
    }
    aggregate
}

/// Bring the sorted `current` list in line with `desired`, touching only
/// entries that changed.
pub fn sync_paths(
    current: &mut Vec<PatchedPath>,
    desired: &BTreeSet<String>,
    exclusions: &BTreeSet<String>,
) -> Vec<PathChange> {
    let desired: Vec<&String> = desired.iter().collect();
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    loop {
        let order = match (current.get(i), desired.get(j)) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(have), Some(want)) => have.path.as_str().cmp(want.as_str()),
        };
        match order {
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                let removed = current.remove(i);
                changes.push(PathChange::Removed(i, removed.path));
            }
            Ordering::Greater => {
                let path = desired[j].clone();
                current.insert(
                    i,
                    PatchedPath {
                        excluded: exclusions.contains(&path),
                        path: path.clone(),
                    },
                );
                changes.push(PathChange::Inserted(i, path));
                i += 1;
                j += 1;
            }
        }
    }
    changes
}
