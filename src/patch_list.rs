use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::destination::PatchDestination;
use crate::error::{PatchError, Result};
use crate::journal::WriteJournal;
use crate::patch_file::{PatchFile, PatchResult, VerifyMode};
use crate::status::{StatusFlags, StatusReportItem};
use crate::util;

const NEWER_DISTRIBUTION: &str =
    "Please install a newer Helios distribution or patch set that supports this version of the simulator.";

/// Holds a destination's lock for the duration of one pass.
struct DestinationLock<'a> {
    destination: &'a dyn PatchDestination,
}

impl<'a> DestinationLock<'a> {
    fn acquire(destination: &'a dyn PatchDestination) -> std::result::Result<Self, StatusReportItem> {
        match destination.try_lock() {
            Ok(()) => Ok(Self { destination }),
            Err(e) => {
                warn!("Could not lock {}: {}", destination.description(), e);
                Err(StatusReportItem::error(format!(
                    "{} could not be locked for patching: {}",
                    destination.description(),
                    e
                ))
                .with_recommendation(format!(
                    "Close any programs that have files open in {}, such as the simulator or a text editor, and try again.",
                    util::anonymize_path(destination.root_folder())
                )))
            }
        }
    }
}

impl Drop for DestinationLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.destination.try_unlock() {
            warn!("Failed to unlock {}: {}", self.destination.description(), e);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Apply,
    Revert,
}

/// Ordered patches for one patch set, at most one per target path.
#[derive(Debug, Clone, Default)]
pub struct PatchList {
    patches: Vec<PatchFile>,
}

impl PatchList {
    pub fn new(patches: Vec<PatchFile>) -> Self {
        let mut list = Self::default();
        list.merge(Self { patches });
        list
    }

    /// Load every `.gpatch` below `dir`. A missing directory is an empty list.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Ok(Self::default());
        }
        let entries = util::walk_patch_dir(dir).map_err(|e| PatchError::Parse {
            path: dir.to_path_buf(),
            line: 0,
            message: format!("{:#}", e),
        })?;
        let patches = entries
            .par_iter()
            .map(|entry| PatchFile::load(entry.target_path.clone(), &entry.full_path))
            .collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} patches from {}", patches.len(), util::anonymize_path(dir));
        Ok(Self { patches })
    }

    /// Load the user's patches, then add shipped patches for targets the user
    /// did not override.
    pub fn load_patches(user_dir: &Path, installed_dir: &Path) -> Result<Self> {
        let mut list = Self::load_dir(user_dir)?;
        list.merge(Self::load_dir(installed_dir)?);
        Ok(list)
    }

    /// Append patches from `other` whose target is not already covered.
    pub fn merge(&mut self, other: PatchList) {
        let mut known: HashSet<String> = self.target_paths().map(str::to_string).collect();
        for patch in other.patches {
            if known.insert(patch.target_path().to_string()) {
                self.patches.push(patch);
            } else {
                debug!("Patch for {} overridden by an earlier source", patch.target_path());
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatchFile> {
        self.patches.iter()
    }

    pub fn target_paths(&self) -> impl Iterator<Item = &str> {
        self.patches.iter().map(PatchFile::target_path)
    }

    /// Report whether every present target carries its patch. Not-yet-patched
    /// files produce error items, patched ones info items flagged up to date.
    pub fn verify(
        &self,
        destination: &dyn PatchDestination,
        exclusions: &BTreeSet<String>,
        mode: VerifyMode,
    ) -> Vec<StatusReportItem> {
        let mut results = Vec::new();
        let _lock = match DestinationLock::acquire(destination) {
            Ok(lock) => lock,
            Err(item) => {
                results.push(item);
                return results;
            }
        };

        for patch in self.active(exclusions) {
            let source = match destination.try_get_source(patch.target_path()) {
                Ok(Some(source)) => source,
                Ok(None) => continue,
                Err(e) => {
                    results.push(read_error(destination, patch, &e));
                    return results;
                }
            };
            if patch.is_applied_with(&source, mode) {
                results.push(
                    StatusReportItem::info(format!(
                        "{} is patched in {}",
                        patch.target_path(),
                        destination.description()
                    ))
                    .with_flags(StatusFlags::CONFIGURATION_UP_TO_DATE | StatusFlags::VERBOSE),
                );
            } else {
                results.push(
                    StatusReportItem::error(format!(
                        "{} is not patched in {}",
                        patch.target_path(),
                        destination.description()
                    ))
                    .with_recommendation("Install the Helios patches for this destination."),
                );
            }
        }
        results
    }

    /// Dry run: report what `apply` would do without writing anything.
    pub fn simulate(
        &self,
        destination: &dyn PatchDestination,
        exclusions: &BTreeSet<String>,
        mode: VerifyMode,
    ) -> Vec<StatusReportItem> {
        self.do_apply(destination, Direction::Apply, true, exclusions, mode, None)
    }

    pub fn apply(
        &self,
        destination: &dyn PatchDestination,
        exclusions: &BTreeSet<String>,
        mode: VerifyMode,
        journal: Option<&mut WriteJournal>,
    ) -> Vec<StatusReportItem> {
        self.do_apply(destination, Direction::Apply, false, exclusions, mode, journal)
    }

    pub fn simulate_revert(
        &self,
        destination: &dyn PatchDestination,
        exclusions: &BTreeSet<String>,
        mode: VerifyMode,
    ) -> Vec<StatusReportItem> {
        self.do_apply(destination, Direction::Revert, true, exclusions, mode, None)
    }

    pub fn revert(
        &self,
        destination: &dyn PatchDestination,
        exclusions: &BTreeSet<String>,
        mode: VerifyMode,
        journal: Option<&mut WriteJournal>,
    ) -> Vec<StatusReportItem> {
        self.do_apply(destination, Direction::Revert, false, exclusions, mode, journal)
    }

    fn active<'a>(&'a self, exclusions: &'a BTreeSet<String>) -> impl Iterator<Item = &'a PatchFile> {
        self.patches
            .iter()
            .filter(move |patch| !exclusions.contains(patch.target_path()))
    }

    /// Stops at the first file that cannot be patched or written; files
    /// written before that stay written unless the caller rolls back `journal`.
    /// `mode` decides which files already count as done, as in `verify`.
    fn do_apply(
        &self,
        destination: &dyn PatchDestination,
        direction: Direction,
        simulate: bool,
        exclusions: &BTreeSet<String>,
        mode: VerifyMode,
        mut journal: Option<&mut WriteJournal>,
    ) -> Vec<StatusReportItem> {
        let mut results = Vec::new();
        let _lock = match DestinationLock::acquire(destination) {
            Ok(lock) => lock,
            Err(item) => {
                results.push(item);
                return results;
            }
        };
        let verb = match direction {
            Direction::Apply => "patched",
            Direction::Revert => "reverted",
        };

        for patch in self.active(exclusions) {
            let target = patch.target_path();
            let source = match destination.try_get_source(target) {
                Ok(Some(source)) => source,
                Ok(None) => {
                    results.push(
                        StatusReportItem::info(format!(
                            "{} does not exist in {}; skipped",
                            target,
                            destination.description()
                        ))
                        .with_flags(StatusFlags::VERBOSE),
                    );
                    continue;
                }
                Err(e) => {
                    results.push(read_error(destination, patch, &e));
                    return results;
                }
            };

            let done = match direction {
                Direction::Apply => patch.is_applied_with(&source, mode),
                Direction::Revert => !patch.is_applied_with(&source, mode),
            };
            if done {
                results.push(
                    StatusReportItem::info(format!(
                        "{} is already {} in {}",
                        target,
                        verb,
                        destination.description()
                    ))
                    .with_flags(StatusFlags::CONFIGURATION_UP_TO_DATE | StatusFlags::VERBOSE),
                );
                continue;
            }

            let result = match direction {
                Direction::Apply => patch.try_apply(&source),
                Direction::Revert => patch.try_revert(&source),
            };
            let patched = match result {
                PatchResult::Perfect { patched } => patched,
                PatchResult::Imprecise { patched, message } => {
                    results.push(
                        StatusReportItem::warning(format!("{} in {}", message, destination.description()))
                            .with_recommendation(
                                "The file differs from what the patch expected; review it after installation.",
                            ),
                    );
                    patched
                }
                PatchResult::Failed { message } => {
                    warn!("{} in {}", message, destination.description());
                    results.push(
                        StatusReportItem::error(format!("{} in {}", message, destination.description()))
                            .with_recommendation(NEWER_DISTRIBUTION),
                    );
                    return results;
                }
            };

            if simulate {
                results.push(
                    StatusReportItem::info(format!(
                        "{} can be {} in {}",
                        target,
                        verb,
                        destination.description()
                    ))
                    .with_flags(StatusFlags::VERBOSE),
                );
                continue;
            }

            if let Some(journal) = journal.as_deref_mut() {
                if let Err(e) = journal.record(target, &source, &patched) {
                    results.push(
                        StatusReportItem::error(format!(
                            "could not record original content of {} before writing: {}",
                            target, e
                        ))
                        .with_recommendation("Check that the Helios state directory is writable."),
                    );
                    return results;
                }
            }

            match destination.try_write_patched(target, &patched) {
                Ok(()) => {
                    info!("{} {} in {}", verb, target, destination.description());
                    results.push(StatusReportItem::info(format!(
                        "{} {} in {}",
                        capitalize(verb),
                        target,
                        destination.description()
                    )));
                }
                Err(e) => {
                    warn!("Failed to write {}: {}", target, e);
                    if let Some(journal) = journal.as_deref_mut() {
                        if let Err(e) = journal.forget(target, &source) {
                            warn!("Failed to update the write journal for {}: {}", target, e);
                        }
                    }
                    results.push(
                        StatusReportItem::error(format!("could not write {}: {}", target, e)).with_recommendation(
                            format!(
                                "Check the file permissions in {}, or enable elevated patching for this destination.",
                                util::anonymize_path(destination.root_folder())
                            ),
                        ),
                    );
                    return results;
                }
            }
        }
        results
    }
}

fn read_error(destination: &dyn PatchDestination, patch: &PatchFile, error: &PatchError) -> StatusReportItem {
    StatusReportItem::error(format!(
        "could not read {} in {}: {}",
        patch.target_path(),
        destination.description(),
        error
    ))
    .with_recommendation(format!(
        "Check the file permissions in {}.",
        util::anonymize_path(destination.root_folder())
    ))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
