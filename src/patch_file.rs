use std::path::Path;
use tracing::debug;

use crate::error::{PatchError, Result};
use crate::patch_format::REVERT_EXTENSION;
use crate::text_patch::{self, Fragment};
use crate::util;

/// How `PatchFile::is_applied` decides whether content already carries a patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Every fragment's post-patch text is present somewhere in the content.
    /// Text the patch deletes is not checked, so unrelated edits nearby do not
    /// cause false negatives; coincidental matches can cause false positives.
    #[default]
    Heuristic,
    /// As `Heuristic`, and fragments that delete text must no longer find
    /// their pre-patch text in the content.
    Strict,
}

/// Result of running a patch (forward or reverse) over file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchResult {
    /// Every fragment matched its context exactly.
    Perfect { patched: String },
    /// Every fragment applied, at least one only approximately.
    Imprecise { patched: String, message: String },
    Failed { message: String },
}

impl PatchResult {
    pub fn patched(&self) -> Option<&str> {
        match self {
            PatchResult::Perfect { patched } | PatchResult::Imprecise { patched, .. } => Some(patched),
            PatchResult::Failed { .. } => None,
        }
    }
}

/// One patch for one target file, with its optional reverse patch.
#[derive(Debug, Clone)]
pub struct PatchFile {
    target_path: String,
    patch: Vec<Fragment>,
    reverse: Option<Vec<Fragment>>,
}

impl PatchFile {
    pub fn new(target_path: impl Into<String>, patch: Vec<Fragment>, reverse: Option<Vec<Fragment>>) -> Self {
        Self {
            target_path: target_path.into(),
            patch,
            reverse,
        }
    }

    /// Load a `.gpatch` file and, if present, its `.grevert` sibling.
    pub fn load(target_path: impl Into<String>, patch_path: &Path) -> Result<Self> {
        let patch = read_fragments(patch_path)?;
        let revert_path = patch_path.with_extension(REVERT_EXTENSION);
        let reverse = if revert_path.is_file() {
            Some(read_fragments(&revert_path)?)
        } else {
            None
        };
        let target_path = target_path.into();
        debug!(
            "Loaded patch for {} ({} fragments, reverse: {})",
            target_path,
            patch.len(),
            reverse.is_some()
        );
        Ok(Self::new(target_path, patch, reverse))
    }

    pub fn target_path(&self) -> &str {
        &self.target_path
    }

    pub fn has_reverse(&self) -> bool {
        self.reverse.is_some()
    }

    pub fn try_apply(&self, source: &str) -> PatchResult {
        run_fragments(&self.target_path, &self.patch, source)
    }

    pub fn try_revert(&self, source: &str) -> PatchResult {
        match &self.reverse {
            Some(reverse) => run_fragments(&self.target_path, reverse, source),
            None => PatchResult::Failed {
                message: format!("{}: no reverse patch is available", self.target_path),
            },
        }
    }

    pub fn is_applied(&self, content: &str) -> bool {
        self.is_applied_with(content, VerifyMode::Heuristic)
    }

    pub fn is_applied_with(&self, content: &str, mode: VerifyMode) -> bool {
        self.patch.iter().all(|fragment| {
            if !content.contains(fragment.target_text().as_str()) {
                return false;
            }
            match mode {
                VerifyMode::Heuristic => true,
                VerifyMode::Strict => {
                    !fragment.has_deletions() || !content.contains(fragment.source_text().as_str())
                }
            }
        })
    }
}

fn read_fragments(path: &Path) -> Result<Vec<Fragment>> {
    let bytes = std::fs::read(path).map_err(|e| PatchError::io(path, e))?;
    let text = String::from_utf8(bytes).map_err(|_| PatchError::Encoding(path.to_path_buf()))?;
    text_patch::parse(util::strip_bom(&text)).map_err(|(line, message)| PatchError::Parse {
        path: path.to_path_buf(),
        line,
        message,
    })
}

fn run_fragments(target_path: &str, fragments: &[Fragment], source: &str) -> PatchResult {
    match text_patch::apply(fragments, source) {
        Ok(applied) if applied.imprecise => PatchResult::Imprecise {
            patched: applied.text,
            message: format!(
                "{}: some of {} fragments matched only approximately",
                target_path,
                fragments.len()
            ),
        },
        Ok(applied) => PatchResult::Perfect { patched: applied.text },
        Err(failure) => PatchResult::Failed {
            message: format!("{}: {}", target_path, failure),
        },
    }
}
