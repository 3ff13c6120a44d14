use anyhow::{bail, Context, Result};
use diffy::Line;
use std::path::{Path, PathBuf};

use crate::patch_format::{PATCH_EXTENSION, REVERT_EXTENSION};
use crate::text_patch::{self, Diff, Fragment, Op};
use crate::util;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSummary {
    pub patch_path: PathBuf,
    pub revert_path: PathBuf,
    pub fragments: usize,
    pub reverse_fragments: usize,
}

/// Character offset of the start of every line, plus the total length.
fn line_offsets(text: &str) -> Vec<usize> {
    let mut offsets = vec![0];
    let mut total = 0;
    for line in text.split_inclusive('\n') {
        total += line.chars().count();
        offsets.push(total);
    }
    offsets
}

fn push_diff(diffs: &mut Vec<Diff>, op: Op, text: &str) {
    match diffs.last_mut() {
        Some(last) if last.op == op => last.text.push_str(text),
        _ => diffs.push(Diff::new(op, text)),
    }
}

/// Line diff of `old` into `new`, as fragments with character coordinates.
pub fn diff_fragments(old: &str, new: &str) -> Vec<Fragment> {
    let patch = diffy::create_patch(old, new);
    let old_offsets = line_offsets(old);
    let new_offsets = line_offsets(new);
    // Unified ranges are 1-based; an empty range names the line before it.
    let line_index = |start: usize, len: usize| if len == 0 { start } else { start.saturating_sub(1) };

    let mut fragments = Vec::new();
    for hunk in patch.hunks() {
        let old_range = hunk.old_range();
        let new_range = hunk.new_range();
        let start1 = old_offsets
            .get(line_index(old_range.start(), old_range.len()))
            .copied()
            .unwrap_or(0);
        let start2 = new_offsets
            .get(line_index(new_range.start(), new_range.len()))
            .copied()
            .unwrap_or(0);

        let mut diffs = Vec::new();
        for line in hunk.lines() {
            match line {
                Line::Context(text) => push_diff(&mut diffs, Op::Equal, text),
                Line::Delete(text) => push_diff(&mut diffs, Op::Delete, text),
                Line::Insert(text) => push_diff(&mut diffs, Op::Insert, text),
            }
        }
        fragments.push(Fragment::new(start1, start2, diffs));
    }
    fragments
}

fn read_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8 text", path.display()))?;
    Ok(util::strip_bom(&text).to_string())
}

/// Write `<output>/<target>.gpatch` turning `old_file` into `new_file`, and
/// the matching `.grevert`.
pub fn create_patch(old_file: &Path, new_file: &Path, target: &str, output: &Path) -> Result<CreateSummary> {
    let old = read_text(old_file)?;
    let new = read_text(new_file)?;
    if old == new {
        bail!(
            "{} and {} are identical; nothing to patch",
            old_file.display(),
            new_file.display()
        );
    }

    let forward = diff_fragments(&old, &new);
    let reverse = diff_fragments(&new, &old);

    let base = target
        .split('/')
        .filter(|part| !part.is_empty())
        .fold(output.to_path_buf(), |path, part| path.join(part));
    let file_name = base
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Invalid target path: {}", target))?
        .to_string();
    let patch_path = base.with_file_name(format!("{}.{}", file_name, PATCH_EXTENSION));
    let revert_path = base.with_file_name(format!("{}.{}", file_name, REVERT_EXTENSION));

    if let Some(parent) = patch_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(&patch_path, text_patch::to_text(&forward))
        .with_context(|| format!("Failed to write patch: {}", patch_path.display()))?;
    std::fs::write(&revert_path, text_patch::to_text(&reverse))
        .with_context(|| format!("Failed to write reverse patch: {}", revert_path.display()))?;

    Ok(CreateSummary {
        patch_path,
        revert_path,
        fragments: forward.len(),
        reverse_fragments: reverse.len(),
    })
}
