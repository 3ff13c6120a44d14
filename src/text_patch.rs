//! Patch text model and the adapter onto the diff-match-patch codec.
//!
//! `Fragment` is a read-only view of one hunk, used for verification and
//! authoring. Applying patches is delegated to `diff_match_patch_rs`; the
//! adapter only decides whether every hunk landed on its exact context.
use diff_match_patch_rs::{Compat, DiffMatchPatch};
use std::fmt::Write as _;
use thiserror::Error;

/// Characters written literally by the encoder; everything else is %XX.
const UNRESERVED: &[u8] = b" -_.!~*'();/?:@&=+$,#";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Equal,
    Delete,
    Insert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub op: Op,
    pub text: String,
}

impl Diff {
    pub fn new(op: Op, text: impl Into<String>) -> Self {
        Self {
            op,
            text: text.into(),
        }
    }
}

/// One `@@ ... @@` hunk of a text patch. Coordinates are character offsets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fragment {
    pub diffs: Vec<Diff>,
    pub start1: usize,
    pub start2: usize,
    pub length1: usize,
    pub length2: usize,
}

impl Fragment {
    /// Build a fragment from its diffs, deriving the lengths.
    pub fn new(start1: usize, start2: usize, diffs: Vec<Diff>) -> Self {
        let mut fragment = Self {
            diffs,
            start1,
            start2,
            length1: 0,
            length2: 0,
        };
        fragment.length1 = fragment.source_text().chars().count();
        fragment.length2 = fragment.target_text().chars().count();
        fragment
    }

    /// Text the fragment expects before patching (EQUAL + DELETE).
    pub fn source_text(&self) -> String {
        self.diffs
            .iter()
            .filter(|d| d.op != Op::Insert)
            .map(|d| d.text.as_str())
            .collect()
    }

    /// Text the fragment leaves behind (EQUAL + INSERT).
    pub fn target_text(&self) -> String {
        self.diffs
            .iter()
            .filter(|d| d.op != Op::Delete)
            .map(|d| d.text.as_str())
            .collect()
    }

    pub fn has_deletions(&self) -> bool {
        self.diffs
            .iter()
            .any(|d| d.op == Op::Delete && !d.text.is_empty())
    }
}

/// Text produced by a successful `apply`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub text: String,
    /// At least one fragment was placed on approximate context.
    pub imprecise: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyFailure {
    #[error("fragment {index} of {count} could not be applied")]
    Rejected { index: usize, count: usize },
    #[error("the patch codec rejected the patch: {0}")]
    Codec(String),
}

/// Apply `fragments` to `source` in order.
///
/// The codec places every hunk (Bitap search, then a character diff of the
/// found context); the result is `imprecise` unless replaying each hunk on
/// its exact context yields the same text.
pub fn apply(fragments: &[Fragment], source: &str) -> Result<Applied, ApplyFailure> {
    if fragments.is_empty() {
        return Ok(Applied {
            text: source.to_string(),
            imprecise: false,
        });
    }

    let dmp = DiffMatchPatch::new();
    let patches = dmp
        .patch_from_text::<Compat>(&to_text(fragments))
        .map_err(|e| ApplyFailure::Codec(format!("{:?}", e)))?;
    let (text, hunks) = dmp
        .patch_apply(&patches, source)
        .map_err(|e| ApplyFailure::Codec(format!("{:?}", e)))?;

    if let Some(index) = hunks.iter().position(|applied| !applied) {
        return Err(ApplyFailure::Rejected {
            index: index + 1,
            count: hunks.len(),
        });
    }

    let imprecise = exact_replay(fragments, source).as_deref() != Some(text.as_str());
    Ok(Applied { text, imprecise })
}

/// Splice every fragment onto the exact occurrence of its context nearest
/// to where the fragment expects it. `None` if some context is missing.
fn exact_replay(fragments: &[Fragment], source: &str) -> Option<String> {
    let mut text = source.to_string();
    let mut delta = 0isize;
    for fragment in fragments {
        let from = fragment.source_text();
        let to = fragment.target_text();
        let expected_chars = (fragment.start2 as isize + delta).max(0) as usize;
        let expected = byte_offset(&text, expected_chars);
        let at = if from.is_empty() {
            expected
        } else {
            text.match_indices(from.as_str())
                .map(|(i, _)| i)
                .min_by_key(|&i| i.abs_diff(expected))?
        };
        text.replace_range(at..at + from.len(), &to);
        delta = text[..at].chars().count() as isize - fragment.start2 as isize;
    }
    Some(text)
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}

/// Parse the textual patch format. Errors carry the 1-based line number.
pub fn parse(text: &str) -> Result<Vec<Fragment>, (usize, String)> {
    let mut fragments: Vec<Fragment> = Vec::new();
    let mut current: Option<Fragment> = None;

    for (index, raw) in text.split('\n').enumerate() {
        let line_no = index + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.is_empty() {
            continue;
        }
        if line.starts_with("@@") {
            if let Some(done) = current.take() {
                fragments.push(done);
            }
            let (start1, length1, start2, length2) =
                parse_header(line).ok_or_else(|| (line_no, format!("invalid header '{}'", line)))?;
            current = Some(Fragment {
                diffs: Vec::new(),
                start1,
                start2,
                length1,
                length2,
            });
            continue;
        }

        let fragment = current
            .as_mut()
            .ok_or_else(|| (line_no, "diff line before the first header".to_string()))?;
        let mut chars = line.chars();
        let sign = chars.next().unwrap_or(' ');
        let body = decode(chars.as_str())
            .ok_or_else(|| (line_no, "invalid percent encoding".to_string()))?;
        let op = match sign {
            ' ' => Op::Equal,
            '-' => Op::Delete,
            '+' => Op::Insert,
            other => return Err((line_no, format!("invalid mode '{}'", other))),
        };
        fragment.diffs.push(Diff::new(op, body));
    }

    if let Some(done) = current {
        fragments.push(done);
    }
    Ok(fragments)
}

fn parse_header(line: &str) -> Option<(usize, usize, usize, usize)> {
    let inner = line.strip_prefix("@@ -")?.strip_suffix(" @@")?;
    let (left, right) = inner.split_once(" +")?;
    let (start1, length1) = parse_coords(left)?;
    let (start2, length2) = parse_coords(right)?;
    Some((start1, length1, start2, length2))
}

fn parse_coords(coords: &str) -> Option<(usize, usize)> {
    match coords.split_once(',') {
        None => Some((coords.parse::<usize>().ok()?.checked_sub(1)?, 1)),
        Some((start, "0")) => Some((start.parse().ok()?, 0)),
        Some((start, len)) => Some((start.parse::<usize>().ok()?.checked_sub(1)?, len.parse().ok()?)),
    }
}

fn format_coords(start: usize, length: usize) -> String {
    match length {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, length),
    }
}

/// Serialize fragments in the textual patch format.
pub fn to_text(fragments: &[Fragment]) -> String {
    let mut out = String::new();
    for fragment in fragments {
        let _ = writeln!(
            out,
            "@@ -{} +{} @@",
            format_coords(fragment.start1, fragment.length1),
            format_coords(fragment.start2, fragment.length2)
        );
        for diff in &fragment.diffs {
            let sign = match diff.op {
                Op::Equal => ' ',
                Op::Delete => '-',
                Op::Insert => '+',
            };
            out.push(sign);
            out.push_str(&encode(&diff.text));
            out.push('\n');
        }
    }
    out
}

fn encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{:02X}", byte);
        }
    }
    out
}

fn decode(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = std::str::from_utf8(bytes.get(i + 1..i + 3)?).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
