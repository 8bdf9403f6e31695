//! Content adapters
//!
//! The file state machine never interprets file bytes. Everything
//! content-specific goes through a [`ContentAdapter`] registered for the
//! item's content type: opening content views, computing change sets between
//! versions and running the merge strategy.
//!
//! Two adapters ship with the crate:
//!
//! - [`TextContentAdapter`] merges line-based text with a three-way merge
//!   and aborts on conflicting hunks
//! - [`OpaqueContentAdapter`] treats content as an opaque blob and only
//!   merges when at most one side changed
//!
//! ## Four-way merge
//!
//! A merge receives four inputs:
//!
//! - **target**: mutable, starts as the latest repository content and
//!   receives the merged result
//! - **source**: the local working copy
//! - **original**: the checkout baseline
//! - **latest**: the repository tip, with the change set since the baseline

use crate::error::{Result, TandemError};
use crate::types::{TaskMonitor, Version};
use std::fmt::Debug;
use std::ops::Range;
use tracing::debug;

/// Kind of a single change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Something was added
    Added,
    /// Something was removed
    Removed,
    /// Something was replaced
    Modified,
}

/// A single entry of a change set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Kind of change
    pub kind: ChangeKind,
    /// Adapter-specific description
    pub description: String,
}

/// Changes between two versions of an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Version the changes start from
    pub base_version: Version,
    /// Version the changes lead to
    pub target_version: Version,
    /// Individual changes
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Whether the versions are equivalent
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of entries of a kind
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }
}

/// Read-only view of item content
#[derive(Debug, Clone)]
pub struct ContentView {
    /// Display label, e.g. the file name and version
    pub label: String,
    /// Repository version the content belongs to, if any
    pub version: Option<Version>,
    /// Content bytes
    pub content: Vec<u8>,
    /// Changes relative to the checkout baseline (latest view only)
    pub changes: Option<ChangeSet>,
}

/// Mutable merge target
#[derive(Debug, Clone)]
pub struct MergeTarget {
    /// Display label
    pub label: String,
    /// Version the result will be saved as
    pub version: Option<Version>,
    /// Current content
    pub content: Vec<u8>,
    /// Whether the content was modified since it was opened
    pub changed: bool,
}

impl MergeTarget {
    /// Replace the target content
    pub fn apply(&mut self, content: Vec<u8>) {
        if content != self.content {
            self.content = content;
            self.changed = true;
        }
    }
}

/// Outcome of a merge strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// The target holds the merged content
    Applied,
    /// The strategy stopped; the target must be discarded
    Aborted,
}

/// Content-specific capabilities for one content type
pub trait ContentAdapter: Send + Sync + Debug {
    /// Content type this adapter handles
    fn content_type(&self) -> &str;

    /// Private content types never enter the repository
    fn is_private_type(&self) -> bool {
        false
    }

    /// Link files are never checked out
    fn is_link(&self) -> bool {
        false
    }

    /// Whether the merge strategy may ask a user for decisions
    fn is_interactive(&self) -> bool {
        false
    }

    /// Whether files of this type carry auxiliary user data
    fn has_user_data(&self) -> bool {
        false
    }

    /// Open content for modification
    fn open_mutable(&self, content: Vec<u8>, label: &str, version: Option<Version>) -> Result<MergeTarget> {
        Ok(MergeTarget {
            label: label.to_string(),
            version,
            content,
            changed: false,
        })
    }

    /// Open content read-only
    fn open_immutable(&self, content: Vec<u8>, label: &str, version: Option<Version>) -> Result<ContentView> {
        Ok(ContentView {
            label: label.to_string(),
            version,
            content,
            changes: None,
        })
    }

    /// Changes between two versions
    fn compute_change_set(
        &self,
        base: &[u8],
        target: &[u8],
        base_version: Version,
        target_version: Version,
    ) -> Result<ChangeSet>;

    /// Merge the local changes (original -> source) into the target
    fn merge(
        &self,
        target: &mut MergeTarget,
        source: &ContentView,
        original: &ContentView,
        latest: &ContentView,
        monitor: &TaskMonitor,
    ) -> Result<MergeResult>;
}

/// Line-based three-way text merge
#[derive(Debug, Clone, Default)]
pub struct TextContentAdapter;

/// Content type served by [`TextContentAdapter`]
pub const TEXT_CONTENT_TYPE: &str = "text";

/// Content type served by [`OpaqueContentAdapter`]
pub const OPAQUE_CONTENT_TYPE: &str = "binary";

impl TextContentAdapter {
    fn lines<'a>(content: &'a [u8], label: &str) -> Result<Vec<&'a str>> {
        let text = std::str::from_utf8(content)
            .map_err(|_| TandemError::unsupported(format!("{} is not valid UTF-8 text", label)))?;
        Ok(text.split_inclusive('\n').collect())
    }
}

impl ContentAdapter for TextContentAdapter {
    fn content_type(&self) -> &str {
        TEXT_CONTENT_TYPE
    }

    fn compute_change_set(
        &self,
        base: &[u8],
        target: &[u8],
        base_version: Version,
        target_version: Version,
    ) -> Result<ChangeSet> {
        let old_lines = Self::lines(base, "base")?;
        let new_lines = Self::lines(target, "target")?;
        let lcs = compute_lcs(&old_lines, &new_lines);
        let ops = lcs_to_changes(&lcs, old_lines.len(), new_lines.len());

        let mut changes = Vec::new();
        let mut removed: Vec<usize> = Vec::new();
        let mut added: Vec<usize> = Vec::new();
        let flush = |removed: &mut Vec<usize>, added: &mut Vec<usize>, changes: &mut Vec<Change>| {
            let paired = removed.len().min(added.len());
            for (old_idx, new_idx) in removed.iter().zip(added.iter()).take(paired) {
                changes.push(Change {
                    kind: ChangeKind::Modified,
                    description: format!("line {} -> {}: {}", old_idx + 1, new_idx + 1, new_lines[*new_idx].trim_end()),
                });
            }
            for old_idx in &removed[paired..] {
                changes.push(Change {
                    kind: ChangeKind::Removed,
                    description: format!("line {}: {}", old_idx + 1, old_lines[*old_idx].trim_end()),
                });
            }
            for new_idx in &added[paired..] {
                changes.push(Change {
                    kind: ChangeKind::Added,
                    description: format!("line {}: {}", new_idx + 1, new_lines[*new_idx].trim_end()),
                });
            }
            removed.clear();
            added.clear();
        };

        for op in ops {
            match op {
                ChangeOp::Delete(idx) => removed.push(idx),
                ChangeOp::Insert(idx) => added.push(idx),
                ChangeOp::Keep(..) => flush(&mut removed, &mut added, &mut changes),
            }
        }
        flush(&mut removed, &mut added, &mut changes);

        Ok(ChangeSet {
            base_version,
            target_version,
            changes,
        })
    }

    fn merge(
        &self,
        target: &mut MergeTarget,
        source: &ContentView,
        original: &ContentView,
        latest: &ContentView,
        monitor: &TaskMonitor,
    ) -> Result<MergeResult> {
        monitor.check_cancelled()?;
        let o = Self::lines(&original.content, &original.label)?;
        let a = Self::lines(&source.content, &source.label)?;
        let b = Self::lines(&latest.content, &latest.label)?;

        match merge_lines(&o, &a, &b, monitor)? {
            Some(merged) => {
                target.apply(merged.concat().into_bytes());
                debug!("Merged {} into {}", source.label, target.label);
                Ok(MergeResult::Applied)
            }
            None => {
                debug!("Conflicting changes between {} and {}", source.label, latest.label);
                Ok(MergeResult::Aborted)
            }
        }
    }
}

/// Blob merge that succeeds only when at most one side changed
#[derive(Debug, Clone, Default)]
pub struct OpaqueContentAdapter;

impl ContentAdapter for OpaqueContentAdapter {
    fn content_type(&self) -> &str {
        OPAQUE_CONTENT_TYPE
    }

    fn compute_change_set(
        &self,
        base: &[u8],
        target: &[u8],
        base_version: Version,
        target_version: Version,
    ) -> Result<ChangeSet> {
        let changes = if base == target {
            Vec::new()
        } else {
            vec![Change {
                kind: ChangeKind::Modified,
                description: format!("content changed ({} -> {} bytes)", base.len(), target.len()),
            }]
        };
        Ok(ChangeSet {
            base_version,
            target_version,
            changes,
        })
    }

    fn merge(
        &self,
        target: &mut MergeTarget,
        source: &ContentView,
        original: &ContentView,
        latest: &ContentView,
        monitor: &TaskMonitor,
    ) -> Result<MergeResult> {
        monitor.check_cancelled()?;
        if source.content == original.content || source.content == latest.content {
            target.apply(latest.content.clone());
            return Ok(MergeResult::Applied);
        }
        if latest.content == original.content {
            target.apply(source.content.clone());
            return Ok(MergeResult::Applied);
        }
        Ok(MergeResult::Aborted)
    }
}

/// Line-level edit operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOp {
    /// Line kept (old index, new index)
    Keep(usize, usize),
    /// Line deleted from old
    Delete(usize),
    /// Line inserted from new
    Insert(usize),
}

/// Subproblems up to this many cells are solved with a full table
const TABLE_CELLS: usize = 1 << 16;

/// Longest common subsequence as matched (old, new) index pairs
///
/// Runs in linear space: common prefixes and suffixes are matched directly
/// and the remainder is split recursively around a midpoint (Hirschberg),
/// so memory stays proportional to the input length.
fn compute_lcs(old_lines: &[&str], new_lines: &[&str]) -> Vec<(usize, usize)> {
    let prefix = old_lines
        .iter()
        .zip(new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_lines[prefix..]
        .iter()
        .rev()
        .zip(new_lines[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_end = old_lines.len() - suffix;
    let new_end = new_lines.len() - suffix;

    let mut lcs: Vec<(usize, usize)> = (0..prefix).map(|i| (i, i)).collect();
    split_lcs(old_lines, new_lines, prefix..old_end, prefix..new_end, &mut lcs);
    lcs.extend((0..suffix).map(|k| (old_end + k, new_end + k)));
    lcs
}

fn split_lcs(
    old_lines: &[&str],
    new_lines: &[&str],
    old_range: Range<usize>,
    new_range: Range<usize>,
    out: &mut Vec<(usize, usize)>,
) {
    let (m, n) = (old_range.len(), new_range.len());
    if m == 0 || n == 0 {
        return;
    }
    if m == 1 {
        let line = old_lines[old_range.start];
        if let Some(j) = new_range.clone().find(|&j| new_lines[j] == line) {
            out.push((old_range.start, j));
        }
        return;
    }
    if m.saturating_mul(n) <= TABLE_CELLS {
        table_lcs(old_lines, new_lines, old_range, new_range, out);
        return;
    }

    let mid = old_range.start + m / 2;
    let old = &old_lines[old_range.start..old_range.end];
    let new = &new_lines[new_range.start..new_range.end];
    let forward = lcs_lengths(&old[..m / 2], new, false);
    let backward = lcs_lengths(&old[m / 2..], new, true);
    let split = (0..=n)
        .max_by_key(|&k| (forward[k] + backward[n - k], std::cmp::Reverse(k)))
        .unwrap_or(0);

    split_lcs(old_lines, new_lines, old_range.start..mid, new_range.start..new_range.start + split, out);
    split_lcs(old_lines, new_lines, mid..old_range.end, new_range.start + split..new_range.end, out);
}

/// Last row of the LCS length table of `a` against every prefix of `b`
///
/// With `reverse`, both sequences are read back to front, so entry `j`
/// covers the last `j` lines of `b`.
fn lcs_lengths(a: &[&str], b: &[&str], reverse: bool) -> Vec<u32> {
    fn at<'s>(lines: &[&'s str], i: usize, reverse: bool) -> &'s str {
        if reverse {
            lines[lines.len() - 1 - i]
        } else {
            lines[i]
        }
    }

    let n = b.len();
    let mut prev = vec![0u32; n + 1];
    let mut curr = vec![0u32; n + 1];
    for i in 0..a.len() {
        let line = at(a, i, reverse);
        for j in 0..n {
            curr[j + 1] = if line == at(b, j, reverse) {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev
}

fn table_lcs(
    old_lines: &[&str],
    new_lines: &[&str],
    old_range: Range<usize>,
    new_range: Range<usize>,
    out: &mut Vec<(usize, usize)>,
) {
    let old = &old_lines[old_range.start..old_range.end];
    let new = &new_lines[new_range.start..new_range.end];
    let (m, n) = (old.len(), new.len());

    let mut dp = vec![vec![0u32; n + 1]; m + 1];
    for i in 1..=m {
        for j in 1..=n {
            if old[i - 1] == new[j - 1] {
                dp[i][j] = dp[i - 1][j - 1] + 1;
            } else {
                dp[i][j] = dp[i - 1][j].max(dp[i][j - 1]);
            }
        }
    }

    let mut pairs = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 && j > 0 {
        if old[i - 1] == new[j - 1] {
            pairs.push((old_range.start + i - 1, new_range.start + j - 1));
            i -= 1;
            j -= 1;
        } else if dp[i - 1][j] > dp[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    pairs.reverse();
    out.extend(pairs);
}

fn lcs_to_changes(lcs: &[(usize, usize)], old_len: usize, new_len: usize) -> Vec<ChangeOp> {
    let mut changes = Vec::new();
    let mut old_idx = 0;
    let mut new_idx = 0;

    for &(lcs_old, lcs_new) in lcs {
        while old_idx < lcs_old {
            changes.push(ChangeOp::Delete(old_idx));
            old_idx += 1;
        }
        while new_idx < lcs_new {
            changes.push(ChangeOp::Insert(new_idx));
            new_idx += 1;
        }
        changes.push(ChangeOp::Keep(old_idx, new_idx));
        old_idx += 1;
        new_idx += 1;
    }
    while old_idx < old_len {
        changes.push(ChangeOp::Delete(old_idx));
        old_idx += 1;
    }
    while new_idx < new_len {
        changes.push(ChangeOp::Insert(new_idx));
        new_idx += 1;
    }

    changes
}

/// For every original line, the matching line index in `other`
fn match_original(original: &[&str], other: &[&str]) -> Vec<Option<usize>> {
    let mut matches = vec![None; original.len()];
    for (o, x) in compute_lcs(original, other) {
        matches[o] = Some(x);
    }
    matches
}

/// Three-way line merge; `None` on conflicting hunks
///
/// Hunks are delimited by original lines that survive unchanged on both
/// sides. A hunk changed on one side only takes that side; identical
/// changes on both sides are taken once.
fn merge_lines<'a>(
    original: &[&'a str],
    source: &[&'a str],
    latest: &[&'a str],
    monitor: &TaskMonitor,
) -> Result<Option<Vec<&'a str>>> {
    let to_source = match_original(original, source);
    let to_latest = match_original(original, latest);

    let mut merged = Vec::with_capacity(source.len().max(latest.len()));
    let (mut io, mut ia, mut ib) = (0, 0, 0);

    while io < original.len() || ia < source.len() || ib < latest.len() {
        if io < original.len() && to_source[io] == Some(ia) && to_latest[io] == Some(ib) {
            merged.push(original[io]);
            io += 1;
            ia += 1;
            ib += 1;
            continue;
        }
        monitor.check_cancelled()?;

        let (jo, ja, jb) = (io..original.len())
            .find_map(|j| match (to_source[j], to_latest[j]) {
                (Some(x), Some(y)) => Some((j, x, y)),
                _ => None,
            })
            .unwrap_or((original.len(), source.len(), latest.len()));

        let o_chunk = &original[io..jo];
        let a_chunk = &source[ia..ja];
        let b_chunk = &latest[ib..jb];

        if a_chunk == o_chunk {
            merged.extend_from_slice(b_chunk);
        } else if b_chunk == o_chunk || a_chunk == b_chunk {
            merged.extend_from_slice(a_chunk);
        } else {
            return Ok(None);
        }

        io = jo;
        ia = ja;
        ib = jb;
    }

    Ok(Some(merged))
}
