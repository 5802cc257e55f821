//! Diff engine: line-oriented diffs and mechanical application of edits.
//!
//! Pure functions, no I/O. Two jobs:
//!
//! - [`render_diff`] turns two bodies into tagged [`DiffLine`]s that a UI can
//!   render and a test can assert on. Output is deterministic: the LCS walk
//!   always prefers a deletion over an addition on ties.
//! - [`apply`] executes an [`EditOperation`] against a base body. Approval
//!   always calls this with the *current* head body, never the proposal's
//!   snapshot.
//!
//! Diffs split on `\n`. Trailing newlines are stripped from both sides first
//! so `"a\n"` vs `"a"` is not reported as a change.
//!
//! The LCS table is quadratic in the changed region. Past [`MAX_DIFF_CELLS`]
//! the changed region is rendered as a block replacement instead: every old
//! line deleted, then every new line added.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use kioku_types::EditOperation;

/// Separator placed between the existing body and appended text.
pub const APPEND_SEPARATOR: &str = "\n\n";

/// Largest LCS table (changed old lines x changed new lines) we build.
pub const MAX_DIFF_CELLS: usize = 4_000_000;

/// Line tag in a rendered diff.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffTag {
    Context,
    Addition,
    Deletion,
}

impl DiffTag {
    /// Unified-diff prefix character.
    pub fn prefix(&self) -> char {
        match self {
            DiffTag::Context => ' ',
            DiffTag::Addition => '+',
            DiffTag::Deletion => '-',
        }
    }
}

/// One line of a rendered diff.
///
/// Line numbers are 1-based. Context lines carry both; deletions only the old
/// number; additions only the new number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub tag: DiffTag,
    pub old_line: Option<usize>,
    pub new_line: Option<usize>,
    pub text: String,
}

/// Added/removed line counts of a diff.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

impl DiffStats {
    pub fn is_unchanged(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Failure applying an edit to a base body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("match text not found in base")]
    MatchNotFound,
}

fn split_lines(text: &str) -> Vec<&str> {
    let trimmed = text.trim_end_matches('\n');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('\n').collect()
    }
}

/// Compute a line diff between two bodies.
pub fn render_diff(old: &str, new: &str) -> Vec<DiffLine> {
    let a = split_lines(old);
    let b = split_lines(new);

    // Common prefix/suffix never need the table.
    let prefix = a.iter().zip(&b).take_while(|(x, y)| x == y).count();
    let suffix = a[prefix..]
        .iter()
        .rev()
        .zip(b[prefix..].iter().rev())
        .take_while(|(x, y)| x == y)
        .count();

    let mid_a = &a[prefix..a.len() - suffix];
    let mid_b = &b[prefix..b.len() - suffix];

    let mut out = Vec::with_capacity(a.len().max(b.len()));
    for (i, line) in a[..prefix].iter().enumerate() {
        out.push(context(i, i, line));
    }

    if mid_a.len().saturating_mul(mid_b.len()) > MAX_DIFF_CELLS {
        replace_region(mid_a, mid_b, prefix, &mut out);
    } else {
        lcs_region(mid_a, mid_b, prefix, &mut out);
    }

    let old_tail = a.len() - suffix;
    let new_tail = b.len() - suffix;
    for k in 0..suffix {
        out.push(context(old_tail + k, new_tail + k, a[old_tail + k]));
    }

    out
}

fn lcs_region(mid_a: &[&str], mid_b: &[&str], offset: usize, out: &mut Vec<DiffLine>) {
    // lcs[i][j] = LCS length of mid_a[i..] and mid_b[j..]
    let (n, m) = (mid_a.len(), mid_b.len());
    let mut lcs = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if mid_a[i] == mid_b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n || j < m {
        if i < n && j < m && mid_a[i] == mid_b[j] {
            out.push(context(offset + i, offset + j, mid_a[i]));
            i += 1;
            j += 1;
        } else if i < n && (j == m || lcs[i + 1][j] >= lcs[i][j + 1]) {
            out.push(deletion(offset + i, mid_a[i]));
            i += 1;
        } else {
            out.push(addition(offset + j, mid_b[j]));
            j += 1;
        }
    }
}

fn replace_region(mid_a: &[&str], mid_b: &[&str], offset: usize, out: &mut Vec<DiffLine>) {
    tracing::debug!(
        old_lines = mid_a.len(),
        new_lines = mid_b.len(),
        "diff region too large for lcs, rendering as replacement"
    );
    out.extend(mid_a.iter().enumerate().map(|(i, line)| deletion(offset + i, line)));
    out.extend(mid_b.iter().enumerate().map(|(j, line)| addition(offset + j, line)));
}

fn deletion(old_idx: usize, text: &str) -> DiffLine {
    DiffLine {
        tag: DiffTag::Deletion,
        old_line: Some(old_idx + 1),
        new_line: None,
        text: text.to_string(),
    }
}

fn addition(new_idx: usize, text: &str) -> DiffLine {
    DiffLine {
        tag: DiffTag::Addition,
        old_line: None,
        new_line: Some(new_idx + 1),
        text: text.to_string(),
    }
}

fn context(old_idx: usize, new_idx: usize, text: &str) -> DiffLine {
    DiffLine {
        tag: DiffTag::Context,
        old_line: Some(old_idx + 1),
        new_line: Some(new_idx + 1),
        text: text.to_string(),
    }
}

/// Count additions and deletions.
pub fn diff_stats(lines: &[DiffLine]) -> DiffStats {
    lines.iter().fold(DiffStats::default(), |mut s, l| {
        match l.tag {
            DiffTag::Addition => s.added += 1,
            DiffTag::Deletion => s.removed += 1,
            DiffTag::Context => {}
        }
        s
    })
}

/// Render diff lines as unified-style text (`" "`, `"+"`, `"-"` prefixes).
pub fn render_unified(lines: &[DiffLine]) -> String {
    lines
        .iter()
        .map(|l| format!("{}{}", l.tag.prefix(), l.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Apply an edit operation to `base`.
pub fn apply(base: &str, operation: &EditOperation, proposed: &str) -> Result<String, ApplyError> {
    match operation {
        EditOperation::Append => {
            if base.is_empty() {
                Ok(proposed.to_string())
            } else {
                Ok(format!("{base}{APPEND_SEPARATOR}{proposed}"))
            }
        }
        EditOperation::ReplaceSubstring { match_text } => {
            if match_text.is_empty() || !base.contains(match_text.as_str()) {
                return Err(ApplyError::MatchNotFound);
            }
            Ok(base.replacen(match_text.as_str(), proposed, 1))
        }
        EditOperation::FullReplace => Ok(proposed.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(lines: &[DiffLine]) -> String {
        lines.iter().map(|l| l.tag.prefix()).collect()
    }

    #[test]
    fn test_apply_append() {
        let out = apply("Name: Alice", &EditOperation::Append, "Goal: improve pacing").unwrap();
        assert_eq!(out, "Name: Alice\n\nGoal: improve pacing");
    }

    #[test]
    fn test_apply_append_to_empty() {
        let out = apply("", &EditOperation::Append, "first").unwrap();
        assert_eq!(out, "first");
    }

    #[test]
    fn test_apply_replace_first_occurrence_only() {
        let op = EditOperation::ReplaceSubstring {
            match_text: "Alice".into(),
        };
        let out = apply("Alice met Alice", &op, "Alicia").unwrap();
        assert_eq!(out, "Alicia met Alice");
    }

    #[test]
    fn test_apply_replace_missing_match() {
        let op = EditOperation::ReplaceSubstring {
            match_text: "Alice".into(),
        };
        assert_eq!(apply("Name: Bob", &op, "Alicia"), Err(ApplyError::MatchNotFound));
    }

    #[test]
    fn test_apply_full_replace_ignores_base() {
        let out = apply("anything", &EditOperation::FullReplace, "fresh").unwrap();
        assert_eq!(out, "fresh");
    }

    #[test]
    fn test_apply_is_deterministic() {
        let op = EditOperation::ReplaceSubstring {
            match_text: "b".into(),
        };
        let first = apply("abcabc", &op, "X");
        let second = apply("abcabc", &op, "X");
        assert_eq!(first, second);
    }

    #[test]
    fn test_diff_identical() {
        let lines = render_diff("a\nb\nc", "a\nb\nc");
        assert_eq!(tags(&lines), "   ");
        assert!(diff_stats(&lines).is_unchanged());
    }

    #[test]
    fn test_diff_trailing_newline_normalized() {
        let lines = render_diff("a\nb\n", "a\nb");
        assert!(lines.iter().all(|l| l.tag == DiffTag::Context));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn test_diff_append() {
        let lines = render_diff("Name: Alice", "Name: Alice\n\nGoal: improve pacing");
        assert_eq!(tags(&lines), " ++");
        assert_eq!(lines[1].text, "");
        assert_eq!(lines[2].text, "Goal: improve pacing");
        assert_eq!(lines[2].new_line, Some(3));
        assert_eq!(lines[2].old_line, None);
        assert_eq!(diff_stats(&lines), DiffStats { added: 2, removed: 0 });
    }

    #[test]
    fn test_diff_replace_middle_keeps_line_numbers() {
        let lines = render_diff("one\ntwo\nthree", "one\n2\nthree");
        assert_eq!(tags(&lines), " -+ ");
        assert_eq!(lines[1].old_line, Some(2));
        assert_eq!(lines[2].new_line, Some(2));
        assert_eq!(lines[3].old_line, Some(3));
        assert_eq!(lines[3].new_line, Some(3));
    }

    #[test]
    fn test_diff_from_empty() {
        let lines = render_diff("", "x\ny");
        assert_eq!(tags(&lines), "++");
        let lines = render_diff("x\ny", "");
        assert_eq!(tags(&lines), "--");
    }

    #[test]
    fn test_diff_interleaved() {
        let old = "a\nb\nc\nd";
        let new = "a\nc\nd\ne";
        let lines = render_diff(old, new);
        assert_eq!(tags(&lines), " -  +");
        let stats = diff_stats(&lines);
        assert_eq!(stats, DiffStats { added: 1, removed: 1 });
    }

    #[test]
    fn test_diff_is_deterministic() {
        let old = "x\ny\nx\ny";
        let new = "y\nx\ny\nx";
        assert_eq!(render_diff(old, new), render_diff(old, new));
    }

    #[test]
    fn test_diff_reconstructs_both_sides() {
        let old = "alpha\nbeta\ngamma\ndelta";
        let new = "alpha\ngamma\nepsilon\ndelta\nzeta";
        let lines = render_diff(old, new);

        let rebuilt_old: Vec<&str> = lines
            .iter()
            .filter(|l| l.tag != DiffTag::Addition)
            .map(|l| l.text.as_str())
            .collect();
        let rebuilt_new: Vec<&str> = lines
            .iter()
            .filter(|l| l.tag != DiffTag::Deletion)
            .map(|l| l.text.as_str())
            .collect();
        assert_eq!(rebuilt_old.join("\n"), old);
        assert_eq!(rebuilt_new.join("\n"), new);
    }

    #[test]
    fn test_render_unified() {
        let lines = render_diff("a\nb", "a\nc");
        assert_eq!(render_unified(&lines), " a\n-b\n+c");
    }

    #[test]
    fn test_large_rewrite_renders_as_replacement() {
        // 3000 x 3000 changed lines is past the table cap.
        let old: Vec<String> = (0..3000).map(|i| format!("old {i}")).collect();
        let new: Vec<String> = (0..3000).map(|i| format!("new {i}")).collect();
        let old = format!("head\n{}\ntail", old.join("\n"));
        let new = format!("head\n{}\ntail", new.join("\n"));
        assert!(3000 * 3000 > MAX_DIFF_CELLS);

        let lines = render_diff(&old, &new);
        assert_eq!(lines.len(), 6002);
        assert_eq!(diff_stats(&lines), DiffStats { added: 3000, removed: 3000 });
        assert_eq!(lines[0], context(0, 0, "head"));
        assert_eq!(lines[1].old_line, Some(2));
        assert_eq!(lines[1].text, "old 0");
        assert_eq!(lines[3000].tag, DiffTag::Deletion);
        assert_eq!(lines[3001].tag, DiffTag::Addition);
        assert_eq!(lines[3001].new_line, Some(2));
        assert_eq!(lines[3001].text, "new 0");
        assert_eq!(lines[6001], context(3001, 3001, "tail"));
    }

    #[test]
    fn test_small_edit_in_large_body_keeps_lcs() {
        let body: Vec<String> = (0..5000).map(|i| format!("line {i}")).collect();
        let old = body.join("\n");
        let mut edited = body.clone();
        edited[2500] = "changed".into();
        let new = edited.join("\n");

        let lines = render_diff(&old, &new);
        assert_eq!(diff_stats(&lines), DiffStats { added: 1, removed: 1 });
        assert_eq!(lines.len(), 5001);
    }
}
