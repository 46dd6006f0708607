//! Bounded line diff (longest common subsequence).
//!
//! The table is O(n·m), so inputs whose combined line count exceeds the bound
//! are reported as truncated without computing anything.

use kedit_core::{DiffLine, DiffResult};
use metrics::{counter, histogram};

/// Combined line budget for [`diff_lines`].
pub const DIFF_MAX_LINES: usize = 800;

pub fn diff_lines(before: &str, after: &str) -> DiffResult {
    diff_lines_bounded(before, after, DIFF_MAX_LINES)
}

pub fn diff_lines_bounded(before: &str, after: &str, max_lines: usize) -> DiffResult {
    let a: Vec<&str> = before.split('\n').collect();
    let b: Vec<&str> = after.split('\n').collect();
    if a.len() + b.len() > max_lines {
        counter!("diff_truncated_total", 1u64);
        return DiffResult::truncated();
    }
    let t0 = std::time::Instant::now();
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    // dp[i][j] = LCS length of a[i..] and b[j..]
    let mut dp = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            dp[i * width + j] = if a[i] == b[j] {
                dp[(i + 1) * width + j + 1] + 1
            } else {
                dp[(i + 1) * width + j].max(dp[i * width + j + 1])
            };
        }
    }

    let mut lines = Vec::with_capacity(n.max(m));
    let (mut i, mut j) = (0usize, 0usize);
    let (mut left, mut right) = (1u32, 1u32);
    while i < n && j < m {
        if a[i] == b[j] {
            lines.push(DiffLine::context(a[i], left, right));
            i += 1;
            j += 1;
            left += 1;
            right += 1;
        } else if dp[(i + 1) * width + j] >= dp[i * width + j + 1] {
            // ties go to the deletion
            lines.push(DiffLine::removed(a[i], left));
            i += 1;
            left += 1;
        } else {
            lines.push(DiffLine::added(b[j], right));
            j += 1;
            right += 1;
        }
    }
    for rest in &a[i..] {
        lines.push(DiffLine::removed(*rest, left));
        left += 1;
    }
    for rest in &b[j..] {
        lines.push(DiffLine::added(*rest, right));
        right += 1;
    }
    histogram!("diff_ms", t0.elapsed().as_secs_f64() * 1000.0);
    DiffResult { lines, truncated: false }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kedit_core::DiffLineKind;

    /// Deterministic line soup from a tiny alphabet so common subsequences are frequent.
    fn lines_from(seed: &mut u64, count: usize) -> String {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            *seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pick = (*seed >> 33) % 5;
            out.push(["a", "b", "c", "  key: v", ""][pick as usize]);
        }
        out.join("\n")
    }

    #[test]
    fn substitution_emits_removal_before_addition() {
        let d = diff_lines("a\nb\nc", "a\nx\nc");
        assert_eq!(
            d.lines,
            vec![
                DiffLine::context("a", 1, 1),
                DiffLine::removed("b", 2),
                DiffLine::added("x", 2),
                DiffLine::context("c", 3, 3),
            ]
        );
    }

    #[test]
    fn tails_are_pure_additions_or_removals() {
        let d = diff_lines("a", "a\nb\nc");
        assert_eq!(d.lines[1], DiffLine::added("b", 2));
        assert_eq!(d.lines[2], DiffLine::added("c", 3));
        let d = diff_lines("a\nb\nc", "a");
        assert_eq!(d.lines[1], DiffLine::removed("b", 2));
        assert_eq!(d.lines[2], DiffLine::removed("c", 3));
    }

    #[test]
    fn tie_break_prefers_deletions() {
        // "ab" vs "ba": both one-line LCS choices cost the same
        let d = diff_lines("a\nb", "b\na");
        let kinds: Vec<_> = d.lines.iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![DiffLineKind::Removed, DiffLineKind::Context, DiffLineKind::Added]);
        assert_eq!(d.lines[1], DiffLine::context("b", 2, 1));
    }

    #[test]
    fn identical_inputs_are_all_context() {
        let text = "apiVersion: v1\nkind: ConfigMap\n\ndata: {}\n";
        let d = diff_lines(text, text);
        assert!(!d.truncated);
        assert_eq!(d.lines.len(), text.split('\n').count());
        for (idx, l) in d.lines.iter().enumerate() {
            let n = idx as u32 + 1;
            assert_eq!(l, &DiffLine::context(text.split('\n').nth(idx).unwrap(), n, n));
        }
    }

    #[test]
    fn script_replays_both_sides() {
        let mut seed = 0x5eed_u64;
        for round in 0..200 {
            let a = lines_from(&mut seed, round % 37);
            let b = lines_from(&mut seed, (round * 7) % 41);
            let d = diff_lines(&a, &b);
            assert!(!d.truncated);
            assert_eq!(d.left_text(), a, "round {}", round);
            assert_eq!(d.right_text(), b, "round {}", round);
        }
    }

    #[test]
    fn line_numbers_follow_their_side() {
        let mut seed = 42u64;
        let a = lines_from(&mut seed, 30);
        let b = lines_from(&mut seed, 30);
        let d = diff_lines(&a, &b);
        let (mut left, mut right) = (1u32, 1u32);
        for l in &d.lines {
            match l.kind {
                DiffLineKind::Context => {
                    assert_eq!((l.left_line_no, l.right_line_no), (Some(left), Some(right)));
                    left += 1;
                    right += 1;
                }
                DiffLineKind::Removed => {
                    assert_eq!((l.left_line_no, l.right_line_no), (Some(left), None));
                    left += 1;
                }
                DiffLineKind::Added => {
                    assert_eq!((l.left_line_no, l.right_line_no), (None, Some(right)));
                    right += 1;
                }
            }
        }
    }

    #[test]
    fn cost_bound_truncates_without_lines() {
        let a = vec!["x"; 400].join("\n");
        let b = vec!["y"; 400].join("\n");
        assert!(!diff_lines(&a, &b).truncated);
        let b = vec!["y"; 401].join("\n");
        assert_eq!(diff_lines(&a, &b), DiffResult::truncated());
        assert_eq!(diff_lines_bounded("a\nb", "a", 2), DiffResult::truncated());
    }
}
