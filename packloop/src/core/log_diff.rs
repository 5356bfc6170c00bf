//! Build log comparison anchored at the first point of divergence.

use serde::Serialize;

/// Logs shorter than this (both of them) are compared in full.
pub const FULL_LOG_THRESHOLD: usize = 100;

/// Default window size for long logs.
pub const DEFAULT_MAX_LINES: usize = 240;

/// Comparable view of a previous and a new build log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogComparison {
    /// Both logs are short; every line is kept and numbered.
    FullLogDiff {
        previous_log: String,
        new_log: String,
        initial_lines: usize,
        improvement_lines: usize,
    },
    /// Both logs are cut to a window that starts no earlier than the divergence line.
    ProcessedLogDiff {
        previous_truncated: String,
        new_truncated: String,
        initial_lines: usize,
        improvement_lines: usize,
        divergence_line: usize,
    },
}

impl LogComparison {
    pub fn initial_lines(&self) -> usize {
        match self {
            LogComparison::FullLogDiff { initial_lines, .. }
            | LogComparison::ProcessedLogDiff { initial_lines, .. } => *initial_lines,
        }
    }

    pub fn improvement_lines(&self) -> usize {
        match self {
            LogComparison::FullLogDiff {
                improvement_lines, ..
            }
            | LogComparison::ProcessedLogDiff {
                improvement_lines, ..
            } => *improvement_lines,
        }
    }

    pub fn divergence_line(&self) -> Option<usize> {
        match self {
            LogComparison::FullLogDiff { .. } => None,
            LogComparison::ProcessedLogDiff {
                divergence_line, ..
            } => Some(*divergence_line),
        }
    }

    /// The previous log as shown to the judge.
    pub fn previous_text(&self) -> &str {
        match self {
            LogComparison::FullLogDiff { previous_log, .. } => previous_log,
            LogComparison::ProcessedLogDiff {
                previous_truncated, ..
            } => previous_truncated,
        }
    }

    /// The new log as shown to the judge.
    pub fn new_text(&self) -> &str {
        match self {
            LogComparison::FullLogDiff { new_log, .. } => new_log,
            LogComparison::ProcessedLogDiff { new_truncated, .. } => new_truncated,
        }
    }
}

/// Compare `previous` (the best build so far) against `current` (the candidate).
pub fn compare_logs(previous: &str, current: &str, max_lines: usize) -> LogComparison {
    let previous_lines: Vec<&str> = previous.lines().collect();
    let current_lines: Vec<&str> = current.lines().collect();
    let initial_lines = previous_lines.len();
    let improvement_lines = current_lines.len();

    if initial_lines < FULL_LOG_THRESHOLD && improvement_lines < FULL_LOG_THRESHOLD {
        return LogComparison::FullLogDiff {
            previous_log: number_lines(&previous_lines, 1),
            new_log: number_lines(&current_lines, 1),
            initial_lines,
            improvement_lines,
        };
    }

    let divergence = divergence_line(&previous_lines, &current_lines);
    let previous_start = window_start(initial_lines, max_lines, divergence);
    let current_start = window_start(improvement_lines, max_lines, divergence);

    LogComparison::ProcessedLogDiff {
        previous_truncated: number_lines(&previous_lines[previous_start..], previous_start + 1),
        new_truncated: number_lines(&current_lines[current_start..], current_start + 1),
        initial_lines,
        improvement_lines,
        divergence_line: divergence,
    }
}

/// 1-based index of the first `previous` line that occurs nowhere in `current`.
///
/// Presence is checked against the whole of `current`, so reordered or
/// interleaved output does not count as divergence. When every overlapping line
/// is present, the result is `min(len(previous), len(current)) + 1`.
pub fn divergence_line(previous: &[&str], current: &[&str]) -> usize {
    let present: std::collections::HashSet<&str> = current.iter().copied().collect();
    let overlap = previous.len().min(current.len());
    previous[..overlap]
        .iter()
        .position(|line| !present.contains(line))
        .map(|idx| idx + 1)
        .unwrap_or(overlap + 1)
}

fn window_start(total: usize, max_lines: usize, divergence: usize) -> usize {
    total
        .saturating_sub(max_lines)
        .max(divergence.saturating_sub(1))
        .min(total)
}

fn number_lines(lines: &[&str], first_line: usize) -> String {
    lines
        .iter()
        .enumerate()
        .map(|(offset, line)| format!("{:>4}: {}", first_line + offset, line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(prefix: &str, count: usize) -> String {
        (1..=count)
            .map(|n| format!("{prefix} {n}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn short_logs_are_kept_whole_and_numbered() {
        let cmp = compare_logs("a\nb", "a\nc\nd", DEFAULT_MAX_LINES);
        match cmp {
            LogComparison::FullLogDiff {
                previous_log,
                new_log,
                initial_lines,
                improvement_lines,
            } => {
                assert_eq!(previous_log, "   1: a\n   2: b");
                assert_eq!(new_log, "   1: a\n   2: c\n   3: d");
                assert_eq!(initial_lines, 2);
                assert_eq!(improvement_lines, 3);
            }
            other => panic!("expected full diff, got {other:?}"),
        }
    }

    #[test]
    fn full_diff_preserves_every_line_verbatim() {
        let previous = log_of("prev", 99);
        let current = log_of("cur", 42);
        let cmp = compare_logs(&previous, &current, 10);
        assert!(cmp.divergence_line().is_none());
        for (idx, line) in previous.lines().enumerate() {
            let numbered = format!("{:>4}: {}", idx + 1, line);
            assert!(cmp.previous_text().lines().any(|l| l == numbered));
        }
        assert_eq!(cmp.new_text().lines().count(), 42);
    }

    #[test]
    fn one_long_log_switches_to_processed_diff() {
        let previous = log_of("line", 100);
        let cmp = compare_logs(&previous, "line 1", DEFAULT_MAX_LINES);
        assert!(matches!(cmp, LogComparison::ProcessedLogDiff { .. }));
    }

    #[test]
    fn divergence_uses_presence_not_position() {
        let previous = ["a", "b", "c", "d"];
        let current = ["b", "a", "x", "c"];
        // "d" is the first previous line missing from current.
        assert_eq!(divergence_line(&previous, &current), 4);
    }

    #[test]
    fn divergence_defaults_past_the_overlap() {
        let previous = ["a", "b"];
        let current = ["a", "b", "c", "d"];
        assert_eq!(divergence_line(&previous, &current), 3);
        assert_eq!(divergence_line(&[], &current), 1);
    }

    #[test]
    fn divergence_is_bounded_by_shorter_log() {
        let cases: Vec<(Vec<&str>, Vec<&str>)> = vec![
            (vec!["x"], vec!["y"]),
            (vec!["a", "b", "c"], vec!["a"]),
            (vec!["a"], vec!["a", "b", "c"]),
            (vec![], vec![]),
        ];
        for (previous, current) in &cases {
            let div = divergence_line(previous, current);
            assert!(div <= previous.len().min(current.len()) + 1);
            assert!(div >= 1);
        }
    }

    #[test]
    fn windows_start_at_divergence_when_late() {
        let shared = log_of("shared", 150);
        let previous = format!("{shared}\nold failure");
        let current = format!("{shared}\nnew step\nnew failure");
        let cmp = compare_logs(&previous, &current, 240);
        let LogComparison::ProcessedLogDiff {
            previous_truncated,
            new_truncated,
            divergence_line,
            ..
        } = cmp
        else {
            panic!("expected processed diff");
        };
        assert_eq!(divergence_line, 151);
        assert_eq!(previous_truncated, " 151: old failure");
        assert_eq!(new_truncated, " 151: new step\n 152: new failure");
    }

    #[test]
    fn windows_never_exceed_max_lines() {
        let previous = log_of("p", 500);
        let current = log_of("c", 420);
        let cmp = compare_logs(&previous, &current, 240);
        assert_eq!(cmp.divergence_line(), Some(1));
        assert_eq!(cmp.previous_text().lines().count(), 240);
        assert_eq!(cmp.new_text().lines().count(), 240);
        assert!(cmp.previous_text().starts_with(" 261: p 261"));
        assert!(cmp.new_text().starts_with(" 181: c 181"));
    }

    #[test]
    fn comparison_is_deterministic() {
        let previous = log_of("p", 120);
        let current = log_of("p", 130);
        assert_eq!(
            compare_logs(&previous, &current, 50),
            compare_logs(&previous, &current, 50)
        );
    }
}
