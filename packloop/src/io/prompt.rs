//! Prompt rendering for oracle requests.

use anyhow::Result;
use minijinja::{Environment, context};

use crate::core::classifier::{is_syntax_error, syntax_error_excerpt};
use crate::core::log_diff::LogComparison;
use crate::core::types::{BuildError, DEFAULT_TRUNCATE_LINES, ErrorKind};
use crate::io::oracle::{FixContext, RefineContext};

const FIX_GENERAL_TEMPLATE: &str = include_str!("prompts/fix_general.md");
const FIX_HASH_TEMPLATE: &str = include_str!("prompts/fix_hash.md");
const JUDGE_PROGRESS_TEMPLATE: &str = include_str!("prompts/judge_progress.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("fix_general", FIX_GENERAL_TEMPLATE)
            .expect("fix_general template should be valid");
        env.add_template("fix_hash", FIX_HASH_TEMPLATE)
            .expect("fix_hash template should be valid");
        env.add_template("judge_progress", JUDGE_PROGRESS_TEMPLATE)
            .expect("judge_progress template should be valid");
        env.add_template("refine", REFINE_TEMPLATE)
            .expect("refine template should be valid");
        Self { env }
    }

    /// Prompt for a general fix of any non-hash error.
    pub fn render_fix_general(
        &self,
        code: &str,
        error: &BuildError,
        fix: &FixContext,
    ) -> Result<String> {
        let (excerpt, total_pages) = error_excerpt(error, fix.page_lines);
        let template = self.env.get_template("fix_general")?;
        let rendered = template.render(context! {
            code => code.trim_end(),
            kind => error.kind.as_str(),
            error => excerpt.trim_end(),
            total_pages => total_pages,
            first_build_error => fix.first_build_error,
            dependency_error => error.kind == ErrorKind::DependencyBuildError,
            syntax_error => is_syntax_error(error),
            broken_log_output => fix.broken_log_output,
            project_summary => fix.project_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Prompt for a narrow hash-only fix.
    pub fn render_fix_hash(&self, code: &str, error: &BuildError) -> Result<String> {
        let template = self.env.get_template("fix_hash")?;
        let rendered = template.render(context! {
            code => code.trim_end(),
            kind => error.kind.as_str(),
            error => error.truncated(DEFAULT_TRUNCATE_LINES).trim_end(),
        })?;
        Ok(rendered)
    }

    /// Prompt asking for an improvement to a package that already builds.
    pub fn render_refine(&self, code: &str, refine: &RefineContext) -> Result<String> {
        let template = self.env.get_template("refine")?;
        let rendered = template.render(context! {
            code => code.trim_end(),
            round => refine.round,
            max_rounds => refine.max_rounds,
            project_summary => refine.project_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        })?;
        Ok(rendered)
    }

    /// Prompt asking the judge to compare two build logs.
    pub fn render_judge(&self, comparison: &LogComparison) -> Result<String> {
        let template = self.env.get_template("judge_progress")?;
        let rendered = template.render(context! {
            previous_log => comparison.previous_text(),
            new_log => comparison.new_text(),
            initial_lines => comparison.initial_lines(),
            improvement_lines => comparison.improvement_lines(),
            divergence_line => comparison.divergence_line(),
        })?;
        Ok(rendered)
    }
}

/// The part of an error the oracle sees, and how many pages the whole error spans.
fn error_excerpt(error: &BuildError, page_lines: usize) -> (String, usize) {
    if is_syntax_error(error) {
        return (syntax_error_excerpt(&error.message).to_string(), 1);
    }
    match error.page(1, page_lines) {
        Some(page) => (page.text, page.total_pages),
        None => (error.message.clone(), 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log_diff::compare_logs;

    fn fix_context() -> FixContext {
        FixContext {
            page_lines: 256,
            ..FixContext::default()
        }
    }

    #[test]
    fn general_fix_includes_code_and_error() {
        let engine = PromptEngine::new();
        let error = BuildError::new(ErrorKind::BuildError, "make: *** [all] Error 2");
        let prompt = engine
            .render_fix_general("{ stdenv }: stdenv.mkDerivation {}", &error, &fix_context())
            .expect("render");
        assert!(prompt.contains("stdenv.mkDerivation"));
        assert!(prompt.contains("make: *** [all] Error 2"));
        assert!(prompt.contains("kind=\"BUILD_ERROR\""));
        assert!(!prompt.contains("<project>"));
        assert!(!prompt.contains("corrupted"));
    }

    #[test]
    fn syntax_errors_show_only_the_excerpt() {
        let engine = PromptEngine::new();
        let error = BuildError::new(
            ErrorKind::EvalError,
            "trace: evaluating flake\nerror: syntax error, unexpected '}'",
        );
        let prompt = engine
            .render_fix_general("{", &error, &fix_context())
            .expect("render");
        assert!(prompt.contains("does not parse"));
        assert!(!prompt.contains("trace: evaluating flake"));
    }

    #[test]
    fn flags_change_the_prompt() {
        let engine = PromptEngine::new();
        let error = BuildError::new(ErrorKind::DependencyBuildError, "1 dependencies failed");
        let fix = FixContext {
            broken_log_output: true,
            project_summary: Some("Builds with cmake.".to_string()),
            ..fix_context()
        };
        let prompt = engine
            .render_fix_general("code", &error, &fix)
            .expect("render");
        assert!(prompt.contains("A dependency of this package failed"));
        assert!(prompt.contains("corrupted"));
        assert!(prompt.contains("Builds with cmake."));
    }

    #[test]
    fn long_errors_show_the_last_page() {
        let engine = PromptEngine::new();
        let log = (1..=30)
            .map(|n| format!("step {n}"))
            .collect::<Vec<_>>()
            .join("\n");
        let error = BuildError::new(ErrorKind::BuildError, log);
        let fix = FixContext {
            page_lines: 10,
            ..FixContext::default()
        };
        let prompt = engine.render_fix_general("code", &error, &fix).expect("render");
        assert!(prompt.contains("3 pages"));
        assert!(prompt.contains("step 30"));
        assert!(!prompt.contains("step 20\n"));
    }

    #[test]
    fn hash_fix_mentions_fake_hash() {
        let engine = PromptEngine::new();
        let error = BuildError::new(
            ErrorKind::HashMismatch,
            "hash mismatch in fixed-output derivation\n got: sha256-BBBB",
        );
        let prompt = engine.render_fix_hash("code", &error).expect("render");
        assert!(prompt.contains("lib.fakeHash"));
        assert!(prompt.contains("sha256-BBBB"));
        assert!(prompt.contains("HASH_MISMATCH"));
    }

    #[test]
    fn refine_prompt_names_round_and_project() {
        let engine = PromptEngine::new();
        let refine = RefineContext {
            round: 1,
            max_rounds: 3,
            project_summary: Some("A CLI written in Go.".to_string()),
        };
        let prompt = engine.render_refine("{ buildGoModule }: 1", &refine).expect("render");
        assert!(prompt.contains("round 1 of 3"));
        assert!(prompt.contains("{ buildGoModule }: 1"));
        assert!(prompt.contains("A CLI written in Go."));

        let bare = engine
            .render_refine("code", &RefineContext::default())
            .expect("render");
        assert!(!bare.contains("<project>"));
    }

    #[test]
    fn judge_prompt_reports_divergence_only_for_long_logs() {
        let engine = PromptEngine::new();
        let short = compare_logs("a\nb", "a\nc", 240);
        let prompt = engine.render_judge(&short).expect("render");
        assert!(prompt.contains("shown in full"));
        assert!(prompt.contains("   2: c"));

        let previous = (1..=150).map(|n| format!("p{n}")).collect::<Vec<_>>().join("\n");
        let long = compare_logs(&previous, "p1\nq", 240);
        let prompt = engine.render_judge(&long).expect("render");
        assert!(prompt.contains("diverge at line 2"));
        assert!(prompt.contains("lines=\"150\""));
    }
}
