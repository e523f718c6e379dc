use dock_types::{PlanComplexity, PlanMetadata};

/// Start/end marker pairs an agent may use to delimit its plan block, in
/// precedence order.
pub const PLAN_MARKERS: &[(&str, &str)] = &[
    ("=== PLAN ===", "=== END PLAN ==="),
    ("<plan>", "</plan>"),
    ("## Plan", "## End Plan"),
    ("PLAN:", "END PLAN"),
];

const TRUNCATED_PREFIX_LEN: usize = 500;

/// Outcome of scanning an agent transcript for a plan. The precedence is the
/// contract: a marked block wins over a bulleted list, a bulleted list over a
/// numbered one, and the truncated prefix is the last resort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanExtract {
    Marked { prefix: String, body: String },
    BulletList(Vec<String>),
    NumberedList(Vec<String>),
    Truncated(String),
}

impl PlanExtract {
    pub fn text(&self) -> String {
        match self {
            Self::Marked { body, .. } => body.clone(),
            Self::BulletList(lines) | Self::NumberedList(lines) => lines.join("\n"),
            Self::Truncated(body) => body.clone(),
        }
    }

    pub fn step_count(&self) -> usize {
        match self {
            Self::BulletList(lines) | Self::NumberedList(lines) => lines.len(),
            Self::Marked { body, .. } => body.lines().filter(|l| !l.trim().is_empty()).count(),
            Self::Truncated(_) => 1,
        }
    }
}

pub fn extract_plan(transcript: &str) -> PlanExtract {
    for (start, end) in PLAN_MARKERS {
        if let Some(open) = transcript.find(start) {
            let after = &transcript[open + start.len()..];
            let body = match after.find(end) {
                Some(close) => &after[..close],
                None => after,
            };
            return PlanExtract::Marked {
                prefix: (*start).to_string(),
                body: body.trim().to_string(),
            };
        }
    }

    let bullets: Vec<String> = transcript
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("- ") || l.starts_with("* ") || l.starts_with("• "))
        .map(|l| l.to_string())
        .collect();
    if !bullets.is_empty() {
        return PlanExtract::BulletList(bullets);
    }

    let numbered: Vec<String> = transcript
        .lines()
        .map(str::trim)
        .filter(|l| is_numbered_line(l))
        .map(|l| l.to_string())
        .collect();
    if !numbered.is_empty() {
        return PlanExtract::NumberedList(numbered);
    }

    let prefix: String = transcript.chars().take(TRUNCATED_PREFIX_LEN).collect();
    PlanExtract::Truncated(prefix.trim().to_string())
}

fn is_numbered_line(line: &str) -> bool {
    let digits: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return false;
    }
    let rest = &line[digits.len()..];
    rest.starts_with(". ") || rest.starts_with(") ")
}

/// Does the end-of-plan marker for any known pair appear in the transcript?
/// This is the explicit completion signal for agents that keep the planning
/// child alive awaiting approval.
pub fn plan_block_complete(transcript: &str) -> bool {
    PLAN_MARKERS
        .iter()
        .any(|(start, end)| transcript.contains(start) && transcript.contains(end))
}

/// Paths mentioned in the plan body; surfaced to the client as a hint, never
/// as ground truth.
pub fn extract_file_hints(plan_text: &str) -> Vec<String> {
    let mut hints: Vec<String> = Vec::new();
    for token in plan_text.split(|c: char| c.is_whitespace() || c == '`' || c == ',') {
        let token = token.trim_matches(|c: char| "()[]{}:;\"'".contains(c));
        if token.len() < 3 || (!token.contains('/') && !token.contains('.')) {
            continue;
        }
        let looks_like_path = token.contains('/')
            || token
                .rsplit_once('.')
                .map(|(stem, ext)| {
                    !stem.is_empty() && ext.len() <= 4 && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
                .unwrap_or(false);
        if looks_like_path
            && !token.starts_with("http")
            && !hints.iter().any(|h| h == token)
        {
            hints.push(token.to_string());
        }
    }
    hints.truncate(32);
    hints
}

/// Coarse complexity/risk call used for the plan metadata the client renders.
pub fn assess_plan(extract: &PlanExtract) -> PlanMetadata {
    let text = extract.text();
    let steps = extract.step_count();
    let complexity = match steps {
        0..=3 => PlanComplexity::Low,
        4..=8 => PlanComplexity::Medium,
        _ => PlanComplexity::High,
    };

    let lowered = text.to_lowercase();
    let risky_terms = [
        "delete", "remove", "drop", "force", "migrat", "rewrite", "truncate", "reset",
    ];
    let hits = risky_terms.iter().filter(|t| lowered.contains(**t)).count();
    let risk_level = match hits {
        0 => PlanComplexity::Low,
        1 => PlanComplexity::Medium,
        _ => PlanComplexity::High,
    };

    let minutes = (steps.max(1) * 3).min(60);
    PlanMetadata {
        complexity,
        risk_level,
        estimated_duration: format!("{minutes}m"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marked_block_wins_over_lists() {
        let transcript = "thinking...\n=== PLAN ===\n- edit src/lib.rs\n- run tests\n=== END PLAN ===\ntrailer";
        match extract_plan(transcript) {
            PlanExtract::Marked { prefix, body } => {
                assert_eq!(prefix, "=== PLAN ===");
                assert!(body.contains("edit src/lib.rs"));
                assert!(!body.contains("trailer"));
            }
            other => panic!("expected marked block, got {other:?}"),
        }
    }

    #[test]
    fn bullets_beat_numbered_lines() {
        let transcript = "1. numbered\n- bullet one\n- bullet two\n";
        match extract_plan(transcript) {
            PlanExtract::BulletList(lines) => assert_eq!(lines.len(), 2),
            other => panic!("expected bullets, got {other:?}"),
        }
    }

    #[test]
    fn numbered_lines_beat_the_truncated_prefix() {
        let transcript = "preamble\n1. first step\n2) second step\n";
        match extract_plan(transcript) {
            PlanExtract::NumberedList(lines) => {
                assert_eq!(lines, vec!["1. first step", "2) second step"]);
            }
            other => panic!("expected numbered list, got {other:?}"),
        }
    }

    #[test]
    fn fallback_truncates_to_five_hundred_chars() {
        let long = "x".repeat(900);
        match extract_plan(&long) {
            PlanExtract::Truncated(body) => assert_eq!(body.len(), 500),
            other => panic!("expected truncated prefix, got {other:?}"),
        }
    }

    #[test]
    fn unterminated_marker_takes_the_rest() {
        let transcript = "<plan>\n- only step";
        match extract_plan(transcript) {
            PlanExtract::Marked { body, .. } => assert_eq!(body, "- only step"),
            other => panic!("expected marked block, got {other:?}"),
        }
    }

    #[test]
    fn completion_requires_both_markers() {
        assert!(!plan_block_complete("=== PLAN ===\n- step"));
        assert!(plan_block_complete("=== PLAN ===\n- step\n=== END PLAN ==="));
    }

    #[test]
    fn file_hints_pick_up_paths() {
        let hints = extract_file_hints("edit src/lib.rs and update Cargo.toml, skip https://x.test");
        assert!(hints.contains(&"src/lib.rs".to_string()));
        assert!(hints.contains(&"Cargo.toml".to_string()));
        assert!(!hints.iter().any(|h| h.contains("http")));
    }

    #[test]
    fn risky_words_raise_the_risk_level() {
        let calm = extract_plan("- add a test\n- tidy docs");
        assert_eq!(assess_plan(&calm).risk_level, PlanComplexity::Low);

        let risky = extract_plan("- drop the table\n- force push\n- delete backups");
        assert_eq!(assess_plan(&risky).risk_level, PlanComplexity::High);
    }

    #[test]
    fn step_count_drives_complexity() {
        let many: Vec<String> = (0..10).map(|i| format!("- step {i}")).collect();
        let extract = PlanExtract::BulletList(many);
        assert_eq!(assess_plan(&extract).complexity, PlanComplexity::High);
    }
}
