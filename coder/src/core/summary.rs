//! Size-bounded text for prompts and logs.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::types::StepResult;

/// Truncate `text` to at most `limit` bytes on a char boundary, noting how much
/// was dropped.
pub fn truncate_with_notice(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..cut], text.len() - cut)
}

/// One step result as shown to the refiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultSummary {
    pub index: usize,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Summaries in step order with long text fields truncated to `limit` bytes.
pub fn summarize_results(
    results: &BTreeMap<usize, StepResult>,
    limit: usize,
) -> Vec<ResultSummary> {
    let bound = |text: Option<&str>| text.map(|t| truncate_with_notice(t, limit));
    results
        .iter()
        .map(|(&index, result)| ResultSummary {
            index,
            status: result.status().as_str().to_string(),
            file: result.file.clone(),
            error: bound(result.error()),
            output: bound(result.output.as_deref()),
            note: bound(result.note.as_deref()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_with_notice("short", 10), "short");
        let text = "héllo";
        // 'é' spans bytes 1..3; a limit of 2 must back off to 1.
        assert_eq!(truncate_with_notice(text, 2), "h\n[truncated 5 bytes]");
    }

    #[test]
    fn summaries_bound_long_outputs() {
        let mut results = BTreeMap::new();
        results.insert(1, StepResult::failed("e".repeat(50)));
        results.insert(0, StepResult::completed().with_output("o".repeat(50)));
        let summary = summarize_results(&results, 10);
        assert_eq!(summary[0].index, 0);
        assert_eq!(summary[0].status, "completed");
        assert!(summary[0].output.as_deref().unwrap().ends_with("[truncated 40 bytes]"));
        assert_eq!(summary[1].status, "failed");
        assert!(summary[1].error.as_deref().unwrap().starts_with("eeeeeeeeee\n"));
    }
}
