//! Prompt text for the synthesis calls.

use crate::vector_index::RetrievedChunk;
use std::fmt::Write;

pub const COVERAGE_SYSTEM: &str = "You are an insurance policy analyst. \
Decide whether the described incident is covered using only the numbered policy excerpts. \
Do not rely on general knowledge of insurance products. \
Reply with a single JSON object with these keys: \
\"isCovered\" (true, false, or null when the excerpts do not settle it), \
\"confidenceLevel\" (\"high\", \"medium\" or \"low\"), \
\"summary\" (two or three sentences), \
\"coveredAspects\", \"excludedAspects\", \"requiredDocuments\", \"actionSteps\" \
(arrays of short strings).";

pub const EXTRACTION_SYSTEM: &str = "You extract structured facts from insurance policy excerpts. \
Reply with a single JSON object using these keys, and null for anything the excerpts do not state: \
\"planName\" (string), \"deductible\" (number), \"reimbursementRate\" (percentage 0-100), \
\"annualLimit\" and \"perIncidentLimit\" (number or \"unlimited\"), \"monthlyPremium\" (number), \
\"waitingPeriods\" (object with optional \"accident\", \"illness\", \"orthopedic\" day counts), \
\"coveredServices\" and \"exclusions\" (arrays of strings), \
\"effectiveDate\" and \"expirationDate\" (YYYY-MM-DD).";

pub const ANSWER_SYSTEM: &str = "You answer questions about an insurance policy using only the \
numbered excerpts provided. Cite excerpts inline as [Source N]. If the excerpts do not contain \
the answer, say that the policy documents do not cover it.";

pub const COMPARISON_SYSTEM: &str = "You compare two insurance policies topic by topic using only \
the excerpts provided for each. Point out concrete differences in amounts, limits, waiting periods \
and exclusions. Say so when one side has no evidence for a topic.";

/// Render retrieved chunks as numbered sources.
pub fn format_evidence(chunks: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for (i, hit) in chunks.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let _ = write!(out, "[Source {}", i + 1);
        if let Some(page) = hit.chunk.page_number {
            let _ = write!(out, ", page {page}");
        }
        let _ = writeln!(out, "]\n{}", hit.chunk.text.trim());
    }
    out
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunk;

    fn hit(text: &str, page: Option<u32>) -> RetrievedChunk {
        RetrievedChunk {
            id: "x".into(),
            chunk: Chunk {
                text: text.into(),
                chunk_index: 0,
                page_number: page,
                document_id: None,
                policy_id: None,
            },
            distance: 0.1,
        }
    }

    #[test]
    fn test_format_evidence_numbers_sources() {
        let rendered = format_evidence(&[
            hit(" Deductible is $250. ", Some(2)),
            hit("Excl.", None),
        ]);
        assert_eq!(
            rendered,
            "[Source 1, page 2]\nDeductible is $250.\n\n[Source 2]\nExcl.\n"
        );
        assert_eq!(format_evidence(&[]), "");
    }

    #[test]
    fn test_excerpt_is_char_safe() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
        assert_eq!(excerpt("short", 10), "short");
    }
}
