//! Bounded context assembly and prompt templates.
//!
//! [`assemble_context`] fills a character budget in strict priority order:
//! retrieved manual passages first (in retrieval order), then the recent
//! conversation window (newest message first), then long-term recall.
//! Whatever does not fit is dropped from the lowest priority tier upward.
//! The rendered text always lists sections in the same order regardless of
//! which tiers were cut.

use serde::Serialize;

use crate::error::GenerationError;
use crate::models::{Citation, Message, ScoredChunk, Summary};

/// Fixed answer when the manuals do not cover the question.
pub const NOT_FOUND_ANSWER: &str =
    "I could not find this information in the available technical manuals.";

pub const CONTEXT_OPEN: &str = "=== CONTEXT ===";
pub const CONTEXT_CLOSE: &str = "=== END CONTEXT ===";
pub const PASSAGES_HEADER: &str = "## Manual passages";
pub const RECENT_HEADER: &str = "## Recent conversation";
pub const EARLIER_HEADER: &str = "## Earlier conversation";
pub const QUESTION_LABEL: &str = "Question:";
pub const ANSWER_LABEL: &str = "Answer:";

pub const SUMMARY_TASK: &str = "=== SUMMARIZE CONVERSATION ===";
pub const TRANSCRIPT_OPEN: &str = "=== TRANSCRIPT ===";
pub const TRANSCRIPT_CLOSE: &str = "=== END TRANSCRIPT ===";
pub const EXPANSION_TASK: &str = "=== REPHRASE QUERY ===";

const NO_PASSAGES: &str = "(no relevant manual passages were found)";
const SUMMARY_PREFIX: &str = "[Summary of earlier turns]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryParams {
    /// Maximum unsummarized messages kept verbatim.
    pub short_term_window: usize,
    /// Messages recalled by similarity per turn.
    pub long_term_k: usize,
    /// Character budget for the assembled context.
    pub max_context_chars: usize,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            short_term_window: 6,
            long_term_k: 3,
            max_context_chars: 6000,
        }
    }
}

/// One long-term memory item.
#[derive(Debug, Clone, PartialEq)]
pub enum Recall {
    Message { message: Message, score: f32 },
    Summary(Summary),
}

impl Recall {
    fn render(&self) -> String {
        match self {
            Recall::Message { message, .. } => render_message(message),
            Recall::Summary(s) => format!("{} {}", SUMMARY_PREFIX, s.summary_text.trim()),
        }
    }
}

/// The output of [`assemble_context`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssembledContext {
    pub text: String,
    /// Passages that made it into `text`, in retrieval order.
    pub passages: Vec<ScoredChunk>,
    pub recent_included: usize,
    pub recall_included: usize,
    /// Whether anything was dropped or cut to respect the budget.
    pub truncated: bool,
}

impl AssembledContext {
    pub fn has_passages(&self) -> bool {
        !self.passages.is_empty()
    }
}

struct Section {
    header: &'static str,
    blocks: Vec<String>,
}

impl Section {
    fn new(header: &'static str) -> Self {
        Self {
            header,
            blocks: Vec::new(),
        }
    }
}

struct Budget {
    max: usize,
    used: usize,
    open_sections: usize,
    truncated: bool,
}

impl Budget {
    fn overhead(&self, section: &Section) -> usize {
        if section.blocks.is_empty() {
            let sep = if self.open_sections > 0 { 2 } else { 0 };
            sep + section.header.chars().count() + 1
        } else {
            2
        }
    }

    fn admit(&mut self, section: &mut Section, block: String, front: bool) -> bool {
        let cost = self.overhead(section) + block.chars().count();
        if self.used + cost > self.max {
            self.truncated = true;
            return false;
        }
        if section.blocks.is_empty() {
            self.open_sections += 1;
        }
        self.used += cost;
        if front {
            section.blocks.insert(0, block);
        } else {
            section.blocks.push(block);
        }
        true
    }

    /// Admit a prefix of `block` that fits in the remaining budget.
    fn admit_partial(&mut self, section: &mut Section, block: &str) -> bool {
        let overhead = self.overhead(section);
        let room = self.max.saturating_sub(self.used + overhead);
        if room == 0 {
            return false;
        }
        let partial: String = block.chars().take(room).collect();
        self.truncated = true;
        self.admit(section, partial, false)
    }
}

/// Assemble prompt context within `max_chars` characters.
///
/// `recent` is in chronological order; `recall` in relevance order.
/// Only the first passage may be cut mid-text, and only when nothing else
/// would fit.
pub fn assemble_context(
    max_chars: usize,
    passages: &[ScoredChunk],
    recent: &[Message],
    recall: &[Recall],
) -> AssembledContext {
    let mut budget = Budget {
        max: max_chars,
        used: 0,
        open_sections: 0,
        truncated: false,
    };
    let mut passage_section = Section::new(PASSAGES_HEADER);
    let mut recent_section = Section::new(RECENT_HEADER);
    let mut earlier_section = Section::new(EARLIER_HEADER);

    let mut included = Vec::new();
    for sc in passages {
        let block = render_passage(sc);
        let admitted = budget.admit(&mut passage_section, block.clone(), false)
            || (included.is_empty() && budget.admit_partial(&mut passage_section, &block));
        if !admitted {
            break;
        }
        included.push(sc.clone());
    }
    if included.len() < passages.len() {
        budget.truncated = true;
    }

    let mut recent_included = 0;
    if included.len() == passages.len() {
        for message in recent.iter().rev() {
            if !budget.admit(&mut recent_section, render_message(message), true) {
                break;
            }
            recent_included += 1;
        }
    }

    let mut recall_included = 0;
    if recent_included == recent.len() && included.len() == passages.len() {
        for item in recall {
            if !budget.admit(&mut earlier_section, item.render(), false) {
                break;
            }
            recall_included += 1;
        }
    }
    if recent_included < recent.len() || recall_included < recall.len() {
        budget.truncated = true;
    }

    let text = [passage_section, recent_section, earlier_section]
        .into_iter()
        .filter(|s| !s.blocks.is_empty())
        .map(|s| format!("{}\n{}", s.header, s.blocks.join("\n\n")))
        .collect::<Vec<_>>()
        .join("\n\n");

    AssembledContext {
        text,
        passages: included,
        recent_included,
        recall_included,
        truncated: budget.truncated,
    }
}

pub fn render_passage(sc: &ScoredChunk) -> String {
    format!(
        "[Source: {} - Page {}]\n{}",
        sc.chunk.source_id,
        sc.chunk.page_number,
        sc.chunk.text.trim()
    )
}

fn render_message(message: &Message) -> String {
    format!("{}: {}", message.role.label(), message.content.trim())
}

/// Final prompt sent to the language model for one turn.
pub fn render_answer_prompt(context: &AssembledContext, question: &str) -> String {
    let body = if context.has_passages() {
        context.text.clone()
    } else if context.text.is_empty() {
        NO_PASSAGES.to_string()
    } else {
        format!("{}\n\n{}", NO_PASSAGES, context.text)
    };
    format!(
        "You are a technical assistant for laboratory and industrial equipment maintenance.\n\
         Answer the question using only the manual passages in the context below. \
         Use the conversation sections only to understand what the question refers to.\n\
         Cite the manual and page for the facts you use.\n\
         If the passages do not contain the answer, reply exactly:\n\
         {not_found}\n\n\
         {open}\n{body}\n{close}\n\n\
         {q_label} {question}\n\n\
         {a_label}",
        not_found = NOT_FOUND_ANSWER,
        open = CONTEXT_OPEN,
        close = CONTEXT_CLOSE,
        q_label = QUESTION_LABEL,
        a_label = ANSWER_LABEL,
        body = body,
        question = question.trim(),
    )
}

/// Prompt asking the model to condense a run of messages.
pub fn render_summary_prompt(messages: &[Message]) -> String {
    let transcript = messages
        .iter()
        .map(render_message)
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{task}\n\
         Summarize the following maintenance conversation in a few sentences. \
         Keep equipment names, part numbers, intervals, and any open questions.\n\n\
         {open}\n{transcript}\n{close}\n\n\
         Summary:",
        task = SUMMARY_TASK,
        open = TRANSCRIPT_OPEN,
        close = TRANSCRIPT_CLOSE,
        transcript = transcript,
    )
}

/// Prompt asking the model for alternative phrasings of a search query.
pub fn render_expansion_prompt(query: &str, variants: usize) -> String {
    format!(
        "{task}\n\
         Rewrite the search query below in {variants} different ways that could match \
         wording used in equipment manuals. Reply with one rewrite per line and nothing else.\n\n\
         Query: {query}",
        task = EXPANSION_TASK,
        variants = variants,
        query = query.trim(),
    )
}

/// Clean up a raw completion into answer text.
pub fn parse_answer(raw: &str) -> Result<String, GenerationError> {
    let mut text = raw.trim();
    if text
        .get(..ANSWER_LABEL.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(ANSWER_LABEL))
    {
        text = text[ANSWER_LABEL.len()..].trim_start();
    }
    if text.is_empty() {
        return Err(GenerationError::EmptyCompletion);
    }
    Ok(text.to_string())
}

/// De-duplicated `(source, page)` citations, in first-seen order.
pub fn extract_sources(passages: &[ScoredChunk]) -> Vec<Citation> {
    let mut out: Vec<Citation> = Vec::new();
    for sc in passages {
        let citation = Citation {
            source_id: sc.chunk.source_id.clone(),
            page_number: sc.chunk.page_number,
        };
        if !out.contains(&citation) {
            out.push(citation);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, Role};
    use chrono::Utc;

    fn scored(source: &str, page: u32, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                id: format!("{}#{}", source, page),
                source_id: source.into(),
                page_number: page,
                chunk_index: page,
                text: text.into(),
                char_length: text.chars().count(),
                overlap_chars: 0,
                hash: String::new(),
            },
            score: 0.9,
            rerank_score: None,
        }
    }

    fn message(seq: i64, role: Role, content: &str) -> Message {
        Message {
            message_id: format!("m{}", seq),
            session_id: "s".into(),
            seq,
            role,
            content: content.into(),
            created_at: Utc::now(),
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_sections_in_fixed_order() {
        let ctx = assemble_context(
            10_000,
            &[scored("pump", 3, "Service every 500 hours.")],
            &[message(0, Role::User, "hello")],
            &[Recall::Message {
                message: message(1, Role::Assistant, "older"),
                score: 0.7,
            }],
        );
        let p = ctx.text.find(PASSAGES_HEADER).unwrap();
        let r = ctx.text.find(RECENT_HEADER).unwrap();
        let e = ctx.text.find(EARLIER_HEADER).unwrap();
        assert!(p < r && r < e);
        assert!(ctx.text.contains("[Source: pump - Page 3]"));
        assert!(!ctx.truncated);
    }

    #[test]
    fn test_budget_is_respected() {
        let passages: Vec<_> = (1..=5)
            .map(|i| scored("m", i, &"word ".repeat(40)))
            .collect();
        let recent: Vec<_> = (0..4)
            .map(|i| message(i, Role::User, &"chat ".repeat(20)))
            .collect();
        for max in [50, 300, 700, 1200] {
            let ctx = assemble_context(max, &passages, &recent, &[]);
            assert!(ctx.text.chars().count() <= max, "budget {} exceeded", max);
        }
    }

    #[test]
    fn test_passages_take_priority_over_memory() {
        let passages = vec![scored("m", 1, &"a".repeat(80)), scored("m", 2, &"b".repeat(80))];
        let recent = vec![message(0, Role::User, &"c".repeat(80))];
        let ctx = assemble_context(230, &passages, &recent, &[]);
        assert_eq!(ctx.passages.len(), 2);
        assert_eq!(ctx.recent_included, 0);
        assert!(ctx.truncated);
    }

    #[test]
    fn test_recent_keeps_newest_messages() {
        let recent = vec![
            message(0, Role::User, "first question"),
            message(1, Role::Assistant, "first answer"),
            message(2, Role::User, "second question"),
        ];
        let budget = RECENT_HEADER.len() + 1 + "User: second question".len() + 2 + 20;
        let ctx = assemble_context(budget, &[], &recent, &[]);
        assert_eq!(ctx.recent_included, 1);
        assert!(ctx.text.contains("second question"));
        assert!(!ctx.text.contains("first question"));
    }

    #[test]
    fn test_recent_rendered_chronologically() {
        let recent = vec![
            message(0, Role::User, "alpha"),
            message(1, Role::Assistant, "beta"),
        ];
        let ctx = assemble_context(1000, &[], &recent, &[]);
        assert!(ctx.text.find("alpha").unwrap() < ctx.text.find("beta").unwrap());
    }

    #[test]
    fn test_oversized_first_passage_is_cut() {
        let passages = vec![scored("m", 1, &"x".repeat(500))];
        let ctx = assemble_context(100, &passages, &[], &[]);
        assert_eq!(ctx.passages.len(), 1);
        assert!(ctx.truncated);
        assert!(ctx.text.chars().count() <= 100);
    }

    #[test]
    fn test_answer_prompt_without_passages() {
        let ctx = assemble_context(1000, &[], &[], &[]);
        let prompt = render_answer_prompt(&ctx, "Where is the fuse?");
        assert!(prompt.contains(NO_PASSAGES));
        assert!(prompt.contains(NOT_FOUND_ANSWER));
        assert!(prompt.trim_end().ends_with(ANSWER_LABEL));
    }

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("  Answer: Replace the seal. ").unwrap(), "Replace the seal.");
        assert_eq!(parse_answer("Replace it").unwrap(), "Replace it");
        assert!(matches!(
            parse_answer("  answer:  "),
            Err(GenerationError::EmptyCompletion)
        ));
    }

    #[test]
    fn test_extract_sources_dedupes() {
        let passages = vec![
            scored("pump", 3, "a"),
            scored("pump", 3, "b"),
            scored("pump", 4, "c"),
            scored("compressor", 3, "d"),
        ];
        let sources = extract_sources(&passages);
        let rendered: Vec<String> = sources.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["pump (page 3)", "pump (page 4)", "compressor (page 3)"]
        );
    }

    #[test]
    fn test_summary_prompt_contains_transcript() {
        let prompt = render_summary_prompt(&[
            message(0, Role::User, "Pump leaks"),
            message(1, Role::Assistant, "Replace seal"),
        ]);
        assert!(prompt.starts_with(SUMMARY_TASK));
        assert!(prompt.contains("User: Pump leaks\nAssistant: Replace seal"));
    }
}
