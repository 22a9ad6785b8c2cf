//! Lightweight lexical helpers shared by the hashing embedder, the lexical
//! reranker, and the extractive answer model.

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "been", "by", "can", "could", "did", "do", "does",
    "every", "for", "from", "he", "her", "his", "how", "i", "if", "in", "is", "it", "its", "me",
    "must", "my", "no", "not", "of", "on", "or", "our", "she", "should", "so", "than", "that",
    "the", "their", "then", "these", "they", "this", "those", "to", "us", "was", "we", "were",
    "what", "when", "where", "which", "who", "why", "will", "with", "would", "you", "your",
];

/// Lowercase alphanumeric terms with stopwords removed and plural `s` stripped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .map(stem)
        .collect()
}

fn stem(term: String) -> String {
    if term.chars().count() > 3 && term.ends_with('s') && !term.ends_with("ss") {
        let mut t = term;
        t.pop();
        t
    } else {
        term
    }
}

/// 64-bit FNV-1a. Stable across platforms and releases.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Split prose into sentences, keeping the terminal punctuation.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let terminal = matches!(c, '.' | '!' | '?')
            && chars.peek().map(|(_, n)| n.is_whitespace()).unwrap_or(true);
        if terminal || c == '\n' {
            let end = i + c.len_utf8();
            let s = text[start..end].trim();
            if !s.is_empty() {
                out.push(s);
            }
            start = end;
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}
