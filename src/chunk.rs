//! Hierarchical text chunker.
//!
//! Splits a document into three levels: one document-level chunk, one
//! chunk per paragraph (blank-line boundaries), and one chunk per sentence
//! (terminator-plus-whitespace boundaries). Every chunk carries byte
//! offsets into the document text, so `0 ≤ start < end ≤ len(text)` holds
//! at every level and a chunk's text is always `&text[start..end]`.
//!
//! Chunk ids are deterministic: the document chunk reuses the document id,
//! and child chunks are `"{doc_id}:p:{start}"` / `"{doc_id}:s:{start}"`.
//! Determinism matters: re-indexing the same text must produce the same
//! ids so an update replaces rather than duplicates.

use crate::models::{Chunk, ChunkLevel, Document};

/// Chunk a document into document, paragraph, and sentence levels.
///
/// Empty or whitespace-only text yields only the document-level chunk.
pub fn chunk_document(doc: &Document) -> Vec<Chunk> {
    let text = doc.text.as_str();
    let mut chunks = Vec::new();

    chunks.push(Chunk {
        id: doc.id.clone(),
        doc_id: doc.id.clone(),
        parent_id: None,
        level: ChunkLevel::Document,
        text: text.to_string(),
        start_offset: 0,
        end_offset: text.len(),
        embedding: None,
    });

    for (p_start, p_end) in paragraph_spans(text) {
        let p_text = &text[p_start..p_end];
        let p_id = format!("{}:p:{}", doc.id, p_start);
        chunks.push(Chunk {
            id: p_id.clone(),
            doc_id: doc.id.clone(),
            parent_id: Some(doc.id.clone()),
            level: ChunkLevel::Paragraph,
            text: p_text.to_string(),
            start_offset: p_start,
            end_offset: p_end,
            embedding: None,
        });

        for (s_start, s_end) in sentence_spans(p_text) {
            let abs_start = p_start + s_start;
            let abs_end = p_start + s_end;
            chunks.push(Chunk {
                id: format!("{}:s:{}", doc.id, abs_start),
                doc_id: doc.id.clone(),
                parent_id: Some(p_id.clone()),
                level: ChunkLevel::Sentence,
                text: text[abs_start..abs_end].to_string(),
                start_offset: abs_start,
                end_offset: abs_end,
                embedding: None,
            });
        }
    }

    chunks
}

/// Byte spans of non-empty paragraphs, split on blank lines.
fn paragraph_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    for raw in text.split("\n\n") {
        let span = trimmed_span(raw, cursor);
        cursor += raw.len() + 2;
        if let Some(span) = span {
            spans.push(span);
        }
    }

    spans
}

/// Byte spans of sentences within one paragraph (paragraph-relative).
///
/// A sentence ends at a run of `.`, `!`, or `?` followed by whitespace or
/// the end of the paragraph. Paragraphs without terminators yield one span.
fn sentence_spans(paragraph: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut iter = paragraph.char_indices().peekable();

    while let Some((i, c)) = iter.next() {
        if matches!(c, '.' | '!' | '?') {
            let after = i + c.len_utf8();
            let at_boundary = match iter.peek() {
                None => true,
                Some((_, next)) => next.is_whitespace(),
            };
            if at_boundary {
                if let Some(span) = trimmed_span(&paragraph[start..after], start) {
                    spans.push(span);
                }
                start = after;
            }
        }
    }

    if start < paragraph.len() {
        if let Some(span) = trimmed_span(&paragraph[start..], start) {
            spans.push(span);
        }
    }

    spans
}

/// Absolute span of `slice` with surrounding whitespace stripped, or
/// `None` when nothing remains.
fn trimmed_span(slice: &str, base: usize) -> Option<(usize, usize)> {
    let trimmed = slice.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lead = slice.len() - slice.trim_start().len();
    let start = base + lead;
    Some((start, start + trimmed.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(text: &str) -> Document {
        Document {
            id: "doc1".to_string(),
            text: text.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    fn levels(chunks: &[Chunk], level: ChunkLevel) -> Vec<&Chunk> {
        chunks.iter().filter(|c| c.level == level).collect()
    }

    #[test]
    fn test_empty_text_document_chunk_only() {
        let chunks = chunk_document(&doc(""));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].level, ChunkLevel::Document);
        assert_eq!(chunks[0].id, "doc1");
    }

    #[test]
    fn test_offsets_address_document_text() {
        let text = "First sentence. Second one!\n\nAnother paragraph here.";
        let chunks = chunk_document(&doc(text));
        for c in &chunks {
            assert!(c.start_offset < c.end_offset || text.is_empty());
            assert!(c.end_offset <= text.len());
            assert_eq!(&text[c.start_offset..c.end_offset], c.text, "chunk {}", c.id);
        }
    }

    #[test]
    fn test_paragraph_and_sentence_counts() {
        let text = "One. Two.\n\nThree?";
        let chunks = chunk_document(&doc(text));
        assert_eq!(levels(&chunks, ChunkLevel::Paragraph).len(), 2);
        assert_eq!(levels(&chunks, ChunkLevel::Sentence).len(), 3);
    }

    #[test]
    fn test_child_id_format() {
        let text = "Alpha beta.\n\nGamma delta.";
        let chunks = chunk_document(&doc(text));
        let paras = levels(&chunks, ChunkLevel::Paragraph);
        assert_eq!(paras[0].id, "doc1:p:0");
        assert_eq!(paras[1].id, "doc1:p:13");
        let sents = levels(&chunks, ChunkLevel::Sentence);
        assert_eq!(sents[0].id, "doc1:s:0");
        assert_eq!(sents[1].id, "doc1:s:13");
    }

    #[test]
    fn test_sentence_parent_is_paragraph() {
        let text = "Alpha. Beta.\n\nGamma.";
        let chunks = chunk_document(&doc(text));
        let paras = levels(&chunks, ChunkLevel::Paragraph);
        for s in levels(&chunks, ChunkLevel::Sentence) {
            let parent = s.parent_id.as_deref().unwrap();
            assert!(paras.iter().any(|p| p.id == parent));
        }
    }

    #[test]
    fn test_paragraph_without_terminator_is_one_sentence() {
        let chunks = chunk_document(&doc("no terminator here"));
        let sents = levels(&chunks, ChunkLevel::Sentence);
        assert_eq!(sents.len(), 1);
        assert_eq!(sents[0].text, "no terminator here");
    }

    #[test]
    fn test_abbreviation_mid_word_does_not_split() {
        // A dot not followed by whitespace does not end a sentence.
        let chunks = chunk_document(&doc("v1.2 shipped today. Done."));
        let sents = levels(&chunks, ChunkLevel::Sentence);
        assert_eq!(sents.len(), 2);
        assert_eq!(sents[0].text, "v1.2 shipped today.");
    }

    #[test]
    fn test_multibyte_text_offsets() {
        let text = "Grüße aus Köln. Noch ein Satz!";
        let chunks = chunk_document(&doc(text));
        for c in &chunks {
            assert_eq!(&text[c.start_offset..c.end_offset], c.text);
        }
        assert_eq!(levels(&chunks, ChunkLevel::Sentence).len(), 2);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha.\n\nBeta gamma. Delta!";
        let a = chunk_document(&doc(text));
        let b = chunk_document(&doc(text));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.start_offset, y.start_offset);
        }
    }
}
