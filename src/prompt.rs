//! Instrucción de sistema fija y montaje del prompt final.
//!
//! Orden de secciones: datos en vivo (si hay) → referencias documentales (si
//! hay) → marcador explícito si no hay nada → pregunta literal + "Answer:".

use crate::models::ScoredMatch;

pub const LIVE_DATA_HEADER: &str = "=== APPLICATION DATA (REAL-TIME) ===";
pub const DOCUMENTS_HEADER: &str = "=== DOCUMENT REFERENCES ===";
pub const NO_CONTEXT: &str = "No relevant context found.";

pub const SYSTEM_PROMPT: &str = r#"You are a helpful assistant that answers questions using only the context you are given.

STRICT RULES - NEVER BREAK THESE:
1. PRIORITIZE the APPLICATION DATA section if present - it contains live data and is authoritative over document references.
2. Use the DOCUMENT REFERENCES section for general knowledge.
3. If the information is NOT in the provided context, say: "I don't have that information available."
4. NEVER invent, guess, or use external knowledge.
5. Be helpful, concise, and friendly.
6. Always respond in the same language as the question.

IMPORTANT: If unsure whether information comes from the context, say you don't know."#;

/// Construye el prompt. Un `dynamic_context` vacío o en blanco cuenta como ausente.
pub fn build_prompt(question: &str, matches: &[ScoredMatch], dynamic_context: Option<&str>) -> String {
    let mut sections = Vec::new();

    if let Some(live) = dynamic_context.filter(|c| !c.trim().is_empty()) {
        sections.push(format!("{LIVE_DATA_HEADER}\n{live}"));
    }

    if !matches.is_empty() {
        let docs: Vec<String> = matches
            .iter()
            .enumerate()
            .map(|(i, m)| {
                format!(
                    "[Document {}] (Source: {})\n{}",
                    i + 1,
                    m.chunk.source(),
                    m.chunk.content
                )
            })
            .collect();
        sections.push(format!("{DOCUMENTS_HEADER}\n{}", docs.join("\n\n")));
    }

    let context = if sections.is_empty() {
        NO_CONTEXT.to_string()
    } else {
        sections.join("\n\n")
    };

    format!("Context:\n{context}\n\nQuestion: {question}\n\nAnswer:")
}
