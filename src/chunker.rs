//! División de documentos en chunks solapados.
//!
//! Cada chunk es un tramo contiguo del texto original de como mucho
//! `chunk_size` caracteres. Dos chunks consecutivos comparten exactamente
//! `chunk_overlap` caracteres, así que el texto original se reconstruye
//! concatenando el primero y, de cada siguiente, lo que va tras el solape.
//!
//! El corte se busca, por orden de preferencia, en un salto de párrafo, un fin
//! de frase o un espacio; sólo si no hay ninguno se corta a `chunk_size`.

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::validate_chunking;
use crate::error::Result;
use crate::models::{Chunk, Document, Metadata};

/// Niveles de corte, de más a menos preferido.
#[derive(Debug, Clone, Copy)]
enum Breakpoint {
    Paragraph,
    Sentence,
    Word,
}

const BREAKPOINTS: [Breakpoint; 3] = [Breakpoint::Paragraph, Breakpoint::Sentence, Breakpoint::Word];

impl Breakpoint {
    /// ¿Terminar un chunk justo antes de `chars[end]` deja el corte en este nivel?
    fn ends_at(self, chars: &[char], end: usize) -> bool {
        if end == 0 {
            return false;
        }
        let last = chars[end - 1];
        match self {
            Breakpoint::Paragraph => end >= 2 && last == '\n' && chars[end - 2] == '\n',
            Breakpoint::Sentence => {
                last == '\n'
                    || (last.is_whitespace()
                        && end >= 2
                        && matches!(chars[end - 2], '.' | '!' | '?' | '。' | ';'))
            }
            Breakpoint::Word => last.is_whitespace(),
        }
    }
}

/// Divide los documentos en chunks, conservando el orden de entrada.
///
/// Los chunks de un mismo documento son contiguos y llevan `chunk_index`
/// empezando en 0. Una entrada vacía produce una salida vacía.
pub fn chunk_documents(
    documents: &[Document],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>> {
    validate_chunking(chunk_size, chunk_overlap)?;

    let mut chunks = Vec::new();
    for doc in documents {
        if doc.content.trim().is_empty() {
            debug!("Documento sin texto útil, se omite: {}", doc.source());
            continue;
        }

        for (chunk_index, (start_index, content)) in
            split_text(&doc.content, chunk_size, chunk_overlap)
                .into_iter()
                .enumerate()
        {
            let mut metadata = doc.metadata.clone();
            metadata.insert("chunk_index".to_string(), Value::from(chunk_index as u64));
            metadata.insert("start_index".to_string(), Value::from(start_index as u64));
            chunks.push(Chunk {
                id: chunk_id(&metadata, &content),
                content,
                metadata,
            });
        }
    }

    Ok(chunks)
}

/// Id estable: mismo origen, posición y texto dan el mismo id, así que
/// reindexar un fichero sin cambios no duplica chunks.
fn chunk_id(metadata: &Metadata, content: &str) -> String {
    let mut key = serde_json::to_vec(metadata).unwrap_or_default();
    key.push(0);
    key.extend_from_slice(content.as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &key).to_string()
}

/// Devuelve `(offset_en_caracteres, texto)` de cada tramo.
///
/// Requiere `chunk_overlap < chunk_size` (validado por el llamante).
pub fn split_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<(usize, String)> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut pieces = Vec::new();
    if total == 0 {
        return pieces;
    }

    let mut start = 0;
    loop {
        if total - start <= chunk_size {
            pieces.push((start, chars[start..].iter().collect()));
            break;
        }

        let hard_end = start + chunk_size;
        // Cortes demasiado tempranos generarían chunks diminutos; además el
        // corte debe superar el solape para que `start` avance.
        let min_end = start + (chunk_overlap + 1).max(chunk_size / 2);
        let end = find_break(&chars, min_end, hard_end).unwrap_or(hard_end);

        pieces.push((start, chars[start..end].iter().collect()));
        start = end - chunk_overlap;
    }

    pieces
}

fn find_break(chars: &[char], min_end: usize, hard_end: usize) -> Option<usize> {
    BREAKPOINTS.iter().find_map(|level| {
        (min_end..=hard_end)
            .rev()
            .find(|&end| level.ends_at(chars, end))
    })
}
