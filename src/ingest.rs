//! Carga de documentos desde el sistema de archivos.
//!
//! Cada formato es un `ContentExtractor` registrado por extensión; todos
//! producen el mismo `Document` (texto + metadatos con `source` y
//! `mime_type`). Añadir un formato es registrar un extractor nuevo.
//!
//! Los fallos por fichero se registran y se omiten: la carga del lote sigue
//! con lo que sí se pudo leer.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use calamine::{open_workbook_auto, Data, Reader};
use mime_guess::MimeGuess;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{RagError, Result};
use crate::models::Document;

pub trait ContentExtractor: Send + Sync {
    /// Extensiones en minúsculas, sin punto.
    fn extensions(&self) -> &'static [&'static str];

    /// Extrae los documentos de `path`. `source` es la ruta tal y como se
    /// guardará en los metadatos.
    fn extract(&self, path: &Path, source: &str) -> Result<Vec<Document>>;
}

// ---------------------------------------------------------------------
// EXTRACTORES
// ---------------------------------------------------------------------

/// Ficheros de texto UTF-8: un documento por fichero.
pub struct PlainTextExtractor;

impl ContentExtractor for PlainTextExtractor {
    fn extensions(&self) -> &'static [&'static str] {
        &["txt", "md", "log", "csv", "json", "html", "rs", "toml"]
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<Document>> {
        let bytes = fs::read(path).map_err(|e| RagError::load_failure(source, e))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| RagError::load_failure(source, "el fichero no es UTF-8 válido"))?;
        Ok(vec![Document::new(text, source)])
    }
}

/// PDF: un documento por página, con `page` empezando en 0.
pub struct PdfExtractor;

impl ContentExtractor for PdfExtractor {
    fn extensions(&self) -> &'static [&'static str] {
        &["pdf"]
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<Document>> {
        let pages = pdf_extract::extract_text_by_pages(path)
            .map_err(|e| RagError::load_failure(source, format!("no se pudo extraer texto del PDF: {e}")))?;

        Ok(pages
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(page, text)| Document::new(text, source).with_meta("page", page as u64))
            .collect())
    }
}

/// DOCX: texto de `word/document.xml`, un párrafo por línea.
pub struct DocxExtractor;

impl ContentExtractor for DocxExtractor {
    fn extensions(&self) -> &'static [&'static str] {
        &["docx"]
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<Document>> {
        let file = fs::File::open(path).map_err(|e| RagError::load_failure(source, e))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| RagError::load_failure(source, format!("DOCX inválido: {e}")))?;

        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|e| RagError::load_failure(source, format!("DOCX sin cuerpo: {e}")))?
            .read_to_string(&mut xml)
            .map_err(|e| RagError::load_failure(source, e))?;

        let text = docx_text(&xml).map_err(|e| RagError::load_failure(source, e))?;
        Ok(vec![Document::new(text, source)])
    }
}

fn docx_text(xml: &str) -> std::result::Result<String, quick_xml::Error> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_str(xml);
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::End(e) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let paragraph = current.trim();
                    if !paragraph.is_empty() {
                        paragraphs.push(paragraph.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" => current.push('\n'),
                _ => {}
            },
            Event::Text(e) if in_text => current.push_str(&e.unescape()?),
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(paragraphs.join("\n"))
}

/// Hojas de cálculo: un documento por fila de datos no vacía,
/// `"columna: valor | columna: valor"`, con `sheet` y `row` (0 = primera fila
/// tras la cabecera).
pub struct SpreadsheetExtractor;

impl ContentExtractor for SpreadsheetExtractor {
    fn extensions(&self) -> &'static [&'static str] {
        &["xls", "xlsx", "ods"]
    }

    fn extract(&self, path: &Path, source: &str) -> Result<Vec<Document>> {
        let mut workbook = open_workbook_auto(path)
            .map_err(|e| RagError::load_failure(source, format!("hoja de cálculo inválida: {e}")))?;

        let mut documents = Vec::new();
        for sheet in workbook.sheet_names() {
            let range = match workbook.worksheet_range(&sheet) {
                Ok(range) => range,
                Err(e) => {
                    warn!("Hoja '{sheet}' ilegible en {source}: {e}");
                    continue;
                }
            };
            let grid: Vec<Vec<String>> = range
                .rows()
                .map(|row| row.iter().map(cell_text).collect())
                .collect();
            documents.extend(sheet_documents(source, &sheet, &grid));
        }
        Ok(documents)
    }
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) | Data::DateTimeIso(s) | Data::DurationIso(s) => s.trim().to_string(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.to_string(),
    }
}

fn sheet_documents(source: &str, sheet: &str, grid: &[Vec<String>]) -> Vec<Document> {
    let Some((header, rows)) = grid.split_first() else {
        return Vec::new();
    };
    let column = |i: usize| match header.get(i) {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("Unnamed: {i}"),
    };

    rows.iter()
        .enumerate()
        .filter_map(|(row, cells)| {
            let text = cells
                .iter()
                .enumerate()
                .filter(|(_, value)| !value.is_empty())
                .map(|(i, value)| format!("{}: {value}", column(i)))
                .collect::<Vec<_>>()
                .join(" | ");
            (!text.is_empty()).then(|| {
                Document::new(text, source)
                    .with_meta("sheet", sheet)
                    .with_meta("row", row as u64)
            })
        })
        .collect()
}

// ---------------------------------------------------------------------
// LOADER
// ---------------------------------------------------------------------

/// Resultado de cargar un lote de rutas.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub documents: Vec<Document>,
    /// Ficheros que produjeron al menos un documento.
    pub files_loaded: usize,
    pub failures: Vec<RagError>,
}

#[derive(Clone)]
pub struct DocumentLoader {
    extractors: HashMap<&'static str, Arc<dyn ContentExtractor>>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new()
            .with_extractor(Arc::new(PlainTextExtractor))
            .with_extractor(Arc::new(PdfExtractor))
            .with_extractor(Arc::new(DocxExtractor))
            .with_extractor(Arc::new(SpreadsheetExtractor))
    }
}

impl DocumentLoader {
    /// Loader sin ningún formato registrado.
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        for ext in extractor.extensions() {
            self.extractors.insert(*ext, extractor.clone());
        }
        self
    }

    fn extractor_for(&self, path: &Path) -> Result<Arc<dyn ContentExtractor>> {
        let ext = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();
        self.extractors
            .get(ext.as_str())
            .cloned()
            .ok_or_else(|| RagError::UnsupportedFileType(format!(".{ext} ({})", path.display())))
    }

    /// Carga un único fichero en el pool bloqueante.
    pub async fn load_file(&self, path: &Path) -> Result<Vec<Document>> {
        let extractor = self.extractor_for(path)?;
        let source = path.to_string_lossy().to_string();
        let mime_type = MimeGuess::from_path(path)
            .first()
            .map(|m| m.to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let owned = path.to_path_buf();
        let src = source.clone();
        let documents = tokio::task::spawn_blocking(move || extractor.extract(&owned, &src))
            .await
            .map_err(|e| RagError::load_failure(source.clone(), e))??;

        Ok(documents
            .into_iter()
            .map(|doc| doc.with_meta("mime_type", mime_type.as_str()))
            .collect())
    }

    /// Carga todas las rutas; los directorios se recorren recursivamente.
    pub async fn load_paths(&self, paths: &[String]) -> LoadReport {
        let mut report = LoadReport::default();

        for file in expand_paths(paths, &mut report.failures) {
            match self.load_file(&file).await {
                Ok(docs) if docs.is_empty() => {
                    debug!("Sin contenido extraíble: {}", file.display());
                }
                Ok(docs) => {
                    debug!("{} documento(s) de {}", docs.len(), file.display());
                    report.files_loaded += 1;
                    report.documents.extend(docs);
                }
                Err(e) => {
                    warn!("Saltando {}: {e}", file.display());
                    report.failures.push(e);
                }
            }
        }

        info!(
            "Carga completada: {} ficheros con contenido, {} documentos, {} fallos",
            report.files_loaded,
            report.documents.len(),
            report.failures.len()
        );
        report
    }
}

fn expand_paths(paths: &[String], failures: &mut Vec<RagError>) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for raw in paths {
        let path = Path::new(raw);
        if path.is_dir() {
            let mut entries = Vec::new();
            for entry in WalkDir::new(path).follow_links(true) {
                match entry {
                    Ok(entry) if entry.file_type().is_file() => entries.push(entry.into_path()),
                    Ok(_) => {}
                    Err(e) => {
                        let at = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| raw.clone());
                        warn!("No se pudo recorrer {at}: {e}");
                        failures.push(RagError::load_failure(at, e));
                    }
                }
            }
            entries.sort();
            files.extend(entries);
        } else if path.is_file() {
            files.push(path.to_path_buf());
        } else {
            warn!("La ruta no existe: {raw}");
            failures.push(RagError::load_failure(raw.as_str(), "la ruta no existe"));
        }
    }
    files
}
