use crate::error::{OfficeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Which office component loads a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFamily {
    Text,
    Spreadsheet,
    Presentation,
    Drawing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentFormat {
    pub name: String,
    pub extension: String,
    pub media_type: String,
    /// Family this format loads as; `None` for export-only formats.
    pub family: Option<DocumentFamily>,
    /// Export filter per source family.
    pub export_filters: BTreeMap<DocumentFamily, String>,
}

impl DocumentFormat {
    fn new(name: &str, extension: &str, media_type: &str, family: Option<DocumentFamily>) -> Self {
        Self {
            name: name.to_string(),
            extension: extension.to_string(),
            media_type: media_type.to_string(),
            family,
            export_filters: BTreeMap::new(),
        }
    }

    fn export(mut self, from: DocumentFamily, filter: &str) -> Self {
        self.export_filters.insert(from, filter.to_string());
        self
    }

    pub fn export_filter(&self, from: DocumentFamily) -> Option<&str> {
        self.export_filters.get(&from).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct FormatRegistry {
    formats: Vec<DocumentFormat>,
}

impl FormatRegistry {
    pub fn new(formats: Vec<DocumentFormat>) -> Self {
        Self { formats }
    }

    pub fn by_extension(&self, ext: &str) -> Option<&DocumentFormat> {
        self.formats
            .iter()
            .find(|f| f.extension.eq_ignore_ascii_case(ext))
    }

    pub fn by_name(&self, name: &str) -> Option<&DocumentFormat> {
        self.formats
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .or_else(|| self.by_extension(name))
    }

    pub fn for_path(&self, path: &Path) -> Result<&DocumentFormat> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| OfficeError::UnknownFormat(format!("no extension: {}", path.display())))?;
        self.by_extension(ext)
            .ok_or_else(|| OfficeError::UnknownFormat(ext.to_string()))
    }

    pub fn formats(&self) -> &[DocumentFormat] {
        &self.formats
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        use DocumentFamily::*;
        let text = Some(Text);
        let sheet = Some(Spreadsheet);
        let slides = Some(Presentation);
        Self::new(vec![
            DocumentFormat::new("Portable Document Format", "pdf", "application/pdf", None)
                .export(Text, "writer_pdf_Export")
                .export(Spreadsheet, "calc_pdf_Export")
                .export(Presentation, "impress_pdf_Export")
                .export(Drawing, "draw_pdf_Export"),
            DocumentFormat::new("OpenDocument Text", "odt", "application/vnd.oasis.opendocument.text", text)
                .export(Text, "writer8"),
            DocumentFormat::new("Microsoft Word", "doc", "application/msword", text)
                .export(Text, "MS Word 97"),
            DocumentFormat::new(
                "Word 2007-365",
                "docx",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                text,
            )
            .export(Text, "MS Word 2007 XML"),
            DocumentFormat::new("Rich Text Format", "rtf", "text/rtf", text)
                .export(Text, "Rich Text Format"),
            DocumentFormat::new("Plain Text", "txt", "text/plain", text)
                .export(Text, "Text (encoded)"),
            DocumentFormat::new("HTML", "html", "text/html", text)
                .export(Text, "HTML (StarWriter)")
                .export(Spreadsheet, "HTML (StarCalc)")
                .export(Presentation, "impress_html_Export"),
            DocumentFormat::new(
                "OpenDocument Spreadsheet",
                "ods",
                "application/vnd.oasis.opendocument.spreadsheet",
                sheet,
            )
            .export(Spreadsheet, "calc8"),
            DocumentFormat::new("Microsoft Excel", "xls", "application/vnd.ms-excel", sheet)
                .export(Spreadsheet, "MS Excel 97"),
            DocumentFormat::new(
                "Excel 2007-365",
                "xlsx",
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                sheet,
            )
            .export(Spreadsheet, "Calc MS Excel 2007 XML"),
            DocumentFormat::new("Comma Separated Values", "csv", "text/csv", sheet)
                .export(Spreadsheet, "Text - txt - csv (StarCalc)"),
            DocumentFormat::new(
                "OpenDocument Presentation",
                "odp",
                "application/vnd.oasis.opendocument.presentation",
                slides,
            )
            .export(Presentation, "impress8"),
            DocumentFormat::new("Microsoft PowerPoint", "ppt", "application/vnd.ms-powerpoint", slides)
                .export(Presentation, "MS PowerPoint 97"),
            DocumentFormat::new(
                "PowerPoint 2007-365",
                "pptx",
                "application/vnd.openxmlformats-officedocument.presentationml.presentation",
                slides,
            )
            .export(Presentation, "Impress MS PowerPoint 2007 XML"),
            DocumentFormat::new(
                "OpenDocument Drawing",
                "odg",
                "application/vnd.oasis.opendocument.graphics",
                Some(Drawing),
            )
            .export(Drawing, "draw8"),
            DocumentFormat::new("PNG Image", "png", "image/png", None)
                .export(Text, "writer_png_Export")
                .export(Spreadsheet, "calc_png_Export")
                .export(Presentation, "impress_png_Export")
                .export(Drawing, "draw_png_Export"),
        ])
    }
}
