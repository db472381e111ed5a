use office_pool::error::OfficeError;
use office_pool::format::{DocumentFamily, FormatRegistry};
use std::path::Path;

#[test]
fn lookup_is_case_insensitive() {
    let registry = FormatRegistry::default();
    let docx = registry.by_extension("DOCX").unwrap();
    assert_eq!(docx.family, Some(DocumentFamily::Text));
    assert_eq!(registry.by_name("portable document format").unwrap().extension, "pdf");
    assert_eq!(registry.by_name("xlsx").unwrap().family, Some(DocumentFamily::Spreadsheet));
}

#[test]
fn pdf_export_filter_depends_on_the_input_family() {
    let registry = FormatRegistry::default();
    let pdf = registry.by_extension("pdf").unwrap();
    assert_eq!(pdf.family, None);
    assert_eq!(pdf.export_filter(DocumentFamily::Text), Some("writer_pdf_Export"));
    assert_eq!(pdf.export_filter(DocumentFamily::Spreadsheet), Some("calc_pdf_Export"));
    assert_eq!(pdf.export_filter(DocumentFamily::Presentation), Some("impress_pdf_Export"));
    assert_eq!(pdf.export_filter(DocumentFamily::Drawing), Some("draw_pdf_Export"));

    let ods = registry.by_extension("ods").unwrap();
    assert_eq!(ods.export_filter(DocumentFamily::Text), None);
}

#[test]
fn paths_without_a_known_extension_are_rejected() {
    let registry = FormatRegistry::default();
    assert!(matches!(
        registry.for_path(Path::new("README")),
        Err(OfficeError::UnknownFormat(_))
    ));
    assert_eq!(
        registry.for_path(Path::new("a.xyz")).err(),
        Some(OfficeError::UnknownFormat("xyz".into()))
    );
    assert_eq!(registry.for_path(Path::new("dir/a.PpTx")).unwrap().extension, "pptx");
}
