mod common;

use common::{started_pool, FakeOffice};
use office_pool::converter::{DocumentConverter, PageCounterFilter, PageSelectorFilter, RefreshFilter};
use office_pool::error::OfficeError;
use office_pool::holder;
use serial_test::serial;
use std::path::Path;
use std::sync::Arc;

fn source(dir: &Path, name: &str) -> std::path::PathBuf {
    let p = dir.join(name);
    std::fs::write(&p, b"fake document").unwrap();
    p
}

#[test]
fn converts_with_an_explicit_pool() {
    let office = FakeOffice::new();
    let pool = started_pool(&office, common::settings(&[2002]));
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), "letter.docx");
    let target = dir.path().join("out").join("letter.pdf");

    let report = DocumentConverter::new()
        .with_pool(Arc::clone(&pool))
        .convert(&src, &target, None)
        .unwrap();

    assert_eq!(report.input_format, "docx");
    assert_eq!(report.output_format, "pdf");
    assert_eq!(report.export_filter, "writer_pdf_Export");
    assert_eq!(report.instance, "port:2002");
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "writer_pdf_Export:3");
    assert_eq!(office.ops(), vec!["load", "store", "close"]);
    pool.stop().unwrap();
}

#[test]
fn filter_chain_runs_in_order() {
    let office = FakeOffice::new();
    let pool = started_pool(&office, common::settings(&[2002]));
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), "multi_page.doc");
    let target = dir.path().join("page1.txt");

    let before = Arc::new(PageCounterFilter::new());
    let after = Arc::new(PageCounterFilter::new());
    let converter = DocumentConverter::new()
        .with_pool(Arc::clone(&pool))
        .with_filter(before.clone())
        .with_filter(Arc::new(PageSelectorFilter::new(1)))
        .with_filter(after.clone())
        .with_filter(Arc::new(RefreshFilter));

    let report = converter.convert(&src, &target, None).unwrap();
    assert_eq!(before.page_count(), 3);
    assert_eq!(after.page_count(), 1);
    assert_eq!(report.filters, vec!["page_count", "select_page", "page_count", "refresh"]);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "Text (encoded):1");

    before.reset();
    after.reset();
    let again = dir.path().join("page1again.txt");
    converter.convert(&target, &again, None).unwrap();
    assert_eq!(before.page_count(), 3);
    assert_eq!(after.page_count(), 1);
    pool.stop().unwrap();
}

#[test]
fn document_is_closed_when_store_fails() {
    let office = FakeOffice::new();
    let pool = started_pool(&office, common::settings(&[2002]));
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), "sheet.xlsx");
    let target = dir.path().join("readonly.pdf");

    let err = DocumentConverter::new()
        .with_pool(Arc::clone(&pool))
        .convert(&src, &target, None)
        .unwrap_err();
    assert!(matches!(err, OfficeError::Bridge { ref op, .. } if op == "store"));
    assert_eq!(office.ops().last().map(String::as_str), Some("close"));
    pool.stop().unwrap();
}

#[test]
fn explicit_format_wins_over_target_extension() {
    let office = FakeOffice::new();
    let pool = started_pool(&office, common::settings(&[2002]));
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), "deck.pptx");
    let target = dir.path().join("deck.bin");

    let report = DocumentConverter::new()
        .with_pool(Arc::clone(&pool))
        .convert(&src, &target, Some("odp"))
        .unwrap();
    assert_eq!(report.export_filter, "impress8");

    let err = DocumentConverter::new()
        .with_pool(Arc::clone(&pool))
        .convert(&src, &target, Some("nope"))
        .unwrap_err();
    assert_eq!(err, OfficeError::UnknownFormat("nope".into()));
    pool.stop().unwrap();
}

#[test]
#[serial]
fn falls_back_to_the_installed_pool() {
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), "notes.odt");
    let target = dir.path().join("notes.pdf");

    holder::set(None);
    let err = DocumentConverter::new()
        .convert(&src, &target, None)
        .unwrap_err();
    assert_eq!(err, OfficeError::NoInstalledPool);

    let office = FakeOffice::new();
    let pool = started_pool(&office, common::settings(&[2002]));
    holder::set(Some(Arc::clone(&pool)));
    let report = DocumentConverter::new().convert(&src, &target, None).unwrap();
    assert_eq!(report.export_filter, "writer_pdf_Export");

    holder::set(None);
    pool.stop().unwrap();
}
