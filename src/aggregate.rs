//! Combine page results into a single document result.

use crate::{
    document::{DocumentResult, DocumentStatus, PageResult},
    prelude::*,
};

/// Merge `pages` into a [`DocumentResult`].
///
/// Pages may arrive in any order. Failed pages contribute an empty segment
/// to the concatenated text, so the number of markers in the text always
/// tells you the number of pages.
#[instrument(level = "debug", skip(pages, page_boundary_marker, warnings))]
pub fn aggregate(
    job_id: &str,
    mut pages: Vec<PageResult>,
    page_boundary_marker: &str,
    warnings: Vec<String>,
) -> DocumentResult {
    pages.sort_by_key(|p| p.page_index);
    debug_assert!(
        pages.iter().enumerate().all(|(i, p)| p.page_index == i),
        "page indices must be contiguous"
    );

    let failed = pages.iter().filter(|p| p.is_failed()).count();
    let status = overall_status(pages.len(), failed);
    let text = pages
        .iter()
        .map(|p| if p.is_failed() { "" } else { p.text.as_str() })
        .collect::<Vec<_>>()
        .join(page_boundary_marker);

    DocumentResult {
        job_id: job_id.to_owned(),
        page_count: pages.len(),
        status,
        kind: None,
        source_mime_type: None,
        pages,
        text,
        warnings,
        insights: None,
    }
}

fn overall_status(total: usize, failed: usize) -> DocumentStatus {
    if failed == 0 {
        DocumentStatus::Success
    } else if failed == total {
        DocumentStatus::Failed
    } else {
        DocumentStatus::Partial
    }
}
