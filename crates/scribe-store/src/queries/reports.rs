use uuid::Uuid;

use crate::models::CoherenceReport;
use crate::store::Store;

/// Append a report to its document's history. Earlier reports are kept.
pub async fn insert_report(store: &Store, report: CoherenceReport) {
    store
        .state()
        .write()
        .await
        .reports
        .entry(report.document_id)
        .or_default()
        .push(report);
}

pub async fn latest_report(store: &Store, document_id: Uuid) -> Option<CoherenceReport> {
    store
        .state()
        .read()
        .await
        .reports
        .get(&document_id)
        .and_then(|reports| reports.last().cloned())
}

/// All reports for a document, oldest first.
pub async fn list_reports(store: &Store, document_id: Uuid) -> Vec<CoherenceReport> {
    store
        .state()
        .read()
        .await
        .reports
        .get(&document_id)
        .cloned()
        .unwrap_or_default()
}
