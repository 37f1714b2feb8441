use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::OperationError;
use crate::ids::{OperationId, SessionId};
use crate::ops::OperationType;

/// Receives the queue's progress and completion events. The transport to
/// the UI (RPC hub, IPC emitter, test collector) is injected through this.
pub trait EventSink: Send + Sync {
    fn emit(&self, channel: &str, payload: serde_json::Value);
}

/// Sink that drops everything, for callers without a UI.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _channel: &str, _payload: serde_json::Value) {}
}

pub fn emit<T: Serialize>(sink: &dyn EventSink, channel: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(value) => sink.emit(channel, value),
        Err(err) => log::error!("failed to serialize event for '{channel}': {err}"),
    }
}

pub fn operation_added_channel(session: &SessionId) -> String {
    format!("OperationQueue::{}::onOperationAdded", session.value())
}

pub fn download_progress_channel(session: &SessionId) -> String {
    format!("OperationQueue::{}::onDownloadProgress", session.value())
}

pub fn upload_progress_channel(session: &SessionId) -> String {
    format!("OperationQueue::{}::onUploadProgress", session.value())
}

pub fn scan_progress_channel(session: &SessionId) -> String {
    format!("OperationQueue::{}::onScanProgress", session.value())
}

pub fn bulk_download_progress_channel(session: &SessionId) -> String {
    format!("OperationQueue::{}::onBulkDownloadProgress", session.value())
}

pub fn operation_completed_channel(session: &SessionId) -> String {
    format!("OperationQueue::{}::onOperationCompleted", session.value())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationAdded {
    pub operation_id: OperationId,
    pub kind: OperationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

/// Byte progress of a single transfer; `current` grows monotonically from
/// `min` towards `max`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub operation_id: OperationId,
    pub min: u64,
    pub max: u64,
    pub current: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgress {
    pub operation_id: OperationId,
    pub total_bytes: u64,
    pub current_index: u64,
    pub total_entries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkDownloadProgress {
    pub operation_id: OperationId,
    pub current_file: String,
    pub current_file_bytes: u64,
    pub current_file_total_bytes: u64,
    pub bytes_current: u64,
    pub bytes_total: u64,
    pub file_current_index: u64,
    pub file_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionReason {
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCompleted {
    pub reason: CompletionReason,
    pub operation_id: OperationId,
    pub completion_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_embed_the_session_id() {
        let session = SessionId::from_value("s1");
        assert_eq!(
            operation_added_channel(&session),
            "OperationQueue::s1::onOperationAdded"
        );
        assert_eq!(
            operation_completed_channel(&session),
            "OperationQueue::s1::onOperationCompleted"
        );
    }

    #[test]
    fn progress_payload_serializes_camel_case() {
        let payload = TransferProgress {
            operation_id: OperationId::from_value("op"),
            min: 0,
            max: 10,
            current: 5,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["operationId"], "op");
        assert_eq!(value["current"], 5);
    }
}
