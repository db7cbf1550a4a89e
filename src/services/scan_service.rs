//! Scan Tracker: fire-and-forget access events for share links and QR codes.

use crate::models::scan_event::{ScanEvent, ScanSignal};
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Longest user agent / referrer / source value kept.
const MAX_SIGNAL_LEN: usize = 512;

#[derive(Clone)]
pub struct ScanTracker {
    db: Arc<SqlitePool>,
}

fn clip(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().chars().take(MAX_SIGNAL_LEN).collect::<String>())
        .filter(|v| !v.is_empty())
}

impl ScanTracker {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Append a scan event. Failures are logged and swallowed.
    pub async fn record_scan(&self, bucket_id: Uuid, signal: ScanSignal) {
        let event = ScanEvent {
            id: Uuid::new_v4(),
            bucket_id,
            user_agent: clip(signal.user_agent),
            referrer: clip(signal.referrer),
            source: clip(signal.source),
            scanned_at: Utc::now(),
        };

        let result = sqlx::query(
            "INSERT INTO scan_events (id, bucket_id, user_agent, referrer, source, scanned_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id)
        .bind(event.bucket_id)
        .bind(&event.user_agent)
        .bind(&event.referrer)
        .bind(&event.source)
        .bind(event.scanned_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => debug!(bucket_id = %bucket_id, source = ?event.source, "scan recorded"),
            Err(err) => warn!(bucket_id = %bucket_id, error = %err, "failed to record scan"),
        }
    }

    /// Detach [`record_scan`](Self::record_scan) so the caller never waits.
    pub fn spawn_record(&self, bucket_id: Uuid, signal: ScanSignal) {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.record_scan(bucket_id, signal).await });
    }
}
