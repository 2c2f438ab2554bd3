//! Streaming export to HAR or the native session format. Both formats are
//! written incrementally so a multi-gigabyte session doesn't need to live
//! in memory at once; progress is reported every 1000 entries.

use std::io::Write;

use super::{DbError, FlowDb};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Har,
    Native,
}

const PROGRESS_INTERVAL: u64 = 1000;

/// Stream every flow in `session_id` to `writer` in `format`, calling
/// `progress(count)` every 1000 flows and once more at completion. Returns
/// the total number of flows written.
pub fn export_to_file_iter(
    db: &FlowDb,
    session_id: &str,
    format: ExportFormat,
    writer: &mut impl Write,
    mut progress: impl FnMut(u64),
) -> Result<u64, DbError> {
    let indices = db.get_indices(session_id, -1.0, None)?;
    let mut count: u64 = 0;

    match format {
        ExportFormat::Har => {
            write!(
                writer,
                r#"{{"log":{{"version":"1.2","creator":{{"name":"relaycraft","version":"1"}},"entries":["#
            )?;
            for (i, index) in indices.iter().enumerate() {
                if i > 0 {
                    write!(writer, ",")?;
                }
                if let Some(detail) = db.get_detail(&index.id)? {
                    let entry = har_entry(&detail);
                    serde_json::to_writer(&mut *writer, &entry)?;
                }
                count += 1;
                if count % PROGRESS_INTERVAL == 0 {
                    progress(count);
                }
            }
            write!(writer, "]}}}}")?;
        }
        ExportFormat::Native => {
            write!(writer, r#"{{"sessionId":"{session_id}","flows":["#)?;
            for (i, index) in indices.iter().enumerate() {
                if i > 0 {
                    write!(writer, ",")?;
                }
                if let Some(detail) = db.get_detail(&index.id)? {
                    serde_json::to_writer(&mut *writer, &detail)?;
                }
                count += 1;
                if count % PROGRESS_INTERVAL == 0 {
                    progress(count);
                }
            }
            write!(writer, "]}}")?;
        }
    }

    progress(count);
    Ok(count)
}

fn har_entry(detail: &serde_json::Value) -> serde_json::Value {
    let started = detail.get("startedAt").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let url = format!(
        "http://{}{}",
        detail.get("host").and_then(|v| v.as_str()).unwrap_or(""),
        detail.get("path").and_then(|v| v.as_str()).unwrap_or("")
    );
    serde_json::json!({
        "startedDateTime": chrono::DateTime::from_timestamp(started as i64, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default(),
        "time": detail.get("durationMs").cloned().unwrap_or(serde_json::json!(0)),
        "request": {
            "method": detail.get("method").cloned().unwrap_or(serde_json::json!("GET")),
            "url": url,
            "headers": detail.get("requestHeaders").cloned().unwrap_or(serde_json::json!([])),
            "postData": { "text": detail.get("requestBody").cloned().unwrap_or(serde_json::json!("")) },
        },
        "response": {
            "status": detail.get("status").cloned().unwrap_or(serde_json::json!(0)),
            "headers": detail.get("responseHeaders").cloned().unwrap_or(serde_json::json!([])),
            "content": { "text": detail.get("responseBody").cloned().unwrap_or(serde_json::json!("")) },
        },
    })
}
