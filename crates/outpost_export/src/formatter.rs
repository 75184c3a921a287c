//! Snapshot rendering.
//!
//! Both renderings are byte deterministic for a given snapshot: field
//! and column order are fixed, and no timestamp other than those stored
//! in the records appears in the document body. Only the filename
//! embeds the time of export.

use crate::error::{ExportError, ExportResult};
use chrono::Utc;
use outpost_store::{QuestionAnswer, Session, Timestamp, UsageEvent, UserSnapshot};

/// Output format for an export document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// Structured JSON mirroring the snapshot.
    Json,
    /// Flat CSV, one row per session, question/answer pair, or event.
    Csv,
}

impl ExportKind {
    /// File extension for this format.
    pub fn extension(self) -> &'static str {
        match self {
            ExportKind::Json => "json",
            ExportKind::Csv => "csv",
        }
    }
}

/// A rendered export document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Suggested filename, embedding the user id and export time.
    pub filename: String,
    /// Document body.
    pub data: String,
}

/// Renders a snapshot into the requested format.
pub fn format(snapshot: &UserSnapshot, kind: ExportKind) -> ExportResult<Export> {
    let data = match kind {
        ExportKind::Json => render_json(snapshot)?,
        ExportKind::Csv => render_csv(snapshot)?,
    };
    let filename = format!(
        "outpost-export-{}-{}.{}",
        snapshot.user.id,
        Utc::now().format("%Y%m%d%H%M%S"),
        kind.extension()
    );
    Ok(Export { filename, data })
}

fn render_json(snapshot: &UserSnapshot) -> ExportResult<String> {
    Ok(serde_json::to_string_pretty(snapshot)?)
}

const CSV_HEADER: [&str; 15] = [
    "record_type",
    "record_id",
    "session_id",
    "timestamp",
    "ended_at",
    "app_version",
    "question",
    "question_kind",
    "answer",
    "answer_provider",
    "answer_model",
    "duration_ms",
    "feature",
    "action",
    "details",
];

fn render_csv(snapshot: &UserSnapshot) -> ExportResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for session in &snapshot.sessions {
        writer.write_record(session_row(session))?;
    }
    for pair in &snapshot.questions {
        writer.write_record(question_row(pair)?)?;
    }
    for event in &snapshot.events {
        writer.write_record(event_row(event)?)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    String::from_utf8(bytes).map_err(|_| ExportError::InvalidUtf8)
}

fn stamp(at: Timestamp) -> String {
    at.to_rfc3339()
}

fn session_row(session: &Session) -> Vec<String> {
    vec![
        "session".into(),
        session.id.to_string(),
        session.id.to_string(),
        stamp(session.started_at),
        session.ended_at.map(stamp).unwrap_or_default(),
        session.app_version.clone(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
    ]
}

fn question_row(pair: &QuestionAnswer) -> ExportResult<Vec<String>> {
    let question = &pair.question;
    let answer = pair.answer.as_ref();
    Ok(vec![
        "question".into(),
        question.id.to_string(),
        question.session_id.to_string(),
        stamp(question.created_at),
        String::new(),
        String::new(),
        question.text.clone(),
        question.kind.clone().unwrap_or_default(),
        answer.map(|a| a.text.clone()).unwrap_or_default(),
        answer.map(|a| a.provider.clone()).unwrap_or_default(),
        answer.map(|a| a.model.clone()).unwrap_or_default(),
        answer
            .map(|a| a.duration_ms.to_string())
            .unwrap_or_default(),
        String::new(),
        String::new(),
        json_field(question.metadata.as_ref())?,
    ])
}

fn event_row(event: &UsageEvent) -> ExportResult<Vec<String>> {
    Ok(vec![
        "usage_event".into(),
        event.id.to_string(),
        String::new(),
        stamp(event.occurred_at),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        String::new(),
        event.feature.clone(),
        event.action.clone(),
        json_field(event.details.as_ref())?,
    ])
}

fn json_field(value: Option<&serde_json::Value>) -> ExportResult<String> {
    match value {
        Some(value) => Ok(serde_json::to_string(value)?),
        None => Ok(String::new()),
    }
}
