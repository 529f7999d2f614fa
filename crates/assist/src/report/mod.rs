//! Chat transcript reports.

mod pdf;

use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Local, Utc};

pub use pdf::PdfReportRenderer;

use crate::store::{Chat, Message};

/// Renders a chat transcript into a paginated document.
pub trait ReportRenderer: Send + Sync {
    /// Write the report for `chat` into `sink`.
    fn render(
        &self,
        sink: &mut dyn Write,
        chat: &Chat,
        assistant_name: &str,
        messages: &[Message],
    ) -> Result<()>;

    /// File extension of produced reports, without the dot.
    fn extension(&self) -> &'static str {
        "pdf"
    }
}

/// `chat_<YYYYMMDD>_<seq>.<ext>`, dated by the chat's creation day.
pub fn report_file_name(created: DateTime<Utc>, seq: u32, extension: &str) -> String {
    format!(
        "chat_{}_{seq}.{extension}",
        created.with_timezone(&Local).format("%Y%m%d")
    )
}

/// Timestamp as shown in reports (`DD/MM/YYYY HH:MM`, server local time).
pub fn display_timestamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%d/%m/%Y %H:%M").to_string()
}
