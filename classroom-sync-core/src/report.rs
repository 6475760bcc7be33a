//! CSV report writer and course-registry appender.
//!
//! Reports are truncated and rewritten on every run with a fixed header, even when
//! there are no rows. The registry is append-only and flushed row by row.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::roster::RegistryEntry;

/// A row type with a fixed CSV header. Field order must match `HEADER`.
pub trait ReportRow: Serialize {
    const HEADER: &'static [&'static str];
}

/// `lists` output: one row per course visible to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourseListingRow {
    pub course_name: String,
    pub course_section: Option<String>,
    pub course_id: String,
    pub enrollment_code: Option<String>,
    pub owner_id: Option<String>,
    /// Teacher full names joined with `/`.
    pub teacher_name: String,
    pub status: Option<String>,
}

impl ReportRow for CourseListingRow {
    const HEADER: &'static [&'static str] = &[
        "courseName",
        "courseSection",
        "courseId",
        "enrollmentCode",
        "ownerId",
        "teacherName",
        "status",
    ];
}

/// `crawl` output: roster summary per registered course.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlRow {
    pub class_code: String,
    pub course_id: String,
    pub course_name: Option<String>,
    pub course_state: Option<String>,
    pub owner_email: Option<String>,
    pub teacher_count: usize,
    pub student_count: usize,
}

impl ReportRow for CrawlRow {
    const HEADER: &'static [&'static str] = &[
        "classCode",
        "courseId",
        "courseName",
        "courseState",
        "ownerEmail",
        "teacherCount",
        "studentCount",
    ];
}

/// `get-stream` output: announcements matching a keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnouncementMatchRow {
    pub course_id: String,
    pub announcement_id: Option<String>,
    pub creation_time: Option<String>,
    pub keyword: String,
    pub text: String,
    pub link: Option<String>,
}

impl ReportRow for AnnouncementMatchRow {
    const HEADER: &'static [&'static str] = &[
        "courseId",
        "announcementId",
        "creationTime",
        "keyword",
        "text",
        "link",
    ];
}

/// Per-member outcome of an enroll or unenroll batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberOutcomeRow {
    pub class_code: String,
    pub course_id: String,
    pub user_id: String,
    pub email: Option<String>,
    pub role: String,
    pub outcome: String,
    pub detail: String,
}

impl ReportRow for MemberOutcomeRow {
    const HEADER: &'static [&'static str] = &[
        "classCode",
        "courseId",
        "userId",
        "email",
        "role",
        "outcome",
        "detail",
    ];
}

/// Write `rows` to `path` under `R::HEADER`, replacing any existing file.
/// Returns the number of data rows written.
pub fn write_report<R: ReportRow>(path: &Path, rows: &[R]) -> Result<usize> {
    let file = File::create(path).map_err(|e| SyncError::io(path, e))?;
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    wtr.write_record(R::HEADER)?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush().map_err(|e| SyncError::io(path, e))?;

    if rows.is_empty() {
        info!(path = %path.display(), "No data; wrote header-only report");
    } else {
        info!(path = %path.display(), rows = rows.len(), "Report written");
    }
    Ok(rows.len())
}

/// Appends newly created courses to the registry file.
pub struct RegistryAppender {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl RegistryAppender {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| SyncError::io(&path, e))?;
        terminate_last_row(&mut file).map_err(|e| SyncError::io(&path, e))?;
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        Ok(Self { path, writer })
    }

    pub fn append(&mut self, entry: &RegistryEntry) -> Result<()> {
        self.writer.write_record(entry.to_record())?;
        self.writer
            .flush()
            .map_err(|e| SyncError::io(&self.path, e))?;
        debug!(
            path = %self.path.display(),
            class_code = %entry.class_code,
            course_id = %entry.course_id,
            "Registry row appended"
        );
        Ok(())
    }
}

/// A hand-edited registry may lack a final newline; new rows must not join the last one.
fn terminate_last_row(file: &mut File) -> std::io::Result<()> {
    if file.metadata()?.len() == 0 {
        return Ok(());
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}
