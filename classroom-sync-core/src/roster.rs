//! Roster loader: flat CSV inputs → immutable lookup tables.
//!
//! Four inputs, none with a header row:
//!
//! | file              | columns                                                              |
//! |-------------------|----------------------------------------------------------------------|
//! | classes           | `classCode, subjectName, teacherUserId, section`                     |
//! | users             | `userId, emailAddress`                                               |
//! | enrollments       | `classCode, userId` (many rows per class)                            |
//! | course registry   | `classCode, courseId[, courseName[, ownerId[, enrollmentCode[, section[, teacherUserId]]]]]` |
//!
//! `#` lines and blank lines are skipped, fields are trimmed, and for keyed tables the
//! first occurrence of a key wins. A row with the wrong number of columns is a
//! [`SyncError::LocalParse`] naming the file and line.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::ops::RangeInclusive;
use std::path::Path;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::RosterPaths;
use crate::error::{Result, SyncError};

/// One class definition from the class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    pub class_code: String,
    pub subject_name: String,
    pub teacher_user_id: String,
    pub section: String,
}

impl ClassRecord {
    /// Display name given to the remote course, e.g. `Algebra(A12B3456)`.
    pub fn course_name(&self) -> String {
        format!("{}({})", self.subject_name, self.class_code)
    }
}

/// Class definitions in file order, keyed by class code.
#[derive(Debug, Clone, Default)]
pub struct ClassTable {
    records: Vec<ClassRecord>,
    index: HashMap<String, usize>,
}

impl ClassTable {
    pub fn get(&self, class_code: &str) -> Option<&ClassRecord> {
        self.index.get(class_code).map(|&i| &self.records[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClassRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn insert(&mut self, record: ClassRecord) -> bool {
        match self.index.entry(record.class_code.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(self.records.len());
                self.records.push(record);
                true
            }
        }
    }
}

/// Local user id → remote-addressable email.
#[derive(Debug, Clone, Default)]
pub struct UserDirectory {
    emails: HashMap<String, String>,
}

impl UserDirectory {
    pub fn email(&self, user_id: &str) -> Option<&str> {
        self.emails.get(user_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

/// Class code → user ids to enroll, in file order. Duplicates are preserved.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentSet {
    class_order: Vec<String>,
    members: HashMap<String, Vec<String>>,
}

impl EnrollmentSet {
    /// Every user id listed for the class, duplicates included.
    pub fn members(&self, class_code: &str) -> &[String] {
        self.members
            .get(class_code)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// User ids for the class with repeats removed, keeping first occurrences.
    pub fn unique_members(&self, class_code: &str) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.members(class_code)
            .iter()
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Class codes in the order they first appear in the file.
    pub fn class_codes(&self) -> impl Iterator<Item = &str> {
        self.class_order.iter().map(String::as_str)
    }

    pub fn contains(&self, class_code: &str) -> bool {
        self.members.contains_key(class_code)
    }

    /// Total number of rows, duplicates included.
    pub fn row_count(&self) -> usize {
        self.members.values().map(Vec::len).sum()
    }

    fn push(&mut self, class_code: String, user_id: String) {
        match self.members.entry(class_code) {
            Entry::Occupied(mut slot) => slot.get_mut().push(user_id),
            Entry::Vacant(slot) => {
                self.class_order.push(slot.key().clone());
                slot.insert(vec![user_id]);
            }
        }
    }
}

/// A previously created course, as persisted in the registry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub class_code: String,
    pub course_id: String,
    pub course_name: Option<String>,
    pub owner_id: Option<String>,
    pub enrollment_code: Option<String>,
    pub section: Option<String>,
    pub teacher_user_id: Option<String>,
}

impl RegistryEntry {
    /// The columns appended to the registry file after a successful creation.
    pub fn to_record(&self) -> Vec<&str> {
        let mut record = vec![self.class_code.as_str(), self.course_id.as_str()];
        let optional = [
            &self.course_name,
            &self.owner_id,
            &self.enrollment_code,
            &self.section,
            &self.teacher_user_id,
        ];
        // Trailing empty columns are dropped; inner ones are kept as "".
        let used = optional
            .iter()
            .rposition(|v| v.is_some())
            .map_or(0, |i| i + 1);
        record.extend(
            optional[..used]
                .iter()
                .map(|v| v.as_deref().unwrap_or("")),
        );
        record
    }
}

/// Class code → created course. Rows whose class code fails the configured pattern
/// are kept in [`CourseRegistry::all_entries`] but not in the keyed lookup.
#[derive(Debug, Clone, Default)]
pub struct CourseRegistry {
    entries: Vec<RegistryEntry>,
    index: HashMap<String, usize>,
}

impl CourseRegistry {
    pub fn get(&self, class_code: &str) -> Option<&RegistryEntry> {
        self.index.get(class_code).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, class_code: &str) -> bool {
        self.index.contains_key(class_code)
    }

    /// Every row in file order, including rows not reachable by class code.
    pub fn all_entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Keyed entries in file order.
    pub fn keyed_entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        let mut positions: Vec<usize> = self.index.values().copied().collect();
        positions.sort_unstable();
        positions.into_iter().map(move |i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// A copy of this registry extended with entries created during the run.
    pub fn with_entries(&self, created: impl IntoIterator<Item = RegistryEntry>) -> Self {
        let mut extended = self.clone();
        for entry in created {
            extended.push(entry, true);
        }
        extended
    }

    fn push(&mut self, entry: RegistryEntry, keyed: bool) {
        let position = self.entries.len();
        if keyed {
            if let Entry::Vacant(slot) = self.index.entry(entry.class_code.clone()) {
                slot.insert(position);
            } else {
                debug!(class_code = %entry.class_code, "Duplicate registry row ignored for lookup");
            }
        }
        self.entries.push(entry);
    }
}

/// All lookup tables for one run.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub classes: ClassTable,
    pub users: UserDirectory,
    pub enrollments: EnrollmentSet,
    pub registry: CourseRegistry,
}

/// Reads the roster inputs from disk.
#[derive(Debug, Clone, Default)]
pub struct RosterLoader {
    paths: RosterPaths,
    class_code_pattern: Option<Regex>,
}

impl RosterLoader {
    pub fn new(paths: RosterPaths) -> Self {
        Self {
            paths,
            class_code_pattern: None,
        }
    }

    /// Registry rows whose class code does not fully match `pattern` are kept out of
    /// the keyed lookup.
    pub fn with_class_code_pattern(mut self, pattern: &str) -> Result<Self> {
        let anchored = format!("^(?:{pattern})$");
        let re = Regex::new(&anchored).map_err(|e| {
            SyncError::Config(format!("invalid class_code_pattern {pattern:?}: {e}"))
        })?;
        self.class_code_pattern = Some(re);
        Ok(self)
    }

    pub fn paths(&self) -> &RosterPaths {
        &self.paths
    }

    /// Load all four tables. A missing registry file counts as an empty registry.
    pub fn load(&self) -> Result<Roster> {
        let roster = Roster {
            classes: self.load_classes()?,
            users: self.load_users()?,
            enrollments: self.load_enrollments()?,
            registry: self.load_registry()?,
        };
        info!(
            classes = roster.classes.len(),
            users = roster.users.len(),
            enrollment_rows = roster.enrollments.row_count(),
            registered_courses = roster.registry.len(),
            "Roster loaded"
        );
        Ok(roster)
    }

    pub fn load_classes(&self) -> Result<ClassTable> {
        let path = &self.paths.classes;
        let mut table = ClassTable::default();
        for (line, mut fields) in read_rows(path, 4..=4)? {
            let section = fields.pop().unwrap_or_default();
            let teacher_user_id = fields.pop().unwrap_or_default();
            let subject_name = fields.pop().unwrap_or_default();
            let class_code = fields.pop().unwrap_or_default();
            let inserted = table.insert(ClassRecord {
                class_code: class_code.clone(),
                subject_name,
                teacher_user_id,
                section,
            });
            if !inserted {
                debug!(path = %path.display(), line, class_code = %class_code, "Duplicate class code ignored");
            }
        }
        Ok(table)
    }

    pub fn load_users(&self) -> Result<UserDirectory> {
        let path = &self.paths.users;
        let mut directory = UserDirectory::default();
        for (line, mut fields) in read_rows(path, 2..=2)? {
            let email = fields.pop().unwrap_or_default();
            let user_id = fields.pop().unwrap_or_default();
            if let Entry::Vacant(slot) = directory.emails.entry(user_id) {
                slot.insert(email);
            } else {
                debug!(path = %path.display(), line, "Duplicate user id ignored");
            }
        }
        Ok(directory)
    }

    pub fn load_enrollments(&self) -> Result<EnrollmentSet> {
        let mut set = EnrollmentSet::default();
        for (_, mut fields) in read_rows(&self.paths.enrollments, 2..=2)? {
            let user_id = fields.pop().unwrap_or_default();
            let class_code = fields.pop().unwrap_or_default();
            set.push(class_code, user_id);
        }
        Ok(set)
    }

    pub fn load_registry(&self) -> Result<CourseRegistry> {
        let path = &self.paths.registry;
        if !path.exists() {
            info!(path = %path.display(), "No course registry yet, starting empty");
            return Ok(CourseRegistry::default());
        }
        let mut registry = CourseRegistry::default();
        for (line, fields) in read_rows(path, 2..=7)? {
            let mut fields = fields.into_iter();
            let class_code = fields.next().unwrap_or_default();
            let course_id = fields.next().unwrap_or_default();
            let mut optional = fields.map(|f| if f.is_empty() { None } else { Some(f) });
            let entry = RegistryEntry {
                class_code,
                course_id,
                course_name: optional.next().flatten(),
                owner_id: optional.next().flatten(),
                enrollment_code: optional.next().flatten(),
                section: optional.next().flatten(),
                teacher_user_id: optional.next().flatten(),
            };
            let keyed = self
                .class_code_pattern
                .as_ref()
                .map_or(true, |re| re.is_match(&entry.class_code));
            if !keyed {
                warn!(
                    path = %path.display(),
                    line,
                    class_code = %entry.class_code,
                    "Registry row has an unrecognised class code; kept for listings only"
                );
            }
            registry.push(entry, keyed);
        }
        Ok(registry)
    }
}

/// Read a headerless CSV file into `(line, fields)` pairs, enforcing the column count.
fn read_rows(path: &Path, columns: RangeInclusive<usize>) -> Result<Vec<(u64, Vec<String>)>> {
    let file = File::open(path).map_err(|e| SyncError::io(path, e))?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.map_err(|e| {
            let line = e.position().map_or(0, |p| p.line());
            SyncError::LocalParse {
                path: path.to_path_buf(),
                line,
                message: e.to_string(),
            }
        })?;
        let line = record.position().map_or(0, |p| p.line());
        if record.iter().all(str::is_empty) {
            continue;
        }
        if !columns.contains(&record.len()) {
            let expected = if columns.start() == columns.end() {
                columns.start().to_string()
            } else {
                format!("{} to {}", columns.start(), columns.end())
            };
            return Err(SyncError::LocalParse {
                path: path.to_path_buf(),
                line,
                message: format!("expected {expected} columns, found {}", record.len()),
            });
        }
        if record.get(0).map_or(true, str::is_empty) {
            return Err(SyncError::LocalParse {
                path: path.to_path_buf(),
                line,
                message: "first column must not be empty".into(),
            });
        }
        rows.push((line, record.iter().map(str::to_string).collect()));
    }
    debug!(path = %path.display(), rows = rows.len(), "Read CSV rows");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        write(&path, body).unwrap();
        path
    }

    fn paths(dir: &TempDir) -> RosterPaths {
        RosterPaths {
            classes: dir.path().join("classes.csv"),
            users: dir.path().join("users.csv"),
            enrollments: dir.path().join("enrollments.csv"),
            registry: dir.path().join("coursesID.csv"),
        }
    }

    #[test]
    fn classes_skip_comments_and_blank_lines_first_wins() {
        let dir = TempDir::new().unwrap();
        fixture(
            &dir,
            "classes.csv",
            "# code,subject,teacher,section\n\
             A12B3456,Algebra,t100,1A\n\
             \n\
             B22C0001, Biology , t200 ,2B\n\
             A12B3456,Duplicate,t999,9Z\n",
        );
        let table = RosterLoader::new(paths(&dir)).load_classes().unwrap();
        assert_eq!(table.len(), 2);
        let algebra = table.get("A12B3456").unwrap();
        assert_eq!(algebra.subject_name, "Algebra");
        assert_eq!(algebra.course_name(), "Algebra(A12B3456)");
        assert_eq!(table.get("B22C0001").unwrap().teacher_user_id, "t200");
        let codes: Vec<_> = table.iter().map(|c| c.class_code.as_str()).collect();
        assert_eq!(codes, ["A12B3456", "B22C0001"]);
    }

    #[test]
    fn wrong_column_count_names_file_and_line() {
        let dir = TempDir::new().unwrap();
        fixture(&dir, "classes.csv", "A1,Algebra,t100,1A\nB2,Biology,t200\n");
        let err = RosterLoader::new(paths(&dir)).load_classes().unwrap_err();
        match err {
            SyncError::LocalParse { path, line, message } => {
                assert!(path.ends_with("classes.csv"));
                assert_eq!(line, 2);
                assert!(message.contains("expected 4 columns, found 3"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn enrollments_keep_duplicates_and_order() {
        let dir = TempDir::new().unwrap();
        fixture(
            &dir,
            "enrollments.csv",
            "X1,u1\nX2,u9\nX1,u2\nX1,u1\n",
        );
        let set = RosterLoader::new(paths(&dir)).load_enrollments().unwrap();
        assert_eq!(set.members("X1"), ["u1", "u2", "u1"]);
        assert_eq!(set.unique_members("X1"), ["u1", "u2"]);
        assert_eq!(set.class_codes().collect::<Vec<_>>(), ["X1", "X2"]);
        assert_eq!(set.row_count(), 4);
        assert!(set.members("missing").is_empty());
    }

    #[test]
    fn missing_registry_is_empty_but_missing_classes_is_an_error() {
        let dir = TempDir::new().unwrap();
        let loader = RosterLoader::new(paths(&dir));
        assert!(loader.load_registry().unwrap().is_empty());
        assert!(matches!(
            loader.load_classes().unwrap_err(),
            SyncError::Io { .. }
        ));
    }

    #[test]
    fn registry_pattern_drops_rows_from_lookup_only() {
        let dir = TempDir::new().unwrap();
        fixture(
            &dir,
            "coursesID.csv",
            "A12B3456,987,Algebra(A12B3456),t100@example.edu,abc12\n\
             legacy course,555\n\
             B22C0001,988,,,,2B,t300\n",
        );
        let registry = RosterLoader::new(paths(&dir))
            .with_class_code_pattern("[A-Z][0-9]{2}[A-Z][0-9]{4}")
            .unwrap()
            .load_registry()
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.all_entries().len(), 3);
        assert!(registry.get("legacy course").is_none());
        let b = registry.get("B22C0001").unwrap();
        assert_eq!(b.course_name, None);
        assert_eq!(b.section.as_deref(), Some("2B"));
        assert_eq!(b.teacher_user_id.as_deref(), Some("t300"));
        let keyed: Vec<_> = registry.keyed_entries().map(|e| e.course_id.as_str()).collect();
        assert_eq!(keyed, ["987", "988"]);
    }

    #[test]
    fn registry_record_trims_trailing_empty_columns() {
        let entry = RegistryEntry {
            class_code: "A12B3456".into(),
            course_id: "987".into(),
            course_name: Some("Algebra(A12B3456)".into()),
            owner_id: Some("t100@example.edu".into()),
            enrollment_code: Some("abc12".into()),
            section: None,
            teacher_user_id: None,
        };
        assert_eq!(
            entry.to_record(),
            ["A12B3456", "987", "Algebra(A12B3456)", "t100@example.edu", "abc12"]
        );
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = RosterLoader::default().with_class_code_pattern("(").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
