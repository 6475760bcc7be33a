//! Reconciliation engine.
//!
//! Drives the remote classroom towards the local roster. Every remote call goes through
//! [`Reconciler::call`] (timeout and retry), mutations additionally through
//! [`Reconciler::mutate`] (dry-run guard and classification). Per-item failures are
//! folded into [`WorkResult`]s; only course creation stops early on a fatal result.

use std::future::Future;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::classify::{classify, Classification, OperationKind};
use crate::config::SyncOptions;
use crate::contract::ClassroomApi;
use crate::error::{ApiError, Result, SyncError};
use crate::fanout::{BatchSummary, FanOut, Keyed, Progress, WorkResult};
use crate::models::{Course, CourseRole, Invitation, Page, UserProfile};
use crate::report::{AnnouncementMatchRow, CourseListingRow, CrawlRow, MemberOutcomeRow, RegistryAppender};
use crate::roster::{ClassRecord, CourseRegistry, RegistryEntry, Roster};
use crate::session::SessionCache;

/// Course id substituted for courses that a dry-run pretended to create.
pub fn placeholder_course_id(class_code: &str) -> String {
    format!("dry-run-{class_code}")
}

/// Progress of one class through grant, member processing and revoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollPhase {
    Idle,
    AdminGranted,
    MembersProcessed,
    AdminRevoked,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAction {
    Enroll,
    Unenroll,
}

impl MemberAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberAction::Enroll => "enroll",
            MemberAction::Unenroll => "unenroll",
        }
    }
}

/// Outcome of a `create` batch.
#[derive(Debug)]
pub struct CreateReport {
    /// One entry per class that was not registered yet, keyed by class code.
    pub outcomes: Vec<Keyed<RegistryEntry>>,
    /// The loaded registry extended with this run's courses. In dry-run the new
    /// entries carry placeholder course ids.
    pub registry: CourseRegistry,
}

impl CreateReport {
    pub fn summary(&self) -> BatchSummary {
        BatchSummary::of(self.outcomes.iter().map(|o| &o.result))
    }

    pub fn first_failure(&self) -> Option<(&str, &SyncError)> {
        self.outcomes.iter().find_map(|o| match &o.result {
            WorkResult::Failed(err) => Some((o.key.as_str(), err)),
            _ => None,
        })
    }

    /// A fatal result stopped the batch; later classes were cancelled.
    pub fn is_aborted(&self) -> bool {
        self.first_failure().is_some()
    }
}

/// Outcome of enrolling or unenrolling one class.
#[derive(Debug)]
pub struct ClassSync {
    pub class_code: String,
    pub course_id: Option<String>,
    pub action: MemberAction,
    pub phase: EnrollPhase,
    /// Per-member results keyed by local user id, in enrollment-file order.
    pub members: Vec<Keyed<()>>,
    /// Class-level outcome. `Skipped` for classes without a registered course,
    /// `Failed` when the admin grant or revoke failed.
    pub status: WorkResult<()>,
}

impl ClassSync {
    fn new(class_code: &str, action: MemberAction) -> Self {
        Self {
            class_code: class_code.to_string(),
            course_id: None,
            action,
            phase: EnrollPhase::Idle,
            members: Vec::new(),
            status: WorkResult::Applied(()),
        }
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary::of(self.members.iter().map(|m| &m.result))
    }

    /// Report rows for the member results of this class.
    pub fn to_rows(&self, roster: &Roster, role: CourseRole) -> Vec<MemberOutcomeRow> {
        let course_id = self.course_id.clone().unwrap_or_default();
        self.members
            .iter()
            .map(|member| MemberOutcomeRow {
                class_code: self.class_code.clone(),
                course_id: course_id.clone(),
                user_id: member.key.clone(),
                email: roster.users.email(&member.key).map(str::to_string),
                role: role.as_str().to_string(),
                outcome: member.result.label().to_string(),
                detail: member.result.detail(),
            })
            .collect()
    }
}

/// Applies roster tables to a [`ClassroomApi`].
pub struct Reconciler<'a, A: ?Sized> {
    api: &'a A,
    roster: &'a Roster,
    options: SyncOptions,
    fan_out: FanOut,
    registry_file: Option<PathBuf>,
    profiles: SessionCache<String, UserProfile>,
}

impl<'a, A> Reconciler<'a, A>
where
    A: ClassroomApi + ?Sized,
{
    pub fn new(api: &'a A, roster: &'a Roster, options: SyncOptions) -> Self {
        let fan_out = FanOut::new(options.concurrency);
        Self {
            api,
            roster,
            options,
            fan_out,
            registry_file: None,
            profiles: SessionCache::new(),
        }
    }

    /// Persist newly created courses to `path`. Without it `create` keeps them in
    /// memory only.
    pub fn with_registry_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.registry_file = Some(path.into());
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    pub fn progress(&self) -> Progress {
        self.fan_out.progress()
    }

    /// Create one course per class that has no registry entry yet.
    ///
    /// Runs fail-fast: after the first fatal result no further creations are
    /// started. Courses created before the failure are still appended to the
    /// registry file. Only local I/O problems are returned as `Err`.
    pub async fn create_courses(&self) -> Result<CreateReport> {
        let registry = &self.roster.registry;
        let (pending, registered): (Vec<&ClassRecord>, Vec<&ClassRecord>) = self
            .roster
            .classes
            .iter()
            .partition(|class| !registry.contains(&class.class_code));
        for class in &registered {
            info!(class_code = %class.class_code, "Course already registered; skipping creation");
        }
        info!(
            pending = pending.len(),
            registered = registered.len(),
            dry_run = self.options.dry_run,
            "Creating courses"
        );

        let results = self
            .fan_out
            .run_until_fatal(pending.clone(), |class| self.create_course(class))
            .await;

        let mut appender: Option<RegistryAppender> = None;
        let mut created = Vec::new();
        let mut outcomes = Vec::with_capacity(results.len());
        for (class, result) in pending.iter().zip(results) {
            match &result {
                WorkResult::Applied(entry) => {
                    if let Some(path) = &self.registry_file {
                        if appender.is_none() {
                            appender = Some(RegistryAppender::open(path)?);
                        }
                        if let Some(appender) = appender.as_mut() {
                            appender.append(entry)?;
                        }
                    }
                    created.push(entry.clone());
                }
                WorkResult::Simulated => {
                    let placeholder = self.placeholder_entry(class);
                    info!(
                        class_code = %class.class_code,
                        course_id = %placeholder.course_id,
                        "[DRY-RUN] Would create course"
                    );
                    created.push(placeholder);
                }
                _ => {}
            }
            outcomes.push(Keyed::new(&class.class_code, result));
        }

        let report = CreateReport {
            outcomes,
            registry: registry.with_entries(created),
        };
        let summary = report.summary();
        info!(
            applied = summary.applied,
            already_present = summary.already_present,
            simulated = summary.simulated,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Course creation finished"
        );
        if let Some((class_code, err)) = report.first_failure() {
            error!(class_code, error = %err, "Course creation aborted; remaining classes cancelled");
        }
        Ok(report)
    }

    async fn create_course(&self, class: &ClassRecord) -> WorkResult<RegistryEntry> {
        let owner = self.options.teacher_address(&class.teacher_user_id);
        let course = Course {
            name: class.course_name(),
            section: Some(class.section.clone()).filter(|s| !s.is_empty()),
            owner_id: Some(owner.clone()),
            ..Course::default()
        };
        let subject = format!("class {}", class.class_code);
        debug!(class_code = %class.class_code, course_name = %course.name, owner = %owner, "Creating course");

        let result = self
            .mutate(OperationKind::CreateCourse, &subject, || {
                self.api.create_course(&course)
            })
            .await;
        match result {
            WorkResult::Applied(Course { id: None, .. }) => WorkResult::Failed(SyncError::RemoteTransport {
                subject,
                message: "created course carries no id".into(),
            }),
            WorkResult::AlreadyPresent => {
                warn!(
                    class_code = %class.class_code,
                    "Course exists remotely but has no registry entry; not recorded"
                );
                WorkResult::AlreadyPresent
            }
            other => other.map(|created| {
                let entry = RegistryEntry {
                    class_code: class.class_code.clone(),
                    course_id: created.id.unwrap_or_default(),
                    course_name: Some(if created.name.is_empty() {
                        course.name.clone()
                    } else {
                        created.name
                    }),
                    // The API answers with a numeric owner id; the registry keeps the address sent.
                    owner_id: Some(owner),
                    enrollment_code: created.enrollment_code,
                    section: None,
                    teacher_user_id: None,
                };
                info!(
                    class_code = %entry.class_code,
                    course_id = %entry.course_id,
                    enrollment_code = entry.enrollment_code.as_deref().unwrap_or(""),
                    "Course created"
                );
                entry
            }),
        }
    }

    fn placeholder_entry(&self, class: &ClassRecord) -> RegistryEntry {
        RegistryEntry {
            class_code: class.class_code.clone(),
            course_id: placeholder_course_id(&class.class_code),
            course_name: Some(class.course_name()),
            owner_id: Some(self.options.teacher_address(&class.teacher_user_id)),
            enrollment_code: None,
            section: None,
            teacher_user_id: None,
        }
    }

    /// Enroll every class in the enrollment file, one class at a time.
    pub async fn enroll_all(&self, registry: &CourseRegistry) -> Vec<ClassSync> {
        self.sync_all(registry, MemberAction::Enroll).await
    }

    pub async fn unenroll_all(&self, registry: &CourseRegistry) -> Vec<ClassSync> {
        self.sync_all(registry, MemberAction::Unenroll).await
    }

    pub async fn enroll_class(&self, registry: &CourseRegistry, class_code: &str) -> ClassSync {
        self.sync_class(registry, class_code, MemberAction::Enroll)
            .await
    }

    pub async fn unenroll_class(&self, registry: &CourseRegistry, class_code: &str) -> ClassSync {
        self.sync_class(registry, class_code, MemberAction::Unenroll)
            .await
    }

    async fn sync_all(&self, registry: &CourseRegistry, action: MemberAction) -> Vec<ClassSync> {
        let mut classes = Vec::new();
        for class_code in self.roster.enrollments.class_codes() {
            classes.push(self.sync_class(registry, class_code, action).await);
        }
        classes
    }

    async fn sync_class(
        &self,
        registry: &CourseRegistry,
        class_code: &str,
        action: MemberAction,
    ) -> ClassSync {
        let mut sync = ClassSync::new(class_code, action);
        let rows = self.roster.enrollments.members(class_code).len();

        let Some(entry) = registry.get(class_code) else {
            if self.options.skip_unknown_class {
                info!(class_code, rows, "Class has no registered course; skipping");
                sync.status = WorkResult::Skipped("class has no registered course".into());
            } else {
                error!(class_code, rows, "Class has no registered course");
                sync.status = WorkResult::Failed(SyncError::Config(format!(
                    "class {class_code} has no registered course"
                )));
            }
            return sync;
        };
        let course_id = entry.course_id.as_str();
        sync.course_id = Some(entry.course_id.clone());

        let user_ids: Vec<String> = if self.options.dedupe_enrollments {
            self.roster
                .enrollments
                .unique_members(class_code)
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            self.roster.enrollments.members(class_code).to_vec()
        };
        if user_ids.len() < rows {
            debug!(class_code, rows, unique = user_ids.len(), "Duplicate enrollment rows collapsed");
        }
        if user_ids.is_empty() {
            info!(class_code, course_id, "No enrollment rows for class");
            sync.phase = EnrollPhase::Done;
            return sync;
        }

        let admin = match self.temporary_admin(entry) {
            Ok(admin) => admin,
            Err(err) => {
                error!(class_code, error = %err, "Cannot enter foreign-domain mode");
                sync.status = WorkResult::Failed(err);
                return sync;
            }
        };
        let mut granted = false;
        if let Some(admin) = admin {
            let subject = format!("course {course_id} admin {admin}");
            let grant = self
                .mutate(OperationKind::GrantAdmin, &subject, || {
                    self.api.add_member(course_id, CourseRole::Teacher, admin)
                })
                .await;
            match grant {
                WorkResult::Applied(_) | WorkResult::Simulated => granted = true,
                WorkResult::Failed(err) => {
                    error!(class_code, course_id, error = %err, "Admin grant failed; class aborted");
                    sync.status = WorkResult::Failed(err);
                    return sync;
                }
                _ => info!(class_code, course_id, admin, "Admin already teaches this course; leaving it in place"),
            }
        }
        sync.phase = EnrollPhase::AdminGranted;
        debug!(class_code, phase = ?sync.phase, "Enrollment phase reached");

        sync.members = self
            .fan_out
            .run(user_ids, |user_id| self.sync_member(course_id, user_id, action))
            .await;
        sync.phase = EnrollPhase::MembersProcessed;
        debug!(class_code, phase = ?sync.phase, "Enrollment phase reached");

        if let (true, Some(admin)) = (granted, admin) {
            let subject = format!("course {course_id} admin {admin}");
            let revoke = self
                .mutate(OperationKind::RevokeAdmin, &subject, || {
                    self.api.remove_member(course_id, CourseRole::Teacher, admin)
                })
                .await;
            if let WorkResult::Failed(err) = revoke {
                error!(class_code, course_id, admin, error = %err, "Admin revoke failed; admin remains a teacher");
                sync.status = WorkResult::Failed(err);
            } else {
                sync.phase = EnrollPhase::AdminRevoked;
                debug!(class_code, phase = ?sync.phase, "Enrollment phase reached");
            }
        }
        if !sync.status.is_failure() {
            sync.phase = EnrollPhase::Done;
        }

        let summary = sync.summary();
        info!(
            class_code,
            course_id,
            action = action.as_str(),
            applied = summary.applied,
            already_present = summary.already_present,
            already_absent = summary.already_absent,
            simulated = summary.simulated,
            failed = summary.failed,
            "Class processed"
        );
        sync
    }

    /// The operator account to grant temporarily, if this course needs one.
    fn temporary_admin(&self, entry: &RegistryEntry) -> Result<Option<&str>> {
        if !self.options.foreign_domain {
            return Ok(None);
        }
        let admin = self.options.admin_user.as_deref().ok_or_else(|| {
            SyncError::Config("foreign-domain mode requires admin_user".into())
        })?;
        let class_owner = self
            .roster
            .classes
            .get(&entry.class_code)
            .map(|class| self.options.teacher_address(&class.teacher_user_id));
        let owned_by_admin = class_owner
            .iter()
            .map(String::as_str)
            .chain(entry.owner_id.as_deref())
            .any(|owner| owner.eq_ignore_ascii_case(admin));
        if owned_by_admin {
            debug!(class_code = %entry.class_code, "Admin owns the course; no grant needed");
            return Ok(None);
        }
        Ok(Some(admin))
    }

    async fn sync_member(&self, course_id: &str, user_id: String, action: MemberAction) -> Keyed<()> {
        let role = self.options.member_role;
        let Some(email) = self.roster.users.email(&user_id) else {
            warn!(course_id, user_id = %user_id, "User id not in user directory");
            return Keyed::new(user_id.clone(), WorkResult::Failed(SyncError::UnknownUser { user_id }));
        };
        let subject = format!("course {course_id} user {user_id}");
        let result = match (action, self.options.foreign_domain) {
            (MemberAction::Enroll, true) => {
                let invitation = Invitation {
                    id: None,
                    user_id: email.to_string(),
                    course_id: course_id.to_string(),
                    role,
                };
                self.mutate(OperationKind::InviteMember, &subject, || {
                    self.api.create_invitation(&invitation)
                })
                .await
                .map(|_| ())
            }
            (MemberAction::Enroll, false) => self
                .mutate(OperationKind::AddMember, &subject, || {
                    self.api.add_member(course_id, role, email)
                })
                .await
                .map(|_| ()),
            (MemberAction::Unenroll, _) => {
                self.mutate(OperationKind::RemoveMember, &subject, || {
                    self.api.remove_member(course_id, role, email)
                })
                .await
            }
        };
        Keyed::new(user_id, result)
    }

    /// Delete courses. Never aborts; a course that is already gone is benign.
    pub async fn remove_courses(&self, course_ids: &[String]) -> Vec<Keyed<()>> {
        let results = self
            .fan_out
            .run(course_ids.to_vec(), |course_id| async move {
                let subject = format!("course {course_id}");
                let result = self
                    .mutate(OperationKind::DeleteCourse, &subject, || {
                        self.api.delete_course(&course_id)
                    })
                    .await;
                Keyed::new(course_id, result)
            })
            .await;
        log_batch("remove", &results);
        results
    }

    /// Archive courses. Same failure semantics as [`Reconciler::remove_courses`].
    pub async fn archive_courses(&self, course_ids: &[String]) -> Vec<Keyed<()>> {
        let results = self
            .fan_out
            .run(course_ids.to_vec(), |course_id| async move {
                let subject = format!("course {course_id}");
                let result = self
                    .mutate(OperationKind::ArchiveCourse, &subject, || {
                        self.api.archive_course(&course_id)
                    })
                    .await
                    .map(|course| {
                        debug!(course_id = %course_id, state = ?course.course_state, "Course archived");
                    });
                Keyed::new(course_id, result)
            })
            .await;
        log_batch("archive", &results);
        results
    }

    /// Every course visible to the operator, with teacher names.
    pub async fn list_courses(&self) -> Result<Vec<CourseListingRow>> {
        let courses = self
            .collect_pages(OperationKind::FetchCourse, "courses", |token| {
                self.api.list_courses(token)
            })
            .await?;
        info!(courses = courses.len(), "Fetched course list");

        let rows = self
            .fan_out
            .run(courses, |course| async move {
                let course_id = course.id.clone().unwrap_or_default();
                let teacher_name = if course_id.is_empty() {
                    String::new()
                } else {
                    match self.teacher_names(&course_id).await {
                        Ok(names) => names.join("/"),
                        Err(err) => {
                            warn!(course_id = %course_id, error = %err, "Could not list teachers");
                            String::new()
                        }
                    }
                };
                CourseListingRow {
                    course_name: course.name,
                    course_section: course.section,
                    course_id,
                    enrollment_code: course.enrollment_code,
                    owner_id: course.owner_id,
                    teacher_name,
                    status: course.course_state,
                }
            })
            .await;
        Ok(rows)
    }

    async fn teacher_names(&self, course_id: &str) -> Result<Vec<String>> {
        let subject = format!("course {course_id} teachers");
        let teachers = self
            .collect_pages(OperationKind::FetchRoster, &subject, |token| {
                self.api.list_members(course_id, CourseRole::Teacher, token)
            })
            .await?;
        Ok(teachers
            .iter()
            .filter_map(|t| t.profile.as_ref().and_then(UserProfile::full_name))
            .map(str::to_string)
            .collect())
    }

    /// Roster summary of every registered course, in registry order. A course that
    /// cannot be read still gets a row, with the error tag as its state.
    pub async fn crawl(&self, registry: &CourseRegistry) -> Vec<CrawlRow> {
        let entries: Vec<&RegistryEntry> = registry.keyed_entries().collect();
        info!(courses = entries.len(), "Crawling registered courses");
        self.fan_out
            .run(entries, |entry| async move {
                match self.crawl_course(entry).await {
                    Ok(row) => row,
                    Err(err) => {
                        error!(
                            class_code = %entry.class_code,
                            course_id = %entry.course_id,
                            error = %err,
                            "Course could not be crawled"
                        );
                        CrawlRow {
                            class_code: entry.class_code.clone(),
                            course_id: entry.course_id.clone(),
                            course_name: entry.course_name.clone(),
                            course_state: Some(err.tag().to_string()),
                            owner_email: None,
                            teacher_count: 0,
                            student_count: 0,
                        }
                    }
                }
            })
            .await
    }

    async fn crawl_course(&self, entry: &RegistryEntry) -> Result<CrawlRow> {
        let course_id = entry.course_id.as_str();
        let subject = format!("course {course_id}");
        let course = self
            .fetch(OperationKind::FetchCourse, &subject, || {
                self.api.get_course(course_id)
            })
            .await?;
        let teachers = self
            .collect_pages(OperationKind::FetchRoster, &subject, |token| {
                self.api.list_members(course_id, CourseRole::Teacher, token)
            })
            .await?;
        let students = self
            .collect_pages(OperationKind::FetchRoster, &subject, |token| {
                self.api.list_members(course_id, CourseRole::Student, token)
            })
            .await?;
        let owner_email = match course.owner_id.as_deref() {
            Some(owner) => self.owner_email(owner).await,
            None => None,
        };
        debug!(
            course_id,
            teachers = teachers.len(),
            students = students.len(),
            "Course crawled"
        );
        Ok(CrawlRow {
            class_code: entry.class_code.clone(),
            course_id: course_id.to_string(),
            course_name: Some(course.name).filter(|n| !n.is_empty()),
            course_state: course.course_state,
            owner_email,
            teacher_count: teachers.len(),
            student_count: students.len(),
        })
    }

    /// Email of a user profile, fetched once per user for the whole run.
    async fn owner_email(&self, user_id: &str) -> Option<String> {
        let key = user_id.to_string();
        let profile = self
            .profiles
            .get_or_try_init(&key, || async {
                let subject = format!("user {user_id}");
                self.fetch(OperationKind::FetchProfile, &subject, || {
                    self.api.get_user_profile(user_id)
                })
                .await
            })
            .await;
        match profile {
            Ok(profile) => profile.email_address,
            Err(err) => {
                warn!(user_id, error = %err, "Owner profile unavailable");
                None
            }
        }
    }

    /// Announcements of each course whose text contains one of `keywords`.
    pub async fn get_stream(
        &self,
        course_ids: &[String],
        keywords: &[String],
    ) -> Vec<Keyed<Vec<AnnouncementMatchRow>>> {
        info!(courses = course_ids.len(), keywords = ?keywords, "Scanning course streams");
        self.fan_out
            .run(course_ids.to_vec(), |course_id| async move {
                let subject = format!("course {course_id} announcements");
                let announcements = self
                    .collect_pages(OperationKind::FetchAnnouncements, &subject, |token| {
                        self.api.list_announcements(&course_id, token)
                    })
                    .await;
                let result = match announcements {
                    Ok(announcements) => {
                        let rows: Vec<_> = announcements
                            .into_iter()
                            .filter_map(|announcement| {
                                let text = announcement.text.unwrap_or_default();
                                let keyword = matching_keyword(&text, keywords)?.to_string();
                                Some(AnnouncementMatchRow {
                                    course_id: course_id.clone(),
                                    announcement_id: announcement.id,
                                    creation_time: announcement.creation_time,
                                    keyword,
                                    text,
                                    link: announcement.alternate_link,
                                })
                            })
                            .collect();
                        debug!(course_id = %course_id, matches = rows.len(), "Stream scanned");
                        WorkResult::Applied(rows)
                    }
                    Err(err) => {
                        error!(course_id = %course_id, error = %err, "Stream could not be read");
                        WorkResult::Failed(err)
                    }
                };
                Keyed::new(course_id, result)
            })
            .await
    }

    /// A single course. Not-found is an error here.
    pub async fn course_info(&self, course_id: &str) -> Result<Course> {
        let subject = format!("course {course_id}");
        self.fetch(OperationKind::FetchCourse, &subject, || {
            self.api.get_course(course_id)
        })
        .await
    }

    /// Issue one remote call with the per-call timeout, retrying rate limits and
    /// server faults according to the retry policy.
    async fn call<T, F, Fut>(
        &self,
        op: OperationKind,
        subject: &str,
        request: F,
    ) -> std::result::Result<T, ApiError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let mut attempt = 1;
        loop {
            debug!(op = op.as_str(), subject, attempt, "Calling remote");
            let outcome = match tokio::time::timeout(self.options.call_timeout, request()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ApiError::Timeout),
            };
            match outcome {
                Err(err) if err.is_retryable() && attempt < self.options.retry.max_attempts => {
                    let delay = self.options.retry.delay_after(attempt);
                    warn!(
                        op = op.as_str(),
                        subject,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying remote call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    /// A read-only call. Failures are never benign.
    async fn fetch<T, F, Fut>(&self, op: OperationKind, subject: &str, request: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        self.call(op, subject, request)
            .await
            .map_err(|err| SyncError::from_api(subject, err))
    }

    async fn collect_pages<T, F, Fut>(
        &self,
        op: OperationKind,
        subject: &str,
        fetch_page: F,
    ) -> Result<Vec<T>>
    where
        F: Fn(Option<String>) -> Fut,
        Fut: Future<Output = std::result::Result<Page<T>, ApiError>>,
    {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let token = page_token.take();
            let page = self
                .fetch(op, subject, || fetch_page(token.clone()))
                .await?;
            items.extend(page.items);
            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    /// A state-changing call: suppressed in dry-run, otherwise issued and classified.
    async fn mutate<T, F, Fut>(&self, op: OperationKind, subject: &str, request: F) -> WorkResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        if self.options.dry_run {
            info!(op = op.as_str(), subject, "[DRY-RUN] Would {}", op.as_str());
            return WorkResult::Simulated;
        }
        let outcome = self.call(op, subject, request).await;
        self.settle(op, subject, outcome)
    }

    fn settle<T>(
        &self,
        op: OperationKind,
        subject: &str,
        outcome: std::result::Result<T, ApiError>,
    ) -> WorkResult<T> {
        let err = match outcome {
            Ok(value) => {
                info!(op = op.as_str(), subject, "Applied");
                return WorkResult::Applied(value);
            }
            Err(err) => err,
        };
        match classify(op, &err) {
            Classification::BenignConflict => {
                info!(op = op.as_str(), subject, "Already present");
                WorkResult::AlreadyPresent
            }
            Classification::BenignAbsence => {
                info!(op = op.as_str(), subject, "Already absent");
                WorkResult::AlreadyAbsent
            }
            Classification::Success | Classification::Fatal => {
                let err = SyncError::from_api(subject, err);
                error!(op = op.as_str(), subject, tag = err.tag(), error = %err, "Remote call failed");
                WorkResult::Failed(err)
            }
        }
    }
}

/// The first keyword contained in `text`, compared case-insensitively. With no
/// keywords every text matches with an empty keyword.
pub fn matching_keyword<'k>(text: &str, keywords: &'k [String]) -> Option<&'k str> {
    if keywords.is_empty() {
        return Some("");
    }
    let haystack = text.to_lowercase();
    keywords
        .iter()
        .find(|keyword| haystack.contains(&keyword.to_lowercase()))
        .map(String::as_str)
}

fn log_batch(verb: &str, results: &[Keyed<()>]) {
    let summary = BatchSummary::of(results.iter().map(|r| &r.result));
    info!(
        verb,
        applied = summary.applied,
        already_absent = summary.already_absent,
        simulated = summary.simulated,
        failed = summary.failed,
        "Batch finished"
    );
}
