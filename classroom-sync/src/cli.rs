/// # classroom-sync CLI interface
///
/// Command parsing and per-verb orchestration. All roster and reconciliation logic
/// lives in [`classroom-sync-core`]; this module loads settings, obtains a classroom
/// session, hands both to a [`Reconciler`] and writes what comes back.
///
/// ## How To Use
/// - For command-line users: use the installed `classroom-sync` binary with `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// [`classroom-sync-core`]: ../../classroom-sync-core/
use crate::auth::{Authenticator, ScopeProfile};
use crate::classroom::{ClassroomClient, OfflineClassroom};
use crate::load_config::{load_config, CliConfig};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use classroom_sync_core::contract::ClassroomApi;
use classroom_sync_core::fanout::{BatchSummary, Keyed, WorkResult};
use classroom_sync_core::models::CourseRole;
use classroom_sync_core::reconcile::{ClassSync, Reconciler};
use classroom_sync_core::report::{write_report, MemberOutcomeRow};
use classroom_sync_core::roster::{CourseRegistry, Roster, RosterLoader};
use std::path::{Path, PathBuf};

/// CLI for classroom-sync: drive Google Classroom from flat CSV rosters.
#[derive(Parser, Debug)]
#[clap(
    name = "classroom-sync",
    version,
    about = "Create, enroll, crawl and archive Google Classroom courses from CSV rosters"
)]
pub struct Cli {
    /// Log every mutating call instead of issuing it
    #[clap(long, global = true)]
    pub dry_run: bool,

    /// Force debug-level logging
    #[clap(long, global = true)]
    pub debug: bool,

    /// Path to the YAML settings file (default: classroom-sync.yaml, if present)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Flags shared by the enroll family.
#[derive(Args, Debug, Clone, Default)]
pub struct EnrollArgs {
    /// Enroll as teachers instead of students
    #[clap(long)]
    pub teacher: bool,

    /// Invite members through a temporary admin teacher (courses owned by another domain)
    #[clap(long)]
    pub foreign_domain: bool,

    /// Write per-member outcomes to this CSV file
    #[clap(long)]
    pub report: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create one course per class not yet in the registry
    Create {
        /// Class file (defaults to the configured one)
        class_file: Option<PathBuf>,
    },
    /// Add enrollment-file members to their registered courses
    Enroll {
        /// Enrollment file (defaults to the configured one)
        enroll_file: Option<PathBuf>,
        #[clap(flatten)]
        opts: EnrollArgs,
    },
    /// Create missing courses, then enroll
    All {
        #[clap(flatten)]
        opts: EnrollArgs,
    },
    /// Delete courses by id
    Remove {
        #[clap(required = true)]
        course_ids: Vec<String>,
    },
    /// Remove enrollment-file members from their registered courses
    Unenroll {
        enroll_file: Option<PathBuf>,
        #[clap(flatten)]
        opts: EnrollArgs,
    },
    /// Write every visible course to a CSV file
    Lists { output: PathBuf },
    /// Print one course as JSON
    Info { course_id: String },
    /// Write a roster summary of every registered course to a CSV file
    Crawl { output: PathBuf },
    /// Write announcements of registered courses matching keywords to a CSV file
    GetStream {
        output: PathBuf,
        /// Case-insensitive keyword; repeatable. Without any, every announcement matches.
        #[clap(long = "keyword")]
        keywords: Vec<String>,
    },
    /// Archive courses by id
    Archive {
        #[clap(required = true)]
        course_ids: Vec<String>,
    },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Create { .. } => "create",
            Commands::Enroll { .. } => "enroll",
            Commands::All { .. } => "all",
            Commands::Remove { .. } => "remove",
            Commands::Unenroll { .. } => "unenroll",
            Commands::Lists { .. } => "lists",
            Commands::Info { .. } => "info",
            Commands::Crawl { .. } => "crawl",
            Commands::GetStream { .. } => "get-stream",
            Commands::Archive { .. } => "archive",
        }
    }

    fn enroll_args(&self) -> EnrollArgs {
        match self {
            Commands::Enroll { opts, .. }
            | Commands::Unenroll { opts, .. }
            | Commands::All { opts } => opts.clone(),
            _ => EnrollArgs::default(),
        }
    }

    /// Verbs that only issue mutating calls; a dry-run of these needs no session.
    fn mutates_only(&self) -> bool {
        matches!(
            self,
            Commands::Create { .. }
                | Commands::Enroll { .. }
                | Commands::All { .. }
                | Commands::Remove { .. }
                | Commands::Unenroll { .. }
                | Commands::Archive { .. }
        )
    }

    fn scope_profile(&self) -> ScopeProfile {
        match self {
            Commands::Crawl { .. } | Commands::GetStream { .. } => ScopeProfile::Stream,
            _ => ScopeProfile::Manage,
        }
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let mut config = load_config(cli.config.as_deref())?;
    match &cli.command {
        Commands::Create {
            class_file: Some(file),
        } => config.paths.classes = file.clone(),
        Commands::Enroll {
            enroll_file: Some(file),
            ..
        }
        | Commands::Unenroll {
            enroll_file: Some(file),
            ..
        } => config.paths.enrollments = file.clone(),
        _ => {}
    }

    let enroll = cli.command.enroll_args();
    let options = config.sync_options(cli.dry_run, enroll.foreign_domain, enroll.teacher);
    options.trace_loaded();
    let role = options.member_role;

    let roster = load_roster(&config, &cli.command)?;
    let api = open_session(&config, &cli.command, cli.dry_run).await?;
    let reconciler = Reconciler::new(api.as_ref(), &roster, options)
        .with_registry_file(config.paths.registry.clone());
    tracing::info!(command = cli.command.name(), dry_run = cli.dry_run, "Starting command");

    match cli.command {
        Commands::Create { .. } => {
            create(&reconciler).await?;
        }
        Commands::Enroll { .. } => {
            let classes = reconciler.enroll_all(&roster.registry).await;
            finish_classes(&classes, &roster, role, enroll.report.as_deref())?;
        }
        Commands::Unenroll { .. } => {
            let classes = reconciler.unenroll_all(&roster.registry).await;
            finish_classes(&classes, &roster, role, enroll.report.as_deref())?;
        }
        Commands::All { .. } => {
            let created = create(&reconciler).await?;
            let classes = reconciler.enroll_all(&created).await;
            finish_classes(&classes, &roster, role, enroll.report.as_deref())?;
        }
        Commands::Remove { course_ids } => {
            let results = reconciler.remove_courses(&course_ids).await;
            print_keyed("remove", &results);
        }
        Commands::Archive { course_ids } => {
            let results = reconciler.archive_courses(&course_ids).await;
            print_keyed("archive", &results);
        }
        Commands::Lists { output } => {
            let rows = reconciler
                .list_courses()
                .await
                .context("Listing courses failed")?;
            let written = write_report(&output, &rows)?;
            println!("lists: {written} courses written to {}", output.display());
        }
        Commands::Info { course_id } => {
            let course = reconciler
                .course_info(&course_id)
                .await
                .with_context(|| format!("Fetching course {course_id} failed"))?;
            println!("{}", serde_json::to_string_pretty(&course)?);
        }
        Commands::Crawl { output } => {
            let rows = reconciler.crawl(&roster.registry).await;
            let written = write_report(&output, &rows)?;
            println!("crawl: {written} courses written to {}", output.display());
        }
        Commands::GetStream { output, keywords } => {
            let course_ids: Vec<String> = roster
                .registry
                .keyed_entries()
                .map(|entry| entry.course_id.clone())
                .collect();
            let scans = reconciler.get_stream(&course_ids, &keywords).await;
            let failed = scans.iter().filter(|s| s.result.is_failure()).count();
            let rows: Vec<_> = scans
                .into_iter()
                .filter_map(|scan| match scan.result {
                    WorkResult::Applied(rows) => Some(rows),
                    _ => None,
                })
                .flatten()
                .collect();
            let written = write_report(&output, &rows)?;
            println!(
                "get-stream: {written} announcements from {} courses written to {} ({failed} courses unreadable)",
                course_ids.len(),
                output.display()
            );
        }
    }
    Ok(())
}

/// Load only the tables the verb reads.
fn load_roster(config: &CliConfig, command: &Commands) -> Result<Roster> {
    let mut loader = RosterLoader::new(config.paths.clone());
    if let Some(pattern) = &config.class_code_pattern {
        loader = loader.with_class_code_pattern(pattern)?;
    }
    let roster = match command {
        Commands::Create { .. }
        | Commands::Enroll { .. }
        | Commands::Unenroll { .. }
        | Commands::All { .. } => loader.load()?,
        Commands::Crawl { .. } | Commands::GetStream { .. } => Roster {
            registry: loader.load_registry()?,
            ..Roster::default()
        },
        _ => Roster::default(),
    };
    Ok(roster)
}

async fn open_session(
    config: &CliConfig,
    command: &Commands,
    dry_run: bool,
) -> Result<Box<dyn ClassroomApi>> {
    if dry_run && command.mutates_only() {
        tracing::info!("Dry-run: no classroom session opened");
        return Ok(Box::new(OfflineClassroom));
    }
    let auth = Authenticator::from_credentials_file(&config.auth.credentials, &config.auth.token_dir)?;
    let token = auth.access_token(command.scope_profile()).await?;
    Ok(Box::new(
        ClassroomClient::new(&token).with_base_url(&config.api_base),
    ))
}

/// Run course creation and print its summary. Fails when the batch was aborted.
async fn create(
    reconciler: &Reconciler<'_, dyn ClassroomApi>,
) -> Result<CourseRegistry> {
    let report = reconciler.create_courses().await?;
    for outcome in &report.outcomes {
        println!(
            "create {}: {} {}",
            outcome.key,
            outcome.result.label(),
            outcome.result.detail()
        );
    }
    print_summary("create", &report.summary());
    if let Some((class_code, err)) = report.first_failure() {
        bail!("Course creation aborted at class {class_code}: {err}");
    }
    Ok(report.registry)
}

fn finish_classes(
    classes: &[ClassSync],
    roster: &Roster,
    role: CourseRole,
    report: Option<&Path>,
) -> Result<()> {
    for class in classes {
        let summary = class.summary();
        println!(
            "{} {} (course {}): {} [{}] applied={} already_present={} already_absent={} dry_run={} failed={}",
            class.action.as_str(),
            class.class_code,
            class.course_id.as_deref().unwrap_or("-"),
            class.status.label(),
            class.status.detail(),
            summary.applied,
            summary.already_present,
            summary.already_absent,
            summary.simulated,
            summary.failed,
        );
    }
    if let Some(path) = report {
        let rows: Vec<MemberOutcomeRow> = classes
            .iter()
            .flat_map(|class| class.to_rows(roster, role))
            .collect();
        write_report(path, &rows)?;
    }
    Ok(())
}

fn print_keyed(verb: &str, results: &[Keyed<()>]) {
    for result in results {
        println!(
            "{verb} {}: {} {}",
            result.key,
            result.result.label(),
            result.result.detail()
        );
    }
    print_summary(verb, &BatchSummary::of(results.iter().map(|r| &r.result)));
}

fn print_summary(verb: &str, summary: &BatchSummary) {
    println!(
        "{verb}: total={} applied={} already_present={} already_absent={} dry_run={} failed={} cancelled={}",
        summary.total(),
        summary.applied,
        summary.already_present,
        summary.already_absent,
        summary.simulated,
        summary.failed,
        summary.cancelled,
    );
}
