use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::{read_to_string, write};
use std::path::Path;
use tempfile::TempDir;

/// Writes a roster and a config pointing at it into `dir`; returns the config path.
fn write_roster(dir: &Path, registry: Option<&str>) -> std::path::PathBuf {
    write(
        dir.join("classes.csv"),
        "A12B3456,Algebra,t100,1A\nB22C0001,Biology,t200,2B\n",
    )
    .expect("Writing classes failed");
    write(
        dir.join("users.csv"),
        "s1,s1@example.edu\nt100,t100@example.edu\nt200,t200@example.edu\n",
    )
    .expect("Writing users failed");
    write(dir.join("enrollments.csv"), "A12B3456,s1\n").expect("Writing enrollments failed");
    if let Some(registry) = registry {
        write(dir.join("coursesID.csv"), registry).expect("Writing registry failed");
    }

    let config = dir.join("classroom-sync.yaml");
    let yaml = format!(
        "paths:\n  classes: {d}/classes.csv\n  users: {d}/users.csv\n  enrollments: {d}/enrollments.csv\n  registry: {d}/coursesID.csv\nteacher_email_domain: example.edu\n",
        d = dir.display()
    );
    write(&config, yaml).expect("Writing config failed");
    config
}

fn classroom_sync() -> Command {
    let mut cmd = Command::cargo_bin("classroom-sync").expect("Binary exists");
    cmd.env_remove("CLASSROOM_SYNC_ADMIN_USER")
        .env_remove("CLASSROOM_SYNC_API_BASE")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_every_verb() {
    let assert = classroom_sync().arg("--help").assert().success();
    let mut stdout = predicate::str::contains("create").boxed();
    for verb in [
        "enroll",
        "remove",
        "unenroll",
        "lists",
        "info",
        "crawl",
        "get-stream",
        "archive",
        "all",
    ] {
        stdout = stdout.and(predicate::str::contains(verb)).boxed();
    }
    assert.stdout(stdout);
}

#[test]
fn dry_run_create_leaves_registry_untouched() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), Some("A12B3456,987\n"));

    classroom_sync()
        .arg("--dry-run")
        .arg("--config")
        .arg(&config)
        .arg("create")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("create B22C0001: dry_run"))
        .stdout(predicate::str::contains("create: total=1 applied=0"))
        .stderr(predicate::str::contains("[DRY-RUN] Would create course"))
        .stderr(predicate::str::contains("dry-run-B22C0001"));

    let registry = read_to_string(dir.path().join("coursesID.csv")).expect("registry");
    assert_eq!(registry, "A12B3456,987\n");
}

#[test]
fn dry_run_all_enrolls_into_placeholder_courses() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), None);

    classroom_sync()
        .arg("--dry-run")
        .arg("--config")
        .arg(&config)
        .arg("all")
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("(course dry-run-A12B3456)"))
        .stdout(predicate::str::contains("dry_run=1"));

    assert!(!dir.path().join("coursesID.csv").exists());
}

#[test]
fn dry_run_archive_reports_every_id() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), None);

    classroom_sync()
        .args(["--dry-run", "--config"])
        .arg(&config)
        .args(["archive", "111", "222"])
        .current_dir(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("archive 111: dry_run"))
        .stdout(predicate::str::contains("archive 222: dry_run"));
}

#[test]
fn remove_without_ids_is_rejected() {
    classroom_sync()
        .arg("remove")
        .assert()
        .failure()
        .stderr(predicate::str::contains("COURSE_IDS"));
}

#[test]
fn enroll_with_missing_file_fails() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), Some("A12B3456,987\n"));

    classroom_sync()
        .args(["--dry-run", "--config"])
        .arg(&config)
        .arg("enroll")
        .arg(dir.path().join("missing.csv"))
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing.csv"));
}

#[test]
fn missing_credentials_fail_before_any_call() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), None);

    classroom_sync()
        .arg("--config")
        .arg(&config)
        .args(["info", "123"])
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("credentials.json"));
}

/// Seeds credentials and a fresh manage token so no consent prompt is needed.
fn write_session(dir: &Path) {
    write(
        dir.join("credentials.json"),
        r#"{"installed":{"client_id":"client-1","client_secret":"shh","auth_uri":"https://accounts.google.com/o/oauth2/auth","token_uri":"https://oauth2.googleapis.com/token"}}"#,
    )
    .expect("Writing credentials failed");
    write(
        dir.join("token.manage.json"),
        r#"{"access_token":"test-access","refresh_token":null,"expires_at":"2999-01-01T00:00:00Z","scopes":["https://www.googleapis.com/auth/classroom.courses","https://www.googleapis.com/auth/classroom.rosters","https://www.googleapis.com/auth/classroom.profile.emails"]}"#,
    )
    .expect("Writing token failed");
}

async fn forbidden_classroom() -> wiremock::MockServer {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/courses"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": {"code": 403, "message": "The caller does not have permission", "status": "PERMISSION_DENIED"}
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test(flavor = "multi_thread")]
async fn aborted_create_exits_non_zero() {
    let server = forbidden_classroom().await;
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), None);
    write_session(dir.path());

    classroom_sync()
        .arg("--config")
        .arg(&config)
        .arg("create")
        .env("CLASSROOM_SYNC_API_BASE", server.uri())
        .current_dir(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("create A12B3456: failed"))
        .stderr(predicate::str::contains("Course creation aborted"));

    assert!(!dir.path().join("coursesID.csv").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn all_stops_before_enrolling_when_create_aborts() {
    let server = forbidden_classroom().await;
    let dir = TempDir::new().expect("temp dir");
    let config = write_roster(dir.path(), Some("A12B3456,987\n"));
    write_session(dir.path());

    classroom_sync()
        .arg("--config")
        .arg(&config)
        .arg("all")
        .env("CLASSROOM_SYNC_API_BASE", server.uri())
        .current_dir(dir.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("create B22C0001: failed"))
        .stdout(predicate::str::contains("enroll A12B3456").not());

    let requests = server.received_requests().await.expect("request recording");
    assert!(!requests.is_empty());
    assert!(
        requests.iter().all(|r| r.url.path() == "/courses"),
        "Expected only course creation calls, got: {:?}",
        requests.iter().map(|r| r.url.path().to_string()).collect::<Vec<_>>()
    );
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        use std::fmt::Write as FmtWrite;
        let mut msg = String::new();
        let _ = write!(&mut msg, "{:?}", event);
        self.events.lock().unwrap().push(msg);
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use classroom_sync::cli::{run, Cli, Commands};

    // A missing explicit config makes the run fail right after the first event.
    let cli = Cli {
        dry_run: true,
        debug: false,
        config: Some(std::path::PathBuf::from("does-not-exist.yaml")),
        command: Commands::Info {
            course_id: "123".into(),
        },
    };

    let result = run(cli).await;
    assert!(result.is_err());

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
