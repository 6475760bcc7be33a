//! Typed reqwest wrapper for the Google Classroom REST API.
//!
//! [`ClassroomClient`] implements [`ClassroomApi`] over HTTP with a bearer token.
//! [`OfflineClassroom`] stands in during dry-runs that need no reads, so no
//! credentials are required to preview a change.

use async_trait::async_trait;
use classroom_sync_core::contract::ClassroomApi;
use classroom_sync_core::error::ApiError;
use classroom_sync_core::models::{
    Announcement, Course, CourseRole, Invitation, Member, Page, UserProfile,
};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::load_config::DEFAULT_API_BASE;

/// HTTP client for classroom operations.
pub struct ClassroomClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl ClassroomClient {
    pub fn new(auth_token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_API_BASE.to_string(),
            auth_token: auth_token.to_string(),
        }
    }

    /// Override the base URL (for testing with wiremock).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn courses_url(&self) -> String {
        format!("{}/courses", self.base_url)
    }

    fn course_url(&self, course_id: &str) -> String {
        format!("{}/courses/{}", self.base_url, urlencoding::encode(course_id))
    }

    fn members_url(&self, course_id: &str, role: CourseRole) -> String {
        format!("{}/{}", self.course_url(course_id), collection(role))
    }

    fn member_url(&self, course_id: &str, role: CourseRole, user_id: &str) -> String {
        format!(
            "{}/{}",
            self.members_url(course_id, role),
            urlencoding::encode(user_id)
        )
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = self.execute(req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ApiError::Transport(format!("response parse failed: {e}")))
    }

    async fn send_empty(&self, req: RequestBuilder) -> Result<(), ApiError> {
        self.execute(req).await.map(|_| ())
    }

    async fn execute(&self, req: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let resp = req
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout
                } else {
                    ApiError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), body = %body, "Classroom API error response");
        Err(ApiError::status(status.as_u16(), error_message(&body)))
    }
}

fn collection(role: CourseRole) -> &'static str {
    match role {
        CourseRole::Student => "students",
        CourseRole::Teacher => "teachers",
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// `STATUS: message` from a Google error body, or the raw body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorBody {
                message,
                status: Some(status),
            },
        }) => format!("{status}: {message}"),
        Ok(ErrorEnvelope { error }) => error.message,
        Err(_) => body.to_string(),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourseList {
    #[serde(default)]
    courses: Vec<Course>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberList {
    #[serde(default)]
    students: Vec<Member>,
    #[serde(default)]
    teachers: Vec<Member>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnouncementList {
    #[serde(default)]
    announcements: Vec<Announcement>,
    next_page_token: Option<String>,
}

fn with_page_token(req: RequestBuilder, page_token: Option<String>) -> RequestBuilder {
    match page_token {
        Some(token) => req.query(&[("pageToken", token)]),
        None => req,
    }
}

#[async_trait]
impl ClassroomApi for ClassroomClient {
    async fn create_course(&self, course: &Course) -> Result<Course, ApiError> {
        self.send(self.http.post(self.courses_url()).json(course))
            .await
    }

    async fn get_course(&self, course_id: &str) -> Result<Course, ApiError> {
        self.send(self.http.get(self.course_url(course_id))).await
    }

    async fn list_courses(&self, page_token: Option<String>) -> Result<Page<Course>, ApiError> {
        let req = with_page_token(self.http.get(self.courses_url()), page_token);
        let list: CourseList = self.send(req).await?;
        Ok(Page {
            items: list.courses,
            next_page_token: list.next_page_token,
        })
    }

    async fn archive_course(&self, course_id: &str) -> Result<Course, ApiError> {
        let body = serde_json::json!({ "courseState": "ARCHIVED" });
        let req = self
            .http
            .patch(self.course_url(course_id))
            .query(&[("updateMask", "courseState")])
            .json(&body);
        self.send(req).await
    }

    async fn delete_course(&self, course_id: &str) -> Result<(), ApiError> {
        self.send_empty(self.http.delete(self.course_url(course_id)))
            .await
    }

    async fn add_member(
        &self,
        course_id: &str,
        role: CourseRole,
        user_id: &str,
    ) -> Result<Member, ApiError> {
        let body = serde_json::json!({ "userId": user_id });
        self.send(self.http.post(self.members_url(course_id, role)).json(&body))
            .await
    }

    async fn remove_member(
        &self,
        course_id: &str,
        role: CourseRole,
        user_id: &str,
    ) -> Result<(), ApiError> {
        self.send_empty(self.http.delete(self.member_url(course_id, role, user_id)))
            .await
    }

    async fn list_members(
        &self,
        course_id: &str,
        role: CourseRole,
        page_token: Option<String>,
    ) -> Result<Page<Member>, ApiError> {
        let req = with_page_token(self.http.get(self.members_url(course_id, role)), page_token);
        let list: MemberList = self.send(req).await?;
        let items = match role {
            CourseRole::Student => list.students,
            CourseRole::Teacher => list.teachers,
        };
        Ok(Page {
            items,
            next_page_token: list.next_page_token,
        })
    }

    async fn create_invitation(&self, invitation: &Invitation) -> Result<Invitation, ApiError> {
        let url = format!("{}/invitations", self.base_url);
        self.send(self.http.post(url).json(invitation)).await
    }

    async fn list_announcements(
        &self,
        course_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<Announcement>, ApiError> {
        let url = format!("{}/announcements", self.course_url(course_id));
        let list: AnnouncementList = self.send(with_page_token(self.http.get(url), page_token)).await?;
        Ok(Page {
            items: list.announcements,
            next_page_token: list.next_page_token,
        })
    }

    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, ApiError> {
        let url = format!("{}/userProfiles/{}", self.base_url, urlencoding::encode(user_id));
        self.send(self.http.get(url)).await
    }
}

/// Refuses every call. Used for dry-runs of verbs that only mutate, which never
/// reach the remote.
pub struct OfflineClassroom;

fn offline<T>() -> Result<T, ApiError> {
    Err(ApiError::Transport(
        "no classroom session in dry-run".to_string(),
    ))
}

#[async_trait]
impl ClassroomApi for OfflineClassroom {
    async fn create_course(&self, _course: &Course) -> Result<Course, ApiError> {
        offline()
    }
    async fn get_course(&self, _course_id: &str) -> Result<Course, ApiError> {
        offline()
    }
    async fn list_courses(&self, _page_token: Option<String>) -> Result<Page<Course>, ApiError> {
        offline()
    }
    async fn archive_course(&self, _course_id: &str) -> Result<Course, ApiError> {
        offline()
    }
    async fn delete_course(&self, _course_id: &str) -> Result<(), ApiError> {
        offline()
    }
    async fn add_member(
        &self,
        _course_id: &str,
        _role: CourseRole,
        _user_id: &str,
    ) -> Result<Member, ApiError> {
        offline()
    }
    async fn remove_member(
        &self,
        _course_id: &str,
        _role: CourseRole,
        _user_id: &str,
    ) -> Result<(), ApiError> {
        offline()
    }
    async fn list_members(
        &self,
        _course_id: &str,
        _role: CourseRole,
        _page_token: Option<String>,
    ) -> Result<Page<Member>, ApiError> {
        offline()
    }
    async fn create_invitation(&self, _invitation: &Invitation) -> Result<Invitation, ApiError> {
        offline()
    }
    async fn list_announcements(
        &self,
        _course_id: &str,
        _page_token: Option<String>,
    ) -> Result<Page<Announcement>, ApiError> {
        offline()
    }
    async fn get_user_profile(&self, _user_id: &str) -> Result<UserProfile, ApiError> {
        offline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{bearer_token, body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, ClassroomClient) {
        let server = MockServer::start().await;
        let client = ClassroomClient::new("test-token").with_base_url(&server.uri());
        (server, client)
    }

    #[tokio::test]
    async fn create_course_posts_json_and_parses_reply() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/courses"))
            .and(bearer_token("test-token"))
            .and(body_json(serde_json::json!({
                "name": "Algebra(A12B3456)",
                "section": "1A",
                "ownerId": "t100@example.edu"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "987",
                "name": "Algebra(A12B3456)",
                "ownerId": "t100@example.edu",
                "enrollmentCode": "abc12",
                "courseState": "PROVISIONED"
            })))
            .mount(&server)
            .await;

        let course = Course {
            name: "Algebra(A12B3456)".into(),
            section: Some("1A".into()),
            owner_id: Some("t100@example.edu".into()),
            ..Course::default()
        };
        let created = client.create_course(&course).await.unwrap();
        assert_eq!(created.id.as_deref(), Some("987"));
        assert_eq!(created.enrollment_code.as_deref(), Some("abc12"));
    }

    #[tokio::test]
    async fn conflict_status_and_message_are_preserved() {
        let (server, client) = setup().await;

        Mock::given(method("POST"))
            .and(path("/courses/987/students"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "error": {
                    "code": 409,
                    "message": "Requested entity already exists",
                    "status": "ALREADY_EXISTS"
                }
            })))
            .mount(&server)
            .await;

        let err = client
            .add_member("987", CourseRole::Student, "s1@example.edu")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ApiError::status(409, "ALREADY_EXISTS: Requested entity already exists")
        );
    }

    #[tokio::test]
    async fn list_members_follows_role_collection_and_page_token() {
        let (server, client) = setup().await;

        Mock::given(method("GET"))
            .and(path("/courses/987/teachers"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "teachers": [
                    {"courseId": "987", "userId": "1", "profile": {"name": {"fullName": "Ann Lee"}}}
                ]
            })))
            .mount(&server)
            .await;

        let page = client
            .list_members("987", CourseRole::Teacher, Some("p2".into()))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(
            page.items[0].profile.as_ref().and_then(|p| p.full_name()),
            Some("Ann Lee")
        );
        assert_eq!(page.next_page_token, None);
    }

    #[tokio::test]
    async fn archive_patches_course_state() {
        let (server, client) = setup().await;

        Mock::given(method("PATCH"))
            .and(path("/courses/987"))
            .and(query_param("updateMask", "courseState"))
            .and(body_json(serde_json::json!({ "courseState": "ARCHIVED" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "987",
                "name": "Algebra(A12B3456)",
                "courseState": "ARCHIVED"
            })))
            .mount(&server)
            .await;

        let course = client.archive_course("987").await.unwrap();
        assert_eq!(course.course_state.as_deref(), Some("ARCHIVED"));
    }

    #[tokio::test]
    async fn delete_missing_course_reports_not_found() {
        let (server, client) = setup().await;

        Mock::given(method("DELETE"))
            .and(path("/courses/404"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client.delete_course("404").await.unwrap_err();
        assert_eq!(err.code(), Some(404));
        assert_eq!(err, ApiError::status(404, "not json"));
    }

    #[tokio::test]
    async fn remove_member_encodes_email_in_path() {
        let (server, client) = setup().await;

        Mock::given(method("DELETE"))
            .and(path("/courses/987/students/s1%40example.edu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        client
            .remove_member("987", CourseRole::Student, "s1@example.edu")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let client = ClassroomClient::new("t").with_base_url("http://127.0.0.1:1");
        let err = client.get_course("987").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }

    #[tokio::test]
    async fn offline_classroom_refuses_calls() {
        let err = OfflineClassroom.get_course("987").await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
    }
}
