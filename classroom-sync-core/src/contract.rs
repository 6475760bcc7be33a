#![allow(unused)]

//! # contract: the remote classroom seam
//!
//! This module defines the single trait ([`ClassroomApi`]) through which the
//! reconciliation engine reaches the classroom-hosting service. The core crate never
//! speaks HTTP; the CLI crate provides the reqwest implementor and tests use the
//! generated `MockClassroomApi` or a hand-written fake.
//!
//! ## Error contract
//! - Every method returns [`ApiError`] on failure and never panics on remote input.
//! - A non-2xx answer must surface as [`ApiError::Status`] with the HTTP code intact,
//!   since the engine's classification keys on it (409 conflict, 404 absence).
//! - Timeouts are applied by the engine, not by implementors.
//!
//! ## Mocking & Testing
//! - The trait is annotated for `mockall` so consumers can generate deterministic
//!   mocks (enabled by the default `test-export-mocks` feature).

use async_trait::async_trait;

use mockall::{automock, predicate::*};

use crate::error::ApiError;
use crate::models::{Announcement, Course, CourseRole, Invitation, Member, Page, UserProfile};

/// Operations the engine needs from the classroom service.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ClassroomApi: Send + Sync {
    /// Create a course; the returned course carries the assigned id and enrollment code.
    async fn create_course(&self, course: &Course) -> Result<Course, ApiError>;

    async fn get_course(&self, course_id: &str) -> Result<Course, ApiError>;

    /// One page of all courses visible to the caller.
    async fn list_courses(&self, page_token: Option<String>) -> Result<Page<Course>, ApiError>;

    /// Move a course to the ARCHIVED state.
    async fn archive_course(&self, course_id: &str) -> Result<Course, ApiError>;

    async fn delete_course(&self, course_id: &str) -> Result<(), ApiError>;

    /// Directly add a user (email or id) to a course roster without an invitation.
    async fn add_member(
        &self,
        course_id: &str,
        role: CourseRole,
        user_id: &str,
    ) -> Result<Member, ApiError>;

    async fn remove_member(
        &self,
        course_id: &str,
        role: CourseRole,
        user_id: &str,
    ) -> Result<(), ApiError>;

    async fn list_members(
        &self,
        course_id: &str,
        role: CourseRole,
        page_token: Option<String>,
    ) -> Result<Page<Member>, ApiError>;

    async fn create_invitation(&self, invitation: &Invitation) -> Result<Invitation, ApiError>;

    async fn list_announcements(
        &self,
        course_id: &str,
        page_token: Option<String>,
    ) -> Result<Page<Announcement>, ApiError>;

    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, ApiError>;
}
