//! Response classification for remote operations.
//!
//! Which failures are expected depends on what was attempted: a 409 while creating
//! means the work is already done, a 404 while tearing down means the same. Reads get
//! no such leniency.

use crate::error::ApiError;

/// What was being attempted when a remote call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    CreateCourse,
    AddMember,
    InviteMember,
    GrantAdmin,
    RemoveMember,
    RevokeAdmin,
    DeleteCourse,
    ArchiveCourse,
    FetchCourse,
    FetchRoster,
    FetchAnnouncements,
    FetchProfile,
}

impl OperationKind {
    /// Operations that change remote state and are therefore suppressed in dry-run.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            OperationKind::FetchCourse
                | OperationKind::FetchRoster
                | OperationKind::FetchAnnouncements
                | OperationKind::FetchProfile
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::CreateCourse => "create_course",
            OperationKind::AddMember => "add_member",
            OperationKind::InviteMember => "invite_member",
            OperationKind::GrantAdmin => "grant_admin",
            OperationKind::RemoveMember => "remove_member",
            OperationKind::RevokeAdmin => "revoke_admin",
            OperationKind::DeleteCourse => "delete_course",
            OperationKind::ArchiveCourse => "archive_course",
            OperationKind::FetchCourse => "fetch_course",
            OperationKind::FetchRoster => "fetch_roster",
            OperationKind::FetchAnnouncements => "fetch_announcements",
            OperationKind::FetchProfile => "fetch_profile",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Success,
    /// The remote already holds what we tried to create.
    BenignConflict,
    /// The remote already lacks what we tried to remove.
    BenignAbsence,
    Fatal,
}

impl Classification {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Classification::Fatal)
    }
}

/// Classify the outcome of a remote call for the given operation.
pub fn classify_result<T>(op: OperationKind, result: &Result<T, ApiError>) -> Classification {
    match result {
        Ok(_) => Classification::Success,
        Err(err) => classify(op, err),
    }
}

/// Classify a remote failure for the given operation.
pub fn classify(op: OperationKind, err: &ApiError) -> Classification {
    use OperationKind::*;
    match (op, err.code()) {
        (CreateCourse | AddMember | InviteMember | GrantAdmin, Some(409)) => {
            Classification::BenignConflict
        }
        (RemoveMember | RevokeAdmin | DeleteCourse | ArchiveCourse, Some(404)) => {
            Classification::BenignAbsence
        }
        _ => Classification::Fatal,
    }
}
