//! Identity and project membership lookups.
//!
//! The sync engine does not own accounts or projects. It asks an
//! [`IdentityProvider`] who a token belongs to and a [`ProjectDirectory`]
//! who may touch a document, then applies [`Access`] rules on top.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::types::{DocumentId, UserId};

/// Maps an opaque token to a user.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Project metadata for the document with the same identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: DocumentId,
    pub name: String,
    pub owner: UserId,
    pub members: HashSet<UserId>,
}

impl ProjectInfo {
    pub fn new(id: impl Into<DocumentId>, name: impl Into<String>, owner: UserId) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner,
            members: HashSet::new(),
        }
    }

    pub fn with_member(mut self, user: UserId) -> Self {
        self.members.insert(user);
        self
    }

    /// Owners count as members.
    pub fn is_member(&self, user: &UserId) -> bool {
        &self.owner == user || self.members.contains(user)
    }

    pub fn allows(&self, user: &UserId, access: Access) -> bool {
        match access {
            Access::Join | Access::History => self.is_member(user),
            Access::Rollback => &self.owner == user,
        }
    }
}

/// Operations gated by project membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Join,
    History,
    Rollback,
}

/// Project lookup by document.
pub trait ProjectDirectory: Send + Sync {
    fn project(&self, document_id: &DocumentId) -> Option<ProjectInfo>;

    /// Access policy for a resolved project. Defaults to membership rules.
    fn allows(&self, project: &ProjectInfo, user: &UserId, access: Access) -> bool {
        project.allows(user, access)
    }
}

/// Fixed token table.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    tokens: RwLock<HashMap<String, UserId>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(self, token: impl Into<String>, user: UserId) -> Self {
        self.insert(token, user);
        self
    }

    pub fn insert(&self, token: impl Into<String>, user: UserId) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), user);
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        self.tokens.read().ok()?.get(token).cloned()
    }
}

/// Accepts any non-empty token as the user of the same name.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenAsUser;

impl IdentityProvider for TokenAsUser {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        let token = token.trim();
        (!token.is_empty()).then(|| UserId::new(token))
    }
}

/// In-memory project table.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    projects: RwLock<HashMap<DocumentId, ProjectInfo>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(self, project: ProjectInfo) -> Self {
        self.insert(project);
        self
    }

    pub fn insert(&self, project: ProjectInfo) {
        if let Ok(mut projects) = self.projects.write() {
            projects.insert(project.id.clone(), project);
        }
    }
}

impl ProjectDirectory for MemoryDirectory {
    fn project(&self, document_id: &DocumentId) -> Option<ProjectInfo> {
        self.projects.read().ok()?.get(document_id).cloned()
    }
}

/// Every document exists and every caller may do anything. Development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenDirectory;

impl ProjectDirectory for OpenDirectory {
    fn project(&self, document_id: &DocumentId) -> Option<ProjectInfo> {
        // Unowned: access comes from `allows`, not from the owner field
        Some(ProjectInfo::new(
            document_id.clone(),
            document_id.as_str(),
            UserId::new(""),
        ))
    }

    fn allows(&self, _project: &ProjectInfo, _user: &UserId, _access: Access) -> bool {
        true
    }
}

/// Resolve whether `user` may perform `access` on `document_id`.
pub fn check_access(
    directory: &dyn ProjectDirectory,
    user: &UserId,
    document_id: &DocumentId,
    access: Access,
) -> Result<ProjectInfo, AccessDenied> {
    let project = directory
        .project(document_id)
        .ok_or(AccessDenied::UnknownProject)?;
    if directory.allows(&project, user, access) {
        Ok(project)
    } else {
        Err(AccessDenied::Forbidden)
    }
}

/// Why an access check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenied {
    UnknownProject,
    Forbidden,
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessDenied::UnknownProject => write!(f, "Project not found"),
            AccessDenied::Forbidden => write!(f, "Access denied"),
        }
    }
}

impl std::error::Error for AccessDenied {}
