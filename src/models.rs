use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub type Id = i64;

pub const UNKNOWN_USER: &str = "Unknown User";

fn unknown_user() -> String {
    UNKNOWN_USER.to_string()
}

// ---------------------------------------------------------------- bugs ---

/// Which section of a bug page a comment hangs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ParentType {
    Description,
    #[default]
    Comment,
}

/// One entry of a bug's comment thread.
///
/// Stored as an element of the bug's JSON `comments` array, in splice order:
/// a reply sits directly after its parent, not at the end of the list.
/// `parent_index` is recorded at insert time and never recomputed, so it goes
/// stale once earlier entries are spliced in; `parent_id` is the stable link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub text: String,
    #[serde(default = "unknown_user")]
    pub user: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub parent_type: ParentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub is_reply: bool,
}

/// Explicit owner of an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AttachmentOwner {
    Description,
    Comment { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Attachment {
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// `None` on rows written before owners existed; those pair by position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<AttachmentOwner>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Bug {
    pub id: Id,
    pub summary: String,
    pub description: String,
    pub defect_type: String,
    pub priority: String,
    pub status: String,
    pub resolution: String,
    pub product: String,
    pub component: String,
    pub assignee: String,
    pub reporter: String,
    pub changed: DateTime<Utc>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Row shape for bug listings (thread and attachments omitted).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BugSummary {
    pub id: Id,
    pub summary: String,
    pub priority: String,
    pub status: String,
    pub assignee: String,
    pub product: String,
    pub changed: DateTime<Utc>,
    pub comment_count: usize,
}

impl From<&Bug> for BugSummary {
    fn from(b: &Bug) -> Self {
        Self {
            id: b.id,
            summary: b.summary.clone(),
            priority: b.priority.clone(),
            status: b.status.clone(),
            assignee: b.assignee.clone(),
            product: b.product.clone(),
            changed: b.changed,
            comment_count: b.comments.len(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct NewBug {
    pub summary: String,
    pub description: String,
    pub defect_type: Option<String>,
    pub priority: Option<String>,
    pub status: Option<String>,
    pub resolution: Option<String>,
    pub product: Option<String>,
    pub component: Option<String>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
}

impl NewBug {
    /// Field defaults applied on create when a value is missing or blank.
    pub fn into_bug(self, id: Id, now: DateTime<Utc>) -> Bug {
        fn or(v: Option<String>, default: &str) -> String {
            v.filter(|s| !s.trim().is_empty()).unwrap_or_else(|| default.to_string())
        }
        Bug {
            id,
            summary: self.summary.trim().to_string(),
            description: self.description.trim().to_string(),
            defect_type: or(self.defect_type, "Functional"),
            priority: or(self.priority, "Medium"),
            status: or(self.status, "OPEN"),
            resolution: or(self.resolution, "Unresolved"),
            product: or(self.product, ""),
            component: or(self.component, ""),
            assignee: or(self.assignee, ""),
            reporter: or(self.reporter, ""),
            changed: now,
            comments: Vec::new(),
            attachments: Vec::new(),
        }
    }
}

/// Partial bug update. Comments and attachments are replaced wholesale.
#[derive(Debug, Clone, Default)]
pub struct UpdateBug {
    pub comments: Option<Vec<Comment>>,
    pub attachments: Option<Vec<Attachment>>,
    pub status: Option<String>,
    /// Compare-and-swap guards: the update is rejected with a conflict unless
    /// the stored bug still holds exactly this many comments / attachments.
    /// Neither list ever shrinks, so each length works as a version.
    pub expected_comment_count: Option<usize>,
    pub expected_attachment_count: Option<usize>,
}

// -------------------------------------------------------------- access ---

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Role {
    pub id: Id,
    pub role_name: String,
    pub description: Option<String>,
    /// Super roles hold every module and permission and cannot be edited.
    pub is_super: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewRole {
    pub role_name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub is_super: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Permission {
    pub id: Id,
    pub permission_name: String,
    pub permission_code: String,
    pub module: String,
    pub action: String,
    pub resource: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPermission {
    pub permission_name: String,
    pub permission_code: String,
    pub module: String,
    pub action: String,
    pub resource: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Module {
    pub id: Id,
    pub module_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct RolePermission {
    pub role_id: Id,
    pub permission_id: Id,
    pub is_active: bool,
    pub granted_at: DateTime<Utc>,
}
