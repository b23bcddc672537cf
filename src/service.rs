//! Workflows that combine the pure engines with repository round-trips.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::access::{self, EffectiveAccess, PermissionDiff, RoleAccessView};
use crate::attachments;
use crate::error::ApiError;
use crate::models::*;
use crate::repo::{AssignmentRepo, BugRepo, CatalogRepo, Repo, RepoError, RoleRepo};
use crate::thread::{self, ReplyTarget, ThreadView};

/// Modules every installation starts with.
pub const DEFAULT_MODULES: &[&str] = &["Users", "Bugs", "Reports", "Projects", "Settings", "Analytics", "System", "Other"];

/// Permission required for role and permission administration.
pub const MANAGE_ROLES: &str = "roles.manage";

/// Create the default modules and the Admin super role when missing.
pub async fn bootstrap_catalog(repo: &dyn Repo) -> Result<(), RepoError> {
    let existing: HashSet<String> = repo.list_modules().await?.into_iter().map(|m| m.module_name).collect();
    for name in DEFAULT_MODULES.iter().filter(|n| !existing.contains(**n)) {
        repo.create_module(name).await?;
    }
    match repo.find_role_by_name("Admin").await {
        Ok(_) => {}
        Err(RepoError::NotFound) => {
            repo.create_role(NewRole { role_name: "Admin".into(), description: Some("Full access".into()), is_super: true }).await?;
            tracing::info!("created Admin super role");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

async fn assigned_ids(repo: &dyn Repo, role_id: Id) -> Result<HashSet<Id>, RepoError> {
    Ok(repo.list_role_permissions(role_id).await?.into_iter().map(|rp| rp.permission_id).collect())
}

// --------------------------------------------------------------- access ---

pub async fn effective_access(repo: &dyn Repo, role: &Role) -> Result<EffectiveAccess, RepoError> {
    let catalog = repo.list_permissions().await?;
    let modules = repo.list_modules().await?;
    let assigned = assigned_ids(repo, role.id).await?;
    let assigned_modules = repo.list_role_modules(role.id).await?;
    Ok(EffectiveAccess::resolve(role, &catalog, &assigned, &modules, &assigned_modules))
}

/// Resolve the caller's role (from token claims) into grants.
pub async fn effective_access_for_role_name(repo: &dyn Repo, role_name: &str) -> Result<EffectiveAccess, ApiError> {
    let role = repo.find_role_by_name(role_name).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::Forbidden(format!("unknown role '{role_name}'")),
        other => other.into(),
    })?;
    Ok(effective_access(repo, &role).await?)
}

pub async fn role_access(repo: &dyn Repo, role_id: Id) -> Result<RoleAccessView, RepoError> {
    let role = repo.get_role(role_id).await?;
    let catalog = repo.list_permissions().await?;
    let modules = repo.list_modules().await?;
    let assigned = assigned_ids(repo, role_id).await?;
    let assigned_modules = repo.list_role_modules(role_id).await?;
    Ok(RoleAccessView::build(&role, &catalog, &assigned, &modules, &assigned_modules))
}

/// Effective permissions of a role, grouped by module.
pub async fn role_permissions_grouped(repo: &dyn Repo, role_id: Id) -> Result<BTreeMap<String, Vec<Permission>>, RepoError> {
    let role = repo.get_role(role_id).await?;
    let catalog = repo.list_permissions().await?;
    let assigned = assigned_ids(repo, role_id).await?;
    let ids: HashSet<Id> = access::effective_permissions(&role, &catalog, &assigned).into_values().flatten().collect();
    let granted: Vec<Permission> = catalog.into_iter().filter(|p| ids.contains(&p.id)).collect();
    Ok(access::group_by_module(&granted))
}

/// Result of a toggle: the writes issued and the refetched assignment set.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ToggleOutcome {
    pub applied: PermissionDiff,
    pub assigned: Vec<Id>,
}

async fn apply_diff(repo: &dyn Repo, role_id: Id, diff: PermissionDiff) -> Result<ToggleOutcome, ApiError> {
    if !diff.is_empty() {
        repo.apply_permission_changes(role_id, &diff.grant, &diff.revoke).await?;
        metrics::counter!("tracker_permission_writes_total", diff.len() as u64);
        tracing::info!(role_id, granted = diff.grant.len(), revoked = diff.revoke.len(), "role permissions updated");
    }
    // read back server state rather than merging the diff locally
    let mut assigned: Vec<Id> = assigned_ids(repo, role_id).await?.into_iter().collect();
    assigned.sort_unstable();
    Ok(ToggleOutcome { applied: diff, assigned })
}

pub async fn toggle_role_permission(
    repo: &dyn Repo,
    role_id: Id,
    permission_id: Id,
    currently_assigned: bool,
) -> Result<ToggleOutcome, ApiError> {
    let role = repo.get_role(role_id).await?;
    let diff = access::plan_permission_toggle(&role, permission_id, currently_assigned)?;
    apply_diff(repo, role_id, diff).await
}

/// Switch every permission of `module` on or off for a role.
///
/// The whole plan is applied in one atomic repository call; an already
/// converged role issues no write at all.
pub async fn toggle_module_permissions(
    repo: &dyn Repo,
    role_id: Id,
    module: &str,
    desired_on: bool,
) -> Result<ToggleOutcome, ApiError> {
    let role = repo.get_role(role_id).await?;
    let catalog = repo.list_permissions().await?;
    let assigned = assigned_ids(repo, role_id).await?;
    let diff = access::plan_module_toggle(&role, &catalog, module, desired_on, &assigned)?;
    apply_diff(repo, role_id, diff).await
}

/// Flip one module's access by replacing the role's whole module set.
pub async fn toggle_module_access(
    repo: &dyn Repo,
    role_id: Id,
    module: &str,
    currently_granted: bool,
) -> Result<Vec<String>, ApiError> {
    let role = repo.get_role(role_id).await?;
    if !repo.list_modules().await?.iter().any(|m| m.module_name == module) {
        return Err(access::AccessError::UnknownModule(module.to_string()).into());
    }
    let current = repo.list_role_modules(role_id).await?;
    let next = access::toggled_module_set(&role, &current, module, currently_granted)?;
    replace_modules(repo, &role, &next).await
}

pub async fn replace_modules(repo: &dyn Repo, role: &Role, modules: &[String]) -> Result<Vec<String>, ApiError> {
    if role.is_super {
        return Err(access::AccessError::SuperRoleLocked(role.role_name.clone()).into());
    }
    let known: HashSet<String> = repo.list_modules().await?.into_iter().map(|m| m.module_name).collect();
    if let Some(unknown) = modules.iter().find(|m| !known.contains(*m)) {
        return Err(access::AccessError::UnknownModule(unknown.clone()).into());
    }
    repo.replace_role_modules(role.id, modules).await?;
    metrics::increment_counter!("tracker_module_replacements_total");
    Ok(repo.list_role_modules(role.id).await?)
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModulePermissionCount {
    pub module: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RolePermissionCount {
    pub role_name: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecentAssignment {
    pub role_name: String,
    pub permission_name: String,
    pub granted_at: chrono::DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PermissionsDashboard {
    pub total_permissions: usize,
    pub total_roles: usize,
    pub permissions_by_module: Vec<ModulePermissionCount>,
    pub role_permission_counts: Vec<RolePermissionCount>,
    pub recent_assignments: Vec<RecentAssignment>,
}

const RECENT_ASSIGNMENTS: usize = 10;

/// Summary counts for the permissions admin landing page.
pub async fn permissions_dashboard(repo: &dyn Repo) -> Result<PermissionsDashboard, RepoError> {
    let catalog = repo.list_permissions().await?;
    let roles = repo.list_roles().await?;
    let names: BTreeMap<Id, &str> = catalog.iter().map(|p| (p.id, p.permission_name.as_str())).collect();

    let mut role_permission_counts = Vec::with_capacity(roles.len());
    let mut recent = Vec::new();
    for role in &roles {
        let rows = repo.list_role_permissions(role.id).await?;
        role_permission_counts.push(RolePermissionCount { role_name: role.role_name.clone(), count: rows.len() });
        recent.extend(rows.into_iter().map(|rp| RecentAssignment {
            role_name: role.role_name.clone(),
            permission_name: names.get(&rp.permission_id).copied().unwrap_or_default().to_string(),
            granted_at: rp.granted_at,
        }));
    }
    recent.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
    recent.truncate(RECENT_ASSIGNMENTS);

    Ok(PermissionsDashboard {
        total_permissions: catalog.len(),
        total_roles: roles.len(),
        permissions_by_module: access::group_by_module(&catalog)
            .into_iter()
            .map(|(module, perms)| ModulePermissionCount { module, count: perms.len() })
            .collect(),
        role_permission_counts,
        recent_assignments: recent,
    })
}

// ----------------------------------------------------------------- bugs ---

pub fn validate_new_bug(new: &NewBug) -> Result<(), ApiError> {
    let mut missing = Vec::new();
    if new.summary.trim().is_empty() { missing.push("summary"); }
    if new.description.trim().is_empty() { missing.push("description"); }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("missing fields: {}", missing.join(", "))))
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BugDetail {
    pub bug: Bug,
    pub thread: ThreadView,
}

/// Give legacy comments ids and legacy attachments their positional owner.
/// Must run before anything is spliced into the thread, since splicing
/// shifts the positions the pairing is derived from. Returns whether
/// anything changed.
fn migrate_legacy_thread(bug: &mut Bug) -> bool {
    let ids = thread::ensure_comment_ids(&mut bug.comments);
    let owners = attachments::assign_positional_owners(&bug.comments, &mut bug.attachments);
    if ids + owners > 0 {
        tracing::info!(bug_id = bug.id, ids, owners, "migrating legacy thread data");
    }
    ids + owners > 0
}

/// CAS guards matching the bug as it was loaded.
fn guarded_update(loaded: &Bug) -> UpdateBug {
    UpdateBug {
        expected_comment_count: Some(loaded.comments.len()),
        expected_attachment_count: Some(loaded.attachments.len()),
        ..Default::default()
    }
}

fn concurrent_write(e: RepoError) -> ApiError {
    match e {
        RepoError::Conflict => ApiError::Conflict("bug was modified concurrently; reload and retry".into()),
        other => other.into(),
    }
}

/// Load a bug for display, migrating legacy thread data on first read.
///
/// The migrated bug is written back only when something changed. Missing
/// attachment URLs are filled from `storage_base` for the response only.
pub async fn bug_thread(repo: &dyn Repo, bug_id: Id, storage_base: Option<&str>) -> Result<BugDetail, ApiError> {
    let mut bug = repo.get_bug(bug_id).await?;
    let guard = guarded_update(&bug);
    if migrate_legacy_thread(&mut bug) {
        let upd = UpdateBug {
            comments: Some(bug.comments.clone()),
            attachments: Some(bug.attachments.clone()),
            ..guard
        };
        match repo.update_bug(bug_id, upd).await {
            Ok(saved) => bug = saved,
            // someone else wrote first; render what we have, migrate next time
            Err(RepoError::Conflict) => tracing::warn!(bug_id, "thread migration lost a race"),
            Err(e) => return Err(e.into()),
        }
    }
    if let Some(base) = storage_base {
        attachments::fill_urls(&mut bug.attachments, base);
    }
    let thread = ThreadView::build(&bug.comments, &bug.attachments);
    Ok(BugDetail { bug, thread })
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ReplyRequest {
    pub target: ReplyTarget,
    pub text: String,
}

/// Add a reply and persist the whole thread, guarded against concurrent writers.
pub async fn submit_bug_reply(repo: &dyn Repo, bug_id: Id, req: ReplyRequest, author: &str) -> Result<Bug, ApiError> {
    if req.text.trim().is_empty() {
        return Err(thread::ThreadError::EmptyText.into());
    }
    let mut bug = repo.get_bug(bug_id).await?;
    let guard = guarded_update(&bug);
    // pin legacy attachment pairing before the splice shifts positions
    migrate_legacy_thread(&mut bug);
    let submitted = thread::submit_reply(&bug.comments, req.target, &req.text, author, Utc::now())?;
    let upd = UpdateBug {
        comments: Some(submitted.comments),
        attachments: Some(bug.attachments),
        ..guard
    };
    let saved = repo.update_bug(bug_id, upd).await.map_err(concurrent_write)?;
    metrics::increment_counter!("tracker_replies_total");
    Ok(saved)
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct NewAttachment {
    pub filename: String,
    pub url: Option<String>,
    pub path: Option<String>,
    /// Index of the comment the file belongs to; absent for the description.
    pub comment_index: Option<usize>,
}

/// Register uploaded-file metadata against a bug.
pub async fn add_attachment(repo: &dyn Repo, bug_id: Id, new: NewAttachment) -> Result<Attachment, ApiError> {
    if new.filename.trim().is_empty() {
        return Err(ApiError::BadRequest("filename must not be empty".into()));
    }
    let mut bug = repo.get_bug(bug_id).await?;
    let guard = guarded_update(&bug);
    migrate_legacy_thread(&mut bug);
    let owner = match new.comment_index {
        None => AttachmentOwner::Description,
        Some(i) => match bug.comments.get(i).and_then(|c| c.id) {
            Some(id) => AttachmentOwner::Comment { id },
            None => return Err(ApiError::BadRequest(format!("no comment at index {i}"))),
        },
    };
    let file = Attachment {
        filename: attachments::sanitize_filename(&new.filename),
        url: new.url.filter(|u| !u.is_empty()),
        path: new.path.filter(|p| !p.is_empty()),
        owner: Some(owner),
    };
    let mut files = bug.attachments;
    files.push(file.clone());
    let upd = UpdateBug {
        comments: Some(bug.comments),
        attachments: Some(files),
        ..guard
    };
    repo.update_bug(bug_id, upd).await.map_err(concurrent_write)?;
    Ok(file)
}
