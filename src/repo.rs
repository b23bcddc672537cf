use async_trait::async_trait;

use crate::models::*;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[async_trait]
pub trait BugRepo: Send + Sync {
    async fn list_bugs(&self) -> RepoResult<Vec<Bug>>;
    async fn get_bug(&self, id: Id) -> RepoResult<Bug>;
    async fn create_bug(&self, new: NewBug) -> RepoResult<Bug>;
    async fn update_bug(&self, id: Id, upd: UpdateBug) -> RepoResult<Bug>;
}

#[async_trait]
pub trait CatalogRepo: Send + Sync {
    async fn list_permissions(&self) -> RepoResult<Vec<Permission>>;
    async fn create_permission(&self, new: NewPermission) -> RepoResult<Permission>;
    async fn list_modules(&self) -> RepoResult<Vec<Module>>;
    async fn create_module(&self, module_name: &str) -> RepoResult<Module>;
}

#[async_trait]
pub trait RoleRepo: Send + Sync {
    async fn list_roles(&self) -> RepoResult<Vec<Role>>;
    async fn get_role(&self, id: Id) -> RepoResult<Role>;
    /// Case-insensitive lookup.
    async fn find_role_by_name(&self, name: &str) -> RepoResult<Role>;
    async fn create_role(&self, new: NewRole) -> RepoResult<Role>;
}

#[async_trait]
pub trait AssignmentRepo: Send + Sync {
    /// Active role↔permission rows for a role.
    async fn list_role_permissions(&self, role_id: Id) -> RepoResult<Vec<RolePermission>>;
    async fn assign_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()>;
    async fn revoke_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()>;
    /// Apply a batch of grants and revokes all-or-nothing.
    async fn apply_permission_changes(&self, role_id: Id, grant: &[Id], revoke: &[Id]) -> RepoResult<()>;
    async fn list_role_modules(&self, role_id: Id) -> RepoResult<Vec<String>>;
    /// Replace the role's whole module set in one step.
    async fn replace_role_modules(&self, role_id: Id, modules: &[String]) -> RepoResult<()>;
}

pub trait Repo: BugRepo + CatalogRepo + RoleRepo + AssignmentRepo {}

impl<T> Repo for T where T: BugRepo + CatalogRepo + RoleRepo + AssignmentRepo {}

/// Shared by both backends: does `upd` still apply to a bug holding
/// `comments` comments and `attachments` attachments?
fn check_thread_guard(comments: usize, attachments: usize, upd: &UpdateBug) -> RepoResult<()> {
    if let Some(expected) = upd.expected_comment_count.filter(|e| *e != comments) {
        tracing::warn!(expected, current = comments, "comment thread changed underneath update");
        return Err(RepoError::Conflict);
    }
    if let Some(expected) = upd.expected_attachment_count.filter(|e| *e != attachments) {
        tracing::warn!(expected, current = attachments, "attachment list changed underneath update");
        return Err(RepoError::Conflict);
    }
    Ok(())
}

#[cfg(feature = "inmem-store")]
pub mod inmem {
    use super::*;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::collections::{BTreeMap, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

    const SNAPSHOT_PATH: &str = "data/state.json";

    #[derive(Default, Serialize, Deserialize)]
    struct State {
        bugs: BTreeMap<Id, Bug>,
        permissions: BTreeMap<Id, Permission>,
        modules: BTreeMap<Id, Module>,
        roles: BTreeMap<Id, Role>,
        role_permissions: Vec<RolePermission>,
        role_modules: HashMap<Id, Vec<String>>,
        next_id: Id,
    }

    impl State {
        fn next_id(&mut self) -> Id {
            self.next_id += 1;
            self.next_id
        }

        fn require_role(&self, role_id: Id) -> RepoResult<()> {
            if self.roles.contains_key(&role_id) { Ok(()) } else { Err(RepoError::NotFound) }
        }

        fn grant(&mut self, role_id: Id, permission_id: Id) {
            match self.role_permissions.iter_mut().find(|rp| rp.role_id == role_id && rp.permission_id == permission_id) {
                Some(rp) if rp.is_active => {}
                Some(rp) => { rp.is_active = true; rp.granted_at = Utc::now(); }
                None => self.role_permissions.push(RolePermission {
                    role_id, permission_id, is_active: true, granted_at: Utc::now(),
                }),
            }
        }

        fn revoke(&mut self, role_id: Id, permission_id: Id) {
            self.role_permissions.retain(|rp| !(rp.role_id == role_id && rp.permission_id == permission_id));
        }
    }

    /// JSON-snapshot backed store. Each write is applied under a single write
    /// lock, so multi-row operations are atomic to readers.
    #[derive(Clone)]
    pub struct InMemRepo {
        state: Arc<RwLock<State>>,
        snapshot_path: Arc<PathBuf>,
    }

    impl InMemRepo {
        fn data_dir() -> PathBuf {
            std::env::var("TRACKER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data"))
        }

        fn snapshot_path() -> PathBuf {
            if std::env::var("TRACKER_DATA_DIR").is_ok() {
                Self::data_dir().join("state.json")
            } else {
                PathBuf::from(SNAPSHOT_PATH)
            }
        }

        fn load_state_from(path: &Path) -> State {
            match std::fs::read(path) {
                Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                    Ok(s) => {
                        tracing::info!(path = %path.display(), "loaded snapshot");
                        s
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "failed to parse snapshot: {e}; starting empty");
                        State::default()
                    }
                },
                Err(e) => {
                    tracing::info!(path = %path.display(), "no snapshot ({e}); starting empty");
                    State::default()
                }
            }
        }

        pub fn new() -> Self {
            let snapshot_path = Self::snapshot_path();
            let state = Self::load_state_from(&snapshot_path);
            Self {
                state: Arc::new(RwLock::new(state)),
                snapshot_path: Arc::new(snapshot_path),
            }
        }

        fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
            self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
            self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
        }

        fn persist(&self) {
            let path = self.snapshot_path.as_ref();
            let bytes = match self.read().map(|s| serde_json::to_vec_pretty(&*s)) {
                Ok(Ok(b)) => b,
                Ok(Err(e)) => { tracing::error!("failed to encode snapshot: {e}"); return; }
                Err(e) => { tracing::error!("failed to read state for snapshot: {e}"); return; }
            };
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::write(path, bytes) {
                tracing::error!(path = %path.display(), "failed to write snapshot: {e}");
            }
        }
    }

    impl Default for InMemRepo {
        fn default() -> Self { Self::new() }
    }

    #[async_trait]
    impl BugRepo for InMemRepo {
        async fn list_bugs(&self) -> RepoResult<Vec<Bug>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.bugs.values().cloned().collect();
            v.sort_by(|a, b| b.changed.cmp(&a.changed));   // latest first
            Ok(v)
        }
        async fn get_bug(&self, id: Id) -> RepoResult<Bug> {
            let s = self.read()?;
            s.bugs.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn create_bug(&self, new: NewBug) -> RepoResult<Bug> {
            let mut s = self.write()?;
            let id = s.next_id();
            let bug = new.into_bug(id, Utc::now());
            s.bugs.insert(id, bug.clone());
            drop(s);                       // release lock before persisting
            self.persist();
            Ok(bug)
        }
        async fn update_bug(&self, id: Id, upd: UpdateBug) -> RepoResult<Bug> {
            let mut s = self.write()?;
            let bug = s.bugs.get_mut(&id).ok_or(RepoError::NotFound)?;
            check_thread_guard(bug.comments.len(), bug.attachments.len(), &upd)?;
            if let Some(c) = upd.comments { bug.comments = c; }
            if let Some(a) = upd.attachments { bug.attachments = a; }
            if let Some(st) = upd.status { bug.status = st; }
            bug.changed = Utc::now();
            let updated = bug.clone();
            drop(s);
            self.persist();
            Ok(updated)
        }
    }

    #[async_trait]
    impl CatalogRepo for InMemRepo {
        async fn list_permissions(&self) -> RepoResult<Vec<Permission>> {
            let s = self.read()?;
            let mut v: Vec<_> = s.permissions.values().cloned().collect();
            v.sort_by(|a, b| a.module.cmp(&b.module).then(a.id.cmp(&b.id)));
            Ok(v)
        }
        async fn create_permission(&self, new: NewPermission) -> RepoResult<Permission> {
            let mut s = self.write()?;
            if s.permissions.values().any(|p| p.permission_code == new.permission_code) {
                return Err(RepoError::Conflict);
            }
            let id = s.next_id();
            let p = Permission {
                id,
                permission_name: new.permission_name,
                permission_code: new.permission_code,
                module: new.module,
                action: new.action,
                resource: new.resource,
                description: new.description,
            };
            s.permissions.insert(id, p.clone());
            drop(s);
            self.persist();
            Ok(p)
        }
        async fn list_modules(&self) -> RepoResult<Vec<Module>> {
            let s = self.read()?;
            Ok(s.modules.values().cloned().collect())
        }
        async fn create_module(&self, module_name: &str) -> RepoResult<Module> {
            let mut s = self.write()?;
            if s.modules.values().any(|m| m.module_name == module_name) {
                return Err(RepoError::Conflict);
            }
            let id = s.next_id();
            let m = Module { id, module_name: module_name.to_string() };
            s.modules.insert(id, m.clone());
            drop(s);
            self.persist();
            Ok(m)
        }
    }

    #[async_trait]
    impl RoleRepo for InMemRepo {
        async fn list_roles(&self) -> RepoResult<Vec<Role>> {
            let s = self.read()?;
            Ok(s.roles.values().cloned().collect())
        }
        async fn get_role(&self, id: Id) -> RepoResult<Role> {
            let s = self.read()?;
            s.roles.get(&id).cloned().ok_or(RepoError::NotFound)
        }
        async fn find_role_by_name(&self, name: &str) -> RepoResult<Role> {
            let s = self.read()?;
            s.roles
                .values()
                .find(|r| r.role_name.eq_ignore_ascii_case(name.trim()))
                .cloned()
                .ok_or(RepoError::NotFound)
        }
        async fn create_role(&self, new: NewRole) -> RepoResult<Role> {
            let mut s = self.write()?;
            if s.roles.values().any(|r| r.role_name.eq_ignore_ascii_case(new.role_name.trim())) {
                return Err(RepoError::Conflict);
            }
            let id = s.next_id();
            let role = Role {
                id,
                is_super: new.is_super || crate::access::is_super_role_name(&new.role_name),
                role_name: new.role_name.trim().to_string(),
                description: new.description,
                created_at: Utc::now(),
            };
            s.roles.insert(id, role.clone());
            drop(s);
            self.persist();
            Ok(role)
        }
    }

    #[async_trait]
    impl AssignmentRepo for InMemRepo {
        async fn list_role_permissions(&self, role_id: Id) -> RepoResult<Vec<RolePermission>> {
            let s = self.read()?;
            s.require_role(role_id)?;
            Ok(s.role_permissions.iter().filter(|rp| rp.role_id == role_id && rp.is_active).cloned().collect())
        }
        async fn assign_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()> {
            self.apply_permission_changes(role_id, &[permission_id], &[]).await
        }
        async fn revoke_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()> {
            self.apply_permission_changes(role_id, &[], &[permission_id]).await
        }
        async fn apply_permission_changes(&self, role_id: Id, grant: &[Id], revoke: &[Id]) -> RepoResult<()> {
            let mut s = self.write()?;
            s.require_role(role_id)?;
            // validate the whole batch before touching anything
            if let Some(missing) = grant.iter().chain(revoke).find(|id| !s.permissions.contains_key(*id)) {
                tracing::warn!(role_id, permission_id = missing, "permission batch references unknown permission");
                return Err(RepoError::NotFound);
            }
            for id in grant { s.grant(role_id, *id); }
            for id in revoke { s.revoke(role_id, *id); }
            drop(s);
            self.persist();
            Ok(())
        }
        async fn list_role_modules(&self, role_id: Id) -> RepoResult<Vec<String>> {
            let s = self.read()?;
            s.require_role(role_id)?;
            Ok(s.role_modules.get(&role_id).cloned().unwrap_or_default())
        }
        async fn replace_role_modules(&self, role_id: Id, modules: &[String]) -> RepoResult<()> {
            let mut s = self.write()?;
            s.require_role(role_id)?;
            let mut next: Vec<String> = Vec::with_capacity(modules.len());
            for m in modules {
                if !next.contains(m) { next.push(m.clone()); }
            }
            s.role_modules.insert(role_id, next);
            drop(s);
            self.persist();
            Ok(())
        }
    }
}

// Postgres implementation (feature = "postgres-store")
#[cfg(feature = "postgres-store")]
pub mod pg {
    use super::*;
    use chrono::{DateTime, Utc};
    use sqlx::types::Json;
    use sqlx::{Pool, Postgres};

    #[derive(Clone)]
    pub struct PgRepo { pool: Pool<Postgres> }

    impl PgRepo {
        pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    }

    fn db_err(e: sqlx::Error) -> RepoError {
        match e {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(ref d) if d.is_unique_violation() => RepoError::Conflict,
            sqlx::Error::Database(ref d) if d.is_foreign_key_violation() => RepoError::NotFound,
            other => {
                tracing::error!("database error: {other}");
                RepoError::Internal(other.to_string())
            }
        }
    }

    #[derive(sqlx::FromRow)]
    struct BugRow {
        id: Id,
        summary: String,
        description: String,
        defect_type: String,
        priority: String,
        status: String,
        resolution: String,
        product: String,
        component: String,
        assignee: String,
        reporter: String,
        changed: DateTime<Utc>,
        comments: Json<Vec<Comment>>,
        attachments: Json<Vec<Attachment>>,
    }

    impl From<BugRow> for Bug {
        fn from(r: BugRow) -> Self {
            Bug {
                id: r.id,
                summary: r.summary,
                description: r.description,
                defect_type: r.defect_type,
                priority: r.priority,
                status: r.status,
                resolution: r.resolution,
                product: r.product,
                component: r.component,
                assignee: r.assignee,
                reporter: r.reporter,
                changed: r.changed,
                comments: r.comments.0,
                attachments: r.attachments.0,
            }
        }
    }

    const BUG_COLUMNS: &str = "id, summary, description, defect_type, priority, status, resolution, \
        product, component, assignee, reporter, changed, comments, attachments";
    const ROLE_COLUMNS: &str = "id, role_name, description, is_super, created_at";
    const PERMISSION_COLUMNS: &str = "id, permission_name, permission_code, module, action, resource, description";

    #[async_trait]
    impl BugRepo for PgRepo {
        async fn list_bugs(&self) -> RepoResult<Vec<Bug>> {
            let rows = sqlx::query_as::<_, BugRow>(&format!("SELECT {BUG_COLUMNS} FROM bugs ORDER BY changed DESC"))
                .fetch_all(&self.pool).await.map_err(db_err)?;
            Ok(rows.into_iter().map(Bug::from).collect())
        }
        async fn get_bug(&self, id: Id) -> RepoResult<Bug> {
            let row = sqlx::query_as::<_, BugRow>(&format!("SELECT {BUG_COLUMNS} FROM bugs WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn create_bug(&self, new: NewBug) -> RepoResult<Bug> {
            // id comes from the sequence; 0 is a placeholder for the defaults helper
            let b = new.into_bug(0, Utc::now());
            let row = sqlx::query_as::<_, BugRow>(&format!(
                "INSERT INTO bugs (summary, description, defect_type, priority, status, resolution, \
                 product, component, assignee, reporter, changed, comments, attachments) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,'[]'::jsonb,'[]'::jsonb) RETURNING {BUG_COLUMNS}"
            ))
            .bind(&b.summary).bind(&b.description).bind(&b.defect_type).bind(&b.priority)
            .bind(&b.status).bind(&b.resolution).bind(&b.product).bind(&b.component)
            .bind(&b.assignee).bind(&b.reporter).bind(b.changed)
            .fetch_one(&self.pool).await.map_err(db_err)?;
            Ok(row.into())
        }
        async fn update_bug(&self, id: Id, upd: UpdateBug) -> RepoResult<Bug> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let (comments, attachments): (i32, i32) = sqlx::query_as(
                "SELECT jsonb_array_length(comments), jsonb_array_length(attachments) FROM bugs WHERE id = $1 FOR UPDATE"
            )
            .bind(id)
            .fetch_one(&mut *tx).await.map_err(db_err)?;
            check_thread_guard(comments as usize, attachments as usize, &upd)?;
            let row = sqlx::query_as::<_, BugRow>(&format!(
                "UPDATE bugs SET comments = COALESCE($2, comments), attachments = COALESCE($3, attachments), \
                 status = COALESCE($4, status), changed = now() WHERE id = $1 RETURNING {BUG_COLUMNS}"
            ))
            .bind(id)
            .bind(upd.comments.map(Json))
            .bind(upd.attachments.map(Json))
            .bind(upd.status)
            .fetch_one(&mut *tx).await.map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            Ok(row.into())
        }
    }

    #[async_trait]
    impl CatalogRepo for PgRepo {
        async fn list_permissions(&self) -> RepoResult<Vec<Permission>> {
            sqlx::query_as::<_, Permission>(&format!("SELECT {PERMISSION_COLUMNS} FROM permissions ORDER BY module, id"))
                .fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn create_permission(&self, new: NewPermission) -> RepoResult<Permission> {
            sqlx::query_as::<_, Permission>(&format!(
                "INSERT INTO permissions (permission_name, permission_code, module, action, resource, description) \
                 VALUES ($1,$2,$3,$4,$5,$6) RETURNING {PERMISSION_COLUMNS}"
            ))
            .bind(&new.permission_name).bind(&new.permission_code).bind(&new.module)
            .bind(&new.action).bind(&new.resource).bind(&new.description)
            .fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn list_modules(&self) -> RepoResult<Vec<Module>> {
            sqlx::query_as::<_, Module>("SELECT id, module_name FROM modules ORDER BY id")
                .fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn create_module(&self, module_name: &str) -> RepoResult<Module> {
            sqlx::query_as::<_, Module>("INSERT INTO modules (module_name) VALUES ($1) RETURNING id, module_name")
                .bind(module_name)
                .fetch_one(&self.pool).await.map_err(db_err)
        }
    }

    #[async_trait]
    impl RoleRepo for PgRepo {
        async fn list_roles(&self) -> RepoResult<Vec<Role>> {
            sqlx::query_as::<_, Role>(&format!("SELECT {ROLE_COLUMNS} FROM roles ORDER BY id"))
                .fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn get_role(&self, id: Id) -> RepoResult<Role> {
            sqlx::query_as::<_, Role>(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = $1"))
                .bind(id)
                .fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn find_role_by_name(&self, name: &str) -> RepoResult<Role> {
            sqlx::query_as::<_, Role>(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE lower(role_name) = lower($1)"))
                .bind(name.trim())
                .fetch_one(&self.pool).await.map_err(db_err)
        }
        async fn create_role(&self, new: NewRole) -> RepoResult<Role> {
            let is_super = new.is_super || crate::access::is_super_role_name(&new.role_name);
            sqlx::query_as::<_, Role>(&format!(
                "INSERT INTO roles (role_name, description, is_super) VALUES ($1,$2,$3) RETURNING {ROLE_COLUMNS}"
            ))
            .bind(new.role_name.trim()).bind(&new.description).bind(is_super)
            .fetch_one(&self.pool).await.map_err(db_err)
        }
    }

    #[async_trait]
    impl AssignmentRepo for PgRepo {
        async fn list_role_permissions(&self, role_id: Id) -> RepoResult<Vec<RolePermission>> {
            sqlx::query_as::<_, RolePermission>(
                "SELECT role_id, permission_id, is_active, granted_at FROM role_permissions \
                 WHERE role_id = $1 AND is_active ORDER BY permission_id"
            )
            .bind(role_id)
            .fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn assign_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()> {
            self.apply_permission_changes(role_id, &[permission_id], &[]).await
        }
        async fn revoke_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()> {
            self.apply_permission_changes(role_id, &[], &[permission_id]).await
        }
        async fn apply_permission_changes(&self, role_id: Id, grant: &[Id], revoke: &[Id]) -> RepoResult<()> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            for permission_id in grant {
                sqlx::query(
                    "INSERT INTO role_permissions (role_id, permission_id, is_active) VALUES ($1,$2,TRUE) \
                     ON CONFLICT (role_id, permission_id) DO UPDATE SET is_active = TRUE, granted_at = now()"
                )
                .bind(role_id).bind(permission_id)
                .execute(&mut *tx).await.map_err(db_err)?;
            }
            if !revoke.is_empty() {
                sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = ANY($2)")
                    .bind(role_id).bind(revoke)
                    .execute(&mut *tx).await.map_err(db_err)?;
            }
            tx.commit().await.map_err(db_err)
        }
        async fn list_role_modules(&self, role_id: Id) -> RepoResult<Vec<String>> {
            sqlx::query_scalar("SELECT module_name FROM role_modules WHERE role_id = $1 ORDER BY module_name")
                .bind(role_id)
                .fetch_all(&self.pool).await.map_err(db_err)
        }
        async fn replace_role_modules(&self, role_id: Id, modules: &[String]) -> RepoResult<()> {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            sqlx::query("DELETE FROM role_modules WHERE role_id = $1")
                .bind(role_id)
                .execute(&mut *tx).await.map_err(db_err)?;
            sqlx::query(
                "INSERT INTO role_modules (role_id, module_name) SELECT $1, unnest($2::text[]) ON CONFLICT DO NOTHING"
            )
            .bind(role_id).bind(modules)
            .execute(&mut *tx).await.map_err(db_err)?;
            tx.commit().await.map_err(db_err)
        }
    }
}
