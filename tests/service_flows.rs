#![cfg(feature = "inmem-store")]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serial_test::serial;
use tracker::error::ApiError;
use tracker::models::*;
use tracker::repo::inmem::InMemRepo;
use tracker::repo::{AssignmentRepo, BugRepo, CatalogRepo, RepoError, RepoResult, RoleRepo};
use tracker::service::{self, NewAttachment, ReplyRequest};
use tracker::thread::ReplyTarget;

/// Fresh repository persisting into its own temp dir.
fn repo() -> (InMemRepo, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("TRACKER_DATA_DIR", dir.path());
    (InMemRepo::new(), dir)
}

/// Records every permission write that reaches the store, and can hand out
/// an older copy of a bug to play the slower of two concurrent writers.
#[derive(Clone)]
struct CountingRepo {
    inner: InMemRepo,
    writes: Arc<Mutex<Vec<(Vec<Id>, Vec<Id>)>>>,
    stale_bug: Arc<Mutex<Option<Bug>>>,
}

impl CountingRepo {
    fn new(inner: InMemRepo) -> Self {
        Self { inner, writes: Arc::default(), stale_bug: Arc::default() }
    }
    fn writes(&self) -> Vec<(Vec<Id>, Vec<Id>)> {
        self.writes.lock().unwrap().clone()
    }
    fn serve_stale(&self, bug: Bug) {
        *self.stale_bug.lock().unwrap() = Some(bug);
    }
}

#[async_trait]
impl BugRepo for CountingRepo {
    async fn list_bugs(&self) -> RepoResult<Vec<Bug>> { self.inner.list_bugs().await }
    async fn get_bug(&self, id: Id) -> RepoResult<Bug> {
        let stale = self.stale_bug.lock().unwrap().clone();
        match stale {
            Some(b) if b.id == id => Ok(b),
            _ => self.inner.get_bug(id).await,
        }
    }
    async fn create_bug(&self, new: NewBug) -> RepoResult<Bug> { self.inner.create_bug(new).await }
    async fn update_bug(&self, id: Id, upd: UpdateBug) -> RepoResult<Bug> { self.inner.update_bug(id, upd).await }
}

#[async_trait]
impl CatalogRepo for CountingRepo {
    async fn list_permissions(&self) -> RepoResult<Vec<Permission>> { self.inner.list_permissions().await }
    async fn create_permission(&self, new: NewPermission) -> RepoResult<Permission> { self.inner.create_permission(new).await }
    async fn list_modules(&self) -> RepoResult<Vec<Module>> { self.inner.list_modules().await }
    async fn create_module(&self, name: &str) -> RepoResult<Module> { self.inner.create_module(name).await }
}

#[async_trait]
impl RoleRepo for CountingRepo {
    async fn list_roles(&self) -> RepoResult<Vec<Role>> { self.inner.list_roles().await }
    async fn get_role(&self, id: Id) -> RepoResult<Role> { self.inner.get_role(id).await }
    async fn find_role_by_name(&self, name: &str) -> RepoResult<Role> { self.inner.find_role_by_name(name).await }
    async fn create_role(&self, new: NewRole) -> RepoResult<Role> { self.inner.create_role(new).await }
}

#[async_trait]
impl AssignmentRepo for CountingRepo {
    async fn list_role_permissions(&self, role_id: Id) -> RepoResult<Vec<RolePermission>> {
        self.inner.list_role_permissions(role_id).await
    }
    async fn assign_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()> {
        self.apply_permission_changes(role_id, &[permission_id], &[]).await
    }
    async fn revoke_permission(&self, role_id: Id, permission_id: Id) -> RepoResult<()> {
        self.apply_permission_changes(role_id, &[], &[permission_id]).await
    }
    async fn apply_permission_changes(&self, role_id: Id, grant: &[Id], revoke: &[Id]) -> RepoResult<()> {
        self.writes.lock().unwrap().push((grant.to_vec(), revoke.to_vec()));
        self.inner.apply_permission_changes(role_id, grant, revoke).await
    }
    async fn list_role_modules(&self, role_id: Id) -> RepoResult<Vec<String>> { self.inner.list_role_modules(role_id).await }
    async fn replace_role_modules(&self, role_id: Id, modules: &[String]) -> RepoResult<()> {
        self.inner.replace_role_modules(role_id, modules).await
    }
}

async fn bugs_catalog(r: &InMemRepo) -> (Id, Id, Id) {
    let mut ids = Vec::new();
    for action in ["read", "create", "delete"] {
        let p = r
            .create_permission(NewPermission {
                permission_name: format!("Bugs {action}"),
                permission_code: format!("bugs.{action}"),
                module: "Bugs".into(),
                action: action.into(),
                resource: None,
                description: None,
            })
            .await
            .unwrap();
        ids.push(p.id);
    }
    (ids[0], ids[1], ids[2])
}

fn new_role(name: &str) -> NewRole {
    NewRole { role_name: name.into(), description: None, is_super: false }
}

#[tokio::test]
#[serial]
async fn module_toggle_writes_only_the_missing_grants_once() {
    let (inner, _dir) = repo();
    let (read, create, delete) = bugs_catalog(&inner).await;
    let qa = inner.create_role(new_role("QA")).await.unwrap();
    inner.assign_permission(qa.id, read).await.unwrap();

    let r = CountingRepo::new(inner);
    let first = service::toggle_module_permissions(&r, qa.id, "Bugs", true).await.unwrap();
    assert_eq!(r.writes(), vec![(vec![create, delete], vec![])]);
    assert_eq!(first.assigned, vec![read, create, delete]);

    let second = service::toggle_module_permissions(&r, qa.id, "Bugs", true).await.unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.assigned, first.assigned);
    assert_eq!(r.writes().len(), 1, "converged toggle must not write");

    let off = service::toggle_module_permissions(&r, qa.id, "Bugs", false).await.unwrap();
    assert!(off.assigned.is_empty());
    assert_eq!(r.writes().len(), 2);
}

#[tokio::test]
#[serial]
async fn admin_role_is_locked() {
    let (r, _dir) = repo();
    bugs_catalog(&r).await;
    service::bootstrap_catalog(&r).await.unwrap();
    let admin = r.find_role_by_name("admin").await.unwrap();
    assert!(admin.is_super);

    let err = service::toggle_module_permissions(&r, admin.id, "Bugs", false).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
    let err = service::toggle_module_access(&r, admin.id, "Bugs", true).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));

    let access = service::effective_access(&r, &admin).await.unwrap();
    assert_eq!(access.permission_codes.len(), 3);
    assert!(access.has_module("Settings"));
    let view = service::role_access(&r, admin.id).await.unwrap();
    assert!(view.locked);
}

#[tokio::test]
#[serial]
async fn bootstrap_is_idempotent() {
    let (r, _dir) = repo();
    service::bootstrap_catalog(&r).await.unwrap();
    service::bootstrap_catalog(&r).await.unwrap();
    assert_eq!(r.list_modules().await.unwrap().len(), service::DEFAULT_MODULES.len());
    assert_eq!(r.list_roles().await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn module_access_toggle_replaces_whole_set() {
    let (r, _dir) = repo();
    service::bootstrap_catalog(&r).await.unwrap();
    let dev = r.create_role(new_role("DEV")).await.unwrap();

    let on = service::toggle_module_access(&r, dev.id, "Bugs", false).await.unwrap();
    assert_eq!(on, vec!["Bugs".to_string()]);
    let both = service::toggle_module_access(&r, dev.id, "Reports", false).await.unwrap();
    assert_eq!(both.len(), 2);
    let off = service::toggle_module_access(&r, dev.id, "Bugs", true).await.unwrap();
    assert_eq!(off, vec!["Reports".to_string()]);

    let err = service::toggle_module_access(&r, dev.id, "Nope", false).await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound));
}

fn bug(summary: &str) -> NewBug {
    NewBug { summary: summary.into(), description: "steps".into(), ..Default::default() }
}

#[tokio::test]
#[serial]
async fn reply_flow_and_stale_write_conflict() {
    let (r, _dir) = repo();
    let b = r.create_bug(bug("crash")).await.unwrap();
    assert_eq!(b.status, "OPEN");
    assert_eq!(b.priority, "Medium");

    let top = ReplyRequest { target: ReplyTarget::Comment { index: None }, text: "first".into() };
    let saved = service::submit_bug_reply(&r, b.id, top, "alice").await.unwrap();
    assert_eq!(saved.comments.len(), 1);

    let nested = ReplyRequest { target: ReplyTarget::Comment { index: Some(0) }, text: "answer".into() };
    let saved = service::submit_bug_reply(&r, b.id, nested, "").await.unwrap();
    assert_eq!(saved.comments[1].level, 1);
    assert_eq!(saved.comments[1].user, UNKNOWN_USER);
    assert_eq!(saved.comments[1].parent_id, saved.comments[0].id);

    // a writer holding the one-comment snapshot loses
    let stale = UpdateBug {
        comments: Some(vec![saved.comments[0].clone()]),
        expected_comment_count: Some(1),
        ..Default::default()
    };
    assert!(matches!(r.update_bug(b.id, stale).await, Err(RepoError::Conflict)));
    assert_eq!(r.get_bug(b.id).await.unwrap().comments.len(), 2);

    let empty = ReplyRequest { target: ReplyTarget::Comment { index: None }, text: "  ".into() };
    assert!(matches!(service::submit_bug_reply(&r, b.id, empty, "alice").await, Err(ApiError::BadRequest(_))));
}

#[tokio::test]
#[serial]
async fn legacy_thread_is_migrated_on_first_read() {
    let (r, _dir) = repo();
    let b = r.create_bug(bug("legacy")).await.unwrap();
    let legacy: Vec<Comment> = serde_json::from_value(serde_json::json!([
        {"text": "root", "user": "bob", "timestamp": "2024-01-01T00:00:00Z", "level": 0, "parentType": "comment"},
        {"text": "child", "timestamp": "2024-01-02T00:00:00Z", "level": 1, "parentIndex": 0, "isReply": true}
    ]))
    .unwrap();
    let files: Vec<Attachment> = ["d.png", "r.png", "c.png"]
        .iter()
        .map(|f| Attachment { filename: f.to_string(), url: None, path: Some(format!("bugs/{f}")), owner: None })
        .collect();
    r.update_bug(b.id, UpdateBug { comments: Some(legacy), attachments: Some(files), ..Default::default() })
        .await
        .unwrap();

    let detail = service::bug_thread(&r, b.id, None).await.unwrap();
    assert_eq!(detail.thread.comments.len(), 1);
    let root = &detail.thread.comments[0];
    assert_eq!(root.attachment.as_ref().map(|a| a.filename.as_str()), Some("r.png"));
    assert_eq!(root.children[0].attachment.as_ref().map(|a| a.filename.as_str()), Some("c.png"));
    assert_eq!(detail.thread.description_attachment.as_ref().map(|a| a.filename.as_str()), Some("d.png"));

    let stored = r.get_bug(b.id).await.unwrap();
    assert!(stored.comments.iter().all(|c| c.id.is_some()));
    assert_eq!(stored.comments[1].user, UNKNOWN_USER);
    assert!(stored.attachments.iter().all(|a| a.owner.is_some()));

    // second read has nothing left to migrate
    let again = service::bug_thread(&r, b.id, None).await.unwrap();
    assert_eq!(again.bug.changed, stored.changed);
}

#[tokio::test]
#[serial]
async fn attachment_is_owned_by_its_comment() {
    let (r, _dir) = repo();
    let b = r.create_bug(bug("with files")).await.unwrap();
    for text in ["one", "two"] {
        let req = ReplyRequest { target: ReplyTarget::Comment { index: None }, text: text.into() };
        service::submit_bug_reply(&r, b.id, req, "alice").await.unwrap();
    }
    let file = service::add_attachment(
        &r,
        b.id,
        NewAttachment { filename: "my log.txt".into(), url: Some("https://f/x".into()), path: None, comment_index: Some(1) },
    )
    .await
    .unwrap();
    assert_eq!(file.filename, "my_log.txt");

    let detail = service::bug_thread(&r, b.id, None).await.unwrap();
    // newest root first: "two" is rendered first and owns the file
    assert_eq!(detail.thread.comments[0].comment.text, "two");
    assert_eq!(detail.thread.comments[0].attachment.as_ref().map(|a| a.filename.as_str()), Some("my_log.txt"));
    assert!(detail.thread.comments[1].attachment.is_none());

    let err = service::add_attachment(
        &r,
        b.id,
        NewAttachment { filename: "x".into(), url: None, path: None, comment_index: Some(9) },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}

#[tokio::test]
#[serial]
async fn dashboard_counts() {
    let (r, _dir) = repo();
    let (read, create, _) = bugs_catalog(&r).await;
    let qa = r.create_role(new_role("QA")).await.unwrap();
    service::toggle_role_permission(&r, qa.id, read, false).await.unwrap();
    service::toggle_role_permission(&r, qa.id, create, false).await.unwrap();
    service::toggle_role_permission(&r, qa.id, create, true).await.unwrap();

    let d = service::permissions_dashboard(&r).await.unwrap();
    assert_eq!(d.total_permissions, 3);
    assert_eq!(d.total_roles, 1);
    assert_eq!(d.permissions_by_module[0].count, 3);
    assert_eq!(d.role_permission_counts[0].count, 1);
    assert_eq!(d.recent_assignments.len(), 1);
    assert_eq!(d.recent_assignments[0].permission_name, "Bugs read");
}

fn legacy_comment(text: &str) -> Comment {
    serde_json::from_value(serde_json::json!({"text": text, "level": 0})).unwrap()
}

fn unowned(name: &str) -> Attachment {
    Attachment { filename: name.into(), url: None, path: Some(format!("bugs/{name}")), owner: None }
}

/// Pairs of (comment text, attachment filename) in rendered order.
fn pairs(detail: &service::BugDetail) -> Vec<(String, Option<String>)> {
    fn walk(nodes: &[tracker::thread::CommentView], out: &mut Vec<(String, Option<String>)>) {
        for n in nodes {
            out.push((n.comment.text.clone(), n.attachment.as_ref().map(|a| a.filename.clone())));
            walk(&n.children, out);
        }
    }
    let mut out = Vec::new();
    walk(&detail.thread.comments, &mut out);
    out
}

#[tokio::test]
#[serial]
async fn reply_on_legacy_thread_keeps_attachment_pairing() {
    let (r, _dir) = repo();
    let b = r.create_bug(bug("legacy files")).await.unwrap();
    r.update_bug(
        b.id,
        UpdateBug {
            comments: Some(vec![legacy_comment("A"), legacy_comment("B")]),
            attachments: Some(vec![unowned("d.png"), unowned("a.png"), unowned("b.png")]),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // reply to A lands between A and B before anything was migrated
    let req = ReplyRequest { target: ReplyTarget::Comment { index: Some(0) }, text: "R".into() };
    let saved = service::submit_bug_reply(&r, b.id, req, "alice").await.unwrap();
    assert_eq!(saved.comments[1].text, "R");
    assert!(saved.attachments.iter().all(|a| a.owner.is_some()));

    let detail = service::bug_thread(&r, b.id, None).await.unwrap();
    let mut got = pairs(&detail);
    got.sort();
    assert_eq!(
        got,
        vec![
            ("A".to_string(), Some("a.png".to_string())),
            ("B".to_string(), Some("b.png".to_string())),
            ("R".to_string(), None),
        ]
    );
    assert_eq!(detail.thread.description_attachment.as_ref().map(|a| a.filename.as_str()), Some("d.png"));
}

#[tokio::test]
#[serial]
async fn concurrent_attachment_writers_do_not_lose_files() {
    let (inner, _dir) = repo();
    let b = inner.create_bug(bug("two uploads")).await.unwrap();
    let req = ReplyRequest { target: ReplyTarget::Comment { index: None }, text: "one".into() };
    service::submit_bug_reply(&inner, b.id, req, "alice").await.unwrap();
    let snapshot = inner.get_bug(b.id).await.unwrap();

    let upload = |name: &str| NewAttachment { filename: name.into(), url: Some(format!("https://f/{name}")), path: None, comment_index: Some(0) };
    service::add_attachment(&inner, b.id, upload("first.log")).await.unwrap();

    // second writer read the bug before the first upload landed
    let r = CountingRepo::new(inner.clone());
    r.serve_stale(snapshot.clone());
    let err = service::add_attachment(&r, b.id, upload("second.log")).await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
    let stored = inner.get_bug(b.id).await.unwrap();
    assert_eq!(stored.attachments.len(), 1);
    assert_eq!(stored.attachments[0].filename, "first.log");

    // a stale reply is rejected the same way rather than dropping the file
    let req = ReplyRequest { target: ReplyTarget::Comment { index: Some(0) }, text: "late".into() };
    assert!(matches!(service::submit_bug_reply(&r, b.id, req, "bob").await, Err(ApiError::Conflict(_))));
    assert_eq!(inner.get_bug(b.id).await.unwrap().attachments.len(), 1);
}

#[tokio::test]
#[serial]
async fn stale_migration_write_back_keeps_new_attachment() {
    let (inner, _dir) = repo();
    let b = inner.create_bug(bug("race")).await.unwrap();
    inner
        .update_bug(
            b.id,
            UpdateBug {
                comments: Some(vec![legacy_comment("A")]),
                attachments: Some(vec![unowned("d.png")]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let snapshot = inner.get_bug(b.id).await.unwrap();
    service::add_attachment(
        &inner,
        b.id,
        NewAttachment { filename: "a.png".into(), url: None, path: Some("bugs/a.png".into()), comment_index: Some(0) },
    )
    .await
    .unwrap();

    let r = CountingRepo::new(inner.clone());
    r.serve_stale(snapshot);
    service::bug_thread(&r, b.id, None).await.unwrap();
    let names: Vec<String> = inner.get_bug(b.id).await.unwrap().attachments.into_iter().map(|a| a.filename).collect();
    assert_eq!(names, vec!["d.png".to_string(), "a.png".to_string()]);
}

#[tokio::test]
#[serial]
async fn storage_base_urls_reach_every_rendered_copy() {
    let (r, _dir) = repo();
    let b = r.create_bug(bug("urls")).await.unwrap();
    r.update_bug(
        b.id,
        UpdateBug {
            comments: Some(vec![legacy_comment("A")]),
            attachments: Some(vec![unowned("d.png"), unowned("a.png")]),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let detail = service::bug_thread(&r, b.id, Some("https://cdn.test/")).await.unwrap();
    assert_eq!(detail.bug.attachments[1].url.as_deref(), Some("https://cdn.test/bugs/a.png"));
    assert_eq!(detail.thread.comments[0].attachment.as_ref().and_then(|a| a.url.as_deref()), Some("https://cdn.test/bugs/a.png"));
    assert_eq!(
        detail.thread.description_attachment.as_ref().and_then(|a| a.url.as_deref()),
        Some("https://cdn.test/bugs/d.png")
    );

    // resolved urls are not persisted
    assert!(r.get_bug(b.id).await.unwrap().attachments.iter().all(|a| a.url.is_none()));
}
