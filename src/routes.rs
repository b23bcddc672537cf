use std::sync::Arc;

use actix_web::{web, HttpResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::access::EffectiveAccess;
use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::*;
use crate::repo::{AssignmentRepo, BugRepo, CatalogRepo, Repo, RoleRepo};
use crate::service::{self, NewAttachment, ReplyRequest, MANAGE_ROLES};

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .service(
                web::resource("/bugs")
                    .route(web::get().to(list_bugs))
                    .route(web::post().to(create_bug)),
            )
            .service(web::resource("/bugs/{id}").route(web::get().to(get_bug)))
            .service(web::resource("/bugs/{id}/replies").route(web::post().to(create_reply)))
            .service(web::resource("/bugs/{id}/attachments").route(web::post().to(add_attachment)))
            .service(
                web::resource("/permissions")
                    .route(web::get().to(list_permissions))
                    .route(web::post().to(create_permission)),
            )
            .service(web::resource("/permissions/dashboard").route(web::get().to(permissions_dashboard)))
            .service(web::resource("/modules").route(web::get().to(list_modules)))
            .service(
                web::resource("/roles")
                    .route(web::get().to(list_roles))
                    .route(web::post().to(create_role)),
            )
            .service(
                web::resource("/roles/{id}/permissions")
                    .route(web::get().to(role_permissions))
                    .route(web::post().to(assign_role_permission)),
            )
            .service(
                web::resource("/roles/{id}/permissions/{permission_id}")
                    .route(web::delete().to(revoke_role_permission)),
            )
            .service(
                web::resource("/roles/{id}/modules/{module}/permissions")
                    .route(web::put().to(toggle_module_permissions)),
            )
            .service(
                web::resource("/roles/{id}/modules")
                    .route(web::get().to(role_modules))
                    .route(web::put().to(replace_role_modules)),
            )
            .service(
                web::resource("/roles/{id}/modules/{module}/toggle")
                    .route(web::post().to(toggle_module_access)),
            )
            .service(web::resource("/roles/{id}/access").route(web::get().to(role_access)))
            .service(web::resource("/auth/me").route(web::get().to(auth_me))),
    )
    .service(web::resource("/metrics").route(web::get().to(render_metrics)));
}

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub storage_public_base: Option<String>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo, storage_public_base: None, metrics: None }
    }
}

async fn render_metrics(data: web::Data<AppState>) -> HttpResponse {
    match &data.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().finish(),
    }
}

// ---------------- guards ------------------------------------------------

async fn caller_access(data: &AppState, auth: &Auth) -> Result<EffectiveAccess, ApiError> {
    service::effective_access_for_role_name(data.repo.as_ref(), &auth.0.role).await
}

async fn require_module(data: &AppState, auth: &Auth, module: &str) -> Result<EffectiveAccess, ApiError> {
    let access = caller_access(data, auth).await?;
    if !access.has_module(module) {
        return Err(ApiError::Forbidden(format!("role '{}' has no access to module {module}", access.role)));
    }
    Ok(access)
}

async fn require_permission(data: &AppState, auth: &Auth, code: &str) -> Result<EffectiveAccess, ApiError> {
    let access = caller_access(data, auth).await?;
    let missing = access.missing_permissions(&[code]);
    if !missing.is_empty() {
        return Err(ApiError::Forbidden(format!("insufficient permissions, required: {}", missing.join(", "))));
    }
    Ok(access)
}

const BUGS_MODULE: &str = "Bugs";

// ---------------- bugs --------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/bugs",
    responses(
        (status = 200, description = "List bugs, most recently changed first", body = [BugSummary]),
        (status = 403, description = "No access to the Bugs module")
    )
)]
pub async fn list_bugs(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    require_module(&data, &auth, BUGS_MODULE).await?;
    let bugs = data.repo.list_bugs().await?;
    let rows: Vec<BugSummary> = bugs.iter().map(BugSummary::from).collect();
    Ok(HttpResponse::Ok().json(rows))
}

#[utoipa::path(
    post,
    path = "/api/v1/bugs",
    request_body = NewBug,
    responses(
        (status = 201, description = "Bug created", body = Bug),
        (status = 400, description = "Missing summary or description"),
        (status = 403, description = "No access to the Bugs module")
    )
)]
pub async fn create_bug(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewBug>) -> Result<HttpResponse, ApiError> {
    require_module(&data, &auth, BUGS_MODULE).await?;
    let mut new = payload.into_inner();
    service::validate_new_bug(&new)?;
    if new.reporter.as_deref().map_or(true, |r| r.trim().is_empty()) {
        new.reporter = Some(auth.0.display_name().to_string());
    }
    let bug = data.repo.create_bug(new).await?;
    Ok(HttpResponse::Created().json(bug))
}

#[utoipa::path(
    get,
    path = "/api/v1/bugs/{id}",
    params(("id" = i64, Path, description = "Bug id")),
    responses(
        (status = 200, description = "Bug with rendered comment thread", body = crate::service::BugDetail),
        (status = 404, description = "Bug not found")
    )
)]
pub async fn get_bug(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    require_module(&data, &auth, BUGS_MODULE).await?;
    let detail = service::bug_thread(data.repo.as_ref(), path.into_inner(), data.storage_public_base.as_deref()).await?;
    Ok(HttpResponse::Ok().json(detail))
}

#[utoipa::path(
    post,
    path = "/api/v1/bugs/{id}/replies",
    request_body = ReplyRequest,
    params(("id" = i64, Path, description = "Bug id")),
    responses(
        (status = 201, description = "Reply stored; returns the updated bug", body = Bug),
        (status = 400, description = "Empty reply"),
        (status = 404, description = "Bug not found"),
        (status = 409, description = "Thread changed concurrently")
    )
)]
pub async fn create_reply(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<ReplyRequest>,
) -> Result<HttpResponse, ApiError> {
    require_module(&data, &auth, BUGS_MODULE).await?;
    let bug = service::submit_bug_reply(data.repo.as_ref(), path.into_inner(), payload.into_inner(), auth.0.display_name()).await?;
    Ok(HttpResponse::Created().json(bug))
}

#[utoipa::path(
    post,
    path = "/api/v1/bugs/{id}/attachments",
    request_body = NewAttachment,
    params(("id" = i64, Path, description = "Bug id")),
    responses(
        (status = 201, description = "Attachment registered", body = Attachment),
        (status = 400, description = "Invalid attachment metadata"),
        (status = 404, description = "Bug not found")
    )
)]
pub async fn add_attachment(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<NewAttachment>,
) -> Result<HttpResponse, ApiError> {
    require_module(&data, &auth, BUGS_MODULE).await?;
    let file = service::add_attachment(data.repo.as_ref(), path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(file))
}

// ---------------- catalog -----------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct PermissionList {
    pub data: Vec<Permission>,
    pub grouped: std::collections::BTreeMap<String, Vec<Permission>>,
}

#[utoipa::path(
    get,
    path = "/api/v1/permissions",
    responses((status = 200, description = "Permission catalog, flat and grouped by module", body = PermissionList))
)]
pub async fn list_permissions(_auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let perms = data.repo.list_permissions().await?;
    let grouped = crate::access::group_by_module(&perms);
    Ok(HttpResponse::Ok().json(PermissionList { data: perms, grouped }))
}

#[utoipa::path(
    post,
    path = "/api/v1/permissions",
    request_body = NewPermission,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 400, description = "Missing required fields"),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Duplicate permission code")
    )
)]
pub async fn create_permission(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewPermission>) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let new = payload.into_inner();
    let blank: Vec<&str> = [
        ("permission_name", &new.permission_name),
        ("permission_code", &new.permission_code),
        ("module", &new.module),
        ("action", &new.action),
    ]
    .into_iter()
    .filter(|(_, v)| v.trim().is_empty())
    .map(|(k, _)| k)
    .collect();
    if !blank.is_empty() {
        return Err(ApiError::BadRequest(format!("missing fields: {}", blank.join(", "))));
    }
    let p = data.repo.create_permission(new).await?;
    Ok(HttpResponse::Created().json(p))
}

#[utoipa::path(
    get,
    path = "/api/v1/permissions/dashboard",
    responses((status = 200, description = "Permission statistics", body = crate::service::PermissionsDashboard))
)]
pub async fn permissions_dashboard(_auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let stats = service::permissions_dashboard(data.repo.as_ref()).await?;
    Ok(HttpResponse::Ok().json(stats))
}

#[utoipa::path(
    get,
    path = "/api/v1/modules",
    responses((status = 200, description = "Module catalog", body = [Module]))
)]
pub async fn list_modules(_auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_modules().await?))
}

// ---------------- roles -------------------------------------------------

#[utoipa::path(
    get,
    path = "/api/v1/roles",
    responses((status = 200, description = "List roles", body = [Role]))
)]
pub async fn list_roles(_auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    Ok(HttpResponse::Ok().json(data.repo.list_roles().await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/roles",
    request_body = NewRole,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 403, description = "Forbidden"),
        (status = 409, description = "Role name taken")
    )
)]
pub async fn create_role(auth: Auth, data: web::Data<AppState>, payload: web::Json<NewRole>) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let new = payload.into_inner();
    if new.role_name.trim().is_empty() {
        return Err(ApiError::BadRequest("role_name must not be empty".into()));
    }
    let role = data.repo.create_role(new).await?;
    Ok(HttpResponse::Created().json(role))
}

#[utoipa::path(
    get,
    path = "/api/v1/roles/{id}/permissions",
    params(("id" = i64, Path, description = "Role id")),
    responses((status = 200, description = "Effective permissions grouped by module"))
)]
pub async fn role_permissions(_auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let grouped = service::role_permissions_grouped(data.repo.as_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "grouped_permissions": grouped })))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AssignPermissionRequest {
    pub permission_id: Id,
}

#[utoipa::path(
    post,
    path = "/api/v1/roles/{id}/permissions",
    request_body = AssignPermissionRequest,
    params(("id" = i64, Path, description = "Role id")),
    responses(
        (status = 200, description = "Permission granted", body = crate::service::ToggleOutcome),
        (status = 409, description = "Super role is locked")
    )
)]
pub async fn assign_role_permission(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<AssignPermissionRequest>,
) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let out = service::toggle_role_permission(data.repo.as_ref(), path.into_inner(), payload.permission_id, false).await?;
    Ok(HttpResponse::Ok().json(out))
}

#[utoipa::path(
    delete,
    path = "/api/v1/roles/{id}/permissions/{permission_id}",
    params(("id" = i64, Path, description = "Role id"), ("permission_id" = i64, Path, description = "Permission id")),
    responses(
        (status = 200, description = "Permission revoked", body = crate::service::ToggleOutcome),
        (status = 409, description = "Super role is locked")
    )
)]
pub async fn revoke_role_permission(auth: Auth, data: web::Data<AppState>, path: web::Path<(Id, Id)>) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let (role_id, permission_id) = path.into_inner();
    let out = service::toggle_role_permission(data.repo.as_ref(), role_id, permission_id, true).await?;
    Ok(HttpResponse::Ok().json(out))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ModuleSwitchRequest {
    pub enabled: bool,
}

#[utoipa::path(
    put,
    path = "/api/v1/roles/{id}/modules/{module}/permissions",
    request_body = ModuleSwitchRequest,
    params(("id" = i64, Path, description = "Role id"), ("module" = String, Path, description = "Module name")),
    responses(
        (status = 200, description = "Module permissions converged", body = crate::service::ToggleOutcome),
        (status = 404, description = "Unknown role or module"),
        (status = 409, description = "Super role is locked")
    )
)]
pub async fn toggle_module_permissions(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, String)>,
    payload: web::Json<ModuleSwitchRequest>,
) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let (role_id, module) = path.into_inner();
    let out = service::toggle_module_permissions(data.repo.as_ref(), role_id, &module, payload.enabled).await?;
    Ok(HttpResponse::Ok().json(out))
}

#[utoipa::path(
    get,
    path = "/api/v1/roles/{id}/modules",
    params(("id" = i64, Path, description = "Role id")),
    responses((status = 200, description = "Module names the role can access", body = [String]))
)]
pub async fn role_modules(_auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let role = data.repo.get_role(path.into_inner()).await?;
    let modules = data.repo.list_modules().await?;
    let assigned = data.repo.list_role_modules(role.id).await?;
    let effective = crate::access::effective_modules(&role, &modules, &assigned);
    Ok(HttpResponse::Ok().json(effective))
}

#[utoipa::path(
    put,
    path = "/api/v1/roles/{id}/modules",
    request_body = [String],
    params(("id" = i64, Path, description = "Role id")),
    responses(
        (status = 200, description = "Module set replaced", body = [String]),
        (status = 404, description = "Unknown role or module"),
        (status = 409, description = "Super role is locked")
    )
)]
pub async fn replace_role_modules(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<Vec<String>>,
) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let role = data.repo.get_role(path.into_inner()).await?;
    let modules = service::replace_modules(data.repo.as_ref(), &role, &payload).await?;
    Ok(HttpResponse::Ok().json(modules))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ModuleAccessToggleRequest {
    pub currently_granted: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/roles/{id}/modules/{module}/toggle",
    request_body = ModuleAccessToggleRequest,
    params(("id" = i64, Path, description = "Role id"), ("module" = String, Path, description = "Module name")),
    responses(
        (status = 200, description = "Module access flipped", body = [String]),
        (status = 409, description = "Super role is locked")
    )
)]
pub async fn toggle_module_access(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<(Id, String)>,
    payload: web::Json<ModuleAccessToggleRequest>,
) -> Result<HttpResponse, ApiError> {
    require_permission(&data, &auth, MANAGE_ROLES).await?;
    let (role_id, module) = path.into_inner();
    let modules = service::toggle_module_access(data.repo.as_ref(), role_id, &module, payload.currently_granted).await?;
    Ok(HttpResponse::Ok().json(modules))
}

#[utoipa::path(
    get,
    path = "/api/v1/roles/{id}/access",
    params(("id" = i64, Path, description = "Role id")),
    responses((status = 200, description = "Toggle state for the role admin screen", body = crate::access::RoleAccessView))
)]
pub async fn role_access(_auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let view = service::role_access(data.repo.as_ref(), path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[derive(Serialize, ToSchema)]
pub struct MeResponse {
    pub id: String,
    pub name: String,
    pub access: EffectiveAccess,
}

#[utoipa::path(
    get,
    path = "/api/v1/auth/me",
    responses(
        (status = 200, description = "Caller identity and effective access", body = MeResponse),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn auth_me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let access = caller_access(&data, &auth).await?;
    Ok(HttpResponse::Ok().json(MeResponse {
        id: auth.0.sub.clone(),
        name: auth.0.display_name().to_string(),
        access,
    }))
}
