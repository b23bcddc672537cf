use crate::access::{EffectiveAccess, ModulePermissions, ModuleToggle, PermissionDiff, PermissionToggle, RoleAccessView};
use crate::models::{
    Attachment, AttachmentOwner, Bug, BugSummary, Comment, Module, NewBug, NewPermission, NewRole, ParentType,
    Permission, Role,
};
use crate::service::{
    BugDetail, ModulePermissionCount, NewAttachment, PermissionsDashboard, RecentAssignment, ReplyRequest,
    RolePermissionCount, ToggleOutcome,
};
use crate::thread::{CommentView, DescriptionReplyView, ReplyTarget, ThreadView};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::list_bugs,
        crate::routes::create_bug,
        crate::routes::get_bug,
        crate::routes::create_reply,
        crate::routes::add_attachment,
        crate::routes::list_permissions,
        crate::routes::create_permission,
        crate::routes::permissions_dashboard,
        crate::routes::list_modules,
        crate::routes::list_roles,
        crate::routes::create_role,
        crate::routes::role_permissions,
        crate::routes::assign_role_permission,
        crate::routes::revoke_role_permission,
        crate::routes::toggle_module_permissions,
        crate::routes::role_modules,
        crate::routes::replace_role_modules,
        crate::routes::toggle_module_access,
        crate::routes::role_access,
        crate::routes::auth_me,
    ),
    components(schemas(
        Bug, BugSummary, NewBug, Comment, ParentType, Attachment, AttachmentOwner,
        BugDetail, ThreadView, CommentView, DescriptionReplyView, ReplyTarget, ReplyRequest, NewAttachment,
        Role, NewRole, Permission, NewPermission, Module,
        PermissionDiff, ToggleOutcome, RoleAccessView, ModulePermissions, PermissionToggle, ModuleToggle,
        EffectiveAccess, PermissionsDashboard, ModulePermissionCount, RolePermissionCount, RecentAssignment,
        crate::routes::PermissionList, crate::routes::AssignPermissionRequest,
        crate::routes::ModuleSwitchRequest, crate::routes::ModuleAccessToggleRequest,
        crate::routes::MeResponse,
    )),
    tags(
        (name = "bugs", description = "Bugs and comment threads"),
        (name = "roles", description = "Roles, permissions and module access"),
    )
)]
pub struct ApiDoc;
