//! Role access model: effective grants, toggle planning and guard checks.
//!
//! Everything here is pure; the service layer feeds it repository rows and
//! applies the resulting plans.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{Id, Module, Permission, Role};

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AccessError {
    #[error("role '{0}' is a super role and cannot be edited")]
    SuperRoleLocked(String),
    #[error("unknown module '{0}'")]
    UnknownModule(String),
}

/// Role names that become super roles when created.
pub fn is_super_role_name(name: &str) -> bool {
    name.trim().eq_ignore_ascii_case("admin")
}

pub fn group_by_module(catalog: &[Permission]) -> BTreeMap<String, Vec<Permission>> {
    let mut grouped: BTreeMap<String, Vec<Permission>> = BTreeMap::new();
    for p in catalog {
        grouped.entry(p.module.clone()).or_default().push(p.clone());
    }
    grouped
}

/// Permission ids a role can exercise, keyed by module.
pub fn effective_permissions(
    role: &Role,
    catalog: &[Permission],
    assigned: &HashSet<Id>,
) -> BTreeMap<String, BTreeSet<Id>> {
    let mut out: BTreeMap<String, BTreeSet<Id>> = BTreeMap::new();
    for p in catalog.iter().filter(|p| role.is_super || assigned.contains(&p.id)) {
        out.entry(p.module.clone()).or_default().insert(p.id);
    }
    out
}

pub fn effective_modules(role: &Role, modules: &[Module], assigned: &[String]) -> BTreeSet<String> {
    if role.is_super {
        modules.iter().map(|m| m.module_name.clone()).collect()
    } else {
        assigned.iter().cloned().collect()
    }
}

/// Displayed state of a module's "all permissions" switch. Derived, never
/// stored: on iff the module has permissions and every one is assigned.
pub fn module_switch_on(module_permissions: &[Permission], assigned: &HashSet<Id>) -> bool {
    !module_permissions.is_empty() && module_permissions.iter().all(|p| assigned.contains(&p.id))
}

/// Grants and revokes needed to move a role to a desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct PermissionDiff {
    pub grant: Vec<Id>,
    pub revoke: Vec<Id>,
}

impl PermissionDiff {
    pub fn is_empty(&self) -> bool {
        self.grant.is_empty() && self.revoke.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grant.len() + self.revoke.len()
    }
}

/// Plan for switching every permission of `module` on or off.
///
/// Only permissions not already in the desired state appear in the plan, so
/// applying it and planning again yields an empty diff.
pub fn plan_module_toggle(
    role: &Role,
    catalog: &[Permission],
    module: &str,
    desired_on: bool,
    assigned: &HashSet<Id>,
) -> Result<PermissionDiff, AccessError> {
    if role.is_super {
        return Err(AccessError::SuperRoleLocked(role.role_name.clone()));
    }
    let in_module: Vec<&Permission> = catalog.iter().filter(|p| p.module == module).collect();
    if in_module.is_empty() {
        return Err(AccessError::UnknownModule(module.to_string()));
    }
    let mut diff = PermissionDiff::default();
    for p in in_module {
        match (desired_on, assigned.contains(&p.id)) {
            (true, false) => diff.grant.push(p.id),
            (false, true) => diff.revoke.push(p.id),
            _ => {}
        }
    }
    Ok(diff)
}

/// Plan for flipping a single permission.
pub fn plan_permission_toggle(role: &Role, permission_id: Id, currently_assigned: bool) -> Result<PermissionDiff, AccessError> {
    if role.is_super {
        return Err(AccessError::SuperRoleLocked(role.role_name.clone()));
    }
    Ok(if currently_assigned {
        PermissionDiff { grant: vec![], revoke: vec![permission_id] }
    } else {
        PermissionDiff { grant: vec![permission_id], revoke: vec![] }
    })
}

/// The complete module set a role should hold after flipping `module`.
pub fn toggled_module_set(
    role: &Role,
    current: &[String],
    module: &str,
    currently_granted: bool,
) -> Result<Vec<String>, AccessError> {
    if role.is_super {
        return Err(AccessError::SuperRoleLocked(role.role_name.clone()));
    }
    let mut next: Vec<String> = current.iter().filter(|m| m.as_str() != module).cloned().collect();
    if !currently_granted {
        next.push(module.to_string());
    }
    Ok(next)
}

// ----------------------------------------------------------------- view ---

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PermissionToggle {
    pub permission: Permission,
    pub checked: bool,
    pub disabled: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModulePermissions {
    pub module: String,
    pub switch_on: bool,
    pub disabled: bool,
    pub permissions: Vec<PermissionToggle>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModuleToggle {
    pub module: String,
    pub granted: bool,
    pub disabled: bool,
}

/// Toggle state for a role's admin screen.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RoleAccessView {
    pub role: Role,
    pub locked: bool,
    pub permissions: Vec<ModulePermissions>,
    pub modules: Vec<ModuleToggle>,
}

impl RoleAccessView {
    pub fn build(
        role: &Role,
        catalog: &[Permission],
        assigned: &HashSet<Id>,
        modules: &[Module],
        assigned_modules: &[String],
    ) -> Self {
        let effective: HashSet<Id> = effective_permissions(role, catalog, assigned)
            .into_values()
            .flatten()
            .collect();
        let granted_modules = effective_modules(role, modules, assigned_modules);
        let locked = role.is_super;
        let permissions = group_by_module(catalog)
            .into_iter()
            .map(|(module, perms)| ModulePermissions {
                switch_on: module_switch_on(&perms, &effective),
                disabled: locked,
                permissions: perms
                    .into_iter()
                    .map(|p| PermissionToggle { checked: effective.contains(&p.id), disabled: locked, permission: p })
                    .collect(),
                module,
            })
            .collect();
        let modules = modules
            .iter()
            .map(|m| ModuleToggle {
                granted: granted_modules.contains(&m.module_name),
                disabled: locked,
                module: m.module_name.clone(),
            })
            .collect();
        Self { role: role.clone(), locked, permissions, modules }
    }
}

// --------------------------------------------------------------- guards ---

/// A role's resolved grants, used to authorize requests.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EffectiveAccess {
    pub role: String,
    pub is_super: bool,
    pub modules: BTreeSet<String>,
    pub permission_codes: BTreeSet<String>,
}

impl EffectiveAccess {
    pub fn resolve(
        role: &Role,
        catalog: &[Permission],
        assigned: &HashSet<Id>,
        modules: &[Module],
        assigned_modules: &[String],
    ) -> Self {
        let ids: HashSet<Id> = effective_permissions(role, catalog, assigned)
            .into_values()
            .flatten()
            .collect();
        Self {
            role: role.role_name.clone(),
            is_super: role.is_super,
            modules: effective_modules(role, modules, assigned_modules),
            permission_codes: catalog
                .iter()
                .filter(|p| ids.contains(&p.id))
                .map(|p| p.permission_code.clone())
                .collect(),
        }
    }

    pub fn has_permission(&self, code: &str) -> bool {
        self.is_super || self.permission_codes.contains(code)
    }

    pub fn has_any_permission(&self, codes: &[&str]) -> bool {
        codes.iter().any(|c| self.has_permission(c))
    }

    pub fn has_all_permissions(&self, codes: &[&str]) -> bool {
        self.missing_permissions(codes).is_empty()
    }

    /// Codes from `codes` the role lacks; empty means all are held.
    pub fn missing_permissions<'a>(&self, codes: &[&'a str]) -> Vec<&'a str> {
        codes.iter().copied().filter(|c| !self.has_permission(c)).collect()
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.is_super || self.modules.contains(module)
    }
}
