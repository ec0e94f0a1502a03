//! Role-gated portal views.
//!
//! Role ids come from the login response and are used for client-side gating
//! only; the backend enforces its own authorization on every call.

use crate::session::{Session, SessionState};

pub const DEFAULT_ENTRY_POINT: &str = "/login";
pub const CHANGE_PASSWORD_VIEW: &str = "/change-password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    UniversityAdmin,
    Faculty,
    InstituteAdmin,
    Student,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::UniversityAdmin,
        Role::Faculty,
        Role::InstituteAdmin,
        Role::Student,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Self::UniversityAdmin),
            2 => Some(Self::Faculty),
            3 => Some(Self::InstituteAdmin),
            5 => Some(Self::Student),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Self::UniversityAdmin => 1,
            Self::Faculty => 2,
            Self::InstituteAdmin => 3,
            Self::Student => 5,
        }
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::UniversityAdmin => "University Admin",
            Self::Faculty => "Faculty",
            Self::InstituteAdmin => "Institute Admin",
            Self::Student => "Student",
        }
    }

    /// Accepts a numeric id or a name like `student` / `institute-admin`
    pub fn from_str(s: &str) -> Option<Self> {
        if let Ok(id) = s.trim().parse::<u8>() {
            return Self::from_id(id);
        }
        match s.trim().to_lowercase().replace(['-', '_', ' '], "").as_str() {
            "universityadmin" | "admin" => Some(Self::UniversityAdmin),
            "faculty" => Some(Self::Faculty),
            "instituteadmin" | "institute" => Some(Self::InstituteAdmin),
            "student" => Some(Self::Student),
            _ => None,
        }
    }
}

/// Human-readable role for a raw id
pub fn describe_role(role_id: Option<u8>) -> String {
    match role_id {
        Some(id) => match Role::from_id(id) {
            Some(role) => format!("{} ({})", role.name(), id),
            None => format!("unknown role ({})", id),
        },
        None => "none".to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Redirect(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// A role-gated portal view
#[derive(Debug, Clone, Copy)]
pub struct View {
    pub path: &'static str,
    pub role: Role,
    pub title: &'static str,
    /// Backend resource the view renders
    pub resource: &'static str,
}

const VIEWS: &[View] = &[
    View {
        path: "/admin/dashboard",
        role: Role::UniversityAdmin,
        title: "University overview",
        resource: "/admin/stats",
    },
    View {
        path: "/faculty/dashboard",
        role: Role::Faculty,
        title: "Faculty dashboard",
        resource: "/faculty/students",
    },
    View {
        path: "/institute/dashboard",
        role: Role::InstituteAdmin,
        title: "Institute dashboard",
        resource: "/institute/courses",
    },
    View {
        path: "/student/dashboard",
        role: Role::Student,
        title: "Student dashboard",
        resource: "/student/dashboard",
    },
    View {
        path: "/student/profile",
        role: Role::Student,
        title: "Student profile",
        resource: "/student/profile",
    },
];

pub struct RouteGuard {
    entry_point: String,
}

impl Default for RouteGuard {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_POINT)
    }
}

impl RouteGuard {
    pub fn new(entry_point: &str) -> Self {
        Self {
            entry_point: entry_point.to_string(),
        }
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn views() -> &'static [View] {
        VIEWS
    }

    pub fn find_view(path: &str) -> Option<&'static View> {
        let path = path.trim_end_matches('/');
        VIEWS.iter().find(|v| v.path == path)
    }

    /// Allow only an authenticated session holding exactly `required`
    pub fn check(&self, required: Role, session: &Session, now_ms: i64) -> Decision {
        if session.state(now_ms) != SessionState::Authenticated {
            return self.redirect();
        }
        match session.active_role_id(now_ms) {
            Some(id) if id == required.id() => Decision::Allow,
            _ => self.redirect(),
        }
    }

    /// Gate a view by path; unknown views redirect
    pub fn check_view(&self, path: &str, session: &Session, now_ms: i64) -> Decision {
        match Self::find_view(path) {
            Some(view) => self.check(view.role, session, now_ms),
            None => self.redirect(),
        }
    }

    fn redirect(&self) -> Decision {
        Decision::Redirect(self.entry_point.clone())
    }
}

/// True when the session is live and holds any of `roles`
pub fn has_any_role(session: &Session, now_ms: i64, roles: &[Role]) -> bool {
    match session.active_role_id(now_ms) {
        Some(id) => roles.iter().any(|r| r.id() == id),
        None => false,
    }
}

/// Where a freshly signed-in principal lands
pub fn landing_view(role_id: Option<u8>, force_password_change: bool) -> Option<&'static str> {
    if force_password_change {
        return Some(CHANGE_PASSWORD_VIEW);
    }
    match role_id.and_then(Role::from_id)? {
        Role::UniversityAdmin => Some("/admin/dashboard"),
        Role::Faculty => Some("/faculty/dashboard"),
        Role::InstituteAdmin => Some("/institute/dashboard"),
        Role::Student => Some("/student/dashboard"),
    }
}
