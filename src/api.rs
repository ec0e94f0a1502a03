//! Typed calls to the ERP backend's authentication endpoints.
//!
//! Every call is sent through the gateway, so its decorator is the only path
//! to the network. Sign-in and password recovery use `anonymous_fetch` and
//! never carry a stored token; everything else uses `authorized_fetch`.
//! Error bodies look like
//! `{"error": "..."}` (sometimes `message`); when neither is present the
//! caller-facing fallback text is used.

use crate::auth::AuthGateway;
use crate::guard::{landing_view, Role};
use crate::http::{Headers, Method, Request, Response, Transport};
use crate::session::Clock;
use crate::storage::KeyValueStorage;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const MIN_PASSWORD_LEN: usize = 6;

/// Login surface. The institute portal is restricted to faculty and
/// institute admins; the others admit every role and route by role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Portal {
    Student,
    Institute,
    #[default]
    Admin,
}

impl Portal {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "student" => Some(Self::Student),
            "institute" | "faculty" => Some(Self::Institute),
            "admin" | "university" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Institute => "institute",
            Self::Admin => "admin",
        }
    }

    pub fn admits(&self, role_id: Option<u8>) -> bool {
        match self {
            Self::Institute => matches!(
                role_id.and_then(Role::from_id),
                Some(Role::Faculty | Role::InstituteAdmin)
            ),
            Self::Student | Self::Admin => true,
        }
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoginResponse {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub role_id: Option<i64>,
    #[serde(default)]
    pub expires_in_hours: Option<f64>,
    #[serde(default)]
    pub force_password_change: bool,
}

/// What a successful login produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub role_id: Option<u8>,
    pub force_password_change: bool,
    pub landing: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub enrollment_number: String,
    pub email: String,
    pub password: String,
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgotPasswordOutcome {
    pub message: String,
    /// Development backends echo the reset token instead of mailing it
    pub reset_token: Option<String>,
}

/// Join a backend path onto the API base. Absolute URLs pass through.
pub fn join_url(api_base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        api_base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// The backend's error text, or `fallback`
pub fn error_message(body: &Value, fallback: &str) -> String {
    ["error", "message"]
        .iter()
        .find_map(|k| body.get(k).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Parse a body leniently: anything that is not JSON becomes `{}`
fn lenient_json(response: &Response) -> Value {
    response
        .json()
        .unwrap_or_else(|_| Value::Object(Default::default()))
}

pub struct PortalApi {
    api_base: String,
}

impl PortalApi {
    pub fn new(api_base: &str) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.api_base, path)
    }

    /// Any authorized call; the response is returned as-is
    pub fn fetch<S, T, C>(
        &self,
        gateway: &mut AuthGateway<S, T, C>,
        method: Method,
        path: &str,
        headers: Headers,
        body: Option<String>,
    ) -> Result<Response>
    where
        S: KeyValueStorage,
        T: Transport,
        C: Clock,
    {
        let mut request = Request::new(method, &self.url(path));
        request.headers = headers;
        if let Some(body) = body {
            if !request.headers.contains("Content-Type") {
                request.headers.set("Content-Type", "application/json");
            }
            request = request.body(body);
        }
        gateway.authorized_fetch(request)
    }

    /// Sign in and, on success, start the session
    pub fn login<S, T, C>(
        &self,
        gateway: &mut AuthGateway<S, T, C>,
        portal: Portal,
        username: &str,
        password: &str,
    ) -> Result<LoginOutcome>
    where
        S: KeyValueStorage,
        T: Transport,
        C: Clock,
    {
        let request = Request::post(&self.url("/auth/login"))
            .json(&LoginRequest { username, password })?;
        let response = gateway.anonymous_fetch(request)?;
        let body = lenient_json(&response);

        if !response.is_success() {
            return Err(anyhow!(
                "{} (HTTP {})",
                error_message(&body, "Login failed"),
                response.status
            ));
        }

        let parsed: LoginResponse = serde_json::from_value(body)
            .map_err(|e| anyhow!("Unexpected login response: {}", e))?;
        let token = match parsed.token.as_deref() {
            Some(token) if !token.is_empty() => token,
            _ => return Err(anyhow!("No token returned by server")),
        };
        let role_id = parsed.role_id.and_then(|id| u8::try_from(id).ok());

        if !portal.admits(role_id) {
            debug!(portal = portal.as_str(), ?role_id, "Role not admitted by portal");
            return Err(anyhow!("Access denied."));
        }

        gateway.login(token, role_id, parsed.expires_in_hours)?;

        Ok(LoginOutcome {
            role_id,
            force_password_change: parsed.force_password_change,
            landing: landing_view(role_id, parsed.force_password_change),
        })
    }

    /// Request portal access; an admin approves it later
    pub fn register<S, T, C>(
        &self,
        gateway: &mut AuthGateway<S, T, C>,
        registration: &Registration,
    ) -> Result<String>
    where
        S: KeyValueStorage,
        T: Transport,
        C: Clock,
    {
        let request = Request::post(&self.url("/auth/register")).json(registration)?;
        let response = gateway.anonymous_fetch(request)?;
        expect_success(&response, "Registration failed").map(|body| {
            message_or(
                &body,
                "Access request submitted. Please wait for admin approval.",
            )
        })
    }

    pub fn forgot_password<S, T, C>(
        &self,
        gateway: &mut AuthGateway<S, T, C>,
        email: &str,
    ) -> Result<ForgotPasswordOutcome>
    where
        S: KeyValueStorage,
        T: Transport,
        C: Clock,
    {
        let request = Request::post(&self.url("/auth/forgot-password"))
            .json(&serde_json::json!({ "email": email }))?;
        let response = gateway.anonymous_fetch(request)?;
        let body = expect_success(&response, "Failed to send reset link")?;
        Ok(ForgotPasswordOutcome {
            message: message_or(&body, "If the email exists, a reset link will be sent"),
            reset_token: body
                .get("token")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    pub fn reset_password<S, T, C>(
        &self,
        gateway: &mut AuthGateway<S, T, C>,
        token: &str,
        new_password: &str,
    ) -> Result<String>
    where
        S: KeyValueStorage,
        T: Transport,
        C: Clock,
    {
        if token.trim().is_empty() {
            return Err(anyhow!("Reset token is required"));
        }
        check_password(new_password)?;

        let request = Request::post(&self.url("/auth/reset-password")).json(
            &serde_json::json!({ "token": token, "new_password": new_password }),
        )?;
        let response = gateway.anonymous_fetch(request)?;
        expect_success(&response, "Failed to reset password")
            .map(|body| message_or(&body, "Password reset successful"))
    }

    /// Needs a live session; the backend rejects the call otherwise
    pub fn change_password<S, T, C>(
        &self,
        gateway: &mut AuthGateway<S, T, C>,
        new_password: &str,
    ) -> Result<String>
    where
        S: KeyValueStorage,
        T: Transport,
        C: Clock,
    {
        check_password(new_password)?;

        let request = Request::post(&self.url("/auth/change-password"))
            .json(&serde_json::json!({ "new_password": new_password }))?;
        let response = gateway.authorized_fetch(request)?;
        expect_success(&response, "Failed to change password")
            .map(|body| message_or(&body, "Password changed successfully"))
    }
}

fn check_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(anyhow!("Password must not be empty"));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(anyhow!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    Ok(())
}

fn expect_success(response: &Response, fallback: &str) -> Result<Value> {
    let body = lenient_json(response);
    if response.is_success() {
        Ok(body)
    } else {
        Err(anyhow!(
            "{} (HTTP {})",
            error_message(&body, fallback),
            response.status
        ))
    }
}

fn message_or(body: &Value, fallback: &str) -> String {
    body.get("message")
        .and_then(|v| v.as_str())
        .unwrap_or(fallback)
        .to_string()
}
