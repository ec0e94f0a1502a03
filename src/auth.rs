//! Auth gateway: the single owner of the session.
//!
//! The gateway loads the persisted session at construction, drops it if its
//! expiry has already passed, and is the only thing that writes it afterwards
//! (`login`, `logout`, expiry). Outbound requests go through
//! `authorized_fetch`, which decorates them with the bearer token and hands
//! them to the transport; `anonymous_fetch` serves the sign-in endpoints.
//! Responses come back untouched, error statuses included.

use crate::http::{Headers, Request, Response, Transport};
use crate::journal::Journal;
use crate::session::{Clock, Session, SessionState, SessionStore, SystemClock};
use crate::storage::KeyValueStorage;
use anyhow::Result;
use std::time::Instant;
use tracing::{debug, info, warn};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Return a copy of `headers` carrying the bearer token (when there is one)
/// and a JSON `Accept` (unless the caller picked one).
pub fn with_auth_header(headers: &Headers, token: Option<&str>) -> Headers {
    let mut out = headers.clone();
    if let Some(token) = token {
        out.set("Authorization", &format!("Bearer {}", token));
    }
    if !out.contains("Accept") {
        out.set("Accept", "application/json");
    }
    out
}

/// Absolute expiry for a login at `now_ms`. A missing, zero or NaN hour
/// count means the session never expires client-side. A negative count
/// yields an expiry in the past. Out-of-range values clamp to the i64 range.
pub fn expiry_from_hours(now_ms: i64, expires_in_hours: Option<f64>) -> Option<i64> {
    expires_in_hours
        .filter(|h| !h.is_nan() && *h != 0.0)
        .map(|h| now_ms.saturating_add((h * MILLIS_PER_HOUR).round() as i64))
}

pub struct GatewayOptions {
    /// Re-check expiry before every request, not only at startup
    pub recheck_on_fetch: bool,
    pub journal: Option<Journal>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            recheck_on_fetch: true,
            journal: None,
        }
    }
}

pub struct AuthGateway<S, T, C = SystemClock> {
    store: SessionStore<S>,
    transport: T,
    clock: C,
    session: Session,
    recheck_on_fetch: bool,
    journal: Option<Journal>,
}

impl<S: KeyValueStorage, T: Transport, C: Clock> AuthGateway<S, T, C> {
    /// Load the persisted session and discard it if it has already expired
    pub fn new(store: SessionStore<S>, transport: T, clock: C, options: GatewayOptions) -> Self {
        let session = store.load();
        let mut gateway = Self {
            store,
            transport,
            clock,
            session,
            recheck_on_fetch: options.recheck_on_fetch,
            journal: options.journal,
        };
        if let Err(e) = gateway.expire_if_due("startup") {
            // The in-memory session is already gone; only the stored copy lingers
            warn!(error = %e, "Failed to clear expired session from storage");
        }
        debug!(state = gateway.state().as_str(), "Session loaded");
        gateway
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    pub fn state(&self) -> SessionState {
        self.session.state(self.now())
    }

    pub fn role_id(&self) -> Option<u8> {
        self.session.active_role_id(self.now())
    }

    pub fn journal_mut(&mut self) -> Option<&mut Journal> {
        self.journal.as_mut()
    }

    /// Start a session with an opaque token from the backend
    pub fn login(
        &mut self,
        token: &str,
        role_id: Option<u8>,
        expires_in_hours: Option<f64>,
    ) -> Result<()> {
        let now = self.now();
        let session = Session {
            token: Some(token.to_string()),
            expires_at: expiry_from_hours(now, expires_in_hours),
            role_id,
        };
        self.store.save(&session)?;
        self.session = session;

        info!(
            role_id = ?self.session.role_id,
            expires_at = ?self.session.expires_at,
            "Signed in"
        );
        let (role_id, expires_at) = (self.session.role_id, self.session.expires_at);
        self.record(|j| j.login(role_id, expires_at));
        Ok(())
    }

    /// End the session. Safe to call when already anonymous.
    pub fn logout(&mut self) -> Result<()> {
        let had_session = self.session.token.is_some();
        self.store.clear()?;
        self.session = Session::default();

        info!(had_session, "Signed out");
        self.record(|j| j.logout(had_session));
        Ok(())
    }

    /// Send `request` with the current credential attached
    pub fn authorized_fetch(&mut self, request: Request) -> Result<Response> {
        if self.recheck_on_fetch {
            self.expire_if_due("fetch")?;
        }

        let now = self.now();
        let token = self.session.active_token(now);
        let authorized = token.is_some();
        let request = Request {
            headers: with_auth_header(&request.headers, token),
            ..request
        };
        self.dispatch(request, authorized)
    }

    /// Send `request` without the credential, for the endpoints that
    /// establish or recover one (login, registration, password reset).
    pub fn anonymous_fetch(&mut self, request: Request) -> Result<Response> {
        let request = Request {
            headers: with_auth_header(&request.headers, None),
            ..request
        };
        self.dispatch(request, false)
    }

    fn dispatch(&mut self, request: Request, authorized: bool) -> Result<Response> {
        debug!(
            method = request.method.as_str(),
            url = %request.url,
            authorized,
            "Sending request"
        );
        let method = request.method.as_str();
        self.record(|j| j.request(method, &request.url, authorized));

        let started = Instant::now();
        match self.transport.send(&request) {
            Ok(response) => {
                let elapsed = started.elapsed().as_millis() as u64;
                debug!(status = response.status, duration_ms = elapsed, "Response received");
                self.record(|j| j.response(&request.url, response.status, elapsed));
                Ok(response)
            }
            Err(e) => {
                let message = e.to_string();
                self.record(|j| j.transport_error(&request.url, &message));
                Err(e)
            }
        }
    }

    /// Drop the session if its expiry has passed. Returns whether it did.
    fn expire_if_due(&mut self, checkpoint: &str) -> Result<bool> {
        let expires_at = match self.session.expires_at {
            Some(exp) if self.now() >= exp => exp,
            _ => return Ok(false),
        };

        self.session = Session::default();
        info!(checkpoint, expires_at, "Session expired");
        self.record(|j| j.session_expired(checkpoint, expires_at));
        self.store.clear()?;
        Ok(true)
    }

    fn record<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Journal) -> Result<()>,
    {
        if let Some(journal) = self.journal.as_mut() {
            if let Err(e) = f(journal) {
                warn!(error = %e, "Failed to write journal");
            }
        }
    }
}
