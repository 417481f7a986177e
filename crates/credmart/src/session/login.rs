//! Admin login sub-flow for provisioning new resource credentials.
//!
//! One pending login per admin. Starting a new login replaces (and closes)
//! the previous one.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use super::{LiveConnector, LoginRequest, LoginStep, PendingLogin, SessionError};
use crate::model::{SessionCredentials, UserId};

/// Credential material produced by a completed login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedSession {
    /// Digits only, no leading `+`.
    pub identifier: String,
    #[serde(skip)]
    pub credentials: SessionCredentials,
    pub external_user_id: Option<i64>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Ok(ProvisionedSession),
    InvalidCode,
    CodeExpired,
    NeedPassword,
    InvalidPassword,
    NoPending,
}

impl LoginOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok(_) => "ok",
            Self::InvalidCode => "invalid_code",
            Self::CodeExpired => "code_expired",
            Self::NeedPassword => "need_password",
            Self::InvalidPassword => "invalid_password",
            Self::NoPending => "no_pending",
        }
    }
}

pub struct AdminLoginFlow {
    connector: Arc<dyn LiveConnector>,
    pending: DashMap<UserId, Arc<dyn PendingLogin>>,
}

impl AdminLoginFlow {
    pub fn new(connector: Arc<dyn LiveConnector>) -> Self {
        Self {
            connector,
            pending: DashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, admin: UserId) -> bool {
        self.pending.contains_key(&admin)
    }

    /// Open a connection and request a login code.
    pub async fn begin(&self, admin: UserId, request: LoginRequest) -> Result<(), SessionError> {
        self.cancel(admin).await;

        let phone = request.phone.clone();
        let login: Arc<dyn PendingLogin> = Arc::from(self.connector.begin_login(request).await?);
        if let Some(previous) = self.pending.insert(admin, login) {
            // A concurrent begin for the same admin won the race to the map.
            close_quietly(admin, previous).await;
        }
        tracing::info!(admin_id = admin, phone = %crate::model::mask_identifier(&phone), "Admin login started");
        Ok(())
    }

    pub async fn complete_code(
        &self,
        admin: UserId,
        code: &str,
    ) -> Result<LoginOutcome, SessionError> {
        let Some(login) = self.current(admin) else {
            return Ok(LoginOutcome::NoPending);
        };
        let step = login.submit_code(code).await?;
        Ok(self.advance(admin, login, step).await)
    }

    pub async fn complete_password(
        &self,
        admin: UserId,
        password: &str,
    ) -> Result<LoginOutcome, SessionError> {
        let Some(login) = self.current(admin) else {
            return Ok(LoginOutcome::NoPending);
        };
        let step = login.submit_password(password).await?;
        Ok(self.advance(admin, login, step).await)
    }

    /// Tear down the admin's pending login at any stage. Returns whether one existed.
    pub async fn cancel(&self, admin: UserId) -> bool {
        match self.pending.remove(&admin) {
            Some((_, login)) => {
                close_quietly(admin, login).await;
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) {
        let admins: Vec<UserId> = self.pending.iter().map(|e| *e.key()).collect();
        for admin in admins {
            self.cancel(admin).await;
        }
    }

    fn current(&self, admin: UserId) -> Option<Arc<dyn PendingLogin>> {
        self.pending.get(&admin).map(|e| e.value().clone())
    }

    async fn advance(
        &self,
        admin: UserId,
        login: Arc<dyn PendingLogin>,
        step: LoginStep,
    ) -> LoginOutcome {
        match step {
            LoginStep::Authorized(session) => {
                self.finish(admin, &login).await;
                tracing::info!(admin_id = admin, "Admin login completed");
                LoginOutcome::Ok(session)
            }
            // The code cannot be retried; the admin must begin again.
            LoginStep::CodeExpired => {
                self.finish(admin, &login).await;
                LoginOutcome::CodeExpired
            }
            LoginStep::InvalidCode => LoginOutcome::InvalidCode,
            LoginStep::NeedPassword => LoginOutcome::NeedPassword,
            LoginStep::InvalidPassword => LoginOutcome::InvalidPassword,
        }
    }

    /// Drop the login from the map only if it was not replaced meanwhile.
    async fn finish(&self, admin: UserId, login: &Arc<dyn PendingLogin>) {
        let removed = self
            .pending
            .remove_if(&admin, |_, current| Arc::ptr_eq(current, login));
        if removed.is_some() {
            close_quietly(admin, login.clone()).await;
        }
    }
}

async fn close_quietly(admin: UserId, login: Arc<dyn PendingLogin>) {
    if let Err(e) = login.close().await {
        tracing::warn!(admin_id = admin, error = %e, "Failed to close login connection");
    }
}
