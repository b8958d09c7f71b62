use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Authentication context, resolved once per request. Handlers only ever ask
/// it for the current user id; they never touch session mechanics.
#[derive(Debug, Default)]
pub struct AuthContext {
    current: Option<AuthUser>,
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

impl AuthContext {
    pub fn current_user_id(&self) -> Option<&str> {
        self.current.as_ref().map(|u| u.user_id.as_str())
    }

    pub fn current_user(&self) -> Option<&AuthUser> {
        self.current.as_ref()
    }

    pub fn sign_in(&mut self, user_id: String, username: String) {
        self.current = Some(AuthUser { user_id, username });
    }

    pub fn sign_out(&mut self) {
        self.current = None;
    }
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub auth: AuthContext,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            auth: AuthContext::default(),
        }
    }
}
