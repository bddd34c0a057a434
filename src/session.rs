use async_trait::async_trait;
use parking_lot::RwLock;

/// 当前登录会话 - 提供 bearer token 和用户身份
///
/// The queue never acquires credentials itself, it only reads them and asks for a refresh
/// when the backend rejects the current token.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;

    /// Stable identifier of the signed in user, used to scope persisted history
    fn user_email(&self) -> Option<String>;

    /// Try to obtain a fresh token after a 401. `None` means the session is gone.
    async fn refresh(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Default)]
struct SessionState {
    access_token: Option<String>,
    user_email: Option<String>,
}

/// In-memory session, set by whoever performs the login
#[derive(Debug, Default)]
pub struct StaticSession {
    state: RwLock<SessionState>,
}

impl StaticSession {
    pub fn new(access_token: Option<String>, user_email: Option<String>) -> Self {
        Self {
            state: RwLock::new(SessionState {
                access_token,
                user_email,
            }),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn login(&self, access_token: impl Into<String>, user_email: impl Into<String>) {
        let mut state = self.state.write();
        state.access_token = Some(access_token.into());
        state.user_email = Some(user_email.into());
    }

    pub fn set_access_token(&self, access_token: impl Into<String>) {
        self.state.write().access_token = Some(access_token.into());
    }

    pub fn logout(&self) {
        let mut state = self.state.write();
        state.access_token = None;
        state.user_email = None;
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.read().access_token.is_some()
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    fn access_token(&self) -> Option<String> {
        self.state.read().access_token.clone()
    }

    fn user_email(&self) -> Option<String> {
        self.state.read().user_email.clone()
    }
}
