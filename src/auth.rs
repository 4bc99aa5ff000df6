use std::sync::{Arc, RwLock};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use log::{debug, info};
use serde_json::Value;
use tokio::sync::watch;

use crate::models::{ChatCredential, UserType};

/// Profile the host application keeps next to its login token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub user_type: UserType,
}

/// Read access to the host application's login session.
pub trait SessionSource: Send + Sync {
    fn login_token(&self) -> Option<String>;
    fn profile(&self) -> Option<UserProfile>;
}

/// Session storage held in memory.
#[derive(Default)]
pub struct MemorySession {
    inner: RwLock<(Option<String>, Option<UserProfile>)>,
}

impl MemorySession {
    pub fn new(token: Option<String>, profile: Option<UserProfile>) -> Self {
        MemorySession {
            inner: RwLock::new((token, profile)),
        }
    }

    pub fn login(&self, token: String, profile: Option<UserProfile>) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = (Some(token), profile);
        }
    }

    pub fn logout(&self) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = (None, None);
        }
    }
}

impl SessionSource for MemorySession {
    fn login_token(&self) -> Option<String> {
        self.inner.read().ok().and_then(|inner| inner.0.clone())
    }

    fn profile(&self) -> Option<UserProfile> {
        self.inner.read().ok().and_then(|inner| inner.1.clone())
    }
}

pub struct Authenticator {
    source: Arc<dyn SessionSource>,
    credential: watch::Sender<ChatCredential>,
}

impl Authenticator {
    pub fn new(source: Arc<dyn SessionSource>) -> Self {
        let initial = derive_credential(source.as_ref());
        let (credential, _) = watch::channel(initial);
        Authenticator { source, credential }
    }

    pub fn credential(&self) -> ChatCredential {
        self.credential.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatCredential> {
        self.credential.subscribe()
    }

    /// Re-reads the host session. Subscribers are only woken on change.
    pub fn refresh(&self) -> ChatCredential {
        let next = derive_credential(self.source.as_ref());
        self.credential.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                info!(
                    "Chat credential changed (authenticated: {})",
                    next.authenticated
                );
                *current = next.clone();
                true
            }
        });
        next
    }

    pub fn clear(&self) {
        info!("Chat credential cleared");
        self.credential.send_replace(ChatCredential::unauthenticated());
    }
}

fn derive_credential(source: &dyn SessionSource) -> ChatCredential {
    let Some(token) = source.login_token().filter(|t| !t.is_empty()) else {
        return ChatCredential::unauthenticated();
    };
    let Some(claims) = decode_claims(&token) else {
        debug!("Login token is malformed, treating session as logged out");
        return ChatCredential::unauthenticated();
    };
    if let Some(exp) = claims.get("exp").and_then(Value::as_i64) {
        if exp <= Utc::now().timestamp() {
            debug!("Login token expired at {}", exp);
            return ChatCredential::unauthenticated();
        }
    }

    let profile = source.profile();
    let user_id = profile
        .as_ref()
        .map(|p| p.user_id.clone())
        .or_else(|| claim_string(&claims, "userId"))
        .or_else(|| claim_string(&claims, "sub"));
    let Some(user_id) = user_id.filter(|id| !id.is_empty()) else {
        return ChatCredential::unauthenticated();
    };
    let user_type = profile
        .map(|p| p.user_type)
        .or_else(|| {
            claims
                .get("userType")
                .and_then(Value::as_str)
                .and_then(UserType::parse)
        })
        .unwrap_or(UserType::Web);

    ChatCredential {
        token,
        user_id,
        user_type,
        authenticated: true,
    }
}

/// Decodes the payload segment of a JWT without verifying the signature.
fn decode_claims(token: &str) -> Option<serde_json::Map<String, Value>> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    match serde_json::from_slice::<Value>(&bytes).ok()? {
        Value::Object(claims) => Some(claims),
        _ => None,
    }
}

fn claim_string(claims: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match claims.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn token_with(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.signature")
    }

    fn authenticator(token: Option<String>, profile: Option<UserProfile>) -> Authenticator {
        Authenticator::new(Arc::new(MemorySession::new(token, profile)))
    }

    #[test]
    fn missing_session_is_unauthenticated() {
        let auth = authenticator(None, None);
        assert!(!auth.credential().authenticated);
    }

    #[test]
    fn malformed_token_is_unauthenticated() {
        for token in ["garbage", "a.b", "a.!!!.c", "a.b.c.d"] {
            let auth = authenticator(Some(token.to_string()), None);
            assert!(!auth.credential().authenticated, "{token}");
        }
        let not_object = format!("h.{}.s", URL_SAFE_NO_PAD.encode("[1,2]"));
        assert!(!authenticator(Some(not_object), None).credential().authenticated);
    }

    #[test]
    fn claims_fill_in_missing_profile() {
        let token = token_with(&json!({"sub": 31, "userType": "app"}));
        let credential = authenticator(Some(token.clone()), None).credential();
        assert!(credential.authenticated);
        assert_eq!(credential.user_id, "31");
        assert_eq!(credential.user_type, UserType::App);
        assert_eq!(credential.token, token);
    }

    #[test]
    fn profile_takes_precedence_over_claims() {
        let token = token_with(&json!({"userId": "from-token"}));
        let profile = UserProfile {
            user_id: "customer_9".into(),
            user_type: UserType::Web,
        };
        let credential = authenticator(Some(token), Some(profile)).credential();
        assert_eq!(credential.user_id, "customer_9");
        assert_eq!(credential.user_type, UserType::Web);
    }

    #[test]
    fn expired_token_is_unauthenticated() {
        let token = token_with(&json!({"sub": "1", "exp": Utc::now().timestamp() - 60}));
        assert!(!authenticator(Some(token), None).credential().authenticated);
    }

    #[test]
    fn clear_notifies_subscribers() {
        let token = token_with(&json!({"sub": "1"}));
        let auth = authenticator(Some(token), None);
        let mut rx = auth.subscribe();
        assert!(rx.borrow_and_update().authenticated);

        auth.clear();
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().authenticated);
    }

    #[test]
    fn refresh_picks_up_new_login() {
        let session = Arc::new(MemorySession::default());
        let auth = Authenticator::new(session.clone());
        let mut rx = auth.subscribe();
        assert!(!auth.credential().authenticated);

        session.login(token_with(&json!({"sub": "5"})), None);
        assert!(auth.refresh().authenticated);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        auth.refresh();
        assert!(!rx.has_changed().unwrap());
    }
}
