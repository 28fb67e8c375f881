use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller credentials as sent alongside a request.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub userid: String,
    #[serde(rename = "authToken", alias = "auth_token")]
    pub auth_token: String,
}

impl Credentials {
    pub fn new(userid: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
            auth_token: auth_token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("userid", &self.userid)
            .field("auth_token", &"<redacted>")
            .finish()
    }
}

/// Gate evaluated before the engine does any work for a caller.
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, credentials: &Credentials) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&Credentials) -> bool + Send + Sync,
{
    fn is_authorized(&self, credentials: &Credentials) -> bool {
        self(credentials)
    }
}
