use crate::socks5::info::Socks5Info;
use crate::socks5::parser::parse_credentials;
use crate::socks5::protocol::{AuthMethod, AuthStatus};
use tracing::debug;

/// UserPass holds username/password credentials as dictated
/// server-side
#[derive(Clone, Debug)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// Socks5AuthValidator picks and checks the authentication method of a
/// relayed session. Implementations must be side-effect free.
pub trait Socks5AuthValidator: Send + Sync {
    /// get_auth_type selects one of the methods the client offered
    fn get_auth_type(&self, offered: &[u8]) -> AuthMethod;

    /// validate checks the auth-step payload against the selected method
    fn validate(&self, frame: &[u8], method: AuthMethod) -> AuthStatus;
}

/// Socks5Validator decides whether a command request may proceed
pub trait Socks5Validator: Send + Sync {
    fn validate(&self, info: &Socks5Info) -> bool;
}

/// AllowAllValidator lets every command through
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllValidator;

impl Socks5Validator for AllowAllValidator {
    fn validate(&self, _info: &Socks5Info) -> bool {
        true
    }
}

/// UserPassAuthValidator prefers username/password when credentials are
/// configured, and falls back to no-auth otherwise
#[derive(Debug, Default, Clone)]
pub struct UserPassAuthValidator {
    credentials: Option<UserPass>,
}

impl UserPassAuthValidator {
    pub fn new(credentials: Option<UserPass>) -> Self {
        Self { credentials }
    }
}

impl Socks5AuthValidator for UserPassAuthValidator {
    fn get_auth_type(&self, offered: &[u8]) -> AuthMethod {
        // Preferred auth method order
        let preferred: &[AuthMethod] = match self.credentials {
            Some(_) => &[AuthMethod::UserPass],
            None => &[AuthMethod::NoAuth],
        };

        // Iterate through preferences in order. If there's a match
        // return it
        for &method in preferred {
            if offered.contains(&(method as u8)) {
                return method;
            }
        }

        AuthMethod::NoAcceptable
    }

    fn validate(&self, frame: &[u8], method: AuthMethod) -> AuthStatus {
        match (method, &self.credentials) {
            (AuthMethod::NoAuth, None) => AuthStatus::Success,
            (AuthMethod::UserPass, Some(server_creds)) => match parse_credentials(frame) {
                Ok((username, password))
                    if username == server_creds.username && password == server_creds.password =>
                {
                    AuthStatus::Success
                }
                Ok((username, _)) => {
                    debug!("authentication failed for user {username}");
                    AuthStatus::Failure
                }
                Err(e) => {
                    debug!("malformed credentials: {e}");
                    AuthStatus::Failure
                }
            },
            _ => AuthStatus::Failure,
        }
    }
}
