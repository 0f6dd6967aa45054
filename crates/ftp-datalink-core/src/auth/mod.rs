//! Contains the [`UserDetail`] trait describing the authenticated user of a session.
//!
//! The session admission gate only needs a handful of facts about a user: the name used for
//! per-user accounting, whether the login is anonymous and whether the account may log in at all.
//! Applications typically implement this on the user type their authenticator already returns.
//!
//! ```
//! use ftp_datalink_core::auth::UserDetail;
//!
//! #[derive(Debug)]
//! struct Employee {
//!     login: String,
//!     suspended: bool,
//! }
//!
//! impl UserDetail for Employee {
//!     fn username(&self) -> &str {
//!         &self.login
//!     }
//!
//!     fn account_enabled(&self) -> bool {
//!         !self.suspended
//!     }
//! }
//!
//! let alice = Employee { login: "alice".to_string(), suspended: false };
//! assert!(!alice.is_anonymous());
//! ```

use std::fmt::{self, Debug, Display, Formatter};

/// Details of a user that are relevant when deciding whether a session may log in.
pub trait UserDetail: Send + Sync + Debug {
    /// The name the user logged in with. Used as the key for per-user login limits.
    fn username(&self) -> &str;

    /// Tells whether this is an anonymous login. The default implementation treats the names
    /// `anonymous` and `ftp` (case insensitive) as anonymous.
    fn is_anonymous(&self) -> bool {
        let name = self.username();
        name.eq_ignore_ascii_case("anonymous") || name.eq_ignore_ascii_case("ftp")
    }

    /// Tells whether the account may log in at all.
    fn account_enabled(&self) -> bool {
        true
    }
}

/// A [`UserDetail`] implementation that carries nothing but the user name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultUser {
    name: String,
}

impl DefaultUser {
    /// Creates a user with the given login name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        DefaultUser { name: name.into() }
    }

    /// The anonymous user.
    pub fn anonymous() -> Self {
        DefaultUser::new("anonymous")
    }
}

impl UserDetail for DefaultUser {
    fn username(&self) -> &str {
        &self.name
    }
}

impl Display for DefaultUser {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
