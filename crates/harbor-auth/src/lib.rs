//! Credential storage, refresh, and per-session materialization.
//!
//! Two credential kinds exist: a plain API key and OAuth tokens. The
//! [`store::CredentialStore`] owns the on-disk record (0600, atomic writes,
//! refresh/revoke against the provider's endpoints); the
//! [`manager::AuthManager`] applies the configured selection policy and
//! turns whichever kind wins into a per-session bundle of environment
//! variables plus the auth-file bytes injected into the sandbox.

pub mod error;
pub mod manager;
pub mod record;
pub mod store;

pub use error::{AuthError, Result};
pub use manager::{AuthManager, AuthMethod, CredentialBundle};
pub use record::{CredentialRecord, OauthTokens};
pub use store::CredentialStore;
