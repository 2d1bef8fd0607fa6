//! Bot identity records and session authorization.
//!
//! The resumption layer does not authenticate users itself (the inner SSH
//! server does), but resumable sessions are authorized against the bot
//! identity model: the wrapper consults a [`SessionAuthorizer`] before
//! creating a session and again before every reattachment, and the inner
//! SSH server can record the identity it authenticated on the connection
//! for later checks.

use std::net::SocketAddr;

use async_trait::async_trait;
use limpet_platform::{LimpetError, LimpetResult};

/// Returns the canonical resource name for a named bot.
///
/// # Example
///
/// ```rust
/// use limpet_proto::resume::identity::bot_resource_name;
///
/// assert_eq!(bot_resource_name("deploy agent"), "bot-deploy-agent");
/// ```
pub fn bot_resource_name(bot_name: &str) -> String {
    format!("bot-{}", bot_name.replace(' ', "-"))
}

/// Identity a session acts under once the inner SSH server has
/// authenticated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    /// Human-chosen bot name.
    pub bot_name: String,
    /// The user record the bot acts as.
    pub user_name: String,
    /// Roles granted to the bot user.
    pub roles: Vec<String>,
}

impl BotIdentity {
    /// Creates an identity whose user name follows the bot naming scheme.
    pub fn new(bot_name: impl Into<String>, roles: Vec<String>) -> Self {
        let bot_name = bot_name.into();
        let user_name = bot_resource_name(&bot_name);
        Self {
            bot_name,
            user_name,
            roles,
        }
    }

    /// Validates the record.
    ///
    /// # Errors
    ///
    /// Returns [`LimpetError::Config`] if the bot name is empty or the
    /// user name does not follow the bot naming scheme.
    pub fn validate(&self) -> LimpetResult<()> {
        if self.bot_name.is_empty() {
            return Err(LimpetError::Config("bot name must be set".to_string()));
        }
        if self.user_name != bot_resource_name(&self.bot_name) {
            return Err(LimpetError::Config(format!(
                "user name '{}' does not match bot '{}'",
                self.user_name, self.bot_name
            )));
        }
        Ok(())
    }
}

/// Authorization hook consulted by the server wrapper.
///
/// Implementations decide whether a remote peer may open a resumable
/// session and whether it may reattach to an existing one. The identity is
/// present on reattachment only if the inner SSH server recorded one.
#[async_trait]
pub trait SessionAuthorizer: Send + Sync {
    /// Authorizes creation of a new resumable session.
    async fn authorize_new(&self, remote: Option<SocketAddr>) -> LimpetResult<()>;

    /// Authorizes reattachment to an existing session.
    async fn authorize_resume(
        &self,
        remote: Option<SocketAddr>,
        identity: Option<&BotIdentity>,
    ) -> LimpetResult<()>;
}

/// Authorizer that admits every session; the default.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl SessionAuthorizer for AllowAllAuthorizer {
    async fn authorize_new(&self, _remote: Option<SocketAddr>) -> LimpetResult<()> {
        Ok(())
    }

    async fn authorize_resume(
        &self,
        _remote: Option<SocketAddr>,
        _identity: Option<&BotIdentity>,
    ) -> LimpetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bot_resource_name() {
        assert_eq!(bot_resource_name("ci"), "bot-ci");
        assert_eq!(bot_resource_name("deploy agent"), "bot-deploy-agent");
    }

    #[test]
    fn test_identity_new_derives_user_name() {
        let identity = BotIdentity::new("ci", vec!["access".to_string()]);
        assert_eq!(identity.user_name, "bot-ci");
        assert!(identity.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_name() {
        let identity = BotIdentity {
            bot_name: String::new(),
            user_name: "bot-".to_string(),
            roles: vec![],
        };
        assert!(matches!(
            identity.validate(),
            Err(LimpetError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_mismatched_user() {
        let identity = BotIdentity {
            bot_name: "ci".to_string(),
            user_name: "alice".to_string(),
            roles: vec![],
        };
        assert!(matches!(
            identity.validate(),
            Err(LimpetError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_allow_all() {
        let authorizer = AllowAllAuthorizer;
        assert!(authorizer.authorize_new(None).await.is_ok());
        assert!(authorizer.authorize_resume(None, None).await.is_ok());
    }
}
