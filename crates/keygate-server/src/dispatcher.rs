use std::sync::Arc;

use chrono::Utc;
use keygate_config::Config;
use keygate_contracts::{CommandKind, DispatchOutcome, InboundMessage};
use keygate_kernel::{
    audit_line, classify, has_role, invoke_failed_reply, invoke_success_reply, key_fingerprint,
    key_generated_reply, methods_reply, render_template, role_grant_failed_reply,
    upstream_body_reply, Command, Invocation, ALREADY_REDEEMED_REPLY, INVALID_METHOD_REPLY,
    INVOKE_DENIED_REPLY, INVOKE_USAGE_REPLY, KEYGEN_DENIED_REPLY, KEYGEN_SAVE_FAILED_REPLY,
    REDEEMED_REPLY, REDEEM_SAVE_FAILED_REPLY, REDEEM_USAGE_REPLY, ROLE_LOOKUP_FAILED_REPLY,
    UNKNOWN_KEY_REPLY,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::key_store::{KeyStore, KeyStoreError};
use crate::platform::{PlatformClient, PlatformError};
use crate::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Invoke,
    KeyGen,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("caller lacks the role for {0:?}")]
    AuthorizationDenied(Gate),
    #[error("malformed command: {0}")]
    MalformedCommand(&'static str),
    #[error(transparent)]
    UpstreamRequestFailed(#[from] UpstreamError),
    #[error("key already redeemed")]
    AlreadyRedeemed,
    #[error("key was never issued")]
    UnknownKey,
    #[error("role lookup failed: {0}")]
    RoleLookupFailed(PlatformError),
    #[error("role grant failed: {0}")]
    RoleGrantFailed(PlatformError),
    #[error("persistence failed during {0:?}: {1}")]
    PersistenceError(CommandKind, String),
}

impl CommandError {
    /// The plain-text reply shown to the caller.
    pub fn reply(&self) -> String {
        match self {
            CommandError::AuthorizationDenied(Gate::Invoke) => INVOKE_DENIED_REPLY.to_string(),
            CommandError::AuthorizationDenied(Gate::KeyGen) => KEYGEN_DENIED_REPLY.to_string(),
            CommandError::MalformedCommand(reply) => reply.to_string(),
            CommandError::UpstreamRequestFailed(e) => invoke_failed_reply(&e.to_string()),
            CommandError::AlreadyRedeemed => ALREADY_REDEEMED_REPLY.to_string(),
            CommandError::UnknownKey => UNKNOWN_KEY_REPLY.to_string(),
            CommandError::RoleLookupFailed(_) => ROLE_LOOKUP_FAILED_REPLY.to_string(),
            CommandError::RoleGrantFailed(e) => role_grant_failed_reply(&e.to_string()),
            CommandError::PersistenceError(CommandKind::KeyGen, _) => {
                KEYGEN_SAVE_FAILED_REPLY.to_string()
            }
            CommandError::PersistenceError(_, _) => REDEEM_SAVE_FAILED_REPLY.to_string(),
        }
    }
}

impl From<KeyStoreError> for CommandError {
    fn from(e: KeyStoreError) -> Self {
        match e {
            KeyStoreError::AlreadyRedeemed => CommandError::AlreadyRedeemed,
            KeyStoreError::UnknownKey => CommandError::UnknownKey,
            KeyStoreError::Persistence(msg) => {
                CommandError::PersistenceError(CommandKind::Redeem, msg)
            }
        }
    }
}

/// Turns one inbound message into replies and an optional audit record.
///
/// Holds no per-message state. Configuration other than the key sets is read
/// only; the key sets are reached exclusively through [`KeyStore`].
pub struct Dispatcher {
    cfg: Arc<Config>,
    bot_user_id: Option<String>,
    keys: Arc<KeyStore>,
    upstream: UpstreamClient,
    platform: Arc<PlatformClient>,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        bot_user_id: Option<String>,
        keys: Arc<KeyStore>,
        upstream: UpstreamClient,
        platform: Arc<PlatformClient>,
    ) -> Self {
        Self {
            cfg,
            bot_user_id,
            keys,
            upstream,
            platform,
        }
    }

    pub async fn dispatch(&self, msg: &InboundMessage) -> DispatchOutcome {
        let handled_at = Utc::now().to_rfc3339();

        if self.bot_user_id.as_deref() == Some(msg.author.id.as_str()) {
            return DispatchOutcome::silent(&msg.message_id, CommandKind::SelfMessage, handled_at);
        }

        let roles = match self
            .platform
            .member_roles(&msg.guild_id, &msg.author.id)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(user = %msg.author.id, error = %e, "role lookup failed");
                let err = CommandError::RoleLookupFailed(e);
                return self.outcome(
                    msg,
                    CommandKind::RoleLookupFailed,
                    vec![err.reply()],
                    None,
                    handled_at,
                );
            }
        };

        let command = classify(&msg.content);
        let (kind, replies, audit) = match command {
            Command::ListMethods => {
                let reply = methods_reply(
                    self.cfg
                        .methods
                        .iter()
                        .map(|(name, m)| (name.as_str(), m.description.as_str())),
                );
                (CommandKind::ListMethods, vec![reply], Some(self.audit_for(msg)))
            }
            Command::InvokeUsage => (
                CommandKind::Invoke,
                vec![CommandError::MalformedCommand(INVOKE_USAGE_REPLY).reply()],
                None,
            ),
            Command::Invoke(invocation) => self.invoke(msg, &roles, &invocation).await,
            Command::KeyGen => {
                let replies = match self.keygen(&roles).await {
                    Ok(key) => vec![key_generated_reply(&key)],
                    Err(e) => vec![e.reply()],
                };
                (CommandKind::KeyGen, replies, None)
            }
            Command::RedeemUsage => (
                CommandKind::Redeem,
                vec![CommandError::MalformedCommand(REDEEM_USAGE_REPLY).reply()],
                None,
            ),
            Command::Redeem(key) => {
                let reply = match self.redeem(msg, &key).await {
                    Ok(()) => REDEEMED_REPLY.to_string(),
                    Err(e) => e.reply(),
                };
                (CommandKind::Redeem, vec![reply], None)
            }
            Command::Ignore => (CommandKind::Ignored, Vec::new(), None),
        };

        self.outcome(msg, kind, replies, audit, handled_at)
    }

    async fn invoke(
        &self,
        msg: &InboundMessage,
        roles: &[String],
        invocation: &Invocation,
    ) -> (CommandKind, Vec<String>, Option<String>) {
        let Some(endpoint) = self.cfg.endpoint(&invocation.method) else {
            let err = CommandError::MalformedCommand(INVALID_METHOD_REPLY);
            return (CommandKind::Invoke, vec![err.reply()], None);
        };
        if !has_role(roles, &self.cfg.allowed_role_id) {
            info!(user = %msg.author.id, method = %invocation.method, "invoke denied");
            let err = CommandError::AuthorizationDenied(Gate::Invoke);
            return (CommandKind::Invoke, vec![err.reply()], None);
        }

        let url = render_template(&endpoint.url, &invocation.bindings);
        let replies = match self.upstream.send(&url).await {
            Ok(body) => {
                info!(user = %msg.author.id, method = %invocation.method, "invoke succeeded");
                vec![invoke_success_reply(invocation), upstream_body_reply(&body)]
            }
            Err(e) => {
                warn!(
                    user = %msg.author.id,
                    method = %invocation.method,
                    error = %e,
                    "invoke failed"
                );
                vec![CommandError::from(e).reply()]
            }
        };
        (CommandKind::Invoke, replies, Some(self.audit_for(msg)))
    }

    async fn keygen(&self, roles: &[String]) -> Result<String, CommandError> {
        if !has_role(roles, &self.cfg.key_role_id) {
            return Err(CommandError::AuthorizationDenied(Gate::KeyGen));
        }
        self.keys.generate().await.map_err(|e| match e {
            KeyStoreError::Persistence(msg) => {
                CommandError::PersistenceError(CommandKind::KeyGen, msg)
            }
            other => CommandError::from(other),
        })
    }

    /// Grant happens before the redemption is saved; the key store lock is not
    /// held across the grant.
    async fn redeem(&self, msg: &InboundMessage, key: &str) -> Result<(), CommandError> {
        self.keys.reserve(key).await?;

        if let Err(e) = self
            .platform
            .add_member_role(&msg.guild_id, &msg.author.id, &self.cfg.role_to_assign)
            .await
        {
            self.keys.release(key).await;
            warn!(
                user = %msg.author.id,
                key = %key_fingerprint(key),
                error = %e,
                "role grant failed"
            );
            return Err(CommandError::RoleGrantFailed(e));
        }

        self.keys.commit(key).await.map_err(|e| {
            warn!(
                user = %msg.author.id,
                key = %key_fingerprint(key),
                "role granted but redemption not saved"
            );
            CommandError::from(e)
        })
    }

    fn audit_for(&self, msg: &InboundMessage) -> String {
        audit_line(&msg.content, &msg.author.username, &msg.channel_id)
    }

    fn outcome(
        &self,
        msg: &InboundMessage,
        command: CommandKind,
        replies: Vec<String>,
        audit: Option<String>,
        handled_at: String,
    ) -> DispatchOutcome {
        debug!(
            message_id = %msg.message_id,
            ?command,
            replies = replies.len(),
            "message dispatched"
        );
        DispatchOutcome {
            message_id: msg.message_id.clone(),
            command,
            replies,
            audit,
            handled_at,
        }
    }
}
