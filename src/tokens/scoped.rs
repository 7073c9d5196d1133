use super::record::{from_record, LABEL_USER_ID};
use super::system::{SystemTokenStore, TokenEvent};
use super::{AccessLevel, Token, TokenError, WriteOptions};
use crate::auth::{Authorizer, Caller, Decision, Resource, Verb};
use crate::store::{LabelSelector, ReadMode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Caller-facing token store.
///
/// Callers without the "manage credentials" capability only ever see their
/// own tokens. Other users' tokens are reported as not found rather than
/// forbidden, so their existence is never confirmed.
pub struct TokenStore {
    system: Arc<SystemTokenStore>,
    authorizer: Arc<dyn Authorizer>,
}

impl TokenStore {
    pub fn new(system: Arc<SystemTokenStore>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self { system, authorizer }
    }

    pub fn system(&self) -> &Arc<SystemTokenStore> {
        &self.system
    }

    fn full_access(&self, caller: &Caller, verb: Verb) -> bool {
        self.authorizer.authorize(caller, verb, Resource::AllTokens) == Decision::Allow
    }

    fn present(caller: &Caller, mut token: Token) -> Token {
        token.status.current = caller.session_token.as_deref() == Some(token.name.as_str());
        token.scrub();
        token
    }

    pub fn create(
        &self,
        caller: &Caller,
        mut token: Token,
        options: WriteOptions,
    ) -> Result<Token, TokenError> {
        if token.spec.user_id.is_empty() {
            token.spec.user_id = caller.user.clone();
        }
        if token.spec.user_id != caller.user && !self.full_access(caller, Verb::Create) {
            return Err(TokenError::Forbidden(format!(
                "user {} may not create tokens for user {}",
                caller.user, token.spec.user_id
            )));
        }

        if !token.spec.cluster_name.is_empty() {
            let cluster = token.spec.cluster_name.clone();
            self.system.check_cluster(&cluster)?;
            if self
                .authorizer
                .authorize(caller, Verb::Get, Resource::Cluster(&cluster))
                != Decision::Allow
            {
                return Err(TokenError::Forbidden(format!(
                    "user {} is not allowed to access cluster {}",
                    caller.user, cluster
                )));
            }
        }

        self.system.create(token, options)
    }

    pub fn get(&self, caller: &Caller, name: &str) -> Result<Token, TokenError> {
        let record = self.system.get_record(name, ReadMode::Cached)?;
        let owner = record.field(super::FIELD_USER_ID).unwrap_or_default();
        if owner != caller.user
            && !self.full_access(caller, Verb::Get)
            && self
                .authorizer
                .authorize(caller, Verb::Get, Resource::Token(name))
                != Decision::Allow
        {
            return Err(TokenError::NotFound(name.to_string()));
        }

        let token = from_record(&record, self.system.now())?;
        Ok(Self::present(caller, token))
    }

    pub fn list(&self, caller: &Caller) -> Result<Vec<Token>, TokenError> {
        let tokens = if self.full_access(caller, Verb::List) {
            self.system.list(&LabelSelector::everything(), ReadMode::Cached)?
        } else {
            self.system.list_for_user(&caller.user)?
        };

        Ok(tokens
            .into_iter()
            .map(|token| Self::present(caller, token))
            .collect())
    }

    pub fn update(
        &self,
        caller: &Caller,
        token: Token,
        options: WriteOptions,
    ) -> Result<Token, TokenError> {
        let record = self.system.get_record(&token.name, ReadMode::Consistent)?;
        let owner = record.field(super::FIELD_USER_ID).unwrap_or_default();

        let level = if self.full_access(caller, Verb::Update) {
            AccessLevel::Elevated
        } else if owner == caller.user {
            AccessLevel::Owner
        } else if self
            .authorizer
            .authorize(caller, Verb::Update, Resource::Token(&token.name))
            == Decision::Allow
        {
            AccessLevel::None
        } else {
            return Err(TokenError::NotFound(token.name));
        };

        let updated = self.system.update(token, level, options)?;
        Ok(Self::present(caller, updated))
    }

    /// Deletes a token the caller owns, or any token with full access.
    ///
    /// A record that cannot be read back as a token counts as owned by
    /// nobody, so only full-access callers can remove it.
    pub fn delete(&self, caller: &Caller, name: &str) -> Result<(), TokenError> {
        let owner = match self.system.get_record(name, ReadMode::Consistent) {
            Ok(record) => match from_record(&record, self.system.now()) {
                Ok(token) => Some(token.spec.user_id),
                Err(e) => {
                    warn!(token = %name, error = %e, "Deleting unreadable token record");
                    None
                }
            },
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => {
                warn!(token = %name, error = %e, "Could not read token before delete");
                None
            }
        };

        let owned = owner.as_deref() == Some(caller.user.as_str());
        if !owned && !self.full_access(caller, Verb::Delete) {
            return Err(TokenError::NotFound(name.to_string()));
        }

        self.system.delete(name)
    }

    /// Deletes every token visible to the caller. Returns the deleted names.
    pub fn delete_collection(&self, caller: &Caller) -> Result<Vec<String>, TokenError> {
        let selector = if self.full_access(caller, Verb::Delete) {
            LabelSelector::everything()
        } else {
            LabelSelector::eq(LABEL_USER_ID, caller.user.clone())
        };

        let mut deleted = Vec::new();
        for record in self.system.list_records(&selector)? {
            self.system.delete(&record.name)?;
            deleted.push(record.name);
        }

        info!(user = %caller.user, count = deleted.len(), "Token collection deleted");
        Ok(deleted)
    }

    /// Streams changes of the tokens visible to the caller.
    pub fn watch(&self, caller: &Caller, cancel: CancellationToken) -> mpsc::Receiver<TokenEvent> {
        let full_access = self.full_access(caller, Verb::Watch);
        let caller = caller.clone();
        self.system.watch(
            move |token| {
                (full_access || token.spec.user_id == caller.user)
                    .then(|| Self::present(&caller, token))
            },
            cancel,
        )
    }
}
