use std::collections::HashSet;
use std::sync::RwLock;

/// Authenticated identity behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user: String,
    /// Name of the token the request authenticated with, if any.
    pub session_token: Option<String>,
}

impl Caller {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            session_token: None,
        }
    }

    pub fn with_session(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Get,
    List,
    Watch,
    Update,
    Delete,
}

/// What an authorization question is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource<'a> {
    /// Tokens of every user: the "manage credentials" capability.
    AllTokens,
    /// A single named token.
    Token(&'a str),
    /// A downstream cluster.
    Cluster(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Permission oracle.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, caller: &Caller, verb: Verb, resource: Resource<'_>) -> Decision;
}

/// Grant-list authorizer.
///
/// Administrators are allowed everything. Other users need an explicit
/// cluster or per-token grant.
#[derive(Debug, Default)]
pub struct StaticAuthorizer {
    administrators: RwLock<HashSet<String>>,
    cluster_grants: RwLock<HashSet<(String, String)>>,
    token_grants: RwLock<HashSet<(String, String)>>,
}

impl StaticAuthorizer {
    pub fn new<I, S>(administrators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let authorizer = Self::default();
        for admin in administrators {
            authorizer.add_administrator(admin);
        }
        authorizer
    }

    pub fn add_administrator(&self, user: impl Into<String>) {
        if let Ok(mut admins) = self.administrators.write() {
            admins.insert(user.into());
        }
    }

    /// Allows `user` to read `cluster`.
    pub fn grant_cluster(&self, user: impl Into<String>, cluster: impl Into<String>) {
        if let Ok(mut grants) = self.cluster_grants.write() {
            grants.insert((user.into(), cluster.into()));
        }
    }

    /// Allows `user` to get and update the token `token` without owning it.
    pub fn grant_token(&self, user: impl Into<String>, token: impl Into<String>) {
        if let Ok(mut grants) = self.token_grants.write() {
            grants.insert((user.into(), token.into()));
        }
    }

    fn is_administrator(&self, user: &str) -> bool {
        self.administrators
            .read()
            .map(|admins| admins.contains(user))
            .unwrap_or(false)
    }

    fn has_grant(grants: &RwLock<HashSet<(String, String)>>, user: &str, target: &str) -> bool {
        grants
            .read()
            .map(|g| g.contains(&(user.to_string(), target.to_string())))
            .unwrap_or(false)
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(&self, caller: &Caller, verb: Verb, resource: Resource<'_>) -> Decision {
        if self.is_administrator(&caller.user) {
            return Decision::Allow;
        }

        let allowed = match resource {
            Resource::AllTokens => false,
            Resource::Cluster(cluster) => {
                verb == Verb::Get && Self::has_grant(&self.cluster_grants, &caller.user, cluster)
            }
            Resource::Token(token) => {
                matches!(verb, Verb::Get | Verb::Update)
                    && Self::has_grant(&self.token_grants, &caller.user, token)
            }
        };

        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}
