//! ACL token slots and their persistence.
//!
//! Each slot remembers where its value came from. Tokens set through the
//! API outlive restarts when token persistence is enabled, and then take
//! precedence over the config file.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use vigil_core::TokensConfig;
use vigil_persist::{PersistResult, PersistedTokens, Persistence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Default token for requests without one.
    User,
    /// Token the agent uses for its own operations.
    Agent,
    AgentMaster,
    Replication,
}

impl TokenKind {
    pub const ALL: [TokenKind; 4] = [
        TokenKind::User,
        TokenKind::Agent,
        TokenKind::AgentMaster,
        TokenKind::Replication,
    ];

    /// Name of the slot in config and in the token file.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::User => "default",
            TokenKind::Agent => "agent",
            TokenKind::AgentMaster => "agent_master",
            TokenKind::Replication => "replication",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenSource {
    #[default]
    Config,
    Api,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    value: String,
    source: TokenSource,
}

pub struct TokenStore {
    slots: RwLock<HashMap<TokenKind, Slot>>,
    persistence: Option<Persistence>,
    enable_persistence: bool,
}

impl TokenStore {
    pub fn new(persistence: Option<Persistence>, enable_persistence: bool) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            persistence,
            enable_persistence,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TokenKind, Slot>> {
        match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TokenKind, Slot>> {
        match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn token(&self, kind: TokenKind) -> String {
        self.read()
            .get(&kind)
            .map(|s| s.value.clone())
            .unwrap_or_default()
    }

    pub fn source(&self, kind: TokenKind) -> TokenSource {
        self.read().get(&kind).map(|s| s.source).unwrap_or_default()
    }

    pub fn user_token(&self) -> String {
        self.token(TokenKind::User)
    }

    /// The agent token, or the user token when none is set.
    pub fn agent_token(&self) -> String {
        let agent = self.token(TokenKind::Agent);
        if agent.is_empty() {
            self.user_token()
        } else {
            agent
        }
    }

    pub fn agent_master_token(&self) -> String {
        self.token(TokenKind::AgentMaster)
    }

    pub fn replication_token(&self) -> String {
        self.token(TokenKind::Replication)
    }

    fn set(&self, kind: TokenKind, value: &str, source: TokenSource) {
        self.write().insert(
            kind,
            Slot {
                value: value.to_string(),
                source,
            },
        );
    }

    /// Set a token through the API and, when enabled, persist every
    /// API-sourced token.
    pub fn update_token(&self, kind: TokenKind, value: &str) -> PersistResult<()> {
        self.set(kind, value, TokenSource::Api);
        if !self.enable_persistence {
            return Ok(());
        }
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };

        let api = |kind: TokenKind| {
            let slots = self.read();
            slots
                .get(&kind)
                .filter(|s| s.source == TokenSource::Api)
                .map(|s| s.value.clone())
                .unwrap_or_default()
        };
        persistence.persist_tokens(&PersistedTokens {
            replication: api(TokenKind::Replication),
            agent_master: api(TokenKind::AgentMaster),
            default: api(TokenKind::User),
            agent: api(TokenKind::Agent),
        })
    }

    /// Fill every slot: a persisted non-empty value wins, otherwise the
    /// config value. An unreadable token file is returned as an error after
    /// the config values have been applied.
    pub fn load_tokens(&self, config: &TokensConfig) -> PersistResult<()> {
        let (persisted, load_err) = match (&self.persistence, self.enable_persistence) {
            (Some(p), true) => match p.load_tokens() {
                Ok(tokens) => (tokens.unwrap_or_default(), None),
                Err(e) => {
                    warn!(error = %e, "unable to load persisted tokens");
                    (PersistedTokens::default(), Some(e))
                }
            },
            _ => (PersistedTokens::default(), None),
        };

        for kind in TokenKind::ALL {
            let (stored, configured) = match kind {
                TokenKind::User => (&persisted.default, &config.default),
                TokenKind::Agent => (&persisted.agent, &config.agent),
                TokenKind::AgentMaster => (&persisted.agent_master, &config.agent_master),
                TokenKind::Replication => (&persisted.replication, &config.replication),
            };
            if stored.is_empty() {
                self.set(kind, configured, TokenSource::Config);
            } else {
                if !configured.is_empty() {
                    warn!(
                        token = kind.as_str(),
                        "token present in both the configuration and persisted token store, using the persisted token"
                    );
                }
                self.set(kind, stored, TokenSource::Api);
            }
        }

        match load_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
