//! Caller identification for bucket selection.
//!
//! Rate limiting groups requests by who sent them; the idempotency step uses the
//! client-supplied key alone and never consults this module.

use crate::config::CoordinationConfig;
use crate::policy::Scope;
use http::{Extensions, HeaderMap};

/// Identity established by an upstream authentication layer.
///
/// When present as a request extension it wins over any header, since headers are
/// client-controlled.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerIdentity {
    /// Authenticated participant.
    pub participant_id: Option<String>,
    /// Authenticated end user, when known.
    pub user_id: Option<String>,
}

impl CallerIdentity {
    /// Identity carrying only a participant.
    pub fn participant(id: impl Into<String>) -> Self {
        Self { participant_id: Some(id.into()), user_id: None }
    }

    /// Add the end user.
    pub fn with_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    fn for_scope(&self, scope: Scope) -> Option<&str> {
        let preferred = match scope {
            Scope::Participant => self.participant_id.as_deref(),
            Scope::User => self.user_id.as_deref().or(self.participant_id.as_deref()),
        };
        preferred.filter(|id| !id.is_empty())
    }
}

/// Picks the bucket identifier for a request.
pub trait IdentityResolver: Send + Sync + std::fmt::Debug {
    /// Identifier for a bucket of the given scope. Must never be empty.
    fn resolve(
        &self,
        headers: &HeaderMap,
        extensions: &Extensions,
        scope: Scope,
        config: &CoordinationConfig,
    ) -> String;
}

/// Default resolver: request extension, then headers, then the anonymous identifier.
///
/// Participant-scoped policies read the participant header. User-scoped policies
/// read the user header and fall back to the participant header.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderIdentity;

impl IdentityResolver for HeaderIdentity {
    fn resolve(
        &self,
        headers: &HeaderMap,
        extensions: &Extensions,
        scope: Scope,
        config: &CoordinationConfig,
    ) -> String {
        if let Some(id) = extensions.get::<CallerIdentity>().and_then(|c| c.for_scope(scope)) {
            return id.to_string();
        }

        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let from_headers = match scope {
            Scope::Participant => header(&config.participant_header),
            Scope::User => header(&config.user_header).or_else(|| header(&config.participant_header)),
        };

        from_headers.unwrap_or(config.anonymous_identifier.as_str()).to_string()
    }
}
