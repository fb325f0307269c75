//! Named rate-limit policies and the catalogue that serves them.
//!
//! A policy is static configuration: how large a bucket is, how fast it refills, and
//! what each response outcome costs. The reference catalogue mirrors the directory
//! API's published limits:
//!
//! | Policy | Refill/min | Capacity | 2xx | 404 | other | 5xx exempt |
//! |---|---|---|---|---|---|---|
//! | `ENTRIES_WRITE` | 1200 | 36000 | 1 | 1 | 1 | yes |
//! | `ENTRIES_UPDATE` | 600 | 600 | 1 | 1 | 1 | yes |
//! | `ENTRIES_READ_PARTICIPANT_ANTISCAN` | 2 | 50 | 1 | 3 | 1 | yes |
//!
//! The read policy charges 3 tokens for a miss so that probing many keys (scanning)
//! drains the bucket far faster than legitimate lookups do.

use crate::error::PolicyError;
use serde::Deserialize;
use std::borrow::{Borrow, Cow};
use std::collections::HashMap;
use std::fmt;

/// Identifier of a rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct PolicyName(Cow<'static, str>);

impl PolicyName {
    /// Applies to entry creation and deletion.
    pub const ENTRIES_WRITE: PolicyName = PolicyName(Cow::Borrowed("ENTRIES_WRITE"));
    /// Applies to entry updates.
    pub const ENTRIES_UPDATE: PolicyName = PolicyName(Cow::Borrowed("ENTRIES_UPDATE"));
    /// Applies to entry lookups by a participant (antiscan).
    pub const ENTRIES_READ_PARTICIPANT_ANTISCAN: PolicyName =
        PolicyName(Cow::Borrowed("ENTRIES_READ_PARTICIPANT_ANTISCAN"));

    /// Build a name from any string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    /// Borrow the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PolicyName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for PolicyName {
    fn from(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

/// Who shares a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One bucket per participant, shared by all of its end users.
    Participant,
    /// One bucket per end user.
    User,
}

/// Response outcome classes that carry distinct token costs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeClass {
    /// 2xx.
    Success,
    /// 404.
    NotFound,
    /// Any other non-5xx status.
    Other,
    /// 5xx.
    ServerError,
}

impl OutcomeClass {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            404 => Self::NotFound,
            500..=599 => Self::ServerError,
            _ => Self::Other,
        }
    }
}

/// Token cost per outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CostSchedule {
    /// Cost of a 2xx response.
    pub success: u32,
    /// Cost of a 404 response.
    pub not_found: u32,
    /// Cost of any other non-5xx response.
    pub other: u32,
    /// Cost of a 5xx response when 5xx outcomes are not exempt.
    pub server_error: u32,
}

impl CostSchedule {
    /// Every outcome costs `cost`.
    pub const fn uniform(cost: u32) -> Self {
        Self { success: cost, not_found: cost, other: cost, server_error: cost }
    }
}

impl Default for CostSchedule {
    fn default() -> Self {
        Self::uniform(1)
    }
}

/// Immutable rate-limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    name: PolicyName,
    scope: Scope,
    refill_per_minute: u32,
    capacity: u32,
    costs: CostSchedule,
    exempt_server_errors: bool,
}

impl RateLimitPolicy {
    /// Start building a policy.
    pub fn builder(name: impl Into<PolicyName>) -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::new(name.into())
    }

    /// Policy name.
    pub fn name(&self) -> &PolicyName {
        &self.name
    }

    /// Who shares the bucket.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Tokens credited per minute.
    pub fn refill_per_minute(&self) -> u32 {
        self.refill_per_minute
    }

    /// Maximum stored tokens.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Per-outcome costs.
    pub fn costs(&self) -> &CostSchedule {
        &self.costs
    }

    /// Whether 5xx responses are free.
    pub fn exempt_server_errors(&self) -> bool {
        self.exempt_server_errors
    }

    /// Token cost of a response with `status`.
    pub fn cost_for_status(&self, status: u16) -> u32 {
        match OutcomeClass::from_status(status) {
            OutcomeClass::ServerError if self.exempt_server_errors => 0,
            OutcomeClass::ServerError => self.costs.server_error,
            OutcomeClass::Success => self.costs.success,
            OutcomeClass::NotFound => self.costs.not_found,
            OutcomeClass::Other => self.costs.other,
        }
    }

    /// Seconds between two consecutive single-token credits (at least 1).
    pub fn seconds_per_token(&self) -> u64 {
        u64::from(60u32.div_ceil(self.refill_per_minute)).max(1)
    }
}

/// Builder for [`RateLimitPolicy`]; validates on [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct RateLimitPolicyBuilder {
    name: PolicyName,
    scope: Scope,
    refill_per_minute: u32,
    capacity: u32,
    costs: CostSchedule,
    exempt_server_errors: bool,
}

impl RateLimitPolicyBuilder {
    fn new(name: PolicyName) -> Self {
        Self {
            name,
            scope: Scope::Participant,
            refill_per_minute: 60,
            capacity: 60,
            costs: CostSchedule::default(),
            exempt_server_errors: true,
        }
    }

    /// Bucket sharing scope.
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Tokens credited per minute.
    pub fn refill_per_minute(mut self, rate: u32) -> Self {
        self.refill_per_minute = rate;
        self
    }

    /// Maximum stored tokens.
    pub fn capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Replace the whole cost schedule.
    pub fn costs(mut self, costs: CostSchedule) -> Self {
        self.costs = costs;
        self
    }

    /// Cost of a 404 response.
    pub fn not_found_cost(mut self, cost: u32) -> Self {
        self.costs.not_found = cost;
        self
    }

    /// Whether 5xx responses are free.
    pub fn exempt_server_errors(mut self, exempt: bool) -> Self {
        self.exempt_server_errors = exempt;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RateLimitPolicy, PolicyError> {
        if self.capacity == 0 {
            return Err(PolicyError::InvalidCapacity { policy: self.name.to_string() });
        }
        if self.refill_per_minute == 0 {
            return Err(PolicyError::InvalidRefillRate { policy: self.name.to_string() });
        }
        Ok(RateLimitPolicy {
            name: self.name,
            scope: self.scope,
            refill_per_minute: self.refill_per_minute,
            capacity: self.capacity,
            costs: self.costs,
            exempt_server_errors: self.exempt_server_errors,
        })
    }
}

#[derive(Deserialize)]
struct PolicySpec {
    name: PolicyName,
    #[serde(default = "default_scope")]
    scope: Scope,
    refill_per_minute: u32,
    capacity: u32,
    #[serde(default)]
    costs: CostSchedule,
    #[serde(default = "default_exempt")]
    exempt_server_errors: bool,
}

fn default_scope() -> Scope {
    Scope::Participant
}

fn default_exempt() -> bool {
    true
}

impl TryFrom<PolicySpec> for RateLimitPolicy {
    type Error = PolicyError;

    fn try_from(spec: PolicySpec) -> Result<Self, Self::Error> {
        RateLimitPolicy::builder(spec.name)
            .scope(spec.scope)
            .refill_per_minute(spec.refill_per_minute)
            .capacity(spec.capacity)
            .costs(spec.costs)
            .exempt_server_errors(spec.exempt_server_errors)
            .build()
    }
}

/// Read-only catalogue of policies keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<PolicyName, RateLimitPolicy>,
}

impl PolicyRegistry {
    /// Empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// The reference catalogue (write, update, antiscan read).
    pub fn standard() -> Self {
        let reference = [
            (PolicyName::ENTRIES_WRITE, 1_200, 36_000, CostSchedule::uniform(1)),
            (PolicyName::ENTRIES_UPDATE, 600, 600, CostSchedule::uniform(1)),
            (
                PolicyName::ENTRIES_READ_PARTICIPANT_ANTISCAN,
                2,
                50,
                CostSchedule { not_found: 3, ..CostSchedule::uniform(1) },
            ),
        ];
        reference.into_iter().fold(Self::new(), |registry, (name, refill, capacity, costs)| {
            registry.with_policy(RateLimitPolicy {
                name,
                scope: Scope::Participant,
                refill_per_minute: refill,
                capacity,
                costs,
                exempt_server_errors: true,
            })
        })
    }

    /// Load a catalogue from a JSON array of policy objects.
    pub fn from_json(raw: &str) -> Result<Self, PolicyError> {
        let specs: Vec<PolicySpec> =
            serde_json::from_str(raw).map_err(|e| PolicyError::Parse(e.to_string()))?;
        specs.into_iter().try_fold(Self::new(), |registry, spec| {
            Ok(registry.with_policy(RateLimitPolicy::try_from(spec)?))
        })
    }

    /// Add or replace a policy.
    pub fn with_policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policies.insert(policy.name.clone(), policy);
        self
    }

    /// All policies by name.
    pub fn policies(&self) -> &HashMap<PolicyName, RateLimitPolicy> {
        &self.policies
    }

    /// Look up a policy by name.
    pub fn lookup(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.policies.get(name)
    }

    /// Like [`lookup`](Self::lookup), but a missing policy is an error.
    pub fn require(&self, name: &str) -> Result<&RateLimitPolicy, PolicyError> {
        self.lookup(name).ok_or_else(|| PolicyError::Unknown { policy: name.to_string() })
    }
}
