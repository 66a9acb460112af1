//! Candidate ordering.
//!
//! # Responsibilities
//! - Turn routing flags into a `RoutingPreference`
//! - Build the ordered candidate list for one request from capability and
//!   breaker state
//! - Record why each endpoint was included or excluded, for logs
//!
//! Pure: all state is passed in, nothing here performs I/O.

use serde::Serialize;
use std::sync::Arc;

use crate::config::RoutingConfig;
use crate::endpoint::{Endpoint, EndpointId};
use crate::resilience::CircuitState;

/// How to order the primary and secondary AI endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPreference {
    /// Only the secondary endpoint, regardless of anything else.
    ForceSecondary,
    PreferPrimary,
    PreferSecondary,
    /// Primary first; endpoints known to be unavailable are demoted.
    #[default]
    Auto,
}

impl RoutingPreference {
    /// `force_secondary` overrides `prefer_primary`.
    pub fn from_flags(prefer_primary: Option<bool>, force_secondary: bool) -> Self {
        if force_secondary {
            return RoutingPreference::ForceSecondary;
        }
        match prefer_primary {
            Some(true) => RoutingPreference::PreferPrimary,
            Some(false) => RoutingPreference::PreferSecondary,
            None => RoutingPreference::Auto,
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::from_flags(config.prefer_primary, config.force_secondary)
    }
}

/// What the capability cache said about a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityHint {
    /// Fresh record, available.
    Available,
    /// No fresh record.
    Unverified,
    /// Fresh record, unavailable; demoted to the end.
    Unavailable,
}

impl CapabilityHint {
    pub fn from_cached(available: Option<bool>) -> Self {
        match available {
            Some(true) => CapabilityHint::Available,
            Some(false) => CapabilityHint::Unavailable,
            None => CapabilityHint::Unverified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub endpoint: Arc<Endpoint>,
    pub capability: CapabilityHint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excluded {
    pub endpoint: EndpointId,
    pub state: CircuitState,
}

/// Ordered candidates for one request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub preference: RoutingPreference,
    pub candidates: Vec<Candidate>,
    pub excluded: Vec<Excluded>,
}

impl RoutingDecision {
    /// Order the configured AI endpoints.
    ///
    /// `capability` returns the fresh cached availability (if any);
    /// `breaker` returns `Err(state)` for endpoints that must not be called.
    pub fn build(
        preference: RoutingPreference,
        primary: Option<Arc<Endpoint>>,
        secondary: Option<Arc<Endpoint>>,
        capability: impl Fn(&EndpointId) -> Option<bool>,
        breaker: impl Fn(&EndpointId) -> Result<(), CircuitState>,
    ) -> Self {
        let base: Vec<Arc<Endpoint>> = match preference {
            RoutingPreference::ForceSecondary => secondary.into_iter().collect(),
            RoutingPreference::PreferPrimary | RoutingPreference::Auto => {
                primary.into_iter().chain(secondary).collect()
            }
            RoutingPreference::PreferSecondary => secondary.into_iter().chain(primary).collect(),
        };

        let mut candidates: Vec<Candidate> = base
            .into_iter()
            .map(|endpoint| Candidate {
                capability: CapabilityHint::from_cached(capability(&endpoint.id)),
                endpoint,
            })
            .collect();

        // Unverified candidates keep their preferred position. The stable
        // sort only moves fresh-unavailable ones to the end.
        if preference != RoutingPreference::ForceSecondary {
            candidates.sort_by_key(|c| c.capability == CapabilityHint::Unavailable);
        }

        let mut excluded = Vec::new();
        candidates.retain(|c| match breaker(&c.endpoint.id) {
            Ok(()) => true,
            Err(state) => {
                excluded.push(Excluded {
                    endpoint: c.endpoint.id.clone(),
                    state,
                });
                false
            }
        });

        Self {
            preference,
            candidates,
            excluded,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn endpoint_ids(&self) -> Vec<&EndpointId> {
        self.candidates.iter().map(|c| &c.endpoint.id).collect()
    }

    /// Candidates with no fresh capability record.
    pub fn unverified(&self) -> impl Iterator<Item = &EndpointId> {
        self.candidates
            .iter()
            .filter(|c| c.capability == CapabilityHint::Unverified)
            .map(|c| &c.endpoint.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::endpoint::Role;
    use std::collections::HashMap;

    fn endpoint(id: &str, role: Role) -> Arc<Endpoint> {
        Arc::new(
            Endpoint::from_config(&EndpointConfig {
                id: id.to_string(),
                role,
                base_url: "http://localhost".to_string(),
                timeout_ms: 1_000,
                probe_path: "/".to_string(),
                invoke_path: "/".to_string(),
            })
            .unwrap(),
        )
    }

    fn ids(decision: &RoutingDecision) -> Vec<&str> {
        decision.candidates.iter().map(|c| c.endpoint.id.as_str()).collect()
    }

    fn build(
        preference: RoutingPreference,
        capability: &[(&str, bool)],
        blocked: &[(&str, CircuitState)],
    ) -> RoutingDecision {
        let capability: HashMap<EndpointId, bool> =
            capability.iter().map(|(id, a)| (EndpointId::new(id), *a)).collect();
        let blocked: HashMap<EndpointId, CircuitState> =
            blocked.iter().map(|(id, s)| (EndpointId::new(id), *s)).collect();
        RoutingDecision::build(
            preference,
            Some(endpoint("ai.primary", Role::AiPrimary)),
            Some(endpoint("ai.secondary", Role::AiSecondary)),
            |id| capability.get(id).copied(),
            |id| blocked.get(id).map_or(Ok(()), |s| Err(*s)),
        )
    }

    #[test]
    fn flags_map_to_preference() {
        assert_eq!(RoutingPreference::from_flags(None, false), RoutingPreference::Auto);
        assert_eq!(RoutingPreference::from_flags(Some(true), false), RoutingPreference::PreferPrimary);
        assert_eq!(RoutingPreference::from_flags(Some(false), false), RoutingPreference::PreferSecondary);
        assert_eq!(RoutingPreference::from_flags(Some(true), true), RoutingPreference::ForceSecondary);
    }

    #[test]
    fn force_secondary_is_absolute() {
        let d = build(
            RoutingPreference::ForceSecondary,
            &[("ai.primary", true), ("ai.secondary", false)],
            &[],
        );
        assert_eq!(ids(&d), vec!["ai.secondary"]);
    }

    #[test]
    fn prefer_secondary_orders_secondary_first() {
        let d = build(RoutingPreference::PreferSecondary, &[], &[]);
        assert_eq!(ids(&d), vec!["ai.secondary", "ai.primary"]);
        assert_eq!(d.unverified().count(), 2);
    }

    #[test]
    fn unavailable_endpoint_moves_to_end() {
        let d = build(RoutingPreference::PreferPrimary, &[("ai.primary", false)], &[]);
        assert_eq!(ids(&d), vec!["ai.secondary", "ai.primary"]);
    }

    #[test]
    fn auto_keeps_unverified_primary_first() {
        let d = build(RoutingPreference::Auto, &[("ai.secondary", true)], &[]);
        assert_eq!(ids(&d), vec!["ai.primary", "ai.secondary"]);
        assert_eq!(d.unverified().collect::<Vec<_>>(), vec![&EndpointId::new("ai.primary")]);

        let d = build(RoutingPreference::Auto, &[], &[]);
        assert_eq!(ids(&d), vec!["ai.primary", "ai.secondary"]);
    }

    #[test]
    fn auto_demotes_unavailable_primary() {
        let d = build(RoutingPreference::Auto, &[("ai.primary", false)], &[]);
        assert_eq!(ids(&d), vec!["ai.secondary", "ai.primary"]);
    }

    #[test]
    fn blocked_endpoints_are_excluded() {
        let d = build(
            RoutingPreference::Auto,
            &[],
            &[
                ("ai.primary", CircuitState::PermanentlyOpen),
                ("ai.secondary", CircuitState::Open),
            ],
        );
        assert!(d.is_empty());
        assert_eq!(d.excluded.len(), 2);
        assert_eq!(d.excluded[0].state, CircuitState::PermanentlyOpen);
    }
}
