use crate::site::SiteConfig;
use crate::types::Decision;

/// Post-decision guardrail hook. Currently passes decisions through
/// unchanged; hard limits belong here when they grow beyond what
/// schema validation already enforces.
pub fn apply_sanity(decision: Decision, _site: &SiteConfig) -> Decision {
    decision
}
