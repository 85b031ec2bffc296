//! Edge endpoint health tracking and attempt routing.

pub mod health;
pub mod router;

pub use health::{EndpointHealth, EndpointHealthStore, HealthPolicy, Reroute, RouteOverride};
pub use router::{AttemptPlan, EdgeRouter, select_attempt_order};
