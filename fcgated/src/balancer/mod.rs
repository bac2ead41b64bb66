//! Handler selection: weighted round-robin with sticky-cookie affinity and a
//! pluggable strategy chain.

mod sticky;
mod strategy;
mod wrr;

pub use sticky::{extract_cookie_by_name, StickyCookie};
pub use strategy::{CanaryHeaderStrategy, Candidate, SelectionStrategy, StrategyChain};
pub use wrr::{Balancer, BalancerError, NamedHandler, Selection, SELECTIONS_METRIC};
