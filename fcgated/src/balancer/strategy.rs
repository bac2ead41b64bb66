use anyhow::{anyhow, Result};
use fcgate_core::config::CanaryConfig;
use hyper::header::HeaderName;
use hyper::{Body, Request};
use std::collections::HashSet;
use std::sync::Arc;

/// A handler still eligible for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate<'a> {
    pub name: &'a str,
    pub weight: u32,
}

/// Filter applied to a balancer's handler list before the weighted pick.
/// Lower priority values run first.
pub trait SelectionStrategy: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> i32;
    fn next<'a>(
        &self,
        req: &Request<Body>,
        candidates: Vec<Candidate<'a>>,
    ) -> Vec<Candidate<'a>>;
}

/// Strategies in ascending priority order; equal priorities keep insertion
/// order.
#[derive(Clone, Default)]
pub struct StrategyChain {
    strategies: Vec<Arc<dyn SelectionStrategy>>,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Arc<dyn SelectionStrategy>>) -> Self {
        let mut chain = Self { strategies };
        chain.sort();
        chain
    }

    pub fn push(&mut self, strategy: Arc<dyn SelectionStrategy>) {
        self.strategies.push(strategy);
        self.sort();
    }

    fn sort(&mut self) {
        self.strategies.sort_by_key(|s| s.priority());
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Runs every strategy in order; an empty set short-circuits.
    pub fn apply<'a>(
        &self,
        req: &Request<Body>,
        mut candidates: Vec<Candidate<'a>>,
    ) -> Vec<Candidate<'a>> {
        for strategy in &self.strategies {
            if candidates.is_empty() {
                break;
            }
            candidates = strategy.next(req, candidates);
        }
        candidates
    }
}

/// Sends requests carrying `header: value` to the canary handlers only and
/// keeps every other request away from them.
#[derive(Debug, Clone)]
pub struct CanaryHeaderStrategy {
    header: HeaderName,
    value: String,
    canaries: HashSet<String>,
    priority: i32,
}

impl CanaryHeaderStrategy {
    pub fn new(header: &str, value: &str, canaries: &[String], priority: i32) -> Result<Self> {
        let header = HeaderName::from_bytes(header.as_bytes())
            .map_err(|_| anyhow!("invalid canary header name: {}", header))?;
        Ok(Self {
            header,
            value: value.to_string(),
            canaries: canaries.iter().cloned().collect(),
            priority,
        })
    }

    pub fn from_config(cfg: &CanaryConfig) -> Result<Self> {
        Self::new(&cfg.header, &cfg.value, &cfg.services, cfg.priority)
    }

    fn wants_canary(&self, req: &Request<Body>) -> bool {
        req.headers()
            .get_all(&self.header)
            .iter()
            .any(|v| v.as_bytes() == self.value.as_bytes())
    }
}

impl SelectionStrategy for CanaryHeaderStrategy {
    fn name(&self) -> &str {
        "canary-header"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn next<'a>(&self, req: &Request<Body>, candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
        let canary = self.wants_canary(req);
        candidates
            .into_iter()
            .filter(|c| self.canaries.contains(c.name) == canary)
            .collect()
    }
}
