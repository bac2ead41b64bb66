use super::sticky::StickyCookie;
use super::strategy::{Candidate, StrategyChain};
use crate::handler::{ConnInfo, Handler, SharedHandler};
use anyhow::Result;
use async_trait::async_trait;
use hyper::header::SET_COOKIE;
use hyper::{Body, Request, Response};
use metrics::counter;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

pub const SELECTIONS_METRIC: &str = "fcgate_balancer_selections_total";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no servers in the pool")]
    NoServers,
    #[error("all servers have 0 weight")]
    AllZeroWeight,
}

pub struct NamedHandler {
    pub name: String,
    pub weight: u32,
    pub handler: SharedHandler,
}

impl NamedHandler {
    pub fn new(name: impl Into<String>, weight: u32, handler: SharedHandler) -> Self {
        Self {
            name: name.into(),
            weight,
            handler,
        }
    }
}

/// Rotation state. `index` is -1 before the first pick.
#[derive(Debug)]
struct Rotation {
    index: isize,
    current_weight: i64,
}

/// Outcome of one pick.
pub struct Selection<'b> {
    pub handler: &'b NamedHandler,
    /// Chosen from the sticky cookie rather than the rotation.
    pub sticky: bool,
}

/// Interleaved weighted round-robin over a fixed list of named handlers.
/// Rebuilt, never mutated, when configuration changes.
pub struct Balancer {
    name: String,
    handlers: Vec<NamedHandler>,
    rotation: Mutex<Rotation>,
    sticky: Option<StickyCookie>,
    strategies: StrategyChain,
}

impl Balancer {
    pub fn new(
        name: impl Into<String>,
        handlers: Vec<NamedHandler>,
        sticky: Option<StickyCookie>,
        strategies: StrategyChain,
    ) -> Self {
        Self {
            name: name.into(),
            handlers,
            rotation: Mutex::new(Rotation {
                index: -1,
                current_weight: 0,
            }),
            sticky,
            strategies,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handlers(&self) -> &[NamedHandler] {
        &self.handlers
    }

    pub fn sticky(&self) -> Option<&StickyCookie> {
        self.sticky.as_ref()
    }

    /// Next handler in the weighted rotation.
    pub fn next_server(&self) -> Result<&NamedHandler, BalancerError> {
        let mut rotation = self.lock_rotation();
        let at = self.step(&mut rotation)?;
        Ok(&self.handlers[at])
    }

    /// Next handler in the rotation that is also in `allowed`, looking at
    /// most one full weighted cycle ahead.
    fn next_allowed(&self, allowed: &HashSet<&str>) -> Result<&NamedHandler, BalancerError> {
        if allowed.is_empty() {
            return Err(BalancerError::NoServers);
        }
        let steps = self.cycle_len();
        if steps == 0 {
            return Err(BalancerError::AllZeroWeight);
        }
        let mut rotation = self.lock_rotation();
        for _ in 0..steps {
            let at = self.step(&mut rotation)?;
            if allowed.contains(self.handlers[at].name.as_str()) {
                return Ok(&self.handlers[at]);
            }
        }
        Err(BalancerError::NoServers)
    }

    /// Picks a handler for `req`: sticky cookie first, then the strategy
    /// chain, then the rotation.
    pub fn select(&self, req: &Request<Body>) -> Result<Selection<'_>, BalancerError> {
        if self.handlers.is_empty() {
            return Err(BalancerError::NoServers);
        }
        let candidates: Vec<Candidate<'_>> = self
            .handlers
            .iter()
            .map(|h| Candidate {
                name: h.name.as_str(),
                weight: h.weight,
            })
            .collect();
        let allowed = if self.strategies.is_empty() {
            candidates
        } else {
            self.strategies.apply(req, candidates)
        };
        let narrowed = allowed.len() != self.handlers.len();

        if let Some(value) = self.sticky.as_ref().and_then(|s| s.lookup(req.headers())) {
            let pinned = allowed
                .iter()
                .any(|c| c.name == value)
                .then(|| self.handlers.iter().find(|h| h.name == value))
                .flatten();
            if let Some(handler) = pinned {
                return Ok(Selection {
                    handler,
                    sticky: true,
                });
            }
            debug!(
                balancer = %self.name,
                cookie = %value,
                "sticky cookie names no eligible handler"
            );
        }

        let handler = if narrowed {
            let allowed: HashSet<&str> = allowed.iter().map(|c| c.name).collect();
            self.next_allowed(&allowed)?
        } else {
            self.next_server()?
        };
        Ok(Selection {
            handler,
            sticky: false,
        })
    }

    fn lock_rotation(&self) -> std::sync::MutexGuard<'_, Rotation> {
        self.rotation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One step of the rotation. Returns the chosen index.
    fn step(&self, rotation: &mut Rotation) -> Result<usize, BalancerError> {
        let n = self.handlers.len();
        if n == 0 {
            return Err(BalancerError::NoServers);
        }
        let max = i64::from(self.max_weight());
        if max == 0 {
            return Err(BalancerError::AllZeroWeight);
        }
        let gcd = i64::from(self.weight_gcd());
        loop {
            rotation.index = (rotation.index + 1) % n as isize;
            if rotation.index == 0 {
                rotation.current_weight -= gcd;
                if rotation.current_weight <= 0 {
                    rotation.current_weight = max;
                }
            }
            let at = rotation.index as usize;
            if i64::from(self.handlers[at].weight) >= rotation.current_weight {
                return Ok(at);
            }
        }
    }

    fn weight_gcd(&self) -> u32 {
        self.handlers.iter().fold(0, |acc, h| gcd(acc, h.weight))
    }

    fn max_weight(&self) -> u32 {
        self.handlers.iter().map(|h| h.weight).max().unwrap_or(0)
    }

    /// Picks in one full period of the rotation.
    fn cycle_len(&self) -> u64 {
        let g = self.weight_gcd();
        if g == 0 {
            return 0;
        }
        self.handlers
            .iter()
            .map(|h| u64::from(h.weight / g))
            .sum()
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

#[async_trait]
impl Handler for Balancer {
    async fn serve(&self, req: Request<Body>, conn: ConnInfo) -> Result<Response<Body>> {
        let selection = self.select(&req)?;
        let handler = selection.handler;
        counter!(
            SELECTIONS_METRIC,
            "service" => self.name.clone(),
            "handler" => handler.name.clone(),
            "sticky" => if selection.sticky { "true" } else { "false" }
        )
        .increment(1);
        debug!(
            balancer = %self.name,
            handler = %handler.name,
            sticky = selection.sticky,
            "balancer selected handler"
        );

        let mut response = handler.handler.serve(req, conn).await?;
        if let (Some(sticky), false) = (self.sticky.as_ref(), selection.sticky) {
            match sticky.set_cookie(&handler.name) {
                Some(value) => {
                    response.headers_mut().append(SET_COOKIE, value);
                }
                None => warn!(
                    balancer = %self.name,
                    handler = %handler.name,
                    "handler name cannot be carried in a sticky cookie"
                ),
            }
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::strategy::CanaryHeaderStrategy;
    use hyper::header::COOKIE;
    use std::sync::Arc;

    struct Fixed(&'static str);

    #[async_trait]
    impl Handler for Fixed {
        async fn serve(&self, _req: Request<Body>, _conn: ConnInfo) -> Result<Response<Body>> {
            Ok(Response::new(Body::from(self.0)))
        }
    }

    fn handlers(weights: &[(&'static str, u32)]) -> Vec<NamedHandler> {
        weights
            .iter()
            .map(|(name, weight)| NamedHandler::new(*name, *weight, Arc::new(Fixed(*name))))
            .collect()
    }

    fn rotation(weights: &[(&'static str, u32)]) -> Balancer {
        Balancer::new("app", handlers(weights), None, StrategyChain::default())
    }

    fn pinned(weights: &[(&'static str, u32)]) -> Balancer {
        Balancer::new("app", handlers(weights), sticky(), StrategyChain::default())
    }

    fn picks(balancer: &Balancer, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| balancer.next_server().expect("pick").name.clone())
            .collect()
    }

    fn sticky() -> Option<StickyCookie> {
        Some(StickyCookie {
            name: "srv".to_string(),
            secure: false,
            http_only: true,
        })
    }

    fn request(cookie: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/index.php");
        if let Some(cookie) = cookie {
            builder = builder.header(COOKIE, cookie);
        }
        builder.body(Body::empty()).expect("request")
    }

    fn canary_request() -> Request<Body> {
        Request::builder()
            .uri("/")
            .header("x-canary", "1")
            .body(Body::empty())
            .expect("request")
    }

    fn rotation_state(balancer: &Balancer) -> (isize, i64) {
        let rotation = balancer.lock_rotation();
        (rotation.index, rotation.current_weight)
    }

    #[test]
    fn weights_interleave_three_to_one() {
        let balancer = rotation(&[("A", 3), ("B", 1)]);
        assert_eq!(
            picks(&balancer, 8),
            vec!["A", "A", "A", "B", "A", "A", "A", "B"]
        );
    }

    #[test]
    fn gcd_interleaving_spreads_picks() {
        let balancer = rotation(&[("A", 4), ("B", 2), ("C", 2)]);
        let seq = picks(&balancer, 8);
        assert_eq!(seq, vec!["A", "A", "B", "C", "A", "A", "B", "C"]);
    }

    #[test]
    fn equal_weights_round_robin() {
        let balancer = rotation(&[("A", 1), ("B", 1), ("C", 1)]);
        assert_eq!(picks(&balancer, 6), vec!["A", "B", "C", "A", "B", "C"]);
    }

    #[test]
    fn zero_weight_handlers_are_never_picked() {
        let balancer = rotation(&[("A", 0), ("B", 2)]);
        assert!(picks(&balancer, 5).iter().all(|n| n == "B"));
    }

    #[test]
    fn all_zero_weights_fail_every_call_without_moving() {
        let balancer = rotation(&[("X", 0), ("Y", 0)]);
        for _ in 0..5 {
            assert_eq!(
                balancer.next_server().err(),
                Some(BalancerError::AllZeroWeight)
            );
            assert!(matches!(
                balancer.select(&request(None)),
                Err(BalancerError::AllZeroWeight)
            ));
        }
        assert_eq!(rotation_state(&balancer), (-1, 0));
    }

    #[test]
    fn empty_balancer_has_no_servers() {
        let empty = rotation(&[]);
        assert_eq!(empty.next_server().err(), Some(BalancerError::NoServers));
        assert!(matches!(
            empty.select(&request(None)),
            Err(BalancerError::NoServers)
        ));
    }

    #[test]
    fn sticky_cookie_pins_without_advancing_rotation() {
        let balancer = pinned(&[("A", 3), ("B", 1)]);
        assert_eq!(balancer.next_server().expect("pick").name, "A");
        let before = rotation_state(&balancer);

        for _ in 0..5 {
            let selection = balancer.select(&request(Some("srv=B"))).expect("select");
            assert_eq!(selection.handler.name, "B");
            assert!(selection.sticky);
        }
        assert_eq!(rotation_state(&balancer), before);
        // Rotation resumes where it stopped.
        assert_eq!(picks(&balancer, 3), vec!["A", "A", "B"]);
    }

    #[test]
    fn unknown_sticky_value_falls_back_to_rotation() {
        let balancer = pinned(&[("A", 1), ("B", 1)]);
        let selection = balancer.select(&request(Some("srv=gone"))).expect("select");
        assert_eq!(selection.handler.name, "A");
        assert!(!selection.sticky);
    }

    #[tokio::test]
    async fn rotation_pick_sets_the_sticky_cookie() {
        let balancer = pinned(&[("A", 1), ("B", 1)]);
        let response = balancer
            .serve(request(None), ConnInfo::default())
            .await
            .expect("serve");
        assert_eq!(
            response.headers().get(SET_COOKIE).expect("cookie"),
            "srv=A; Path=/; HttpOnly"
        );

        let response = balancer
            .serve(request(Some("srv=B")), ConnInfo::default())
            .await
            .expect("serve");
        assert!(response.headers().get(SET_COOKIE).is_none());
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .expect("body");
        assert_eq!(&body[..], b"B");
    }

    fn canary_chain() -> StrategyChain {
        StrategyChain::new(vec![Arc::new(
            CanaryHeaderStrategy::new("x-canary", "1", &["B".to_string()], 0).expect("canary"),
        )])
    }

    #[test]
    fn narrowed_set_walks_the_rotation() {
        let balancer = Balancer::new("app", handlers(&[("A", 3), ("B", 1)]), None, canary_chain());
        let plain = request(None);
        for _ in 0..6 {
            assert_eq!(balancer.select(&plain).expect("select").handler.name, "A");
        }
        let selection = balancer.select(&canary_request()).expect("select");
        assert_eq!(selection.handler.name, "B");
    }

    #[test]
    fn sticky_cookie_cannot_escape_the_strategy_chain() {
        let balancer = Balancer::new(
            "app",
            handlers(&[("A", 3), ("B", 1)]),
            sticky(),
            canary_chain(),
        );
        let selection = balancer.select(&request(Some("srv=B"))).expect("select");
        assert_eq!(selection.handler.name, "A");
        assert!(!selection.sticky);
    }

    #[test]
    fn narrowed_to_zero_weight_is_no_servers() {
        let balancer = Balancer::new("app", handlers(&[("A", 3), ("B", 0)]), None, canary_chain());
        assert!(matches!(
            balancer.select(&canary_request()),
            Err(BalancerError::NoServers)
        ));
    }
}
