pub mod balancer;
pub mod fastcgi;
pub mod handler;
pub mod http;
pub mod listener;
pub mod runtime;
pub mod service;
pub mod transport;
