//! Clients for the bare-metal provider.
//!
//! The operator only depends on the [`ComputeApi`] and [`LoadBalancerApi`] traits. The
//! [`rest`] module provides the implementations talking to the real REST endpoints.

pub mod compute;
pub mod error;
pub mod load_balancer;
pub mod rest;

pub use compute::ComputeApi;
pub use error::{Error, Result};
pub use load_balancer::LoadBalancerApi;
