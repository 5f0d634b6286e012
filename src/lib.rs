//! Ratewarden - Fixed-Window Distributed Rate Limiting
//!
//! This crate decides whether a request should be rate limited. It picks the
//! most specific configured rule for each of the request's descriptors and
//! counts the request against that rule's current window in a shared counter
//! store, using one atomic store operation per descriptor.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
