//! HTTP front end: compiles sample requests, applies the access policy and
//! serves backend results through a version-invalidated cache.

pub mod backend;
pub mod config;
pub mod http;
pub mod metrics;
pub mod query_cache;
pub mod version_poller;
