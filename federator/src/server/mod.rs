//! HTTP service implementation for the federator.

pub mod http;

pub use http::HttpDelegate;
