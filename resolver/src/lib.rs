//! The routing resolver service: an HTTP surface over the routing
//! catalog answering fully-resolved routing queries.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod format;
pub mod http;

pub use http::HttpDelegate;
