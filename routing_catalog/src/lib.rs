//! The routing catalog keeps track of which data center serves which
//! stream epoch for which service. It is populated by the harvester and
//! answers fully-resolved routing queries for the resolver service and the
//! federator.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod interface;
pub mod mem;
pub mod postgres;
