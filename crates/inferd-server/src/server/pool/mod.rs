//! Session admission pool.
//!
//! - [`manager`] - [`SessionPool`](manager::SessionPool), drain signals and
//!   the phased shutdown.

pub mod manager;
