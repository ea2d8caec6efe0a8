//! Synchronization primitives for the sched_ext runtime

pub mod rcu;

pub use rcu::{Rcu, RcuReadGuard};
