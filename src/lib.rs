//! Change-propagation engine for a multi-tenant configuration center.
//!
//! This crate implements the part of a configuration center that decides *when*
//! and *what* to tell a connected client about: a cross-process [`bus::ChangeBus`],
//! a [`fingerprint::FingerprintOracle`] that turns stored values into comparable
//! fingerprints, a [`subscription::SubscriptionManager`] that fans bus events out
//! to parked requests, a [`waiter::LongPollWaiter`] that runs one request's
//! subscribe/park/notify lifecycle, a [`canary::ReleaseRouter`] that decides which
//! release a given client should see, and the [`orchestrator::PublishRollbackOrchestrator`]
//! that drives publish/rollback.
//!
//! Persistence, HTTP binding, and authentication are deliberately not implemented
//! here: they are modeled as the [`fingerprint::ConfigStore`], [`canary::ReleaseStore`],
//! and [`subscription::SubscriptionStore`] traits, with in-memory fakes under
//! `tests/support` standing in for them in this crate's own test suite.

pub mod bus;
pub mod canary;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod model;
pub mod orchestrator;
pub mod subscription;
pub mod waiter;

pub use bus::{ChangeBus, InMemoryChangeBus};
pub use canary::{ReleaseRouter, ReleaseStore};
pub use config::SystemConfigCache;
pub use error::{CoreError, CoreResult, StoreError};
pub use fingerprint::{fingerprint_of, ConfigStore, FingerprintOracle};
pub use orchestrator::PublishRollbackOrchestrator;
pub use subscription::{SubscriptionManager, SubscriptionStore};
pub use waiter::LongPollWaiter;

#[cfg(feature = "redis-bus")]
pub use bus::RedisChangeBus;
