//! Unit and integration tests for the orchestrator
//!
//! Leaf modules (breaker, ledger, router, recovery, config) carry their own
//! inline tests; this directory covers the admission queue and the full
//! submit pipeline.

pub mod support;

pub mod integration_tests;
