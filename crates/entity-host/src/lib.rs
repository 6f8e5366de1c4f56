//! Server-side entity lifecycle and request retirement engine.
//!
//! Each entity hosted by a server is wrapped in a [`managed_entity::ManagedEntity`] that
//! serializes lifecycle requests (create, promote, fetch, release, destroy) and dispatches
//! invocations concurrently by concurrency key. Invocation replies are released by the
//! [`retirement::RetirementManager`] only once every request they depend on has retired.

pub mod client_state;
pub mod config;
pub mod entity;
pub mod entity_manager;
pub mod error;
pub mod managed_entity;
pub mod metrics;
pub mod request;
pub mod request_processor;
pub mod retirement;
pub mod testing;
pub mod types;
