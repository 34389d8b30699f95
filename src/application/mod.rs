//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Engine configuration and validation
//! - The tracker engine (decision routing, processing loop)
//! - Lifecycle notifications
//! - Metrics
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod config;
pub mod metrics;
pub mod notify;
pub mod ports;
pub mod tracker;
