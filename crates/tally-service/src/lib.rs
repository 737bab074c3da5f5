//! tally-service — Attendance operations over a store.
//!
//! Wires the pure core to persistence: registration with validation,
//! recognize-and-record, and [`CalendarSession`], which owns one reconciler,
//! its live subscription and the historical fetch policy.

pub mod config;
pub mod retry;
pub mod service;
pub mod session;

pub use config::{Config, ConfigError};
pub use retry::RetryPolicy;
pub use service::{AttendanceService, Recognition, RegistrationRequest, ServiceError};
pub use session::CalendarSession;
