//! # oectl: Admission Control and Async Execution for LLM Gateways
//!
//! `oectl` is the concurrency core of the ObsidianEcho control layer: the
//! components that decide whether a request may proceed and that execute
//! accepted agent work asynchronously. Gateways fronting LLM providers need
//! to protect upstream capacity per API key, account for token and dollar
//! spend after the fact, and run long agent jobs off the request path; this
//! crate provides both pieces as self-contained services constructed once at
//! startup and shared by handle.
//!
//! ## What It Does
//!
//! The [`rate_limit::RateLimiter`] intercepts every admitted request and
//! tracks usage per (API key, agent scope) across three dimensions
//! (requests, tokens, cost) and three fixed windows (minute, hour, day).
//! Request ceilings are enforced before work is dispatched with a
//! check-before-commit discipline; token and cost usage is recorded after
//! execution and gates subsequent admissions. Decisions carry everything the
//! HTTP layer needs for `X-RateLimit-*` and `Retry-After` headers.
//!
//! The [`tasks::TaskManager`] accepts chat and research jobs, orders them by
//! priority (FIFO within equal priority), and executes them on a fixed-size
//! worker pool through an injected [`tasks::TaskExecutor`]. Tasks are
//! cancellable — including best-effort abort of in-flight executions — and
//! owner-scoped: a task is never visible to an API key other than its
//! submitter. Finished tasks expire after a TTL and are swept by a
//! background loop.
//!
//! ## Architecture
//!
//! Both services keep all state in memory behind a single lock per instance:
//! a synchronous mutex for the limiter's counters (CPU-only critical
//! sections) and an async-aware mutex for the task table, which is never
//! held across an executor await. The surrounding application supplies the
//! executor (typically the provider-fallback loop), loads [`config::Config`]
//! from YAML plus `OECTL_` environment variables, and maps the typed errors
//! in [`errors`] onto HTTP responses.

pub mod api;
pub mod config;
pub mod errors;
pub mod rate_limit;
pub mod tasks;
pub mod telemetry;

pub use config::Config;
pub use errors::{Error, Result};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use tasks::{TaskExecutor, TaskManager};
