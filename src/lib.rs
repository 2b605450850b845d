//! Database connection lifecycle management for serverless runtimes
//!
//! Obtains a usable PostgreSQL handle inside a FaaS process without
//! tripping over connection-pooler state: stale prepared statements,
//! sockets dropped during a freeze, or connection-limit violations
//! against a shared transaction pooler.
//!
//! The entry point is [`LifecycleCoordinator::acquire`]; operations
//! that use a handle are wrapped with [`with_retry`], which tears the
//! handle down and recreates it on recognized transient failures.
//!
//! ```no_run
//! use db_lifecycle::LifecycleCoordinator;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), db_lifecycle::LifecycleError> {
//!     let coordinator = LifecycleCoordinator::from_env()?;
//!     let row: (i64,) = coordinator
//!         .with_retry(|handle| async move {
//!             sqlx::query_as("SELECT count(*) FROM tools")
//!                 .fetch_one(handle.pool())
//!                 .await
//!         })
//!         .await?;
//!     println!("{} tools", row.0);
//!     Ok(())
//! }
//! ```

mod env_utils;
mod metrics;

pub mod config;
pub mod error;
pub mod factory;
pub mod handle;
pub mod health;
pub mod lifecycle;
pub mod retry;
pub mod shutdown;

pub use config::{ConnectionConfig, PoolingMode, RawSettings};
pub use error::{classify, ErrorClass, LifecycleError};
pub use factory::{HandleFactory, PgFactory};
pub use handle::{ConnectionHandle, HandleMode};
pub use lifecycle::{Acquired, AcquireOutcome, LifecycleCoordinator};
pub use retry::{with_retry, RetryConfig};
