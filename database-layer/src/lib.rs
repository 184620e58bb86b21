//! PostgreSQL plumbing for the ReBAC engine.
//!
//! - [`DatabasePool`]: pooled connections with health checks
//! - [`migration`]: an ordered, duplicate-free registry of schema
//!   migrations and a [`Migrator`] that applies each one in its own
//!   transaction under an advisory lock
//!
//! # Example
//!
//! ```rust,no_run
//! use database_layer::{DatabasePool, Migration, MigrationRegistry, Migrator, PgMigrationTarget, PoolSettings};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MigrationRegistry::builder()
//!     .register(
//!         Migration::new(1, "create widgets")
//!             .forward(["CREATE TABLE widgets (id TEXT PRIMARY KEY)"])
//!             .backward(["DROP TABLE widgets"]),
//!     )?
//!     .build();
//!
//! let pool = DatabasePool::connect("postgres://localhost/rebac", &PoolSettings::default()).await?;
//! let report = Migrator::new(&registry).up(&PgMigrationTarget::new(pool)).await?;
//! println!("schema now at version {}", report.to_version);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod migration;

pub use connection::{DatabasePool, PoolSettings};
pub use error::{DatabaseError, DatabaseResult, MigrationError, MigrationResult};
pub use migration::{
    Direction, Migration, MigrationRegistry, MigrationRegistryBuilder, MigrationReport,
    MigrationTarget, MigrationTransaction, Migrator, PgMigrationTarget,
};
