//! Versioned schema migrations.
//!
//! A [`MigrationRegistry`] is assembled once through its builder, which
//! rejects duplicate versions. The [`Migrator`] applies it against a
//! [`MigrationTarget`]: every migration runs in its own transaction, in
//! ascending version order going up and descending order going down, and
//! the persisted version marker only ever names a migration that committed.

use crate::error::{DatabaseError, DatabaseResult, MigrationError, MigrationResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, error, info, warn};

pub mod postgres;

pub use postgres::PgMigrationTarget;

/// Which way a migration is being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// One schema change: ordered statement lists for each direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    version: i64,
    description: String,
    forward: Vec<String>,
    backward: Vec<String>,
}

impl Migration {
    pub fn new(version: i64, description: &str) -> Self {
        Self {
            version,
            description: description.to_string(),
            forward: Vec::new(),
            backward: Vec::new(),
        }
    }

    /// Statements applied, in order, when migrating up.
    pub fn forward<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forward = statements.into_iter().map(Into::into).collect();
        self
    }

    /// Statements applied, in order, when migrating down.
    pub fn backward<I, S>(mut self, statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.backward = statements.into_iter().map(Into::into).collect();
        self
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn statements(&self, direction: Direction) -> &[String] {
        match direction {
            Direction::Up => &self.forward,
            Direction::Down => &self.backward,
        }
    }
}

/// Collects migrations before anything executes.
#[derive(Debug, Default)]
pub struct MigrationRegistryBuilder {
    migrations: BTreeMap<i64, Migration>,
}

impl MigrationRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a migration.
    ///
    /// # Errors
    ///
    /// Fails with [`MigrationError::DuplicateVersion`] when the version is
    /// already registered, and [`MigrationError::InvalidVersion`] for
    /// versions below 1 (0 is the "nothing applied" marker).
    pub fn register(mut self, migration: Migration) -> MigrationResult<Self> {
        if migration.version < 1 {
            return Err(MigrationError::InvalidVersion(migration.version));
        }
        if self.migrations.contains_key(&migration.version) {
            return Err(MigrationError::DuplicateVersion(migration.version));
        }
        self.migrations.insert(migration.version, migration);
        Ok(self)
    }

    pub fn build(self) -> MigrationRegistry {
        MigrationRegistry {
            migrations: self.migrations,
        }
    }
}

/// Immutable set of migrations keyed, and therefore ordered, by version.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    migrations: BTreeMap<i64, Migration>,
}

impl MigrationRegistry {
    pub fn builder() -> MigrationRegistryBuilder {
        MigrationRegistryBuilder::new()
    }

    /// Registered versions in ascending order.
    pub fn versions(&self) -> Vec<i64> {
        self.migrations.keys().copied().collect()
    }

    /// Highest registered version, 0 when empty.
    pub fn latest_version(&self) -> i64 {
        self.migrations.keys().next_back().copied().unwrap_or(0)
    }

    pub fn get(&self, version: i64) -> Option<&Migration> {
        self.migrations.get(&version)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Version the marker should hold once `version` has been reverted.
    fn version_below(&self, version: i64) -> i64 {
        self.migrations
            .range(..version)
            .next_back()
            .map_or(0, |(v, _)| *v)
    }
}

/// A database the migrator can apply statements to.
#[async_trait]
pub trait MigrationTarget: Send + Sync {
    /// Serialise migrators across processes.
    async fn lock(&self) -> DatabaseResult<()>;

    async fn unlock(&self) -> DatabaseResult<()>;

    /// The persisted version marker, 0 when nothing was ever applied.
    async fn current_version(&self) -> DatabaseResult<i64>;

    async fn begin(&self) -> DatabaseResult<Box<dyn MigrationTransaction>>;
}

/// Transaction handle handed to a single migration.
#[async_trait]
pub trait MigrationTransaction: Send {
    async fn execute(&mut self, statement: &str) -> DatabaseResult<()>;

    /// Update the version marker inside this transaction.
    async fn set_version(&mut self, version: i64) -> DatabaseResult<()>;

    async fn commit(self: Box<Self>) -> DatabaseResult<()>;

    async fn rollback(self: Box<Self>) -> DatabaseResult<()>;
}

/// Outcome of a successful migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    /// Versions applied, in execution order
    pub applied: Vec<i64>,
}

/// Applies a [`MigrationRegistry`] to a [`MigrationTarget`].
pub struct Migrator<'a> {
    registry: &'a MigrationRegistry,
}

impl<'a> Migrator<'a> {
    pub fn new(registry: &'a MigrationRegistry) -> Self {
        Self { registry }
    }

    /// Apply every migration above the persisted version.
    ///
    /// # Errors
    ///
    /// Stops at the first failing migration; its transaction is rolled back
    /// and the error reports the last committed version.
    pub async fn up(&self, target: &dyn MigrationTarget) -> MigrationResult<MigrationReport> {
        self.up_to(target, self.registry.latest_version()).await
    }

    /// Apply migrations above the persisted version, up to and including `version`.
    ///
    /// # Errors
    ///
    /// See [`Migrator::up`].
    pub async fn up_to(
        &self,
        target: &dyn MigrationTarget,
        version: i64,
    ) -> MigrationResult<MigrationReport> {
        self.locked(target, Direction::Up, version).await
    }

    /// Revert applied migrations down to, but excluding, `version`.
    ///
    /// # Errors
    ///
    /// Stops at the first failing migration; its transaction is rolled back
    /// and the error reports the last committed version.
    pub async fn down_to(
        &self,
        target: &dyn MigrationTarget,
        version: i64,
    ) -> MigrationResult<MigrationReport> {
        self.locked(target, Direction::Down, version).await
    }

    async fn locked(
        &self,
        target: &dyn MigrationTarget,
        direction: Direction,
        version: i64,
    ) -> MigrationResult<MigrationReport> {
        if let Err(e) = target.lock().await {
            // the lock may have been taken before the failure
            if let Err(unlock_err) = target.unlock().await {
                warn!("Failed to release migration lock after lock failure: {}", unlock_err);
            }
            return Err(MigrationError::Lock(e.to_string()));
        }

        let result = self.apply(target, direction, version).await;

        if let Err(e) = target.unlock().await {
            warn!("Failed to release migration lock: {}", e);
        }
        result
    }

    async fn apply(
        &self,
        target: &dyn MigrationTarget,
        direction: Direction,
        version: i64,
    ) -> MigrationResult<MigrationReport> {
        let from_version = target
            .current_version()
            .await
            .map_err(|e| MigrationError::Marker(e.to_string()))?;

        let already_there = match direction {
            Direction::Up => version <= from_version,
            Direction::Down => version >= from_version,
        };
        if already_there {
            debug!(from_version, version, %direction, "Schema already at requested version");
            return Ok(MigrationReport {
                from_version,
                to_version: from_version,
                applied: Vec::new(),
            });
        }

        let pending: Vec<&Migration> = match direction {
            Direction::Up => self
                .registry
                .migrations
                .range(from_version + 1..=version)
                .map(|(_, m)| m)
                .collect(),
            Direction::Down => self
                .registry
                .migrations
                .range(version + 1..=from_version)
                .rev()
                .map(|(_, m)| m)
                .collect(),
        };

        let mut current = from_version;
        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            let next = match direction {
                Direction::Up => migration.version,
                Direction::Down => self.registry.version_below(migration.version),
            };
            info!(
                version = migration.version,
                description = migration.description(),
                %direction,
                "Applying migration"
            );
            Self::apply_one(target, migration, direction, current, next).await?;
            current = next;
            applied.push(migration.version);
        }

        Ok(MigrationReport {
            from_version,
            to_version: current,
            applied,
        })
    }

    async fn apply_one(
        target: &dyn MigrationTarget,
        migration: &Migration,
        direction: Direction,
        last_committed: i64,
        next_version: i64,
    ) -> MigrationResult<()> {
        let transaction_error = |e: DatabaseError| MigrationError::Transaction {
            version: migration.version,
            last_committed,
            reason: e.to_string(),
        };

        let mut tx = target.begin().await.map_err(transaction_error)?;

        for statement in migration.statements(direction) {
            if let Err(e) = tx.execute(statement).await {
                error!(
                    version = migration.version,
                    %direction,
                    statement = statement.as_str(),
                    "Migration statement failed: {}",
                    e
                );
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback after failed migration statement failed: {}", rollback_err);
                }
                return Err(MigrationError::StatementFailed {
                    version: migration.version,
                    direction,
                    statement: statement.clone(),
                    last_committed,
                    reason: e.to_string(),
                });
            }
        }

        if let Err(e) = tx.set_version(next_version).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback after version marker failure failed: {}", rollback_err);
            }
            return Err(transaction_error(e));
        }

        tx.commit().await.map_err(transaction_error)
    }
}
