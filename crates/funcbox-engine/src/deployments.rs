// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment Repository
//!
//! Persisted record of functions and their versioned deployments. Every
//! change to which deployment is live goes through [`DeploymentRepository::activate`],
//! a single transaction, so readers never observe two active deployments or a
//! function pointer that disagrees with the deployment rows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

use crate::config::ExecutionDefaults;
use crate::error::{Error, Result};
use crate::runner::ResourceLimits;

/// Lifecycle status of a function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionStatus {
    /// Created, no deployment has finished building yet
    #[default]
    Initializing,
    /// Serving an active deployment
    Active,
    /// Switched off
    Inactive,
    /// First build failed and nothing is serving
    Failed,
}

impl FunctionStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Initializing => "initializing",
            FunctionStatus::Active => "active",
            FunctionStatus::Inactive => "inactive",
            FunctionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FunctionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "initializing" => Ok(FunctionStatus::Initializing),
            "active" => Ok(FunctionStatus::Active),
            "inactive" => Ok(FunctionStatus::Inactive),
            "failed" => Ok(FunctionStatus::Failed),
            _ => Err(format!("Unknown function status: {}", s)),
        }
    }
}

/// Lifecycle status of a deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Image build in progress
    #[default]
    Building,
    /// Currently serving invocations
    Active,
    /// Built successfully, superseded
    Inactive,
    /// Build failed or was interrupted
    Failed,
}

impl DeploymentStatus {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Building => "building",
            DeploymentStatus::Active => "active",
            DeploymentStatus::Inactive => "inactive",
            DeploymentStatus::Failed => "failed",
        }
    }

    /// Whether the deployment produced an image at some point.
    pub fn was_built(&self) -> bool {
        matches!(self, DeploymentStatus::Active | DeploymentStatus::Inactive)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "building" => Ok(DeploymentStatus::Building),
            "active" => Ok(DeploymentStatus::Active),
            "inactive" => Ok(DeploymentStatus::Inactive),
            "failed" => Ok(DeploymentStatus::Failed),
            _ => Err(format!("Unknown deployment status: {}", s)),
        }
    }
}

/// Per-function execution settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunctionSettings {
    /// Wall-clock timeout for one invocation
    pub timeout: Duration,
    /// Memory and CPU ceilings
    pub limits: ResourceLimits,
    /// Inject the function database connection string
    pub requires_database: bool,
}

impl Default for FunctionSettings {
    fn default() -> Self {
        Self::from(ExecutionDefaults::default())
    }
}

impl From<ExecutionDefaults> for FunctionSettings {
    fn from(defaults: ExecutionDefaults) -> Self {
        Self {
            timeout: defaults.timeout,
            limits: defaults.limits,
            requires_database: false,
        }
    }
}

/// A deployable function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    /// Stable identifier
    pub function_id: String,
    /// Human-readable name
    pub name: String,
    /// Owning user
    pub owner: String,
    /// Lifecycle status
    pub status: FunctionStatus,
    /// Deployment currently serving invocations
    pub active_deployment_id: Option<String>,
    /// Execution settings
    pub settings: FunctionSettings,
    /// When the function was created
    pub created_at: DateTime<Utc>,
    /// When the function was last updated
    pub updated_at: DateTime<Utc>,
}

/// One built (or attempted) version of a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment ID
    pub deployment_id: String,
    /// Owning function
    pub function_id: String,
    /// Per-function version, starting at 1
    pub version: i64,
    /// Artifact Store key of the source archive
    pub artifact_key: String,
    /// Image tag, `<function-identity>-v<version>`
    pub image_tag: String,
    /// Lifecycle status
    pub status: DeploymentStatus,
    /// Whether this deployment serves invocations
    pub is_active: bool,
    /// Captured build error for failed deployments
    pub error: Option<String>,
    /// How long the image build took
    pub build_duration_ms: Option<i64>,
    /// When the deployment was created
    pub created_at: DateTime<Utc>,
    /// When the deployment was last activated
    pub activated_at: Option<DateTime<Utc>>,
    /// When the deployment was last deactivated
    pub deactivated_at: Option<DateTime<Utc>>,
}

/// Image-name-safe identity of a function.
///
/// Lowercases the id and replaces characters the container engine rejects.
/// When that changes the id, a short hash of the original keeps identities
/// distinct.
pub fn function_identity(function_id: &str) -> String {
    let sanitized: String = function_id
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '_' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c| c == '-' || c == '_' || c == '.');

    if sanitized == function_id && !sanitized.is_empty() {
        return sanitized.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(function_id.as_bytes()));
    if sanitized.is_empty() {
        format!("fn-{}", &digest[..12])
    } else {
        format!("{}-{}", sanitized, &digest[..8])
    }
}

/// Image tag for one version of a function.
pub fn image_tag(function_id: &str, version: i64) -> String {
    format!("{}-v{}", function_identity(function_id), version)
}

/// Deployment repository - functions and versioned deployments in SQLite.
#[derive(Clone)]
pub struct DeploymentRepository {
    pool: SqlitePool,
}

const FUNCTION_COLUMNS: &str = "function_id, name, owner, status, active_deployment_id, \
     timeout_ms, memory_mb, cpus, requires_database, created_at, updated_at";

const DEPLOYMENT_COLUMNS: &str = "deployment_id, function_id, version, artifact_key, image_tag, \
     status, is_active, error, build_duration_ms, created_at, activated_at, deactivated_at";

impl DeploymentRepository {
    /// Create a new repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the function if it does not exist, otherwise refresh its name
    /// and owner.
    ///
    /// `settings` only seed a new function. Settings of an existing function
    /// change when a deployment carrying them is activated, so a failed build
    /// never alters how the serving version runs.
    pub async fn ensure_function(
        &self,
        function_id: &str,
        name: &str,
        owner: &str,
        settings: &FunctionSettings,
    ) -> Result<Function> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO functions (
                function_id, name, owner, status, timeout_ms, memory_mb, cpus,
                requires_database, created_at, updated_at
            ) VALUES ($1, $2, $3, 'initializing', $4, $5, $6, $7, $8, $8)
            ON CONFLICT (function_id) DO UPDATE SET
                name = excluded.name,
                owner = excluded.owner,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(function_id)
        .bind(name)
        .bind(owner)
        .bind(settings.timeout.as_millis() as i64)
        .bind(i64::from(settings.limits.memory_mb))
        .bind(settings.limits.cpus)
        .bind(settings.requires_database)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_function(function_id)
            .await?
            .ok_or_else(|| Error::FunctionNotFound(function_id.to_string()))
    }

    /// Get a function by ID
    pub async fn get_function(&self, function_id: &str) -> Result<Option<Function>> {
        let row: Option<FunctionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM functions WHERE function_id = $1",
            FUNCTION_COLUMNS
        ))
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    /// Set a function's lifecycle status
    pub async fn set_function_status(&self, function_id: &str, status: FunctionStatus) -> Result<()> {
        sqlx::query("UPDATE functions SET status = $2, updated_at = $3 WHERE function_id = $1")
            .bind(function_id)
            .bind(status.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a function and, through the cascade, all of its deployments.
    pub async fn delete_function(&self, function_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM functions WHERE function_id = $1")
            .bind(function_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Allocate the next version and record it as `building`.
    ///
    /// Version allocation and insert share one transaction; the unique
    /// `(function_id, version)` constraint rejects any concurrent duplicate.
    pub async fn create_building_deployment(
        &self,
        function_id: &str,
        artifact_key: &str,
    ) -> Result<Deployment> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT function_id FROM functions WHERE function_id = $1")
                .bind(function_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(Error::FunctionNotFound(function_id.to_string()));
        }

        let (max_version,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM deployments WHERE function_id = $1",
        )
        .bind(function_id)
        .fetch_one(&mut *tx)
        .await?;
        let version = max_version + 1;

        let deployment = Deployment {
            deployment_id: uuid::Uuid::new_v4().to_string(),
            function_id: function_id.to_string(),
            version,
            artifact_key: artifact_key.to_string(),
            image_tag: image_tag(function_id, version),
            status: DeploymentStatus::Building,
            is_active: false,
            error: None,
            build_duration_ms: None,
            created_at: Utc::now(),
            activated_at: None,
            deactivated_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO deployments (
                deployment_id, function_id, version, artifact_key, image_tag,
                status, is_active, created_at
            ) VALUES ($1, $2, $3, $4, $5, 'building', 0, $6)
            "#,
        )
        .bind(&deployment.deployment_id)
        .bind(&deployment.function_id)
        .bind(deployment.version)
        .bind(&deployment.artifact_key)
        .bind(&deployment.image_tag)
        .bind(deployment.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            function_id = %function_id,
            deployment_id = %deployment.deployment_id,
            version,
            image_tag = %deployment.image_tag,
            "Created building deployment"
        );

        Ok(deployment)
    }

    /// Mark a building deployment as failed, recording the build error.
    ///
    /// Deployments that already left `building` are not touched.
    pub async fn mark_failed(
        &self,
        deployment_id: &str,
        error: &str,
        build_duration_ms: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed', is_active = 0, error = $2, build_duration_ms = $3
            WHERE deployment_id = $1 AND status = 'building'
            "#,
        )
        .bind(deployment_id)
        .bind(error)
        .bind(build_duration_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Make a deployment the function's only active deployment.
    ///
    /// One transaction: every other active deployment of the function becomes
    /// inactive, the target becomes active and the function pointer moves to
    /// it. Failed deployments are never activated.
    pub async fn activate(&self, function_id: &str, deployment_id: &str) -> Result<Deployment> {
        self.activate_with(function_id, deployment_id, None, None)
            .await
    }

    /// Activate a freshly built deployment.
    ///
    /// Same transaction as [`activate`](Self::activate), which also records
    /// the build duration and, when given, the settings the version was
    /// deployed with.
    pub async fn activate_build(
        &self,
        function_id: &str,
        deployment_id: &str,
        build_duration_ms: i64,
        settings: Option<&FunctionSettings>,
    ) -> Result<Deployment> {
        let activated = self
            .activate_with(function_id, deployment_id, Some(build_duration_ms), settings)
            .await?;
        Ok(Deployment {
            build_duration_ms: Some(build_duration_ms),
            ..activated
        })
    }

    async fn activate_with(
        &self,
        function_id: &str,
        deployment_id: &str,
        build_duration_ms: Option<i64>,
        settings: Option<&FunctionSettings>,
    ) -> Result<Deployment> {
        let now = Utc::now();
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let target: Option<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM deployments WHERE deployment_id = $1 AND function_id = $2",
            DEPLOYMENT_COLUMNS
        ))
        .bind(deployment_id)
        .bind(function_id)
        .fetch_optional(&mut *tx)
        .await?;

        let target: Deployment = match target {
            Some(row) => row.into(),
            None => return Err(Error::DeploymentNotFound(deployment_id.to_string())),
        };
        if target.status == DeploymentStatus::Failed {
            return Err(Error::InvalidState(format!(
                "deployment v{} of function {} failed to build",
                target.version, function_id
            )));
        }

        sqlx::query(
            r#"
            UPDATE deployments
            SET is_active = 0, status = 'inactive', deactivated_at = $3
            WHERE function_id = $1 AND is_active = 1 AND deployment_id != $2
            "#,
        )
        .bind(function_id)
        .bind(deployment_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE deployments
            SET is_active = 1, status = 'active', activated_at = $2,
                build_duration_ms = COALESCE($3, build_duration_ms)
            WHERE deployment_id = $1
            "#,
        )
        .bind(deployment_id)
        .bind(now)
        .bind(build_duration_ms)
        .execute(&mut *tx)
        .await?;

        if let Some(settings) = settings {
            sqlx::query(
                r#"
                UPDATE functions
                SET timeout_ms = $2, memory_mb = $3, cpus = $4, requires_database = $5
                WHERE function_id = $1
                "#,
            )
            .bind(function_id)
            .bind(settings.timeout.as_millis() as i64)
            .bind(i64::from(settings.limits.memory_mb))
            .bind(settings.limits.cpus)
            .bind(settings.requires_database)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE functions
            SET active_deployment_id = $2, status = 'active', updated_at = $3
            WHERE function_id = $1
            "#,
        )
        .bind(function_id)
        .bind(deployment_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            function_id = %function_id,
            deployment_id = %deployment_id,
            version = target.version,
            "Deployment activated"
        );

        Ok(Deployment {
            status: DeploymentStatus::Active,
            is_active: true,
            activated_at: Some(now),
            ..target
        })
    }

    /// The function's active deployment, if any
    pub async fn get_active(&self, function_id: &str) -> Result<Option<Deployment>> {
        let row: Option<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM deployments WHERE function_id = $1 AND is_active = 1",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    /// All deployments of a function, newest version first
    pub async fn list_versions(&self, function_id: &str) -> Result<Vec<Deployment>> {
        let rows: Vec<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM deployments WHERE function_id = $1 ORDER BY version DESC",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    /// A specific version of a function
    pub async fn get_by_version(&self, function_id: &str, version: i64) -> Result<Option<Deployment>> {
        let row: Option<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM deployments WHERE function_id = $1 AND version = $2",
            DEPLOYMENT_COLUMNS
        ))
        .bind(function_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    /// Get a deployment by ID
    pub async fn get(&self, deployment_id: &str) -> Result<Option<Deployment>> {
        let row: Option<DeploymentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM deployments WHERE deployment_id = $1",
            DEPLOYMENT_COLUMNS
        ))
        .bind(deployment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    /// Fail deployments left in `building` by a process that died mid-build.
    ///
    /// Only safe at startup, before any build of this process is in flight.
    pub async fn fail_stale_builds(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE deployments
            SET status = 'failed', error = 'build interrupted'
            WHERE status = 'building'
            "#,
        )
        .execute(&self.pool)
        .await?;

        let failed = result.rows_affected();
        if failed > 0 {
            tracing::warn!(count = failed, "Marked interrupted builds as failed");

            // Functions whose only deployments were interrupted have nothing serving.
            sqlx::query(
                r#"
                UPDATE functions
                SET status = 'failed', updated_at = $1
                WHERE status = 'initializing' AND active_deployment_id IS NULL
                  AND EXISTS (
                      SELECT 1 FROM deployments d
                      WHERE d.function_id = functions.function_id AND d.status = 'failed'
                  )
                "#,
            )
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(failed)
    }

    /// Check database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Internal row type for database queries
#[derive(sqlx::FromRow)]
struct FunctionRow {
    function_id: String,
    name: String,
    owner: String,
    status: String,
    active_deployment_id: Option<String>,
    timeout_ms: i64,
    memory_mb: i64,
    cpus: f64,
    requires_database: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<FunctionRow> for Function {
    fn from(row: FunctionRow) -> Self {
        Function {
            function_id: row.function_id,
            name: row.name,
            owner: row.owner,
            status: row.status.parse().unwrap_or_default(),
            active_deployment_id: row.active_deployment_id,
            settings: FunctionSettings {
                timeout: Duration::from_millis(row.timeout_ms.max(0) as u64),
                limits: ResourceLimits {
                    memory_mb: u32::try_from(row.memory_mb).unwrap_or(u32::MAX),
                    cpus: row.cpus,
                },
                requires_database: row.requires_database,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Internal row type for database queries
#[derive(sqlx::FromRow)]
struct DeploymentRow {
    deployment_id: String,
    function_id: String,
    version: i64,
    artifact_key: String,
    image_tag: String,
    status: String,
    is_active: bool,
    error: Option<String>,
    build_duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
    deactivated_at: Option<DateTime<Utc>>,
}

impl From<DeploymentRow> for Deployment {
    fn from(row: DeploymentRow) -> Self {
        Deployment {
            deployment_id: row.deployment_id,
            function_id: row.function_id,
            version: row.version,
            artifact_key: row.artifact_key,
            image_tag: row.image_tag,
            status: row.status.parse().unwrap_or_default(),
            is_active: row.is_active,
            error: row.error,
            build_duration_ms: row.build_duration_ms,
            created_at: row.created_at,
            activated_at: row.activated_at,
            deactivated_at: row.deactivated_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrations::run(&pool).await.unwrap();
        pool
    }

    async fn repo_with_function(function_id: &str) -> DeploymentRepository {
        let repo = DeploymentRepository::new(test_pool().await);
        repo.ensure_function(function_id, "hello", "alice", &FunctionSettings::default())
            .await
            .unwrap();
        repo
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            DeploymentStatus::Building,
            DeploymentStatus::Active,
            DeploymentStatus::Inactive,
            DeploymentStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<DeploymentStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<FunctionStatus>().is_err());
    }

    #[test]
    fn test_image_tag_derivation() {
        assert_eq!(image_tag("hello-world", 3), "hello-world-v3");

        let upper = image_tag("Hello", 1);
        assert!(upper.starts_with("hello-"));
        assert!(upper.ends_with("-v1"));
        assert_ne!(function_identity("Hello"), function_identity("hello"));

        let weird = function_identity("///");
        assert!(weird.starts_with("fn-"));
    }

    #[tokio::test]
    async fn test_ensure_function_is_idempotent() {
        let repo = repo_with_function("f1").await;
        let settings = FunctionSettings {
            timeout: Duration::from_secs(2),
            requires_database: true,
            ..Default::default()
        };
        let function = repo
            .ensure_function("f1", "renamed", "alice", &settings)
            .await
            .unwrap();

        assert_eq!(function.name, "renamed");
        assert_eq!(function.status, FunctionStatus::Initializing);
        assert_eq!(function.settings, FunctionSettings::default());
        assert!(function.active_deployment_id.is_none());
    }

    #[tokio::test]
    async fn test_activate_build_applies_settings_and_duration() {
        let repo = repo_with_function("f1").await;
        let d = repo.create_building_deployment("f1", "k").await.unwrap();
        let settings = FunctionSettings {
            timeout: Duration::from_millis(1500),
            requires_database: true,
            ..Default::default()
        };

        let active = repo
            .activate_build("f1", &d.deployment_id, 42, Some(&settings))
            .await
            .unwrap();

        assert_eq!(active.build_duration_ms, Some(42));
        let stored = repo.get(&d.deployment_id).await.unwrap().unwrap();
        assert_eq!(stored.build_duration_ms, Some(42));
        let function = repo.get_function("f1").await.unwrap().unwrap();
        assert_eq!(function.settings, settings);
    }

    #[tokio::test]
    async fn test_versions_are_sequential() {
        let repo = repo_with_function("f1").await;

        for expected in 1..=3 {
            let d = repo.create_building_deployment("f1", "key").await.unwrap();
            assert_eq!(d.version, expected);
            assert_eq!(d.status, DeploymentStatus::Building);
            assert_eq!(d.image_tag, format!("f1-v{}", expected));
        }

        let versions: Vec<i64> = repo
            .list_versions("f1")
            .await
            .unwrap()
            .iter()
            .map(|d| d.version)
            .collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_create_deployment_for_unknown_function() {
        let repo = DeploymentRepository::new(test_pool().await);
        let err = repo
            .create_building_deployment("ghost", "key")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FunctionNotFound(_)));
    }

    #[tokio::test]
    async fn test_activate_switches_single_active() {
        let repo = repo_with_function("f1").await;
        let v1 = repo.create_building_deployment("f1", "k1").await.unwrap();
        let v2 = repo.create_building_deployment("f1", "k2").await.unwrap();

        repo.activate("f1", &v1.deployment_id).await.unwrap();
        let activated = repo.activate("f1", &v2.deployment_id).await.unwrap();
        assert!(activated.is_active);

        let active = repo.get_active("f1").await.unwrap().unwrap();
        assert_eq!(active.version, 2);

        let old = repo.get(&v1.deployment_id).await.unwrap().unwrap();
        assert_eq!(old.status, DeploymentStatus::Inactive);
        assert!(!old.is_active);
        assert!(old.deactivated_at.is_some());

        let function = repo.get_function("f1").await.unwrap().unwrap();
        assert_eq!(function.status, FunctionStatus::Active);
        assert_eq!(function.active_deployment_id, Some(v2.deployment_id.clone()));

        let active_count = repo
            .list_versions("f1")
            .await
            .unwrap()
            .iter()
            .filter(|d| d.is_active)
            .count();
        assert_eq!(active_count, 1);
    }

    #[tokio::test]
    async fn test_activate_rejects_failed_and_foreign_deployments() {
        let repo = repo_with_function("f1").await;
        repo.ensure_function("f2", "other", "bob", &FunctionSettings::default())
            .await
            .unwrap();

        let failed = repo.create_building_deployment("f1", "k").await.unwrap();
        assert!(
            repo.mark_failed(&failed.deployment_id, "exit 1", Some(10))
                .await
                .unwrap()
        );
        let err = repo.activate("f1", &failed.deployment_id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let other = repo.create_building_deployment("f2", "k").await.unwrap();
        let err = repo.activate("f1", &other.deployment_id).await.unwrap_err();
        assert!(matches!(err, Error::DeploymentNotFound(_)));

        assert!(repo.get_active("f1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_failed_only_touches_building() {
        let repo = repo_with_function("f1").await;
        let d = repo.create_building_deployment("f1", "k").await.unwrap();
        repo.activate("f1", &d.deployment_id).await.unwrap();

        assert!(!repo.mark_failed(&d.deployment_id, "late", None).await.unwrap());
        let d = repo.get(&d.deployment_id).await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Active);
    }

    #[tokio::test]
    async fn test_failed_version_is_never_reused() {
        let repo = repo_with_function("f1").await;
        let v1 = repo.create_building_deployment("f1", "k").await.unwrap();
        repo.mark_failed(&v1.deployment_id, "boom", None).await.unwrap();

        let v2 = repo.create_building_deployment("f1", "k").await.unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(
            repo.get_by_version("f1", 1).await.unwrap().unwrap().error.as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn test_fail_stale_builds() {
        let repo = repo_with_function("f1").await;
        repo.create_building_deployment("f1", "k").await.unwrap();

        assert_eq!(repo.fail_stale_builds().await.unwrap(), 1);
        assert_eq!(repo.fail_stale_builds().await.unwrap(), 0);

        let d = repo.get_by_version("f1", 1).await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        let f = repo.get_function("f1").await.unwrap().unwrap();
        assert_eq!(f.status, FunctionStatus::Failed);
    }

    #[tokio::test]
    async fn test_delete_function_cascades() {
        let repo = repo_with_function("f1").await;
        repo.create_building_deployment("f1", "k").await.unwrap();

        assert!(repo.delete_function("f1").await.unwrap());
        assert!(repo.list_versions("f1").await.unwrap().is_empty());
        assert!(!repo.delete_function("f1").await.unwrap());
    }
}
