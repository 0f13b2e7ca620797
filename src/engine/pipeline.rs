//! The deployment pipeline: clone, detect, synthesize, build, run.
//!
//! Each run is a linear sequence of steps against one deployment row. Every
//! step appends timestamped log lines in execution order. Failure at any
//! step marks the deployment failed and finalizes the in-flight build row;
//! the temporary workspace is removed on every exit path.

use crate::config::Config;
use crate::db::{Build, DbPool, Deployment, DeploymentStatus, TriggerKind};
use crate::detect::{detect, FileListing, Framework};
use crate::git;
use crate::recipe::{self, RecipeSpec};
use crate::runtime::{BuildContext, ContainerRuntime, RunConfig};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{add_deployment_log, trigger_deploy, update_deployment_status, DeploymentJob};

fn workspace_path(deployment_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("slipway-{}", deployment_id))
}

/// Run the full pipeline for one deployment. Called from the engine's
/// detached task; the error return is for the engine's log only, the
/// deployment row carries the user-visible outcome.
pub async fn run_deployment(
    db: &DbPool,
    runtime: Arc<dyn ContainerRuntime>,
    config: &Config,
    deployment_id: &str,
    trigger: TriggerKind,
) -> Result<()> {
    let started = Instant::now();
    let workspace = workspace_path(deployment_id);
    let mut build_id: Option<String> = None;

    let result = execute(
        db,
        &runtime,
        config,
        deployment_id,
        trigger,
        &workspace,
        &mut build_id,
    )
    .await;

    if fs::try_exists(&workspace).await.unwrap_or(false) {
        if let Err(e) = fs::remove_dir_all(&workspace).await {
            tracing::warn!(%deployment_id, error = %e, "Failed to remove workspace");
        }
    }

    let duration_ms = started.elapsed().as_millis() as i64;

    match result {
        Ok(()) => {
            if let Some(build_id) = &build_id {
                finalize_build(db, deployment_id, build_id, "ready", duration_ms).await?;
            }
            add_deployment_log(db, deployment_id, "info", "Deployment complete").await?;
            Ok(())
        }
        Err(e) => {
            add_deployment_log(db, deployment_id, "error", &format!("Deployment failed: {e:#}"))
                .await?;
            update_deployment_status(db, deployment_id, DeploymentStatus::Failed).await?;
            if let Some(build_id) = &build_id {
                finalize_build(db, deployment_id, build_id, "failed", duration_ms).await?;
            }
            Err(e)
        }
    }
}

async fn execute(
    db: &DbPool,
    runtime: &Arc<dyn ContainerRuntime>,
    config: &Config,
    deployment_id: &str,
    trigger: TriggerKind,
    workspace: &Path,
    build_id: &mut Option<String>,
) -> Result<()> {
    let deployment: Deployment = sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
        .bind(deployment_id)
        .fetch_optional(db)
        .await?
        .with_context(|| format!("Deployment {} not found", deployment_id))?;

    add_deployment_log(
        db,
        deployment_id,
        "info",
        &format!("Starting deployment for {}", deployment.name),
    )
    .await?;

    // Tear down whatever is still attached from the previous run
    if let Some(container_id) = &deployment.container_id {
        runtime.stop(container_id).await?;
        runtime.remove(container_id).await?;
    }

    // Clone
    update_deployment_status(db, deployment_id, DeploymentStatus::Cloning).await?;
    add_deployment_log(
        db,
        deployment_id,
        "info",
        &format!("Cloning {} ({})", deployment.repo_url, deployment.branch),
    )
    .await?;

    if fs::try_exists(workspace).await.unwrap_or(false) {
        fs::remove_dir_all(workspace).await?;
    }
    git::clone_repo(
        &deployment.repo_url,
        &deployment.branch,
        workspace,
        config.git.github_token.as_deref(),
    )
    .await?;

    let commit = match git::read_head_commit(workspace).await {
        Ok(commit) => commit,
        Err(e) => {
            tracing::warn!(%deployment_id, error = %e, "Could not read commit metadata");
            git::CommitInfo::default()
        }
    };
    if !commit.sha.is_empty() {
        add_deployment_log(
            db,
            deployment_id,
            "info",
            &format!("Checked out {} ({})", &commit.sha[..commit.sha.len().min(8)], commit.message),
        )
        .await?;
    }

    *build_id = Some(open_build(db, &deployment, trigger, &commit).await?);

    let context_dir = match deployment.root_directory.as_deref() {
        Some(root) if !root.is_empty() => workspace.join(root),
        _ => workspace.to_path_buf(),
    };
    if !fs::try_exists(&context_dir).await.unwrap_or(false) {
        anyhow::bail!(
            "Root directory '{}' does not exist in the repository",
            deployment.root_directory.as_deref().unwrap_or_default()
        );
    }

    // Detect the framework when none is pinned, persisting profile fields
    // only where the user left them unset
    let deployment: Deployment = if deployment.needs_detection() {
        let listing = FileListing::scan(&context_dir).await?;
        match detect(&listing) {
            Some(detection) => {
                let profile = detection.profile();
                add_deployment_log(
                    db,
                    deployment_id,
                    "info",
                    &format!(
                        "Detected framework: {} (confidence {:.0}%)",
                        detection.framework,
                        detection.confidence * 100.0
                    ),
                )
                .await?;

                let install = detection
                    .package_manager
                    .map(|pm| pm.install_command())
                    .or(profile.install_command);
                sqlx::query(
                    "UPDATE deployments SET
                        framework = ?,
                        install_command = COALESCE(install_command, ?),
                        build_command = COALESCE(build_command, ?),
                        start_command = COALESCE(start_command, ?),
                        output_directory = COALESCE(output_directory, ?),
                        updated_at = datetime('now')
                     WHERE id = ?",
                )
                .bind(detection.framework.as_str())
                .bind(install)
                .bind(profile.build_command)
                .bind(profile.start_command)
                .bind(profile.output_directory)
                .bind(deployment_id)
                .execute(db)
                .await?;

                sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
                    .bind(deployment_id)
                    .fetch_one(db)
                    .await?
            }
            None => {
                add_deployment_log(
                    db,
                    deployment_id,
                    "warn",
                    "No framework detected, a repository Dockerfile is required",
                )
                .await?;
                deployment
            }
        }
    } else {
        deployment
    };

    // Build
    update_deployment_status(db, deployment_id, DeploymentStatus::Building).await?;

    let env_vars = deployment.env_var_list();
    let port = u16::try_from(deployment.port).context("Deployment port out of range")?;

    let has_dockerfile = fs::try_exists(context_dir.join("Dockerfile")).await?;
    if !has_dockerfile {
        let framework = deployment
            .framework
            .as_deref()
            .and_then(Framework::from_str)
            .context("No framework detected and no Dockerfile in the repository")?;
        let profile = framework.profile();
        let spec = RecipeSpec {
            runtime: profile.runtime,
            family: profile.family,
            install_command: deployment
                .install_command
                .clone()
                .or_else(|| profile.install_command.map(String::from)),
            build_command: deployment
                .build_command
                .clone()
                .or_else(|| profile.build_command.map(String::from)),
            start_command: deployment
                .start_command
                .clone()
                .or_else(|| profile.start_command.map(String::from)),
            output_directory: deployment
                .output_directory
                .clone()
                .or_else(|| profile.output_directory.map(String::from))
                .unwrap_or_else(|| ".".to_string()),
            port,
            build_env: env_vars.clone(),
        };
        recipe::write_recipe(&context_dir, &spec).await?;
    }

    add_deployment_log(db, deployment_id, "info", "Building image").await?;
    let image_tag = deployment.image_tag();
    let build_ctx = BuildContext {
        path: context_dir.to_string_lossy().to_string(),
        dockerfile: "Dockerfile".to_string(),
        tag: image_tag.clone(),
        build_args: env_vars
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect(),
    };

    // Forward build output into the deployment log, in order
    let (log_tx, mut log_rx) = mpsc::unbounded_channel::<String>();
    let log_db = db.clone();
    let log_deployment_id = deployment_id.to_string();
    let drain = tokio::spawn(async move {
        while let Some(line) = log_rx.recv().await {
            let _ = add_deployment_log(&log_db, &log_deployment_id, "info", &line).await;
        }
    });
    let build_result = runtime.build_image(&build_ctx, log_tx).await;
    let _ = drain.await;
    let image_id = build_result?;

    // Run: stray containers with our deterministic name are removed first
    let container_name = deployment.container_name();
    runtime.stop(&container_name).await?;
    runtime.remove(&container_name).await?;

    let mut env: Vec<(String, String)> = env_vars
        .iter()
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect();
    env.push(("PORT".to_string(), port.to_string()));

    add_deployment_log(
        db,
        deployment_id,
        "info",
        &format!("Starting container on port {}", port),
    )
    .await?;
    let container_id = runtime
        .create_and_start(&RunConfig {
            image: image_id.clone(),
            name: container_name,
            port,
            env,
            restart_policy: deployment.restart_policy.clone(),
        })
        .await?;

    // Hostname: minted once, reused on every later redeploy
    let (hostname, preview_url) = if config.proxy.subdomains_enabled() {
        let hostname = match deployment.hostname.clone() {
            Some(existing) => existing,
            None => mint_hostname(db, deployment_id, &deployment.name, &config.proxy.base_domain)
                .await?,
        };
        let preview_url = format!("http://{}", hostname);
        (Some(hostname), Some(preview_url))
    } else {
        (None, None)
    };

    // One write carries the transition into running together with every
    // field that only makes sense while running
    sqlx::query(
        "UPDATE deployments SET
            status = 'running',
            container_id = ?,
            image_id = ?,
            hostname = COALESCE(?, hostname),
            preview_url = COALESCE(?, preview_url),
            updated_at = datetime('now')
         WHERE id = ?",
    )
    .bind(&container_id)
    .bind(&image_id)
    .bind(&hostname)
    .bind(&preview_url)
    .bind(deployment_id)
    .execute(db)
    .await?;

    if let Some(build_id) = build_id.as_deref() {
        sqlx::query("UPDATE builds SET container_id = ?, image_id = ? WHERE id = ?")
            .bind(&container_id)
            .bind(&image_id)
            .bind(build_id)
            .execute(db)
            .await?;
    }

    // The tag now points at the new image; the one it replaced would dangle
    if let Some(old_image) = deployment.image_id.as_deref() {
        if old_image != image_id {
            if let Err(e) = runtime.remove_image(old_image).await {
                tracing::warn!(%deployment_id, error = %e, "Failed to remove superseded image");
            }
        }
    }

    if let Some(url) = &preview_url {
        add_deployment_log(db, deployment_id, "info", &format!("Live at {}", url)).await?;
    }

    Ok(())
}

/// Open the build row for this run. A rollback pre-inserts a queued row
/// carrying the target commit; that row is adopted here so the run finalizes
/// exactly one row and numbers stay gapless. Otherwise a fresh row gets the
/// next number in the deployment's sequence.
async fn open_build(
    db: &DbPool,
    deployment: &Deployment,
    trigger: TriggerKind,
    commit: &git::CommitInfo,
) -> Result<String> {
    let queued: Option<Build> = sqlx::query_as(
        "SELECT * FROM builds WHERE deployment_id = ? AND status = 'queued'
         ORDER BY build_number DESC LIMIT 1",
    )
    .bind(&deployment.id)
    .fetch_optional(db)
    .await?;

    if let Some(build) = queued {
        sqlx::query(
            "UPDATE builds SET status = 'building', commit_sha = ?, commit_message = ?, commit_author = ? WHERE id = ?",
        )
        .bind(&commit.sha)
        .bind(&commit.message)
        .bind(&commit.author)
        .bind(&build.id)
        .execute(db)
        .await?;
        return Ok(build.id);
    }

    let id = Uuid::new_v4().to_string();
    let number = next_build_number(db, &deployment.id).await?;
    sqlx::query(
        "INSERT INTO builds (id, deployment_id, build_number, status, branch, commit_sha, commit_message, commit_author, trigger_kind, created_at)
         VALUES (?, ?, ?, 'building', ?, ?, ?, ?, ?, datetime('now'))",
    )
    .bind(&id)
    .bind(&deployment.id)
    .bind(number)
    .bind(&deployment.branch)
    .bind(&commit.sha)
    .bind(&commit.message)
    .bind(&commit.author)
    .bind(trigger.as_str())
    .execute(db)
    .await?;
    Ok(id)
}

pub(crate) async fn next_build_number(db: &DbPool, deployment_id: &str) -> Result<i64> {
    let (max,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(build_number), 0) FROM builds WHERE deployment_id = ?")
            .bind(deployment_id)
            .fetch_one(db)
            .await?;
    Ok(max + 1)
}

/// Finalize the build row exactly once. A ready build becomes the single
/// current build for its deployment.
async fn finalize_build(
    db: &DbPool,
    deployment_id: &str,
    build_id: &str,
    status: &str,
    duration_ms: i64,
) -> Result<()> {
    if status == "ready" {
        sqlx::query("UPDATE builds SET is_current = 0 WHERE deployment_id = ?")
            .bind(deployment_id)
            .execute(db)
            .await?;
    }
    sqlx::query(
        "UPDATE builds SET status = ?, is_current = ?, duration_ms = ?, finished_at = datetime('now') WHERE id = ?",
    )
    .bind(status)
    .bind(if status == "ready" { 1 } else { 0 })
    .bind(duration_ms)
    .bind(build_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Queue a rollback: a fresh queued build row pointing at the target's
/// commit, then a normal pipeline trigger. The run re-clones and re-builds;
/// no cached artifact is reused.
pub async fn queue_rollback(
    db: &DbPool,
    tx: &mpsc::Sender<DeploymentJob>,
    deployment_id: &str,
    target_build_id: &str,
) -> Result<String> {
    let target: Build = sqlx::query_as("SELECT * FROM builds WHERE id = ? AND deployment_id = ?")
        .bind(target_build_id)
        .bind(deployment_id)
        .fetch_optional(db)
        .await?
        .context("Build not found")?;

    if !target.is_ready() {
        anyhow::bail!("Cannot roll back to a build that is not ready");
    }

    sqlx::query("UPDATE builds SET is_current = 0 WHERE deployment_id = ?")
        .bind(deployment_id)
        .execute(db)
        .await?;

    let id = Uuid::new_v4().to_string();
    let number = next_build_number(db, deployment_id).await?;
    sqlx::query(
        "INSERT INTO builds (id, deployment_id, build_number, status, branch, commit_sha, commit_message, commit_author, trigger_kind, created_at)
         VALUES (?, ?, ?, 'queued', ?, ?, ?, ?, 'rollback', datetime('now'))",
    )
    .bind(&id)
    .bind(deployment_id)
    .bind(number)
    .bind(&target.branch)
    .bind(&target.commit_sha)
    .bind(&target.commit_message)
    .bind(&target.commit_author)
    .execute(db)
    .await?;

    trigger_deploy(db, tx, deployment_id, TriggerKind::Rollback).await?;
    Ok(id)
}

pub(crate) fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Mint a hostname under the base domain: the slugified name, with the
/// smallest unused numeric suffix when the bare slug is taken by another
/// deployment.
pub(crate) async fn mint_hostname(
    db: &DbPool,
    deployment_id: &str,
    name: &str,
    base_domain: &str,
) -> Result<String> {
    let slug = slugify(name);
    let taken: Vec<(String,)> = sqlx::query_as(
        "SELECT hostname FROM deployments
         WHERE hostname IS NOT NULL AND hostname LIKE ? AND id != ?",
    )
    .bind(format!("{}%.{}", slug, base_domain))
    .bind(deployment_id)
    .fetch_all(db)
    .await?;
    let taken: std::collections::HashSet<String> = taken.into_iter().map(|(h,)| h).collect();

    let bare = format!("{}.{}", slug, base_domain);
    if !taken.contains(&bare) {
        return Ok(bare);
    }
    let mut suffix = 2u32;
    loop {
        let candidate = format!("{}-{}.{}", slug, suffix, base_domain);
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        suffix += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn insert_deployment(pool: &DbPool, id: &str, name: &str, hostname: Option<&str>) {
        sqlx::query(
            "INSERT INTO deployments (id, name, repo_url, port, hostname) VALUES (?, ?, ?, 3000, ?)",
        )
        .bind(id)
        .bind(name)
        .bind("https://github.com/acme/app")
        .bind(hostname)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insert_build(pool: &DbPool, id: &str, deployment_id: &str, number: i64, status: &str) {
        sqlx::query(
            "INSERT INTO builds (id, deployment_id, build_number, status, branch, trigger_kind)
             VALUES (?, ?, ?, ?, 'main', 'manual')",
        )
        .bind(id)
        .bind(deployment_id)
        .bind(number)
        .bind(status)
        .execute(pool)
        .await
        .unwrap();
    }

    #[test]
    fn slugify_flattens_names() {
        assert_eq!(slugify("My Cool App"), "my-cool-app");
        assert_eq!(slugify("api_v2!"), "api-v2");
        assert_eq!(slugify("--edge--"), "edge");
    }

    #[tokio::test]
    async fn build_numbers_are_a_strict_sequence() {
        let pool = db::init_test().await;
        insert_deployment(&pool, "d1", "app", None).await;

        assert_eq!(next_build_number(&pool, "d1").await.unwrap(), 1);
        insert_build(&pool, "b1", "d1", 1, "ready").await;
        insert_build(&pool, "b2", "d1", 2, "failed").await;
        assert_eq!(next_build_number(&pool, "d1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn minted_hostname_takes_smallest_unused_suffix() {
        let pool = db::init_test().await;
        insert_deployment(&pool, "d1", "blog", Some("blog.apps.test")).await;
        insert_deployment(&pool, "d2", "blog-two", Some("blog-2.apps.test")).await;
        insert_deployment(&pool, "d3", "blog three", None).await;

        let hostname = mint_hostname(&pool, "d3", "blog", "apps.test").await.unwrap();
        assert_eq!(hostname, "blog-3.apps.test");
    }

    #[tokio::test]
    async fn bare_slug_is_preferred() {
        let pool = db::init_test().await;
        insert_deployment(&pool, "d1", "shop", None).await;

        let hostname = mint_hostname(&pool, "d1", "Shop", "apps.test").await.unwrap();
        assert_eq!(hostname, "shop.apps.test");
    }

    #[tokio::test]
    async fn rollback_requires_a_ready_build() {
        let pool = db::init_test().await;
        insert_deployment(&pool, "d1", "app", None).await;
        insert_build(&pool, "b1", "d1", 1, "failed").await;

        let (tx, _rx) = mpsc::channel(4);
        let err = queue_rollback(&pool, &tx, "d1", "b1").await.unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }

    #[tokio::test]
    async fn rollback_queues_a_new_build_row() {
        let pool = db::init_test().await;
        insert_deployment(&pool, "d1", "app", None).await;
        insert_build(&pool, "b1", "d1", 1, "ready").await;
        sqlx::query("UPDATE builds SET is_current = 1, commit_sha = 'abc123' WHERE id = 'b1'")
            .execute(&pool)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let new_id = queue_rollback(&pool, &tx, "d1", "b1").await.unwrap();

        let new_build: Build = sqlx::query_as("SELECT * FROM builds WHERE id = ?")
            .bind(&new_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(new_build.build_number, 2);
        assert_eq!(new_build.status, "queued");
        assert_eq!(new_build.trigger_kind, "rollback");
        assert_eq!(new_build.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(new_build.is_current, 0);

        // The target lost its current flag and the deployment was reset
        let target: Build = sqlx::query_as("SELECT * FROM builds WHERE id = 'b1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(target.is_current, 0);

        let (status,): (String,) =
            sqlx::query_as("SELECT status FROM deployments WHERE id = 'd1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "pending");

        let job = rx.recv().await.unwrap();
        assert_eq!(job.0, "d1");
        assert_eq!(job.1, TriggerKind::Rollback);
    }

    #[tokio::test]
    async fn queued_build_is_adopted_not_duplicated() {
        let pool = db::init_test().await;
        insert_deployment(&pool, "d1", "app", None).await;
        insert_build(&pool, "b1", "d1", 1, "queued").await;

        let deployment: Deployment = sqlx::query_as("SELECT * FROM deployments WHERE id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let commit = git::CommitInfo {
            sha: "def456".into(),
            message: "fix".into(),
            author: "dev".into(),
        };
        let id = open_build(&pool, &deployment, TriggerKind::Rollback, &commit)
            .await
            .unwrap();
        assert_eq!(id, "b1");

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM builds WHERE deployment_id = 'd1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);

        let build: Build = sqlx::query_as("SELECT * FROM builds WHERE id = 'b1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(build.status, "building");
        assert_eq!(build.commit_sha.as_deref(), Some("def456"));
    }

    use crate::runtime::{ContainerState, LogLine};
    use async_trait::async_trait;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Container runtime that records every call and answers from canned
    /// values, so a full pipeline run can execute against a real clone
    /// without a Docker daemon.
    struct RecordingRuntime {
        db: DbPool,
        image_id: String,
        calls: Mutex<Vec<String>>,
        row_at_run: Mutex<Option<(String, Option<String>, Option<String>, Option<String>)>>,
    }

    impl RecordingRuntime {
        fn new(db: DbPool, image_id: &str) -> Self {
            Self {
                db,
                image_id: image_id.to_string(),
                calls: Mutex::new(Vec::new()),
                row_at_run: Mutex::new(None),
            }
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContainerRuntime for RecordingRuntime {
        async fn build_image(
            &self,
            ctx: &BuildContext,
            log_tx: mpsc::UnboundedSender<String>,
        ) -> Result<String> {
            self.record(format!("build {}", ctx.tag));
            let _ = log_tx.send("Step 1/1 : FROM nginx:alpine".to_string());
            Ok(self.image_id.clone())
        }

        async fn create_and_start(&self, config: &RunConfig) -> Result<String> {
            // Capture what the deployment row looked like at container
            // creation time
            let row = sqlx::query_as(
                "SELECT status, container_id, image_id, preview_url FROM deployments LIMIT 1",
            )
            .fetch_one(&self.db)
            .await?;
            *self.row_at_run.lock().unwrap() = Some(row);
            self.record(format!("run {} port {}", config.name, config.port));
            Ok("container-1".to_string())
        }

        async fn start(&self, container_id: &str) -> Result<()> {
            self.record(format!("start {container_id}"));
            Ok(())
        }

        async fn stop(&self, container_id: &str) -> Result<()> {
            self.record(format!("stop {container_id}"));
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> Result<()> {
            self.record(format!("remove {container_id}"));
            Ok(())
        }

        async fn inspect(&self, _container_id: &str) -> Result<ContainerState> {
            Ok(ContainerState::Running)
        }

        async fn logs(&self, _container_id: &str) -> Result<Vec<LogLine>> {
            Ok(Vec::new())
        }

        async fn follow_logs(
            &self,
            _container_id: &str,
        ) -> Result<Pin<Box<dyn futures::Stream<Item = LogLine> + Send>>> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn remove_image(&self, image: &str) -> Result<()> {
            self.record(format!("remove_image {image}"));
            Ok(())
        }

        async fn is_available(&self) -> bool {
            true
        }
    }

    fn git_in(dir: &Path, args: &[&str]) {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// A local repository with one commit on `main`, cloneable by path.
    fn seed_repo(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        git_in(dir.path(), &["init", "-q"]);
        for (name, content) in files {
            std::fs::write(dir.path().join(name), content).unwrap();
        }
        git_in(dir.path(), &["add", "."]);
        git_in(
            dir.path(),
            &[
                "-c",
                "user.email=dev@example.com",
                "-c",
                "user.name=dev",
                "commit",
                "-q",
                "-m",
                "initial",
            ],
        );
        git_in(dir.path(), &["branch", "-M", "main"]);
        dir
    }

    #[tokio::test]
    async fn static_site_pipeline_reaches_running() {
        let pool = db::init_test().await;
        let repo = seed_repo(&[("index.html", "<h1>hello</h1>")]);
        sqlx::query("INSERT INTO deployments (id, name, repo_url, port) VALUES ('d1', 'site', ?, 4180)")
            .bind(repo.path().to_string_lossy().into_owned())
            .execute(&pool)
            .await
            .unwrap();

        let runtime = Arc::new(RecordingRuntime::new(pool.clone(), "img-1"));
        let config = Config::default();
        run_deployment(&pool, runtime.clone(), &config, "d1", TriggerKind::Manual)
            .await
            .unwrap();

        let deployment: Deployment = sqlx::query_as("SELECT * FROM deployments WHERE id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(deployment.status, "running");
        assert_eq!(deployment.container_id.as_deref(), Some("container-1"));
        assert_eq!(deployment.image_id.as_deref(), Some("img-1"));
        assert_eq!(deployment.framework.as_deref(), Some("static"));

        // Run-only fields stay empty until the single running transition
        let (status, container_id, image_id, preview_url) =
            runtime.row_at_run.lock().unwrap().clone().unwrap();
        assert_eq!(status, "building");
        assert!(container_id.is_none());
        assert!(image_id.is_none());
        assert!(preview_url.is_none());

        let build: Build = sqlx::query_as("SELECT * FROM builds WHERE deployment_id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(build.status, "ready");
        assert_eq!(build.build_number, 1);
        assert_eq!(build.is_current, 1);
        assert!(build.commit_sha.as_deref().is_some_and(|sha| !sha.is_empty()));

        let calls = runtime.calls();
        assert!(calls.iter().any(|c| c == "build slipway-site:latest"));
        assert!(calls.iter().any(|c| c == "run slipway-site port 4180"));
    }

    #[tokio::test]
    async fn failed_clone_tears_down_the_old_container() {
        let pool = db::init_test().await;
        sqlx::query(
            "INSERT INTO deployments (id, name, repo_url, port, status, container_id)
             VALUES ('d1', 'app', '/nonexistent/repo', 4181, 'running', 'old-1')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let runtime = Arc::new(RecordingRuntime::new(pool.clone(), "img-1"));
        let config = Config::default();
        let result =
            run_deployment(&pool, runtime.clone(), &config, "d1", TriggerKind::Manual).await;
        assert!(result.is_err());

        let (status,): (String,) = sqlx::query_as("SELECT status FROM deployments WHERE id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "failed");

        // The previous container was stopped and removed before the clone,
        // and nothing new was started
        let calls = runtime.calls();
        assert!(calls.iter().any(|c| c == "stop old-1"));
        assert!(calls.iter().any(|c| c == "remove old-1"));
        assert!(!calls.iter().any(|c| c.starts_with("run ")));

        // The clone never succeeded, so no build row was opened
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM builds WHERE deployment_id = 'd1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn redeploy_removes_the_superseded_image() {
        let pool = db::init_test().await;
        let repo = seed_repo(&[("index.html", "<h1>v2</h1>")]);
        sqlx::query(
            "INSERT INTO deployments
                (id, name, repo_url, port, status, framework, container_id, image_id)
             VALUES ('d1', 'site', ?, 4182, 'running', 'static', 'old-1', 'img-old')",
        )
        .bind(repo.path().to_string_lossy().into_owned())
        .execute(&pool)
        .await
        .unwrap();

        let runtime = Arc::new(RecordingRuntime::new(pool.clone(), "img-new"));
        let config = Config::default();
        run_deployment(&pool, runtime.clone(), &config, "d1", TriggerKind::Manual)
            .await
            .unwrap();

        let (image_id,): (Option<String>,) =
            sqlx::query_as("SELECT image_id FROM deployments WHERE id = 'd1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(image_id.as_deref(), Some("img-new"));

        let calls = runtime.calls();
        assert!(calls.iter().any(|c| c == "stop old-1"));
        assert!(calls.iter().any(|c| c == "remove old-1"));
        assert!(calls.iter().any(|c| c == "remove_image img-old"));
        assert!(!calls.iter().any(|c| c == "remove_image img-new"));
    }
}
