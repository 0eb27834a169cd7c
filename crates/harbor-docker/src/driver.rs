//! The sandbox driver: bounded, timeout-guarded engine calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::BuildImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use harbor_settings::SandboxSettings;

use crate::error::{DriverError, Result};
use crate::image::dockerfile_tar;
use crate::spec::SandboxSpec;

/// Engine-side view of one container.
#[derive(Debug, Clone)]
pub struct SandboxState {
    pub id: String,
    pub running: bool,
    pub status: &'static str,
}

/// Captured result of one exec inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Normalized resource usage for one sandbox.
#[derive(Debug, Clone, Default)]
pub struct SandboxStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Async facade over the container engine.
///
/// Mutating operations share a bounded semaphore; every call runs under its
/// own deadline. Cancellation is cooperative: dropping the returned future
/// abandons the request.
#[derive(Debug)]
pub struct SandboxDriver {
    client: Docker,
    ops: Arc<Semaphore>,
    op_timeout: Duration,
    build_timeout: Duration,
}

impl SandboxDriver {
    pub fn new(settings: &SandboxSettings) -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Engine(format!("connect: {e}")))?;

        Ok(Self {
            client,
            ops: Arc::new(Semaphore::new(settings.op_concurrency.max(1))),
            op_timeout: Duration::from_secs(settings.op_timeout_secs),
            build_timeout: Duration::from_secs(settings.build_timeout_secs),
        })
    }

    /// Whether the engine is reachable.
    pub async fn ping(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    /// Number of driver operations that may run at once.
    pub fn op_permits(&self) -> usize {
        self.ops.available_permits()
    }

    async fn permit(&self) -> tokio::sync::SemaphorePermit<'_> {
        // The semaphore is never closed while the driver is alive.
        self.ops.acquire().await.expect("driver semaphore closed")
    }

    async fn deadline<T>(
        &self,
        op: &'static str,
        timeout: Duration,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DriverError::Timeout(op))?
    }

    /// Check that an image exists locally.
    pub async fn get_image(&self, tag: &str) -> Result<()> {
        self.deadline("inspect_image", self.op_timeout, async {
            self.client
                .inspect_image(tag)
                .await
                .map(|_| ())
                .map_err(|e| DriverError::from_engine("inspect_image", e))
        })
        .await
    }

    /// Build an image from an in-memory Dockerfile under the build timeout.
    pub async fn build_image(&self, dockerfile: &str, tag: &str) -> Result<()> {
        let _permit = self.permit().await;
        info!(tag, "building sandbox image");

        let archive = dockerfile_tar(dockerfile)
            .map_err(|e| DriverError::Engine(format!("build context: {e}")))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            ..Default::default()
        };

        self.deadline("build_image", self.build_timeout, async {
            let mut stream =
                self.client
                    .build_image(options, None, Some(archive.into()));

            while let Some(item) = stream.next().await {
                let update = item.map_err(|e| DriverError::from_engine("build_image", e))?;
                if let Some(msg) = update.stream {
                    let msg = msg.trim();
                    if !msg.is_empty() {
                        debug!(tag, "{msg}");
                    }
                }
                if let Some(err) = update.error {
                    return Err(DriverError::Engine(format!("build_image: {err}")));
                }
            }
            Ok(())
        })
        .await?;

        info!(tag, "sandbox image built");
        Ok(())
    }

    /// Ensure the base image exists, building it if missing.
    pub async fn ensure_image(&self, dockerfile: &str, tag: &str) -> Result<()> {
        match self.get_image(tag).await {
            Ok(()) => {
                debug!(tag, "sandbox image present");
                Ok(())
            }
            Err(DriverError::NotFound(_)) => self.build_image(dockerfile, tag).await,
            Err(e) => Err(e),
        }
    }

    /// Inspect a container by id or name.
    pub async fn get_container(&self, id: &str) -> Result<SandboxState> {
        self.deadline("inspect_container", self.op_timeout, async {
            let inspect = self
                .client
                .inspect_container(id, None)
                .await
                .map_err(|e| DriverError::from_engine("inspect_container", e))?;

            let status = inspect
                .state
                .as_ref()
                .and_then(|s| s.status)
                .unwrap_or(ContainerStateStatusEnum::EMPTY);

            Ok(SandboxState {
                id: inspect.id.unwrap_or_else(|| id.to_string()),
                running: status == ContainerStateStatusEnum::RUNNING,
                status: state_name(status),
            })
        })
        .await
    }

    /// Create a container from a spec. Returns the engine-assigned id.
    pub async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        let _permit = self.permit().await;

        let host_config = HostConfig {
            mounts: Some(spec.mounts.iter().map(|m| m.to_engine_mount()).collect()),
            memory: spec.memory_limit_bytes,
            memory_swap: spec.memory_limit_bytes,
            nano_cpus: spec.nano_cpus,
            network_mode: Some(spec.network_mode.clone()),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(vec![]),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env_lines()),
            working_dir: Some(spec.workdir.clone()),
            user: Some(spec.user.clone()),
            tty: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        });

        self.deadline("create_container", self.op_timeout, async {
            let created = self
                .client
                .create_container(options, config)
                .await
                .map_err(|e| DriverError::from_engine("create_container", e))?;
            debug!(container_id = %short(&created.id), name = %spec.name, "container created");
            Ok(created.id)
        })
        .await
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let _permit = self.permit().await;
        self.deadline("start_container", self.op_timeout, async {
            self.client
                .start_container(id, None::<StartContainerOptions<String>>)
                .await
                .map_err(|e| DriverError::from_engine("start_container", e))
        })
        .await?;
        debug!(container_id = %short(id), "container started");
        Ok(())
    }

    pub async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let _permit = self.permit().await;
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        // The engine may take up to the grace period before killing.
        let timeout = self.op_timeout + grace;
        self.deadline("stop_container", timeout, async {
            self.client
                .stop_container(id, Some(options))
                .await
                .map_err(|e| DriverError::from_engine("stop_container", e))
        })
        .await?;
        debug!(container_id = %short(id), "container stopped");
        Ok(())
    }

    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let _permit = self.permit().await;
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        self.deadline("remove_container", self.op_timeout, async {
            self.client
                .remove_container(id, Some(options))
                .await
                .map_err(|e| DriverError::from_engine("remove_container", e))
        })
        .await?;
        debug!(container_id = %short(id), "container removed");
        Ok(())
    }

    /// Run a command inside the sandbox, optionally streaming bytes to its
    /// stdin, and capture combined output plus the exit code.
    pub async fn exec(
        &self,
        id: &str,
        argv: Vec<String>,
        user: &str,
        workdir: Option<&str>,
        env: Option<&HashMap<String, String>>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput> {
        let _permit = self.permit().await;

        let env_lines: Option<Vec<String>> =
            env.map(|e| e.iter().map(|(k, v)| format!("{k}={v}")).collect());

        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(stdin.is_some()),
            cmd: Some(argv),
            user: Some(user.to_string()),
            working_dir: workdir.map(str::to_string),
            env: env_lines,
            ..Default::default()
        };

        self.deadline("exec", self.op_timeout, async {
            let exec = self
                .client
                .create_exec(id, options)
                .await
                .map_err(|e| DriverError::from_engine("create_exec", e))?;

            let mut collected = String::new();
            match self
                .client
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| DriverError::from_engine("start_exec", e))?
            {
                StartExecResults::Attached { mut output, mut input } => {
                    if let Some(bytes) = stdin {
                        input
                            .write_all(bytes)
                            .await
                            .map_err(|e| DriverError::Engine(format!("exec stdin: {e}")))?;
                        input
                            .shutdown()
                            .await
                            .map_err(|e| DriverError::Engine(format!("exec stdin close: {e}")))?;
                    }
                    drop(input);

                    while let Some(chunk) = output.next().await {
                        match chunk {
                            Ok(LogOutput::StdOut { message })
                            | Ok(LogOutput::StdErr { message }) => {
                                collected.push_str(&String::from_utf8_lossy(&message));
                            }
                            Ok(_) => {}
                            Err(e) => {
                                warn!(container_id = %short(id), error = %e, "exec stream error");
                                break;
                            }
                        }
                    }
                }
                StartExecResults::Detached => {}
            }

            let inspect = self
                .client
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| DriverError::from_engine("inspect_exec", e))?;

            Ok(ExecOutput {
                exit_code: inspect.exit_code.unwrap_or(-1),
                output: collected,
            })
        })
        .await
    }

    /// Poll until the container reports `running`, then (if given) until the
    /// check command exits 0. Errors with `Timeout` past the deadline.
    pub async fn wait_ready(
        &self,
        id: &str,
        check_cmd: Option<&[String]>,
        user: &str,
        deadline: Duration,
        interval: Duration,
    ) -> Result<()> {
        let started = tokio::time::Instant::now();

        loop {
            if started.elapsed() >= deadline {
                return Err(DriverError::Timeout("wait_ready"));
            }

            match self.get_container(id).await {
                Ok(state) if state.running => {
                    let Some(cmd) = check_cmd else {
                        return Ok(());
                    };
                    match self.exec(id, cmd.to_vec(), user, None, None, None).await {
                        Ok(result) if result.success() => return Ok(()),
                        Ok(result) => {
                            debug!(
                                container_id = %short(id),
                                exit_code = result.exit_code,
                                "readiness check not passing yet"
                            );
                        }
                        Err(e) => {
                            debug!(container_id = %short(id), error = %e, "readiness exec failed");
                        }
                    }
                }
                Ok(state) => {
                    debug!(container_id = %short(id), status = state.status, "not running yet");
                }
                Err(DriverError::NotFound(ctx)) => return Err(DriverError::NotFound(ctx)),
                Err(e) => {
                    debug!(container_id = %short(id), error = %e, "readiness inspect failed");
                }
            }

            tokio::time::sleep(interval).await;
        }
    }

    /// One-shot resource stats, normalized to CPU% and byte counts.
    pub async fn stats(&self, id: &str) -> Result<SandboxStats> {
        self.deadline("stats", self.op_timeout, async {
            let options = StatsOptions {
                stream: false,
                one_shot: false,
            };
            let mut stream = self.client.stats(id, Some(options));
            let Some(item) = stream.next().await else {
                return Ok(SandboxStats::default());
            };
            let stats = item.map_err(|e| DriverError::from_engine("stats", e))?;

            let online_cpus = stats
                .cpu_stats
                .online_cpus
                .or_else(|| {
                    stats
                        .cpu_stats
                        .cpu_usage
                        .percpu_usage
                        .as_ref()
                        .map(|v| v.len() as u64)
                })
                .unwrap_or(1);

            let cpu_percent = cpu_percent(
                stats.cpu_stats.cpu_usage.total_usage,
                stats.precpu_stats.cpu_usage.total_usage,
                stats.cpu_stats.system_cpu_usage.unwrap_or(0),
                stats.precpu_stats.system_cpu_usage.unwrap_or(0),
                online_cpus,
            );

            Ok(SandboxStats {
                cpu_percent,
                memory_usage_bytes: stats.memory_stats.usage.unwrap_or(0),
                memory_limit_bytes: stats.memory_stats.limit.unwrap_or(0),
            })
        })
        .await
    }

    /// Tail of the container's combined log output.
    pub async fn logs_tail(&self, id: &str, lines: usize) -> Result<Vec<String>> {
        self.deadline("logs", self.op_timeout, async {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                tail: lines.to_string(),
                ..Default::default()
            };

            let mut collected = String::new();
            let mut stream = self.client.logs(id, Some(options));
            while let Some(item) = stream.next().await {
                match item {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                        collected.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(container_id = %short(id), error = %e, "log stream error");
                        break;
                    }
                }
            }

            Ok(collected.lines().map(str::to_string).collect())
        })
        .await
    }
}

/// Normalized CPU usage percentage from two engine samples.
fn cpu_percent(cpu_total: u64, precpu_total: u64, system: u64, presystem: u64, cpus: u64) -> f64 {
    let cpu_delta = cpu_total.saturating_sub(precpu_total) as f64;
    let system_delta = system.saturating_sub(presystem) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }
    let pct = (cpu_delta / system_delta) * cpus as f64 * 100.0;
    (pct * 100.0).round() / 100.0
}

fn state_name(status: ContainerStateStatusEnum) -> &'static str {
    match status {
        ContainerStateStatusEnum::CREATED => "created",
        ContainerStateStatusEnum::RUNNING => "running",
        ContainerStateStatusEnum::PAUSED => "paused",
        ContainerStateStatusEnum::RESTARTING => "restarting",
        ContainerStateStatusEnum::REMOVING => "removing",
        ContainerStateStatusEnum::EXITED => "exited",
        ContainerStateStatusEnum::DEAD => "dead",
        ContainerStateStatusEnum::EMPTY => "unknown",
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}
