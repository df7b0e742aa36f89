//! Container Manager — the orchestrator's single collaborator with the
//! container-runtime daemon.
//!
//! Hardened container creation, lifecycle, stats and log retrieval over
//! `bollard`. The `attachPty` operation is realized as a Docker *exec* with
//! `tty: true` rather than an attach to the entrypoint process: the
//! entrypoint is a long-lived idle process, while the interactive shell a
//! client drives is a separate exec'd process with its own resizable TTY.

use std::collections::HashMap;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

use super::types::{
    ContainerFilter, ContainerInfo, ContainerSpec, ContainerStats, ContainerStatus,
};

/// Linux capabilities dropped from every sandbox container. Only what a
/// non-root interactive shell needs is implicitly retained by Docker's
/// default allow set minus this drop list — nothing is explicitly added back.
fn dropped_capabilities() -> Vec<String> {
    [
        "SETPCAP", "MKNOD", "AUDIT_WRITE", "NET_RAW", "DAC_OVERRIDE", "FOWNER", "FSETID",
        "NET_BIND_SERVICE", "SYS_CHROOT", "SETFCAP", "AUDIT_CONTROL", "AUDIT_READ",
        "BLOCK_SUSPEND", "DAC_READ_SEARCH", "IPC_LOCK", "IPC_OWNER", "LEASE",
        "LINUX_IMMUTABLE", "MAC_ADMIN", "MAC_OVERRIDE", "NET_ADMIN", "NET_BROADCAST",
        "SYSLOG", "SYS_ADMIN", "SYS_BOOT", "SYS_MODULE", "SYS_NICE", "SYS_PACCT",
        "SYS_PTRACE", "SYS_RAWIO", "SYS_RESOURCE", "SYS_TIME", "SYS_TTY_CONFIG",
        "WAKE_ALARM",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct AttachedPty {
    pub output: Box<dyn AsyncRead + Unpin + Send>,
    pub input: Box<dyn AsyncWrite + Unpin + Send>,
    pub exec_id: String,
}

pub struct ContainerManager {
    client: Docker,
}

impl ContainerManager {
    pub fn connect(socket: &str) -> Result<Self> {
        let client = Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| AppError::DaemonUnavailable(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> Result<()> {
        self.client.ping().await?;
        Ok(())
    }

    pub async fn image_known(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn pull_image(&self, image: &str) -> Result<()> {
        info!(image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.client.create_image(options, None, None);
        while let Some(item) = stream.next().await {
            item.map_err(|e| AppError::OperationFailed(format!("pulling {image}: {e}")))?;
        }
        Ok(())
    }

    /// Create and start a hardened sandbox container. Idempotent only in the
    /// sense that a name collision surfaces as `ContainerFailed`; callers are
    /// expected to generate unique names (service prefix + env + session id8).
    pub async fn create(&self, spec: ContainerSpec) -> Result<String> {
        if !self.image_known(&spec.image).await? {
            self.pull_image(&spec.image).await?;
        }

        let mut labels = HashMap::new();
        labels.insert("service".to_string(), spec.service_prefix.clone());
        labels.insert("sessionId".to_string(), spec.session_id.clone());
        labels.insert("environment".to_string(), spec.environment.clone());
        labels.insert("createdAt".to_string(), spec.created_at_epoch_ms.to_string());
        if let Some(tp) = &spec.tool_pair {
            labels.insert("toolPair".to_string(), tp.clone());
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let tmpfs = {
            let mut m = HashMap::new();
            m.insert(spec.working_dir.clone(), "rw,exec,nosuid,size=256M".to_string());
            m.insert("/tmp".to_string(), "rw,exec,nosuid,size=64M".to_string());
            m
        };

        let host_config = HostConfig {
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_bytes),
            cpu_quota: Some(spec.limits.cpu_quota),
            cpu_period: Some(spec.limits.cpu_period),
            pids_limit: Some(spec.limits.pids_limit),
            oom_kill_disable: Some(false),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(dropped_capabilities()),
            // No network namespace: sandboxes never need outbound/inbound networking.
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            tmpfs: Some(tmpfs),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let config = Config {
            hostname: Some(spec.name.clone()),
            user: Some(spec.uid_gid.clone()),
            env: Some(env),
            image: Some(spec.image.clone()),
            labels: Some(labels),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            stdin_once: Some(false),
            tty: Some(true),
            working_dir: Some(spec.working_dir.clone()),
            host_config: Some(host_config),
            // The entrypoint just idles; interactive work happens over `attach_pty`'s exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| AppError::ContainerFailed(e.to_string()))?;

        for warning in created.warnings {
            warn!(container = %spec.name, warning, "docker create warning");
        }

        self.client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| AppError::ContainerFailed(e.to_string()))?;

        Ok(created.id)
    }

    pub async fn stop(&self, id: &str, grace: Duration) -> Result<()> {
        let options = Some(StopContainerOptions {
            t: grace.as_secs() as i64,
        });
        match self.client.stop_container(id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn restart(&self, id: &str, grace: Duration) -> Result<()> {
        let options = Some(bollard::container::RestartContainerOptions { t: grace.as_secs() as i64 });
        self.client.restart_container(id, options).await?;
        Ok(())
    }

    pub async fn terminate(&self, id: &str) -> Result<()> {
        match self
            .client
            .kill_container(id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code, .. })
                if status_code == 404 || status_code == 409 =>
            {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Idempotent over NotFound: a second `remove` on an already-gone
    /// container is success, not an error.
    pub async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let options = Some(RemoveContainerOptions { force, v: false, link: false });
        match self.client.remove_container(id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerInfo> {
        let details = self.client.inspect_container(id, None).await?;
        Ok(to_container_info(details))
    }

    /// One-shot stats sample, not a stream.
    pub async fn stats(&self, id: &str) -> Result<ContainerStats> {
        let options = Some(StatsOptions { stream: false, one_shot: true });
        let mut stream = self.client.stats(id, options);
        let sample = stream
            .next()
            .await
            .ok_or_else(|| AppError::OperationFailed("no stats sample".into()))??;

        let cpu_delta = sample.cpu_stats.cpu_usage.total_usage as f64
            - sample.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = sample.cpu_stats.system_cpu_usage.unwrap_or(0) as f64
            - sample.precpu_stats.system_cpu_usage.unwrap_or(0) as f64;
        let online_cpus = sample.cpu_stats.online_cpus.unwrap_or(1) as f64;
        let cpu_percent = if system_delta > 0.0 && cpu_delta > 0.0 {
            (cpu_delta / system_delta) * online_cpus * 100.0
        } else {
            0.0
        };

        let memory_usage = sample.memory_stats.usage.unwrap_or(0);
        let memory_limit = sample.memory_stats.limit.unwrap_or(0);

        Ok(ContainerStats { cpu_percent, memory_usage, memory_limit })
    }

    pub async fn logs(&self, id: &str, tail_n: u32) -> Result<String> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail_n.to_string(),
            timestamps: false,
            ..Default::default()
        });
        let mut stream = self.client.logs(id, options);
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                    return Err(AppError::NotFound(id.to_string()));
                }
                Err(e) => {
                    // Logs are a non-essential read; degrade rather than fail the request.
                    debug!(container = id, error = %e, "log stream error, truncating");
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Always restricted to containers bearing the service label.
    pub async fn list(&self, service_prefix: &str, filter: ContainerFilter) -> Result<Vec<ContainerInfo>> {
        let mut label_filters = vec![format!("service={service_prefix}")];
        if let Some(env) = &filter.environment {
            label_filters.push(format!("environment={env}"));
        }
        if let Some(tp) = &filter.tool_pair {
            label_filters.push(format!("toolPair={tp}"));
        }

        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let summaries = self.client.list_containers(options).await?;
        let mut infos = Vec::new();
        for s in summaries {
            let id = s.id.clone().unwrap_or_default();
            let details = self.client.inspect_container(&id, None).await?;
            let info = to_container_info(details);

            if let Some(status) = filter.status {
                if info.status != status {
                    continue;
                }
            }
            if let Some(older_than) = filter.older_than_epoch_ms {
                if info.created_at_epoch_ms >= older_than {
                    continue;
                }
            }
            infos.push(info);
        }
        Ok(infos)
    }

    /// Start an interactive shell inside the container with an initial PTY
    /// size; returns the exec's duplex stream and its id (for resize).
    pub async fn attach_pty(&self, id: &str, uid_gid: &str, cols: u16, rows: u16) -> Result<AttachedPty> {
        let exec = self
            .client
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    user: Some(uid_gid.to_string()),
                    env: Some(vec![
                        "TERM=xterm-256color".to_string(),
                        "HOME=/home/sandbox".to_string(),
                        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
                        "LANG=C.UTF-8".to_string(),
                    ]),
                    cmd: Some(vec!["/bin/sh".to_string(), "-l".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| AppError::StreamAttachFailed(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, Some(StartExecOptions { detach: false, tty: true, output_capacity: None }))
            .await
            .map_err(|e| AppError::StreamAttachFailed(e.to_string()))?;

        let (output, input) = match start_result {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(AppError::StreamAttachFailed("exec started detached".into()));
            }
        };

        self.client
            .resize_exec(&exec.id, ResizeExecOptions { height: rows, width: cols })
            .await
            .map_err(|e| AppError::StreamAttachFailed(e.to_string()))?;

        Ok(AttachedPty {
            output: Box::new(tokio_util::io::StreamReader::new(output.map(|r| {
                r.map(|lo| bytes::Bytes::from(lo.into_bytes()))
                    .map_err(std::io::Error::other)
            }))),
            input: Box::new(input),
            exec_id: exec.id,
        })
    }

    pub async fn resize_pty(&self, exec_id: &str, cols: u16, rows: u16) -> Result<()> {
        self.client
            .resize_exec(exec_id, ResizeExecOptions { height: rows, width: cols })
            .await
            .map_err(|e| AppError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Races the container's exit event against a timeout; returns once the
    /// container stops being "running" or the timeout elapses.
    pub async fn wait_for_exit(&self, id: &str, timeout: Duration) -> Result<()> {
        let mut stream = self
            .client
            .wait_container(id, Some(WaitContainerOptions { condition: "not-running" }));
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Ok(()),
            Err(_) => Err(AppError::OperationFailed("timed out waiting for exit".into())),
        }
    }
}

fn to_container_info(details: bollard::models::ContainerInspectResponse) -> ContainerInfo {
    let state = details.state.as_ref();
    let status_str = state.and_then(|s| s.status).map(|s| s.to_string()).unwrap_or_default();
    let status = ContainerStatus::from(status_str.as_str());

    let labels = details
        .config
        .as_ref()
        .and_then(|c| c.labels.clone())
        .unwrap_or_default();

    let created_at_epoch_ms = details
        .created
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis() as u64)
        .unwrap_or(0);

    let started_at_epoch_ms = state
        .and_then(|s| s.started_at.as_deref())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis() as u64);

    ContainerInfo {
        id: details.id.unwrap_or_default(),
        name: details.name.unwrap_or_default().trim_start_matches('/').to_string(),
        image: details.config.as_ref().and_then(|c| c.image.clone()).unwrap_or_default(),
        status,
        created_at_epoch_ms,
        started_at_epoch_ms,
        session_id: labels.get("sessionId").cloned(),
        environment_name: labels.get("environment").cloned(),
        cpu_percent: 0.0,
        memory_usage: 0,
        memory_limit: 0,
        memory_percent: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_drop_list_has_no_duplicates() {
        let caps = dropped_capabilities();
        let mut sorted = caps.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(caps.len(), sorted.len());
    }

    #[test]
    fn container_status_maps_unknown_to_stopped() {
        assert_eq!(ContainerStatus::from("running"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::from("weird"), ContainerStatus::Stopped);
    }
}
