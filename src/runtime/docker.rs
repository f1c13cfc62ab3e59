use async_trait::async_trait;
use std::{
    collections::HashSet,
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Output, Stdio},
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::recipe::BuildContext;
use super::{
    ContainerRuntime, ContainerStatus, LaunchRequest, CONTROL_SERVICE_PORT, SECONDARY_SERVICE_PORT,
    SECRET_ENV_VAR, TERTIARY_SERVICE_PORT,
};
use crate::{validate, Config, Error, Result};

/// Upper bound for short-lived commands such as `inspect` or `ps`.
const DOCKER_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to keep reading a killed build's output.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The only capabilities an SSH-based sandbox needs back after
/// `--cap-drop=ALL`.
const SANDBOX_CAPABILITIES: &[&str] = &["CHOWN", "SETUID", "SETGID", "SYS_CHROOT", "AUDIT_WRITE"];

const TMPFS_OPTIONS: &str = "rw,noexec,nosuid,nodev,size=64m";

macro_rules! docker_command {
    ($($arg:expr),* $(,)?) => ({
        let mut cmd = Command::new("docker");
        $( cmd.arg($arg); )*
        cmd
    });
}

/// Container runtime backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    exercises_dir: PathBuf,
    build_timeout: Duration,
    stop_grace: Duration,
    memory_limit: String,
    cpus: String,
    pids_limit: u32,
    network: Option<String>,
}

impl DockerRuntime {
    pub fn new(config: &Config) -> Self {
        DockerRuntime {
            exercises_dir: config.exercises_dir.clone(),
            build_timeout: config.build_timeout,
            stop_grace: config.stop_grace,
            memory_limit: config.memory_limit.clone(),
            cpus: config.cpus.clone(),
            pids_limit: config.pids_limit,
            network: config.network.clone(),
        }
    }

    fn build_args(tag: &str, ctx: &BuildContext) -> Vec<OsString> {
        vec![
            "build".into(),
            // Re-provisioning must never pick up stale layers.
            "--no-cache".into(),
            "--tag".into(),
            tag.into(),
            "--file".into(),
            ctx.recipe.clone().into_os_string(),
            ctx.context_dir.clone().into_os_string(),
        ]
    }

    fn run_args(&self, req: &LaunchRequest<'_>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            req.name.into(),
            "--cap-drop=ALL".into(),
        ];

        for cap in SANDBOX_CAPABILITIES {
            args.push(format!("--cap-add={}", cap));
        }

        args.extend(vec![
            "--security-opt=no-new-privileges".into(),
            "--memory".into(),
            self.memory_limit.clone(),
            "--memory-swap".into(),
            self.memory_limit.clone(),
            "--cpus".into(),
            self.cpus.clone(),
            "--pids-limit".into(),
            self.pids_limit.to_string(),
            "--tmpfs".into(),
            format!("/tmp:{}", TMPFS_OPTIONS),
            "--tmpfs".into(),
            format!("/var/tmp:{}", TMPFS_OPTIONS),
        ]);

        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        // Value comes from the docker client's environment, keeping the flag
        // off the command line.
        args.push("--env".into());
        args.push(SECRET_ENV_VAR.into());

        let mappings = [
            (req.ports.control, CONTROL_SERVICE_PORT),
            (req.ports.secondary, SECONDARY_SERVICE_PORT),
            (req.ports.tertiary, TERTIARY_SERVICE_PORT),
        ];
        for (host, container) in mappings.iter() {
            args.push("--publish".into());
            args.push(format!("{}:{}", host, container));
        }

        args.push(req.image.into());
        args
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        validate::image_name(image)?;

        let output = run_command(docker_command!("image", "inspect", image)).await?;
        Ok(output.status.success())
    }

    async fn build_image(&self, exercise_id: &str, tag: &str) -> Result<String> {
        validate::exercise_id(exercise_id)?;
        validate::image_tag(tag)?;

        let ctx = BuildContext::resolve(&self.exercises_dir, exercise_id)?;
        let mut cmd = docker_command!();
        cmd.args(Self::build_args(tag, &ctx));
        log::info!("Building image {} for {}", tag, exercise_id);
        log::debug!("Build command is {:?}", cmd);

        run_build(cmd, tag, self.build_timeout).await?;

        log::info!("Image built: {}", tag);
        Ok(tag.to_string())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        validate::image_name(image)?;

        let output = run_command(docker_command!("rmi", "--force", image)).await?;
        if !output.status.success() {
            log::warn!("Unable to remove image {}: {}", image, combined_output(&output));
        }
        Ok(())
    }

    async fn run_container(&self, req: &LaunchRequest<'_>) -> Result<()> {
        validate::container_name(req.name)?;
        validate::image_name(req.image)?;
        for port in req.ports.as_array().iter() {
            validate::host_port(*port)?;
        }

        let mut cmd = docker_command!();
        cmd.args(self.run_args(req));
        // Logged before the secret lands in the command's environment.
        log::debug!("Launch command is {:?}", cmd);
        cmd.env(SECRET_ENV_VAR, req.secret.expose());

        let output = run_command(cmd).await?;
        if !output.status.success() {
            return Err(Error::LaunchFailed {
                name: req.name.to_string(),
                output: combined_output(&output),
            });
        }

        log::info!(
            "Container {} started from {} on ports {:?}",
            req.name,
            req.image,
            req.ports.as_array()
        );
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        validate::container_name(name)?;

        let grace = self.stop_grace.as_secs().to_string();
        let output = run_command_with_timeout(
            docker_command!("stop", "--time", grace, name),
            self.stop_grace + DOCKER_COMMAND_TIMEOUT,
        )
        .await?;

        if !output.status.success() {
            return Err(Error::StopFailed {
                name: name.to_string(),
                output: combined_output(&output),
            });
        }

        let output = run_command(docker_command!("rm", "--force", name)).await?;
        if !output.status.success() {
            return Err(Error::StopFailed {
                name: name.to_string(),
                output: combined_output(&output),
            });
        }

        log::info!("Container {} stopped and removed", name);
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        validate::container_name(name)?;

        let output = run_command(docker_command!(
            "rm", // Kills container if still running
            "--force", name
        ))
        .await?;

        if !output.status.success() {
            return Err(Error::StopFailed {
                name: name.to_string(),
                output: combined_output(&output),
            });
        }

        log::info!("Container {} killed", name);
        Ok(())
    }

    async fn status(&self, name: &str) -> ContainerStatus {
        if validate::container_name(name).is_err() {
            return ContainerStatus::Error;
        }

        let cmd = docker_command!("inspect", "--format", "{{.State.Status}}", name);
        match run_command(cmd).await {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                ContainerStatus::parse(stdout.lines().next().unwrap_or(""))
            }
            Ok(_) => ContainerStatus::Unknown,
            Err(e) => {
                log::warn!("Unable to inspect container {}: {}", name, e);
                ContainerStatus::Error
            }
        }
    }

    async fn mapped_ports(&self) -> Result<HashSet<u16>> {
        let output = run_command(docker_command!("ps", "--format", "{{.Ports}}")).await?;
        if !output.status.success() {
            return Err(Error::RuntimeQueryFailed {
                output: combined_output(&output),
            });
        }

        Ok(parse_published_ports(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn list_containers(&self, prefix: &str) -> Result<Vec<String>> {
        validate::container_name(prefix)?;

        let filter = format!("name={}", prefix);
        let output =
            run_command(docker_command!("ps", "--filter", filter, "--format", "{{.Names}}")).await?;
        if !output.status.success() {
            return Err(Error::RuntimeQueryFailed {
                output: combined_output(&output),
            });
        }

        // The name filter matches substrings.
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(prefix))
            .map(String::from)
            .collect())
    }
}

/// Run a build to completion. A non-zero exit and a timeout both fail with
/// the output captured so far.
async fn run_build(command: Command, tag: &str, timeout: Duration) -> Result<()> {
    let (status, mut log) = run_with_captured_output(command, timeout).await?;

    match status {
        Some(status) if status.success() => Ok(()),
        Some(status) => {
            log.push_str(&format!("\nbuild exited with {}", status));
            Err(Error::BuildFailed {
                tag: tag.to_string(),
                log,
            })
        }
        None => {
            log.push_str(&format!("\nbuild killed after {} s", timeout.as_secs()));
            Err(Error::BuildFailed {
                tag: tag.to_string(),
                log,
            })
        }
    }
}

/// Like `Command::output`, but the child is killed once `timeout` passes and
/// whatever it printed until then is still returned. The exit status is
/// `None` after a kill.
async fn run_with_captured_output(
    mut command: Command,
    timeout: Duration,
) -> Result<(Option<ExitStatus>, String)> {
    command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .map_err(|e| Error::UnableToStartRuntime { source: e })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(read_to_end(out)));
    let stderr = child.stderr.take().map(|err| tokio::spawn(read_to_end(err)));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => return Err(Error::UnableToStartRuntime { source: e }),
        Err(_) => {
            if let Err(e) = child.kill().await {
                log::warn!("Unable to kill timed out command: {}", e);
            }
            None
        }
    };

    let mut log = String::new();
    for reader in stdout.into_iter().chain(stderr) {
        // Grandchildren may keep the pipe open after a kill.
        if let Ok(Ok(bytes)) = tokio::time::timeout(PIPE_DRAIN_TIMEOUT, reader).await {
            log.push_str(&String::from_utf8_lossy(&bytes));
        }
    }

    Ok((status, log))
}

async fn read_to_end<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    // A read error only truncates the log.
    let _ = reader.read_to_end(&mut buf).await;
    buf
}

async fn run_command(cmd: Command) -> Result<Output> {
    run_command_with_timeout(cmd, DOCKER_COMMAND_TIMEOUT).await
}

async fn run_command_with_timeout(mut command: Command, timeout: Duration) -> Result<Output> {
    // Dropping the future on timeout must take the child with it.
    command.kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(Error::UnableToStartRuntime { source: e }),
        Err(_) => Err(Error::RuntimeTimedOut { timeout }),
    }
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Host ports out of `docker ps --format {{.Ports}}` output, e.g.
/// `0.0.0.0:30001->22/tcp, :::30001->22/tcp, 0.0.0.0:40000-40002->80-82/tcp`.
fn parse_published_ports(ps_output: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();

    for mapping in ps_output.lines().flat_map(|line| line.split(',')) {
        let host = match mapping.trim().split("->").next() {
            Some(host) if mapping.contains("->") => host,
            _ => continue,
        };
        let host_ports = match host.rsplit(':').next() {
            Some(p) => p,
            None => continue,
        };

        let mut bounds = host_ports.splitn(2, '-').map(|p| p.parse::<u16>());
        match (bounds.next(), bounds.next()) {
            (Some(Ok(start)), None) => {
                ports.insert(start);
            }
            (Some(Ok(start)), Some(Ok(end))) if start <= end => {
                ports.extend(start..=end);
            }
            _ => {}
        }
    }

    ports
}
