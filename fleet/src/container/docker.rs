//! [Runtime] backed by the local `docker` CLI.

use super::{Error, Id, NetworkSpec, Runtime, Spec};
use serde::Deserialize;
use std::{collections::BTreeMap, net::Ipv4Addr, process::Stdio, time::Duration};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Exit code `docker run` uses when the container could not be created.
const RUN_FAILED: i32 = 125;

/// Drives containers through the `docker` binary on `PATH`.
#[derive(Clone, Debug)]
pub struct Docker {
    binary: String,
}

impl Default for Docker {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Per-network settings reported by `docker inspect`.
#[derive(Deserialize)]
struct Endpoint {
    #[serde(rename = "IPAddress")]
    ip_address: String,
}

impl Docker {
    /// Use the given binary (e.g. `podman`) instead of `docker`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Execute a command, returning its stdout on success.
    async fn exec(&self, args: Vec<String>, stdin: Option<&[u8]>) -> Result<String, Error> {
        debug!(binary = self.binary.as_str(), args = ?args, "executing");
        let mut command = Command::new(&self.binary);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            drop(pipe);
        }
        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(classify(&args, output.status.code(), stderr))
    }
}

/// Subcommands that address an existing object (`rm`, `network rm`, `image inspect`, ...).
const LOOKUPS: &[&str] = &["rm", "inspect", "stop"];

/// Map a failed invocation to the most specific error.
///
/// Only lookups report [Error::NotFound]: the output of `run` may mention missing files.
fn classify(args: &[String], status: Option<i32>, stderr: String) -> Error {
    let lowered = stderr.to_lowercase();
    let lookup = args
        .iter()
        .take(2)
        .any(|arg| LOOKUPS.contains(&arg.as_str()));
    if lookup && (lowered.contains("no such") || lowered.contains("not found")) {
        return Error::NotFound(stderr);
    }
    if lowered.contains("already exists")
        || lowered.contains("conflict")
        || lowered.contains("pool overlaps")
    {
        return Error::Conflict(stderr);
    }
    Error::Failed {
        command: args.join(" "),
        status,
        stderr,
    }
}

/// Render the flags shared by `docker create` and `docker run`.
fn flags(spec: &Spec) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(hostname) = &spec.hostname {
        args.push(format!("--hostname={hostname}"));
    }
    for (key, value) in &spec.env {
        args.push(format!("--env={key}={value}"));
    }
    for bind in &spec.binds {
        args.push(format!("--volume={bind}"));
    }
    for port in &spec.ports {
        args.push(format!("--publish=0.0.0.0:{}:{}", port.host, port.container));
    }
    if let Some(network) = &spec.network {
        args.push(format!("--network={network}"));
    }
    if let Some(ip) = &spec.ip {
        args.push(format!("--ip={ip}"));
    }
    for (key, value) in &spec.labels {
        args.push(format!("--label={key}={value}"));
    }
    args.push(spec.image.clone());
    args.extend(spec.cmd.iter().cloned());
    args
}

impl Runtime for Docker {
    async fn image_exists(&self, image: &str) -> Result<bool, Error> {
        let args = vec!["image".into(), "inspect".into(), image.into()];
        match self.exec(args, None).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), Error> {
        self.exec(vec!["pull".into(), image.into()], None).await?;
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<Id, Error> {
        let args = vec![
            "network".into(),
            "create".into(),
            "--driver=bridge".into(),
            format!("--subnet={}", spec.cidr),
            format!("--gateway={}", spec.gateway),
            spec.name.clone(),
        ];
        self.exec(args, None).await
    }

    async fn remove_network(&self, name: &str) -> Result<(), Error> {
        let args = vec!["network".into(), "rm".into(), name.into()];
        self.exec(args, None).await?;
        Ok(())
    }

    async fn run(&self, spec: &Spec, stdin: &[u8]) -> Result<i64, Error> {
        let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "--interactive".into()];
        args.extend(flags(spec));
        match self.exec(args, Some(stdin)).await {
            Ok(_) => Ok(0),
            Err(Error::Failed {
                status: Some(code), ..
            }) if code != RUN_FAILED => Ok(code as i64),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, spec: &Spec) -> Result<Id, Error> {
        let mut args: Vec<String> = vec!["create".into()];
        args.extend(flags(spec));
        self.exec(args, None).await
    }

    async fn start(&self, id: &str) -> Result<(), Error> {
        self.exec(vec!["start".into(), id.into()], None).await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), Error> {
        let args = vec![
            "stop".into(),
            format!("--time={}", grace.as_secs()),
            id.into(),
        ];
        self.exec(args, None).await?;
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), Error> {
        let mut args: Vec<String> = vec!["rm".into()];
        if force {
            args.push("--force".into());
        }
        args.push(id.into());
        self.exec(args, None).await?;
        Ok(())
    }

    async fn inspect_ip(&self, id: &str, network: &str) -> Result<Option<Ipv4Addr>, Error> {
        let args = vec![
            "inspect".into(),
            "--format={{json .NetworkSettings.Networks}}".into(),
            id.into(),
        ];
        let raw = self.exec(args, None).await?;
        let networks: BTreeMap<String, Endpoint> =
            serde_json::from_str(&raw).map_err(|err| Error::Decode(err.to_string()))?;
        let Some(endpoint) = networks.get(network) else {
            return Ok(None);
        };
        if endpoint.ip_address.is_empty() {
            return Ok(None);
        }
        endpoint
            .ip_address
            .parse()
            .map(Some)
            .map_err(|_| Error::Decode(endpoint.ip_address.clone()))
    }
}
