//! Execution strategies for the external auditor: a local command, or the
//! same auditor inside a container pinned to one platform.

use std::process::Stdio;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{AuditorSettings, ContainerSettings};

use super::AuditOptions;

/// Host that reaches the machine's loopback from inside a container.
pub(crate) const CONTAINER_HOST_ALIAS: &str = "host.docker.internal";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StrategyKind {
    Local,
    Container,
}

impl StrategyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StrategyKind::Local => "local",
            StrategyKind::Container => "container",
        }
    }
}

/// A fully resolved invocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Invocation {
    pub kind: StrategyKind,
    pub argv: Vec<String>,
    pub url: String,
    /// Timeout handed to the auditor (after emulation scaling).
    pub timeout: Duration,
    pub wait: Duration,
}

impl Invocation {
    /// Wall-clock bound for the whole subprocess.
    pub fn hard_bound(&self, grace: Duration) -> Duration {
        self.timeout.saturating_add(self.wait).saturating_add(grace)
    }
}

/// Replace the URL host when it appears in `from`.
pub(crate) fn translate_host(raw: &str, from: &[String], to: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let matches = url
        .host_str()
        .is_some_and(|h| from.iter().any(|f| f.eq_ignore_ascii_case(h)));
    if matches && url.set_host(Some(to)).is_ok() {
        return url.to_string();
    }
    raw.to_string()
}

fn auditor_args(url: &str, timeout: Duration, wait: Duration) -> Vec<String> {
    vec![
        url.to_string(),
        "--timeout".into(),
        timeout.as_millis().to_string(),
        "--wait".into(),
        wait.as_millis().to_string(),
        "--json".into(),
    ]
}

pub(crate) fn local_invocation(
    settings: &AuditorSettings,
    url: &str,
    opts: &AuditOptions,
) -> Option<Invocation> {
    if settings.command.is_empty() {
        return None;
    }
    let url = translate_host(url, &settings.internal_hosts, &settings.local_alias);
    let mut argv = settings.command.clone();
    argv.extend(auditor_args(&url, opts.timeout, opts.wait));
    Some(Invocation {
        kind: StrategyKind::Local,
        argv,
        url,
        timeout: opts.timeout,
        wait: opts.wait,
    })
}

pub(crate) fn container_invocation(
    settings: &AuditorSettings,
    container: &ContainerSettings,
    url: &str,
    opts: &AuditOptions,
) -> Invocation {
    let url = match &container.network {
        Some(_) => url.to_string(),
        None => translate_host(
            url,
            &["localhost".to_string(), "127.0.0.1".to_string()],
            CONTAINER_HOST_ALIAS,
        ),
    };
    let timeout = if is_emulated(&container.platform) {
        scale_for_emulation(
            opts.timeout,
            settings.emulation_multiplier,
            settings.emulation_floor,
        )
    } else {
        opts.timeout
    };
    let mut argv = vec![
        container.runtime.clone(),
        "run".into(),
        "--rm".into(),
        "--platform".into(),
        container.platform.clone(),
    ];
    if let Some(network) = &container.network {
        argv.push("--network".into());
        argv.push(network.clone());
    }
    argv.push(container.image.clone());
    argv.extend(auditor_args(&url, timeout, opts.wait));
    Invocation {
        kind: StrategyKind::Container,
        argv,
        url,
        timeout,
        wait: opts.wait,
    }
}

/// Upper bound for an emulation-scaled timeout.
pub(crate) const MAX_EMULATED_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// max(timeout × multiplier, floor), with the product capped at [`MAX_EMULATED_TIMEOUT`].
pub(crate) fn scale_for_emulation(timeout: Duration, multiplier: f64, floor: Duration) -> Duration {
    let factor = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
    let scaled = Duration::try_from_secs_f64(timeout.as_secs_f64() * factor)
        .unwrap_or(MAX_EMULATED_TIMEOUT)
        .min(MAX_EMULATED_TIMEOUT.max(timeout));
    scaled.max(floor)
}

fn platform_arch(platform: &str) -> Option<&'static str> {
    let arch = platform.rsplit('/').next()?.to_ascii_lowercase();
    match arch.as_str() {
        "amd64" | "x86_64" => Some("x86_64"),
        "arm64" | "aarch64" => Some("aarch64"),
        "arm" | "armv7" => Some("arm"),
        _ => None,
    }
}

/// True when the pinned platform runs under emulation on this host.
pub(crate) fn is_emulated(platform: &str) -> bool {
    let pinned = platform
        .split('/')
        .nth(1)
        .and_then(platform_arch)
        .or_else(|| platform_arch(platform));
    pinned.is_some_and(|arch| arch != std::env::consts::ARCH)
}

/// Runtime stderr reporting that the image cannot run on the pinned platform.
pub(crate) fn is_platform_mismatch(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("exec format error")
        || lower.contains("does not match the specified platform")
        || lower.contains("no matching manifest")
}

#[derive(Debug)]
pub(crate) enum RunError {
    Spawn(std::io::Error),
    TimedOut(Duration),
    Cancelled,
    Wait(std::io::Error),
}

/// Run an invocation to completion, bounded by `bound` and `cancel`.
///
/// The child is killed (never awaited) when the bound expires or the token fires.
pub(crate) async fn run(
    invocation: &Invocation,
    bound: Duration,
    cancel: &CancellationToken,
) -> Result<std::process::Output, RunError> {
    let (program, args) = invocation
        .argv
        .split_first()
        .ok_or_else(|| RunError::Spawn(std::io::Error::other("empty command")))?;
    let child = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RunError::Spawn)?;

    tokio::select! {
        _ = cancel.cancelled() => Err(RunError::Cancelled),
        res = tokio::time::timeout(bound, child.wait_with_output()) => match res {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(RunError::Wait(err)),
            Err(_) => Err(RunError::TimedOut(bound)),
        },
    }
}
