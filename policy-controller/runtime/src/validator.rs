use std::{
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};
use tokio::{io::AsyncWriteExt, process::Command, time};

/// The proxy image used when validating through docker.
pub const DEFAULT_VALIDATOR_IMAGE: &str = "docker.io/envoyproxy/envoy:v1.34.1";

pub const DEFAULT_VALIDATOR_PATH: &str = "/usr/local/bin/envoy";

const VALIDATE_ARGS: [&str; 8] = [
    "--mode",
    "validate",
    "--config-path",
    "/dev/fd/0",
    "-l",
    "critical",
    "--log-format",
    "%v",
];

const CONFIG_ERROR_MARKER: &str = "error initializing configuration";

/// Checks a rendered proxy configuration before it is published.
#[async_trait::async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, config: &str) -> Result<(), ValidationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The proxy rejected the configuration.
    #[error("invalid proxy configuration: {0}")]
    InvalidConfig(String),

    /// The validator could not be run.
    #[error("failed to run the proxy validator: {0}")]
    Invocation(#[from] io::Error),

    #[error("proxy validation timed out after {0:?}")]
    Timeout(time::Duration),
}

/// Runs a local proxy binary in validation mode.
#[derive(Clone, Debug)]
pub struct BinaryValidator {
    path: PathBuf,
    timeout: time::Duration,
}

/// Runs the proxy image in validation mode through docker.
#[derive(Clone, Debug)]
pub struct DockerValidator {
    image: String,
    timeout: time::Duration,
}

// === impl ValidationError ===

impl ValidationError {
    /// A short label for metrics.
    pub fn class(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid",
            Self::Invocation(_) => "invocation",
            Self::Timeout(_) => "timeout",
        }
    }
}

// === impl BinaryValidator ===

impl BinaryValidator {
    pub fn new(path: impl Into<PathBuf>, timeout: time::Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Validator for BinaryValidator {
    async fn validate(&self, config: &str) -> Result<(), ValidationError> {
        let mut cmd = Command::new(&self.path);
        cmd.args(VALIDATE_ARGS);
        run(cmd, config, self.timeout).await
    }
}

// === impl DockerValidator ===

impl DockerValidator {
    pub fn new(image: impl ToString, timeout: time::Duration) -> Self {
        Self {
            image: image.to_string(),
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Validator for DockerValidator {
    async fn validate(&self, config: &str) -> Result<(), ValidationError> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "-i", "--platform", "linux/amd64"])
            .arg(&self.image)
            .args(VALIDATE_ARGS);
        run(cmd, config, self.timeout).await
    }
}

async fn run(
    mut cmd: Command,
    config: &str,
    timeout: time::Duration,
) -> Result<(), ValidationError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    tracing::trace!(?cmd, "Validating proxy configuration");

    let validate = async {
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // The proxy may exit before reading the whole document.
            if let Err(error) = stdin.write_all(config.as_bytes()).await {
                if error.kind() != io::ErrorKind::BrokenPipe {
                    return Err(error);
                }
            }
        }
        child.wait_with_output().await
    };
    let output = time::timeout(timeout, validate)
        .await
        .map_err(|_| ValidationError::Timeout(timeout))??;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(ValidationError::InvalidConfig(extract_error(
        &stderr,
        output.status,
    )))
}

/// Reduces the validator's stderr to the message that explains the failure.
fn extract_error(stderr: &str, status: ExitStatus) -> String {
    let mut from_marker = stderr
        .lines()
        .skip_while(|line| !line.contains(CONFIG_ERROR_MARKER))
        .peekable();
    if from_marker.peek().is_some() {
        return from_marker
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
    }

    let trimmed = stderr.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    status.to_string()
}
