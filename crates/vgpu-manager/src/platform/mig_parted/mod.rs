//! `nvidia-mig-parted` integration.

use std::path::PathBuf;

use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;

mod spec;

pub use spec::DeviceSelector;
pub use spec::MigConfigEntry;
pub use spec::MigPartedSpec;
pub use spec::CURRENT_CONFIG;

#[derive(Debug, derive_more::Display)]
pub enum MigPartedError {
    #[display("failed to run {command}")]
    Command { command: String },
    #[display("{command} exited with {status}")]
    Failed { command: String, status: String },
    #[display("failed to handle partition spec")]
    Spec,
}

impl core::error::Error for MigPartedError {}

/// Reads and applies MIG partition specs.
#[async_trait]
pub trait MigPartitioner: Send + Sync {
    /// Partition currently applied on the node.
    async fn export(&self) -> Result<MigPartedSpec, Report<MigPartedError>>;

    /// Applies the `current` configuration of `spec`.
    async fn apply(&self, spec: &MigPartedSpec) -> Result<(), Report<MigPartedError>>;
}

/// Runs the `nvidia-mig-parted` binary.
pub struct MigPartedCommand {
    binary: PathBuf,
    config_path: PathBuf,
}

impl MigPartedCommand {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            binary: PathBuf::from("nvidia-mig-parted"),
            config_path,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, Report<MigPartedError>> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .change_context(MigPartedError::Command {
                command: command.clone(),
            })?;
        if !output.status.success() {
            return Err(Report::new(MigPartedError::Failed {
                command,
                status: output.status.to_string(),
            })
            .attach_printable(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl MigPartitioner for MigPartedCommand {
    async fn export(&self) -> Result<MigPartedSpec, Report<MigPartedError>> {
        let stdout = self.run(&["export"]).await?;
        serde_yaml::from_slice(&stdout).change_context(MigPartedError::Spec)
    }

    async fn apply(&self, spec: &MigPartedSpec) -> Result<(), Report<MigPartedError>> {
        let text = serde_yaml::to_string(spec).change_context(MigPartedError::Spec)?;
        tokio::fs::write(&self.config_path, text)
            .await
            .change_context(MigPartedError::Spec)
            .attach_printable_lazy(|| format!("writing {}", self.config_path.display()))?;

        let path = self.config_path.to_string_lossy().into_owned();
        self.run(&["apply", "-f", &path, "-c", CURRENT_CONFIG]).await?;
        tracing::info!(path = %path, "Applied MIG partition spec");
        Ok(())
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Records applied specs instead of touching hardware.
    pub struct FakePartitioner {
        current: MigPartedSpec,
        pub applied: Mutex<Vec<MigPartedSpec>>,
        pub fail_apply: bool,
    }

    impl FakePartitioner {
        pub fn new(current: MigPartedSpec) -> Self {
            Self {
                current,
                applied: Mutex::new(Vec::new()),
                fail_apply: false,
            }
        }

        pub fn failing(current: MigPartedSpec) -> Self {
            Self {
                fail_apply: true,
                ..Self::new(current)
            }
        }
    }

    #[async_trait]
    impl MigPartitioner for FakePartitioner {
        async fn export(&self) -> Result<MigPartedSpec, Report<MigPartedError>> {
            Ok(self.current.clone())
        }

        async fn apply(&self, spec: &MigPartedSpec) -> Result<(), Report<MigPartedError>> {
            if self.fail_apply {
                return Err(Report::new(MigPartedError::Failed {
                    command: "nvidia-mig-parted apply".to_string(),
                    status: "exit status: 1".to_string(),
                }));
            }
            self.applied.lock().unwrap().push(spec.clone());
            Ok(())
        }
    }
}
