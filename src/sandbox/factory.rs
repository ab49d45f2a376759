//! Environment construction for task instances.
//!
//! [`EnvironmentFactory::create`] resolves the instance's image, launches a
//! sandbox through a [`SandboxLauncher`] and runs the optional startup
//! command. Launch failures are environment-creation errors; a failing
//! startup command is a configuration error and is reported as such.

use async_trait::async_trait;
use tera::{Context, Tera};
use tracing::{debug, error, info};

use super::{ApptainerSandbox, DockerSandbox, Environment};
use crate::config::{EnvironmentKind, HarnessConfig, SandboxConfig};
use crate::error::{EnvironmentCreationError, EnvironmentError, SandboxError};
use crate::image::image_for_instance;
use crate::task::TaskInstance;

/// Starts a sandbox for an image.
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    async fn launch(
        &self,
        config: &SandboxConfig,
        image: &str,
    ) -> Result<Box<dyn Environment>, SandboxError>;
}

/// Launches the runtime named by [`SandboxConfig::kind`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerLauncher;

#[async_trait]
impl SandboxLauncher for ContainerLauncher {
    async fn launch(
        &self,
        config: &SandboxConfig,
        image: &str,
    ) -> Result<Box<dyn Environment>, SandboxError> {
        match config.kind {
            EnvironmentKind::Apptainer => {
                let sandbox = ApptainerSandbox::build(config.clone(), image).await?;
                Ok(Box::new(sandbox))
            }
            EnvironmentKind::Docker => {
                let sandbox = DockerSandbox::start(config.clone(), image).await?;
                Ok(Box::new(sandbox))
            }
        }
    }
}

/// Builds ready-to-use environments for task instances.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentFactory<L = ContainerLauncher> {
    launcher: L,
}

impl EnvironmentFactory<ContainerLauncher> {
    /// Factory using the real container runtimes.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<L: SandboxLauncher> EnvironmentFactory<L> {
    /// Factory using a custom launcher.
    pub fn with_launcher(launcher: L) -> Self {
        Self { launcher }
    }

    /// The launcher in use.
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Creates the environment for `instance` and runs the startup command.
    pub async fn create(
        &self,
        config: &HarnessConfig,
        instance: &TaskInstance,
        data_source: &str,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        let image = image_for_instance(instance, data_source)
            .map_err(EnvironmentCreationError::from)?;
        info!(instance_id = %instance.instance_id, image = %image, kind = %config.environment.kind, "Creating environment");

        let mut env = self
            .launcher
            .launch(&config.environment, &image)
            .await
            .map_err(EnvironmentCreationError::from)?;

        let Some(template) = config.run.env_startup_command.as_deref() else {
            return Ok(env);
        };

        let command = match render_startup_command(template, instance) {
            Ok(command) => command,
            Err(e) => {
                env.cleanup().await;
                return Err(e);
            }
        };

        debug!(instance_id = %instance.instance_id, command = %command, "Running startup command");
        let outcome = match env.execute(&command, None, None).await {
            Ok(outcome) => outcome,
            Err(e) => {
                env.cleanup().await;
                return Err(EnvironmentCreationError::from(e).into());
            }
        };

        if outcome.return_code != 0 {
            error!(
                instance_id = %instance.instance_id,
                return_code = outcome.return_code,
                "Startup command failed"
            );
            env.cleanup().await;
            return Err(EnvironmentError::StartupCommand {
                return_code: outcome.return_code,
                output: outcome.output,
            });
        }

        Ok(env)
    }
}

/// Renders a startup template against the instance's fields.
///
/// Rendering is strict: a reference to a field the instance lacks fails.
pub fn render_startup_command(
    template: &str,
    instance: &TaskInstance,
) -> Result<String, EnvironmentError> {
    let context = Context::from_serialize(instance).map_err(EnvironmentError::StartupTemplate)?;
    Tera::one_off(template, &context, false).map_err(EnvironmentError::StartupTemplate)
}
