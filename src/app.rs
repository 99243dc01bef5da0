use crate::errors::ExecError;
use crate::managers::dispatcher::Dispatcher;
use crate::managers::ssh::SshBackend;
use crate::services::credentials::CredentialResolver;
use crate::services::hosts::HostRegistry;
use crate::services::logger::{LogLevel, Logger};
use crate::utils::feature_flags::is_verbose_enabled;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub verbose: bool,
    pub working_dir: Option<PathBuf>,
    pub ssh_key: Option<PathBuf>,
}

pub struct App {
    pub logger: Logger,
    pub working_dir: PathBuf,
    pub registry: HostRegistry,
    pub credentials: CredentialResolver,
    pub dispatcher: Dispatcher,
}

impl App {
    pub fn initialize(options: AppOptions) -> Result<Self, ExecError> {
        let mut logger = Logger::new("agentrun");
        if options.verbose || is_verbose_enabled() {
            logger.set_level(LogLevel::Debug);
        }

        let working_dir = match options.working_dir {
            Some(dir) => dir,
            None => std::env::current_dir().map_err(|err| {
                ExecError::internal(format!("Cannot determine working directory: {}", err))
            })?,
        };
        if !working_dir.is_dir() {
            return Err(ExecError::invalid_params(format!(
                "Working directory {} does not exist",
                working_dir.display()
            )));
        }

        let registry = HostRegistry::new(logger.clone());
        let loaded = registry.load();
        logger.debug(
            "host registry",
            Some(&serde_json::json!({
                "path": registry.file_path(),
                "loaded": loaded,
                "hosts": registry.list(),
            })),
        );
        let credentials = CredentialResolver::new(logger.clone(), working_dir.clone());
        let ssh = SshBackend::new(logger.clone(), registry.clone(), credentials.clone())
            .with_key(options.ssh_key);
        let dispatcher = Dispatcher::new(
            logger.clone(),
            registry.clone(),
            credentials.clone(),
            working_dir.clone(),
        )
        .with_ssh(ssh);

        Ok(Self {
            logger,
            working_dir,
            registry,
            credentials,
            dispatcher,
        })
    }

    pub fn shutdown(&self) {
        let closed = self.dispatcher.shutdown();
        if closed > 0 {
            self.logger
                .debug("ssh connections closed", Some(&serde_json::json!({"count": closed})));
        }
    }
}
