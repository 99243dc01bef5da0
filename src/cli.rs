//! Command-line surface: free-form execution plus host and transfer subcommands.

use crate::app::{App, AppOptions};
use crate::errors::ExecError;
use crate::services::hosts::{SshHostProfile, TransferShare};
use crate::services::validation::Validation;
use crate::utils::shell::is_valid_env_name;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Run a command or AI-agent prompt locally, in Docker, over SSH or in a
/// cloud sandbox, chosen from the wording of the request.
#[derive(Debug, Parser)]
#[command(name = "agentrun", version, args_conflicts_with_subcommands = true)]
pub struct Args {
    /// Log progress and the credential source used.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Directory used for dotenv lookup, file references and mounts.
    #[arg(long = "workdir", value_name = "DIR", global = true)]
    pub workdir: Option<PathBuf>,

    /// SSH private key, tried before host profile and default keys.
    #[arg(long = "ssh-key", value_name = "PATH", global = true)]
    pub ssh_key: Option<PathBuf>,

    /// Print the parsed intent as JSON without executing it.
    #[arg(long = "parse-only")]
    pub parse_only: bool,

    /// Print the full execution result as JSON.
    #[arg(long = "json")]
    pub json: bool,

    /// Free-form request, e.g. `--auto-close on dgx nvidia-smi`.
    #[arg(value_name = "TEXT", trailing_var_arg = true, allow_hyphen_values = true)]
    pub text: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage registered SSH hosts.
    Hosts {
        #[command(subcommand)]
        action: HostsCommand,
    },
    /// Copy a local file to a registered host.
    Upload {
        host: String,
        path: PathBuf,
        #[arg(long = "remote-dir")]
        remote_dir: Option<String>,
    },
    /// Copy a remote file from a registered host.
    Download {
        host: String,
        remote: String,
        local: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum HostsCommand {
    List,
    Show { name: String },
    Add(AddHostArgs),
    Remove { name: String },
}

#[derive(Debug, clap::Args)]
pub struct AddHostArgs {
    pub name: String,
    #[arg(long)]
    pub hostname: String,
    #[arg(long, default_value_t = 22)]
    pub port: u16,
    #[arg(long, default_value = "root")]
    pub user: String,
    #[arg(long = "key-path")]
    pub key_path: Option<String>,
    #[arg(long)]
    pub gpu: bool,
    #[arg(long = "cuda-path")]
    pub cuda_path: Option<String>,
    #[arg(long = "share-local", requires = "share_remote")]
    pub share_local: Option<PathBuf>,
    #[arg(long = "share-remote", requires = "share_local")]
    pub share_remote: Option<String>,
    /// Environment exported before every command, as KEY=VALUE.
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    pub env: Vec<(String, String)>,
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if !is_valid_env_name(key) {
        return Err(format!("'{}' is not a valid environment variable name", key));
    }
    Ok((key.to_string(), value.to_string()))
}

impl AddHostArgs {
    pub fn into_profile(self) -> Result<SshHostProfile, ExecError> {
        let validation = Validation::new();
        let name = validation.ensure_host_name(&self.name)?;
        let hostname = validation.ensure_string(&self.hostname, "hostname")?;
        let mut profile = SshHostProfile::new(&name, &hostname);
        profile.port = validation.ensure_port(self.port)?;
        profile.user = validation.ensure_string(&self.user, "user")?;
        profile.key_path = self.key_path;
        profile.gpu_enabled = self.gpu;
        profile.cuda_path = self.cuda_path;
        profile.share = match (self.share_local, self.share_remote) {
            (Some(local_mount), Some(remote_path)) => Some(TransferShare {
                local_mount,
                remote_path,
            }),
            _ => None,
        };
        profile.environment = self.env.into_iter().collect();
        Ok(profile)
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ExecError> {
    serde_json::to_string_pretty(value)
        .map_err(|err| ExecError::internal(format!("Failed to render JSON: {}", err)))
}

fn run_hosts(app: &App, action: HostsCommand) -> Result<i32, ExecError> {
    match action {
        HostsCommand::List => {
            let profiles = app.registry.profiles();
            if profiles.is_empty() {
                println!("No hosts registered ({})", app.registry.file_path().display());
            }
            for profile in profiles {
                let gpu = if profile.gpu_enabled { " [gpu]" } else { "" };
                println!("{}\t{}{}", profile.name, profile.connection_key(), gpu);
            }
            Ok(0)
        }
        HostsCommand::Show { name } => match app.registry.get(&name) {
            Some(profile) => {
                let rendered = serde_yaml::to_string(&profile)
                    .map_err(|err| ExecError::internal(format!("Failed to render host: {}", err)))?;
                println!("{}:", profile.name);
                for line in rendered.lines() {
                    println!("  {}", line);
                }
                Ok(0)
            }
            None => Err(ExecError::unknown_host(format!("SSH host '{}' is not registered", name))),
        },
        HostsCommand::Add(add) => {
            let profile = add.into_profile()?;
            let name = profile.name.clone();
            app.registry.add(profile)?;
            println!("Saved host '{}' to {}", name, app.registry.file_path().display());
            Ok(0)
        }
        HostsCommand::Remove { name } => {
            if app.registry.remove(&name)? {
                println!("Removed host '{}'", name.trim().to_lowercase());
                Ok(0)
            } else {
                Err(ExecError::unknown_host(format!("SSH host '{}' is not registered", name)))
            }
        }
    }
}

async fn run_text(app: &App, text: &str, parse_only: bool, json: bool) -> Result<i32, ExecError> {
    if text.trim().is_empty() {
        return Err(ExecError::invalid_params("Nothing to run")
            .with_hint("Try: agentrun --auto-close echo hello"));
    }
    if parse_only {
        println!("{}", to_json(&app.dispatcher.parse(text))?);
        return Ok(0);
    }
    let result = app.dispatcher.run(text).await;
    if json {
        println!("{}", to_json(&result)?);
    } else {
        if !result.output.is_empty() {
            println!("{}", result.output);
        }
        if let Some(error) = result.error.as_deref() {
            eprintln!("{}", error);
        }
        if let Some(code) = result.metadata.get("exit_code").and_then(|v| v.as_i64()) {
            if code != 0 {
                eprintln!("[agentrun] exit status {}", code);
            }
        }
        if let Some(id) = result.metadata.get("sandbox_id").and_then(|v| v.as_str()) {
            if result.metadata.get("kept_alive").and_then(|v| v.as_bool()) == Some(true) {
                eprintln!("[agentrun] sandbox {} left running", id);
            }
        }
    }
    Ok(if result.metadata.contains_key("error_code") { 1 } else { 0 })
}

/// Returns the process exit status.
pub async fn run(args: Args) -> Result<i32, ExecError> {
    let app = App::initialize(AppOptions {
        verbose: args.verbose,
        working_dir: args.workdir,
        ssh_key: args.ssh_key,
    })?;
    let status = match args.command {
        Some(Command::Hosts { action }) => run_hosts(&app, action),
        Some(Command::Upload {
            host,
            path,
            remote_dir,
        }) => {
            let outcome = app
                .dispatcher
                .ssh()
                .upload(&host, &path, remote_dir.as_deref())
                .await?;
            println!("{}", to_json(&outcome)?);
            Ok(0)
        }
        Some(Command::Download {
            host,
            remote,
            local,
        }) => {
            let outcome = app.dispatcher.ssh().download(&host, &remote, &local).await?;
            println!("{}", to_json(&outcome)?);
            Ok(0)
        }
        None => run_text(&app, &args.text.join(" "), args.parse_only, args.json).await,
    };
    app.shutdown();
    status
}

#[cfg(test)]
mod tests {
    use super::{Args, Command, HostsCommand};
    use clap::Parser;

    #[test]
    fn free_text_keeps_hyphenated_tokens() {
        let args = Args::parse_from(["agentrun", "--parse-only", "--auto-close", "on", "dgx", "ls", "-la"]);
        assert!(args.parse_only);
        assert_eq!(args.text.join(" "), "--auto-close on dgx ls -la");
        assert!(args.command.is_none());
    }

    #[test]
    fn hosts_add_collects_env_pairs() {
        let args = Args::parse_from([
            "agentrun", "hosts", "add", "DGX", "--hostname", "10.0.0.5", "--gpu", "--env",
            "HF_HOME=/data/hf", "--share-local", "/mnt/dgx", "--share-remote", "/data",
        ]);
        let Some(Command::Hosts {
            action: HostsCommand::Add(add),
        }) = args.command
        else {
            panic!("expected hosts add");
        };
        let profile = add.into_profile().expect("profile");
        assert_eq!(profile.name, "dgx");
        assert!(profile.gpu_enabled);
        assert_eq!(profile.port, 22);
        assert_eq!(profile.environment.get("HF_HOME").map(String::as_str), Some("/data/hf"));
        assert_eq!(profile.share.expect("share").remote_path, "/data");
    }

    #[test]
    fn share_flags_must_come_together() {
        let parsed = Args::try_parse_from([
            "agentrun", "hosts", "add", "dgx", "--hostname", "h", "--share-local", "/mnt",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn env_pairs_are_validated() {
        let parsed = Args::try_parse_from([
            "agentrun", "hosts", "add", "dgx", "--hostname", "h", "--env", "1BAD=x",
        ]);
        assert!(parsed.is_err());
    }
}
