use crate::constants::shell::LINUX_TERMINALS;
use crate::errors::ExecError;
use crate::utils::process::which;
use crate::utils::shell::escape_shell_value;
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

/// Program and arguments that open a visible terminal running a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLaunch {
    pub terminal: String,
    pub program: String,
    pub args: Vec<String>,
}

/// `cd` into the working directory, run, report the status, then keep an
/// interactive shell open so the window stays readable.
pub fn window_script(command: &str, shell: &str, working_dir: &Path) -> String {
    format!(
        "cd {} && {}; status=$?; echo; echo \"[agentrun] exited with status $status\"; exec {}",
        escape_shell_value(&working_dir.to_string_lossy()),
        command,
        shell
    )
}

fn applescript_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

pub fn linux_launch(terminal: &str, shell: &str, script: &str) -> TerminalLaunch {
    let mut args: Vec<String> = if terminal == "gnome-terminal" {
        vec!["--".to_string()]
    } else {
        vec!["-e".to_string()]
    };
    args.extend([shell.to_string(), "-c".to_string(), script.to_string()]);
    TerminalLaunch {
        terminal: terminal.to_string(),
        program: terminal.to_string(),
        args,
    }
}

pub fn macos_launch(script: &str) -> TerminalLaunch {
    TerminalLaunch {
        terminal: "Terminal".to_string(),
        program: "osascript".to_string(),
        args: vec![
            "-e".to_string(),
            format!(
                "tell application \"Terminal\" to do script \"{}\"",
                applescript_escape(script)
            ),
            "-e".to_string(),
            "tell application \"Terminal\" to activate".to_string(),
        ],
    }
}

pub fn plan_launch(command: &str, shell: &str, working_dir: &Path) -> Result<TerminalLaunch, ExecError> {
    if cfg!(target_os = "windows") {
        return Ok(TerminalLaunch {
            terminal: "cmd".to_string(),
            program: "cmd".to_string(),
            args: vec![
                "/c".to_string(),
                "start".to_string(),
                "cmd".to_string(),
                "/k".to_string(),
                command.to_string(),
            ],
        });
    }
    let script = window_script(command, shell, working_dir);
    if cfg!(target_os = "macos") {
        return Ok(macos_launch(&script));
    }
    LINUX_TERMINALS
        .iter()
        .find(|name| which(name).is_some())
        .map(|name| linux_launch(name, shell, &script))
        .ok_or_else(|| {
            ExecError::backend_unavailable("No terminal emulator found")
                .with_hint(format!(
                    "Install one of {} or add --auto-close to capture output inline.",
                    LINUX_TERMINALS.join(", ")
                ))
        })
}

/// Spawns the terminal without waiting. `env` reaches the window through the
/// child environment on platforms whose terminals inherit it.
pub async fn open_window(
    launch: &TerminalLaunch,
    env: &BTreeMap<String, String>,
    working_dir: &Path,
) -> Result<(), ExecError> {
    let mut cmd = tokio::process::Command::new(&launch.program);
    cmd.args(&launch.args)
        .envs(env)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.spawn().map_err(|err| {
        ExecError::backend_unavailable(format!("Failed to open {}: {}", launch.terminal, err))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{linux_launch, macos_launch, window_script};
    use std::path::Path;

    #[test]
    fn gnome_terminal_uses_double_dash() {
        let launch = linux_launch("gnome-terminal", "/bin/bash", "ls");
        assert_eq!(launch.args, vec!["--", "/bin/bash", "-c", "ls"]);
        let launch = linux_launch("xterm", "/bin/bash", "ls");
        assert_eq!(launch.args[0], "-e");
    }

    #[test]
    fn window_script_keeps_shell_open() {
        let script = window_script("make test", "/bin/zsh", Path::new("/work/my repo"));
        assert!(script.starts_with("cd '/work/my repo' && make test;"));
        assert!(script.ends_with("exec /bin/zsh"));
    }

    #[test]
    fn applescript_quotes_are_escaped() {
        let launch = macos_launch("echo \"hi\"");
        assert!(launch.args[1].contains("do script \"echo \\\"hi\\\"\""));
    }
}
