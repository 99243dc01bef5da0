use crate::services::intent::{Agent, BackendKind, ParsedIntent};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use std::ops::Range;

static AUTO_CLOSE_LEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:--auto-close|--close|auto-close)(?:\s+|$)").expect("auto-close regex")
});

static AUTO_CLOSE_TRAILING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:^|\s)(?:--auto-close|--close|auto-close)\s*$").expect("auto-close regex")
});

static SANDBOX_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:in|on|using|with)\s+(?:(?:a|the)\s+)?(?:(?:cloud\s+)?sandbox|e2b)\b")
        .expect("sandbox regex")
});

static DOCKER_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:(?:in|using|with)\s+(?:(?:a|the)\s+)?docker(?:\s+container)?|(?:in|inside)\s+(?:(?:a|the)\s+)?container)\b",
    )
    .expect("docker regex")
});

static USE_AGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\buse\s+(claude|gemini|codex)\b").expect("agent regex"));

static BARE_AGENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(claude|gemini|codex)\b").expect("agent regex"));

static LEADING_TO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^to(?:\s+|$)").expect("connective regex"));

/// Host patterns in priority order. `{hosts}` is replaced by the escaped
/// alternation of registered names; group 1 is the host.
const SSH_PATTERNS: [&str; 4] = [
    r"(?:^|\s)on\s+({hosts})(?:$|[\s:,;])",
    r"(?:^|\s)ssh\s+to\s+({hosts})(?:$|[\s:,;])",
    r"(?:^|\s)remote:({hosts})(?:$|[\s:,;])",
    r"^\s*@({hosts})(?:$|[\s:,;])",
];

/// Removes `range` and joins the remaining halves with a single space.
fn splice_out(text: &str, range: Range<usize>) -> String {
    let left = text[..range.start].trim_end();
    let right = text[range.end..].trim_start();
    match (left.is_empty(), right.is_empty()) {
        (true, _) => right.to_string(),
        (_, true) => left.to_string(),
        _ => format!("{} {}", left, right),
    }
}

fn strip_auto_close(text: &str) -> (bool, String) {
    if let Some(m) = AUTO_CLOSE_LEADING.find(text) {
        return (true, splice_out(text, m.range()));
    }
    if let Some(m) = AUTO_CLOSE_TRAILING.find(text) {
        return (true, splice_out(text, m.range()));
    }
    (false, text.to_string())
}

fn host_alternation(registered_hosts: &[String]) -> Option<String> {
    let mut names: Vec<&str> = registered_hosts
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        return None;
    }
    // Longest first so `dgx-2` wins over `dgx`.
    names.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
    names.dedup();
    Some(
        names
            .iter()
            .map(|name| regex::escape(name))
            .collect::<Vec<_>>()
            .join("|"),
    )
}

fn detect_ssh_host(text: &str, registered_hosts: &[String]) -> Option<(String, String)> {
    let alternation = host_alternation(registered_hosts)?;
    for pattern in SSH_PATTERNS {
        let source = pattern.replace("{hosts}", &alternation);
        let Ok(re) = RegexBuilder::new(&source).case_insensitive(true).build() else {
            continue;
        };
        let Some(caps) = re.captures(text) else {
            continue;
        };
        let (Some(whole), Some(host)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let captured = host.as_str().to_lowercase();
        let name = registered_hosts
            .iter()
            .find(|name| name.trim().to_lowercase() == captured)
            .map(|name| name.trim().to_lowercase())
            .unwrap_or(captured);
        // Keep the trailing delimiter (`:` in `ssh to dgx: ls`) for cleanup.
        let residual = splice_out(text, whole.start()..host.end());
        return Some((name, residual));
    }
    None
}

fn detect_agent(text: &str) -> (Option<Agent>, String) {
    for re in [&*USE_AGENT, &*BARE_AGENT] {
        if let Some(caps) = re.captures(text) {
            if let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) {
                return (Agent::parse(name.as_str()), splice_out(text, whole.range()));
            }
        }
    }
    (None, text.to_string())
}

fn clean_residual(text: &str) -> String {
    let mut current = text.trim();
    if let Some(rest) = current.strip_prefix(':') {
        current = rest.trim_start();
    }
    if let Some(m) = LEADING_TO.find(current) {
        current = &current[m.end()..];
    }
    current.trim().to_string()
}

/// Extracts backend, agent, SSH host and auto-close flag from free text.
/// Only names in `registered_hosts` can select the SSH backend.
pub fn parse(text: &str, registered_hosts: &[String]) -> ParsedIntent {
    let (auto_close, mut rest) = strip_auto_close(text.trim());

    let mut backend = BackendKind::Local;
    let mut ssh_host = None;
    if let Some(m) = SANDBOX_PHRASE.find(&rest) {
        backend = BackendKind::Sandbox;
        rest = splice_out(&rest, m.range());
    } else if let Some(m) = DOCKER_PHRASE.find(&rest) {
        backend = BackendKind::Docker;
        rest = splice_out(&rest, m.range());
    } else if let Some((host, residual)) = detect_ssh_host(&rest, registered_hosts) {
        backend = BackendKind::Ssh;
        ssh_host = Some(host);
        rest = residual;
    }

    let (agent, rest) = detect_agent(&rest);

    ParsedIntent {
        backend,
        agent,
        ssh_host,
        auto_close,
        command: clean_residual(&rest),
    }
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::services::intent::{Agent, BackendKind};

    fn hosts() -> Vec<String> {
        vec!["dgx".to_string(), "dgx-2".to_string(), "lab.node".to_string()]
    }

    #[test]
    fn sandbox_agent_prompt() {
        let intent = parse("use gemini in sandbox to summarize notes.md", &hosts());
        assert_eq!(intent.backend, BackendKind::Sandbox);
        assert_eq!(intent.agent, Some(Agent::Gemini));
        assert_eq!(intent.command, "summarize notes.md");
        assert_eq!(intent.ssh_host, None);
        assert!(!intent.auto_close);
    }

    #[test]
    fn ssh_host_from_on_phrase() {
        let intent = parse("on dgx nvidia-smi", &hosts());
        assert_eq!(intent.backend, BackendKind::Ssh);
        assert_eq!(intent.ssh_host.as_deref(), Some("dgx"));
        assert_eq!(intent.command, "nvidia-smi");
    }

    #[test]
    fn ssh_patterns_and_case() {
        let intent = parse("ssh to DGX: ls -la", &hosts());
        assert_eq!(intent.ssh_host.as_deref(), Some("dgx"));
        assert_eq!(intent.command, "ls -la");

        let intent = parse("remote:lab.node uptime", &hosts());
        assert_eq!(intent.ssh_host.as_deref(), Some("lab.node"));
        assert_eq!(intent.command, "uptime");

        let intent = parse("@dgx-2 df -h", &hosts());
        assert_eq!(intent.ssh_host.as_deref(), Some("dgx-2"));
        assert_eq!(intent.command, "df -h");
    }

    #[test]
    fn unregistered_host_stays_local() {
        let intent = parse("on dgx3 nvidia-smi", &hosts());
        assert_eq!(intent.backend, BackendKind::Local);
        assert_eq!(intent.command, "on dgx3 nvidia-smi");

        let intent = parse("on dgx nvidia-smi", &[]);
        assert_eq!(intent.backend, BackendKind::Local);
    }

    #[test]
    fn docker_phrases() {
        let intent = parse("run pytest in a docker container", &hosts());
        assert_eq!(intent.backend, BackendKind::Docker);
        assert_eq!(intent.command, "run pytest");

        let intent = parse("inside the container: make test", &hosts());
        assert_eq!(intent.backend, BackendKind::Docker);
        assert_eq!(intent.command, "make test");
    }

    #[test]
    fn sandbox_takes_priority_over_docker_and_ssh() {
        let intent = parse("on dgx with e2b run tests in docker", &hosts());
        assert_eq!(intent.backend, BackendKind::Sandbox);
        assert_eq!(intent.ssh_host, None);
    }

    #[test]
    fn use_agent_wins_over_bare_name() {
        let intent = parse("use codex to compare claude output", &hosts());
        assert_eq!(intent.agent, Some(Agent::Codex));
        assert_eq!(intent.command, "compare claude output");

        let intent = parse("claude explain main.rs", &hosts());
        assert_eq!(intent.agent, Some(Agent::Claude));
        assert_eq!(intent.command, "explain main.rs");
    }

    #[test]
    fn bare_names_need_non_word_neighbours() {
        let intent = parse("cat /home/claude/notes.txt", &hosts());
        assert_eq!(intent.agent, Some(Agent::Claude));

        let intent = parse("grep -n todo src/claude_utils.rs", &hosts());
        assert_eq!(intent.agent, None);
        assert_eq!(intent.command, "grep -n todo src/claude_utils.rs");
    }

    #[test]
    fn auto_close_leading_or_trailing() {
        let intent = parse("--auto-close ls -la", &hosts());
        assert!(intent.auto_close);
        assert_eq!(intent.command, "ls -la");

        let intent = parse("on dgx hostname --close", &hosts());
        assert!(intent.auto_close);
        assert_eq!(intent.command, "hostname");

        let intent = parse("echo --close-enough", &hosts());
        assert!(!intent.auto_close);
    }

    #[test]
    fn residual_reparses_as_plain_local() {
        for input in [
            "use gemini in sandbox to summarize notes.md",
            "on dgx nvidia-smi",
            "ssh to dgx: ls",
            "--auto-close use claude in docker to review src/lib.rs",
        ] {
            let first = parse(input, &hosts());
            let second = parse(&first.command, &hosts());
            assert_eq!(second.backend, BackendKind::Local, "input: {}", input);
            assert_eq!(second.agent, None, "input: {}", input);
            assert!(!second.auto_close);
            assert_eq!(second.command, first.command, "input: {}", input);
        }
    }
}
