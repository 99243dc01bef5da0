use once_cell::sync::Lazy;
use regex::Regex;

static SHELL_VAR_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(?:\{[A-Za-z_][A-Za-z0-9_]*\}|[A-Za-z_][A-Za-z0-9_]*)").expect("shell var regex"));

static ENV_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name regex"));

/// POSIX single-quote escaping.
pub fn escape_shell_value(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub fn references_shell_var(value: &str) -> bool {
    SHELL_VAR_REFERENCE.is_match(value)
}

pub fn is_valid_env_name(name: &str) -> bool {
    ENV_NAME.is_match(name)
}

/// Double-quoted form that keeps `$VAR` expansion but neutralises command
/// substitution and embedded quotes.
fn expandable_shell_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' | '\\' | '`' => {
                out.push('\\');
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
    out.replace("$(", "\\$(")
}

/// `export NAME=value` with strict quoting, except values that reference other
/// shell variables so chains like `PATH=$CUDA_HOME/bin:$PATH` still expand.
pub fn export_statement(name: &str, value: &str) -> Option<String> {
    if !is_valid_env_name(name) {
        return None;
    }
    let rendered = if references_shell_var(value) {
        expandable_shell_value(value)
    } else {
        escape_shell_value(value)
    };
    Some(format!("export {}={}", name, rendered))
}
