use crate::errors::ExecError;

#[derive(Clone, Default)]
pub struct Validation;

impl Validation {
    pub fn new() -> Self {
        Self
    }

    pub fn ensure_string(&self, value: &str, label: &str) -> Result<String, ExecError> {
        let normalized = value.trim();
        if normalized.is_empty() {
            return Err(ExecError::invalid_params(format!(
                "{} must be a non-empty string",
                label
            )));
        }
        Ok(normalized.to_string())
    }

    /// Host names are case-insensitive keys; they are stored lowercase.
    pub fn ensure_host_name(&self, value: &str) -> Result<String, ExecError> {
        let trimmed = self.ensure_string(value, "host name")?;
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ExecError::invalid_params(format!(
                "host name '{}' may only contain letters, digits, '-', '_' and '.'",
                trimmed
            ))
            .with_hint("Example: dgx, gpu-box-1, lab.node2"));
        }
        Ok(trimmed.to_lowercase())
    }

    pub fn ensure_port(&self, value: u16) -> Result<u16, ExecError> {
        if value == 0 {
            return Err(ExecError::invalid_params(
                "port must be an integer between 1 and 65535",
            ));
        }
        Ok(value)
    }
}
