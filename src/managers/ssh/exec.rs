use super::session::map_ssh_error;
use crate::constants::network::TIMEOUT_SSH_EXEC_HARD_GRACE_MS;
use crate::errors::ExecError;
use crate::utils::redact::redact_text;
use crate::utils::text::decode_output;
use ssh2::{Channel, Session};
use std::io::Read;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub duration_ms: u128,
}

struct Capture {
    buf: Vec<u8>,
    limit: usize,
    total: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            total: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        let room = self.limit.saturating_sub(self.buf.len());
        if room > 0 {
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
    }

    fn truncated(&self) -> bool {
        self.total > self.buf.len()
    }
}

/// Non-blocking read step; `Ok(true)` when bytes arrived.
fn pump(stream: &mut impl Read, capture: &mut Capture, label: &str) -> Result<bool, ExecError> {
    let mut buf = [0u8; 8192];
    match stream.read(&mut buf) {
        Ok(n) if n > 0 => {
            capture.push(&buf[..n]);
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(ExecError::connection(format!(
            "SSH {} read failed: {}",
            label, err
        ))),
    }
}

fn drain(
    channel: &mut Channel,
    stdout: &mut Capture,
    stderr: &mut Capture,
    timeout: Duration,
    started: Instant,
) -> Result<bool, ExecError> {
    let mut stderr_stream = channel.stderr();
    loop {
        let mut progressed = pump(channel, stdout, "stdout")?;
        progressed |= pump(&mut stderr_stream, stderr, "stderr")?;
        if channel.eof() {
            return Ok(false);
        }
        if started.elapsed() > timeout {
            return Ok(true);
        }
        if !progressed {
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Runs `command` on a fresh channel of a pooled session. The session is
/// switched to non-blocking for the read loop and restored afterwards.
pub fn exec_blocking(
    session: &Session,
    command: &str,
    timeout: Duration,
    max_capture: usize,
    extra_secrets: Option<&[String]>,
) -> Result<RemoteOutput, ExecError> {
    let mut channel = session.channel_session().map_err(map_ssh_error)?;
    channel.exec(command).map_err(map_ssh_error)?;

    let mut stdout = Capture::new(max_capture);
    let mut stderr = Capture::new(max_capture);
    let started = Instant::now();

    session.set_blocking(false);
    let drained = drain(&mut channel, &mut stdout, &mut stderr, timeout, started);
    let timed_out = match drained {
        Ok(timed_out) => timed_out,
        Err(err) => {
            session.set_blocking(true);
            return Err(err);
        }
    };

    let mut closed = true;
    if timed_out {
        let _ = channel.close();
        let deadline = Instant::now() + Duration::from_millis(TIMEOUT_SSH_EXEC_HARD_GRACE_MS);
        while Instant::now() < deadline && !channel.eof() {
            std::thread::sleep(Duration::from_millis(20));
        }
        closed = channel.eof();
    }
    session.set_blocking(true);
    if closed {
        let _ = channel.wait_close();
    }
    let exit_code = if timed_out {
        -1
    } else {
        channel.exit_status().unwrap_or(-1)
    };

    Ok(RemoteOutput {
        exit_code,
        stdout: redact_text(&decode_output(&stdout.buf), extra_secrets),
        stderr: redact_text(&decode_output(&stderr.buf), extra_secrets),
        stdout_truncated: stdout.truncated(),
        stderr_truncated: stderr.truncated(),
        timed_out,
        duration_ms: started.elapsed().as_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::Capture;

    #[test]
    fn capture_keeps_prefix_and_counts_total() {
        let mut capture = Capture::new(4);
        capture.push(b"abc");
        capture.push(b"defg");
        assert_eq!(capture.buf, b"abcd");
        assert_eq!(capture.total, 7);
        assert!(capture.truncated());
    }
}
