use super::{SandboxClient, SandboxCommandOutput, SandboxEntry};
use crate::constants::limits::LOG_PREVIEW_BYTES;
use crate::constants::network::TIMEOUT_SANDBOX_REQUEST_MS;
use crate::constants::sandbox::{DEFAULT_TEMPLATE, ENVD_PORT, ENVD_USER, REMOTE_WORKDIR};
use crate::errors::ExecError;
use crate::utils::text::preview;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

const CONNECT_JSON: &str = "application/connect+json";
const FLAG_NONE: u8 = 0x00;
const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_END_STREAM: u8 = 0x02;

#[derive(Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "templateID")]
    template_id: &'a str,
    timeout: u64,
}

#[derive(Deserialize)]
struct CreateResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "envdAccessToken", default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Serialize)]
struct StartRequest<'a> {
    process: ProcessConfig<'a>,
}

#[derive(Serialize)]
struct ProcessConfig<'a> {
    cmd: &'a str,
    args: [&'a str; 3],
    envs: &'a BTreeMap<String, String>,
    cwd: &'a str,
}

#[derive(Deserialize, Default)]
struct StartResponse {
    #[serde(default)]
    event: ProcessEvent,
}

#[derive(Deserialize, Default)]
struct ProcessEvent {
    #[serde(default)]
    data: Option<DataEvent>,
    #[serde(default)]
    end: Option<EndEvent>,
}

#[derive(Deserialize)]
struct DataEvent {
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
}

#[derive(Deserialize)]
struct EndEvent {
    #[serde(rename = "exitCode", default)]
    exit_code: i32,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct EndStream {
    #[serde(default)]
    error: Option<ConnectError>,
}

#[derive(Deserialize)]
struct ConnectError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ListDirResponse {
    #[serde(default)]
    entries: Vec<EntryInfo>,
}

#[derive(Deserialize)]
struct EntryInfo {
    path: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Clone)]
struct EnvdTarget {
    base: Url,
    access_token: Option<String>,
}

impl EnvdTarget {
    fn endpoint(&self, path: &str) -> Result<Url, ExecError> {
        self.base
            .join(path)
            .map_err(|err| ExecError::internal(format!("Bad envd endpoint {}: {}", path, err)))
    }

    fn files(&self, path: &str) -> Result<Url, ExecError> {
        let mut url = self.endpoint("files")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("username", ENVD_USER);
        Ok(url)
    }
}

/// E2B client. Lifecycle calls go to the control plane with `X-API-Key`;
/// commands and files go to the envd daemon inside each sandbox.
pub struct HttpSandboxClient {
    http: reqwest::Client,
    api: Url,
    api_key: String,
    domain: String,
    sandboxes: Mutex<HashMap<String, EnvdTarget>>,
}

impl HttpSandboxClient {
    pub fn new(api_url: &str, domain: &str, api_key: String) -> Result<Self, ExecError> {
        let mut api = Url::parse(api_url).map_err(|err| {
            ExecError::invalid_params(format!("Invalid sandbox URL {}: {}", api_url, err))
        })?;
        if !api.path().ends_with('/') {
            let path = format!("{}/", api.path());
            api.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(TIMEOUT_SANDBOX_REQUEST_MS))
            .build()
            .map_err(|err| ExecError::internal(format!("Failed to build HTTP client: {}", err)))?;
        Ok(Self {
            http,
            api,
            api_key,
            domain: domain.to_string(),
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ExecError> {
        self.api
            .join(path)
            .map_err(|err| ExecError::internal(format!("Bad sandbox endpoint {}: {}", path, err)))
    }

    fn target(&self, sandbox_id: &str) -> Result<EnvdTarget, ExecError> {
        if let Some(target) = self
            .sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sandbox_id)
        {
            return Ok(target.clone());
        }
        Ok(EnvdTarget {
            base: envd_url(sandbox_id, &self.domain)?,
            access_token: None,
        })
    }

    fn envd(&self, method: reqwest::Method, target: &EnvdTarget, url: Url) -> reqwest::RequestBuilder {
        let basic = base64::engine::general_purpose::STANDARD.encode(format!("{}:", ENVD_USER));
        let request = self
            .http
            .request(method, url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {}", basic));
        match target.access_token.as_deref() {
            Some(token) => request.header("X-Access-Token", token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response, action: &str) -> Result<reqwest::Response, ExecError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::json!({"status": status.as_u16(), "body": preview(&body, LOG_PREVIEW_BYTES)});
        let err = match status.as_u16() {
            401 | 403 => ExecError::connection(format!(
                "Sandbox service rejected the API key during {}",
                action
            ))
            .with_hint("Check E2B_API_KEY"),
            404 => ExecError::command_failure(format!("Sandbox {} target not found", action)),
            _ if status.is_server_error() => ExecError::backend_unavailable(format!(
                "Sandbox service failed during {} ({})",
                action, status
            )),
            _ => ExecError::connection(format!("Sandbox {} failed ({})", action, status)),
        };
        Err(err.with_details(detail))
    }
}

#[async_trait::async_trait]
impl SandboxClient for HttpSandboxClient {
    async fn create(&self, template: Option<&str>, timeout_secs: u64) -> Result<String, ExecError> {
        let response = self
            .http
            .post(self.endpoint("sandboxes")?)
            .header("X-API-Key", &self.api_key)
            .timeout(Duration::from_millis(TIMEOUT_SANDBOX_REQUEST_MS))
            .json(&create_request(template, timeout_secs))
            .send()
            .await?;
        let parsed: CreateResponse = Self::check(response, "create").await?.json().await?;
        super::validate_sandbox_id(&parsed.sandbox_id)?;
        let domain = parsed.domain.as_deref().unwrap_or(&self.domain);
        let target = EnvdTarget {
            base: envd_url(&parsed.sandbox_id, domain)?,
            access_token: parsed.envd_access_token,
        };
        self.sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(parsed.sandbox_id.clone(), target);
        Ok(parsed.sandbox_id)
    }

    async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        env: &BTreeMap<String, String>,
        timeout_secs: u64,
    ) -> Result<SandboxCommandOutput, ExecError> {
        let target = self.target(sandbox_id)?;
        let body = serde_json::to_vec(&StartRequest {
            process: ProcessConfig {
                cmd: "/bin/bash",
                args: ["-l", "-c", command],
                envs: env,
                cwd: REMOTE_WORKDIR,
            },
        })
        .map_err(|err| ExecError::internal(format!("Failed to encode command: {}", err)))?;
        let response = self
            .envd(reqwest::Method::POST, &target, target.endpoint("process.Process/Start")?)
            .header(reqwest::header::CONTENT_TYPE, CONNECT_JSON)
            .header("Connect-Timeout-Ms", (timeout_secs * 1000).to_string())
            .timeout(Duration::from_secs(timeout_secs + 30))
            .body(encode_envelope(FLAG_NONE, &body))
            .send()
            .await?;
        let stream = Self::check(response, "command").await?.bytes().await?;
        collect_process_output(&stream)
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, bytes: Vec<u8>) -> Result<(), ExecError> {
        let target = self.target(sandbox_id)?;
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(name));
        let response = self
            .envd(reqwest::Method::POST, &target, target.files(path)?)
            .timeout(Duration::from_millis(TIMEOUT_SANDBOX_REQUEST_MS))
            .multipart(form)
            .send()
            .await?;
        Self::check(response, "upload").await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, ExecError> {
        let target = self.target(sandbox_id)?;
        let response = self
            .envd(reqwest::Method::GET, &target, target.files(path)?)
            .timeout(Duration::from_millis(TIMEOUT_SANDBOX_REQUEST_MS))
            .send()
            .await?;
        Ok(Self::check(response, "download").await?.bytes().await?.to_vec())
    }

    async fn list_dir(&self, sandbox_id: &str, path: &str) -> Result<Vec<SandboxEntry>, ExecError> {
        let target = self.target(sandbox_id)?;
        let response = self
            .envd(reqwest::Method::POST, &target, target.endpoint("filesystem.Filesystem/ListDir")?)
            .header("Connect-Protocol-Version", "1")
            .timeout(Duration::from_millis(TIMEOUT_SANDBOX_REQUEST_MS))
            .json(&serde_json::json!({"path": path, "depth": 1}))
            .send()
            .await?;
        let listing: ListDirResponse = Self::check(response, "list").await?.json().await?;
        Ok(entries_from(listing))
    }

    async fn kill(&self, sandbox_id: &str) -> Result<(), ExecError> {
        let response = self
            .http
            .delete(self.endpoint(&format!("sandboxes/{}", sandbox_id))?)
            .header("X-API-Key", &self.api_key)
            .timeout(Duration::from_millis(TIMEOUT_SANDBOX_REQUEST_MS))
            .send()
            .await?;
        Self::check(response, "kill").await?;
        self.sandboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);
        Ok(())
    }
}

fn create_request(template: Option<&str>, timeout_secs: u64) -> CreateRequest<'_> {
    CreateRequest {
        template_id: template.unwrap_or(DEFAULT_TEMPLATE),
        timeout: timeout_secs,
    }
}

/// `https://<envd port>-<sandbox id>.<domain>/`
fn envd_url(sandbox_id: &str, domain: &str) -> Result<Url, ExecError> {
    let raw = format!("https://{}-{}.{}/", ENVD_PORT, sandbox_id, domain);
    Url::parse(&raw).map_err(|err| ExecError::internal(format!("Bad envd URL {}: {}", raw, err)))
}

fn entries_from(listing: ListDirResponse) -> Vec<SandboxEntry> {
    listing
        .entries
        .into_iter()
        .map(|entry| SandboxEntry {
            is_dir: entry.kind == "FILE_TYPE_DIRECTORY",
            path: entry.path,
        })
        .collect()
}

/// Connect envelope: flag byte, big-endian length, payload.
fn encode_envelope(flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn decode_envelopes(mut bytes: &[u8]) -> Result<Vec<(u8, &[u8])>, ExecError> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 5 {
            return Err(ExecError::connection("Truncated sandbox process stream"));
        }
        let flags = bytes[0];
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        let rest = &bytes[5..];
        if rest.len() < len {
            return Err(ExecError::connection("Truncated sandbox process stream"));
        }
        frames.push((flags, &rest[..len]));
        bytes = &rest[len..];
    }
    Ok(frames)
}

fn decode_chunk(encoded: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    let bytes = engine
        .decode(encoded)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(encoded))
        .unwrap_or_default();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Folds a `process.Process/Start` response stream into captured output.
fn collect_process_output(stream: &[u8]) -> Result<SandboxCommandOutput, ExecError> {
    let mut output = SandboxCommandOutput::default();
    let mut ended = false;
    for (flags, payload) in decode_envelopes(stream)? {
        if flags & FLAG_COMPRESSED != 0 {
            return Err(ExecError::connection("Compressed sandbox stream is not supported"));
        }
        if flags & FLAG_END_STREAM != 0 {
            let trailer: EndStream = serde_json::from_slice(payload).unwrap_or_default();
            if let Some(err) = trailer.error {
                return Err(ExecError::command_failure(format!(
                    "Sandbox process failed: {} {}",
                    err.code, err.message
                ))
                .with_details(serde_json::json!({"stdout": preview(&output.stdout, LOG_PREVIEW_BYTES)})));
            }
            continue;
        }
        let message: StartResponse = serde_json::from_slice(payload)
            .map_err(|err| ExecError::connection(format!("Bad sandbox process event: {}", err)))?;
        if let Some(data) = message.event.data {
            if let Some(chunk) = data.stdout {
                output.stdout.push_str(&decode_chunk(&chunk));
            }
            if let Some(chunk) = data.stderr {
                output.stderr.push_str(&decode_chunk(&chunk));
            }
        }
        if let Some(end) = message.event.end {
            output.exit_code = end.exit_code;
            if let Some(reason) = end.error.filter(|e| !e.is_empty()) {
                if !output.stderr.is_empty() && !output.stderr.ends_with('\n') {
                    output.stderr.push('\n');
                }
                output.stderr.push_str(&reason);
            }
            ended = true;
        }
    }
    if !ended {
        return Err(ExecError::connection("Sandbox process stream ended without an exit event"));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(json: serde_json::Value) -> Vec<u8> {
        encode_envelope(FLAG_NONE, json.to_string().as_bytes())
    }

    fn b64(text: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(text)
    }

    #[test]
    fn create_request_defaults_to_base_template() {
        let body = serde_json::to_value(create_request(None, 300)).expect("json");
        assert_eq!(body, serde_json::json!({"templateID": "base", "timeout": 300}));
        let custom = serde_json::to_value(create_request(Some("agents-v2"), 60)).expect("json");
        assert_eq!(custom["templateID"], "agents-v2");
    }

    #[test]
    fn create_response_reads_envd_details() {
        let parsed: CreateResponse = serde_json::from_str(
            r#"{"sandboxID":"ix1d2k","clientID":"6532622b","envdVersion":"0.2.0","envdAccessToken":"tok","domain":null}"#,
        )
        .expect("parse");
        assert_eq!(parsed.sandbox_id, "ix1d2k");
        assert_eq!(parsed.envd_access_token.as_deref(), Some("tok"));
        assert!(parsed.domain.is_none());
        assert_eq!(
            envd_url(&parsed.sandbox_id, "e2b.app").expect("url").as_str(),
            "https://49983-ix1d2k.e2b.app/"
        );
    }

    #[test]
    fn files_url_carries_path_and_user() {
        let target = EnvdTarget {
            base: envd_url("abc", "e2b.app").expect("url"),
            access_token: None,
        };
        let full = target.files("/home/user/my notes.md").expect("url");
        let pairs: Vec<(String, String)> = full
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(full.path(), "/files");
        assert_eq!(
            pairs,
            vec![
                ("path".to_string(), "/home/user/my notes.md".to_string()),
                ("username".to_string(), "user".to_string()),
            ]
        );
    }

    #[test]
    fn process_stream_collects_output_and_exit_code() {
        let mut stream = event(serde_json::json!({"event": {"start": {"pid": 42}}}));
        stream.extend(event(serde_json::json!({"event": {"data": {"stdout": b64("hello ")}}})));
        stream.extend(event(serde_json::json!({"event": {"keepalive": {}}})));
        stream.extend(event(serde_json::json!({"event": {"data": {"stdout": b64("world\n")}}})));
        stream.extend(event(serde_json::json!({"event": {"data": {"stderr": b64("warn\n")}}})));
        stream.extend(event(serde_json::json!({"event": {"end": {"exitCode": 2, "exited": true, "status": "exit status 2"}}})));
        stream.extend(encode_envelope(FLAG_END_STREAM, b"{}"));

        let output = collect_process_output(&stream).expect("output");
        assert_eq!(output.stdout, "hello world\n");
        assert_eq!(output.stderr, "warn\n");
        assert_eq!(output.exit_code, 2);
    }

    #[test]
    fn omitted_exit_code_means_zero() {
        let mut stream = event(serde_json::json!({"event": {"end": {"exited": true, "status": "exit status 0"}}}));
        stream.extend(encode_envelope(FLAG_END_STREAM, b"{}"));
        assert_eq!(collect_process_output(&stream).expect("output").exit_code, 0);
    }

    #[test]
    fn stream_errors_surface() {
        let trailer = encode_envelope(
            FLAG_END_STREAM,
            br#"{"error":{"code":"unavailable","message":"sandbox not running"}}"#,
        );
        let err = collect_process_output(&trailer).expect_err("trailer error");
        assert!(err.message.contains("sandbox not running"));

        let mut truncated = event(serde_json::json!({"event": {"start": {"pid": 1}}}));
        truncated.truncate(truncated.len() - 3);
        assert!(collect_process_output(&truncated).is_err());

        let no_end = event(serde_json::json!({"event": {"start": {"pid": 1}}}));
        assert!(collect_process_output(&no_end).is_err());
    }

    #[test]
    fn list_dir_entries_map_types() {
        let listing: ListDirResponse = serde_json::from_str(
            r#"{"entries":[
                {"name":"report.md","type":"FILE_TYPE_FILE","path":"/home/user/output/report.md"},
                {"name":"plots","type":"FILE_TYPE_DIRECTORY","path":"/home/user/output/plots"}
            ]}"#,
        )
        .expect("parse");
        let entries = entries_from(listing);
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].is_dir);
        assert_eq!(entries[0].path, "/home/user/output/report.md");
        assert!(entries[1].is_dir);
    }
}
