//! Local-process sandbox adapter.
//!
//! Development deployments run tool calls directly on the worker host: each
//! "container" is a project workspace directory, `bash` is a child process,
//! and the file tools are ordinary filesystem operations. Production swaps
//! this adapter for a container-backed one behind the same port.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use berth_sandbox::adapter::{
    SandboxAdapter, SandboxConfig, SandboxInstance, SandboxToolDescriptor, ToolOutcome,
};
use berth_sandbox::error::{SandboxError, SandboxResult};

pub struct LocalProcessAdapter {
    workspace_root: PathBuf,
    instances: Mutex<HashMap<String, SandboxInstance>>,
}

impl LocalProcessAdapter {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            workspace_root,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn workspace(&self, sandbox_id: &str) -> PathBuf {
        self.workspace_root.join(sandbox_id)
    }

    fn resolve(&self, sandbox_id: &str, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            // Absolute paths are re-rooted into the workspace.
            self.workspace(sandbox_id)
                .join(path.strip_prefix("/").unwrap_or(path))
        } else {
            self.workspace(sandbox_id).join(path)
        }
    }
}

/// Translate a glob pattern into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` also matches zero directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');
    regex::Regex::new(&out)
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

async fn run_bash(cwd: &Path, command: &str, timeout: Duration) -> ToolOutcome {
    let mut child = match tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return ToolOutcome::error(format!("failed to spawn shell: {e}")),
    };
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.shutdown().await;
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            if output.status.success() {
                ToolOutcome::ok(json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": exit_code,
                }))
            } else {
                ToolOutcome {
                    is_error: true,
                    content: json!({
                        "stdout": stdout,
                        "stderr": stderr,
                        "exit_code": exit_code,
                    }),
                }
            }
        }
        Ok(Err(e)) => ToolOutcome::error(format!("command failed: {e}")),
        Err(_) => ToolOutcome::error(format!(
            "command timed out after {}s",
            timeout.as_secs()
        )),
    }
}

fn read_file(path: &Path, offset: usize, limit: usize) -> ToolOutcome {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let lines: Vec<&str> = content.lines().skip(offset).take(limit).collect();
            ToolOutcome::ok(json!({
                "content": lines.join("\n"),
                "lines": lines.len(),
            }))
        }
        Err(e) => ToolOutcome::error(format!("cannot read {}: {e}", path.display())),
    }
}

fn write_file(path: &Path, content: &str) -> ToolOutcome {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return ToolOutcome::error(format!("cannot create {}: {e}", parent.display()));
        }
    }
    match std::fs::write(path, content) {
        Ok(()) => ToolOutcome::ok(json!({"written": content.len()})),
        Err(e) => ToolOutcome::error(format!("cannot write {}: {e}", path.display())),
    }
}

fn edit_file(path: &Path, old: &str, new: &str) -> ToolOutcome {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => return ToolOutcome::error(format!("cannot read {}: {e}", path.display())),
    };
    let matches = content.matches(old).count();
    if matches == 0 {
        return ToolOutcome::error("old_string not found in file");
    }
    if matches > 1 {
        return ToolOutcome::error(format!("old_string matches {matches} times, must be unique"));
    }
    let updated = content.replacen(old, new, 1);
    match std::fs::write(path, updated) {
        Ok(()) => ToolOutcome::ok(json!({"replaced": true})),
        Err(e) => ToolOutcome::error(format!("cannot write {}: {e}", path.display())),
    }
}

fn glob_files(root: &Path, pattern: &str) -> ToolOutcome {
    let regex = match glob_to_regex(pattern) {
        Ok(regex) => regex,
        Err(e) => return ToolOutcome::error(format!("bad glob pattern: {e}")),
    };
    let matches: Vec<String> = walk_files(root)
        .iter()
        .filter_map(|path| path.strip_prefix(root).ok())
        .map(|rel| rel.to_string_lossy().to_string())
        .filter(|rel| regex.is_match(rel))
        .collect();
    ToolOutcome::ok(json!({"matches": matches}))
}

fn grep_files(root: &Path, pattern: &str, glob: Option<&str>) -> ToolOutcome {
    let regex = match regex::Regex::new(pattern) {
        Ok(regex) => regex,
        Err(e) => return ToolOutcome::error(format!("bad regex: {e}")),
    };
    let file_filter = match glob.map(glob_to_regex).transpose() {
        Ok(filter) => filter,
        Err(e) => return ToolOutcome::error(format!("bad glob filter: {e}")),
    };

    let mut hits = Vec::new();
    for path in walk_files(root) {
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().to_string();
        if let Some(filter) = &file_filter {
            if !filter.is_match(&rel) {
                continue;
            }
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue; // binary or unreadable
        };
        for (line_no, line) in content.lines().enumerate() {
            if regex.is_match(line) {
                hits.push(json!({
                    "file": rel,
                    "line": line_no + 1,
                    "text": line,
                }));
            }
        }
    }
    ToolOutcome::ok(json!({"matches": hits}))
}

#[async_trait]
impl SandboxAdapter for LocalProcessAdapter {
    async fn create(
        &self,
        _project_path: &str,
        _config: &SandboxConfig,
        project_id: &str,
        tenant_id: &str,
        sandbox_id: Option<&str>,
    ) -> SandboxResult<SandboxInstance> {
        let id = sandbox_id
            .map(str::to_string)
            .unwrap_or_else(|| format!("proj-sb-{}", &Uuid::new_v4().simple().to_string()[..12]));
        let workspace = self.workspace(&id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| SandboxError::Adapter(format!("cannot create workspace: {e}")))?;

        let instance = SandboxInstance {
            id: id.clone(),
            container_ref: workspace.to_string_lossy().to_string(),
            project_id: project_id.to_string(),
            tenant_id: tenant_id.to_string(),
            running: true,
            endpoint: None,
            created_at: time::OffsetDateTime::now_utc(),
        };
        self.instances.lock().insert(id.clone(), instance.clone());
        debug!(sandbox_id = %id, workspace = %workspace.display(), "created local sandbox");
        Ok(instance)
    }

    async fn terminate(&self, sandbox_id: &str) -> SandboxResult<()> {
        self.instances.lock().remove(sandbox_id);
        Ok(())
    }

    async fn get(&self, sandbox_id: &str) -> SandboxResult<Option<SandboxInstance>> {
        Ok(self.instances.lock().get(sandbox_id).cloned())
    }

    async fn container_exists(&self, sandbox_id: &str) -> SandboxResult<bool> {
        let tracked = self.instances.lock().contains_key(sandbox_id);
        Ok(tracked && self.workspace(sandbox_id).is_dir())
    }

    async fn health_check(&self, sandbox_id: &str) -> SandboxResult<bool> {
        self.container_exists(sandbox_id).await
    }

    async fn call_tool(
        &self,
        sandbox_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> SandboxResult<ToolOutcome> {
        if !self.container_exists(sandbox_id).await? {
            return Err(SandboxError::Adapter(format!(
                "sandbox {sandbox_id} has no workspace"
            )));
        }
        let workspace = self.workspace(sandbox_id);

        let outcome = match tool_name {
            "bash" => match arguments["command"].as_str() {
                Some(command) => run_bash(&workspace, command, timeout).await,
                None => ToolOutcome::error("'command' is required"),
            },
            "read" => match arguments["file_path"].as_str() {
                Some(path) => {
                    let offset = arguments["offset"].as_u64().unwrap_or(0) as usize;
                    let limit = arguments["limit"].as_u64().unwrap_or(2000) as usize;
                    read_file(&self.resolve(sandbox_id, path), offset, limit)
                }
                None => ToolOutcome::error("'file_path' is required"),
            },
            "write" => match (arguments["file_path"].as_str(), arguments["content"].as_str()) {
                (Some(path), Some(content)) => {
                    write_file(&self.resolve(sandbox_id, path), content)
                }
                _ => ToolOutcome::error("'file_path' and 'content' are required"),
            },
            "file_edit" => match (
                arguments["file_path"].as_str(),
                arguments["old_string"].as_str(),
                arguments["new_string"].as_str(),
            ) {
                (Some(path), Some(old), Some(new)) => {
                    edit_file(&self.resolve(sandbox_id, path), old, new)
                }
                _ => ToolOutcome::error("'file_path', 'old_string', 'new_string' are required"),
            },
            "file_glob" => match arguments["pattern"].as_str() {
                Some(pattern) => glob_files(&workspace, pattern),
                None => ToolOutcome::error("'pattern' is required"),
            },
            "file_grep" => match arguments["pattern"].as_str() {
                Some(pattern) => {
                    grep_files(&workspace, pattern, arguments["glob"].as_str())
                }
                None => ToolOutcome::error("'pattern' is required"),
            },
            other => ToolOutcome::error(format!("unknown sandbox tool '{other}'")),
        };
        Ok(outcome)
    }

    async fn list_tools(&self, _sandbox_id: &str) -> SandboxResult<Vec<SandboxToolDescriptor>> {
        Ok(["bash", "read", "write", "file_edit", "file_glob", "file_grep"]
            .iter()
            .map(|name| SandboxToolDescriptor {
                name: name.to_string(),
                description: format!("local {name} tool"),
                parameters: json!({"type": "object"}),
            })
            .collect())
    }

    async fn cleanup_project_containers(&self, project_id: &str) -> SandboxResult<u32> {
        let mut instances = self.instances.lock();
        let before = instances.len();
        instances.retain(|_, instance| instance.project_id != project_id);
        Ok((before - instances.len()) as u32)
    }

    async fn list_managed_containers(&self) -> SandboxResult<Vec<SandboxInstance>> {
        Ok(self.instances.lock().values().cloned().collect())
    }
}
