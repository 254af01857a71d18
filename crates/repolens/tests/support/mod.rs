#![allow(dead_code, missing_docs)]

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use assert_cmd::cargo::CommandCargoExt;
use git2::{Commit, Oid, Repository, Signature};
use serde_json::{Map, Value, json};

/// Commit `files` on top of `branch` of a bare repository.
pub fn commit_files(repo: &Repository, branch: &str, files: &[(&str, &str)]) -> Result<Oid> {
    let sig = Signature::now("tester", "tester@example.invalid")?;
    let refname = format!("refs/heads/{branch}");
    let parent = repo
        .find_reference(&refname)
        .ok()
        .and_then(|reference| reference.peel_to_commit().ok());

    let mut index = git2::Index::new()?;
    if let Some(parent) = parent.as_ref() {
        index.read_tree(&parent.tree()?)?;
    }
    for (path, content) in files {
        let blob = repo.blob(content.as_bytes())?;
        let entry = git2::IndexEntry {
            ctime: git2::IndexTime::new(0, 0),
            mtime: git2::IndexTime::new(0, 0),
            dev: 0,
            ino: 0,
            mode: 0o100_644,
            uid: 0,
            gid: 0,
            file_size: u32::try_from(content.len())?,
            id: blob,
            flags: 0,
            flags_extended: 0,
            path: path.as_bytes().to_vec(),
        };
        index.add(&entry)?;
    }
    let tree = repo.find_tree(index.write_tree_to(repo)?)?;
    let parents: Vec<&Commit<'_>> = parent.iter().collect();
    Ok(repo.commit(Some(&refname), &sig, &sig, "update", &tree, &parents)?)
}

pub enum Response {
    Result(Value),
    Error(Value),
}

/// A `repolens serve` process spoken to over stdio.
pub struct McpHarness {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    stderr_handle: Option<thread::JoinHandle<String>>,
    buffer: String,
    next_id: i64,
}

impl McpHarness {
    pub fn spawn(cache_dir: &Path) -> Result<Self> {
        let mut cmd = Command::cargo_bin("repolens")?;
        cmd.arg("serve")
            .arg("--cache-dir")
            .arg(cache_dir)
            .env("XDG_CONFIG_HOME", cache_dir.join("config"))
            .env("RUST_LOG", "debug")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        Self::from_command(cmd)
    }

    fn from_command(mut cmd: Command) -> Result<Self> {
        let mut child = cmd.spawn().context("failed to spawn repolens serve")?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("failed to capture stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("failed to capture stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow!("failed to capture stderr"))?;

        let stderr_handle = thread::spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut logs = String::new();
            let _ = reader.read_to_string(&mut logs);
            logs
        });

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            stderr_handle: Some(stderr_handle),
            buffer: String::new(),
            next_id: 1,
        })
    }

    pub fn initialize(&mut self) -> Result<Response> {
        let params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "repolens-e2e", "version": "0.1.0" }
        });
        match self.request("initialize", Some(params))? {
            Response::Result(info) => {
                self.send_notification("notifications/initialized", None)?;
                Ok(Response::Result(info))
            }
            Response::Error(error) => Ok(Response::Error(error)),
        }
    }

    pub fn list_tools(&mut self) -> Result<Response> {
        self.request("tools/list", Some(Value::Object(Map::new())))
    }

    pub fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Response> {
        self.request("tools/call", Some(json!({ "name": name, "arguments": arguments })))
    }

    /// Call a tool that must succeed and decode its JSON text payload.
    pub fn call_json(&mut self, name: &str, arguments: Value) -> Result<Value> {
        match self.call_tool(name, arguments)? {
            Response::Result(result) => extract_content(&result),
            Response::Error(err) => Err(anyhow!("{name} returned error: {err}")),
        }
    }

    /// Close stdin and wait for the server to flush its cache and exit.
    pub fn finish(mut self) -> Result<ExitStatus> {
        self.close_stdin();
        self.wait_for_exit(Duration::from_secs(10))
    }

    fn request(&mut self, method: &str, params: Option<Value>) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;
        let mut message = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        self.send(&message)?;
        self.recv_response(id)
    }

    fn send_notification(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let mut message = json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        self.send(&message)
    }

    fn send(&mut self, payload: &Value) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| anyhow!("stdin already closed"))?;
        let serialized = serde_json::to_string(payload)?;
        stdin.write_all(serialized.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    fn recv_response(&mut self, expected_id: i64) -> Result<Response> {
        loop {
            let value = self.recv_message()?;
            match (value.get("id").and_then(Value::as_i64), value.get("result"), value.get("error")) {
                (Some(id), Some(result), _) if id == expected_id => return Ok(Response::Result(result.clone())),
                (Some(id), _, Some(error)) if id == expected_id => return Ok(Response::Error(error.clone())),
                _ => {}
            }
        }
    }

    fn recv_message(&mut self) -> Result<Value> {
        loop {
            self.buffer.clear();
            let read = self
                .stdout
                .read_line(&mut self.buffer)
                .context("failed to read server output")?;
            if read == 0 {
                return Err(anyhow!("server closed stdout"));
            }
            let trimmed = self.buffer.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed).with_context(|| format!("invalid json from server: {trimmed}"));
        }
    }

    fn close_stdin(&mut self) {
        drop(self.stdin.take());
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Result<ExitStatus> {
        let child = self.child.as_mut().ok_or_else(|| anyhow!("child already collected"))?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                child.kill().ok();
                return Ok(child.wait()?);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for McpHarness {
    fn drop(&mut self) {
        self.close_stdin();
        if let Some(mut child) = self.child.take() {
            if !matches!(child.try_wait(), Ok(Some(_))) {
                let _ = child.kill();
            }
            let _ = child.wait();
        }
        if let Some(logs) = self
            .stderr_handle
            .take()
            .and_then(|handle| handle.join().ok())
            .filter(|logs| !logs.trim().is_empty())
        {
            eprintln!("repolens stderr:\n{logs}");
        }
    }
}

/// Decode the JSON text of the first content item of a tool result.
pub fn extract_content(result: &Value) -> Result<Value> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("tool result without text content: {result}"))?;
    Ok(serde_json::from_str(text)?)
}
