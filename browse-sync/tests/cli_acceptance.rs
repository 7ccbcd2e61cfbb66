use std::ffi::OsString;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::thread;

use serde_json::{json, Value};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_config,
            xdg_state,
        }
    }

    /// Point the CLI at `http://127.0.0.1:{port}/graphql`
    fn with_coordinator_port(self, port: u16) -> Self {
        self.write_config(&format!(
            "[coordinator]\n\
             http_url = \"http://127.0.0.1:{port}/graphql\"\n\
             ws_url = \"ws://127.0.0.1:{port}/graphql\"\n\
             timeout_secs = 5\n"
        ));
        self
    }

    fn write_config(&self, content: &str) {
        let dir = self.xdg_config.join("browse-sync");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), content).expect("failed to write config");
    }
}

/// A port nothing listens on
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    listener.local_addr().expect("no local addr").port()
}

/// Answer every HTTP request with 200 and `body`, on a background thread.
fn serve_http(body: Value) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let port = listener.local_addr().expect("no local addr").port();
    let body = body.to_string();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

            let mut content_length = 0;
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).unwrap_or(0) == 0 {
                    break;
                }
                let lower = line.to_ascii_lowercase();
                if let Some(value) = lower.strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
                if line == "\r\n" {
                    break;
                }
            }
            let mut request_body = vec![0; content_length];
            let _ = reader.read_exact(&mut request_body);

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });

    port
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("browse-sync"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute browse-sync: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "browse-sync {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn status_reports_unreachable_coordinator() {
    let env = CliTestEnv::new().with_coordinator_port(closed_port());

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("browse-sync Configuration"));
    assert!(stdout.contains("API Key:         <not set>"));
    assert!(
        stdout.contains("Coordinator: unreachable"),
        "expected unreachable coordinator, got:\n{stdout}"
    );
    assert!(
        env.xdg_state.join("browse-sync").exists(),
        "log directory should be created under XDG_STATE_HOME"
    );
}

#[test]
fn status_reports_reachable_coordinator() {
    let port = serve_http(json!({}));
    let env = CliTestEnv::new().with_coordinator_port(port);

    let output = run_bin(&env, &["status"]);
    assert_success(&["status"], &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("Coordinator: reachable"),
        "expected reachable coordinator, got:\n{stdout}"
    );
}

#[test]
fn invalid_config_is_rejected() {
    let env = CliTestEnv::new();
    env.write_config("[coordinator]\nws_url = \"http://127.0.0.1:1/graphql\"\n");

    let output = run_bin(&env, &["status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to load configuration"),
        "unexpected stderr:\n{stderr}"
    );
}

#[test]
fn messages_prints_loaded_page() {
    let port = serve_http(json!({
        "data": {"session": {"messages": {
            "edges": [
                {"cursor": "c1", "node": {"id": "m1", "messageIndex": 1, "messageType": "user", "content": "fix the build"}},
                {"cursor": "c2", "node": {"id": "m2", "messageIndex": 2, "messageType": "assistant", "content": "Looking at the error now"}}
            ],
            "pageInfo": {"hasNextPage": false, "hasPreviousPage": true, "startCursor": "c1", "endCursor": "c2"},
            "totalCount": 9
        }}}
    }));
    let env = CliTestEnv::new().with_coordinator_port(port);

    let args = ["messages", "S1"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let fix = stdout.find("fix the build").expect("first message missing");
    let looking = stdout
        .find("Looking at the error now")
        .expect("second message missing");
    assert!(fix < looking, "messages out of order:\n{stdout}");
    assert!(stdout.contains("2 of 9 loaded (use --older to load more)"));
}

#[test]
fn files_reports_unknown_session() {
    let port = serve_http(json!({"data": {"session": null}}));
    let env = CliTestEnv::new().with_coordinator_port(port);

    let output = run_bin(&env, &["files", "missing"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed to load missing.fileChanges"),
        "unexpected stderr:\n{stderr}"
    );
    assert!(stderr.contains("session not found"), "unexpected stderr:\n{stderr}");
}

#[test]
fn hooks_prints_rows_and_pass_rate() {
    let port = serve_http(json!({
        "data": {"session": {"hookExecutions": {
            "edges": [
                {"cursor": "h2", "node": {"id": "h2", "hookType": "Stop", "hookName": "lint", "passed": false, "durationMs": 2400}},
                {"cursor": "h1", "node": {"id": "h1", "hookType": "Stop", "hookName": "test", "passed": true, "durationMs": 850}}
            ],
            "pageInfo": {"hasNextPage": false, "hasPreviousPage": false, "startCursor": "h2", "endCursor": "h1"},
            "totalCount": 2
        }}}
    }));
    let env = CliTestEnv::new().with_coordinator_port(port);

    let args = ["hooks", "S1"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FAIL"), "{stdout}");
    assert!(stdout.contains("850ms"), "{stdout}");
    assert!(stdout.contains("Passed: 1/2 (50%)"), "{stdout}");
}
