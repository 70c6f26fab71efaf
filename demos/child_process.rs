//! Talks RPC over stdio to a spawned child process, using
//! [`meshbus::transport::stdio`]. Grounded on the teacher's child-process
//! demo (`examples/kunkunsh-kkrpc/packages/kkrpc-rs/examples/client.rs`):
//! same shape (spawn a child, wire its stdin/stdout into an `IoInterface`,
//! talk to it), generalized from kkrpc's ad hoc echo protocol to this
//! crate's tagged `Frame` wire format.
//!
//! Run with `cargo run --example child_process` (requires a `python3` on
//! PATH to play the remote end).

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use meshbus::transport::stdio::{IoInterface, StdioHub};
use meshbus::transport::CallOptions;
use meshbus::{Kwargs, RpcMessage};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};

struct ChildProcessIo {
    stdin: tokio::sync::Mutex<ChildStdin>,
    stdout: tokio::sync::Mutex<BufReader<ChildStdout>>,
}

#[async_trait]
impl IoInterface for ChildProcessIo {
    fn name(&self) -> &str {
        "child_process"
    }

    async fn read_line(&self) -> Option<String> {
        let mut line = String::new();
        let mut stdout = self.stdout.lock().await;
        match stdout.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line),
            Err(_) => None,
        }
    }

    async fn write_line(&self, mut line: String) -> std::io::Result<()> {
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.stdin.lock().await.write_all(line.as_bytes()).await
    }
}

const ECHO_SERVER_PY: &str = r#"
import json
import sys

for raw in sys.stdin:
    raw = raw.strip()
    if not raw:
        continue
    frame = json.loads(raw)
    if frame.get("kind") == "Rpc":
        response = {
            "kind": "Result",
            "return_path": frame["return_path"],
            "message": {
                "rpc_id": frame["rpc_id"],
                "result": f"echo: {frame['kwargs'].get('message', '')}",
                "error": False,
                "trace": None,
            },
        }
        print(json.dumps(response))
        sys.stdout.flush()
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut child = tokio::process::Command::new("python3")
        .arg("-c")
        .arg(ECHO_SERVER_PY)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let io = Arc::new(ChildProcessIo {
        stdin: tokio::sync::Mutex::new(stdin),
        stdout: tokio::sync::Mutex::new(BufReader::new(stdout)),
    });

    let hub = StdioHub::new(io);
    let rpc_transport = hub.rpc_transport();
    let result_transport = hub.result_transport();

    let mut kwargs = Kwargs::new();
    kwargs.insert("message".into(), json!("hello from the rust client"));
    let mut msg = RpcMessage::new("echo.api", "echo", kwargs);
    let return_path = result_transport.get_return_path(&msg).await?;
    msg.return_path = Some(return_path.clone());

    rpc_transport.call_rpc(&msg, &CallOptions::default()).await?;
    let result = result_transport.receive_result(&msg, &return_path, &CallOptions::default()).await?;
    println!("child process replied: {}", result.result);

    child.kill().await?;
    Ok(())
}
