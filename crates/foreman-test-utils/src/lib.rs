//! Shared test utilities for foreman integration tests.
//!
//! Provides fake agent executables: small POSIX shell scripts that speak
//! just enough of the codex app-server and ACP line protocols to drive
//! sessions, turns, approvals and interrupts end to end. Each fake appends
//! a line to its log on every `initialize`, so tests can count handshakes,
//! and logs how its stray requests were answered in [`TurnMode::Stray`].
//!
//! A workspace containing a `.fake-slow` file delays the handshake by the
//! number of seconds written in it; the script runs with the workspace as
//! its working directory.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// What the fake does after acknowledging a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnMode {
    /// Emit a few events and complete the turn.
    Complete,
    /// Emit a few events, then wait for an interrupt or cancel.
    Hold,
    /// Ask for approval and complete once it is answered.
    Approval,
    /// Exit with status 7 instead of answering the turn request.
    Crash,
    /// Start the turn, emit a delta, then exit with status 7.
    Die,
    /// Answer the turn request with an error.
    Reject,
    /// Send server requests while creating a conversation, before any turn
    /// exists, and log the answers.
    Stray,
}

impl TurnMode {
    fn as_str(self) -> &'static str {
        match self {
            TurnMode::Complete => "complete",
            TurnMode::Hold => "hold",
            TurnMode::Approval => "approval",
            TurnMode::Crash => "crash",
            TurnMode::Die => "die",
            TurnMode::Reject => "reject",
            TurnMode::Stray => "stray",
        }
    }
}

/// A fake agent script living in its own temporary directory.
pub struct FakeAgent {
    dir: TempDir,
    program: PathBuf,
    log: PathBuf,
}

impl std::fmt::Debug for FakeAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeAgent")
            .field("program", &self.program)
            .finish()
    }
}

impl FakeAgent {
    /// A fake `codex app-server`.
    pub fn codex(mode: TurnMode) -> Self {
        Self::write("fake-codex", CODEX_SCRIPT, mode)
    }

    /// A fake `opencode acp`.
    pub fn acp(mode: TurnMode) -> Self {
        Self::write("fake-acp", ACP_SCRIPT, mode)
    }

    fn write(name: &str, template: &str, mode: TurnMode) -> Self {
        let dir = TempDir::new().expect("failed to create fake agent dir");
        let log = dir.path().join("handshakes.log");
        let program = dir.path().join(name);
        let script = template
            .replace("@LOG@", &log.display().to_string())
            .replace("@MODE@", mode.as_str());
        fs::write(&program, script).expect("failed to write fake agent");
        make_executable(&program);
        Self { dir, program, log }
    }

    /// Absolute path of the executable.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Program path as a string, for launch specs.
    pub fn program_str(&self) -> String {
        self.program.display().to_string()
    }

    /// How many `initialize` requests this fake has answered, across all of
    /// its processes.
    pub fn handshakes(&self) -> usize {
        fs::read_to_string(&self.log)
            .map(|log| log.lines().filter(|l| *l == "initialize").count())
            .unwrap_or(0)
    }

    /// Everything the fake logged, in order.
    pub fn log_lines(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|log| log.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Create a fresh workspace directory.
pub fn workspace() -> TempDir {
    TempDir::new().expect("failed to create workspace dir")
}

/// Make handshakes in `workspace` take `seconds`.
pub fn make_slow(workspace: &Path, seconds: u32) {
    fs::write(workspace.join(".fake-slow"), seconds.to_string()).expect("failed to mark slow");
}

#[cfg(unix)]
fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("failed to chmod fake agent");
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) {}

const CODEX_SCRIPT: &str = r#"#!/bin/sh
LOG='@LOG@'
MODE='@MODE@'
reply() { printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$1" "$2"; }
notify() { printf '{"jsonrpc":"2.0","method":"%s","params":%s}\n' "$1" "$2"; }
finish() { notify turn/completed "{\"threadId\":\"thr_1\",\"turn\":{\"id\":\"turn_1\",\"status\":\"$1\"}}"; }
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      echo initialize >> "$LOG"
      if [ -f .fake-slow ]; then sleep "$(cat .fake-slow)"; fi
      reply "$id" '{"userAgent":"fake-codex/0.0.0"}' ;;
    *'"method":"initialized"'*) ;;
    *'"method":"model/list"'*)
      reply "$id" '{"data":[{"id":"m1","model":"gpt-fake","displayName":"GPT Fake","isDefault":true}],"nextCursor":null}' ;;
    *'"method":"thread/start"'*)
      if [ "$MODE" = stray ]; then
        printf '%s\n' '{"jsonrpc":"2.0","id":"srv-9","method":"item/commandExecution/requestApproval","params":{"threadId":"thr_1","itemId":"cmd_9","command":"make deploy"}}'
        printf '%s\n' '{"jsonrpc":"2.0","id":"srv-8","method":"item/tool/call","params":{"threadId":"thr_1"}}'
      fi
      reply "$id" '{"thread":{"id":"thr_1"}}' ;;
    *'"method":"thread/list"'*)
      reply "$id" '{"data":[{"id":"thr_1","preview":"hello","updatedAt":1700000000}],"nextCursor":"page-2"}' ;;
    *'"method":"thread/resume"'*) reply "$id" '{"thread":{"id":"thr_1"}}' ;;
    *'"method":"turn/start"'*|*'"method":"review/start"'*)
      if [ "$MODE" = crash ]; then exit 7; fi
      if [ "$MODE" = reject ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32600,"message":"turn refused"}}\n' "$id"
        continue
      fi
      reply "$id" '{"turn":{"id":"turn_1","status":"inProgress"}}'
      notify turn/started '{"threadId":"thr_1","turn":{"id":"turn_1","status":"inProgress"}}'
      notify item/agentMessage/delta '{"threadId":"thr_1","turnId":"turn_1","itemId":"msg_1","delta":"Hello"}'
      notify vendor/sparkle '{"threadId":"thr_1","turnId":"turn_1","glitter":3}'
      notify item/agentMessage/delta '{"threadId":"thr_2","turnId":"turn_9","itemId":"x","delta":"not ours"}'
      case "$MODE" in
        complete) finish completed ;;
        approval)
          printf '%s\n' '{"jsonrpc":"2.0","id":"srv-1","method":"item/commandExecution/requestApproval","params":{"threadId":"thr_1","turnId":"turn_1","itemId":"cmd_1","command":"rm -rf /"}}' ;;
        die) exit 7 ;;
      esac ;;
    *'"id":"srv-9"'*)
      decision=$(printf '%s\n' "$line" | sed -n 's/.*"decision":"\([a-z]*\)".*/\1/p')
      echo "stray:$decision" >> "$LOG" ;;
    *'"id":"srv-8"'*)
      code=$(printf '%s\n' "$line" | sed -n 's/.*"code":\(-*[0-9]*\).*/\1/p')
      echo "stray-error:$code" >> "$LOG" ;;
    *'"id":"srv-1"'*)
      decision=$(printf '%s\n' "$line" | sed -n 's/.*"decision":"\([a-z]*\)".*/\1/p')
      notify item/completed "{\"threadId\":\"thr_1\",\"turnId\":\"turn_1\",\"item\":{\"type\":\"commandExecution\",\"id\":\"cmd_1\",\"decision\":\"$decision\"}}"
      finish completed ;;
    *'"method":"turn/interrupt"'*)
      reply "$id" '{}'
      finish interrupted ;;
    *'"method":"exit/now"'*) exit 3 ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"unknown method"}}\n' "$id"
      fi ;;
  esac
done
"#;

const ACP_SCRIPT: &str = r#"#!/bin/sh
LOG='@LOG@'
MODE='@MODE@'
prompt_id=''
reply() { printf '{"jsonrpc":"2.0","id":%s,"result":%s}\n' "$1" "$2"; }
notify() { printf '{"jsonrpc":"2.0","method":"%s","params":%s}\n' "$1" "$2"; }
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      echo initialize >> "$LOG"
      if [ -f .fake-slow ]; then sleep "$(cat .fake-slow)"; fi
      reply "$id" '{"protocolVersion":1,"agentCapabilities":{"loadSession":true},"authMethods":[]}' ;;
    *'"method":"session/new"'*)
      if [ "$MODE" = stray ]; then
        printf '%s\n' '{"jsonrpc":"2.0","id":"perm-9","method":"session/request_permission","params":{"sessionId":"ses_1","toolCall":{"toolCallId":"call_9","title":"Push","kind":"execute"},"options":[{"optionId":"yes","name":"Allow","kind":"allow_once"},{"optionId":"no","name":"Reject","kind":"reject_once"}]}}'
      fi
      reply "$id" '{"sessionId":"ses_1"}' ;;
    *'"method":"session/load"'*) reply "$id" 'null' ;;
    *'"method":"session/prompt"'*)
      if [ "$MODE" = crash ]; then exit 7; fi
      if [ "$MODE" = reject ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32002,"message":"session not found"}}\n' "$id"
        continue
      fi
      prompt_id=$id
      notify session/update '{"sessionId":"ses_1","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"Hi"}}}'
      notify session/update '{"sessionId":"ses_1","update":{"sessionUpdate":"tool_call","toolCallId":"call_1","title":"Run ls","kind":"execute","status":"pending"}}'
      case "$MODE" in
        complete) reply "$prompt_id" '{"stopReason":"end_turn"}' ;;
        approval)
          printf '%s\n' '{"jsonrpc":"2.0","id":"perm-1","method":"session/request_permission","params":{"sessionId":"ses_1","toolCall":{"toolCallId":"call_1","title":"Run ls","kind":"execute"},"options":[{"optionId":"yes","name":"Allow","kind":"allow_once"},{"optionId":"no","name":"Reject","kind":"reject_once"}]}}' ;;
        die) exit 7 ;;
      esac ;;
    *'"id":"perm-9"'*)
      choice=$(printf '%s\n' "$line" | sed -n 's/.*"optionId":"\([a-z]*\)".*/\1/p')
      echo "stray:$choice" >> "$LOG" ;;
    *'"id":"perm-1"'*)
      choice=$(printf '%s\n' "$line" | sed -n 's/.*"optionId":"\([a-z]*\)".*/\1/p')
      notify session/update "{\"sessionId\":\"ses_1\",\"update\":{\"sessionUpdate\":\"tool_call_update\",\"toolCallId\":\"call_1\",\"status\":\"completed\",\"choice\":\"$choice\"}}"
      reply "$prompt_id" '{"stopReason":"end_turn"}' ;;
    *'"method":"session/cancel"'*)
      if [ -n "$prompt_id" ]; then reply "$prompt_id" '{"stopReason":"cancelled"}'; fi ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"unknown method"}}\n' "$id"
      fi ;;
  esac
done
"#;
