//! Subprocess plumbing shared by the tar, rclone, docker and psql adapters.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

const MAX_LOG_CHARS: usize = 2048;

pub fn run_command_output(cmd: &mut Command) -> Result<Output> {
    cmd.stdin(Stdio::null())
        .output()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd)))
}

pub fn run_command_capture(mut cmd: Command) -> Result<()> {
    let out = run_command_output(&mut cmd)?;
    if out.status.success() {
        return Ok(());
    }
    Err(Error::msg(format!(
        "command {} failed: {}",
        program_name(&cmd),
        command_summary(&out)
    )))
}

pub fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stderr.is_empty() {
        return sanitize_line(&stderr);
    }
    if !stdout.is_empty() {
        return sanitize_line(&stdout);
    }
    format!("status {}", out.status)
}

pub fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().to_string()
}

/// Run `cmd` with stdout redirected into `dest`. A failed run removes the
/// partial file.
pub fn run_to_file(mut cmd: Command, dest: &Path) -> Result<()> {
    let file = fs::File::create(dest)
        .map_err(|e| Error::msg(format!("failed to create {}: {e}", dest.display())))?;
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd)));
    let out = match out {
        Ok(out) => out,
        Err(e) => {
            let _ = fs::remove_file(dest);
            return Err(e);
        }
    };
    if out.status.success() {
        return Ok(());
    }
    let _ = fs::remove_file(dest);
    Err(Error::msg(format!(
        "command {} failed: {}",
        program_name(&cmd),
        command_summary(&out)
    )))
}

/// Feed `input` to the child's stdin. With a timeout the child is killed once
/// it runs past the deadline and the call fails.
pub fn run_with_input(
    mut cmd: Command,
    input: Box<dyn Read + Send>,
    timeout: Option<Duration>,
) -> Result<()> {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {:?}: {e}", cmd)))?;

    let stdin = child.stdin.take();
    let feeder = thread::spawn(move || -> std::io::Result<u64> {
        let Some(mut stdin) = stdin else {
            return Ok(0);
        };
        let mut input = input;
        let n = std::io::copy(&mut input, &mut stdin)?;
        stdin.flush()?;
        Ok(n)
    });
    let stderr = child.stderr.take();
    let collector = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut s) = stderr {
            let _ = s.read_to_string(&mut buf);
        }
        buf
    });

    let status = wait_with_deadline(&mut child, timeout);
    let fed = feeder.join();
    let stderr = collector.join().unwrap_or_default();
    let status = status.map_err(|e| e.context(program_name(&cmd)))?;

    if !status.success() {
        let detail = stderr.trim();
        return Err(Error::msg(format!(
            "command {} failed ({status}): {}",
            program_name(&cmd),
            if detail.is_empty() {
                "no output".to_string()
            } else {
                sanitize_line(detail)
            }
        )));
    }
    match fed {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(Error::msg(format!(
            "failed to stream input into {}: {e}",
            program_name(&cmd)
        ))),
        Err(_) => Err(Error::msg("stdin feeder thread panicked")),
    }
}

fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus> {
    let Some(timeout) = timeout else {
        return child
            .wait()
            .map_err(|e| Error::msg(format!("wait failed: {e}")));
    };
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {}
            Err(e) => return Err(Error::msg(format!("wait failed: {e}"))),
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::msg(format!(
                "timed out after {}s",
                timeout.as_secs()
            )));
        }
        thread::sleep(Duration::from_millis(100));
    }
}

/// Strip ANSI escape sequences and control characters so tool output cannot
/// repaint the operator's terminal.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LOG_CHARS));
    let mut chars = input.chars().peekable();
    let mut count = 0usize;
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                Some('[') => {
                    // CSI: parameters until a final byte in @..~
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                Some(']') => {
                    // OSC: until BEL or ST
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        let c = match c {
            '\t' | '\n' | '\r' => ' ',
            c if c.is_control() => continue,
            c => c,
        };
        out.push(c);
        count += 1;
        if count >= MAX_LOG_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out.trim().to_string()
}

pub fn have_bin(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
