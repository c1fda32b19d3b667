//! The runk binary on a controlling terminal: the sandboxed process must be
//! able to read from it.

use nix::pty::openpty;
use nix::unistd::setsid;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
    None
}

/// Run runk as a session leader whose controlling terminal is a fresh pty,
/// type `input` into it and collect output until `expect` shows up.
fn run_on_terminal(args: &[&str], input: &str, expect: &str) -> (Option<String>, Option<ExitStatus>) {
    let pty = openpty(None, None).unwrap();
    let slave = pty.slave;

    let mut cmd = Command::new(env!("CARGO_BIN_EXE_runk"));
    cmd.args(args)
        .stdin(Stdio::from(slave.try_clone().unwrap()))
        .stdout(Stdio::from(slave.try_clone().unwrap()))
        .stderr(Stdio::from(slave));
    // SAFETY: setsid and ioctl are async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            setsid()?;
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let mut child = cmd.spawn().unwrap();
    drop(cmd);

    let mut master = File::from(pty.master);
    let mut reader = master.try_clone().unwrap();
    let expect = expect.to_string();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut seen = String::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = reader.read(&mut buf) {
            if n == 0 {
                break;
            }
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            if seen.contains(&expect) {
                let _ = tx.send(seen);
                return;
            }
        }
    });

    master.write_all(input.as_bytes()).unwrap();
    let output = rx.recv_timeout(TIMEOUT).ok();
    let status = wait_with_timeout(&mut child, TIMEOUT);
    (output, status)
}

#[test]
fn test_sandboxed_process_reads_controlling_terminal() {
    let root = tempfile::tempdir().unwrap();
    let script = root.path().join("bin/ask");
    fs::create_dir_all(script.parent().unwrap()).unwrap();
    fs::write(&script, "#!/bin/sh\nread answer\necho \"got:$answer\"\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let mounts = root.path().to_str().unwrap();

    for args in [
        vec!["--tty", "--mounts", mounts, "--", "ask"],
        vec!["--mounts", mounts, "--", "ask"],
    ] {
        let (output, status) = run_on_terminal(&args, "hello\n", "got:hello");
        assert!(output.is_some(), "no answer from sandbox with {:?}", args);
        let status = status.unwrap_or_else(|| panic!("runk hung with {:?}", args));
        assert!(status.success(), "runk {:?} exited with {}", args, status);
    }
}
