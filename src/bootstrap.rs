//! Bootstrap — turning a freshly spawned process into a running remote
//! context.
//!
//! See spec §4.7/§4.8 and the Open Question on compiled-language
//! bootstrapping recorded in DESIGN.md. The original two-stage dance
//! (spec §9 source material) ships interpretable source text down a
//! pipe to a freshly exec'd interpreter; a compiled binary can't do
//! that, so stage two's payload here is a marshalled [`BootstrapConfig`]
//! and "the interpreter" is just this same binary re-exec'd into its
//! remote-main mode. The pipe choreography itself — fork, save the
//! original stdio on fd 100, splice a private pipe onto fd 0, exec —
//! is kept byte-for-byte.
//!
//! - `--bootstrap-stage1 <name>` ([`run_stage1`]): runs on the freshly
//!   spawned process (local fork or the far end of an SSH command). It
//!   forks again: the original process saves its stdio, replaces fd 0
//!   with a pipe, and execs itself into `--bootstrap-stage2 <name>`; the
//!   new child reads the length-prefixed zlib payload off the *original*
//!   stdin, decompresses it into the pipe, prints `OK\n`, and exits.
//! - `--bootstrap-stage2 <name>` ([`run_stage2`]): the re-exec'd image.
//!   Reads the decompressed [`BootstrapConfig`] to EOF from its stdin
//!   (now the pipe from stage one's sibling), then reaps that sibling
//!   and restores the saved stdio from fd 100.

use std::ffi::CString;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::process::{Child, Command, Stdio};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use nix::libc;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{execv, fork, pipe, ForkResult, Pid};
use serde::{Deserialize, Serialize};

/// Bootstrap-time failures. Always fatal to the connection attempt;
/// there is no partial-bootstrap recovery (spec §7).
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("fork/exec plumbing failed: {0}")]
    Posix(#[from] nix::Error),

    #[error("bootstrap protocol violation: {0}")]
    Protocol(String),

    #[error("child did not acknowledge bootstrap (expected OK)")]
    NoAck,
}

/// Stage two's payload: what a child context needs to dial back into
/// the controller (spec §4.5 `Context` fields, minus `name`/`hostname`
/// which are only meaningful to the controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub context_name: String,
    pub parent_addr: SocketAddr,
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
}

/// Build the argv a local fork/exec should run (spec §4.7
/// `LocalStream.GetBootCommand`): this same binary, in stage-one mode.
pub fn local_boot_argv(context_name: &str) -> Result<Vec<String>, BootstrapError> {
    let exe = std::env::current_exe()?;
    Ok(vec![
        exe.to_string_lossy().into_owned(),
        "--bootstrap-stage1".into(),
        context_name.into(),
    ])
}

/// Build the argv to hand to `ssh` (spec §4.7 `SSHStream.GetBootCommand`):
/// `ssh [-l user] host <quoted remote boot command>`. `remote_binary` is
/// the path to this runtime's binary on the remote host — provisioning
/// it there is out of scope (spec Non-goals on SSH/process-launching
/// mechanics).
pub fn ssh_boot_argv(
    ssh_path: &str,
    hostname: &str,
    username: Option<&str>,
    remote_binary: &str,
    context_name: &str,
) -> Vec<String> {
    let mut argv = vec![ssh_path.to_string()];
    if let Some(user) = username {
        argv.push("-l".into());
        argv.push(user.into());
    }
    argv.push(hostname.into());

    let inner = [remote_binary, "--bootstrap-stage1", context_name];
    argv.extend(inner.iter().map(|a| shell_words::quote(a).into_owned()));
    argv
}

/// Spawn `argv`, send the bootstrap payload down its stdin, and wait for
/// its `OK\n` acknowledgement (spec §4.7 `LocalStream.Connect`). Returns
/// the still-running child; its eventual fate is to exec into
/// `--bootstrap-stage2` and connect back to `config.parent_addr` on a
/// fresh socket — the controller does not keep this pipe open.
pub fn spawn_and_bootstrap(
    argv: &[String],
    config: &BootstrapConfig,
) -> Result<Child, BootstrapError> {
    let mut child = Command::new(&argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()?;

    let payload = rmp_serde::to_vec_named(config)
        .map_err(|e| BootstrapError::Protocol(format!("encode bootstrap config: {e}")))?;
    let compressed = zlib_compress(&payload)?;

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        write!(stdin, "{}\n", compressed.len())?;
        stdin.write_all(&compressed)?;
    }

    let mut ack = [0u8; 3];
    {
        let stdout = child.stdout.as_mut().expect("piped stdout");
        stdout.read_exact(&mut ack)?;
    }
    if &ack != b"OK\n" {
        return Err(BootstrapError::NoAck);
    }

    Ok(child)
}

/// Run stage one in the current process: fork, save stdio, splice a
/// pipe onto fd 0, and exec into `--bootstrap-stage2`. Only returns on
/// error — success replaces this process's image (spec §9 source's
/// `_FirstStage`).
///
/// # Safety
///
/// Uses `fork()`. This function is meant to be the entire content of
/// the process's `main()` when invoked as `--bootstrap-stage1`, before
/// any other threads exist.
pub fn run_stage1(context_name: &str) -> Result<(), BootstrapError> {
    let (r, w) = pipe()?;

    match unsafe { fork() }? {
        ForkResult::Parent { .. } => {
            // Save the original stdio (the bootstrap pipe/ssh session) on
            // fd 100 so stage two can restore it once it no longer needs
            // the private pipe for the config payload.
            if unsafe { libc::dup2(0, 100) } < 0 {
                return Err(BootstrapError::Io(io::Error::last_os_error()));
            }
            if unsafe { libc::dup2(r.as_raw_fd(), 0) } < 0 {
                return Err(BootstrapError::Io(io::Error::last_os_error()));
            }
            drop(r);
            drop(w);

            let exe = std::env::current_exe()?;
            let exe_c = CString::new(exe.as_os_str().as_bytes())
                .map_err(|_| BootstrapError::Protocol("NUL byte in executable path".into()))?;
            let stage2_flag = CString::new("--bootstrap-stage2").unwrap();
            let name_c = CString::new(context_name)
                .map_err(|_| BootstrapError::Protocol("NUL byte in context name".into()))?;

            execv(&exe_c, &[exe_c.clone(), stage2_flag, name_c])?;
            unreachable!("execv only returns on error, already propagated above");
        }
        ForkResult::Child => {
            drop(r);
            let result = (|| -> Result<(), BootstrapError> {
                let compressed = read_length_prefixed(&mut io::stdin())?;
                let decompressed = zlib_decompress(&compressed)?;
                let mut w = std::fs::File::from(w);
                w.write_all(&decompressed)?;
                Ok(())
            })();

            match result {
                Ok(()) => {
                    print!("OK\n");
                    let _ = io::stdout().flush();
                    std::process::exit(0);
                }
                Err(_) => std::process::exit(1),
            }
        }
    }
}

/// Run stage two: read the [`BootstrapConfig`] from stdin (the pipe
/// spliced on by stage one's parent branch) to EOF, reap the stage-one
/// sibling, and restore the original stdio from fd 100 (spec §4.8
/// "Reap the stage-one forker…").
pub fn run_stage2() -> Result<BootstrapConfig, BootstrapError> {
    let mut buf = Vec::new();
    io::stdin().read_to_end(&mut buf)?;
    let config: BootstrapConfig = rmp_serde::from_slice(&buf)
        .map_err(|e| BootstrapError::Protocol(format!("decode bootstrap config: {e}")))?;

    let _ = waitpid(None::<Pid>, Some(WaitPidFlag::empty()));
    if unsafe { libc::dup2(100, 0) } < 0 {
        return Err(BootstrapError::Io(io::Error::last_os_error()));
    }
    let _ = nix::unistd::close(100);

    Ok(config)
}

fn read_length_prefixed(input: &mut impl Read) -> Result<Vec<u8>, BootstrapError> {
    let mut len_line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        input.read_exact(&mut byte)?;
        if byte[0] == b'\n' {
            break;
        }
        len_line.push(byte[0]);
    }
    let len: usize = std::str::from_utf8(&len_line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| BootstrapError::Protocol("malformed length prefix".into()))?;

    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    Ok(payload)
}

fn zlib_compress(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, BootstrapError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| BootstrapError::Protocol(format!("zlib decompress failed: {e}")))?;
    Ok(out)
}
