//! Spawns build commands using posix_spawn, with stdout and stderr combined
//! into a single pipe. We don't use Rust's process spawning because we want
//! both streams interleaved the way a terminal would see them, which the
//! std::process API cannot express.

use std::io::Read;
use std::os::fd::FromRawFd;
use std::os::unix::process::ExitStatusExt;

extern "C" {
    static environ: *mut *mut libc::c_char;
}

fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret != 0 {
        let err_str = unsafe { std::ffi::CStr::from_ptr(libc::strerror(ret)) };
        anyhow::bail!("{}: {}", func, err_str.to_str().unwrap_or("unknown error"));
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Run an argv, returning its exit code (or 128+signal) and combined output.
pub fn run_command(argv: &[String]) -> anyhow::Result<(i32, Vec<u8>)> {
    if argv.is_empty() {
        anyhow::bail!("empty command line");
    }

    let cstrs: Vec<std::ffi::CString> = argv
        .iter()
        .map(|arg| std::ffi::CString::new(arg.as_str()))
        .collect::<Result<_, _>>()?;
    let mut argv_ptrs: Vec<*const libc::c_char> = cstrs.iter().map(|s| s.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let (pid, mut pipe) = unsafe {
        let mut pipe: [libc::c_int; 2] = std::mem::zeroed();
        if libc::pipe(&mut pipe as *mut i32) < 0 {
            anyhow::bail!("pipe: {}", std::io::Error::last_os_error());
        }

        let mut actions = PosixSpawnFileActions::new()?;
        // stdout/stderr => pipe
        actions.adddup2(pipe[1], 1)?;
        actions.adddup2(pipe[1], 2)?;
        // close pipe in child
        actions.addclose(pipe[0])?;
        actions.addclose(pipe[1])?;

        let mut pid: libc::pid_t = 0;
        // posix_spawnp resolves the executable through PATH.
        check_posix(
            "posix_spawnp",
            libc::posix_spawnp(
                &mut pid,
                cstrs[0].as_ptr(),
                actions.as_ptr(),
                std::ptr::null(),
                argv_ptrs.as_ptr() as *const *mut libc::c_char,
                environ as *const *mut libc::c_char,
            ),
        )?;

        if libc::close(pipe[1]) < 0 {
            anyhow::bail!("close: {}", std::io::Error::last_os_error());
        }

        (pid, std::fs::File::from_raw_fd(pipe[0]))
    };

    let mut output = Vec::new();
    pipe.read_to_end(&mut output)?;

    let status = unsafe {
        let mut status: i32 = 0;
        if libc::waitpid(pid, &mut status, 0) < 0 {
            anyhow::bail!("waitpid: {}", std::io::Error::last_os_error());
        }
        std::process::ExitStatus::from_raw(status)
    };

    let code = match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(sig)) => 128 + sig,
        (None, None) => 1,
    };
    Ok((code, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_both_streams() {
        let (code, output) = run_command(&[
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo out && echo err >&2".to_string(),
        ])
        .unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
    }

    #[test]
    fn reports_exit_codes() {
        let (code, _) = run_command(&[
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exit 3".to_string(),
        ])
        .unwrap();
        assert_eq!(code, 3);
    }
}
