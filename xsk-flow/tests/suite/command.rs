//! Privilege plumbing for the end-to-end binaries: running `ip` and
//! `setcap` through sudo, and re-executing the test once with the
//! capabilities it needs.

use std::env;
use std::io::{Error, Result};
use std::process::Command;

const REEXEC_GUARD: &str = "XSKFLOW_TEST_REEXEC";

/// Runs one command under sudo. Fails with the command's stderr when it
/// exits nonzero.
pub fn sudo(args: &[&str]) -> Result<()> {
    let output = Command::new("sudo").args(args).output()?;
    if !output.status.success() {
        return Err(Error::other(format!(
            "sudo {} exited with {}: {}",
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    log::debug!("sudo {}", args.join(" "));
    Ok(())
}

/// Initialises logging and makes sure the process holds `required`.
///
/// When a capability is missing the binary is `setcap`ed through sudo
/// and re-executed; the guard variable keeps that from looping, so a
/// second miss surfaces as an error, which the callers treat as "skip
/// this test".
pub fn init_with_caps(required: &[caps::Capability]) -> Result<()> {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .try_init();
    if required.is_empty() || holds(required)? {
        return Ok(());
    }
    if env::var_os(REEXEC_GUARD).is_some() {
        return Err(Error::other("capabilities still missing after re-exec"));
    }

    let exe = env::current_exe()?;
    let exe_path = exe
        .to_str()
        .ok_or_else(|| Error::other("test binary path is not valid UTF-8"))?;
    let grant = required
        .iter()
        .map(|cap| cap.to_string().to_lowercase())
        .collect::<Vec<_>>()
        .join(",");
    sudo(&["setcap", &format!("{grant}+eip"), exe_path])?;

    env::set_var(REEXEC_GUARD, "1");
    log::info!("re-executing with {grant}");
    let args: Vec<String> = env::args().collect();
    // execvp replaces the process and only returns on failure
    Err(Error::other(exec::execvp(&exe, &args).to_string()))
}

fn holds(required: &[caps::Capability]) -> Result<bool> {
    let effective =
        caps::read(None, caps::CapSet::Effective).map_err(|e| Error::other(e.to_string()))?;
    Ok(required.iter().all(|cap| effective.contains(cap)))
}
