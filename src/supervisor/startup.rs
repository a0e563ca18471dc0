//! One-shot startup side effects

use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Run `command` through `/bin/sh -c` and wait for it
///
/// The exit code is logged and returned; it never stops startup.
pub fn run_system_command(command: &str) -> Option<i32> {
    let status = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .status();

    match status {
        Ok(status) => {
            let code = status.code();
            match code {
                Some(0) => info!("`{}` completed", command),
                Some(code) => warn!("`{}` exited with status {}", command, code),
                None => warn!("`{}` terminated by signal", command),
            }
            code
        }
        Err(e) => {
            warn!("Failed to run `{}`: {}", command, e);
            None
        }
    }
}
