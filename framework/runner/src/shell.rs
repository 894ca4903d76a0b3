use anyhow::Context;
use std::io::Write;
use std::process::{Command, Stdio};

/// Run a command to completion and return its stdout, failing on a non-zero exit status.
pub(crate) fn run_checked(command: &mut Command) -> anyhow::Result<String> {
    let rendered = render(command);
    log::debug!("Running: {rendered}");
    let output = command
        .output()
        .with_context(|| format!("Failed to start `{rendered}`"))?;
    if !output.status.success() {
        anyhow::bail!(
            "`{rendered}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [run_checked], with `input` written to the command's stdin.
pub(crate) fn run_with_stdin(command: &mut Command, input: &str) -> anyhow::Result<String> {
    let rendered = render(command);
    log::debug!("Running with piped input: {rendered}");
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to start `{rendered}`"))?;
    child
        .stdin
        .take()
        .context("Failed to get stdin of the child process")?
        .write_all(input.as_bytes())
        .with_context(|| format!("Failed to write input to `{rendered}`"))?;
    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for `{rendered}`"))?;
    if !output.status.success() {
        anyhow::bail!(
            "`{rendered}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn render(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
