use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
#[error("command {command:?} failed: {message}")]
pub struct CommandError {
    command: String,
    message: String,
}

/// Runs a system command, folding a non-zero exit into an error carrying its
/// stderr.
pub(crate) async fn run(program: &str, args: &[&str]) -> Result<(), CommandError> {
    let command = format!("{program} {}", args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|error| CommandError {
            command: command.clone(),
            message: error.to_string(),
        })?;

    if !output.status.success() {
        return Err(CommandError {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}
