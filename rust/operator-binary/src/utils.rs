use std::fmt::Write as _;

/// Joins an error with all of its sources, as `"error: source 1: root error"`.
///
/// Used wherever an error ends up in a status field or an event, where only a single line fits.
pub fn error_full_message(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::error_full_message;

    #[test]
    fn error_messages() {
        assert_eq!(
            error_full_message(anyhow::anyhow!("deployment not ready").as_ref()),
            "deployment not ready"
        );
        assert_eq!(
            error_full_message(
                anyhow::anyhow!("connection refused")
                    .context("failed to update Deployment")
                    .context("failed to deploy operand")
                    .as_ref()
            ),
            "failed to deploy operand: failed to update Deployment: connection refused"
        );
    }
}
