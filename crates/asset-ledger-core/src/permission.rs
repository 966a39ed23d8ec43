use crate::LedgerError;

/// Single capability check used by every mutation that is restricted to one
/// identity.
///
/// # Errors
/// Returns [`LedgerError::Unauthorized`] when `acting` is not `required`.
pub fn authorize(acting: &str, required: &str) -> Result<(), LedgerError> {
    if acting == required {
        return Ok(());
    }

    Err(LedgerError::Unauthorized(format!("{acting} is not allowed to act here, {required} is")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_identities_are_authorized() {
        assert_eq!(authorize("org-a", "org-a"), Ok(()));
    }

    #[test]
    fn other_identity_is_rejected() {
        assert!(matches!(
            authorize("org-b", "org-a"),
            Err(LedgerError::Unauthorized(message)) if message.starts_with("org-b")
        ));
    }
}
