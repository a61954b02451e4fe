//! Stable exit codes for planloop CLI commands.

use crate::error::{PlanNotFoundError, WorkspaceLockedError};

/// Command succeeded.
pub const OK: i32 = 0;
/// Fatal engine error, invalid config/plan, or executor failure.
pub const FAILED: i32 = 1;
/// The requested plan (or a ready dependency) could not be found.
pub const NOT_FOUND: i32 = 2;
/// The workspace is held by another live process.
pub const LOCKED: i32 = 3;

/// Exit code for a failed command, chosen by the error kind it carries.
pub fn for_error(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<PlanNotFoundError>().is_some() {
        NOT_FOUND
    } else if err.downcast_ref::<WorkspaceLockedError>().is_some() {
        LOCKED
    } else {
        FAILED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn maps_error_kinds_through_context() {
        let err = Err::<(), _>(PlanNotFoundError {
            reference: "9".to_string(),
            detail: None,
        })
        .context("resolve plan")
        .unwrap_err();
        assert_eq!(for_error(&err), NOT_FOUND);
        assert_eq!(for_error(&anyhow::anyhow!("boom")), FAILED);
    }
}
