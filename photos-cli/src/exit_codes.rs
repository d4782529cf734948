//! Exit codes following sysexits.h conventions.
//!
//! Scripts driving the CLI can tell a rejected request from an unavailable
//! store without parsing messages.

use photos_core::PhotoError;

use crate::utils::LoadFailed;

pub const SUCCESS: i32 = 0;

/// General error (catch-all).
pub const GENERAL_ERROR: i32 = 1;

/// Rejected input: validation, unknown photo, failed download.
/// Maps to EX_DATAERR from sysexits.h.
pub const DATA_ERROR: i32 = 65;

/// Store or coordinator unavailable.
/// Maps to EX_UNAVAILABLE from sysexits.h.
pub const UNAVAILABLE: i32 = 69;

/// Identity integrity problem.
/// Maps to EX_SOFTWARE from sysexits.h.
pub const INTEGRITY_ERROR: i32 = 70;

/// Bitmap artifact could not be written.
/// Maps to EX_IOERR from sysexits.h.
pub const IO_ERROR: i32 = 74;

/// Photo not ready yet.
/// Maps to EX_TEMPFAIL from sysexits.h.
pub const TEMP_FAILURE: i32 = 75;

/// Represents an exit code with optional error context.
pub struct ExitCode {
    pub code: i32,
    pub message: Option<String>,
}

impl ExitCode {
    pub const fn success() -> Self {
        Self {
            code: SUCCESS,
            message: None,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let code = if let Some(failed) = err.downcast_ref::<LoadFailed>() {
            if failed.save_failure {
                IO_ERROR
            } else {
                DATA_ERROR
            }
        } else if let Some(e) = err.chain().find_map(|e| e.downcast_ref::<PhotoError>()) {
            classify(e)
        } else {
            GENERAL_ERROR
        };

        Self {
            code,
            message: Some(format!("{err:#}")),
        }
    }
}

fn classify(err: &PhotoError) -> i32 {
    match err {
        PhotoError::Validation(_) | PhotoError::NotFound(_) => DATA_ERROR,
        PhotoError::NotReady(_) => TEMP_FAILURE,
        PhotoError::Integrity(_) => INTEGRITY_ERROR,
        PhotoError::Persistence(_) | PhotoError::Bootstrap(_) | PhotoError::Shutdown => {
            UNAVAILABLE
        }
    }
}
