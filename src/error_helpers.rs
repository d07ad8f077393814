//! Error helper functions for creating actionable error messages

use std::io;
use std::path::Path;

/// Check if an IO error is a permission denied error
pub fn is_permission_denied(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::PermissionDenied
}

/// Check if an IO error is a "not found" error
pub fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// Create an enhanced error message for an evaluator that cannot be launched
pub fn spawn_error(evaluator: &Path, underlying_err: &io::Error) -> String {
    if is_not_found(underlying_err) {
        format!(
            "Evaluator not found: '{}'\n\n\
             Possible fixes:\n\
             1. Install Perl 5.8 or newer and make sure it is on PATH\n\
             2. Point rexhibit at it: set [evaluator] path in ~/.rexhibit/config.toml\n\
             3. Or pass --evaluator /path/to/perl",
            evaluator.display()
        )
    } else if is_permission_denied(underlying_err) {
        format!(
            "Permission denied when launching '{}'\n\n\
             Possible fixes:\n\
             1. Check the file is executable: ls -l '{}'\n\
             2. Make it executable: chmod u+x '{}'",
            evaluator.display(),
            evaluator.display(),
            evaluator.display()
        )
    } else {
        format!(
            "Failed to launch '{}'\n\n\
             Underlying error: {}",
            evaluator.display(),
            underlying_err
        )
    }
}

/// Create an enhanced error message for file permission issues
pub fn permission_error(path: &Path, operation: &str) -> String {
    format!(
        "Permission denied when {} '{}'\n\n\
         Possible fixes:\n\
         1. Check file permissions: ls -l '{}'\n\
         2. Pass the text with --text or on stdin instead",
        operation,
        path.display(),
        path.display()
    )
}

/// Create an enhanced error message for file not found issues
pub fn not_found_error(path: &Path, context: &str) -> String {
    format!(
        "File not found: '{}'\n\n\
         Context: {}\n\n\
         Possible fixes:\n\
         1. Check the file path is correct\n\
         2. Use an absolute path if the relative path is ambiguous",
        path.display(),
        context
    )
}

/// Create an enhanced error message for directory creation failures
pub fn dir_create_error(path: &Path, underlying_err: &io::Error) -> String {
    let base = format!("Failed to create directory: '{}'", path.display());
    let parent = path
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string());

    if is_permission_denied(underlying_err) {
        format!(
            "{}\n\n\
             Cause: Permission denied\n\n\
             Possible fixes:\n\
             1. Check write permissions on the parent directory: ls -la '{}'\n\
             2. Try creating it manually: mkdir -p '{}'",
            base,
            parent,
            path.display()
        )
    } else {
        format!(
            "{}\n\n\
             Underlying error: {}",
            base, underlying_err
        )
    }
}
