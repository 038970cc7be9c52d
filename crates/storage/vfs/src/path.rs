//! Path handling utilities
//!
//! There is no working directory: relative paths are taken from "/".

use alloc::string::String;

use crate::{VfsError, VfsResult, MAX_FILENAME, MAX_PATH};

/// Path separator
pub const SEPARATOR: char = '/';

/// Canonical form of `path`
///
/// - Relative paths are rooted at "/", a leading "./" is dropped
/// - Runs of separators collapse to one
/// - A trailing separator is removed (except for "/" itself)
///
/// "." and ".." components elsewhere are left for the filesystem.
pub fn realpath(path: &str) -> VfsResult<String> {
    // One extra byte at most: the "/" prepended to relative paths
    if path.len() + 1 > MAX_PATH {
        return Err(VfsError::InvalidPath);
    }
    let rest = path.strip_prefix('.').filter(|r| r.starts_with(SEPARATOR));
    let rest = rest.unwrap_or(path);

    let mut out = String::with_capacity(rest.len() + 1);
    if !rest.starts_with(SEPARATOR) {
        out.push(SEPARATOR);
    }
    let mut prev_sep = false;
    for c in rest.chars() {
        if c == SEPARATOR {
            if prev_sep {
                continue;
            }
            prev_sep = true;
        } else {
            prev_sep = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with(SEPARATOR) {
        out.pop();
    }
    Ok(out)
}

/// Validate a mount point: "/" or a single absolute component
pub fn mount_point(path: &str) -> VfsResult<String> {
    if !path.starts_with(SEPARATOR) {
        return Err(VfsError::InvalidPath);
    }
    let real = realpath(path)?;
    if real[1..].contains(SEPARATOR) || real[1..].contains('\0') {
        return Err(VfsError::InvalidPath);
    }
    Ok(real)
}

/// Path below `prefix`, without a leading separator
///
/// `None` if `real` is not `prefix` itself or something under it.
pub fn strip_mount<'a>(real: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix == "/" {
        return Some(real.trim_start_matches(SEPARATOR));
    }
    let after = real.strip_prefix(prefix)?;
    if after.is_empty() {
        Some(after)
    } else {
        after.strip_prefix(SEPARATOR)
    }
}

/// Check if a file name is valid
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(SEPARATOR)
        && !name.contains('\0')
        && name.len() <= MAX_FILENAME
}
