//! Device table
//!
//! A devtab lists devices to create at boot, one `name type opts` entry
//! each. Entries are separated by `|` or newlines; blank entries and
//! entries starting with `#` are skipped. `opts` is the rest of the entry
//! and may be empty.
//!
//! ```text
//! ram0 ram {"size": 65536} | p0 part {"dev": "ram0", "size": 32768}
//! ```

use log::error;

use flashvfs_dev::{DevError, DevOptions, DevResult};

use crate::DeviceRegistry;

/// One parsed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevtabEntry<'a> {
    pub name: &'a str,
    pub type_name: &'a str,
    pub opts: &'a str,
}

fn next_field(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start_matches([' ', '\t']);
    if s.is_empty() {
        return None;
    }
    match s.find([' ', '\t']) {
        Some(i) => Some((&s[..i], &s[i..])),
        None => Some((s, "")),
    }
}

/// Split one entry into fields
pub fn parse_entry(entry: &str) -> Option<DevtabEntry<'_>> {
    let (name, rest) = next_field(entry)?;
    let (type_name, rest) = next_field(rest)?;
    Some(DevtabEntry {
        name,
        type_name,
        opts: rest.trim(),
    })
}

/// Non-blank, non-comment entries of `text`
pub fn entries(text: &str) -> impl Iterator<Item = &str> {
    text.split(['|', '\r', '\n'])
        .map(str::trim)
        .filter(|e| !e.is_empty() && !e.starts_with('#'))
}

impl DeviceRegistry {
    /// Create and register every device in `text`
    ///
    /// Stops at the first entry that fails; devices created before it stay
    /// registered.
    pub fn process_devtab(&self, text: &str) -> DevResult<()> {
        for e in entries(text) {
            let Some(entry) = parse_entry(e) else {
                error!("invalid devtab entry '{}'", e);
                return Err(DevError::InvalidArgument);
            };
            let opts = DevOptions::parse(entry.opts)?;
            self.create_and_register(entry.type_name, &opts, entry.name)?;
        }
        Ok(())
    }
}
