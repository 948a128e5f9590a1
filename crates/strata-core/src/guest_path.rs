//! Path joining in the guest's path syntax.
//!
//! Guest paths are plain strings: a Windows guest may be driven from a Linux
//! host and vice versa, so host [`std::path::Path`] rules do not apply.

use strata_common::types::GuestOs;

/// Path separator used by the guest family.
#[must_use]
pub const fn separator(os: GuestOs) -> char {
    match os {
        GuestOs::Windows => '\\',
        GuestOs::Linux => '/',
    }
}

/// Joins `segment` onto `base` using the guest family's separator.
///
/// Trailing separators on `base` and leading separators on `segment` are
/// collapsed. An empty `base` yields `segment` unchanged.
#[must_use]
pub fn join(os: GuestOs, base: &str, segment: &str) -> String {
    if base.is_empty() {
        return segment.to_string();
    }
    let sep = separator(os);
    let is_sep = |c: char| c == sep || (os == GuestOs::Windows && c == '/');
    let head = base.trim_end_matches(is_sep);
    let tail = segment.trim_start_matches(is_sep);
    if head.is_empty() {
        // base was only separators, i.e. the guest root
        return format!("{sep}{tail}");
    }
    format!("{head}{sep}{tail}")
}
