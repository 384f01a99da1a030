//! Interface name and label validation.

/// Maximum interface name length (including null terminator).
pub const IFNAMSIZ: usize = 16;

/// Check that `name` can be used as an interface name or address label.
///
/// Labels share the kernel's interface name rules: non-empty, at most
/// 15 bytes, no `/`, no NUL, no whitespace, and not `.` or `..`.
pub fn is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() >= IFNAMSIZ {
        return false;
    }

    if name == "." || name == ".." {
        return false;
    }

    !name
        .chars()
        .any(|c| c == '/' || c == '\0' || c.is_whitespace())
}
