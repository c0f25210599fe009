//! Backend-agnostic path algebra shared by every storage adapter and by the
//! admission logic of the coordinator.

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Joins path parts with `/`.
///
/// Redundant separators collapse, `.` segments disappear and a leading
/// separator on a later part stays relative to the running join. Only a
/// leading separator on the first part makes the result absolute.
pub fn join_path(parts: &[&str]) -> String {
    let absolute = parts
        .first()
        .and_then(|first| first.chars().next())
        .is_some_and(is_separator);

    let segments: Vec<&str> = parts
        .iter()
        .flat_map(|part| part.split(is_separator))
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect();

    let joined = segments.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Normalized form of a destination directory used as an admission key.
pub fn scope_key(dir: &str) -> String {
    join_path(&[dir]).trim_start_matches('/').to_string()
}

/// Segment-aware containment: `a/b/c` is within `a/b`, `a/bc` is not.
/// Every path is within the empty (root) scope.
pub fn is_within(path: &str, scope: &str) -> bool {
    if scope.is_empty() || path == scope {
        return true;
    }
    path.strip_prefix(scope)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// True when one scope contains the other.
pub fn scopes_overlap(a: &str, b: &str) -> bool {
    is_within(a, b) || is_within(b, a)
}

pub fn has_parent_segment(path: &str) -> bool {
    path.split(is_separator).any(|segment| segment == "..")
}
