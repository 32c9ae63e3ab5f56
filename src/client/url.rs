//! URL helpers
//!
//! Locations are plain strings: `alias/bucket/key` for aliased stores and
//! ordinary paths for the local filesystem. Separators are normalized to `/`
//! before any comparison so enumeration behaves the same on every platform.

/// Logical separator used in every URL
pub const SEPARATOR: char = '/';

/// Convert platform separators to `/` and collapse repeated separators
pub fn normalize(url: &str) -> String {
    let mut out = String::with_capacity(url.len());
    let mut previous_was_separator = false;
    for ch in url.chars() {
        let ch = if ch == '\\' { SEPARATOR } else { ch };
        if ch == SEPARATOR {
            if previous_was_separator {
                continue;
            }
            previous_was_separator = true;
        } else {
            previous_was_separator = false;
        }
        out.push(ch);
    }
    out
}

/// Join `suffix` onto `base` with exactly one separator between them
pub fn join(base: &str, suffix: &str) -> String {
    let suffix = suffix.trim_start_matches(SEPARATOR);
    if base.is_empty() {
        return suffix.to_string();
    }
    format!("{}{}{}", base.trim_end_matches(SEPARATOR), SEPARATOR, suffix)
}

/// Last non-empty path segment
pub fn basename(path: &str) -> &str {
    path.trim_end_matches(SEPARATOR)
        .rsplit(SEPARATOR)
        .next()
        .unwrap_or("")
}

/// A trailing separator marks a URL as a directory/prefix
pub fn has_dir_suffix(url: &str) -> bool {
    url.ends_with(SEPARATOR)
}

/// Portion of `path` kept when copying the tree rooted at `root`.
///
/// Everything up to the last separator of `root` is stripped, so `dir/`
/// copies the contents of `dir` while `dir` copies `dir` itself.
pub fn relative_suffix<'a>(root: &str, path: &'a str) -> &'a str {
    match root.rfind(SEPARATOR) {
        Some(idx) => path.strip_prefix(&root[..idx]).unwrap_or(path),
        None => path,
    }
}
