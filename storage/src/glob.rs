//! Glob resolution against the VFS
//!
//! Expands shell patterns (`*`, `?`, `[...]`) by walking the tree one
//! segment at a time. Matching is pure string matching via
//! [`glob::Pattern`]; the host filesystem is never consulted. Classic
//! no-match behavior (returning the pattern literally) is the caller's
//! concern; this module only reports actual matches.

use crate::vfs::{join_segments, normalize, Vfs};

/// Whether a pattern segment contains glob metacharacters.
fn has_meta(segment: &str) -> bool {
    segment.contains('*') || segment.contains('?') || segment.contains('[')
}

/// Expand `pattern` (an absolute path pattern) against the VFS.
/// Results are normalized absolute paths, sorted. Dotfiles are only
/// matched when the pattern segment itself starts with a dot.
pub fn expand(vfs: &Vfs, pattern: &str) -> Vec<String> {
    let segments = normalize(pattern);
    let mut current: Vec<Vec<String>> = vec![Vec::new()];

    for segment in &segments {
        let mut next: Vec<Vec<String>> = Vec::new();
        if !has_meta(segment) {
            for prefix in &current {
                let mut candidate = prefix.clone();
                candidate.push(segment.clone());
                if vfs.exists(&join_segments(&candidate)) {
                    next.push(candidate);
                }
            }
        } else {
            let matcher = match glob::Pattern::new(segment) {
                Ok(m) => m,
                Err(_) => return Vec::new(),
            };
            let hidden_ok = segment.starts_with('.');
            for prefix in &current {
                let dir = join_segments(prefix);
                let Ok(entries) = vfs.read_dir(&dir) else {
                    continue;
                };
                for entry in entries {
                    if entry.name.starts_with('.') && !hidden_ok {
                        continue;
                    }
                    if matcher.matches(&entry.name) {
                        let mut candidate = prefix.clone();
                        candidate.push(entry.name);
                        next.push(candidate);
                    }
                }
            }
        }
        current = next;
        if current.is_empty() {
            return Vec::new();
        }
    }

    let mut out: Vec<String> = current.iter().map(|segs| join_segments(segs)).collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vfs() -> Vfs {
        let mut vfs = Vfs::new();
        vfs.with_bypass(|v| {
            v.mkdirp("/home/user/docs").unwrap();
            v.write_file("/home/user/a.txt", b"").unwrap();
            v.write_file("/home/user/b.txt", b"").unwrap();
            v.write_file("/home/user/c.log", b"").unwrap();
            v.write_file("/home/user/.hidden", b"").unwrap();
            v.write_file("/home/user/docs/d.txt", b"").unwrap();
        });
        vfs
    }

    #[test]
    fn test_star_matches_by_extension() {
        let vfs = sample_vfs();
        assert_eq!(
            expand(&vfs, "/home/user/*.txt"),
            vec!["/home/user/a.txt", "/home/user/b.txt"]
        );
    }

    #[test]
    fn test_question_mark() {
        let vfs = sample_vfs();
        assert_eq!(expand(&vfs, "/home/user/?.log"), vec!["/home/user/c.log"]);
    }

    #[test]
    fn test_star_across_directories_does_not_recurse() {
        let vfs = sample_vfs();
        assert!(expand(&vfs, "/home/*.txt").is_empty());
        assert_eq!(
            expand(&vfs, "/home/*/docs/*.txt"),
            vec!["/home/user/docs/d.txt"]
        );
    }

    #[test]
    fn test_hidden_files_need_explicit_dot() {
        let vfs = sample_vfs();
        assert!(expand(&vfs, "/home/user/*").iter().all(|p| !p.contains(".hidden")));
        assert_eq!(expand(&vfs, "/home/user/.h*"), vec!["/home/user/.hidden"]);
    }

    #[test]
    fn test_no_match_is_empty() {
        let vfs = sample_vfs();
        assert!(expand(&vfs, "/home/user/*.rs").is_empty());
    }

    #[test]
    fn test_literal_segment_must_exist() {
        let vfs = sample_vfs();
        assert!(expand(&vfs, "/nope/*.txt").is_empty());
        assert_eq!(expand(&vfs, "/home/user/a.txt"), vec!["/home/user/a.txt"]);
    }
}
