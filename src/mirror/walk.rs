use crate::config::SecurityPolicy;
use crate::mirror::{io_error, sha256_hex, MirrorError};
use crate::shared::ids::is_snapshot_dir_name;
use crate::shared::scrub::classify_file;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const DENY_DIR_NAMES: [&str; 3] = ["venv", ".venv", "log"];
const CLASSIFY_HEAD_BYTES: usize = 20_000;
const BINARY_SNIFF_BYTES: usize = 4096;

/// Validate a provider- or model-supplied relative path against the output
/// policy: relative, forward slashes only, no `..`, no `.` segments, no
/// empty segments.
pub fn validate_relative_path(rel: &str) -> Result<(), String> {
    if rel.is_empty() {
        return Err("path must be non-empty".to_string());
    }
    if rel.contains('\\') {
        return Err("path must not contain backslashes".to_string());
    }
    if rel.starts_with('/') {
        return Err("path must be relative".to_string());
    }
    for segment in rel.split('/') {
        match segment {
            "" => return Err("path must not contain empty segments".to_string()),
            "." | ".." => {
                return Err("path must not contain `.` or `..` segments".to_string())
            }
            _ => {}
        }
    }
    Ok(())
}

pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, String> {
    validate_relative_path(rel)?;
    Ok(root.join(rel))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanItem {
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
    pub sha256: Option<String>,
    pub uploadable: bool,
    pub skip_reason: Option<String>,
    pub sensitive: bool,
}

impl ScanItem {
    fn skipped(rel: String, abs: PathBuf, size: u64, reason: &str, sensitive: bool) -> Self {
        Self {
            rel_path: rel,
            abs_path: abs,
            size,
            sha256: None,
            uploadable: false,
            skip_reason: Some(reason.to_string()),
            sensitive,
        }
    }
}

fn ext_of(rel: &str) -> String {
    match rel.rsplit_once('.') {
        Some((_, ext)) if !ext.contains('/') => format!(".{}", ext.to_ascii_lowercase()),
        _ => String::new(),
    }
}

fn is_probably_binary(head: &[u8]) -> bool {
    if head.contains(&0) {
        return true;
    }
    if head.is_empty() {
        return false;
    }
    let printable = head
        .iter()
        .filter(|&&b| (32..=126).contains(&b) || matches!(b, 9 | 10 | 13))
        .count();
    (printable as f64 / head.len() as f64) < 0.75
}

/// Depth-first scan of the input tree, lexically ordered, with every skipped
/// file kept in the result carrying its reason. Snapshot directories, venv
/// trees and the log directory are never descended into; symlinks that leave
/// the root are skipped.
pub fn scan_tree(
    root: &Path,
    root_name: &str,
    policy: &SecurityPolicy,
) -> Result<Vec<ScanItem>, MirrorError> {
    let canonical_root = fs::canonicalize(root).map_err(|source| io_error(root, source))?;
    let mut items = Vec::new();
    scan_dir(&canonical_root, &canonical_root, root_name, policy, &mut items)?;
    items.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(items)
}

fn scan_dir(
    root: &Path,
    dir: &Path,
    root_name: &str,
    policy: &SecurityPolicy,
    items: &mut Vec<ScanItem>,
) -> Result<(), MirrorError> {
    let entries = fs::read_dir(dir).map_err(|source| io_error(dir, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| io_error(dir, source))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let file_type = entry
            .file_type()
            .map_err(|source| io_error(&path, source))?;

        if file_type.is_dir() {
            if DENY_DIR_NAMES.contains(&name.to_ascii_lowercase().as_str())
                || is_snapshot_dir_name(&name, root_name)
            {
                continue;
            }
            scan_dir(root, &path, root_name, policy, items)?;
            continue;
        }
        if !file_type.is_file() && !file_type.is_symlink() {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| name.clone());

        if file_type.is_symlink() {
            match fs::canonicalize(&path) {
                Ok(target) if target.starts_with(root) => {}
                _ => {
                    items.push(ScanItem::skipped(rel, path, 0, "symlink_escape", false));
                    continue;
                }
            }
        }

        items.push(scan_file(&path, rel, policy));
    }
    Ok(())
}

fn scan_file(abs_path: &Path, rel_path: String, policy: &SecurityPolicy) -> ScanItem {
    let size = match fs::metadata(abs_path) {
        Ok(meta) => meta.len(),
        Err(_) => {
            return ScanItem::skipped(rel_path, abs_path.to_path_buf(), 0, "stat_failed", true)
        }
    };
    let abs = abs_path.to_path_buf();

    if !policy.allow_globs.is_empty() && !match_any_glob(&rel_path, &policy.allow_globs) {
        return ScanItem::skipped(rel_path, abs, size, "not_in_allow_globs", false);
    }
    if match_any_glob(&rel_path, &policy.deny_globs) {
        return ScanItem::skipped(rel_path, abs, size, "deny_glob", false);
    }

    let ext = ext_of(&rel_path);
    if !policy.allow_extensions.is_empty()
        && !policy
            .allow_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&ext))
    {
        return ScanItem::skipped(rel_path, abs, size, "ext_not_allowed", false);
    }
    if policy
        .deny_extensions
        .iter()
        .any(|e| e.eq_ignore_ascii_case(&ext))
    {
        return ScanItem::skipped(rel_path, abs, size, "denied_extension", false);
    }

    if size == 0 {
        return ScanItem::skipped(rel_path, abs, size, "empty_file", false);
    }
    if size > policy.max_file_bytes {
        return ScanItem::skipped(rel_path, abs, size, "too_large", false);
    }

    let head = match read_head(abs_path, CLASSIFY_HEAD_BYTES) {
        Ok(head) => head,
        Err(_) => return ScanItem::skipped(rel_path, abs, size, "read_failed", true),
    };
    if is_probably_binary(&head[..head.len().min(BINARY_SNIFF_BYTES)]) {
        return ScanItem::skipped(rel_path, abs, size, "binary", false);
    }

    let file_name = abs
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let classification = classify_file(&file_name, &head);
    if let Some(reason) = classification.reason() {
        return ScanItem::skipped(rel_path, abs, size, reason, true);
    }

    let sha256 = fs::read(&abs).ok().map(|bytes| sha256_hex(&bytes));
    ScanItem {
        rel_path,
        abs_path: abs,
        size,
        sha256,
        uploadable: true,
        skip_reason: None,
        sensitive: false,
    }
}

fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; limit];
    let mut filled = 0;
    loop {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
        if filled == buf.len() {
            break;
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

pub fn match_any_glob(rel_path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| glob_match(p, rel_path))
}

/// Segment-wise glob: `**` spans directories, `*` and `?` stay within one
/// segment. Paths use forward slashes.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();
    match_segments(&pattern_segments, &path_segments)
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(&"**") => {
            (0..=path.len()).any(|skip| match_segments(&pattern[1..], &path[skip..]))
        }
        Some(seg) => {
            !path.is_empty()
                && match_segment(seg.as_bytes(), path[0].as_bytes())
                && match_segments(&pattern[1..], &path[1..])
        }
    }
}

fn match_segment(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            match_segment(&pattern[1..], text)
                || (!text.is_empty() && match_segment(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => match_segment(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => match_segment(&pattern[1..], &text[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_rules_reject_escapes() {
        assert!(validate_relative_path("src/main.rs").is_ok());
        assert!(validate_relative_path("..").is_err());
        assert!(validate_relative_path("a/../b").is_err());
        assert!(validate_relative_path("/abs").is_err());
        assert!(validate_relative_path("a\\b").is_err());
        assert!(validate_relative_path("a//b").is_err());
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("./a").is_err());
    }

    #[test]
    fn glob_matcher_handles_double_star() {
        assert!(glob_match("**/.git/**", "a/.git/config"));
        assert!(glob_match("**/.git/**", ".git/config"));
        assert!(!glob_match("**/.git/**", "agit/config"));
        assert!(glob_match("src/*.rs", "src/lib.rs"));
        assert!(!glob_match("src/*.rs", "src/a/lib.rs"));
        assert!(glob_match("**/*.tmp", "deep/nested/file.tmp"));
        assert!(glob_match("file?.txt", "file1.txt"));
        assert!(!glob_match("file?.txt", "file12.txt"));
    }

    #[test]
    fn binary_sniff_uses_nul_and_printable_ratio() {
        assert!(is_probably_binary(b"ab\x00cd"));
        assert!(!is_probably_binary(b"plain text\nwith lines\n"));
        let mut junk = vec![1u8; 100];
        junk.extend_from_slice(b"abc");
        assert!(is_probably_binary(&junk));
    }

    #[test]
    fn scan_partitions_by_policy_and_secrecy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src")).expect("mkdir");
        fs::create_dir_all(root.join("venv/lib")).expect("mkdir venv");
        fs::create_dir_all(root.join("LOG/run")).expect("mkdir log");
        fs::write(root.join("src/a.py"), "print('a')\n").expect("a.py");
        fs::write(root.join("src/big.bin"), vec![0u8; 16]).expect("bin");
        fs::write(root.join(".env"), "API_KEY=sk-123\n").expect("env");
        fs::write(root.join("empty.txt"), "").expect("empty");
        fs::write(root.join("venv/lib/x.py"), "ignored").expect("venv file");
        fs::write(root.join("LOG/run/ev.jsonl"), "ignored").expect("log file");

        let policy = SecurityPolicy::default();
        let items = scan_tree(root, "root", &policy).expect("scan");
        let by_path: std::collections::BTreeMap<_, _> =
            items.iter().map(|i| (i.rel_path.as_str(), i)).collect();

        assert!(by_path["src/a.py"].uploadable);
        assert!(by_path["src/a.py"].sha256.is_some());
        assert_eq!(by_path["src/big.bin"].skip_reason.as_deref(), Some("binary"));
        assert_eq!(by_path[".env"].skip_reason.as_deref(), Some("env_file"));
        assert!(by_path[".env"].sensitive);
        assert_eq!(by_path["empty.txt"].skip_reason.as_deref(), Some("empty_file"));
        assert!(!by_path.contains_key("venv/lib/x.py"));
        assert!(!by_path.contains_key("LOG/run/ev.jsonl"));

        let paths: Vec<_> = items.iter().map(|i| i.rel_path.clone()).collect();
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn scan_skips_snapshot_directories() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("proj020820261330")).expect("snapshot dir");
        fs::write(root.join("proj020820261330/old.py"), "old").expect("old file");
        fs::write(root.join("new.py"), "new\n").expect("new file");

        let items = scan_tree(root, "proj", &SecurityPolicy::default()).expect("scan");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].rel_path, "new.py");
    }
}
