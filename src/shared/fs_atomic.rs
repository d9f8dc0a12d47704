use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Write `content` to `path` through a temp sibling, fsync, rename.
///
/// Readers either see the previous file or the new one, never a torn write.
pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    fs::create_dir_all(parent)?;
    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    sync_parent_dir(parent)?;
    Ok(())
}

pub fn atomic_write_json(path: &Path, payload: &serde_json::Value) -> std::io::Result<()> {
    let body = serde_json::to_vec_pretty(payload)
        .map_err(|err| std::io::Error::other(format!("json encode failed: {err}")))?;
    atomic_write_file(path, &body)
}

pub fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content_and_creates_parents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("nested/state.json");

        atomic_write_file(&target, b"one").expect("first write");
        assert_eq!(fs::read_to_string(&target).expect("read"), "one");

        atomic_write_file(&target, b"two").expect("second write");
        assert_eq!(fs::read_to_string(&target).expect("read"), "two");

        let leftovers: Vec<_> = fs::read_dir(target.parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn append_line_is_cumulative() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("events.jsonl");
        append_line(&target, "{\"a\":1}").expect("first");
        append_line(&target, "{\"b\":2}").expect("second");
        let raw = fs::read_to_string(&target).expect("read");
        assert_eq!(raw.lines().count(), 2);
    }
}
