use chrono::{DateTime, Local};
use rand::Rng;

const RUN_SUFFIX_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Twelve-digit local timestamp code `DDMMYYYYHHMM`, shared by run ids,
/// vector-store names and versioning snapshot directories.
pub fn ts_code(now: DateTime<Local>) -> String {
    now.format("%d%m%Y%H%M").to_string()
}

pub fn new_run_id(now: DateTime<Local>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| RUN_SUFFIX_CHARSET[rng.gen_range(0..RUN_SUFFIX_CHARSET.len())] as char)
        .collect();
    format!("RUN_{}_{}", ts_code(now), suffix)
}

pub fn is_run_id(value: &str) -> bool {
    let Some(rest) = value.strip_prefix("RUN_") else {
        return false;
    };
    let mut parts = rest.splitn(2, '_');
    let (Some(stamp), Some(suffix)) = (parts.next(), parts.next()) else {
        return false;
    };
    stamp.len() == 12
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 4
        && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// A directory named `<root_name><DDMMYYYYHHMM>` is a versioning snapshot of
/// `root_name` and must never be walked or re-snapshotted.
pub fn is_snapshot_dir_name(dir_name: &str, root_name: &str) -> bool {
    let Some(tail) = dir_name.strip_prefix(root_name) else {
        return false;
    };
    tail.len() == 12 && tail.bytes().all(|b| b.is_ascii_digit())
}
