//! Trash destination naming.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHasher;

static TRASH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Builds the trash file name for a normalized path.
///
/// Separators are flattened to `_` and the name is suffixed with eight hex
/// digits of an FNV-1a hash over the path, the wall clock in nanoseconds and
/// a process-wide sequence number. Two calls never share the sequence number,
/// so trashing the same path twice in the same nanosecond still differs.
pub fn trash_file_name(path: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|value| value.as_nanos())
        .unwrap_or(0);
    let sequence = TRASH_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    trash_file_name_at(path, now, sequence)
}

pub(crate) fn trash_file_name_at(path: &str, nanos: u128, sequence: u64) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(path.as_bytes());
    hasher.write_u8(0xff);
    hasher.write_u128(nanos);
    hasher.write_u64(sequence);
    let digest = hasher.finish();
    let folded = (digest as u32) ^ ((digest >> 32) as u32);
    format!("{}.{folded:08x}", path.replace('/', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_separators() {
        let name = trash_file_name_at("notes/daily/today.md", 1, 0);
        assert!(name.starts_with("notes_daily_today.md."));
        let suffix = name.rsplit('.').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_instant_different_sequence_differs() {
        let a = trash_file_name_at("a.md", 42, 0);
        let b = trash_file_name_at("a.md", 42, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn back_to_back_names_differ() {
        let a = trash_file_name("a.md");
        let b = trash_file_name("a.md");
        assert_ne!(a, b);
    }
}
