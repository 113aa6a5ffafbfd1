//! Unique hidden sibling names for write-then-rename updates.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Pattern: `.venv_move.<tag>.<pid>.<nanos>.<seq>.tmp` next to `target`.
pub fn tmp_sibling_name(target: &Path, tag: &str) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!(".venv_move.{tag}.{pid}.{nanos}.{seq}.tmp");
    target.parent().unwrap_or_else(|| Path::new(".")).join(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn names_are_unique_across_threads() {
        let handles: Vec<_> = (0..32)
            .map(|_| thread::spawn(|| tmp_sibling_name(Path::new("/v/bin/activate"), "patch")))
            .collect();
        let mut set = HashSet::new();
        for h in handles {
            let p = h.join().unwrap();
            assert_eq!(p.parent(), Some(Path::new("/v/bin")));
            assert!(set.insert(p));
        }
    }
}
