//! Thumbnail cache behaviour against real files.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use photocat::thumbnails::identity_of;
use photocat::{CacheWrite, Fingerprint, Thumbnail, ThumbnailCache};

fn photo(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn thumb(len: usize, fill: u8) -> Thumbnail {
    Thumbnail {
        bytes: vec![fill; len],
        width: 160,
        height: 120,
    }
}

fn put(cache: &ThumbnailCache, path: &Path, thumbnail: &Thumbnail) {
    let fingerprint = Fingerprint::of_file(path).unwrap();
    assert_eq!(cache.put(&fingerprint, thumbnail), CacheWrite::Stored);
}

#[test]
fn test_hit_then_stale_after_change() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 1_000_000);
    let path = photo(photos.path(), "a.jpg", b"original");

    assert!(cache.get(&path).is_none());
    put(&cache, &path, &thumb(64, 1));
    assert_eq!(cache.get(&path), Some(thumb(64, 1)));

    fs::write(&path, b"edited, and longer").unwrap();
    assert!(cache.get(&path).is_none());
}

#[test]
fn test_missing_file_is_a_miss() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 1_000_000);
    let path = photo(photos.path(), "a.jpg", b"data");
    put(&cache, &path, &thumb(8, 2));

    fs::remove_file(&path).unwrap();
    assert!(cache.get(&path).is_none());
}

#[test]
fn test_entries_survive_reopen() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let path = photo(photos.path(), "a.jpg", b"data");
    {
        let cache = ThumbnailCache::open(root.path(), 1_000_000);
        put(&cache, &path, &thumb(32, 3));
    }
    let cache = ThumbnailCache::open(root.path(), 1_000_000);
    let entry = cache.get_entry(&path).unwrap();
    assert_eq!(entry.thumbnail, thumb(32, 3));
    assert_eq!(entry.fingerprint, Fingerprint::of_file(&path).unwrap());
    assert!(entry.access > entry.generation);
}

#[test]
fn test_least_recently_used_is_evicted_first() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 250);
    let a = photo(photos.path(), "a.jpg", b"a");
    let b = photo(photos.path(), "b.jpg", b"b");
    let c = photo(photos.path(), "c.jpg", b"c");

    put(&cache, &a, &thumb(100, 1));
    put(&cache, &b, &thumb(100, 2));
    assert!(cache.get(&a).is_some());
    put(&cache, &c, &thumb(100, 3));

    assert!(cache.get(&b).is_none());
    assert!(cache.get(&a).is_some());
    assert!(cache.get(&c).is_some());
    let stats = cache.stats();
    assert_eq!(stats.entries, 2);
    assert!(stats.total_bytes <= 250);
}

#[test]
fn test_oversized_thumbnail_is_not_kept() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 50);
    let a = photo(photos.path(), "a.jpg", b"a");

    put(&cache, &a, &thumb(80, 1));
    assert!(cache.get(&a).is_none());
    assert_eq!(cache.stats().total_bytes, 0);
}

#[test]
fn test_remove_and_rename() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 1_000_000);
    let a = photo(photos.path(), "a.jpg", b"aaaa");
    let b = photo(photos.path(), "b.jpg", b"bbbb");
    put(&cache, &a, &thumb(16, 1));
    put(&cache, &b, &thumb(16, 2));

    assert!(cache.remove(&b));
    assert!(!cache.remove(&b));
    assert!(cache.get(&b).is_none());

    let moved = photos.path().join("moved.jpg");
    fs::rename(&a, &moved).unwrap();
    assert!(cache.rename(&a, &moved));
    assert_eq!(cache.get(&moved), Some(thumb(16, 1)));
    assert_eq!(cache.identities(), vec![identity_of(&moved).unwrap()]);
}

#[test]
fn test_compact_removes_orphaned_blobs() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 1_000_000);
    let a = photo(photos.path(), "a.jpg", b"a");
    put(&cache, &a, &thumb(16, 1));

    let stray_dir = root.path().join("blobs").join("zz");
    fs::create_dir_all(&stray_dir).unwrap();
    fs::write(stray_dir.join("leftover.thumb"), b"junk").unwrap();

    assert_eq!(cache.compact().unwrap(), 1);
    assert!(!stray_dir.join("leftover.thumb").exists());
    assert!(cache.get(&a).is_some());
    assert_eq!(cache.compact().unwrap(), 0);
}

#[test]
fn test_clear_empties_the_cache() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = ThumbnailCache::open(root.path(), 1_000_000);
    let a = photo(photos.path(), "a.jpg", b"a");
    put(&cache, &a, &thumb(16, 1));

    cache.clear().unwrap();
    assert!(cache.get(&a).is_none());
    assert!(cache.identities().is_empty());
    assert_eq!(cache.stats().entries, 0);

    // still usable afterwards
    put(&cache, &a, &thumb(16, 4));
    assert_eq!(cache.get(&a), Some(thumb(16, 4)));
}

#[test]
fn test_concurrent_puts_for_different_files() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = Arc::new(ThumbnailCache::open(root.path(), 1_000_000));

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let path = photo(photos.path(), &format!("{}.jpg", i), &[i; 10]);
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for round in 0..5u8 {
                    put(&cache, &path, &thumb(32, i.wrapping_add(round)));
                    assert!(cache.get(&path).is_some());
                }
                path
            })
        })
        .collect();

    for handle in handles {
        let path = handle.join().unwrap();
        assert!(cache.get(&path).is_some());
    }
    assert_eq!(cache.identities().len(), 8);
    assert_eq!(cache.stats().total_bytes, 8 * 32);
    assert!(!cache.is_degraded());
}

#[test]
fn test_concurrent_puts_for_one_file_leave_one_whole_entry() {
    let photos = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cache = Arc::new(ThumbnailCache::open(root.path(), 1_000_000));
    let path = photo(photos.path(), "shared.jpg", b"shared");
    let written: Vec<Thumbnail> = (0..8u8).map(|i| thumb(32 + i as usize * 7, i)).collect();

    let handles: Vec<_> = written
        .iter()
        .cloned()
        .map(|thumbnail| {
            let cache = Arc::clone(&cache);
            let path = path.clone();
            thread::spawn(move || {
                for _ in 0..5 {
                    put(&cache, &path, &thumbnail);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stored = cache.get(&path).unwrap();
    assert!(written.contains(&stored));
    let stats = cache.stats();
    assert_eq!(stats.entries, 1);
    assert_eq!(stats.total_bytes, stored.bytes.len() as u64);

    // the blob on disk agrees with its index entry after a reopen
    drop(cache);
    let reopened = ThumbnailCache::open(root.path(), 1_000_000);
    assert_eq!(reopened.get(&path), Some(stored));
}
