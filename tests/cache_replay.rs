//! Change-log replay property: applying the recorded changes on top of a
//! stale fetch must give the same item set as parsing a listing taken after
//! the changes happened.

use crossbeam_channel::unbounded;
use ftpilot::cache::{CacheEvent, CachedSize, GetListing, ServerKey, UploadListingCache};
use ftpilot::ftp::listing::{ListingEntryKind, ParseListing, PathStyle, UnixListingParser};

const BEFORE: &str = "-rw-r--r-- 1 ftp ftp  100 Jan  5 12:30 keep.txt\r\n\
-rw-r--r-- 1 ftp ftp  200 Jan  5 12:30 victim.txt\r\n\
drwxr-xr-x 2 ftp ftp 4096 Jan  5 12:30 olddir\r\n";

// What the server would list after: victim deleted, fresh.bin uploaded with
// 4242 bytes, newdir created.
const AFTER: &str = "-rw-r--r-- 1 ftp ftp  4242 Jan  5 12:30 fresh.bin\r\n\
-rw-r--r-- 1 ftp ftp   100 Jan  5 12:30 keep.txt\r\n\
drwxr-xr-x 2 ftp ftp  4096 Jan  5 12:30 newdir\r\n\
drwxr-xr-x 2 ftp ftp  4096 Jan  5 12:30 olddir\r\n";

fn key() -> ServerKey {
    ServerKey::new("joe", "ftp.example.com", 21)
}

fn lookup_all(cache: &UploadListingCache, names: &[&str]) -> Vec<(String, ListingEntryKind, Option<u64>)> {
    let (tx, _rx) = unbounded::<CacheEvent>();
    let mut out = Vec::new();
    for name in names {
        if let GetListing::Ready { entry: Some(item) } =
            cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, name)
        {
            let size = match item.size {
                CachedSize::Bytes(b) => Some(b),
                // Sentinels are excluded from the comparison by design.
                CachedSize::Unknown | CachedSize::NeedsUpdate => None,
            };
            out.push((item.name, item.kind, size));
        }
    }
    out
}

#[test]
fn replayed_changes_match_a_post_change_listing() {
    let cache = UploadListingCache::new();
    let parser = UnixListingParser::with_reference_year(2026);
    let (tx, _rx) = unbounded::<CacheEvent>();

    // Start the fetch, then let the mutating commands race it.
    assert!(matches!(
        cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "keep.txt"),
        GetListing::MustFetch
    ));
    cache.report_delete(&key(), "/in", PathStyle::Unix, "victim.txt");
    cache.report_store_file(&key(), "/in", PathStyle::Unix, "fresh.bin");
    cache.report_file_uploaded(&key(), "/in", PathStyle::Unix, "fresh.bin", Some(4242));
    cache.report_create_dirs(&key(), "/in", PathStyle::Unix, "newdir");

    // The fetch completes with the PRE-change data; the log replays on top.
    assert!(cache.listing_finished(
        &key(),
        "/in",
        PathStyle::Unix,
        BEFORE.as_bytes(),
        None,
        &parser,
    ));

    let names = ["keep.txt", "victim.txt", "fresh.bin", "newdir", "olddir"];
    let replayed = lookup_all(&cache, &names);

    // Reference: a second cache fed the post-change listing directly.
    let reference_cache = UploadListingCache::new();
    let entries = parser.parse_listing(AFTER.as_bytes(), None, PathStyle::Unix).unwrap();
    reference_cache.add_or_update_listing(&key(), "/in", PathStyle::Unix, entries, false);
    let reference = lookup_all(&reference_cache, &names);

    assert_eq!(replayed, reference);
}

#[test]
fn changes_older_than_the_fetch_are_not_replayed() {
    let cache = UploadListingCache::new();
    let parser = UnixListingParser::with_reference_year(2026);
    let (tx, _rx) = unbounded::<CacheEvent>();

    // A ready listing exists, a change lands in it directly...
    assert!(matches!(
        cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "x"),
        GetListing::MustFetch
    ));
    assert!(cache.listing_finished(&key(), "/in", PathStyle::Unix, BEFORE.as_bytes(), None, &parser));
    cache.report_delete(&key(), "/in", PathStyle::Unix, "victim.txt");

    // ...then the panel replaces the listing wholesale: the old deletion must
    // not bleed into the new data.
    let entries = parser.parse_listing(AFTER.as_bytes(), None, PathStyle::Unix).unwrap();
    cache.add_or_update_listing(&key(), "/in", PathStyle::Unix, entries, true);
    let found = lookup_all(&cache, &["fresh.bin"]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].2, Some(4242));
}

#[test]
fn byte_sum_only_decreases_via_explicit_changes() {
    let cache = UploadListingCache::new();
    let parser = UnixListingParser::with_reference_year(2026);
    let (tx, _rx) = unbounded::<CacheEvent>();
    let _ = cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "x");
    assert!(cache.listing_finished(&key(), "/in", PathStyle::Unix, BEFORE.as_bytes(), None, &parser));

    let sum = |cache: &UploadListingCache| -> u64 {
        lookup_all(cache, &["keep.txt", "victim.txt", "fresh.bin"])
            .iter()
            .filter_map(|(_, _, size)| *size)
            .sum()
    };
    let initial = sum(&cache);
    assert_eq!(initial, 300);

    // A store-start uses the needs-update sentinel; the sum of known sizes
    // never silently shrinks below what deletion accounts for.
    cache.report_store_file(&key(), "/in", PathStyle::Unix, "fresh.bin");
    assert_eq!(sum(&cache), 300);
    cache.report_file_uploaded(&key(), "/in", PathStyle::Unix, "fresh.bin", Some(50));
    assert_eq!(sum(&cache), 350);
    cache.report_delete(&key(), "/in", PathStyle::Unix, "victim.txt");
    assert_eq!(sum(&cache), 150);
}
