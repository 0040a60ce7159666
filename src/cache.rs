use std::sync::Mutex;

use crossbeam_channel::Sender;

use crate::ftp::listing::{ListingEntry, ListingEntryKind, ParseListing, PathStyle, SizeInfo};

/// Identity of one server as the cache sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl ServerKey {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        ServerKey { user: user.into(), host: host.into(), port }
    }
}

/// Size as the cache tracks it; `NeedsUpdate` marks a file whose upload
/// started but whose final size is not known yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedSize {
    Bytes(u64),
    Unknown,
    NeedsUpdate,
}

impl CachedSize {
    pub fn as_bytes(&self) -> Option<u64> {
        match self {
            CachedSize::Bytes(b) => Some(*b),
            _ => None,
        }
    }
}

/// One name in a cached listing. Comparison is case-sensitive: some servers
/// distinguish case, and guessing wrong would corrupt collision handling.
#[derive(Debug, Clone)]
pub struct CachedItem {
    pub name: String,
    pub kind: ListingEntryKind,
    pub size: CachedSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingState {
    Ready,
    InProgress,
    /// A newer ready listing arrived from the panel while a fetch ran; the
    /// fetch result must be discarded.
    InProgressButObsolete,
    /// An unclassifiable change happened during the fetch; the result is
    /// applied but stays suspect.
    InProgressButMayBeOutdated,
    NotAccessible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    DeleteName,
    CreateDir,
    StoreFileStart,
    StoreFileUploaded,
}

/// One record of the change log replayed on top of a finished fetch.
#[derive(Debug, Clone)]
struct ListingChange {
    kind: ChangeKind,
    name: String,
    size: Option<u64>,
    change_time: u64,
}

/// Answer to a `get_listing` call.
#[derive(Debug)]
pub enum GetListing {
    /// No listing cached; the caller must fetch it and report back.
    MustFetch,
    /// Another worker is fetching; wait for the cache event.
    Wait,
    NotAccessible,
    /// Listing is ready; the named entry was (not) found.
    Ready { entry: Option<CachedItem> },
}

/// Outcome delivered to waiting workers when a fetch settles.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub path: String,
    pub outcome: CacheFetchOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFetchOutcome {
    Finished,
    NotAccessible,
    /// The fetch failed; whoever needs the listing should retry later.
    RetryLater,
}

struct Waiter {
    worker_uid: u32,
    tx: Sender<CacheEvent>,
}

struct PathListing {
    path: String,
    style: PathStyle,
    state: ListingState,
    /// Tick at fetch start; changes at or before it are already reflected in
    /// the fetched data and are not replayed.
    listing_start_time: u64,
    changes: Vec<ListingChange>,
    latest_change_time: u64,
    /// The listing came from the host panel and may be stale.
    from_panel: bool,
    /// Sorted case-sensitively by name.
    items: Vec<CachedItem>,
    waiters: Vec<Waiter>,
}

impl PathListing {
    fn find(&self, name: &str) -> Result<usize, usize> {
        self.items.binary_search_by(|it| it.name.as_str().cmp(name))
    }

    fn apply_change(&mut self, change: &ListingChange) {
        match change.kind {
            ChangeKind::DeleteName => {
                if let Ok(idx) = self.find(&change.name) {
                    self.items.remove(idx);
                }
            }
            ChangeKind::CreateDir => match self.find(&change.name) {
                Ok(idx) => self.items[idx].kind = ListingEntryKind::Directory,
                Err(idx) => self.items.insert(
                    idx,
                    CachedItem {
                        name: change.name.clone(),
                        kind: ListingEntryKind::Directory,
                        size: CachedSize::Unknown,
                    },
                ),
            },
            ChangeKind::StoreFileStart => match self.find(&change.name) {
                Ok(idx) => {
                    self.items[idx].kind = ListingEntryKind::File;
                    self.items[idx].size = CachedSize::NeedsUpdate;
                }
                Err(idx) => self.items.insert(
                    idx,
                    CachedItem {
                        name: change.name.clone(),
                        kind: ListingEntryKind::File,
                        size: CachedSize::NeedsUpdate,
                    },
                ),
            },
            ChangeKind::StoreFileUploaded => {
                let size =
                    change.size.map(CachedSize::Bytes).unwrap_or(CachedSize::Unknown);
                match self.find(&change.name) {
                    Ok(idx) => {
                        self.items[idx].kind = ListingEntryKind::File;
                        self.items[idx].size = size;
                    }
                    Err(idx) => self.items.insert(
                        idx,
                        CachedItem {
                            name: change.name.clone(),
                            kind: ListingEntryKind::File,
                            size,
                        },
                    ),
                }
            }
        }
    }

    fn drain_waiters(&mut self, outcome: CacheFetchOutcome, out: &mut Vec<(Waiter, CacheEvent)>) {
        for waiter in self.waiters.drain(..) {
            let event = CacheEvent { path: self.path.clone(), outcome };
            out.push((waiter, event));
        }
    }
}

struct ServerListings {
    key: ServerKey,
    paths: Vec<PathListing>,
}

impl ServerListings {
    fn find_path(&mut self, path: &str, style: PathStyle) -> Option<&mut PathListing> {
        self.paths.iter_mut().find(|p| p.style == style && p.path == path)
    }
}

struct Inner {
    servers: Vec<ServerListings>,
    /// The shared listing counter; stamps both fetch starts and changes so
    /// the replay is deterministic.
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn server(&mut self, key: &ServerKey) -> &mut ServerListings {
        if let Some(idx) = self.servers.iter().position(|s| s.key == *key) {
            &mut self.servers[idx]
        } else {
            self.servers.push(ServerListings { key: key.clone(), paths: Vec::new() });
            self.servers.last_mut().expect("just pushed")
        }
    }
}

/// Per-server cache of target-path listings shared by upload workers, so
/// concurrent workers storing into the same path list it only once. Mutating
/// commands are reported here and either applied in place or queued in the
/// change log while a fetch is under way.
pub struct UploadListingCache {
    inner: Mutex<Inner>,
}

impl Default for UploadListingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl UploadListingCache {
    pub fn new() -> Self {
        UploadListingCache { inner: Mutex::new(Inner { servers: Vec::new(), tick: 0 }) }
    }

    /// Look up `name` in the listing of `path`, fetching rules per state; see
    /// `GetListing`. The worker's event sender is registered whenever the
    /// answer depends on a fetch in flight (including the caller's own).
    #[allow(clippy::too_many_arguments)]
    pub fn get_listing(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        worker_uid: u32,
        worker_tx: &Sender<CacheEvent>,
        name: &str,
    ) -> GetListing {
        let mut inner = self.inner.lock().expect("cache lock");
        let start = inner.next_tick();
        let server = inner.server(key);
        match server.find_path(path, style) {
            None => {
                server.paths.push(PathListing {
                    path: path.to_string(),
                    style,
                    state: ListingState::InProgress,
                    listing_start_time: start,
                    changes: Vec::new(),
                    latest_change_time: 0,
                    from_panel: false,
                    items: Vec::new(),
                    waiters: vec![Waiter { worker_uid, tx: worker_tx.clone() }],
                });
                GetListing::MustFetch
            }
            Some(listing) => match listing.state {
                ListingState::InProgress
                | ListingState::InProgressButObsolete
                | ListingState::InProgressButMayBeOutdated => {
                    listing.waiters.push(Waiter { worker_uid, tx: worker_tx.clone() });
                    GetListing::Wait
                }
                ListingState::NotAccessible => GetListing::NotAccessible,
                ListingState::Ready => {
                    let entry = listing.find(name).ok().map(|idx| listing.items[idx].clone());
                    GetListing::Ready { entry }
                }
            },
        }
    }

    /// The fetch finished; parse, reconcile with the change log and wake
    /// waiters. Returns false when the listing bytes could not be parsed (the
    /// record is dropped, waiters get RetryLater).
    pub fn listing_finished(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        bytes: &[u8],
        server_hint: Option<&str>,
        parser: &dyn ParseListing,
    ) -> bool {
        let parsed = parser.parse_listing(bytes, server_hint, style);
        let mut notify: Vec<(Waiter, CacheEvent)> = Vec::new();
        let ok = {
            let mut inner = self.inner.lock().expect("cache lock");
            let server = inner.server(key);
            let Some(pos) = server.paths.iter().position(|p| p.style == style && p.path == path)
            else {
                return parsed.is_ok();
            };
            match parsed {
                Err(_) => {
                    let mut listing = server.paths.remove(pos);
                    listing.drain_waiters(CacheFetchOutcome::RetryLater, &mut notify);
                    false
                }
                Ok(entries) => {
                    let listing = &mut server.paths[pos];
                    match listing.state {
                        ListingState::InProgressButObsolete => {
                            // A newer panel listing is already in place.
                            listing.state = ListingState::Ready;
                            listing.changes.clear();
                            listing.drain_waiters(CacheFetchOutcome::Finished, &mut notify);
                        }
                        ListingState::InProgress
                        | ListingState::InProgressButMayBeOutdated => {
                            listing.items = to_cached(entries);
                            let start = listing.listing_start_time;
                            let changes = std::mem::take(&mut listing.changes);
                            for change in changes.iter().filter(|c| c.change_time > start) {
                                listing.apply_change(change);
                            }
                            listing.state = ListingState::Ready;
                            listing.drain_waiters(CacheFetchOutcome::Finished, &mut notify);
                        }
                        ListingState::Ready | ListingState::NotAccessible => {
                            // Late completion after a panel refresh settled
                            // the record; nothing to reconcile.
                            listing.drain_waiters(CacheFetchOutcome::Finished, &mut notify);
                        }
                    }
                    true
                }
            }
        };
        send_events(notify);
        ok
    }

    /// The fetch failed. `not_accessible` keeps a tombstone so nobody retries
    /// the path; otherwise the record is dropped for a later retry.
    pub fn listing_failed(&self, key: &ServerKey, path: &str, style: PathStyle, not_accessible: bool) {
        let mut notify: Vec<(Waiter, CacheEvent)> = Vec::new();
        {
            let mut inner = self.inner.lock().expect("cache lock");
            let server = inner.server(key);
            let Some(pos) = server.paths.iter().position(|p| p.style == style && p.path == path)
            else {
                return;
            };
            if not_accessible {
                let listing = &mut server.paths[pos];
                listing.state = ListingState::NotAccessible;
                listing.items.clear();
                listing.changes.clear();
                listing.drain_waiters(CacheFetchOutcome::NotAccessible, &mut notify);
            } else {
                let mut listing = server.paths.remove(pos);
                listing.drain_waiters(CacheFetchOutcome::RetryLater, &mut notify);
            }
        }
        send_events(notify);
    }

    /// Panel-supplied listing. While a fetch is in flight the fresher panel
    /// data wins and the fetch result will be discarded.
    pub fn add_or_update_listing(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        entries: Vec<ListingEntry>,
        from_panel: bool,
    ) {
        let mut inner = self.inner.lock().expect("cache lock");
        let start = inner.next_tick();
        let server = inner.server(key);
        match server.find_path(path, style) {
            Some(listing) => match listing.state {
                ListingState::InProgress | ListingState::InProgressButMayBeOutdated => {
                    listing.items = to_cached(entries);
                    listing.from_panel = from_panel;
                    listing.state = ListingState::InProgressButObsolete;
                }
                _ => {
                    listing.items = to_cached(entries);
                    listing.from_panel = from_panel;
                    listing.state = ListingState::Ready;
                    listing.changes.clear();
                    listing.listing_start_time = start;
                }
            },
            None => {
                server.paths.push(PathListing {
                    path: path.to_string(),
                    style,
                    state: ListingState::Ready,
                    listing_start_time: start,
                    changes: Vec::new(),
                    latest_change_time: 0,
                    from_panel,
                    items: to_cached(entries),
                    waiters: Vec::new(),
                });
            }
        }
    }

    /// MKD succeeded. `names` may contain nested segments (VMS creates whole
    /// chains at once): each segment lands in the listing of its parent path.
    pub fn report_create_dirs(&self, key: &ServerKey, path: &str, style: PathStyle, names: &str) {
        let separator = match style {
            PathStyle::Unix => '/',
            PathStyle::Windows => '\\',
            _ => '.',
        };
        let mut current = path.to_string();
        for segment in names.split(separator).filter(|s| !s.is_empty()) {
            self.apply_or_log(key, &current, style, ChangeKind::CreateDir, segment, None);
            current = style.join(&current, segment);
        }
    }

    /// RNFR/RNTO succeeded. A new name containing a path moves the entry to
    /// the destination path's listing (when that one is cached too).
    pub fn report_rename(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        old_name: &str,
        new_name: &str,
    ) {
        let separator = match style {
            PathStyle::Unix => '/',
            PathStyle::Windows => '\\',
            _ => '.',
        };
        // Capture what we knew about the entry before it disappears.
        let old_item = {
            let mut inner = self.inner.lock().expect("cache lock");
            let server = inner.server(key);
            server
                .find_path(path, style)
                .and_then(|l| l.find(old_name).ok().map(|idx| l.items[idx].clone()))
        };
        self.apply_or_log(key, path, style, ChangeKind::DeleteName, old_name, None);
        if let Some((dir_part, leaf)) = new_name.rsplit_once(separator) {
            let dest = if dir_part.is_empty() || !new_name.starts_with(separator) {
                style.join(path, dir_part)
            } else {
                dir_part.to_string()
            };
            self.insert_known(key, &dest, style, leaf, old_item);
        } else {
            self.insert_known(key, path, style, new_name, old_item);
        }
    }

    pub fn report_delete(&self, key: &ServerKey, path: &str, style: PathStyle, name: &str) {
        self.apply_or_log(key, path, style, ChangeKind::DeleteName, name, None);
    }

    /// STOR/APPE was issued; the entry exists but its size is in flux.
    pub fn report_store_file(&self, key: &ServerKey, path: &str, style: PathStyle, name: &str) {
        self.apply_or_log(key, path, style, ChangeKind::StoreFileStart, name, None);
    }

    /// Upload completed with a known final size.
    pub fn report_file_uploaded(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        name: &str,
        size: Option<u64>,
    ) {
        self.apply_or_log(key, path, style, ChangeKind::StoreFileUploaded, name, size);
    }

    /// Something changed on the path that we cannot describe (another
    /// operation, an unparsable server answer). A ready listing is dropped;
    /// an in-flight fetch is marked suspect.
    pub fn report_unknown_change(&self, key: &ServerKey, path: &str, style: PathStyle) {
        let mut inner = self.inner.lock().expect("cache lock");
        let server = inner.server(key);
        let Some(pos) = server.paths.iter().position(|p| p.style == style && p.path == path)
        else {
            return;
        };
        match server.paths[pos].state {
            ListingState::Ready | ListingState::NotAccessible => {
                server.paths.remove(pos);
            }
            ListingState::InProgress => {
                server.paths[pos].state = ListingState::InProgressButMayBeOutdated;
                server.paths[pos].changes.clear();
            }
            ListingState::InProgressButObsolete | ListingState::InProgressButMayBeOutdated => {
                server.paths[pos].changes.clear();
            }
        }
    }

    /// Forget everything cached for a server (operation teardown).
    pub fn invalidate_server(&self, key: &ServerKey) {
        let mut inner = self.inner.lock().expect("cache lock");
        inner.servers.retain(|s| s.key != *key);
    }

    fn apply_or_log(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        kind: ChangeKind,
        name: &str,
        size: Option<u64>,
    ) {
        let mut inner = self.inner.lock().expect("cache lock");
        let tick = inner.next_tick();
        let server = inner.server(key);
        let Some(listing) = server.find_path(path, style) else {
            return;
        };
        let change =
            ListingChange { kind, name: name.to_string(), size, change_time: tick };
        listing.latest_change_time = tick;
        match listing.state {
            ListingState::Ready => listing.apply_change(&change),
            ListingState::InProgress
            | ListingState::InProgressButObsolete
            | ListingState::InProgressButMayBeOutdated => listing.changes.push(change),
            ListingState::NotAccessible => {}
        }
    }

    fn insert_known(
        &self,
        key: &ServerKey,
        path: &str,
        style: PathStyle,
        name: &str,
        old_item: Option<CachedItem>,
    ) {
        // A rename destination inherits the source's kind and size when we
        // had them; otherwise the entry shows up with an unknown size.
        match old_item {
            Some(item) if item.kind == ListingEntryKind::Directory => {
                self.apply_or_log(key, path, style, ChangeKind::CreateDir, name, None);
            }
            Some(CachedItem { size: CachedSize::Bytes(b), .. }) => {
                self.apply_or_log(key, path, style, ChangeKind::StoreFileUploaded, name, Some(b));
            }
            _ => {
                self.apply_or_log(key, path, style, ChangeKind::StoreFileStart, name, None);
            }
        }
    }

    #[cfg(test)]
    fn snapshot(&self, key: &ServerKey, path: &str, style: PathStyle) -> Option<Vec<CachedItem>> {
        let mut inner = self.inner.lock().expect("cache lock");
        let server = inner.server(key);
        server.find_path(path, style).map(|l| l.items.clone())
    }

    #[cfg(test)]
    fn state_of(&self, key: &ServerKey, path: &str, style: PathStyle) -> Option<ListingState> {
        let mut inner = self.inner.lock().expect("cache lock");
        let server = inner.server(key);
        server.find_path(path, style).map(|l| l.state)
    }
}

fn to_cached(entries: Vec<ListingEntry>) -> Vec<CachedItem> {
    let mut items: Vec<CachedItem> = entries
        .into_iter()
        .map(|e| CachedItem {
            name: e.name,
            kind: e.kind,
            size: match e.size {
                SizeInfo::Bytes(b) => CachedSize::Bytes(b),
                _ => CachedSize::Unknown,
            },
        })
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

fn send_events(notify: Vec<(Waiter, CacheEvent)>) {
    for (waiter, event) in notify {
        tracing::trace!("[cache] waking worker {} for {}", waiter.worker_uid, event.path);
        let _ = waiter.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftp::listing::UnixListingParser;

    const LISTING: &str = "-rw-r--r-- 1 j s 100 Jan 5 12:30 report.txt\r\n\
drwxr-xr-x 2 j s 4096 Jan 5 12:30 sub\r\n";

    fn key() -> ServerKey {
        ServerKey::new("joe", "ftp.example.com", 21)
    }

    fn worker_chan() -> (Sender<CacheEvent>, crossbeam_channel::Receiver<CacheEvent>) {
        crossbeam_channel::unbounded()
    }

    fn fetch_ready(cache: &UploadListingCache, path: &str) {
        let (tx, _rx) = worker_chan();
        match cache.get_listing(&key(), path, PathStyle::Unix, 1, &tx, "x") {
            GetListing::MustFetch => {}
            other => panic!("expected MustFetch, got {:?}", other),
        }
        assert!(cache.listing_finished(
            &key(),
            path,
            PathStyle::Unix,
            LISTING.as_bytes(),
            None,
            &UnixListingParser::with_reference_year(2026),
        ));
    }

    #[test]
    fn first_caller_fetches_second_waits() {
        let cache = UploadListingCache::new();
        let (tx1, _rx1) = worker_chan();
        let (tx2, rx2) = worker_chan();
        assert!(matches!(
            cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx1, "a"),
            GetListing::MustFetch
        ));
        assert!(matches!(
            cache.get_listing(&key(), "/in", PathStyle::Unix, 2, &tx2, "a"),
            GetListing::Wait
        ));
        assert!(cache.listing_finished(
            &key(),
            "/in",
            PathStyle::Unix,
            LISTING.as_bytes(),
            None,
            &UnixListingParser::with_reference_year(2026),
        ));
        let event = rx2.try_recv().unwrap();
        assert_eq!(event.outcome, CacheFetchOutcome::Finished);

        // Third caller reads straight from the cache.
        let (tx3, _rx3) = worker_chan();
        match cache.get_listing(&key(), "/in", PathStyle::Unix, 3, &tx3, "report.txt") {
            GetListing::Ready { entry: Some(item) } => {
                assert_eq!(item.size, CachedSize::Bytes(100));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn lookup_is_case_sensitive() {
        let cache = UploadListingCache::new();
        fetch_ready(&cache, "/in");
        let (tx, _rx) = worker_chan();
        match cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "REPORT.TXT") {
            GetListing::Ready { entry } => assert!(entry.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn changes_during_fetch_are_replayed() {
        let cache = UploadListingCache::new();
        let (tx, _rx) = worker_chan();
        assert!(matches!(
            cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "a"),
            GetListing::MustFetch
        ));
        // While the fetch runs, another worker stores a file and deletes one.
        cache.report_store_file(&key(), "/in", PathStyle::Unix, "fresh.bin");
        cache.report_delete(&key(), "/in", PathStyle::Unix, "report.txt");
        assert!(cache.listing_finished(
            &key(),
            "/in",
            PathStyle::Unix,
            LISTING.as_bytes(),
            None,
            &UnixListingParser::with_reference_year(2026),
        ));
        let items = cache.snapshot(&key(), "/in", PathStyle::Unix).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["fresh.bin", "sub"]);
        assert_eq!(items[0].size, CachedSize::NeedsUpdate);
    }

    #[test]
    fn uploaded_size_lands_in_ready_listing() {
        let cache = UploadListingCache::new();
        fetch_ready(&cache, "/in");
        cache.report_store_file(&key(), "/in", PathStyle::Unix, "new.bin");
        cache.report_file_uploaded(&key(), "/in", PathStyle::Unix, "new.bin", Some(42));
        let items = cache.snapshot(&key(), "/in", PathStyle::Unix).unwrap();
        let item = items.iter().find(|i| i.name == "new.bin").unwrap();
        assert_eq!(item.size, CachedSize::Bytes(42));
    }

    #[test]
    fn nested_create_dirs_decompose_into_segments() {
        let cache = UploadListingCache::new();
        fetch_ready(&cache, "/in");
        fetch_ready(&cache, "/in/a");
        cache.report_create_dirs(&key(), "/in", PathStyle::Unix, "a/b");
        let top = cache.snapshot(&key(), "/in", PathStyle::Unix).unwrap();
        assert!(top.iter().any(|i| i.name == "a" && i.kind == ListingEntryKind::Directory));
        let nested = cache.snapshot(&key(), "/in/a", PathStyle::Unix).unwrap();
        assert!(nested.iter().any(|i| i.name == "b" && i.kind == ListingEntryKind::Directory));
    }

    #[test]
    fn rename_with_path_moves_between_listings() {
        let cache = UploadListingCache::new();
        fetch_ready(&cache, "/in");
        fetch_ready(&cache, "/in/sub");
        cache.report_rename(&key(), "/in", PathStyle::Unix, "report.txt", "sub/report.txt");
        let top = cache.snapshot(&key(), "/in", PathStyle::Unix).unwrap();
        assert!(!top.iter().any(|i| i.name == "report.txt"));
        let sub = cache.snapshot(&key(), "/in/sub", PathStyle::Unix).unwrap();
        let moved = sub.iter().find(|i| i.name == "report.txt").unwrap();
        assert_eq!(moved.size, CachedSize::Bytes(100));
    }

    #[test]
    fn unknown_change_drops_ready_listing_and_taints_fetch() {
        let cache = UploadListingCache::new();
        fetch_ready(&cache, "/in");
        cache.report_unknown_change(&key(), "/in", PathStyle::Unix);
        assert!(cache.state_of(&key(), "/in", PathStyle::Unix).is_none());

        let (tx, _rx) = worker_chan();
        assert!(matches!(
            cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "a"),
            GetListing::MustFetch
        ));
        cache.report_unknown_change(&key(), "/in", PathStyle::Unix);
        assert_eq!(
            cache.state_of(&key(), "/in", PathStyle::Unix),
            Some(ListingState::InProgressButMayBeOutdated)
        );
    }

    #[test]
    fn failed_fetch_notifies_retry_and_not_accessible_sticks() {
        let cache = UploadListingCache::new();
        let (tx1, rx1) = worker_chan();
        let _ = cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx1, "a");
        cache.listing_failed(&key(), "/in", PathStyle::Unix, false);
        assert_eq!(rx1.try_recv().unwrap().outcome, CacheFetchOutcome::RetryLater);
        assert!(cache.state_of(&key(), "/in", PathStyle::Unix).is_none());

        let (tx2, rx2) = worker_chan();
        let _ = cache.get_listing(&key(), "/deny", PathStyle::Unix, 1, &tx2, "a");
        cache.listing_failed(&key(), "/deny", PathStyle::Unix, true);
        assert_eq!(rx2.try_recv().unwrap().outcome, CacheFetchOutcome::NotAccessible);
        let (tx3, _rx3) = worker_chan();
        assert!(matches!(
            cache.get_listing(&key(), "/deny", PathStyle::Unix, 2, &tx3, "a"),
            GetListing::NotAccessible
        ));
    }

    #[test]
    fn panel_listing_obsoletes_running_fetch() {
        let cache = UploadListingCache::new();
        let (tx, rx) = worker_chan();
        let _ = cache.get_listing(&key(), "/in", PathStyle::Unix, 1, &tx, "a");
        let panel_entries = UnixListingParser::with_reference_year(2026)
            .parse_listing(b"-rw-r--r-- 1 j s 7 Jan 5 12:30 panel.txt\r\n", None, PathStyle::Unix)
            .unwrap();
        cache.add_or_update_listing(&key(), "/in", PathStyle::Unix, panel_entries, true);
        assert_eq!(
            cache.state_of(&key(), "/in", PathStyle::Unix),
            Some(ListingState::InProgressButObsolete)
        );
        // The late fetch result is discarded; the panel data stays.
        assert!(cache.listing_finished(
            &key(),
            "/in",
            PathStyle::Unix,
            LISTING.as_bytes(),
            None,
            &UnixListingParser::with_reference_year(2026),
        ));
        assert_eq!(cache.state_of(&key(), "/in", PathStyle::Unix), Some(ListingState::Ready));
        let items = cache.snapshot(&key(), "/in", PathStyle::Unix).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "panel.txt");
        assert_eq!(rx.try_recv().unwrap().outcome, CacheFetchOutcome::Finished);
    }
}
