use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::format_description::{self, FormatItem};
use time::OffsetDateTime;
use tracing::{debug, warn};

/// Path prefix separating rendered corpus pages from the shell's own assets.
pub const CORPUS_ROOT: &str = "content/";

pub const MIN_QUERY_LEN: usize = 2;
pub const QUICK_RESULT_LIMIT: usize = 10;
pub const BOOKMARK_TITLE_MAX_CHARS: usize = 20;

const PREVIEW_WINDOW: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Theme::Light => Theme::Dark,
            Theme::Dark => Theme::Light,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Light => "light",
            Theme::Dark => "dark",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebarTab {
    Toc,
    Search,
}

/// The unit of navigation: a corpus-relative page path plus an optional
/// in-page fragment id (stored with its leading `#`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub anchor: Option<String>,
}

impl Location {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            anchor: None,
        }
    }

    /// The deep-link URL fragment for this location, with its leading `#`.
    pub fn fragment(&self) -> String {
        format!("#{}{}", self.path, self.anchor.as_deref().unwrap_or(""))
    }
}

/// Parses a deep-link fragment (without its leading `#`). The trailing anchor
/// is recognized only when the `#` immediately follows a `.htm`/`.html`
/// extension, so filenames containing `#` are not misparsed.
pub fn parse_location(fragment: &str) -> Location {
    if let Some(idx) = fragment.rfind('#') {
        let (path, anchor) = fragment.split_at(idx);
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".htm") || lower.ends_with(".html") {
            return Location {
                path: path.to_string(),
                anchor: Some(anchor.to_string()),
            };
        }
    }
    Location {
        path: fragment.to_string(),
        anchor: None,
    }
}

/// Rewrites a raw TOC path into its rendered corpus path: backslashes
/// normalized, `.md` sources mapped to their `.html` output, and the corpus
/// root prefix applied exactly once.
pub fn resolve_content_path(raw: &str) -> String {
    let normalized = raw.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    let rewritten = match trimmed.strip_suffix(".md") {
        Some(stem) => format!("{stem}.html"),
        None => trimmed.to_string(),
    };
    if rewritten.starts_with(CORPUS_ROOT) {
        rewritten
    } else {
        format!("{CORPUS_ROOT}{rewritten}")
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// One node of the static TOC description handed over by the converter. The
/// converter also emits a `type` field ("Folder"/"File"); folder status is
/// derived from `children` instead, so that field is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct TocNode {
    pub title: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub children: Vec<TocNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TocEntryKind {
    /// Content-bearing node without children.
    Leaf,
    /// Non-clickable folder label.
    Folder,
    /// Folder that also carries its own content page.
    ClickableFolder,
}

#[derive(Debug, Clone)]
pub struct TocEntry {
    pub title: String,
    /// Resolved corpus path for `Leaf` and `ClickableFolder` entries.
    pub path: Option<String>,
    pub kind: TocEntryKind,
    pub depth: usize,
    parent: Option<usize>,
}

impl TocEntry {
    pub fn is_folder(&self) -> bool {
        matches!(
            self.kind,
            TocEntryKind::Folder | TocEntryKind::ClickableFolder
        )
    }
}

/// Flattened, renderable view of the TOC tree. Built once from the static
/// description; only expansion and active-item state mutate afterwards.
#[derive(Debug, Default)]
pub struct TocModel {
    entries: Vec<TocEntry>,
    expanded: HashSet<usize>,
    active: Option<usize>,
}

impl TocModel {
    /// Flattens the tree below the synthetic root. Root-level children are
    /// rendered directly, without a wrapping folder shell.
    pub fn build(root: &TocNode) -> Self {
        let mut model = TocModel::default();
        for child in &root.children {
            model.push_node(child, 0, None);
        }
        model
    }

    fn push_node(&mut self, node: &TocNode, depth: usize, parent: Option<usize>) {
        let kind = if node.children.is_empty() {
            if node.path.is_some() {
                TocEntryKind::Leaf
            } else {
                TocEntryKind::Folder
            }
        } else if node.path.is_some() {
            TocEntryKind::ClickableFolder
        } else {
            TocEntryKind::Folder
        };
        let path = node.path.as_deref().map(resolve_content_path);
        let index = self.entries.len();
        self.entries.push(TocEntry {
            title: node.title.clone(),
            path,
            kind,
            depth,
            parent,
        });
        for child in &node.children {
            self.push_node(child, depth + 1, Some(index));
        }
    }

    pub fn entries(&self) -> &[TocEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_expanded(&self, index: usize) -> bool {
        self.expanded.contains(&index)
    }

    pub fn toggle_expanded(&mut self, index: usize) {
        if !self.expanded.remove(&index) {
            self.expanded.insert(index);
        }
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    /// Marks the entry for `path` active and expands every ancestor folder so
    /// the active item is visible regardless of how it was reached. Returns
    /// false when no entry carries the path.
    pub fn set_active_path(&mut self, path: &str) -> bool {
        let found = self
            .entries
            .iter()
            .position(|entry| entry.path.as_deref() == Some(path));
        match found {
            Some(index) => {
                self.active = Some(index);
                self.reveal_ancestors(index);
                true
            }
            None => false,
        }
    }

    fn reveal_ancestors(&mut self, index: usize) {
        let mut cursor = self.entries[index].parent;
        while let Some(parent) = cursor {
            self.expanded.insert(parent);
            cursor = self.entries[parent].parent;
        }
    }

    pub fn title_for_path(&self, path: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.path.as_deref() == Some(path))
            .map(|entry| entry.title.as_str())
    }

    /// Ancestor titles from the top level down to the entry itself.
    pub fn breadcrumb(&self, path: &str) -> Vec<String> {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.path.as_deref() == Some(path))
        else {
            return Vec::new();
        };
        let mut trail = Vec::new();
        let mut cursor = Some(index);
        while let Some(current) = cursor {
            trail.push(self.entries[current].title.clone());
            cursor = self.entries[current].parent;
        }
        trail.reverse();
        trail
    }

    /// Indices of entries whose ancestor folders are all expanded, in tree
    /// order.
    pub fn visible_indices(&self) -> Vec<usize> {
        (0..self.entries.len())
            .filter(|&index| {
                let mut cursor = self.entries[index].parent;
                while let Some(parent) = cursor {
                    if !self.expanded.contains(&parent) {
                        return false;
                    }
                    cursor = self.entries[parent].parent;
                }
                true
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchEntry {
    pub path: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    pub title: String,
    pub preview: String,
    /// Byte ranges of query occurrences inside `title`.
    pub title_spans: Vec<(usize, usize)>,
    /// Byte ranges of query occurrences inside `preview`.
    pub preview_spans: Vec<(usize, usize)>,
}

#[derive(Debug, Clone)]
pub struct SearchResults {
    pub hits: Vec<SearchHit>,
    pub total: usize,
}

/// Case-insensitive substring matcher over the flat search index. No ranking
/// beyond index order.
#[derive(Debug, Default)]
pub struct SearchMatcher {
    entries: Vec<SearchEntry>,
}

impl SearchMatcher {
    pub fn new(entries: Vec<SearchEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inline search surface: capped to the first matches in index order.
    pub fn quick_search(&self, query: &str) -> Vec<SearchHit> {
        self.search(query, Some(QUICK_RESULT_LIMIT))
    }

    /// Panel search surface: unbounded, with a result total for the summary.
    pub fn full_search(&self, query: &str) -> SearchResults {
        let hits = self.search(query, None);
        let total = hits.len();
        SearchResults { hits, total }
    }

    fn search(&self, query: &str, limit: Option<usize>) -> Vec<SearchHit> {
        if query.chars().count() < MIN_QUERY_LEN {
            return Vec::new();
        }
        let mut hits = Vec::new();
        for entry in &self.entries {
            let combined = format!("{} {}", entry.title, entry.content);
            if find_ci(&combined, query, 0).is_none() {
                continue;
            }
            hits.push(build_hit(entry, query));
            if let Some(limit) = limit {
                if hits.len() >= limit {
                    break;
                }
            }
        }
        hits
    }
}

fn build_hit(entry: &SearchEntry, query: &str) -> SearchHit {
    let preview = make_preview(&entry.content, query);
    SearchHit {
        path: entry.path.clone(),
        title: entry.title.clone(),
        title_spans: match_spans(&entry.title, query),
        preview_spans: match_spans(&preview, query),
        preview,
    }
}

/// ASCII-case-insensitive byte search. Match positions always fall on UTF-8
/// boundaries because a valid needle can never start on a continuation byte.
fn find_ci(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || from + n.len() > h.len() {
        return None;
    }
    (from..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}

fn match_spans(haystack: &str, needle: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut from = 0;
    while let Some(start) = find_ci(haystack, needle, from) {
        let end = start + needle.len();
        spans.push((start, end));
        from = end;
    }
    spans
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn make_preview(content: &str, query: &str) -> String {
    let occurrence = find_ci(content, query, 0).unwrap_or(0);
    let start = floor_char_boundary(content, occurrence.saturating_sub(PREVIEW_WINDOW / 2));
    let end = floor_char_boundary(content, start + PREVIEW_WINDOW + query.len());
    let mut preview = String::new();
    if start > 0 {
        preview.push_str("...");
    }
    preview.push_str(content[start..end].trim());
    if end < content.len() {
        preview.push_str("...");
    }
    preview
}

/// One step of a structural path: lowercase tag name plus a 1-based index
/// among same-tag siblings, recorded only when the tag is ambiguous under its
/// parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathStep {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling_index: Option<usize>,
}

/// Content-independent recipe for relocating a node after reload: element
/// steps from the document body down, plus a terminal text-node index when
/// the endpoint sits inside text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StructuralPath {
    pub steps: Vec<PathStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_index: Option<usize>,
}

/// A captured text selection. Meaningful only against the exact page it was
/// captured from; it carries a recomputation recipe, not DOM ownership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDescriptor {
    pub start_path: StructuralPath,
    pub start_offset: usize,
    pub end_path: StructuralPath,
    pub end_offset: usize,
}

pub fn derived_bookmark_title(text: &str) -> String {
    let mut title: String = text.chars().take(BOOKMARK_TITLE_MAX_CHARS).collect();
    if text.chars().count() > BOOKMARK_TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Bookmark {
    Page {
        path: String,
        title: String,
        timestamp: i64,
    },
    Text {
        path: String,
        title: String,
        text: String,
        range: RangeDescriptor,
        timestamp: i64,
    },
}

impl Bookmark {
    pub fn page(path: impl Into<String>, title: impl Into<String>, timestamp: i64) -> Self {
        Bookmark::Page {
            path: path.into(),
            title: title.into(),
            timestamp,
        }
    }

    pub fn text(
        path: impl Into<String>,
        text: impl Into<String>,
        range: RangeDescriptor,
        timestamp: i64,
    ) -> Self {
        let text = text.into();
        Bookmark::Text {
            path: path.into(),
            title: derived_bookmark_title(&text),
            text,
            range,
            timestamp,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Bookmark::Page { path, .. } | Bookmark::Text { path, .. } => path,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Bookmark::Page { title, .. } | Bookmark::Text { title, .. } => title,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            Bookmark::Page { timestamp, .. } | Bookmark::Text { timestamp, .. } => *timestamp,
        }
    }

    fn key(&self) -> (&str, bool, Option<&str>) {
        match self {
            Bookmark::Page { path, .. } => (path, false, None),
            Bookmark::Text { path, text, .. } => (path, true, Some(text)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BookmarkError {
    #[error("already bookmarked")]
    Duplicate,
}

/// Most-recent-first bookmark list. Uniqueness key is the page path, the
/// bookmark kind, and the selected text for text bookmarks; duplicates are
/// rejected, not merged.
#[derive(Debug, Default)]
pub struct BookmarkStore {
    bookmarks: Vec<Bookmark>,
}

impl BookmarkStore {
    pub fn from_vec(bookmarks: Vec<Bookmark>) -> Self {
        Self { bookmarks }
    }

    pub fn add(&mut self, bookmark: Bookmark) -> Result<(), BookmarkError> {
        if self.bookmarks.iter().any(|b| b.key() == bookmark.key()) {
            return Err(BookmarkError::Duplicate);
        }
        self.bookmarks.insert(0, bookmark);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Option<Bookmark> {
        if index < self.bookmarks.len() {
            Some(self.bookmarks.remove(index))
        } else {
            None
        }
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.bookmarks.len();
        self.bookmarks.clear();
        removed
    }

    pub fn get(&self, index: usize) -> Option<&Bookmark> {
        self.bookmarks.get(index)
    }

    pub fn len(&self) -> usize {
        self.bookmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookmarks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.bookmarks.iter()
    }

    pub fn as_slice(&self) -> &[Bookmark] {
        &self.bookmarks
    }
}

static BOOKMARK_DATE_FORMAT: Lazy<Vec<FormatItem<'static>>> = Lazy::new(|| {
    format_description::parse("[year]-[month]-[day] [hour]:[minute]").expect("valid date format")
});

/// Formats a unix-millisecond bookmark timestamp for listing.
pub fn format_timestamp(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .ok()
        .and_then(|ts| ts.format(&*BOOKMARK_DATE_FORMAT).ok())
        .unwrap_or_else(|| "-".to_string())
}

/// The persisted subset of session state, written synchronously on every
/// mutation and read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistedSession {
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub bookmarks: Vec<Bookmark>,
}

pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<PersistedSession>>;
    fn save(&self, session: &PersistedSession) -> Result<()>;
}

pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state directory at {:?}", root))?;
        Ok(Self {
            path: root.join("session.json"),
        })
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut file = File::open(&self.path)
            .with_context(|| format!("failed to open session file {:?}", self.path))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let session = serde_json::from_str(&buf)
            .with_context(|| format!("failed to decode session file {:?}", self.path))?;
        Ok(Some(session))
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let payload = serde_json::to_string_pretty(session)?;
        let mut file = File::create(&tmp)
            .with_context(|| format!("failed to open temp session file {:?}", tmp))?;
        file.write_all(payload.as_bytes())?;
        file.flush()?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Option<PersistedSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<PersistedSession>> {
        Ok(self.inner.lock().clone())
    }

    fn save(&self, session: &PersistedSession) -> Result<()> {
        *self.inner.lock() = Some(session.clone());
        Ok(())
    }
}

/// What a `load` should do once the page is up. Anchor and range restoration
/// are separate request kinds and never combined in one call.
#[derive(Debug, Clone)]
pub enum LoadKind {
    Plain,
    Anchor(String),
    Range(RangeDescriptor),
}

/// Ordered side effects a navigation produces, drained by the shell.
#[derive(Debug, Clone, PartialEq)]
pub enum NavEffect {
    LoadPage { path: String },
    RestoreAnchor { anchor: String },
    RestoreRange { range: RangeDescriptor },
    HistoryPush { fragment: String },
    Breadcrumb { trail: Vec<String> },
    CollapseSidebar,
    ShowWelcome,
    Notice { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HistorySync {
    /// User-initiated navigation: truncate forward entries and push.
    Push,
    /// Startup deep link: the entry already exists in the browser-equivalent
    /// history, record it without announcing.
    Replace,
    /// Back/forward replay: history cursor already moved.
    Replay,
}

/// The shell's state machine over `Location`. Owns the TOC model, search
/// matcher and bookmark store, and persists the durable subset through the
/// session store on every mutation.
pub struct Session {
    toc: TocModel,
    search: SearchMatcher,
    bookmarks: BookmarkStore,
    theme: Theme,
    tab: SidebarTab,
    store: Arc<dyn SessionStore>,
    current: Option<Location>,
    history: Vec<Location>,
    history_pos: usize,
    small_viewport: bool,
    effects: Vec<NavEffect>,
}

impl Session {
    pub fn new(toc: TocModel, search: SearchMatcher, store: Arc<dyn SessionStore>) -> Self {
        let persisted = match store.load() {
            Ok(persisted) => persisted.unwrap_or_default(),
            Err(err) => {
                warn!(?err, "failed to load persisted session, starting fresh");
                PersistedSession::default()
            }
        };
        Self {
            toc,
            search,
            bookmarks: BookmarkStore::from_vec(persisted.bookmarks),
            theme: persisted.theme,
            tab: SidebarTab::Toc,
            store,
            current: None,
            history: Vec::new(),
            history_pos: 0,
            small_viewport: false,
            effects: Vec::new(),
        }
    }

    /// Reads the startup deep-link fragment once. A missing or malformed
    /// fragment shows the welcome state instead of loading content.
    pub fn startup(&mut self, fragment: Option<&str>) {
        let Some(fragment) = fragment.filter(|f| !f.is_empty()) else {
            self.effects.push(NavEffect::ShowWelcome);
            return;
        };
        let location = parse_location(fragment);
        if !location.path.starts_with(CORPUS_ROOT) {
            debug!(fragment, "startup fragment is not a corpus path");
            self.effects.push(NavEffect::ShowWelcome);
            return;
        }
        let kind = match location.anchor {
            Some(anchor) => LoadKind::Anchor(anchor),
            None => LoadKind::Plain,
        };
        self.load_inner(&location.path, kind, HistorySync::Replace);
    }

    /// Navigation entry point for TOC clicks, search results, bookmark
    /// activation and in-surface relays.
    pub fn load(&mut self, path: &str, kind: LoadKind) {
        self.load_inner(path, kind, HistorySync::Push);
    }

    fn load_inner(&mut self, path: &str, kind: LoadKind, sync: HistorySync) {
        let anchor = match &kind {
            LoadKind::Anchor(anchor) => Some(anchor.clone()),
            _ => None,
        };
        let location = Location {
            path: path.to_string(),
            anchor,
        };

        if !self.toc.set_active_path(path) {
            debug!(path, "no TOC entry for loaded path");
        }
        let trail = self.toc.breadcrumb(path);
        self.effects.push(NavEffect::Breadcrumb { trail });
        self.effects.push(NavEffect::LoadPage {
            path: path.to_string(),
        });
        match kind {
            LoadKind::Anchor(anchor) => self.effects.push(NavEffect::RestoreAnchor { anchor }),
            LoadKind::Range(range) => self.effects.push(NavEffect::RestoreRange { range }),
            LoadKind::Plain => {}
        }
        match sync {
            HistorySync::Push => {
                self.history.truncate(self.history_pos + usize::from(!self.history.is_empty()));
                self.history.push(location.clone());
                self.history_pos = self.history.len() - 1;
                self.effects.push(NavEffect::HistoryPush {
                    fragment: location.fragment(),
                });
            }
            HistorySync::Replace => {
                self.history.push(location.clone());
                self.history_pos = self.history.len() - 1;
            }
            HistorySync::Replay => {}
        }
        if self.small_viewport {
            self.effects.push(NavEffect::CollapseSidebar);
        }
        self.current = Some(location);
    }

    /// Replays the previous history entry with its stored anchor.
    pub fn back(&mut self) -> bool {
        if self.history_pos == 0 || self.history.is_empty() {
            return false;
        }
        self.history_pos -= 1;
        self.replay_current_entry();
        true
    }

    pub fn forward(&mut self) -> bool {
        if self.history.is_empty() || self.history_pos + 1 >= self.history.len() {
            return false;
        }
        self.history_pos += 1;
        self.replay_current_entry();
        true
    }

    fn replay_current_entry(&mut self) {
        let entry = self.history[self.history_pos].clone();
        let kind = match entry.anchor {
            Some(anchor) => LoadKind::Anchor(anchor),
            None => LoadKind::Plain,
        };
        self.load_inner(&entry.path, kind, HistorySync::Replay);
    }

    /// An in-surface navigation request relayed through the frame bridge.
    pub fn handle_relay(&mut self, path: &str, anchor: Option<String>) {
        let kind = match anchor {
            Some(anchor) => LoadKind::Anchor(anchor),
            None => LoadKind::Plain,
        };
        self.load(path, kind);
    }

    pub fn current(&self) -> Option<&Location> {
        self.current.as_ref()
    }

    pub fn drain_effects(&mut self) -> Vec<NavEffect> {
        mem::take(&mut self.effects)
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn toggle_theme(&mut self) -> Theme {
        self.theme = self.theme.toggled();
        self.persist();
        self.theme
    }

    pub fn tab(&self) -> SidebarTab {
        self.tab
    }

    pub fn set_tab(&mut self, tab: SidebarTab) {
        self.tab = tab;
    }

    pub fn set_small_viewport(&mut self, small: bool) {
        self.small_viewport = small;
    }

    pub fn toc(&self) -> &TocModel {
        &self.toc
    }

    pub fn toc_mut(&mut self) -> &mut TocModel {
        &mut self.toc
    }

    pub fn quick_search(&self, query: &str) -> Vec<SearchHit> {
        self.search.quick_search(query)
    }

    pub fn full_search(&self, query: &str) -> SearchResults {
        self.search.full_search(query)
    }

    pub fn bookmarks(&self) -> &BookmarkStore {
        &self.bookmarks
    }

    /// Adds a bookmark, persisting on success. A duplicate is rejected with a
    /// user-visible notice and leaves the store unchanged.
    pub fn add_bookmark(&mut self, bookmark: Bookmark) -> bool {
        match self.bookmarks.add(bookmark) {
            Ok(()) => {
                self.persist();
                true
            }
            Err(BookmarkError::Duplicate) => {
                self.effects.push(NavEffect::Notice {
                    message: "Already bookmarked".to_string(),
                });
                false
            }
        }
    }

    /// Bookmarks the current page, titled from the TOC when it knows the
    /// path.
    pub fn bookmark_current_page(&mut self, now_millis: i64) -> bool {
        let Some(location) = self.current.clone() else {
            return false;
        };
        let title = self
            .toc
            .title_for_path(&location.path)
            .unwrap_or(&location.path)
            .to_string();
        self.add_bookmark(Bookmark::page(location.path, title, now_millis))
    }

    /// Bookmarks a captured text range on the current page.
    pub fn bookmark_selection(
        &mut self,
        text: String,
        range: RangeDescriptor,
        now_millis: i64,
    ) -> bool {
        let Some(location) = self.current.clone() else {
            return false;
        };
        self.add_bookmark(Bookmark::text(location.path, text, range, now_millis))
    }

    pub fn remove_bookmark(&mut self, index: usize) -> Option<Bookmark> {
        let removed = self.bookmarks.remove(index);
        if removed.is_some() {
            self.persist();
        }
        removed
    }

    /// Clears every bookmark. Callers must confirm with the user first,
    /// naming the current count; an empty store is a no-op.
    pub fn clear_bookmarks(&mut self) -> usize {
        if self.bookmarks.is_empty() {
            return 0;
        }
        let removed = self.bookmarks.clear();
        self.persist();
        removed
    }

    /// Activates a bookmark: a page bookmark loads plainly, a text bookmark
    /// loads with its range queued for restoration.
    pub fn open_bookmark(&mut self, index: usize) -> bool {
        let Some(bookmark) = self.bookmarks.get(index).cloned() else {
            return false;
        };
        match bookmark {
            Bookmark::Page { path, .. } => self.load(&path, LoadKind::Plain),
            Bookmark::Text { path, range, .. } => self.load(&path, LoadKind::Range(range)),
        }
        true
    }

    fn persist(&self) {
        let session = PersistedSession {
            theme: self.theme,
            bookmarks: self.bookmarks.as_slice().to_vec(),
        };
        if let Err(err) = self.store.save(&session) {
            warn!(?err, "failed to persist session state");
        }
    }
}

/// Strips the converter's JS wrapper (`const name = <json>;`) from an input
/// artifact, passing bare JSON through untouched.
pub fn strip_js_wrapper(source: &str) -> &str {
    let trimmed = source.trim();
    for keyword in ["const ", "var ", "let "] {
        if let Some(rest) = trimmed.strip_prefix(keyword) {
            if let Some(eq) = rest.find('=') {
                return rest[eq + 1..].trim().trim_end_matches(';').trim_end();
            }
        }
    }
    trimmed
}

pub fn parse_tree_data(source: &str) -> Result<TocNode> {
    serde_json::from_str(strip_js_wrapper(source)).context("failed to decode TOC tree data")
}

pub fn parse_search_index(source: &str) -> Result<Vec<SearchEntry>> {
    serde_json::from_str(strip_js_wrapper(source)).context("failed to decode search index")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(title: &str, path: &str) -> TocNode {
        TocNode {
            title: title.to_string(),
            path: Some(path.to_string()),
            children: Vec::new(),
        }
    }

    fn folder(title: &str, children: Vec<TocNode>) -> TocNode {
        TocNode {
            title: title.to_string(),
            path: None,
            children,
        }
    }

    fn root(children: Vec<TocNode>) -> TocNode {
        TocNode {
            title: "root".to_string(),
            path: None,
            children,
        }
    }

    fn descriptor() -> RangeDescriptor {
        RangeDescriptor {
            start_path: StructuralPath {
                steps: vec![PathStep {
                    tag: "p".to_string(),
                    sibling_index: None,
                }],
                text_index: Some(0),
            },
            start_offset: 0,
            end_path: StructuralPath {
                steps: vec![PathStep {
                    tag: "p".to_string(),
                    sibling_index: None,
                }],
                text_index: Some(0),
            },
            end_offset: 4,
        }
    }

    fn session_with(toc: TocModel) -> Session {
        Session::new(toc, SearchMatcher::default(), Arc::new(MemorySessionStore::new()))
    }

    #[test]
    fn parse_location_splits_anchor_after_html_extension() {
        let location = parse_location("content/a/b.html#sec1");
        assert_eq!(location.path, "content/a/b.html");
        assert_eq!(location.anchor.as_deref(), Some("#sec1"));
    }

    #[test]
    fn parse_location_without_anchor() {
        let location = parse_location("content/a/b.html");
        assert_eq!(location.path, "content/a/b.html");
        assert_eq!(location.anchor, None);
    }

    #[test]
    fn parse_location_keeps_hash_inside_filename() {
        let location = parse_location("content/c#-guide.html");
        assert_eq!(location.path, "content/c#-guide.html");
        assert_eq!(location.anchor, None);

        let location = parse_location("other");
        assert_eq!(location.path, "other");
        assert_eq!(location.anchor, None);
    }

    #[test]
    fn resolve_content_path_rewrites_markdown_once() {
        assert_eq!(resolve_content_path("intro.md"), "content/intro.html");
        assert_eq!(resolve_content_path("a/b.html"), "content/a/b.html");
        assert_eq!(resolve_content_path("content/x.html"), "content/x.html");
    }

    #[test]
    fn toc_build_classifies_nodes() {
        let tree = root(vec![
            folder("Guide", vec![leaf("Intro", "intro.md")]),
            TocNode {
                title: "Reference".to_string(),
                path: Some("ref.html".to_string()),
                children: vec![leaf("Detail", "detail.html")],
            },
        ]);
        let model = TocModel::build(&tree);
        assert_eq!(model.len(), 4);
        assert_eq!(model.entries()[0].kind, TocEntryKind::Folder);
        assert_eq!(model.entries()[1].kind, TocEntryKind::Leaf);
        assert_eq!(
            model.entries()[1].path.as_deref(),
            Some("content/intro.html")
        );
        assert_eq!(model.entries()[2].kind, TocEntryKind::ClickableFolder);
        assert_eq!(model.entries()[2].path.as_deref(), Some("content/ref.html"));
    }

    #[test]
    fn set_active_path_reveals_ancestors() {
        let tree = root(vec![folder(
            "Outer",
            vec![folder("Inner", vec![leaf("Page", "page.html")])],
        )]);
        let mut model = TocModel::build(&tree);
        assert!(!model.is_expanded(0));
        assert!(model.set_active_path("content/page.html"));
        assert!(model.is_expanded(0));
        assert!(model.is_expanded(1));
        assert_eq!(model.active(), Some(2));
        assert_eq!(
            model.breadcrumb("content/page.html"),
            vec!["Outer", "Inner", "Page"]
        );
    }

    #[test]
    fn visible_indices_respect_collapse_state() {
        let tree = root(vec![folder("Outer", vec![leaf("Page", "page.html")])]);
        let mut model = TocModel::build(&tree);
        assert_eq!(model.visible_indices(), vec![0]);
        model.toggle_expanded(0);
        assert_eq!(model.visible_indices(), vec![0, 1]);
    }

    #[test]
    fn short_queries_produce_no_results() {
        let matcher = SearchMatcher::new(vec![SearchEntry {
            path: "content/a.html".to_string(),
            title: "A".to_string(),
            content: "alpha beta".to_string(),
        }]);
        assert!(matcher.quick_search("").is_empty());
        assert!(matcher.quick_search("a").is_empty());
        assert_eq!(matcher.full_search("a").total, 0);
        assert_eq!(matcher.quick_search("al").len(), 1);
    }

    #[test]
    fn quick_search_caps_results_and_full_search_does_not() {
        let entries: Vec<SearchEntry> = (0..15)
            .map(|i| SearchEntry {
                path: format!("content/{i}.html"),
                title: format!("Page {i}"),
                content: "needle in the haystack".to_string(),
            })
            .collect();
        let matcher = SearchMatcher::new(entries);
        assert_eq!(matcher.quick_search("needle").len(), QUICK_RESULT_LIMIT);
        let full = matcher.full_search("needle");
        assert_eq!(full.total, 15);
        assert_eq!(full.hits.len(), 15);
    }

    #[test]
    fn search_is_case_insensitive_and_reports_spans() {
        let matcher = SearchMatcher::new(vec![SearchEntry {
            path: "content/a.html".to_string(),
            title: "Widget Setup".to_string(),
            content: "Install the widget before use.".to_string(),
        }]);
        let hits = matcher.quick_search("WIDGET");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title_spans, vec![(0, 6)]);
        let (start, end) = hits[0].preview_spans[0];
        assert_eq!(&hits[0].preview[start..end], "widget");
    }

    #[test]
    fn derived_title_truncates_long_selections() {
        assert_eq!(derived_bookmark_title("short"), "short");
        let long = "abcdefghijklmnopqrstuvwxyz";
        assert_eq!(derived_bookmark_title(long), "abcdefghijklmnopqrst...");
    }

    #[test]
    fn duplicate_page_bookmark_is_rejected() {
        let mut store = BookmarkStore::default();
        store
            .add(Bookmark::page("content/a.html", "A", 1))
            .unwrap();
        assert_eq!(
            store.add(Bookmark::page("content/a.html", "A", 2)),
            Err(BookmarkError::Duplicate)
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn text_bookmarks_differ_by_selected_text() {
        let mut store = BookmarkStore::default();
        store
            .add(Bookmark::text("content/a.html", "first", descriptor(), 1))
            .unwrap();
        store
            .add(Bookmark::text("content/a.html", "second", descriptor(), 2))
            .unwrap();
        assert_eq!(store.len(), 2);
        // Most-recent-first.
        assert_eq!(store.get(0).unwrap().title(), "second");
        assert_eq!(
            store.add(Bookmark::text("content/a.html", "first", descriptor(), 3)),
            Err(BookmarkError::Duplicate)
        );
    }

    #[test]
    fn page_and_text_bookmarks_do_not_collide() {
        let mut store = BookmarkStore::default();
        store
            .add(Bookmark::page("content/a.html", "A", 1))
            .unwrap();
        store
            .add(Bookmark::text("content/a.html", "excerpt", descriptor(), 2))
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn file_session_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("state")).unwrap();
        assert!(store.load().unwrap().is_none());

        let mut session = PersistedSession::default();
        session.theme = Theme::Dark;
        session
            .bookmarks
            .push(Bookmark::text("content/a.html", "excerpt", descriptor(), 42));
        store.save(&session).unwrap();

        let restored = store.load().unwrap().unwrap();
        assert_eq!(restored.theme, Theme::Dark);
        assert_eq!(restored.bookmarks.len(), 1);
        match &restored.bookmarks[0] {
            Bookmark::Text { text, range, .. } => {
                assert_eq!(text, "excerpt");
                assert_eq!(*range, descriptor());
            }
            other => panic!("unexpected bookmark: {:?}", other),
        }
    }

    #[test]
    fn bookmark_json_uses_tagged_union() {
        let json = serde_json::to_string(&Bookmark::page("content/a.html", "A", 5)).unwrap();
        assert!(json.contains("\"type\":\"page\""));
        let back: Bookmark = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path(), "content/a.html");
    }

    #[test]
    fn toc_click_scenario_pushes_fragment() {
        let tree = root(vec![folder("Guide", vec![leaf("Intro", "intro.md")])]);
        let model = TocModel::build(&tree);
        assert_eq!(
            model.entries()[1].path.as_deref(),
            Some("content/intro.html")
        );

        let mut session = session_with(model);
        session.load("content/intro.html", LoadKind::Plain);
        let location = session.current().unwrap();
        assert_eq!(location.path, "content/intro.html");
        assert_eq!(location.anchor, None);

        let effects = session.drain_effects();
        assert!(effects.contains(&NavEffect::LoadPage {
            path: "content/intro.html".to_string()
        }));
        assert!(effects.contains(&NavEffect::HistoryPush {
            fragment: "#content/intro.html".to_string()
        }));
    }

    #[test]
    fn back_and_forward_replay_stored_anchor() {
        let mut session = session_with(TocModel::default());
        session.load("content/a.html", LoadKind::Plain);
        session.load("content/b.html", LoadKind::Anchor("#sec2".to_string()));
        session.drain_effects();

        assert!(session.back());
        assert_eq!(session.current().unwrap().path, "content/a.html");
        let effects = session.drain_effects();
        assert!(!effects
            .iter()
            .any(|e| matches!(e, NavEffect::HistoryPush { .. })));

        assert!(session.forward());
        let location = session.current().unwrap();
        assert_eq!(location.path, "content/b.html");
        assert_eq!(location.anchor.as_deref(), Some("#sec2"));
        let effects = session.drain_effects();
        assert!(effects.contains(&NavEffect::RestoreAnchor {
            anchor: "#sec2".to_string()
        }));
    }

    #[test]
    fn new_navigation_truncates_forward_history() {
        let mut session = session_with(TocModel::default());
        session.load("content/a.html", LoadKind::Plain);
        session.load("content/b.html", LoadKind::Plain);
        assert!(session.back());
        session.load("content/c.html", LoadKind::Plain);
        assert!(!session.forward());
        assert!(session.back());
        assert_eq!(session.current().unwrap().path, "content/a.html");
    }

    #[test]
    fn startup_without_fragment_shows_welcome() {
        let mut session = session_with(TocModel::default());
        session.startup(None);
        assert_eq!(session.drain_effects(), vec![NavEffect::ShowWelcome]);
        assert!(session.current().is_none());

        session.startup(Some("not-a-corpus-path"));
        assert_eq!(session.drain_effects(), vec![NavEffect::ShowWelcome]);
    }

    #[test]
    fn startup_fragment_loads_without_history_push() {
        let mut session = session_with(TocModel::default());
        session.startup(Some("content/a/b.html#sec1"));
        let effects = session.drain_effects();
        assert!(effects.contains(&NavEffect::LoadPage {
            path: "content/a/b.html".to_string()
        }));
        assert!(effects.contains(&NavEffect::RestoreAnchor {
            anchor: "#sec1".to_string()
        }));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, NavEffect::HistoryPush { .. })));
    }

    #[test]
    fn open_text_bookmark_queues_range_restore() {
        let mut session = session_with(TocModel::default());
        session.load("content/a.html", LoadKind::Plain);
        session.drain_effects();
        assert!(session.bookmark_selection("excerpt".to_string(), descriptor(), 7));
        assert!(session.open_bookmark(0));
        let effects = session.drain_effects();
        assert!(effects.contains(&NavEffect::RestoreRange {
            range: descriptor()
        }));
    }

    #[test]
    fn duplicate_bookmark_emits_notice_and_keeps_store() {
        let mut session = session_with(TocModel::default());
        session.load("content/a.html", LoadKind::Plain);
        session.drain_effects();
        assert!(session.bookmark_current_page(1));
        assert!(!session.bookmark_current_page(2));
        assert_eq!(session.bookmarks().len(), 1);
        let effects = session.drain_effects();
        assert!(effects
            .iter()
            .any(|e| matches!(e, NavEffect::Notice { .. })));
    }

    #[test]
    fn clear_bookmarks_is_noop_when_empty() {
        let mut session = session_with(TocModel::default());
        assert_eq!(session.clear_bookmarks(), 0);
        session.load("content/a.html", LoadKind::Plain);
        session.bookmark_current_page(1);
        assert_eq!(session.clear_bookmarks(), 1);
        assert!(session.bookmarks().is_empty());
    }

    #[test]
    fn small_viewport_collapses_sidebar_on_load() {
        let mut session = session_with(TocModel::default());
        session.set_small_viewport(true);
        session.load("content/a.html", LoadKind::Plain);
        assert!(session
            .drain_effects()
            .contains(&NavEffect::CollapseSidebar));
    }

    #[test]
    fn strip_js_wrapper_handles_converter_output() {
        assert_eq!(strip_js_wrapper("const treeData = {\"a\":1};"), "{\"a\":1}");
        assert_eq!(strip_js_wrapper("var searchIndex = [];"), "[]");
        assert_eq!(strip_js_wrapper("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn parse_tree_data_accepts_converter_shape() {
        let source = r#"const treeData = {
            "title": "Manual",
            "path": "",
            "type": "Folder",
            "children": [
                {"title": "Intro", "path": "intro.htm", "type": "File", "children": []}
            ]
        };"#;
        let tree = parse_tree_data(source).unwrap();
        assert_eq!(tree.title, "Manual");
        assert_eq!(tree.path, None);
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].path.as_deref(), Some("intro.htm"));
    }

    #[test]
    fn parse_search_index_defaults_missing_content() {
        let entries =
            parse_search_index(r#"[{"path": "content/a.html", "title": "A"}]"#).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "");
    }

    #[test]
    fn format_timestamp_renders_date() {
        let rendered = format_timestamp(0);
        assert!(rendered.starts_with("1970-01-01"));
    }
}
