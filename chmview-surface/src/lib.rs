use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use chmview_core::{RangeDescriptor, Theme, CORPUS_ROOT};
use chmview_page::{capture, restore, Boundary, Document, HighlightRect, Layout, SelectionRange};

/// Delay between injection and a deferred anchor scroll, giving the agent
/// time to finish attaching.
const ANCHOR_SCROLL_DELAY: Duration = Duration::from_millis(100);
/// Delay before a deferred range restore is first attempted.
const RANGE_SCROLL_DELAY: Duration = Duration::from_millis(150);
/// Backoff before the single range-restore retry when the agent is not yet
/// observable.
const RANGE_RETRY_DELAY: Duration = Duration::from_millis(200);
/// Debounce between the selection gesture ending and the selection read.
const SELECTION_DEBOUNCE: Duration = Duration::from_millis(300);
/// How long restored-range highlight overlays stay visible before fading.
const HIGHLIGHT_DURATION: Duration = Duration::from_secs(3);

/// Messages the content surface sends to the shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SurfaceToShell {
    NavigateToContent {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor: Option<String>,
    },
    TextSelected {
        text: String,
        x: u16,
        y: u16,
        range: RangeDescriptor,
    },
    SelectionCleared,
    PageLoaded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    RequestTheme,
}

/// Messages the shell sends into the content surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ShellToSurface {
    /// Initial agent configuration, sent once after a successful injection.
    AgentInit { corpus_root: String, theme: Theme },
    ThemeChange {
        theme: Theme,
    },
    ScrollToBookmark {
        range: RangeDescriptor,
        generation: u64,
        path: String,
    },
    ScrollToAnchor {
        anchor: String,
        generation: u64,
        path: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed surface message: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Decodes one wire message from the surface. Unknown or malformed payloads
/// are an error, never silently ignored.
pub fn decode_surface_message(raw: &str) -> Result<SurfaceToShell, ProtocolError> {
    Ok(serde_json::from_str(raw)?)
}

pub fn encode_shell_message(msg: &ShellToSurface) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(msg)?)
}

/// Source of rendered corpus pages, addressed by corpus-relative path.
#[async_trait]
pub trait PageProvider: Send + Sync {
    async fn fetch(&self, path: &str) -> Result<String>;
}

/// Pages served from the converter's output directory on disk.
pub struct FileCorpus {
    root: PathBuf,
}

impl FileCorpus {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl PageProvider for FileCorpus {
    async fn fetch(&self, path: &str) -> Result<String> {
        let full = self.root.join(path);
        std::fs::read_to_string(&full)
            .with_context(|| format!("reading corpus page {}", full.display()))
    }
}

/// Whether the per-load agent has attached its listeners in the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Inactive,
    Ready,
}

/// Renderable snapshot of the surface, shared with the shell's drawing code.
#[derive(Debug, Clone, Default)]
pub struct SurfaceView {
    pub title: Option<String>,
    pub lines: Vec<String>,
    pub scroll_line: usize,
    pub highlights: Vec<HighlightRect>,
    pub theme: Theme,
}

enum SurfaceCmd {
    Load {
        path: String,
        generation: u64,
    },
    Inject {
        reply: oneshot::Sender<bool>,
    },
    Deliver(ShellToSurface),
    /// Deferred restore delivery; the ack is false when the agent marker is
    /// not yet observable and the sender may retry.
    Restore {
        msg: ShellToSurface,
        ack: oneshot::Sender<bool>,
    },
    Activate {
        line: usize,
        col: usize,
    },
    Select {
        start: (usize, usize),
        end: (usize, usize),
        x: u16,
        y: u16,
    },
    ClearSelection,
    Resize {
        width: usize,
    },
}

/// Shell-side handle to the content surface: the only channel between the
/// two contexts. All communication is message passing; the shell never
/// touches the surface's document directly.
pub struct FrameBridge {
    cmd_tx: mpsc::Sender<SurfaceCmd>,
    events_rx: mpsc::Receiver<SurfaceToShell>,
    view: Arc<Mutex<SurfaceView>>,
    generation: u64,
    current_path: Option<String>,
    theme: Theme,
}

impl FrameBridge {
    /// Spawns the surface execution context and returns the shell handle.
    pub fn new(provider: Arc<dyn PageProvider>, width: usize) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (shell_tx, events_rx) = mpsc::channel(64);
        let view = Arc::new(Mutex::new(SurfaceView::default()));
        let task = SurfaceTask {
            provider,
            view: Arc::clone(&view),
            shell_tx,
            width,
            corpus_root: CORPUS_ROOT.to_string(),
            page: None,
            pending_selection: None,
            selection_deadline: None,
            highlight_deadline: None,
        };
        tokio::spawn(task.run(cmd_rx));
        FrameBridge {
            cmd_tx,
            events_rx,
            view,
            generation: 0,
            current_path: None,
            theme: Theme::default(),
        }
    }

    pub fn view(&self) -> Arc<Mutex<SurfaceView>> {
        Arc::clone(&self.view)
    }

    pub fn current_path(&self) -> Option<&str> {
        self.current_path.as_deref()
    }

    /// Navigates the surface to a corpus page. Each load supersedes earlier
    /// deferred restores by bumping the generation.
    pub async fn load(&mut self, path: &str) -> Result<()> {
        self.generation += 1;
        self.current_path = Some(path.to_string());
        self.cmd_tx
            .send(SurfaceCmd::Load {
                path: path.to_string(),
                generation: self.generation,
            })
            .await
            .map_err(|_| anyhow!("content surface is gone"))
    }

    /// Attempts agent injection for the current load. Idempotent: a second
    /// call on the same surface instance is a no-op that still reports
    /// success. Returns false when the surface document has no body, in
    /// which case anchor/range restoration must be skipped for this load.
    pub async fn inject_agent(&mut self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SurfaceCmd::Inject { reply: reply_tx })
            .await
            .is_err()
        {
            return false;
        }
        let Ok(injected) = reply_rx.await else {
            return false;
        };
        if injected {
            let _ = self
                .cmd_tx
                .send(SurfaceCmd::Deliver(ShellToSurface::AgentInit {
                    corpus_root: CORPUS_ROOT.to_string(),
                    theme: self.theme,
                }))
                .await;
        }
        injected
    }

    /// Schedules a deferred in-page anchor scroll for the current load.
    pub fn request_anchor_scroll(&self, anchor: &str) {
        let Some(path) = self.current_path.clone() else {
            return;
        };
        let msg = ShellToSurface::ScrollToAnchor {
            anchor: anchor.to_string(),
            generation: self.generation,
            path,
        };
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            time::sleep(ANCHOR_SCROLL_DELAY).await;
            let (ack_tx, ack_rx) = oneshot::channel();
            if cmd_tx
                .send(SurfaceCmd::Restore { msg, ack: ack_tx })
                .await
                .is_ok()
            {
                let _ = ack_rx.await;
            }
        });
    }

    /// Schedules a deferred bookmark-range restore for the current load,
    /// retrying once if the agent is not yet observable.
    pub fn request_range_scroll(&self, range: RangeDescriptor) {
        let Some(path) = self.current_path.clone() else {
            return;
        };
        let msg = ShellToSurface::ScrollToBookmark {
            range,
            generation: self.generation,
            path,
        };
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            time::sleep(RANGE_SCROLL_DELAY).await;
            if deliver_restore(&cmd_tx, msg.clone()).await == Some(false) {
                debug!("agent not ready for range restore, retrying once");
                time::sleep(RANGE_RETRY_DELAY).await;
                deliver_restore(&cmd_tx, msg).await;
            }
        });
    }

    pub async fn set_theme(&mut self, theme: Theme) {
        self.theme = theme;
        let _ = self
            .cmd_tx
            .send(SurfaceCmd::Deliver(ShellToSurface::ThemeChange { theme }))
            .await;
    }

    /// Next surface→shell message, if the surface is still alive.
    pub async fn next_event(&mut self) -> Option<SurfaceToShell> {
        self.events_rx.recv().await
    }

    /// Non-blocking variant for shells that interleave surface messages with
    /// their own input polling.
    pub fn try_next_event(&mut self) -> Option<SurfaceToShell> {
        self.events_rx.try_recv().ok()
    }

    /// Forwards a link-activation gesture at a layout position.
    pub async fn activate(&self, line: usize, col: usize) {
        let _ = self.cmd_tx.send(SurfaceCmd::Activate { line, col }).await;
    }

    /// Forwards the end of a selection gesture; the agent reads the
    /// selection after its debounce.
    pub async fn select_text(&self, start: (usize, usize), end: (usize, usize), x: u16, y: u16) {
        let _ = self
            .cmd_tx
            .send(SurfaceCmd::Select { start, end, x, y })
            .await;
    }

    pub async fn clear_selection(&self) {
        let _ = self.cmd_tx.send(SurfaceCmd::ClearSelection).await;
    }

    pub async fn resize(&self, width: usize) {
        let _ = self.cmd_tx.send(SurfaceCmd::Resize { width }).await;
    }
}

async fn deliver_restore(cmd_tx: &mpsc::Sender<SurfaceCmd>, msg: ShellToSurface) -> Option<bool> {
    let (ack_tx, ack_rx) = oneshot::channel();
    cmd_tx
        .send(SurfaceCmd::Restore { msg, ack: ack_tx })
        .await
        .ok()?;
    ack_rx.await.ok()
}

/// What a link activation should do, after the agent's skip rules and the
/// corpus-relative resolution algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Same-document fragment; handled in place, never messaged.
    SameDocument { anchor: String },
    /// External or non-navigational target; left to default handling.
    External,
    /// Corpus page, resolved against the corpus root.
    Content { path: String, anchor: Option<String> },
}

pub fn classify_href(current_path: &str, href: &str) -> LinkAction {
    classify_href_with_root(CORPUS_ROOT, current_path, href)
}

fn classify_href_with_root(corpus_root: &str, current_path: &str, href: &str) -> LinkAction {
    let href = href.trim();
    if href.starts_with('#') {
        return LinkAction::SameDocument {
            anchor: href.to_string(),
        };
    }
    let lower = href.to_ascii_lowercase();
    if lower.starts_with("http://")
        || lower.starts_with("https://")
        || href.starts_with("//")
        || lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
    {
        return LinkAction::External;
    }

    // Split at the first '#'; the anchor keeps its '#'.
    let (mut target, anchor) = match href.find('#') {
        Some(idx) => (href[..idx].to_string(), Some(href[idx..].to_string())),
        None => (href.to_string(), None),
    };
    if let Some(stripped) = target.strip_prefix('/') {
        target = stripped.to_string();
    }
    if let Some(stripped) = target.strip_prefix("./") {
        target = stripped.to_string();
    }

    // Current page's directory, relative to the corpus root.
    let tail = current_path
        .strip_prefix(corpus_root)
        .unwrap_or(current_path);
    let mut dir: Vec<&str> = tail.split('/').filter(|part| !part.is_empty()).collect();
    dir.pop();

    let mut climbed = false;
    while let Some(stripped) = target.strip_prefix("../") {
        target = stripped.to_string();
        dir.pop();
        climbed = true;
    }
    let joined = if climbed || !target.contains('/') {
        let mut prefix = String::new();
        for part in &dir {
            prefix.push_str(part);
            prefix.push('/');
        }
        format!("{prefix}{target}")
    } else {
        target
    };
    // Avoid doubling the root marker, then re-prepend it exactly once.
    let bare = joined.strip_prefix(corpus_root).unwrap_or(&joined);
    LinkAction::Content {
        path: format!("{corpus_root}{bare}"),
        anchor,
    }
}

struct PendingSelection {
    start: (usize, usize),
    end: (usize, usize),
    x: u16,
    y: u16,
}

struct PageState {
    path: String,
    generation: u64,
    doc: Document,
    layout: Layout,
    agent: AgentState,
    /// Attached click-listener count; stays at one across repeated
    /// injections on the same surface instance.
    listeners: u32,
}

/// The surface execution context: owns the loaded document and the agent
/// state, reachable only through the command channel.
struct SurfaceTask {
    provider: Arc<dyn PageProvider>,
    view: Arc<Mutex<SurfaceView>>,
    shell_tx: mpsc::Sender<SurfaceToShell>,
    width: usize,
    corpus_root: String,
    page: Option<PageState>,
    pending_selection: Option<PendingSelection>,
    selection_deadline: Option<Instant>,
    highlight_deadline: Option<Instant>,
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

impl SurfaceTask {
    async fn run(mut self, mut rx: mpsc::Receiver<SurfaceCmd>) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                _ = deadline_sleep(self.selection_deadline) => {
                    self.selection_deadline = None;
                    self.read_selection().await;
                }
                _ = deadline_sleep(self.highlight_deadline) => {
                    self.highlight_deadline = None;
                    self.view.lock().highlights.clear();
                }
            }
        }
    }

    async fn handle(&mut self, cmd: SurfaceCmd) {
        match cmd {
            SurfaceCmd::Load { path, generation } => self.load(path, generation).await,
            SurfaceCmd::Inject { reply } => {
                let injected = match &mut self.page {
                    Some(page) if page.doc.body().is_some() => {
                        if page.agent == AgentState::Inactive {
                            page.agent = AgentState::Ready;
                            page.listeners += 1;
                        }
                        true
                    }
                    _ => false,
                };
                let _ = reply.send(injected);
            }
            SurfaceCmd::Deliver(msg) => self.apply_message(msg),
            SurfaceCmd::Restore { msg, ack } => {
                let handled = match &self.page {
                    Some(page) if page.agent == AgentState::Inactive => false,
                    _ => {
                        self.apply_message(msg);
                        true
                    }
                };
                let _ = ack.send(handled);
            }
            SurfaceCmd::Activate { line, col } => self.activate(line, col).await,
            SurfaceCmd::Select { start, end, x, y } => {
                if self.agent_ready() {
                    self.pending_selection = Some(PendingSelection { start, end, x, y });
                    self.selection_deadline = Some(Instant::now() + SELECTION_DEBOUNCE);
                }
            }
            SurfaceCmd::ClearSelection => {
                self.pending_selection = None;
                self.selection_deadline = None;
                if self.agent_ready() {
                    self.send(SurfaceToShell::SelectionCleared).await;
                }
            }
            SurfaceCmd::Resize { width } => {
                self.width = width;
                if let Some(page) = &mut self.page {
                    page.layout = Layout::build(&page.doc, width);
                    let mut view = self.view.lock();
                    view.lines = page.layout.lines().iter().map(|l| l.text.clone()).collect();
                    view.highlights.clear();
                }
            }
        }
    }

    fn agent_ready(&self) -> bool {
        matches!(&self.page, Some(page) if page.agent == AgentState::Ready)
    }

    async fn load(&mut self, path: String, generation: u64) {
        self.pending_selection = None;
        self.selection_deadline = None;
        self.highlight_deadline = None;
        match self.provider.fetch(&path).await {
            Ok(html) => {
                let doc = Document::parse(&html);
                let layout = Layout::build(&doc, self.width);
                let title = doc.title().map(str::to_string);
                {
                    let mut view = self.view.lock();
                    view.title = title.clone();
                    view.lines = layout.lines().iter().map(|l| l.text.clone()).collect();
                    view.scroll_line = 0;
                    view.highlights.clear();
                }
                debug!(%path, generation, "surface loaded page");
                self.page = Some(PageState {
                    path,
                    generation,
                    doc,
                    layout,
                    agent: AgentState::Inactive,
                    listeners: 0,
                });
                self.send(SurfaceToShell::PageLoaded { title }).await;
                self.send(SurfaceToShell::RequestTheme).await;
            }
            Err(err) => {
                warn!(%path, error = %err, "failed to load corpus page");
                {
                    let mut view = self.view.lock();
                    view.title = None;
                    view.lines = vec![format!("Failed to load {path}")];
                    view.scroll_line = 0;
                    view.highlights.clear();
                }
                self.page = None;
                self.send(SurfaceToShell::PageLoaded { title: None }).await;
            }
        }
    }

    fn apply_message(&mut self, msg: ShellToSurface) {
        match msg {
            ShellToSurface::AgentInit { corpus_root, theme } => {
                self.corpus_root = corpus_root;
                self.view.lock().theme = theme;
            }
            ShellToSurface::ThemeChange { theme } => {
                self.view.lock().theme = theme;
            }
            ShellToSurface::ScrollToBookmark {
                range,
                generation,
                path,
            } => {
                let Some(page) = self.current_page(generation, &path) else {
                    return;
                };
                match restore(&page.doc, &range) {
                    Ok(resolved) => {
                        let rects = page.layout.rects_for_range(&resolved);
                        let mut view = self.view.lock();
                        if let Some(first) = rects.first() {
                            view.scroll_line = first.line;
                        }
                        view.highlights = rects;
                        drop(view);
                        self.highlight_deadline = Some(Instant::now() + HIGHLIGHT_DURATION);
                    }
                    Err(err) => {
                        warn!(%path, error = %err, "range restore failed, skipping highlight");
                    }
                }
            }
            ShellToSurface::ScrollToAnchor {
                anchor,
                generation,
                path,
            } => {
                let Some(page) = self.current_page(generation, &path) else {
                    return;
                };
                match page
                    .doc
                    .anchor_target(&anchor)
                    .and_then(|node| page.layout.first_line_at_or_after(node))
                {
                    Some(line) => self.view.lock().scroll_line = line,
                    None => debug!(%path, %anchor, "anchor target not found"),
                }
            }
        }
    }

    /// The loaded page, only if it is still the one the deferred request was
    /// issued against. A fast follow-up navigation otherwise leaves a stale
    /// request behind, which is dropped here.
    fn current_page(&self, generation: u64, path: &str) -> Option<&PageState> {
        match &self.page {
            Some(page) if page.generation == generation && page.path == path => Some(page),
            Some(page) => {
                debug!(
                    requested = %path,
                    current = %page.path,
                    "dropping stale restore request"
                );
                None
            }
            None => None,
        }
    }

    async fn activate(&mut self, line: usize, col: usize) {
        let Some(page) = &self.page else {
            return;
        };
        if page.agent != AgentState::Ready {
            return;
        }
        let Some(Boundary { node, .. }) = page.layout.position_at(line, col) else {
            return;
        };
        // Walk up to the enclosing anchor element.
        let mut cursor = Some(node);
        let href = loop {
            let Some(id) = cursor else {
                return;
            };
            if page.doc.tag(id) == Some("a") {
                if let Some(href) = page.doc.attr(id, "href") {
                    break href.to_string();
                }
            }
            cursor = page.doc.parent(id);
        };
        match classify_href_with_root(&self.corpus_root, &page.path, &href) {
            LinkAction::SameDocument { anchor } => {
                if let Some(target_line) = page
                    .doc
                    .anchor_target(&anchor)
                    .and_then(|node| page.layout.first_line_at_or_after(node))
                {
                    self.view.lock().scroll_line = target_line;
                }
            }
            LinkAction::External => {
                debug!(%href, "leaving external link to default handling");
            }
            LinkAction::Content { path, anchor } => {
                let listeners = page.listeners;
                for _ in 0..listeners {
                    self.send(SurfaceToShell::NavigateToContent {
                        path: path.clone(),
                        anchor: anchor.clone(),
                    })
                    .await;
                }
            }
        }
    }

    async fn read_selection(&mut self) {
        let Some(pending) = self.pending_selection.take() else {
            return;
        };
        let Some(page) = &self.page else {
            return;
        };
        let (Some(start), Some(end)) = (
            page.layout.position_at(pending.start.0, pending.start.1),
            page.layout.position_at(pending.end.0, pending.end.1),
        ) else {
            self.send(SurfaceToShell::SelectionCleared).await;
            return;
        };
        let resolved = chmview_page::ResolvedRange { start, end };
        let text = resolved.text(&page.doc);
        if text.trim().is_empty() {
            self.send(SurfaceToShell::SelectionCleared).await;
            return;
        }
        let Some(range) = capture(&page.doc, SelectionRange { start, end }) else {
            self.send(SurfaceToShell::SelectionCleared).await;
            return;
        };
        self.send(SurfaceToShell::TextSelected {
            text,
            x: pending.x,
            y: pending.y,
            range,
        })
        .await;
    }

    async fn send(&self, msg: SurfaceToShell) {
        if self.shell_tx.send(msg).await.is_err() {
            debug!("shell side of the bridge is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tokio::time::timeout;

    const NESTED_PAGE: &str = concat!(
        "<html><head><title>Nested</title></head><body>",
        "<p><a href=\"e.html\">sibling</a></p>",
        "<p><a href=\"../c/d.html\">parent</a></p>",
        "<p><a href=\"/content/x.html\">rooted</a></p>",
        "</body></html>"
    );

    const INTRO_PAGE: &str = concat!(
        "<html><head><title>Intro</title></head><body>",
        "<p>Welcome readers to the opening chapter of the guide</p>",
        "<p>Second paragraph follows with more prose to scroll past</p>",
        "<p><a name=\"finale\"></a>Closing remarks live down here</p>",
        "</body></html>"
    );

    fn corpus() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("content/a/b")).unwrap();
        fs::write(root.join("content/intro.html"), INTRO_PAGE).unwrap();
        fs::write(root.join("content/a/b/page.html"), NESTED_PAGE).unwrap();
        fs::write(root.join("content/bare.html"), "no markup at all").unwrap();
        dir
    }

    fn bridge_for(dir: &tempfile::TempDir) -> FrameBridge {
        let provider: Arc<dyn PageProvider> = Arc::new(FileCorpus::new(dir.path()));
        FrameBridge::new(provider, 30)
    }

    async fn next(bridge: &mut FrameBridge) -> SurfaceToShell {
        timeout(Duration::from_secs(2), bridge.next_event())
            .await
            .expect("surface event")
            .expect("surface alive")
    }

    async fn drain_load(bridge: &mut FrameBridge, title: Option<&str>) {
        assert_eq!(
            next(bridge).await,
            SurfaceToShell::PageLoaded {
                title: title.map(str::to_string)
            }
        );
        if title.is_some() {
            assert_eq!(next(bridge).await, SurfaceToShell::RequestTheme);
        }
    }

    #[test]
    fn href_resolution_follows_corpus_layout() {
        let page = "content/a/b/page.html";
        assert_eq!(
            classify_href(page, "../c/d.html"),
            LinkAction::Content {
                path: "content/a/c/d.html".to_string(),
                anchor: None
            }
        );
        assert_eq!(
            classify_href(page, "e.html"),
            LinkAction::Content {
                path: "content/a/b/e.html".to_string(),
                anchor: None
            }
        );
        assert_eq!(
            classify_href(page, "/content/x.html"),
            LinkAction::Content {
                path: "content/x.html".to_string(),
                anchor: None
            }
        );
        assert_eq!(
            classify_href(page, "./f.html"),
            LinkAction::Content {
                path: "content/a/b/f.html".to_string(),
                anchor: None
            }
        );
        assert_eq!(
            classify_href(page, "other.html#sec2"),
            LinkAction::Content {
                path: "content/a/b/other.html".to_string(),
                anchor: Some("#sec2".to_string())
            }
        );
    }

    #[test]
    fn href_skip_rules_hold() {
        let page = "content/intro.html";
        assert_eq!(
            classify_href(page, "#local"),
            LinkAction::SameDocument {
                anchor: "#local".to_string()
            }
        );
        assert_eq!(classify_href(page, "https://example.com/x"), LinkAction::External);
        assert_eq!(classify_href(page, "//cdn.example.com/x"), LinkAction::External);
        assert_eq!(classify_href(page, "javascript:void(0)"), LinkAction::External);
        assert_eq!(classify_href(page, "mailto:docs@example.com"), LinkAction::External);
    }

    #[test]
    fn protocol_is_tagged_and_closed() {
        let raw = r#"{"type":"navigateToContent","path":"content/x.html"}"#;
        assert_eq!(
            decode_surface_message(raw).unwrap(),
            SurfaceToShell::NavigateToContent {
                path: "content/x.html".to_string(),
                anchor: None
            }
        );
        assert!(decode_surface_message(r#"{"type":"driveByDownload"}"#).is_err());
        assert!(decode_surface_message("not json").is_err());

        let encoded = encode_shell_message(&ShellToSurface::ThemeChange { theme: Theme::Dark })
            .unwrap();
        assert!(encoded.contains(r#""type":"themeChange""#));
        assert!(encoded.contains(r#""theme":"dark""#));
    }

    #[tokio::test]
    async fn load_reports_title_then_requests_theme() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        assert_eq!(
            next(&mut bridge).await,
            SurfaceToShell::PageLoaded {
                title: Some("Intro".to_string())
            }
        );
        assert_eq!(next(&mut bridge).await, SurfaceToShell::RequestTheme);
    }

    #[tokio::test]
    async fn failed_load_still_reports_and_blocks_injection() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/missing.html").await.unwrap();
        assert_eq!(
            next(&mut bridge).await,
            SurfaceToShell::PageLoaded { title: None }
        );
        let view = bridge.view();
        assert!(view.lock().lines[0].contains("Failed to load"));
        assert!(!bridge.inject_agent().await);
    }

    #[tokio::test]
    async fn injection_requires_a_body() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/bare.html").await.unwrap();
        drain_load(&mut bridge, None).await;
        assert_eq!(next(&mut bridge).await, SurfaceToShell::RequestTheme);
        assert!(!bridge.inject_agent().await);
    }

    #[tokio::test]
    async fn double_injection_attaches_one_listener() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/a/b/page.html").await.unwrap();
        drain_load(&mut bridge, Some("Nested")).await;
        assert!(bridge.inject_agent().await);
        assert!(bridge.inject_agent().await);

        // "sibling" link sits at the start of the first layout line.
        bridge.activate(0, 0).await;
        assert_eq!(
            next(&mut bridge).await,
            SurfaceToShell::NavigateToContent {
                path: "content/a/b/e.html".to_string(),
                anchor: None
            }
        );
        assert!(
            timeout(Duration::from_millis(100), bridge.next_event())
                .await
                .is_err(),
            "duplicate listener fired"
        );
    }

    #[tokio::test]
    async fn parent_relative_click_resolves_against_page_directory() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/a/b/page.html").await.unwrap();
        drain_load(&mut bridge, Some("Nested")).await;
        assert!(bridge.inject_agent().await);
        // Second paragraph renders on its own block line.
        let view = bridge.view();
        let line = view
            .lock()
            .lines
            .iter()
            .position(|l| l.contains("parent"))
            .unwrap();
        bridge.activate(line, 0).await;
        assert_eq!(
            next(&mut bridge).await,
            SurfaceToShell::NavigateToContent {
                path: "content/a/c/d.html".to_string(),
                anchor: None
            }
        );
    }

    #[tokio::test]
    async fn selection_round_trips_into_a_restored_highlight() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);

        bridge.select_text((0, 0), (0, 7), 4, 2).await;
        let range = match next(&mut bridge).await {
            SurfaceToShell::TextSelected { text, x, y, range } => {
                assert_eq!(text, "Welcome");
                assert_eq!((x, y), (4, 2));
                range
            }
            other => panic!("expected textSelected, got {other:?}"),
        };

        // Reload stands in for the bookmark being reopened later.
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);
        bridge.request_range_scroll(range);
        time::sleep(RANGE_SCROLL_DELAY + Duration::from_millis(100)).await;
        let view = bridge.view();
        let view = view.lock();
        assert!(!view.highlights.is_empty());
        assert_eq!(view.highlights[0].line, 0);
    }

    #[tokio::test]
    async fn empty_selection_reports_cleared() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);

        bridge.select_text((0, 3), (0, 3), 0, 0).await;
        assert_eq!(next(&mut bridge).await, SurfaceToShell::SelectionCleared);
    }

    #[tokio::test]
    async fn clearing_cancels_a_pending_selection_read() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);

        bridge.select_text((0, 0), (0, 7), 0, 0).await;
        bridge.clear_selection().await;
        assert_eq!(next(&mut bridge).await, SurfaceToShell::SelectionCleared);
        assert!(
            timeout(SELECTION_DEBOUNCE + Duration::from_millis(100), bridge.next_event())
                .await
                .is_err(),
            "debounced read fired after clear"
        );
    }

    #[tokio::test]
    async fn stale_restore_request_is_dropped_after_renavigation() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);

        bridge.select_text((0, 0), (0, 7), 0, 0).await;
        let range = match next(&mut bridge).await {
            SurfaceToShell::TextSelected { range, .. } => range,
            other => panic!("expected textSelected, got {other:?}"),
        };

        // Schedule the restore, then navigate away before it fires.
        bridge.request_range_scroll(range);
        bridge.load("content/a/b/page.html").await.unwrap();
        drain_load(&mut bridge, Some("Nested")).await;
        assert!(bridge.inject_agent().await);
        time::sleep(RANGE_SCROLL_DELAY + RANGE_RETRY_DELAY + Duration::from_millis(150)).await;
        assert!(bridge.view().lock().highlights.is_empty());
    }

    #[tokio::test]
    async fn anchor_scroll_moves_the_view() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);

        bridge.request_anchor_scroll("#finale");
        time::sleep(ANCHOR_SCROLL_DELAY + Duration::from_millis(100)).await;
        let view = bridge.view();
        let view = view.lock();
        assert!(view.scroll_line > 0);
        assert!(view.lines[view.scroll_line].contains("Closing"));
    }

    #[tokio::test]
    async fn theme_handshake_reaches_the_view() {
        let dir = corpus();
        let mut bridge = bridge_for(&dir);
        bridge.load("content/intro.html").await.unwrap();
        drain_load(&mut bridge, Some("Intro")).await;
        assert!(bridge.inject_agent().await);
        bridge.set_theme(Theme::Dark).await;
        // The theme message travels through the same ordered channel as the
        // next command, so a follow-up round trip guarantees delivery.
        assert!(bridge.inject_agent().await);
        assert_eq!(bridge.view().lock().theme, Theme::Dark);
    }

    #[tokio::test]
    async fn file_corpus_reads_relative_paths() {
        let dir = corpus();
        let provider = FileCorpus::new(dir.path());
        let html = provider.fetch("content/intro.html").await.unwrap();
        assert!(html.contains("Welcome"));
        assert!(provider.fetch("content/absent.html").await.is_err());
    }
}
