use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use crossterm::cursor;
use crossterm::event::{
    self, Event, KeyCode, KeyEvent, KeyModifiers, MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use chmview_core::{
    format_timestamp, parse_search_index, parse_tree_data, Bookmark, FileSessionStore, LoadKind,
    NavEffect, RangeDescriptor, SearchHit, SearchMatcher, SearchResults, Session, SessionStore,
    SidebarTab, TocEntryKind, TocModel,
};
use chmview_surface::{FileCorpus, FrameBridge, SurfaceToShell};

#[derive(Debug, Parser)]
#[command(
    name = "chmview",
    version,
    about = "terminal reader for converted documentation corpora"
)]
struct Args {
    /// Deep link to open at startup, e.g. content/intro.html#setup
    #[arg(short = 'o', long = "open")]
    open: Option<String>,

    /// Config file overriding the platform default location
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Root of the converted corpus (the directory containing content/)
    corpus: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Config {
    sidebar_width: u16,
    small_viewport_cols: u16,
    search_debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sidebar_width: 32,
            small_viewport_cols: 80,
            search_debounce_ms: 250,
        }
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn new() -> Result<Self> {
        terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(
            stdout,
            event::DisableMouseCapture,
            LeaveAlternateScreen,
            cursor::Show
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if !args.corpus.is_dir() {
        return Err(anyhow!("corpus root {:?} is not a directory", args.corpus));
    }

    let project_dirs = ProjectDirs::from("net", "chmview", "chmview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&project_dirs, args.config.as_deref());

    let toc = match load_artifact(&args.corpus, "tree-data") {
        Some(source) => match parse_tree_data(&source) {
            Ok(root) => TocModel::build(&root),
            Err(err) => {
                warn!(?err, "TOC data is unreadable, showing an empty tree");
                TocModel::default()
            }
        },
        None => {
            warn!("no tree-data artifact found, showing an empty tree");
            TocModel::default()
        }
    };
    let search = match load_artifact(&args.corpus, "search-index") {
        Some(source) => match parse_search_index(&source) {
            Ok(entries) => SearchMatcher::new(entries),
            Err(err) => {
                warn!(?err, "search index is unreadable, search disabled");
                SearchMatcher::default()
            }
        },
        None => {
            warn!("no search-index artifact found, search disabled");
            SearchMatcher::default()
        }
    };

    let state_dir = project_dirs.data_local_dir().join("state");
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(state_dir)?);
    let mut session = Session::new(toc, search, store);

    let (cols, rows) = terminal::size().context("querying terminal size")?;
    session.set_small_viewport(cols < config.small_viewport_cols);
    let content_width = content_width_for(cols, &config, true);
    let bridge = FrameBridge::new(Arc::new(FileCorpus::new(&args.corpus)), content_width);

    session.startup(args.open.as_deref());

    let _raw = RawModeGuard::new()?;
    let mut stdout = io::stdout();
    crossterm::execute!(
        stdout,
        EnterAlternateScreen,
        event::EnableMouseCapture,
        cursor::Hide
    )?;

    let mut app = App {
        session,
        bridge,
        config,
        ui: UiState::new(cols, rows),
    };
    run(&mut app).await
}

fn content_width_for(cols: u16, config: &Config, sidebar_visible: bool) -> usize {
    let sidebar = if sidebar_visible {
        config.sidebar_width + 1
    } else {
        0
    };
    usize::from(cols.saturating_sub(sidebar)).max(10)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Sidebar,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Panel {
    Toc,
    Search,
    Bookmarks,
}

enum PendingRestore {
    Anchor(String),
    Range(RangeDescriptor),
}

enum LoopAction {
    Continue,
    ContinueRedraw,
    Quit,
}

struct UiState {
    cols: u16,
    rows: u16,
    focus: Focus,
    panel: Panel,
    sidebar_visible: bool,
    welcome: bool,
    title: Option<String>,
    breadcrumb: Vec<String>,
    fragment: Option<String>,
    notice: Option<String>,
    toc_selected: usize,
    search_input: String,
    search_dirty_at: Option<Instant>,
    search_submitted: bool,
    quick_hits: Vec<SearchHit>,
    full_results: Option<SearchResults>,
    search_selected: usize,
    bookmark_selected: usize,
    confirm_clear: Option<usize>,
    selection: Option<(String, RangeDescriptor)>,
    pending_restore: Option<PendingRestore>,
    drag_start: Option<(usize, usize)>,
    dirty: bool,
}

impl UiState {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            focus: Focus::Sidebar,
            panel: Panel::Toc,
            sidebar_visible: true,
            welcome: false,
            title: None,
            breadcrumb: Vec::new(),
            fragment: None,
            notice: None,
            toc_selected: 0,
            search_input: String::new(),
            search_dirty_at: None,
            search_submitted: false,
            quick_hits: Vec::new(),
            full_results: None,
            search_selected: 0,
            bookmark_selected: 0,
            confirm_clear: None,
            selection: None,
            pending_restore: None,
            drag_start: None,
            dirty: true,
        }
    }

    fn hits(&self) -> &[SearchHit] {
        match &self.full_results {
            Some(results) => &results.hits,
            None => &self.quick_hits,
        }
    }
}

struct App {
    session: Session,
    bridge: FrameBridge,
    config: Config,
    ui: UiState,
}

async fn run(app: &mut App) -> Result<()> {
    loop {
        apply_session_effects(app).await?;
        while let Some(msg) = app.bridge.try_next_event() {
            handle_surface_event(app, msg).await?;
            apply_session_effects(app).await?;
        }

        if let Some(changed_at) = app.ui.search_dirty_at {
            if changed_at.elapsed() >= Duration::from_millis(app.config.search_debounce_ms) {
                app.ui.search_dirty_at = None;
                app.ui.full_results = None;
                app.ui.quick_hits = app.session.quick_search(&app.ui.search_input);
                app.ui.search_selected = 0;
                app.ui.dirty = true;
            }
        }

        if app.ui.dirty {
            redraw(app)?;
            app.ui.dirty = false;
        }

        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) => match handle_key(app, key).await? {
                    LoopAction::Quit => break,
                    LoopAction::ContinueRedraw => app.ui.dirty = true,
                    LoopAction::Continue => {}
                },
                Event::Mouse(mouse) => {
                    if handle_mouse(app, mouse).await? {
                        app.ui.dirty = true;
                    }
                }
                Event::Resize(cols, rows) => {
                    app.ui.cols = cols;
                    app.ui.rows = rows;
                    app.session
                        .set_small_viewport(cols < app.config.small_viewport_cols);
                    let width = content_width_for(cols, &app.config, app.ui.sidebar_visible);
                    app.bridge.resize(width).await;
                    app.ui.dirty = true;
                }
                _ => {}
            }
        }
    }

    let mut stdout = io::stdout();
    crossterm::execute!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    Ok(())
}

async fn apply_session_effects(app: &mut App) -> Result<()> {
    let effects = app.session.drain_effects();
    if effects.is_empty() {
        return Ok(());
    }
    app.ui.dirty = true;
    for effect in effects {
        match effect {
            NavEffect::LoadPage { path } => {
                app.ui.welcome = false;
                app.ui.selection = None;
                app.ui.pending_restore = None;
                app.bridge.load(&path).await?;
            }
            NavEffect::RestoreAnchor { anchor } => {
                app.ui.pending_restore = Some(PendingRestore::Anchor(anchor));
            }
            NavEffect::RestoreRange { range } => {
                app.ui.pending_restore = Some(PendingRestore::Range(range));
            }
            NavEffect::HistoryPush { fragment } => {
                app.ui.fragment = Some(fragment);
            }
            NavEffect::Breadcrumb { trail } => {
                app.ui.breadcrumb = trail;
            }
            NavEffect::CollapseSidebar => {
                app.ui.sidebar_visible = false;
                let width = content_width_for(app.ui.cols, &app.config, false);
                app.bridge.resize(width).await;
            }
            NavEffect::ShowWelcome => {
                app.ui.welcome = true;
            }
            NavEffect::Notice { message } => {
                app.ui.notice = Some(message);
            }
        }
    }
    Ok(())
}

async fn handle_surface_event(app: &mut App, msg: SurfaceToShell) -> Result<()> {
    match msg {
        SurfaceToShell::PageLoaded { title } => {
            app.ui.title = title.or_else(|| {
                app.session
                    .current()
                    .and_then(|loc| app.session.toc().title_for_path(&loc.path))
                    .map(str::to_string)
            });
            if app.bridge.inject_agent().await {
                match app.ui.pending_restore.take() {
                    Some(PendingRestore::Anchor(anchor)) => {
                        app.bridge.request_anchor_scroll(&anchor);
                    }
                    Some(PendingRestore::Range(range)) => {
                        app.bridge.request_range_scroll(range);
                    }
                    None => {}
                }
            } else if app.ui.pending_restore.take().is_some() {
                warn!("agent injection failed, skipping restore for this load");
            }
            app.ui.dirty = true;
        }
        SurfaceToShell::RequestTheme => {
            let theme = app.session.theme();
            app.bridge.set_theme(theme).await;
        }
        SurfaceToShell::NavigateToContent { path, anchor } => {
            app.session.handle_relay(&path, anchor);
        }
        SurfaceToShell::TextSelected { text, range, .. } => {
            app.ui.notice = Some(format!(
                "selected \"{}\" (m to bookmark)",
                chmview_core::derived_bookmark_title(&text)
            ));
            app.ui.selection = Some((text, range));
            app.ui.dirty = true;
        }
        SurfaceToShell::SelectionCleared => {
            app.ui.selection = None;
            app.ui.dirty = true;
        }
    }
    Ok(())
}

async fn handle_key(app: &mut App, key: KeyEvent) -> Result<LoopAction> {
    // A pending clear-confirmation swallows everything but its answer.
    if let Some(count) = app.ui.confirm_clear {
        match key.code {
            KeyCode::Char('y') => {
                let removed = app.session.clear_bookmarks();
                app.ui.notice = Some(format!("Removed {removed} bookmarks"));
                app.ui.bookmark_selected = 0;
                app.ui.confirm_clear = None;
            }
            KeyCode::Char('n') | KeyCode::Esc => {
                app.ui.notice = Some(format!("Kept {count} bookmarks"));
                app.ui.confirm_clear = None;
            }
            _ => return Ok(LoopAction::Continue),
        }
        return Ok(LoopAction::ContinueRedraw);
    }

    // Search input grabs printable keys while the search panel has focus.
    if app.ui.focus == Focus::Sidebar && app.ui.panel == Panel::Search {
        match key.code {
            KeyCode::Char(ch) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                app.ui.search_input.push(ch);
                app.ui.search_submitted = false;
                app.ui.search_dirty_at = Some(Instant::now());
                return Ok(LoopAction::ContinueRedraw);
            }
            KeyCode::Backspace => {
                app.ui.search_input.pop();
                app.ui.search_submitted = false;
                app.ui.search_dirty_at = Some(Instant::now());
                return Ok(LoopAction::ContinueRedraw);
            }
            KeyCode::Esc => {
                app.ui.search_input.clear();
                app.ui.quick_hits.clear();
                app.ui.full_results = None;
                app.ui.search_submitted = false;
                set_panel(app, Panel::Toc);
                return Ok(LoopAction::ContinueRedraw);
            }
            KeyCode::Down => {
                move_search_selection(&mut app.ui, 1);
                return Ok(LoopAction::ContinueRedraw);
            }
            KeyCode::Up => {
                move_search_selection(&mut app.ui, -1);
                return Ok(LoopAction::ContinueRedraw);
            }
            KeyCode::Enter => {
                if app.ui.search_submitted {
                    if let Some(hit) = app.ui.hits().get(app.ui.search_selected) {
                        let path = hit.path.clone();
                        app.session.load(&path, LoadKind::Plain);
                        app.ui.focus = Focus::Content;
                    }
                } else {
                    app.ui.search_dirty_at = None;
                    app.ui.full_results = Some(app.session.full_search(&app.ui.search_input));
                    app.ui.search_selected = 0;
                    app.ui.search_submitted = true;
                }
                return Ok(LoopAction::ContinueRedraw);
            }
            KeyCode::Tab => {
                app.ui.focus = Focus::Content;
                return Ok(LoopAction::ContinueRedraw);
            }
            _ => return Ok(LoopAction::Continue),
        }
    }

    match key.code {
        KeyCode::Char('q') => return Ok(LoopAction::Quit),
        KeyCode::Tab => {
            app.ui.focus = match app.ui.focus {
                Focus::Sidebar => Focus::Content,
                Focus::Content => {
                    if !app.ui.sidebar_visible {
                        show_sidebar(app).await;
                    }
                    Focus::Sidebar
                }
            };
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Char('t') => {
            set_panel(app, Panel::Toc);
            app.ui.focus = Focus::Sidebar;
            if !app.ui.sidebar_visible {
                show_sidebar(app).await;
            }
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Char('/') | KeyCode::Char('s') => {
            set_panel(app, Panel::Search);
            app.ui.focus = Focus::Sidebar;
            if !app.ui.sidebar_visible {
                show_sidebar(app).await;
            }
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Char('b') => {
            set_panel(app, Panel::Bookmarks);
            app.ui.focus = Focus::Sidebar;
            if !app.ui.sidebar_visible {
                show_sidebar(app).await;
            }
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Char('d') => {
            let theme = app.session.toggle_theme();
            app.bridge.set_theme(theme).await;
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Char('m') => {
            let added = match app.ui.selection.clone() {
                Some((text, range)) => app.session.bookmark_selection(text, range, now_millis()),
                None => app.session.bookmark_current_page(now_millis()),
            };
            if added {
                app.ui.notice = Some("Bookmarked".to_string());
            }
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Backspace | KeyCode::Char('[') => {
            if !app.session.back() {
                app.ui.notice = Some("Nothing to go back to".to_string());
            }
            Ok(LoopAction::ContinueRedraw)
        }
        KeyCode::Char(']') => {
            if !app.session.forward() {
                app.ui.notice = Some("Nothing to go forward to".to_string());
            }
            Ok(LoopAction::ContinueRedraw)
        }
        _ => match app.ui.focus {
            Focus::Sidebar => handle_sidebar_key(app, key),
            Focus::Content => Ok(handle_content_key(app, key)),
        },
    }
}

async fn show_sidebar(app: &mut App) {
    app.ui.sidebar_visible = true;
    let width = content_width_for(app.ui.cols, &app.config, true);
    app.bridge.resize(width).await;
}

fn set_panel(app: &mut App, panel: Panel) {
    app.ui.panel = panel;
    match panel {
        Panel::Toc => app.session.set_tab(SidebarTab::Toc),
        Panel::Search => app.session.set_tab(SidebarTab::Search),
        Panel::Bookmarks => {}
    }
}

fn move_search_selection(ui: &mut UiState, delta: isize) {
    let len = ui.hits().len();
    if len == 0 {
        return;
    }
    let next = (ui.search_selected as isize + delta).clamp(0, len as isize - 1);
    ui.search_selected = next as usize;
}

fn handle_sidebar_key(app: &mut App, key: KeyEvent) -> Result<LoopAction> {
    match app.ui.panel {
        Panel::Toc => {
            let visible = app.session.toc().visible_indices();
            if visible.is_empty() {
                return Ok(LoopAction::Continue);
            }
            let selected = app.ui.toc_selected.min(visible.len() - 1);
            match key.code {
                KeyCode::Char('j') | KeyCode::Down => {
                    app.ui.toc_selected = (selected + 1).min(visible.len() - 1);
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Char('k') | KeyCode::Up => {
                    app.ui.toc_selected = selected.saturating_sub(1);
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Char(' ') => {
                    let index = visible[selected];
                    if app.session.toc().entries()[index].is_folder() {
                        app.session.toc_mut().toggle_expanded(index);
                    }
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Enter => {
                    let index = visible[selected];
                    let entry = &app.session.toc().entries()[index];
                    match (entry.path.clone(), entry.kind) {
                        (Some(path), kind) => {
                            // A clickable folder both expands and loads.
                            if kind == TocEntryKind::ClickableFolder {
                                app.session.toc_mut().toggle_expanded(index);
                            }
                            app.session.load(&path, LoadKind::Plain);
                            app.ui.focus = Focus::Content;
                        }
                        (None, _) => app.session.toc_mut().toggle_expanded(index),
                    }
                    Ok(LoopAction::ContinueRedraw)
                }
                _ => Ok(LoopAction::Continue),
            }
        }
        Panel::Search => Ok(LoopAction::Continue),
        Panel::Bookmarks => {
            let len = app.session.bookmarks().len();
            let selected = app.ui.bookmark_selected.min(len.saturating_sub(1));
            match key.code {
                KeyCode::Char('j') | KeyCode::Down if len > 0 => {
                    app.ui.bookmark_selected = (selected + 1).min(len - 1);
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Char('k') | KeyCode::Up if len > 0 => {
                    app.ui.bookmark_selected = selected.saturating_sub(1);
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Enter if len > 0 => {
                    app.session.open_bookmark(selected);
                    app.ui.focus = Focus::Content;
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Char('x') | KeyCode::Delete if len > 0 => {
                    if let Some(removed) = app.session.remove_bookmark(selected) {
                        app.ui.notice = Some(format!("Removed \"{}\"", removed.title()));
                    }
                    app.ui.bookmark_selected = selected.min(len.saturating_sub(2));
                    Ok(LoopAction::ContinueRedraw)
                }
                KeyCode::Char('C') => {
                    if len > 0 {
                        app.ui.confirm_clear = Some(len);
                    }
                    Ok(LoopAction::ContinueRedraw)
                }
                _ => Ok(LoopAction::Continue),
            }
        }
    }
}

fn handle_content_key(app: &mut App, key: KeyEvent) -> LoopAction {
    let view = app.bridge.view();
    let mut view = view.lock();
    let max_scroll = view.lines.len().saturating_sub(1);
    let page = usize::from(app.ui.rows.saturating_sub(2)).max(1);
    let next = match key.code {
        KeyCode::Char('j') | KeyCode::Down => view.scroll_line.saturating_add(1),
        KeyCode::Char('k') | KeyCode::Up => view.scroll_line.saturating_sub(1),
        KeyCode::PageDown | KeyCode::Char(' ') => view.scroll_line.saturating_add(page),
        KeyCode::PageUp => view.scroll_line.saturating_sub(page),
        KeyCode::Char('g') | KeyCode::Home => 0,
        KeyCode::Char('G') | KeyCode::End => max_scroll,
        _ => return LoopAction::Continue,
    };
    let clamped = next.min(max_scroll);
    if clamped != view.scroll_line {
        view.scroll_line = clamped;
        LoopAction::ContinueRedraw
    } else {
        LoopAction::Continue
    }
}

async fn handle_mouse(app: &mut App, mouse: MouseEvent) -> Result<bool> {
    let content_left = if app.ui.sidebar_visible {
        app.config.sidebar_width + 1
    } else {
        0
    };
    if mouse.column < content_left {
        return Ok(false);
    }
    let col = usize::from(mouse.column - content_left);
    let scroll = app.bridge.view().lock().scroll_line;
    let line = usize::from(mouse.row) + scroll;

    match mouse.kind {
        MouseEventKind::Down(MouseButton::Left) => {
            app.ui.drag_start = Some((line, col));
            Ok(false)
        }
        MouseEventKind::Up(MouseButton::Left) => {
            let Some(start) = app.ui.drag_start.take() else {
                return Ok(false);
            };
            if start == (line, col) {
                // A plain click activates links and drops any selection.
                app.bridge.clear_selection().await;
                app.bridge.activate(line, col).await;
            } else {
                app.bridge
                    .select_text(start, (line, col), mouse.column, mouse.row)
                    .await;
            }
            Ok(true)
        }
        MouseEventKind::ScrollDown => {
            let view = app.bridge.view();
            let mut view = view.lock();
            let max_scroll = view.lines.len().saturating_sub(1);
            view.scroll_line = (view.scroll_line + 3).min(max_scroll);
            Ok(true)
        }
        MouseEventKind::ScrollUp => {
            let view = app.bridge.view();
            let mut view = view.lock();
            view.scroll_line = view.scroll_line.saturating_sub(3);
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn redraw(app: &mut App) -> Result<()> {
    let mut stdout = io::stdout();
    crossterm::queue!(stdout, Clear(ClearType::All), cursor::MoveTo(0, 0))?;

    let cols = app.ui.cols;
    let rows = app.ui.rows;
    if app.ui.sidebar_visible && cols > app.config.sidebar_width + 10 {
        draw_sidebar(&mut stdout, app)?;
    }
    draw_content(&mut stdout, app)?;
    draw_status(&mut stdout, app, cols, rows)?;

    stdout.flush()?;
    Ok(())
}

fn draw_sidebar(out: &mut impl Write, app: &App) -> Result<()> {
    let width = usize::from(app.config.sidebar_width);
    let rows = usize::from(app.ui.rows.saturating_sub(1));
    let mut row = 0u16;

    let header = match app.ui.panel {
        Panel::Toc => "[contents] search bookmarks",
        Panel::Search => "contents [search] bookmarks",
        Panel::Bookmarks => "contents search [bookmarks]",
    };
    print_at(out, 0, row, &pad_to(header.to_string(), width), true)?;
    row += 1;

    match app.ui.panel {
        Panel::Toc => draw_toc_panel(out, app, width, rows, &mut row)?,
        Panel::Search => draw_search_panel(out, app, width, rows, &mut row)?,
        Panel::Bookmarks => draw_bookmark_panel(out, app, width, rows, &mut row)?,
    }

    // Pane divider.
    for line in 0..app.ui.rows.saturating_sub(1) {
        crossterm::queue!(
            out,
            cursor::MoveTo(app.config.sidebar_width, line),
            Print("|")
        )?;
    }
    Ok(())
}

fn draw_toc_panel(
    out: &mut impl Write,
    app: &App,
    width: usize,
    rows: usize,
    row: &mut u16,
) -> Result<()> {
    let toc = app.session.toc();
    let visible = toc.visible_indices();
    if visible.is_empty() {
        print_at(out, 0, *row, "  no contents available", false)?;
        return Ok(());
    }
    let selected = app.ui.toc_selected.min(visible.len() - 1);
    let window = rows.saturating_sub(usize::from(*row)).max(1);
    let offset = selected.saturating_sub(window.saturating_sub(1));
    for (slot, &index) in visible.iter().enumerate().skip(offset) {
        if usize::from(*row) >= rows {
            break;
        }
        let entry = &toc.entries()[index];
        let marker = match entry.kind {
            TocEntryKind::Folder | TocEntryKind::ClickableFolder => {
                if toc.is_expanded(index) {
                    "- "
                } else {
                    "+ "
                }
            }
            TocEntryKind::Leaf => "  ",
        };
        let active = toc.active() == Some(index);
        let mut text = format!(
            "{}{}{}{}",
            if active { ">" } else { " " },
            "  ".repeat(entry.depth.min(8)),
            marker,
            entry.title
        );
        text = pad_to(text, width);
        let highlighted = slot == selected && app.ui.focus == Focus::Sidebar;
        print_at(out, 0, *row, &text, highlighted)?;
        *row += 1;
    }
    Ok(())
}

fn draw_search_panel(
    out: &mut impl Write,
    app: &App,
    width: usize,
    rows: usize,
    row: &mut u16,
) -> Result<()> {
    print_at(
        out,
        0,
        *row,
        &pad_to(format!("search: {}_", app.ui.search_input), width),
        false,
    )?;
    *row += 1;

    if app.ui.search_input.chars().count() < 2 {
        print_at(out, 0, *row, "  type at least two characters", false)?;
        return Ok(());
    }
    if let Some(results) = &app.ui.full_results {
        let summary = format!("{} results for \"{}\"", results.total, app.ui.search_input);
        print_at(out, 0, *row, &pad_to(summary, width), false)?;
        *row += 1;
    }
    let hits = app.ui.hits();
    if hits.is_empty() {
        print_at(out, 0, *row, "  no matches", false)?;
        return Ok(());
    }
    for (index, hit) in hits.iter().enumerate() {
        if usize::from(*row) + 1 >= rows {
            break;
        }
        let highlighted = index == app.ui.search_selected;
        if highlighted {
            print_at(out, 0, *row, &pad_to(hit.title.clone(), width), true)?;
        } else {
            print_with_spans(out, 0, *row, &hit.title, &hit.title_spans, width)?;
        }
        *row += 1;
        print_with_spans(
            out,
            2,
            *row,
            &hit.preview,
            &hit.preview_spans,
            width.saturating_sub(2),
        )?;
        *row += 1;
    }
    Ok(())
}

fn draw_bookmark_panel(
    out: &mut impl Write,
    app: &App,
    width: usize,
    rows: usize,
    row: &mut u16,
) -> Result<()> {
    if let Some(count) = app.ui.confirm_clear {
        let prompt = format!("Remove all {count} bookmarks? (y/n)");
        print_at(out, 0, *row, &pad_to(prompt, width), true)?;
        *row += 1;
    }
    let bookmarks = app.session.bookmarks();
    if bookmarks.is_empty() {
        print_at(out, 0, *row, "  no bookmarks yet", false)?;
        return Ok(());
    }
    let selected = app.ui.bookmark_selected.min(bookmarks.len() - 1);
    for (index, bookmark) in bookmarks.iter().enumerate() {
        if usize::from(*row) + 1 >= rows {
            break;
        }
        let icon = match bookmark {
            Bookmark::Page { .. } => "[P]",
            Bookmark::Text { .. } => "[T]",
        };
        let line = format!("{icon} {}", bookmark.title());
        let highlighted = index == selected && app.ui.focus == Focus::Sidebar;
        print_at(out, 0, *row, &pad_to(line, width), highlighted)?;
        *row += 1;
        let date = format!("    {}", format_timestamp(bookmark.timestamp()));
        print_at(out, 0, *row, &pad_to(date, width), false)?;
        *row += 1;
    }
    Ok(())
}

fn draw_content(out: &mut impl Write, app: &App) -> Result<()> {
    let left = if app.ui.sidebar_visible {
        app.config.sidebar_width + 1
    } else {
        0
    };
    let width = usize::from(app.ui.cols.saturating_sub(left));
    let rows = usize::from(app.ui.rows.saturating_sub(1));
    if width == 0 || rows == 0 {
        return Ok(());
    }

    if app.ui.welcome {
        let lines = [
            "chmview",
            "",
            "Select a topic from the contents to begin reading,",
            "or press / to search the corpus.",
        ];
        for (offset, line) in lines.iter().enumerate() {
            let row = (rows / 3 + offset) as u16;
            crossterm::queue!(out, cursor::MoveTo(left + 2, row), Print(line))?;
        }
        return Ok(());
    }

    let view = app.bridge.view();
    let view = view.lock();
    let scroll = view.scroll_line.min(view.lines.len().saturating_sub(1));
    for (slot, line) in view.lines.iter().skip(scroll).take(rows).enumerate() {
        let row = slot as u16;
        let text = truncate_to(line, width);
        crossterm::queue!(out, cursor::MoveTo(left, row), Print(text))?;
    }
    // Restored-range highlights, reversed over the already-printed text.
    for rect in &view.highlights {
        if rect.line < scroll || rect.line >= scroll + rows {
            continue;
        }
        let row = (rect.line - scroll) as u16;
        let line = &view.lines[rect.line];
        let chars: Vec<char> = line.chars().collect();
        let end = rect.end_col.min(chars.len()).min(rect.start_col + width);
        if end <= rect.start_col {
            continue;
        }
        let span: String = chars[rect.start_col..end].iter().collect();
        crossterm::queue!(
            out,
            cursor::MoveTo(left + rect.start_col as u16, row),
            SetAttribute(Attribute::Reverse),
            Print(span),
            SetAttribute(Attribute::Reset)
        )?;
    }
    Ok(())
}

fn draw_status(out: &mut impl Write, app: &App, cols: u16, rows: u16) -> Result<()> {
    let mut status = String::new();
    if let Some(title) = &app.ui.title {
        status.push_str(title);
    }
    if !app.ui.breadcrumb.is_empty() {
        if !status.is_empty() {
            status.push_str(" | ");
        }
        status.push_str(&app.ui.breadcrumb.join(" > "));
    }
    if let Some(fragment) = &app.ui.fragment {
        if !status.is_empty() {
            status.push_str(" | ");
        }
        status.push_str(fragment);
    }
    if let Some(notice) = &app.ui.notice {
        if !status.is_empty() {
            status.push_str(" | ");
        }
        status.push_str(notice);
    }
    if status.is_empty() {
        status.push_str("q quit | tab focus | / search | b bookmarks | m bookmark | d theme");
    }
    status.push_str(&format!(" [{}]", app.session.theme().as_str()));

    let text = truncate_to(&status, usize::from(cols));
    crossterm::queue!(
        out,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        Clear(ClearType::CurrentLine),
        SetAttribute(Attribute::Reverse),
        Print(pad_to(text, usize::from(cols))),
        SetAttribute(Attribute::Reset)
    )?;
    Ok(())
}

fn print_at(out: &mut impl Write, col: u16, row: u16, content: &str, inverted: bool) -> Result<()> {
    if inverted {
        crossterm::queue!(
            out,
            cursor::MoveTo(col, row),
            SetAttribute(Attribute::Reverse),
            Print(content),
            SetAttribute(Attribute::Reset)
        )?;
    } else {
        crossterm::queue!(out, cursor::MoveTo(col, row), Print(content))?;
    }
    Ok(())
}

/// Prints `text` clipped to `width` columns, reversing the given byte
/// ranges (query occurrences from the search matcher).
fn print_with_spans(
    out: &mut impl Write,
    col: u16,
    row: u16,
    text: &str,
    spans: &[(usize, usize)],
    width: usize,
) -> Result<()> {
    let cap = text
        .char_indices()
        .nth(width)
        .map_or(text.len(), |(idx, _)| idx);
    crossterm::queue!(out, cursor::MoveTo(col, row))?;
    let mut pos = 0;
    for &(start, end) in spans {
        let end = end.min(cap);
        if end <= pos {
            continue;
        }
        let start = start.min(cap).max(pos);
        crossterm::queue!(
            out,
            Print(&text[pos..start]),
            SetAttribute(Attribute::Reverse),
            Print(&text[start..end]),
            SetAttribute(Attribute::Reset)
        )?;
        pos = end;
    }
    crossterm::queue!(out, Print(&text[pos..cap]))?;
    let shown = text[..cap].chars().count();
    if shown < width {
        crossterm::queue!(out, Print(" ".repeat(width - shown)))?;
    }
    Ok(())
}

fn pad_to(mut text: String, width: usize) -> String {
    text = truncate_to(&text, width);
    let len = text.chars().count();
    if len < width {
        text.push_str(&" ".repeat(width - len));
    }
    text
}

fn truncate_to(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    if width <= 3 {
        return text.chars().take(width).collect();
    }
    let mut out: String = text.chars().take(width - 3).collect();
    out.push_str("...");
    out
}

fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn load_artifact(root: &Path, stem: &str) -> Option<String> {
    let candidates = [
        root.join("assets").join(format!("{stem}.js")),
        root.join("assets").join(format!("{stem}.json")),
        root.join(format!("{stem}.js")),
        root.join(format!("{stem}.json")),
    ];
    for path in candidates {
        match fs::read_to_string(&path) {
            Ok(text) => return Some(text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                warn!(?err, path = %path.display(), "failed to read corpus artifact");
                return None;
            }
        }
    }
    None
}

fn load_config(dirs: &ProjectDirs, explicit: Option<&Path>) -> Config {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => dirs.config_dir().join("chmview.toml"),
    };
    match fs::read_to_string(&path) {
        Ok(text) => match toml::from_str(&text) {
            Ok(config) => config,
            Err(err) => {
                warn!(?err, path = %path.display(), "config file is invalid, using defaults");
                Config::default()
            }
        },
        Err(_) => Config::default(),
    }
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "chmview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // File layer only; stdout belongs to the terminal ui.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_spans_render_reversed() {
        let mut buf: Vec<u8> = Vec::new();
        print_with_spans(&mut buf, 0, 0, "Widget Setup", &[(0, 6)], 32).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(
            out.contains("\u{1b}[7mWidget\u{1b}[0m"),
            "query occurrence not reversed in {out:?}"
        );
        assert!(out.contains(" Setup"));
    }

    #[test]
    fn search_spans_clip_to_the_panel_width() {
        let mut buf: Vec<u8> = Vec::new();
        print_with_spans(&mut buf, 0, 0, "install the widget now", &[(12, 18)], 14).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(
            out.contains("\u{1b}[7mwi\u{1b}[0m"),
            "clipped span lost in {out:?}"
        );
        assert!(!out.contains("widget"));
    }
}
