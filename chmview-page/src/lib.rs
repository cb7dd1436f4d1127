use quick_xml::events::Event;
use quick_xml::reader::Reader;
use thiserror::Error;
use tracing::warn;

use chmview_core::{PathStep, RangeDescriptor, StructuralPath};

pub type NodeId = usize;

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const SKIP_TEXT_TAGS: &[&str] = &["script", "style"];

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "hr", "h1", "h2", "h3", "h4", "h5", "h6", "li", "ul", "ol", "dl", "dt",
    "dd", "table", "tr", "blockquote", "pre", "section", "article", "center",
];

#[derive(Debug, Clone)]
pub enum NodeKind {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub node: NodeId,
    pub href: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RestoreError {
    #[error("range boundary not found")]
    NotFound,
}

/// A parsed content page. Node ids are allocated in document order, so id
/// comparison doubles as an ordering in the tree.
pub struct Document {
    nodes: Vec<Node>,
    body: Option<NodeId>,
    title: Option<String>,
}

impl Document {
    /// Lenient parse of rendered page markup. Void elements never open a
    /// scope, mismatched end tags pop to the nearest matching open element,
    /// and a hard tokenizer error abandons the remainder of the input rather
    /// than failing the load.
    pub fn parse(html: &str) -> Self {
        let mut reader = Reader::from_str(html);
        let config = reader.config_mut();
        config.check_end_names = false;
        config.expand_empty_elements = true;

        let mut nodes = vec![Node {
            kind: NodeKind::Element {
                tag: "#document".to_string(),
                attrs: Vec::new(),
            },
            parent: None,
            children: Vec::new(),
        }];
        let mut stack: Vec<NodeId> = vec![0];
        let mut body = None;
        let mut title = String::new();
        let mut in_title = false;
        let mut pending_text = String::new();

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let tag =
                        String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                    flush_text(
                        &mut nodes,
                        &stack,
                        &mut pending_text,
                        !BLOCK_TAGS.contains(&tag.as_str()),
                    );
                    let attrs = e
                        .attributes()
                        .flatten()
                        .map(|attr| {
                            (
                                String::from_utf8_lossy(attr.key.as_ref()).to_ascii_lowercase(),
                                String::from_utf8_lossy(&attr.value).into_owned(),
                            )
                        })
                        .collect();
                    let parent = *stack.last().unwrap_or(&0);
                    let id = nodes.len();
                    nodes.push(Node {
                        kind: NodeKind::Element {
                            tag: tag.clone(),
                            attrs,
                        },
                        parent: Some(parent),
                        children: Vec::new(),
                    });
                    nodes[parent].children.push(id);
                    if tag == "body" && body.is_none() {
                        body = Some(id);
                    }
                    if tag == "title" {
                        in_title = true;
                    }
                    if !VOID_TAGS.contains(&tag.as_str()) {
                        stack.push(id);
                    }
                }
                Ok(Event::End(e)) => {
                    flush_text(&mut nodes, &stack, &mut pending_text, false);
                    let tag =
                        String::from_utf8_lossy(e.name().as_ref()).to_ascii_lowercase();
                    if tag == "title" {
                        in_title = false;
                    }
                    if let Some(pos) = stack
                        .iter()
                        .rposition(|&id| element_tag(&nodes, id) == Some(tag.as_str()))
                    {
                        if pos > 0 {
                            stack.truncate(pos);
                        }
                    }
                }
                Ok(Event::Text(e)) => {
                    let text = reader.decoder().decode(&e).unwrap_or_default();
                    if in_title {
                        title.push_str(&text);
                    } else {
                        pending_text.push_str(&text);
                    }
                }
                Ok(Event::CData(e)) => {
                    let text = reader.decoder().decode(&e).unwrap_or_default();
                    if !in_title {
                        pending_text.push_str(&text);
                    }
                }
                Ok(Event::GeneralRef(e)) => {
                    let name = e.decode().unwrap_or_default();
                    let resolved = resolve_entity(&name);
                    if in_title {
                        title.push_str(&resolved);
                    } else {
                        pending_text.push_str(&resolved);
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(?err, "abandoning malformed page markup mid-parse");
                    break;
                }
            }
        }
        flush_text(&mut nodes, &stack, &mut pending_text, false);

        let title = title.trim().to_string();
        Document {
            nodes,
            body,
            title: if title.is_empty() { None } else { Some(title) },
        }
    }

    pub fn body(&self) -> Option<NodeId> {
        self.body
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].children
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { tag, .. } => Some(tag),
            NodeKind::Text(_) => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Text(text) => Some(text),
            NodeKind::Element { .. } => None,
        }
    }

    pub fn is_text(&self, id: NodeId) -> bool {
        matches!(self.nodes[id].kind, NodeKind::Text(_))
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match &self.nodes[id].kind {
            NodeKind::Element { attrs, .. } => attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            NodeKind::Text(_) => None,
        }
    }

    /// Text nodes under `scope` in document order, skipping script/style
    /// subtrees.
    pub fn text_nodes_in_order(&self, scope: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_text(scope, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut Vec<NodeId>) {
        match &self.nodes[id].kind {
            NodeKind::Text(_) => out.push(id),
            NodeKind::Element { tag, .. } => {
                if SKIP_TEXT_TAGS.contains(&tag.as_str()) {
                    return;
                }
                for &child in &self.nodes[id].children {
                    self.collect_text(child, out);
                }
            }
        }
    }

    pub fn text_content(&self, id: NodeId) -> String {
        self.text_nodes_in_order(id)
            .iter()
            .filter_map(|&node| self.text(node))
            .collect()
    }

    /// Anchor elements with an href, under the body, in document order.
    pub fn links(&self) -> Vec<Link> {
        let Some(body) = self.body else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.collect_links(body, &mut out);
        out
    }

    fn collect_links(&self, id: NodeId, out: &mut Vec<Link>) {
        if self.tag(id) == Some("a") {
            if let Some(href) = self.attr(id, "href") {
                out.push(Link {
                    node: id,
                    href: href.to_string(),
                });
            }
        }
        for &child in &self.nodes[id].children {
            self.collect_links(child, out);
        }
    }

    /// Resolves an in-page fragment id (`#name` or `name`) to the element
    /// carrying that id, or a named `<a>` target.
    pub fn anchor_target(&self, name: &str) -> Option<NodeId> {
        let name = name.strip_prefix('#').unwrap_or(name);
        (0..self.nodes.len()).find(|&id| {
            self.attr(id, "id") == Some(name)
                || (self.tag(id) == Some("a") && self.attr(id, "name") == Some(name))
        })
    }
}

fn element_tag<'a>(nodes: &'a [Node], id: NodeId) -> Option<&'a str> {
    match &nodes[id].kind {
        NodeKind::Element { tag, .. } => Some(tag),
        NodeKind::Text(_) => None,
    }
}

/// Attaches accumulated character data to the open element, collapsing
/// whitespace runs the way an HTML renderer would. Adjacent text split by
/// entity references lands in a single text node. A whitespace-only run is
/// kept as a single space when it separates two inline siblings
/// (`inline_follows` says an inline element is about to open), dropped
/// otherwise.
fn flush_text(nodes: &mut Vec<Node>, stack: &[NodeId], pending: &mut String, inline_follows: bool) {
    if pending.is_empty() {
        return;
    }
    let text = std::mem::take(pending);
    let parent = *stack.last().unwrap_or(&0);
    if let Some(tag) = element_tag(nodes, parent) {
        if SKIP_TEXT_TAGS.contains(&tag) {
            return;
        }
    }
    let collapsed = if text.trim().is_empty() {
        if !inline_follows || !last_child_is_inline(nodes, parent) {
            return;
        }
        " ".to_string()
    } else {
        collapse_whitespace(&text)
    };
    let id = nodes.len();
    nodes.push(Node {
        kind: NodeKind::Text(collapsed),
        parent: Some(parent),
        children: Vec::new(),
    });
    nodes[parent].children.push(id);
}

fn last_child_is_inline(nodes: &[Node], parent: NodeId) -> bool {
    nodes[parent].children.last().is_some_and(|&child| {
        matches!(
            &nodes[child].kind,
            NodeKind::Element { tag, .. } if !BLOCK_TAGS.contains(&tag.as_str())
        )
    })
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_ws = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_ws {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(ch);
            in_ws = false;
        }
    }
    out
}

fn resolve_entity(name: &str) -> String {
    let wrapped = format!("&{name};");
    if let Ok(resolved) = quick_xml::escape::unescape(&wrapped) {
        return resolved.into_owned();
    }
    match name {
        "nbsp" => "\u{a0}",
        "copy" => "\u{a9}",
        "ndash" => "\u{2013}",
        "mdash" => "\u{2014}",
        "lsquo" => "\u{2018}",
        "rsquo" => "\u{2019}",
        "ldquo" => "\u{201c}",
        "rdquo" => "\u{201d}",
        "hellip" => "\u{2026}",
        _ => return wrapped,
    }
    .to_string()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn char_slice(text: &str, from: usize, to: usize) -> &str {
    let mut indices = text.char_indices().map(|(i, _)| i);
    let start = indices.clone().nth(from).unwrap_or(text.len());
    let end = if to >= char_len(text) {
        text.len()
    } else {
        indices.nth(to).unwrap_or(text.len())
    };
    &text[start..end.max(start)]
}

/// One endpoint of a selection or resolved range: a text node plus a char
/// offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    pub node: NodeId,
    pub offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRange {
    pub start: Boundary,
    pub end: Boundary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: Boundary,
    pub end: Boundary,
}

impl ResolvedRange {
    /// The textual content covered by the range, in document order.
    pub fn text(&self, doc: &Document) -> String {
        let Some(body) = doc.body() else {
            return String::new();
        };
        let texts = doc.text_nodes_in_order(body);
        let Some(start_index) = texts.iter().position(|&n| n == self.start.node) else {
            return String::new();
        };
        let Some(end_index) = texts.iter().position(|&n| n == self.end.node) else {
            return String::new();
        };
        let (start_index, start_offset, end_index, end_offset) =
            if (start_index, self.start.offset) <= (end_index, self.end.offset) {
                (start_index, self.start.offset, end_index, self.end.offset)
            } else {
                (end_index, self.end.offset, start_index, self.start.offset)
            };
        let mut out = String::new();
        for index in start_index..=end_index {
            let text = doc.text(texts[index]).unwrap_or("");
            let from = if index == start_index { start_offset } else { 0 };
            let to = if index == end_index {
                end_offset
            } else {
                char_len(text)
            };
            out.push_str(char_slice(text, from, to));
        }
        out
    }
}

/// Serializes a selection into a structural descriptor: element steps from
/// the body down to each boundary, plus the boundary's text-node index and
/// char offset. Returns None when a boundary does not sit under the body.
pub fn capture(doc: &Document, selection: SelectionRange) -> Option<RangeDescriptor> {
    Some(RangeDescriptor {
        start_path: structural_path(doc, selection.start.node)?,
        start_offset: selection.start.offset,
        end_path: structural_path(doc, selection.end.node)?,
        end_offset: selection.end.offset,
    })
}

fn structural_path(doc: &Document, node: NodeId) -> Option<StructuralPath> {
    let body = doc.body()?;
    let mut text_index = None;
    let mut cursor = node;
    if doc.is_text(node) {
        let parent = doc.parent(node)?;
        text_index = doc
            .children(parent)
            .iter()
            .filter(|&&child| doc.is_text(child))
            .position(|&child| child == node);
        text_index?;
        cursor = parent;
    }
    let mut steps = Vec::new();
    while cursor != body {
        let parent = doc.parent(cursor)?;
        let tag = doc.tag(cursor)?.to_string();
        let same_tag: Vec<NodeId> = doc
            .children(parent)
            .iter()
            .copied()
            .filter(|&child| doc.tag(child) == Some(tag.as_str()))
            .collect();
        let sibling_index = if same_tag.len() > 1 {
            Some(same_tag.iter().position(|&child| child == cursor)? + 1)
        } else {
            None
        };
        steps.push(PathStep { tag, sibling_index });
        cursor = parent;
    }
    steps.reverse();
    Some(StructuralPath { steps, text_index })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BoundarySide {
    Start,
    End,
}

/// Re-evaluates a descriptor against the live document. Unresolvable
/// boundary nodes yield `NotFound`; offsets invalidated by content drift
/// clamp to the resolved node's bounding extent instead of failing.
pub fn restore(doc: &Document, descriptor: &RangeDescriptor) -> Result<ResolvedRange, RestoreError> {
    let start = resolve_boundary(
        doc,
        &descriptor.start_path,
        descriptor.start_offset,
        BoundarySide::Start,
    )?;
    let end = resolve_boundary(
        doc,
        &descriptor.end_path,
        descriptor.end_offset,
        BoundarySide::End,
    )?;
    Ok(ResolvedRange { start, end })
}

fn resolve_node(doc: &Document, path: &StructuralPath) -> Option<NodeId> {
    let mut cursor = doc.body()?;
    for step in &path.steps {
        let matches: Vec<NodeId> = doc
            .children(cursor)
            .iter()
            .copied()
            .filter(|&child| doc.tag(child) == Some(step.tag.as_str()))
            .collect();
        let index = step.sibling_index.unwrap_or(1).checked_sub(1)?;
        cursor = *matches.get(index)?;
    }
    match path.text_index {
        Some(index) => doc
            .children(cursor)
            .iter()
            .copied()
            .filter(|&child| doc.is_text(child))
            .nth(index),
        None => Some(cursor),
    }
}

fn resolve_boundary(
    doc: &Document,
    path: &StructuralPath,
    offset: usize,
    side: BoundarySide,
) -> Result<Boundary, RestoreError> {
    let node = resolve_node(doc, path).ok_or(RestoreError::NotFound)?;
    if doc.is_text(node) {
        let len = char_len(doc.text(node).unwrap_or(""));
        if offset > len {
            // Content drift: fall back to the node's extent.
            return Ok(Boundary {
                node,
                offset: match side {
                    BoundarySide::Start => 0,
                    BoundarySide::End => len,
                },
            });
        }
        return Ok(Boundary { node, offset });
    }
    // Element boundary: take the bounding extent of its text content.
    let texts = doc.text_nodes_in_order(node);
    match side {
        BoundarySide::Start => texts
            .first()
            .map(|&node| Boundary { node, offset: 0 })
            .ok_or(RestoreError::NotFound),
        BoundarySide::End => texts
            .last()
            .map(|&node| Boundary {
                node,
                offset: char_len(doc.text(node).unwrap_or("")),
            })
            .ok_or(RestoreError::NotFound),
    }
}

/// A client rectangle covering part of a resolved range in the wrapped-line
/// layout. Columns are half-open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighlightRect {
    pub line: usize,
    pub start_col: usize,
    pub end_col: usize,
}

#[derive(Debug, Clone)]
struct Segment {
    node: NodeId,
    node_char_start: usize,
    col_start: usize,
    char_len: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LayoutLine {
    pub text: String,
    char_len: usize,
    segments: Vec<Segment>,
}

impl LayoutLine {
    pub fn char_len(&self) -> usize {
        self.char_len
    }
}

/// Greedy word-wrapped text layout of the body, with a bidirectional mapping
/// between (line, column) positions and (text node, char offset) boundaries.
pub struct Layout {
    lines: Vec<LayoutLine>,
    width: usize,
}

impl Layout {
    pub fn build(doc: &Document, width: usize) -> Self {
        let width = width.max(10);
        let mut builder = LayoutBuilder {
            lines: Vec::new(),
            current: LayoutLine::default(),
            width,
        };
        if let Some(body) = doc.body() {
            builder.walk(doc, body);
        }
        builder.flush_line();
        while builder.lines.last().is_some_and(|line| line.char_len == 0) {
            builder.lines.pop();
        }
        Layout {
            lines: builder.lines,
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lines(&self) -> &[LayoutLine] {
        &self.lines
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Maps a text-node boundary to its (line, column). Offsets that fell
    /// into collapsed whitespace snap to the nearest rendered neighbor.
    pub fn position_of(&self, node: NodeId, offset: usize) -> Option<(usize, usize)> {
        let mut after: Option<(usize, usize)> = None;
        let mut before: Option<(usize, usize)> = None;
        for (line_index, line) in self.lines.iter().enumerate() {
            for segment in &line.segments {
                if segment.node != node {
                    continue;
                }
                let seg_end = segment.node_char_start + segment.char_len;
                if offset >= segment.node_char_start && offset < seg_end {
                    return Some((
                        line_index,
                        segment.col_start + (offset - segment.node_char_start),
                    ));
                }
                if offset < segment.node_char_start && after.is_none() {
                    after = Some((line_index, segment.col_start));
                }
                if offset >= seg_end {
                    before = Some((line_index, segment.col_start + segment.char_len));
                }
            }
        }
        after.or(before)
    }

    /// Maps a (line, column) position back to a text-node boundary.
    pub fn position_at(&self, line: usize, col: usize) -> Option<Boundary> {
        let line = self.lines.get(line)?;
        for segment in &line.segments {
            if col >= segment.col_start && col < segment.col_start + segment.char_len {
                return Some(Boundary {
                    node: segment.node,
                    offset: segment.node_char_start + (col - segment.col_start),
                });
            }
        }
        // Past end of line: the end of its last segment.
        line.segments.last().map(|segment| Boundary {
            node: segment.node,
            offset: segment.node_char_start + segment.char_len,
        })
    }

    /// Client rectangles covering a resolved range, one per spanned line.
    pub fn rects_for_range(&self, range: &ResolvedRange) -> Vec<HighlightRect> {
        let Some(start) = self.position_of(range.start.node, range.start.offset) else {
            return Vec::new();
        };
        let end = if range.end.offset > 0 {
            self.position_of(range.end.node, range.end.offset - 1)
                .map(|(line, col)| (line, col + 1))
        } else {
            self.position_of(range.end.node, 0)
        };
        let Some(end) = end else {
            return Vec::new();
        };
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        let (start_line, start_col) = start;
        let (end_line, end_col) = end;

        let mut rects = Vec::new();
        if start_line == end_line {
            if end_col > start_col {
                rects.push(HighlightRect {
                    line: start_line,
                    start_col,
                    end_col,
                });
            }
            return rects;
        }
        rects.push(HighlightRect {
            line: start_line,
            start_col,
            end_col: self.lines[start_line].char_len,
        });
        for line in start_line + 1..end_line {
            if self.lines[line].char_len > 0 {
                rects.push(HighlightRect {
                    line,
                    start_col: 0,
                    end_col: self.lines[line].char_len,
                });
            }
        }
        rects.push(HighlightRect {
            line: end_line,
            start_col: 0,
            end_col,
        });
        rects
    }

    /// First layout line rendering content at or after `node` in document
    /// order. Used for anchor and link scrolling.
    pub fn first_line_at_or_after(&self, node: NodeId) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (line_index, line) in self.lines.iter().enumerate() {
            for segment in &line.segments {
                if segment.node >= node {
                    best = Some(match best {
                        Some(current) => current.min(line_index),
                        None => line_index,
                    });
                }
            }
            if best.is_some() {
                break;
            }
        }
        best
    }
}

struct LayoutBuilder {
    lines: Vec<LayoutLine>,
    current: LayoutLine,
    width: usize,
}

impl LayoutBuilder {
    fn walk(&mut self, doc: &Document, id: NodeId) {
        match &doc.node(id).kind {
            NodeKind::Text(text) => self.append_text(id, text),
            NodeKind::Element { tag, .. } => {
                if SKIP_TEXT_TAGS.contains(&tag.as_str()) {
                    return;
                }
                let block = BLOCK_TAGS.contains(&tag.as_str());
                if block {
                    self.flush_line();
                }
                for &child in doc.children(id) {
                    self.walk(doc, child);
                }
                if block {
                    self.flush_line();
                }
            }
        }
    }

    fn append_text(&mut self, node: NodeId, text: &str) {
        let chars: Vec<char> = text.chars().collect();
        let mut index = 0;
        while index < chars.len() {
            if chars[index] == ' ' {
                if self.current.char_len > 0 && self.current.char_len < self.width {
                    self.push_char(node, index, ' ');
                }
                index += 1;
                continue;
            }
            let mut word_end = index;
            while word_end < chars.len() && chars[word_end] != ' ' {
                word_end += 1;
            }
            let word_len = word_end - index;
            if self.current.char_len > 0 && self.current.char_len + word_len > self.width {
                self.break_line();
            }
            for k in index..word_end {
                if self.current.char_len >= self.width {
                    self.break_line();
                }
                self.push_char(node, k, chars[k]);
            }
            index = word_end;
        }
    }

    fn push_char(&mut self, node: NodeId, node_char_index: usize, ch: char) {
        match self.current.segments.last_mut() {
            Some(segment)
                if segment.node == node
                    && segment.node_char_start + segment.char_len == node_char_index
                    && segment.col_start + segment.char_len == self.current.char_len =>
            {
                segment.char_len += 1;
            }
            _ => self.current.segments.push(Segment {
                node,
                node_char_start: node_char_index,
                col_start: self.current.char_len,
                char_len: 1,
            }),
        }
        self.current.text.push(ch);
        self.current.char_len += 1;
    }

    /// Wrap break inside flowing text: never produces a blank line.
    fn break_line(&mut self) {
        if self.current.char_len == 0 {
            return;
        }
        let line = std::mem::take(&mut self.current);
        self.lines.push(line);
    }

    /// Block boundary: at most one separating blank line.
    fn flush_line(&mut self) {
        if self.current.char_len > 0 {
            let line = std::mem::take(&mut self.current);
            self.lines.push(line);
        } else if self.lines.last().is_some_and(|line| line.char_len > 0) {
            self.lines.push(LayoutLine::default());
        }
    }
}
