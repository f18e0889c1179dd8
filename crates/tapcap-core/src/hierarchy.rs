//! UI hierarchy parsing and node resolution.
//!
//! A hierarchy dump is an XML document where every control is an element
//! carrying its geometry in a `bounds="[l,t][r,b]"` attribute. Resolution
//! answers three questions against a parsed dump: which control contains a
//! point, which control has exactly these bounds, and which control does a
//! path query select.
//!
//! Path queries use a small XPath-like subset: `/` child steps, `//`
//! descendant steps (a leading `.//` is accepted), `*`/tag names,
//! `[@attr='value']` predicates joined with `and`, and 1-based `[n]`
//! position predicates. Queries written against class names instead of
//! element tags (the common case for accessibility dumps, where every
//! element is literally named `node`) are recovered by a chain of
//! rewrite strategies.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Screen-space rectangle in the `[left,top][right,bottom]` dump format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingRect {
    /// Parse a `[l,t][r,b]` string. Interior whitespace is tolerated.
    pub fn parse(raw: &str) -> Option<Self> {
        let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let inner = compact.strip_prefix('[')?.strip_suffix(']')?;
        let (first, second) = inner.split_once("][")?;
        let (l, t) = first.split_once(',')?;
        let (r, b) = second.split_once(',')?;
        Some(Self {
            left: l.parse().ok()?,
            top: t.parse().ok()?,
            right: r.parse().ok()?,
            bottom: b.parse().ok()?,
        })
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    /// Area in square pixels, zero for degenerate rectangles.
    pub fn area(&self) -> i64 {
        let w = i64::from(self.right - self.left).max(0);
        let h = i64::from(self.bottom - self.top).max(0);
        w * h
    }

    /// Center point, rounded down.
    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }
}

impl fmt::Display for BoundingRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{}][{},{}]",
            self.left, self.top, self.right, self.bottom
        )
    }
}

/// A resolved control, detached from the tree it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlNode {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
}

impl ControlNode {
    pub fn bounds(&self) -> Option<BoundingRect> {
        self.attrs.get("bounds").and_then(|b| BoundingRect::parse(b))
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

#[derive(Debug)]
struct NodeData {
    children: Vec<usize>,
    tag: String,
    attrs: Vec<(String, String)>,
    bounds: Option<BoundingRect>,
}

/// A parsed hierarchy dump, flattened for cheap traversal.
///
/// Index 0 is a synthetic document root whose only child is the real root
/// element; queries starting with `/` or `//` evaluate from it.
#[derive(Debug)]
pub struct UiTree {
    nodes: Vec<NodeData>,
}

impl UiTree {
    pub fn parse(xml: &str) -> Result<Self, ApiError> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| ApiError::capture(format!("hierarchy dump is not valid XML: {e}")))?;
        let mut nodes = vec![NodeData {
            children: Vec::new(),
            tag: String::new(),
            attrs: Vec::new(),
            bounds: None,
        }];
        let root_id = Self::flatten(&mut nodes, doc.root_element());
        nodes[0].children.push(root_id);
        Ok(Self { nodes })
    }

    fn flatten(nodes: &mut Vec<NodeData>, element: roxmltree::Node<'_, '_>) -> usize {
        let attrs: Vec<(String, String)> = element
            .attributes()
            .map(|a| (a.name().to_string(), a.value().to_string()))
            .collect();
        let bounds = attrs
            .iter()
            .find(|(k, _)| k == "bounds")
            .and_then(|(_, v)| BoundingRect::parse(v));
        let id = nodes.len();
        nodes.push(NodeData {
            children: Vec::new(),
            tag: element.tag_name().name().to_string(),
            attrs,
            bounds,
        });
        for child in element.children().filter(|c| c.is_element()) {
            let child_id = Self::flatten(nodes, child);
            nodes[id].children.push(child_id);
        }
        id
    }

    fn detach(&self, id: usize) -> ControlNode {
        let data = &self.nodes[id];
        ControlNode {
            tag: data.tag.clone(),
            attrs: data.attrs.iter().cloned().collect(),
        }
    }

    fn descendants(&self, id: usize, out: &mut Vec<usize>) {
        for &child in &self.nodes[id].children {
            out.push(child);
            self.descendants(child, out);
        }
    }

    /// Smallest control whose bounds contain the point. Ties keep the
    /// first node encountered in document order.
    pub fn node_at_point(&self, x: i32, y: i32) -> Option<ControlNode> {
        let mut best: Option<(usize, i64)> = None;
        for (id, data) in self.nodes.iter().enumerate().skip(1) {
            let Some(bounds) = data.bounds else { continue };
            if !bounds.contains(x, y) {
                continue;
            }
            let area = bounds.area();
            match best {
                Some((_, best_area)) if area >= best_area => {}
                _ => best = Some((id, area)),
            }
        }
        best.map(|(id, _)| self.detach(id))
    }

    /// First control whose bounds attribute equals the given string,
    /// compared with all whitespace removed.
    pub fn node_by_bounds(&self, bounds: &str) -> Option<ControlNode> {
        let wanted: String = bounds.chars().filter(|c| !c.is_whitespace()).collect();
        self.nodes.iter().enumerate().skip(1).find_map(|(id, data)| {
            let raw = data.attrs.iter().find(|(k, _)| k == "bounds")?;
            let normalized: String = raw.1.chars().filter(|c| !c.is_whitespace()).collect();
            (normalized == wanted).then(|| self.detach(id))
        })
    }

    /// Resolve a path query, trying each recovery strategy in order:
    ///
    /// 1. the query as written;
    /// 2. the last step's tag rewritten as a `@class` predicate;
    /// 3. a grouped `(expr)[n]` form unwrapped into expr plus a global
    ///    1-based index;
    /// 4. the head dropped and the last step matched on its own against
    ///    every node, by class or tag plus attribute predicates.
    pub fn node_by_path(&self, query: &str) -> Option<ControlNode> {
        if let Ok(segments) = parse_query(query) {
            if let Some(id) = self.evaluate(&segments).into_iter().next() {
                return Some(self.detach(id));
            }
            if let Some(rewritten) = rewrite_last_tag_as_class(&segments) {
                if let Some(id) = self.evaluate(&rewritten).into_iter().next() {
                    return Some(self.detach(id));
                }
            }
        }
        if let Some((inner, index)) = split_grouped_index(query) {
            if let Some(id) = self.resolve_ids(inner).into_iter().nth(index - 1) {
                return Some(self.detach(id));
            }
        }
        self.resolve_last_segment_manually(query)
    }

    /// Strategies 1 and 2 as an id list, for callers that need every match.
    fn resolve_ids(&self, query: &str) -> Vec<usize> {
        let Ok(segments) = parse_query(query) else {
            return Vec::new();
        };
        let ids = self.evaluate(&segments);
        if !ids.is_empty() {
            return ids;
        }
        match rewrite_last_tag_as_class(&segments) {
            Some(rewritten) => self.evaluate(&rewritten),
            None => Vec::new(),
        }
    }

    fn evaluate(&self, segments: &[Segment]) -> Vec<usize> {
        let mut contexts = vec![0usize];
        for segment in segments {
            let mut next = Vec::new();
            for &ctx in &contexts {
                let mut candidates = Vec::new();
                if segment.descendant {
                    self.descendants(ctx, &mut candidates);
                } else {
                    candidates.extend_from_slice(&self.nodes[ctx].children);
                }
                let mut matched: Vec<usize> = candidates
                    .into_iter()
                    .filter(|&id| self.matches(id, segment))
                    .collect();
                if let Some(pos) = segment.position {
                    matched = match matched.into_iter().nth(pos - 1) {
                        Some(id) => vec![id],
                        None => Vec::new(),
                    };
                }
                next.extend(matched);
            }
            next.dedup();
            contexts = next;
            if contexts.is_empty() {
                break;
            }
        }
        contexts
    }

    fn matches(&self, id: usize, segment: &Segment) -> bool {
        let data = &self.nodes[id];
        if segment.tag != "*" && segment.tag != data.tag {
            return false;
        }
        segment.attr_preds.iter().all(|(name, value)| {
            data.attrs
                .iter()
                .any(|(k, v)| k == name && v == value)
        })
    }

    /// Strategy 4: drop everything up to the last `/` and scan all nodes
    /// in document order against the final step alone. The step's name
    /// matches either the element tag or the `class` attribute, its
    /// `@attr='v'` predicates must all hold, and `[n]` counts matches
    /// 1-based.
    fn resolve_last_segment_manually(&self, query: &str) -> Option<ControlNode> {
        let split_at = last_top_level_slash(query)?;
        let tail = query[split_at..].trim_start_matches('/');
        if tail.is_empty() {
            return None;
        }
        let segment = parse_segment(tail, true).ok()?;
        let wanted = segment.position.unwrap_or(1);
        let mut seen = 0usize;
        for (id, data) in self.nodes.iter().enumerate().skip(1) {
            let name_matches = segment.tag == "*"
                || data.tag == segment.tag
                || data
                    .attrs
                    .iter()
                    .any(|(k, v)| k == "class" && v == &segment.tag);
            if !name_matches {
                continue;
            }
            let preds_hold = segment
                .attr_preds
                .iter()
                .all(|(name, value)| data.attrs.iter().any(|(k, v)| k == name && v == value));
            if !preds_hold {
                continue;
            }
            seen += 1;
            if seen == wanted {
                return Some(self.detach(id));
            }
        }
        None
    }
}

/// One step of a path query.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    descendant: bool,
    tag: String,
    attr_preds: Vec<(String, String)>,
    position: Option<usize>,
}

fn parse_query(query: &str) -> Result<Vec<Segment>, ()> {
    let query = query.trim();
    // `.//foo` is the relative spelling of `//foo`.
    let query = query.strip_prefix('.').unwrap_or(query);
    if query.is_empty() || !query.starts_with('/') {
        return Err(());
    }
    let mut segments = Vec::new();
    let mut rest = query;
    while !rest.is_empty() {
        let descendant = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            true
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            false
        } else {
            return Err(());
        };
        let end = top_level_slash_from(rest, 0).unwrap_or(rest.len());
        let raw = &rest[..end];
        rest = &rest[end..];
        segments.push(parse_segment(raw, descendant)?);
    }
    if segments.is_empty() {
        return Err(());
    }
    Ok(segments)
}

fn parse_segment(raw: &str, descendant: bool) -> Result<Segment, ()> {
    let bracket = raw.find('[').unwrap_or(raw.len());
    let tag = raw[..bracket].trim();
    if tag.is_empty() {
        return Err(());
    }
    let mut segment = Segment {
        descendant,
        tag: tag.to_string(),
        attr_preds: Vec::new(),
        position: None,
    };
    let mut rest = &raw[bracket..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(());
        }
        let close = matching_bracket(rest)?;
        let body = rest[1..close].trim();
        rest = &rest[close + 1..];
        if let Ok(pos) = body.parse::<usize>() {
            if pos == 0 {
                return Err(());
            }
            segment.position = Some(pos);
            continue;
        }
        for clause in body.split(" and ") {
            let (name, value) = parse_attr_clause(clause.trim()).ok_or(())?;
            segment.attr_preds.push((name, value));
        }
    }
    Ok(segment)
}

fn parse_attr_clause(clause: &str) -> Option<(String, String)> {
    let clause = clause.strip_prefix('@')?;
    let (name, value) = clause.split_once('=')?;
    let value = value.trim();
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))?;
    Some((name.trim().to_string(), value.to_string()))
}

/// Index of the first `/` at bracket depth zero, at or after `from`.
fn top_level_slash_from(s: &str, from: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s[from..].char_indices().map(|(i, c)| (i + from, c)) {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' | '(' => depth += 1,
                ']' | ')' => depth -= 1,
                '/' if depth == 0 => return Some(i),
                _ => {}
            },
        }
    }
    None
}

/// Index of the last `/` at bracket depth zero.
fn last_top_level_slash(s: &str) -> Option<usize> {
    let mut result = None;
    let mut at = 0;
    while let Some(i) = top_level_slash_from(s, at) {
        result = Some(i);
        at = i + 1;
    }
    // A lone leading slash is the query root, not a split point.
    match result {
        Some(i) if s[..i].trim_matches('/').is_empty() => None,
        other => other,
    }
}

fn matching_bracket(s: &str) -> Result<usize, ()> {
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(i);
                    }
                }
                _ => {}
            },
        }
    }
    Err(())
}

/// Strategy 2: queries often name the control class where the element tag
/// should be. Rewrite the final step's tag into a `@class` predicate.
fn rewrite_last_tag_as_class(segments: &[Segment]) -> Option<Vec<Segment>> {
    let last = segments.last()?;
    if last.tag == "node" || last.tag == "*" {
        return None;
    }
    let mut rewritten = segments.to_vec();
    let last = rewritten.last_mut().expect("segments is non-empty");
    let class_name = std::mem::replace(&mut last.tag, "node".to_string());
    last.attr_preds.insert(0, ("class".to_string(), class_name));
    Some(rewritten)
}

/// Strategy 3: `(expr)[n]` selects the nth match of expr globally.
fn split_grouped_index(query: &str) -> Option<(&str, usize)> {
    let query = query.trim();
    let rest = query.strip_prefix('(')?;
    let close = rest.rfind(')')?;
    let inner = &rest[..close];
    let index_part = rest[close + 1..].trim();
    let index: usize = index_part.strip_prefix('[')?.strip_suffix(']')?.parse().ok()?;
    (index >= 1).then_some((inner, index))
}
