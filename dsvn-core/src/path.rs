//! Repository path and URL helpers
//!
//! Repository-relative paths have no leading slash and use `""` for the
//! root. Log records use the absolute form (`/trunk/a`); `to_absolute` and
//! `from_absolute` convert between them.

use std::cmp::Ordering;

use crate::error::{Result, SvnError};

/// Order paths so that a directory sorts immediately before its children:
/// `/` compares lower than any other byte.
pub fn path_compare(a: &str, b: &str) -> Ordering {
    let key = |c: u8| if c == b'/' { 0u8 } else { c };
    a.bytes().map(key).cmp(b.bytes().map(key))
}

/// Sort in place with [`path_compare`].
pub fn sort_paths<S: AsRef<str>>(paths: &mut [S]) {
    paths.sort_by(|a, b| path_compare(a.as_ref(), b.as_ref()));
}

/// Strip leading/trailing slashes and collapse empty segments.
pub fn canonicalize(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty() && *s != ".").collect::<Vec<_>>().join("/")
}

pub fn to_absolute(path: &str) -> String {
    format!("/{}", canonicalize(path))
}

pub fn from_absolute(path: &str) -> String {
    canonicalize(path)
}

pub fn join(base: &str, rel: &str) -> String {
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, rel),
    }
}

/// Parent directory (`""` for top-level entries and the root).
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// `parent` is `child` or one of its ancestors.
pub fn is_ancestor(parent: &str, child: &str) -> bool {
    if parent.is_empty() {
        return true;
    }
    child == parent || (child.starts_with(parent) && child.as_bytes().get(parent.len()) == Some(&b'/'))
}

/// Remainder of `path` below `ancestor`, or `None` when unrelated.
pub fn skip_ancestor<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    if path == ancestor {
        return Some("");
    }
    path.strip_prefix(ancestor).and_then(|rest| rest.strip_prefix('/'))
}

/// Longest common ancestor of two paths, segment-wise.
pub fn common_ancestor(a: &str, b: &str) -> String {
    let common: Vec<&str> = a
        .split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect();
    canonicalize(&common.join("/"))
}

/// Ancestors of `path`, nearest first, excluding `path` itself and the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let parent = dirname(current);
        if parent.is_empty() || parent == current {
            return None;
        }
        current = parent;
        Some(parent)
    })
}

// URLs -------------------------------------------------------------------

/// Validate `url` and normalize it to the form used throughout: no trailing
/// slash, percent-encoding as produced by the `url` crate.
pub fn canonicalize_url(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url.trim())?;
    if parsed.cannot_be_a_base() {
        return Err(SvnError::IllegalUrl(format!("'{}' is not a hierarchical URL", url)));
    }
    let mut s = parsed.to_string();
    while s.ends_with('/') && !s.ends_with("://") && !s.ends_with(":///") {
        s.pop();
    }
    Ok(s)
}

/// Split a URL into its `scheme://authority` prefix and repository path.
fn split_url(url: &str) -> (&str, &str) {
    let after = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after..].find('/') {
        Some(i) => {
            let cut = after + i;
            (&url[..cut], url[cut..].trim_matches('/'))
        }
        None => (url, ""),
    }
}

pub fn url_append(url: &str, rel: &str) -> String {
    let rel = canonicalize(rel);
    if rel.is_empty() {
        url.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", url.trim_end_matches('/'), rel)
    }
}

/// URL of the parent directory; the root URL is its own parent.
pub fn url_dirname(url: &str) -> String {
    let (prefix, path) = split_url(url);
    if path.is_empty() {
        return url.to_string();
    }
    url_append(prefix, dirname(path))
}

pub fn url_basename(url: &str) -> &str {
    basename(split_url(url).1)
}

/// Path of `url` below `ancestor`, or `None` when unrelated.
pub fn url_skip_ancestor(ancestor: &str, url: &str) -> Option<String> {
    let (pa, a) = split_url(ancestor);
    let (pu, u) = split_url(url);
    if pa != pu {
        return None;
    }
    skip_ancestor(a, u).map(str::to_string)
}

/// Longest common ancestor URL, or `None` for different repositories.
pub fn url_common_ancestor(a: &str, b: &str) -> Option<String> {
    let (pa, x) = split_url(a);
    let (pb, y) = split_url(b);
    if pa != pb {
        return None;
    }
    Some(url_append(pa, &common_ancestor(x, y)))
}

/// Reduce `urls` to a common root plus relative paths. Duplicates are
/// dropped, and with `remove_nested` so are URLs below another URL in the
/// set. A URL equal to the root comes back as `""`.
pub fn condense_urls(urls: &[String], remove_nested: bool) -> Result<(String, Vec<String>)> {
    let mut canonical = urls.iter().map(|u| canonicalize_url(u)).collect::<Result<Vec<_>>>()?;
    let first = canonical
        .first()
        .cloned()
        .ok_or_else(|| SvnError::IllegalUrl("no URLs given".into()))?;
    sort_paths(&mut canonical);
    canonical.dedup();

    let mut kept: Vec<String> = Vec::new();
    for url in canonical {
        if !remove_nested || !kept.iter().any(|k| url_skip_ancestor(k, &url).is_some()) {
            kept.push(url);
        }
    }

    let mut root = first;
    for url in &kept {
        root = url_common_ancestor(&root, url)
            .ok_or_else(|| SvnError::IllegalUrl(format!("'{}' and '{}' are in different repositories", root, url)))?;
    }
    let rels = kept
        .iter()
        .filter_map(|u| url_skip_ancestor(&root, u))
        .collect();
    Ok((root, rels))
}
