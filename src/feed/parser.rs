use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// SEC-003: Maximum element nesting accepted in a feed document.
const MAX_DEPTH: usize = 64;

/// The document could not be decoded as an RSS 2.0 channel.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    Xml(String),

    #[error("document has no <channel> element")]
    MissingChannel,

    #[error("element nesting exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),
}

/// One fetched and decoded feed. Lives for a single ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedDocument {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Items in document order, which is not necessarily chronological
    pub items: Vec<FeedEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub title: String,
    pub link: String,
    pub description: String,
    /// Raw `<pubDate>` text; see [`parse_pub_date`](super::parse_pub_date)
    pub pub_date: String,
}

/// Decode an RSS 2.0 document.
///
/// Reads `<channel>` `title`/`link`/`description` and every `<item>`'s
/// `title`/`link`/`description`/`pubDate`. Anything else, including
/// namespaced elements such as `<atom:link>`, is skipped. Text and CDATA are
/// both accepted. Titles and descriptions are HTML-unescaped afterwards, so
/// double-encoded entities like `&amp;amp;` come out as plain text.
pub fn parse_rss(bytes: &[u8]) -> Result<FeedDocument, ParseError> {
    // SEC-002: quick-xml (0.37) never expands <!ENTITY> declarations; only the
    // five XML builtins and character references are resolved.
    let mut reader = Reader::from_reader(bytes);

    let mut doc = FeedDocument::default();
    let mut saw_channel = false;
    let mut current: Option<FeedEntry> = None;
    let mut path: Vec<Vec<u8>> = Vec::new();
    // Depth of the collected field we are inside, if any. Markup nested in a
    // field is skipped, but the text around it is kept.
    let mut field_depth: Option<usize> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                if field_depth.is_none() {
                    if name == b"channel" {
                        saw_channel = true;
                    } else if name == b"item" && parent_is(&path, b"channel") {
                        current = Some(FeedEntry::default());
                    }
                }
                path.push(name);
                if path.len() > MAX_DEPTH {
                    return Err(ParseError::MaxDepthExceeded(MAX_DEPTH));
                }
                if field_depth.is_none() && is_field(&path) {
                    field_depth = Some(path.len());
                    text.clear();
                }
            }
            Ok(Event::Empty(e)) => {
                if field_depth.is_none() && e.name().as_ref() == b"channel" {
                    saw_channel = true;
                }
            }
            Ok(Event::Text(e)) => {
                if field_depth == Some(path.len()) {
                    match e.unescape() {
                        Ok(s) => text.push_str(&s),
                        Err(err) => {
                            // Stray HTML entities (&nbsp;) are not XML; keep the raw
                            // text and let the HTML unescape pass deal with them.
                            tracing::debug!(error = %err, "Keeping raw text for unrecognized entity");
                            text.push_str(&String::from_utf8_lossy(&e));
                        }
                    }
                }
            }
            Ok(Event::CData(e)) => {
                if field_depth == Some(path.len()) {
                    text.push_str(&String::from_utf8_lossy(&e));
                }
            }
            Ok(Event::End(_)) => {
                let depth = path.len();
                let closed = path.pop().unwrap_or_default();
                match field_depth {
                    Some(d) if d == depth => {
                        field_depth = None;
                        let value = text.trim().to_string();
                        text.clear();
                        match (closed.as_slice(), path.last().map(Vec::as_slice)) {
                            (field, Some(b"item")) => {
                                if let Some(entry) = current.as_mut() {
                                    match field {
                                        b"title" => entry.title = value,
                                        b"link" => entry.link = value,
                                        b"description" => entry.description = value,
                                        b"pubDate" => entry.pub_date = value,
                                        _ => {}
                                    }
                                }
                            }
                            (field, Some(b"channel")) => match field {
                                b"title" => doc.title = value,
                                b"link" => doc.link = value,
                                b"description" => doc.description = value,
                                _ => {}
                            },
                            _ => {}
                        }
                    }
                    // End of markup nested inside a field
                    Some(_) => {}
                    None => {
                        if closed == b"item" && parent_is(&path, b"channel") {
                            if let Some(entry) = current.take() {
                                doc.items.push(entry);
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if !saw_channel {
        return Err(ParseError::MissingChannel);
    }
    if !path.is_empty() {
        return Err(ParseError::Xml("unexpected end of document".to_string()));
    }

    unescape_html_fields(&mut doc);
    Ok(doc)
}

fn parent_is(path: &[Vec<u8>], name: &[u8]) -> bool {
    path.last().map(Vec::as_slice) == Some(name)
}

/// True while inside a leaf we collect text for.
fn is_field(path: &[Vec<u8>]) -> bool {
    let n = path.len();
    if n < 2 {
        return false;
    }
    let leaf = path[n - 1].as_slice();
    match path[n - 2].as_slice() {
        b"channel" => matches!(leaf, b"title" | b"link" | b"description"),
        b"item" => matches!(leaf, b"title" | b"link" | b"description" | b"pubDate"),
        _ => false,
    }
}

fn unescape_html_fields(doc: &mut FeedDocument) {
    doc.title = unescape_html(&doc.title);
    doc.description = unescape_html(&doc.description);
    for item in &mut doc.items {
        item.title = unescape_html(&item.title);
        item.description = unescape_html(&item.description);
    }
}

/// Longest entity body we try to decode, e.g. `CounterClockwiseContourIntegral`.
const MAX_ENTITY_LEN: usize = 32;

/// Decode HTML entities one at a time.
///
/// Each `&name;`, `&#NN;` or `&#xHH;` is decoded on its own, so a stray `&`
/// or an unknown entity stays as written without blocking the rest.
pub fn unescape_html(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let body_len = rest[1..]
            .bytes()
            .take(MAX_ENTITY_LEN + 1)
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'#')
            .count();
        let candidate = &rest[..1 + body_len];
        if body_len > 0 && body_len <= MAX_ENTITY_LEN && rest[1 + body_len..].starts_with(';') {
            let entity = &rest[..body_len + 2];
            match htmlescape::decode_html(entity) {
                Ok(decoded) => {
                    out.push_str(&decoded);
                    rest = &rest[entity.len()..];
                    continue;
                }
                Err(e) => {
                    tracing::debug!(entity = %entity, error = ?e, "Leaving unknown HTML entity as-is");
                }
            }
        }
        out.push_str(candidate);
        rest = &rest[candidate.len()..];
    }
    out.push_str(rest);
    out
}
