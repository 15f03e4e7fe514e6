//! Composite key encoding shared by TSM files and the write cache.
//!
//! Every key stored by the engine, on disk or in memory, has the layout:
//!
//! ```text
//! ┌────────────────────────┬───────────────────────────────┬──────┬───────────┐
//! │  Namespace prefix      │  Escaped series key           │ 0x00 │ Field key │
//! │  escape(org ‖ bucket)  │  name[,tag_key=tag_value]*    │      │           │
//! └────────────────────────┴───────────────────────────────┴──────┴───────────┘
//! ```
//!
//! The namespace prefix is the big-endian organization and bucket IDs with
//! `,` and ` ` escaped, so that it can be compared byte-wise against the
//! escaped keys held by both sources. Tags are sorted by key.
//!
//! Parsing never fails hard: a key that does not follow this layout yields
//! `None` and callers skip it.

use std::borrow::Cow;

/// Number of raw bytes encoded by a namespace (org ID + bucket ID).
pub const NAMESPACE_ID_SIZE: usize = 16;

/// Separator between the escaped series key and the field key.
pub const FIELD_SEPARATOR: u8 = 0x00;

const ESCAPE: u8 = b'\\';

/// Bytes escaped in measurement names and in the namespace prefix.
const MEASUREMENT_ESCAPES: &[u8] = b", ";

/// Bytes escaped in tag keys and tag values.
const TAG_ESCAPES: &[u8] = b", =";

/// An organization and bucket pair scoping a set of series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    /// Organization identifier.
    pub org_id: u64,
    /// Bucket identifier.
    pub bucket_id: u64,
}

impl Namespace {
    /// Creates a namespace from an organization and bucket ID.
    pub fn new(org_id: u64, bucket_id: u64) -> Self {
        Self { org_id, bucket_id }
    }

    /// Returns the raw, unescaped 16-byte encoding.
    pub fn encode(&self) -> [u8; NAMESPACE_ID_SIZE] {
        let mut raw = [0u8; NAMESPACE_ID_SIZE];
        raw[..8].copy_from_slice(&self.org_id.to_be_bytes());
        raw[8..].copy_from_slice(&self.bucket_id.to_be_bytes());
        raw
    }

    /// Returns the escaped prefix shared by every key of this namespace.
    pub fn prefix(&self) -> NamespacePrefix {
        NamespacePrefix(escape_measurement(&self.encode()).into_owned())
    }
}

/// Escaped namespace prefix, safe to compare against composite keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NamespacePrefix(Vec<u8>);

impl NamespacePrefix {
    /// Encodes the prefix for the given organization and bucket.
    pub fn new(org_id: u64, bucket_id: u64) -> Self {
        Namespace::new(org_id, bucket_id).prefix()
    }

    /// Returns the escaped prefix bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if `key` belongs to this namespace.
    pub fn is_prefix_of(&self, key: &[u8]) -> bool {
        key.starts_with(&self.0)
    }

    /// Returns the prefix length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the prefix has no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for NamespacePrefix {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A composite key split into its three sections.
///
/// All sections are still escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeKey<'a> {
    /// Escaped namespace prefix.
    pub namespace: &'a [u8],
    /// Escaped series key (measurement and tags).
    pub series: &'a [u8],
    /// Field key.
    pub field: &'a [u8],
}

impl<'a> CompositeKey<'a> {
    /// Splits a raw composite key.
    ///
    /// Returns `None` if the key is shorter than a namespace prefix or has no
    /// field separator after it.
    pub fn parse(key: &'a [u8]) -> Option<Self> {
        let ns_end = namespace_len(key)?;
        let rest = &key[ns_end..];
        let sep = rest.iter().position(|&b| b == FIELD_SEPARATOR)?;
        Some(Self {
            namespace: &key[..ns_end],
            series: &rest[..sep],
            field: &rest[sep + 1..],
        })
    }

    /// Returns the unescaped measurement name, or `None` if it is empty or
    /// not valid UTF-8.
    pub fn measurement(&self) -> Option<Cow<'a, str>> {
        parse_measurement(self.series)
    }

    /// Returns the unescaped tags, or `None` if the tag section is malformed.
    pub fn tags(&self) -> Option<Vec<Tag<'a>>> {
        parse_tags(self.series)
    }
}

/// A single unescaped tag of a series key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag<'a> {
    /// Tag key.
    pub key: Cow<'a, str>,
    /// Tag value.
    pub value: Cow<'a, str>,
}

/// Extracts the measurement name from a raw composite key.
///
/// Returns `None` when the separator is missing, the measurement is empty, or
/// the name is not UTF-8. This is the only abnormal signal.
pub fn extract_measurement(key: &[u8]) -> Option<Cow<'_, str>> {
    CompositeKey::parse(key)?.measurement()
}

/// Parses the measurement name from an escaped series key.
pub fn parse_measurement(series: &[u8]) -> Option<Cow<'_, str>> {
    let end = find_unescaped(series, b',').unwrap_or(series.len());
    if end == 0 {
        return None;
    }
    into_str(unescape(&series[..end], MEASUREMENT_ESCAPES))
}

/// Parses the tags from an escaped series key.
///
/// A series with no tags yields an empty vector. A tag without `=` or with an
/// empty key makes the whole series malformed.
pub fn parse_tags(series: &[u8]) -> Option<Vec<Tag<'_>>> {
    let mut rest = match find_unescaped(series, b',') {
        Some(pos) => &series[pos + 1..],
        None => return Some(Vec::new()),
    };

    let mut tags = Vec::new();
    loop {
        let end = find_unescaped(rest, b',').unwrap_or(rest.len());
        let pair = &rest[..end];
        let eq = find_unescaped(pair, b'=')?;
        if eq == 0 {
            return None;
        }
        tags.push(Tag {
            key: into_str(unescape(&pair[..eq], TAG_ESCAPES))?,
            value: into_str(unescape(&pair[eq + 1..], TAG_ESCAPES))?,
        });
        if end == rest.len() {
            break;
        }
        rest = &rest[end + 1..];
    }
    Some(tags)
}

/// Builds an escaped series key. Tags are sorted by key.
pub fn make_series_key(measurement: &str, tags: &[(&str, &str)]) -> Vec<u8> {
    let mut sorted = tags.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));

    let mut key = escape_measurement(measurement.as_bytes()).into_owned();
    for (k, v) in sorted {
        key.push(b',');
        key.extend_from_slice(&escape_tag(k.as_bytes()));
        key.push(b'=');
        key.extend_from_slice(&escape_tag(v.as_bytes()));
    }
    key
}

/// Builds a full composite key for a series and field within a namespace.
pub fn make_composite_key(
    prefix: &NamespacePrefix,
    measurement: &str,
    tags: &[(&str, &str)],
    field: &str,
) -> Vec<u8> {
    let series = make_series_key(measurement, tags);
    let mut key = Vec::with_capacity(prefix.len() + series.len() + 1 + field.len());
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(&series);
    key.push(FIELD_SEPARATOR);
    key.extend_from_slice(field.as_bytes());
    key
}

/// Escapes `,` and ` ` for use in a measurement name or namespace prefix.
pub fn escape_measurement(raw: &[u8]) -> Cow<'_, [u8]> {
    escape_with(raw, MEASUREMENT_ESCAPES)
}

/// Escapes `,`, `=` and ` ` for use in a tag key or value.
pub fn escape_tag(raw: &[u8]) -> Cow<'_, [u8]> {
    escape_with(raw, TAG_ESCAPES)
}

fn escape_with<'a>(raw: &'a [u8], set: &[u8]) -> Cow<'a, [u8]> {
    if !raw.iter().any(|b| set.contains(b)) {
        return Cow::Borrowed(raw);
    }
    let mut out = Vec::with_capacity(raw.len() + 4);
    for &b in raw {
        if set.contains(&b) {
            out.push(ESCAPE);
        }
        out.push(b);
    }
    Cow::Owned(out)
}

fn unescape<'a>(escaped: &'a [u8], set: &[u8]) -> Cow<'a, [u8]> {
    if !escaped.contains(&ESCAPE) {
        return Cow::Borrowed(escaped);
    }
    let mut out = Vec::with_capacity(escaped.len());
    let mut i = 0;
    while i < escaped.len() {
        let b = escaped[i];
        if b == ESCAPE && escaped.get(i + 1).is_some_and(|c| set.contains(c)) {
            out.push(escaped[i + 1]);
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Cow::Owned(out)
}

/// Walks the escaped namespace prefix at the start of `key` and returns its
/// length in bytes.
fn namespace_len(key: &[u8]) -> Option<usize> {
    let mut i = 0;
    for _ in 0..NAMESPACE_ID_SIZE {
        let b = *key.get(i)?;
        if b == ESCAPE && key.get(i + 1).is_some_and(|c| MEASUREMENT_ESCAPES.contains(c)) {
            i += 2;
        } else {
            i += 1;
        }
    }
    Some(i)
}

/// Position of the first `delim` not preceded by an escape.
fn find_unescaped(bytes: &[u8], delim: u8) -> Option<usize> {
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            ESCAPE if i + 1 < bytes.len() => i += 2,
            b if b == delim => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn into_str(bytes: Cow<'_, [u8]>) -> Option<Cow<'_, str>> {
    match bytes {
        Cow::Borrowed(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
        Cow::Owned(v) => String::from_utf8(v).ok().map(Cow::Owned),
    }
}
