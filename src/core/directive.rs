//! Extracts credential directives from a machine's free-form annotation.
//!
//! A directive is a run of `key:"value"` tokens terminated by a semicolon, e.g.
//!
//! ```text
//! Web front end. Ask Dana before rebooting.
//! user:"admin" pass:"Pw1" protos:"rdp,ssh" rdp_port:"3390";
//! ```
//!
//! Values may be double quoted, single quoted, or bare. Keys are case-insensitive and several
//! spellings are accepted for each (see [canonical_key]). Any text that contains no recognized key
//! is treated as prose: it is kept in the annotation but never interpreted.
//!
//! Parsing never fails. Problems are collected as [ParseWarning]s and the offending block is
//! skipped, so a single bad line never hides the rest of a machine's directives.

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use std::fmt::{self, Display};
use std::ops::Range;
use std::sync::OnceLock;

/// Canonical key for the login name.
pub const USERNAME: &str = "username";
/// Canonical key for a plaintext secret.
pub const PASSWORD: &str = "password";
/// Canonical key for an encrypted secret.
pub const ENCRYPTED_PASSWORD: &str = "encrypted_password";
/// Canonical key for the comma-separated protocol list.
pub const PROTOCOLS: &str = "protocols";
/// Canonical key for the connection name template.
pub const CONNECTION_NAME: &str = "connection_name";
/// Canonical key for an annotation-wide default name template.
pub const DEFAULT_CONNECTION_NAME: &str = "default_conf_name";
/// Canonical key for a port that applies to every protocol without its own `<proto>_port`.
pub const PORT: &str = "port";
/// Canonical key for wake-on-LAN settings.
pub const WAKE_SETTINGS: &str = "wol_settings";
/// Canonical key that turns wake-on-LAN off.
pub const WAKE_DISABLED: &str = "wol_disabled";

// Maps every accepted (lowercased) spelling to its canonical key.
const ALIASES: &[(&str, &str)] = &[
    ("username", USERNAME),
    ("user", USERNAME),
    ("password", PASSWORD),
    ("pass", PASSWORD),
    ("encrypted_password", ENCRYPTED_PASSWORD),
    ("protocols", PROTOCOLS),
    ("protos", PROTOCOLS),
    ("proto", PROTOCOLS),
    ("connection_name", CONNECTION_NAME),
    ("confname", CONNECTION_NAME),
    ("default_conf_name", DEFAULT_CONNECTION_NAME),
    ("port", PORT),
    ("rdp_port", "rdp_port"),
    ("vnc_port", "vnc_port"),
    ("ssh_port", "ssh_port"),
    ("rdp_settings", "rdp_settings"),
    ("rdpsettings", "rdp_settings"),
    ("vnc_settings", "vnc_settings"),
    ("vncsettings", "vnc_settings"),
    ("ssh_settings", "ssh_settings"),
    ("sshsettings", "ssh_settings"),
    ("wol_settings", WAKE_SETTINGS),
    ("wolsettings", WAKE_SETTINGS),
    ("wol_disabled", WAKE_DISABLED),
    ("woldisabled", WAKE_DISABLED),
];

/// Returns the canonical form of a directive key, or `None` if the key is not recognized.
///
/// Matching is case-insensitive, so `confName`, `CONFNAME`, and `confname` are all
/// [CONNECTION_NAME].
pub fn canonical_key(key: &str) -> Option<&'static str> {
    let key = key.to_ascii_lowercase();
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
}

fn token_regex() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(r#"([A-Za-z_]\w*):[ \t]*(?:"([^"\n]*)"|'([^'\n]*)'|([^\s;"']+))"#)
            .expect("BUG: directive token pattern should compile")
    })
}

/// Byte range and first line of a directive within its annotation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Span {
    /// Byte offset of the first token.
    pub start: usize,
    /// Byte offset just past the terminating semicolon.
    pub end: usize,
    /// 1-based line number of the first token.
    pub line: usize,
}

/// One `key:"value"` token from a directive.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DirectiveValue {
    /// The key exactly as written, before canonicalization.
    pub raw_key: String,
    /// The unquoted value.
    pub value: String,
    /// Location of the whole token relative to [RawDirectiveRecord::source].
    #[serde(skip)]
    pub token: Range<usize>,
}

/// A single well-formed directive block, keyed by canonical key in the order written.
///
/// Unrecognized keys are kept under their lowercased spelling so that nothing in the source is
/// silently lost, but nothing downstream reads them.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RawDirectiveRecord {
    entries: IndexMap<String, DirectiveValue>,
    source: String,
    span: Span,
}

impl RawDirectiveRecord {
    /// Looks up a value by canonical key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.value.as_str())
    }

    /// Looks up the full token for a canonical key.
    pub fn entry(&self, key: &str) -> Option<&DirectiveValue> {
        self.entries.get(key)
    }

    /// Returns `true` if the record contains a canonical key.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates over `(canonical key, value)` pairs in source order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.value.as_str()))
    }

    /// The directive's text, from its first token through its terminating semicolon.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Builds a replacement for this record from edited source text. The span still refers to
    /// the original location so that [Annotation::render] can splice the new text in place.
    ///
    /// Returns `None` if `source` no longer parses as exactly one complete directive.
    pub fn with_source(&self, source: impl Into<String>) -> Option<Self> {
        let source = source.into();
        let parsed = parse_annotation(&source);
        if parsed.records.len() != 1 || !parsed.warnings.is_empty() {
            return None;
        }
        let mut record = parsed.records.into_iter().next()?;
        record.source = source;
        record.span = self.span.clone();
        Some(record)
    }
}

/// Why a block of annotation text was skipped.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub enum WarningKind {
    /// Directive tokens were found with no terminating semicolon.
    Unterminated,
    /// A quote was opened but never closed.
    UnbalancedQuote,
    /// One or more required fields were missing or blank.
    MissingFields(Vec<&'static str>),
    /// A recognized key appeared more than once, usually because two directives ran together.
    DuplicateKey(&'static str),
}

/// A non-fatal problem found while parsing an annotation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ParseWarning {
    pub line: usize,
    pub kind: WarningKind,
}

impl Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: ", self.line)?;
        match &self.kind {
            WarningKind::Unterminated => write!(f, "directive is missing its terminating ';'"),
            WarningKind::UnbalancedQuote => write!(f, "directive contains an unbalanced quote"),
            WarningKind::MissingFields(fields) => {
                write!(f, "directive is missing {}", fields.join(", "))
            }
            WarningKind::DuplicateKey(key) => {
                write!(f, "directive sets {key} more than once; is a ';' missing?")
            }
        }
    }
}

/// The parsed form of a machine annotation.
///
/// Holds on to the original text so that edited records can be written back without disturbing
/// anything around them.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Annotation {
    #[serde(skip)]
    text: String,
    /// Well-formed directives, in source order.
    pub records: Vec<RawDirectiveRecord>,
    pub warnings: Vec<ParseWarning>,
    /// A name template set with `default_conf_name:"..."`; applies to records without their own.
    pub default_template: Option<String>,
}

impl Annotation {
    /// The unmodified annotation text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Rebuilds the annotation text, replacing each record's original span with the source of the
    /// record at the same span in `records`.
    ///
    /// Text outside of directive spans is copied byte for byte. Records whose spans do not appear
    /// in this annotation are ignored.
    pub fn render(&self, records: &[RawDirectiveRecord]) -> String {
        let mut replacements: Vec<&RawDirectiveRecord> = records
            .iter()
            .filter(|r| self.records.iter().any(|o| o.span == r.span))
            .collect();
        replacements.sort_by_key(|r| r.span.start);

        let mut output = String::with_capacity(self.text.len());
        let mut cursor = 0;
        for record in replacements {
            if record.span.start < cursor || record.span.end > self.text.len() {
                continue;
            }
            output.push_str(&self.text[cursor..record.span.start]);
            output.push_str(&record.source);
            cursor = record.span.end;
        }
        output.push_str(&self.text[cursor..]);
        output
    }
}

/// Parses every directive in `text`.
///
/// Produces zero or more records and zero or more warnings; never fails.
pub fn parse_annotation(text: &str) -> Annotation {
    let mut annotation = Annotation {
        text: text.to_string(),
        records: Vec::new(),
        warnings: Vec::new(),
        default_template: None,
    };

    let mut tokens: Vec<Token> = Vec::new();
    let mut cursor = 0;
    loop {
        let next_semicolon = text[cursor..].find(';').map(|i| cursor + i);
        let next_token = token_regex().captures_at(text, cursor).map(Token::from);

        match (next_token, next_semicolon) {
            // A token that starts before the next semicolon belongs to the current block. A quoted
            // value may itself contain a semicolon, so the token decides where to resume.
            (Some(token), semi) if semi.map_or(true, |s| token.range.start < s) => {
                cursor = token.range.end;
                tokens.push(token);
            }
            (_, Some(semi)) => {
                let block = std::mem::take(&mut tokens);
                finish_block(&mut annotation, text, block, semi + 1);
                cursor = semi + 1;
            }
            (_, None) => {
                if let Some(token) = tokens.iter().find(|t| canonical_key(&t.key).is_some()) {
                    annotation.warnings.push(ParseWarning {
                        line: line_of(text, token.range.start),
                        kind: WarningKind::Unterminated,
                    });
                }
                break;
            }
        }
    }
    annotation
}

struct Token {
    key: String,
    value: String,
    range: Range<usize>,
}

impl From<regex::Captures<'_>> for Token {
    fn from(captures: regex::Captures<'_>) -> Self {
        // Group 0 always participates in a match.
        let whole = captures.get(0).map_or(0..0, |m| m.range());
        let value = (2..=4)
            .find_map(|i| captures.get(i))
            .map_or("", |m| m.as_str());
        Token {
            key: captures
                .get(1)
                .map_or(String::new(), |m| m.as_str().to_string()),
            value: value.to_string(),
            range: whole,
        }
    }
}

/// Returns `true` if a directive value is empty or only white space.
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

// Turns the tokens collected up to a semicolon into a record, a default template, a warning, or
// nothing at all (for prose).
fn finish_block(annotation: &mut Annotation, text: &str, mut tokens: Vec<Token>, end: usize) {
    // Prose that happens to look like `word: word` may precede the directive proper.
    let Some(first) = tokens.iter().position(|t| canonical_key(&t.key).is_some()) else {
        return;
    };
    let tokens = tokens.split_off(first);

    let start = tokens[0].range.start;
    let line = line_of(text, start);

    // Anything between tokens should be white space or prose. A stray quote there means a value
    // was never closed and the tokens after it cannot be trusted.
    let mut gap_start = start;
    for token in tokens.iter() {
        if text[gap_start..token.range.start].contains(['"', '\'']) {
            annotation.warnings.push(ParseWarning {
                line,
                kind: WarningKind::UnbalancedQuote,
            });
            return;
        }
        gap_start = token.range.end;
    }
    if text[gap_start..end].contains(['"', '\'']) {
        annotation.warnings.push(ParseWarning {
            line,
            kind: WarningKind::UnbalancedQuote,
        });
        return;
    }

    let mut entries: IndexMap<String, DirectiveValue> = IndexMap::new();
    for token in tokens {
        let value = DirectiveValue {
            token: (token.range.start - start)..(token.range.end - start),
            value: token.value,
            raw_key: token.key,
        };
        match canonical_key(&value.raw_key) {
            Some(canonical) if entries.contains_key(canonical) => {
                annotation.warnings.push(ParseWarning {
                    line,
                    kind: WarningKind::DuplicateKey(canonical),
                });
                return;
            }
            Some(canonical) => {
                entries.insert(canonical.to_string(), value);
            }
            // Unrecognized keys are prose; the first spelling is kept.
            None => {
                entries
                    .entry(value.raw_key.to_ascii_lowercase())
                    .or_insert(value);
            }
        }
    }

    if entries.len() == 1 {
        if let Some(template) = entries.get(DEFAULT_CONNECTION_NAME) {
            annotation.default_template = Some(template.value.clone());
            return;
        }
    }

    let filled = |key: &str| entries.get(key).is_some_and(|v| !is_blank(&v.value));
    let mut missing = Vec::new();
    if !filled(USERNAME) {
        missing.push(USERNAME);
    }
    if !filled(PASSWORD) && !filled(ENCRYPTED_PASSWORD) {
        missing.push(PASSWORD);
    }
    if !filled(PROTOCOLS) {
        missing.push(PROTOCOLS);
    }
    if !missing.is_empty() {
        annotation.warnings.push(ParseWarning {
            line,
            kind: WarningKind::MissingFields(missing),
        });
        return;
    }

    annotation.records.push(RawDirectiveRecord {
        entries,
        source: text[start..end].to_string(),
        span: Span { start, end, line },
    });
}
