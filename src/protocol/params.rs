//! `key=value` parameter extraction.
//!
//! Replies and notifications carry parameters as space-separated tokens:
//!
//! ```text
//! modload name="xam.xex" base=0x81A40000 size=0x00160000 xbe
//! └──┬──┘ └─────┬──────┘ └──────┬──────┘ └──────┬──────┘ └┬┘
//!  command   quoted value     hex value      hex value    flag
//! ```
//!
//! Keys compare case-insensitively. Quoted values may contain spaces and
//! `\"` escapes. Numbers with a `0x` prefix are hex, otherwise decimal.

/// Parsed parameters of one line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamList {
    command: Option<String>,
    entries: Vec<(String, Option<String>)>,
}

impl ParamList {
    /// Tokenize `input`. When `has_command` is set the first word is kept
    /// apart as the command rather than treated as a flag.
    pub fn parse(input: &str, has_command: bool) -> Self {
        let mut tokens = tokenize(input).into_iter();
        let command = if has_command { tokens.next() } else { None };
        let entries = tokens
            .map(|token| match token.split_once('=') {
                Some((key, value)) => (key.to_owned(), Some(unquote(value))),
                None => (token, None),
            })
            .collect();
        Self { command, entries }
    }

    /// First word of the line, if parsed with a command.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|(k, v)| match v {
            Some(v) if k.eq_ignore_ascii_case(key) => Some(v.as_str()),
            _ => None,
        })
    }

    /// `key` parsed as a 32-bit number.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(parse_number).and_then(|v| u32::try_from(v).ok())
    }

    /// `key` parsed as a 64-bit number.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(parse_number)
    }

    /// Whether a bare word (no `=`) named `flag` is present.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.entries
            .iter()
            .any(|(k, v)| v.is_none() && k.eq_ignore_ascii_case(flag))
    }
}

/// Everything after the first ` key=` in `input`, unparsed.
///
/// Used for free-text parameters such as `debugstr ... string=<text>` that
/// run to the end of the line and may contain anything.
pub fn value_to_end<'a>(input: &'a str, key: &str) -> Option<&'a str> {
    let lower = input.to_ascii_lowercase();
    let needle = format!(" {}=", key.to_ascii_lowercase());
    let start = lower.find(&needle)? + needle.len();
    input.get(start..)
}

/// Parse `0x`-prefixed hex or plain decimal.
pub fn parse_number(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) if !hex.is_empty() => u64::from_str_radix(hex, 16).ok(),
        Some(_) => None,
        None => text.parse().ok(),
    }
}

fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut prev = '\0';

    for c in input.chars() {
        if c == '"' && prev != '\\' {
            in_quote = !in_quote;
            current.push(c);
        } else if c.is_whitespace() && !in_quote {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
        prev = c;
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn unquote(value: &str) -> String {
    match value.strip_prefix('"') {
        Some(inner) => inner
            .strip_suffix('"')
            .unwrap_or(inner)
            .replace("\\\"", "\""),
        None => value.to_owned(),
    }
}
