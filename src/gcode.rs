// G-code/M-code line tokenizer.
//
// One line at a time: a head word (`G<n>` or `M<n>`) followed by
// space-separated parameter tokens. `F` words are pulled out separately
// because they mutate feed state rather than parameterizing the command.
// Malformed tokens are reported and skipped, never fatal.

use tracing::warn;

use crate::axis::Axis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Head {
    G(u16),
    M(u16),
}

/// A feed word encountered on the line.
///
/// `F<number>` sets the global feed; `F<axis><number>` overrides one axis
/// (`FA` is in RPM). Range checking happens at application time, not here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedWord {
    Global(f64),
    PerAxis(Axis, f64),
}

#[derive(Debug, Default, PartialEq)]
pub struct ParsedLine {
    pub head: Option<Head>,
    /// `key value` parameter tokens, e.g. `R1000` or `P250`.
    pub params: Vec<(char, f64)>,
    /// Bare axis letters (used by M18's axis list).
    pub axis_flags: Vec<Axis>,
    pub feeds: Vec<FeedWord>,
}

impl ParsedLine {
    pub fn param(&self, key: char) -> Option<f64> {
        self.params
            .iter()
            .rev()
            .find(|(k, _)| *k == key.to_ascii_uppercase())
            .map(|(_, v)| *v)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum GcodeError {
    #[error("unknown command head: {0}")]
    UnknownHead(String),
}

/// Drop everything after `;` and trim whitespace.
pub fn strip_comment_and_trim(line: &str) -> &str {
    let code = match line.find(';') {
        Some(semi) => &line[..semi],
        None => line,
    };
    code.trim()
}

/// Tokenize one comment-stripped, trimmed line.
///
/// Returns `Ok(None)` for an empty line. Only an unusable head word is an
/// error; bad parameter tokens are logged and dropped.
pub fn parse_line(line: &str) -> Result<Option<ParsedLine>, GcodeError> {
    let mut tokens = line.split_whitespace();
    let Some(head_tok) = tokens.next() else {
        return Ok(None);
    };

    let head = parse_head(head_tok)?;
    let mut parsed = ParsedLine {
        head: Some(head),
        ..ParsedLine::default()
    };

    for tok in tokens {
        let mut chars = tok.chars();
        let Some(key) = chars.next() else { continue };
        let key = key.to_ascii_uppercase();

        if key == 'F' {
            if let Some(word) = parse_feed_word(tok) {
                parsed.feeds.push(word);
            }
            continue;
        }

        let rest = chars.as_str();
        if rest.is_empty() {
            // A bare axis letter is an axis selector (`M18 R T`), anything
            // else is noise.
            match Axis::from_letter(key) {
                Some(axis) => parsed.axis_flags.push(axis),
                None => warn!("ignoring token: {tok}"),
            }
            continue;
        }

        match rest.parse::<f64>() {
            Ok(value) => parsed.params.push((key, value)),
            Err(_) => warn!("ignoring token: {tok}"),
        }
    }

    Ok(Some(parsed))
}

fn parse_head(tok: &str) -> Result<Head, GcodeError> {
    let mut chars = tok.chars();
    let letter = chars.next().map(|c| c.to_ascii_uppercase());
    let number = chars.as_str().parse::<u16>();
    match (letter, number) {
        (Some('G'), Ok(n)) => Ok(Head::G(n)),
        (Some('M'), Ok(n)) => Ok(Head::M(n)),
        _ => Err(GcodeError::UnknownHead(tok.to_string())),
    }
}

fn parse_feed_word(tok: &str) -> Option<FeedWord> {
    let rest = &tok[1..];
    let mut chars = rest.chars();
    match chars.next() {
        // F100000 or F-5 -> global feed
        Some(c) if c.is_ascii_digit() || c == '-' => match rest.parse::<f64>() {
            Ok(v) => Some(FeedWord::Global(v)),
            Err(_) => {
                warn!("ignoring invalid F token: {tok}");
                None
            }
        },
        // FR10000, FA9 -> per-axis override
        Some(c) if c.is_ascii_alphabetic() => {
            let axis = match Axis::from_letter(c) {
                Some(a) => a,
                None => {
                    warn!("ignoring F token for unknown axis: {tok}");
                    return None;
                }
            };
            match chars.as_str().parse::<f64>() {
                Ok(v) => Some(FeedWord::PerAxis(axis, v)),
                Err(_) => {
                    warn!("ignoring malformed F token: {tok}");
                    None
                }
            }
        }
        _ => {
            warn!("ignoring malformed F token: {tok}");
            None
        }
    }
}
