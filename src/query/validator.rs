use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

/// Reason codes for rejected queries. First failing check wins; the
/// validator never rewrites or sanitizes a query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("query exceeds maximum length ({len} > {max})")]
    TooLong { len: usize, max: usize },
    #[error("only SELECT statements are allowed")]
    NotSelectOnly,
    #[error("blacklisted keyword: {0}")]
    BlacklistedKeyword(String),
    #[error("injection pattern detected: {0}")]
    InjectionPattern(&'static str),
    #[error("unbalanced {0}")]
    UnbalancedSyntax(&'static str),
}

/// Keywords rejected as whole tokens anywhere outside string literals.
const BLACKLIST: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "EXEC", "EXECUTE", "XP_CMDSHELL", "LOAD_FILE", "OUTFILE", "DUMPFILE", "SHUTDOWN",
];

/// Schemas that caller-supplied identifiers may never target.
const RESERVED_SCHEMAS: &[&str] = &["information_schema", "mysql", "performance_schema", "sys"];

fn union_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bunion(?:\s+all)?\s+select\b").unwrap())
}

fn tautology_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // OR <literal> = <literal>; equality of both sides is checked separately.
    RE.get_or_init(|| Regex::new(r"(?i)\bor\s+('?[\w.]+'?)\s*=\s*('?[\w.]+'?)").unwrap())
}

/// Findings from one quote-aware pass over the statement body.
///
/// `normalized` is the body with every quoted region replaced by a
/// placeholder, so pattern checks over it never match literal content.
/// Identical literals map to the same placeholder, which keeps quoted
/// tautologies (`'a'='a'`) detectable.
#[derive(Debug, Default)]
struct ScanReport {
    blacklisted: Option<String>,
    has_separator: bool,
    has_comment: bool,
    unbalanced: Option<&'static str>,
    normalized: String,
}

/// Statement-level safety gate for caller-supplied read queries.
///
/// This is a defense-in-depth layer over a read-only database account, not a
/// proof of SQL-injection immunity; ambiguous input is rejected, not guessed.
#[derive(Debug, Clone)]
pub struct QueryValidator {
    max_length: usize,
}

impl QueryValidator {
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Validate a query; `Ok(())` means the statement may be executed.
    pub fn validate(&self, query: &str) -> Result<(), ValidationError> {
        if query.len() > self.max_length {
            return Err(ValidationError::TooLong {
                len: query.len(),
                max: self.max_length,
            });
        }

        // Leading whitespace and comments are legitimate; everything after
        // them must start with SELECT.
        let body = strip_leading_trivia(query).ok_or(ValidationError::NotSelectOnly)?;
        let first = leading_keyword(body);
        if !first.eq_ignore_ascii_case("select") {
            debug!(keyword = %first, "query does not start with SELECT");
            return Err(ValidationError::NotSelectOnly);
        }

        let report = scan(body);
        if let Some(keyword) = report.blacklisted {
            return Err(ValidationError::BlacklistedKeyword(keyword));
        }
        if report.has_separator {
            return Err(ValidationError::InjectionPattern("statement separator"));
        }
        if report.has_comment {
            return Err(ValidationError::InjectionPattern("comment sequence"));
        }
        if let Some(what) = report.unbalanced {
            return Err(ValidationError::UnbalancedSyntax(what));
        }

        if union_pattern().is_match(&report.normalized) {
            return Err(ValidationError::InjectionPattern("appended UNION SELECT"));
        }
        for caps in tautology_pattern().captures_iter(&report.normalized) {
            let lhs = caps[1].trim_matches('\'');
            let rhs = caps[2].trim_matches('\'');
            if lhs.eq_ignore_ascii_case(rhs) {
                return Err(ValidationError::InjectionPattern("tautological condition"));
            }
        }

        Ok(())
    }
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Skip leading whitespace, `-- ...` line comments and `/* ... */` block
/// comments. `None` when nothing but trivia remains (including an
/// unterminated leading block comment).
fn strip_leading_trivia(query: &str) -> Option<&str> {
    let mut rest = query;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail)?;
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail)?;
        } else if rest.is_empty() {
            return None;
        } else {
            return Some(rest);
        }
    }
}

fn leading_keyword(body: &str) -> &str {
    let end = body
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(body.len());
    &body[..end]
}

/// One pass over the statement body tracking string-literal state, so that
/// quoted content never triggers keyword, separator or pattern findings.
fn scan(body: &str) -> ScanReport {
    let mut report = ScanReport::default();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    let mut depth: i64 = 0;
    let mut token = String::new();
    let mut literals: Vec<String> = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                flush_token(&mut token, &mut report);
                let quote = c;
                let mut content = String::new();
                let mut closed = false;
                i += 1;
                while i < chars.len() {
                    let q = chars[i];
                    if q == '\\' && quote != '`' {
                        content.push(q);
                        if let Some(&escaped) = chars.get(i + 1) {
                            content.push(escaped);
                        }
                        i += 2;
                        continue;
                    }
                    if q == quote {
                        // Doubled quote is an escaped literal quote.
                        if chars.get(i + 1) == Some(&quote) {
                            content.push(quote);
                            i += 2;
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    content.push(q);
                    i += 1;
                }
                if !closed {
                    report.unbalanced.get_or_insert("quotes");
                    return report;
                }
                let id = literal_id(&mut literals, &content);
                report.normalized.push(quote);
                report.normalized.push_str(&format!("__lit_{id}__"));
                report.normalized.push(quote);
            }
            ';' => {
                flush_token(&mut token, &mut report);
                report.has_separator = true;
                report.normalized.push(c);
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                flush_token(&mut token, &mut report);
                report.has_comment = true;
                report.normalized.push_str("--");
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                flush_token(&mut token, &mut report);
                report.has_comment = true;
                report.normalized.push_str("/*");
                i += 1;
            }
            '(' => {
                flush_token(&mut token, &mut report);
                depth += 1;
                report.normalized.push(c);
            }
            ')' => {
                flush_token(&mut token, &mut report);
                depth -= 1;
                if depth < 0 {
                    report.unbalanced.get_or_insert("parentheses");
                }
                report.normalized.push(c);
            }
            _ if c.is_ascii_alphanumeric() || c == '_' => {
                token.push(c);
                report.normalized.push(c);
            }
            _ => {
                flush_token(&mut token, &mut report);
                report.normalized.push(c);
            }
        }
        i += 1;
    }
    flush_token(&mut token, &mut report);

    if depth != 0 {
        report.unbalanced.get_or_insert("parentheses");
    }
    report
}

/// Stable placeholder id per distinct literal content, compared
/// case-insensitively to match the tautology check.
fn literal_id(literals: &mut Vec<String>, content: &str) -> usize {
    if let Some(pos) = literals
        .iter()
        .position(|known| known.eq_ignore_ascii_case(content))
    {
        pos
    } else {
        literals.push(content.to_string());
        literals.len() - 1
    }
}

fn flush_token(token: &mut String, report: &mut ScanReport) {
    if token.is_empty() {
        return;
    }
    if report.blacklisted.is_none() {
        let upper = token.to_ascii_uppercase();
        if BLACKLIST.contains(&upper.as_str()) {
            report.blacklisted = Some(upper);
        }
    }
    token.clear();
}

/// Validate a caller-supplied database or table identifier that a tool will
/// interpolate into a statement.
pub fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ValidationError::InjectionPattern("invalid identifier"));
    }
    if name.len() > 64 {
        return Err(ValidationError::TooLong {
            len: name.len(),
            max: 64,
        });
    }
    if RESERVED_SCHEMAS
        .iter()
        .any(|reserved| name.eq_ignore_ascii_case(reserved))
    {
        return Err(ValidationError::BlacklistedKeyword(name.to_string()));
    }
    Ok(())
}
