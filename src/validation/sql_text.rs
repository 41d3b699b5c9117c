// Lexical helpers shared by the safety validator and the dialect adapters.
//
// These work on raw SQL text without parsing it: they know about string
// literals, quoted identifiers and comments, and nothing else.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::Dialect;

static TRAILING_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\blimit\s+(?:(\d+)\s*,\s*)?(\d+|all)(\s+offset\s+\d+)?\s*$")
        .expect("trailing LIMIT pattern is valid")
});

/// How an engine tokenizes comments and string literals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LexicalRules {
    /// `#` starts a line comment
    pub hash_comments: bool,
    /// A backslash escapes the next character in every string literal
    pub backslash_escapes: bool,
    /// Only `E'...'` literals honour backslash escapes
    pub escape_string_prefix: bool,
}

impl LexicalRules {
    pub fn for_dialect(dialect: Dialect) -> Self {
        match dialect {
            Dialect::MySql => Self {
                hash_comments: true,
                backslash_escapes: true,
                escape_string_prefix: false,
            },
            Dialect::PostgreSql => Self {
                escape_string_prefix: true,
                ..Self::default()
            },
            Dialect::Sqlite | Dialect::SqlServer => Self::default(),
        }
    }

    /// Whether backslashes escape inside the literal opened at `start`
    fn backslash_escapes_at(&self, chars: &[char], start: usize) -> bool {
        match chars[start] {
            '`' => false,
            '"' => self.backslash_escapes,
            _ if self.backslash_escapes => true,
            _ if self.escape_string_prefix => {
                start > 0
                    && matches!(chars[start - 1], 'e' | 'E')
                    && (start == 1 || !is_word_char(chars[start - 2]))
            }
            _ => false,
        }
    }
}

/// Remove `--` and `/* */` comments (and `#` comments where the engine has
/// them), leaving string literals and quoted identifiers untouched.
pub fn strip_comments(sql: &str, rules: LexicalRules) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                let (end, _) = quoted_end(&chars, i, rules.backslash_escapes_at(&chars, i));
                out.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '#' if rules.hash_comments => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Replace the contents of single-quoted string literals with spaces so
/// keyword scans never match data. Output has as many characters as input.
pub fn blank_string_literals(sql: &str, rules: LexicalRules) -> String {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' => {
                let (end, closed) = quoted_end(&chars, i, rules.backslash_escapes_at(&chars, i));
                let content_end = if closed { end - 1 } else { end };
                out.push('\'');
                out.extend(std::iter::repeat(' ').take(content_end - (i + 1)));
                if closed {
                    out.push('\'');
                }
                i = end;
            }
            '"' | '`' => {
                let (end, _) = quoted_end(&chars, i, rules.backslash_escapes_at(&chars, i));
                out.extend(&chars[i..end]);
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

/// Index one past the closing quote of the literal starting at `start`,
/// and whether a closing quote was found. A doubled quote is always an
/// escaped quote; a backslash only when `backslash` is set.
fn quoted_end(chars: &[char], start: usize, backslash: bool) -> (usize, bool) {
    let quote = chars[start];
    let mut i = start + 1;
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return (i + 1, true);
        }
        if backslash && chars[i] == '\\' {
            i += 2;
            continue;
        }
        i += 1;
    }
    (chars.len(), false)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Trim whitespace and every trailing statement terminator
pub fn trim_terminators(sql: &str) -> &str {
    sql.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace())
}

/// Comment stripping plus terminator removal
pub fn sanitize(sql: &str, rules: LexicalRules) -> String {
    trim_terminators(&strip_comments(sql, rules)).to_string()
}

/// True when a `;` separates two statements
pub fn has_inner_terminator(sanitized: &str, rules: LexicalRules) -> bool {
    trim_terminators(&blank_string_literals(sanitized, rules)).contains(';')
}

/// One statement that opens with `SELECT` or `WITH`. Expects sanitized SQL.
pub fn is_single_read(sanitized: &str, rules: LexicalRules) -> bool {
    let scan = blank_string_literals(sanitized, rules);
    let verb: String = scan
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();

    (verb.eq_ignore_ascii_case("select") || verb.eq_ignore_ascii_case("with"))
        && !has_inner_terminator(sanitized, rules)
}

/// Byte offset of the first word-bounded `keyword` at parenthesis depth
/// zero, outside literals and quoted identifiers. Case-insensitive.
pub fn find_top_level_keyword(sql: &str, keyword: &str) -> Option<usize> {
    let bytes = sql.as_bytes();
    let keyword = keyword.as_bytes();
    let mut depth: i32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
                continue;
            }
            b'[' => {
                while i < bytes.len() && bytes[i] != b']' {
                    i += 1;
                }
                i += 1;
                continue;
            }
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {
                if depth == 0
                    && bytes.len() - i >= keyword.len()
                    && bytes[i..i + keyword.len()].eq_ignore_ascii_case(keyword)
                    && (i == 0 || !is_word_byte(bytes[i - 1]))
                    && bytes.get(i + keyword.len()).map_or(true, |b| !is_word_byte(*b))
                {
                    return Some(i);
                }
            }
        }
        i += 1;
    }

    None
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b == b'@' || b == b'#'
}

/// Row limit for engines that paginate with a trailing `LIMIT n`.
/// A stricter existing limit is kept, a looser one (or `LIMIT ALL`) is
/// replaced, and a missing one is appended. Expects sanitized SQL.
pub fn enforce_trailing_limit(sql: &str, max_rows: u64) -> String {
    let body = trim_terminators(sql);

    if let Some(count) = TRAILING_LIMIT.captures(body).and_then(|caps| caps.get(2)) {
        if matches!(count.as_str().parse::<u64>(), Ok(n) if n <= max_rows) {
            return body.to_string();
        }
        return format!("{}{}{}", &body[..count.start()], max_rows, &body[count.end()..]);
    }

    format!("{} LIMIT {}", body, max_rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(dialect: Dialect) -> LexicalRules {
        LexicalRules::for_dialect(dialect)
    }

    #[test]
    fn test_strip_comments() {
        let sql = "SELECT a -- trailing\nFROM t /* block */ WHERE b = '--not a comment'";
        assert_eq!(
            strip_comments(sql, rules(Dialect::PostgreSql)),
            "SELECT a \nFROM t   WHERE b = '--not a comment'"
        );
        assert_eq!(strip_comments("SELECT 1 # note", rules(Dialect::MySql)).trim(), "SELECT 1");
        assert_eq!(strip_comments("SELECT 1 # note", rules(Dialect::Sqlite)), "SELECT 1 # note");
    }

    #[test]
    fn test_blank_string_literals() {
        assert_eq!(
            blank_string_literals("SELECT 'drop it''s' FROM t", rules(Dialect::Sqlite)),
            "SELECT '          ' FROM t"
        );
    }

    #[test]
    fn test_unterminated_literal_keeps_length() {
        for dialect in [Dialect::PostgreSql, Dialect::MySql, Dialect::Sqlite, Dialect::SqlServer] {
            let sql = "SELECT 'abc";
            let blanked = blank_string_literals(sql, rules(dialect));
            assert_eq!(blanked, "SELECT '   ");
            assert_eq!(blanked.chars().count(), sql.chars().count());
        }
        let sql = r"SELECT 'abc\'";
        assert_eq!(blank_string_literals(sql, rules(Dialect::MySql)).chars().count(), sql.chars().count());
    }

    #[test]
    fn test_backslash_ends_literal_outside_mysql() {
        let sql = r"SELECT 'a\', pg_read_file('/etc/passwd') AS x --'";

        // Standard SQL: the literal is 'a\' and the rest is live code
        for dialect in [Dialect::PostgreSql, Dialect::Sqlite, Dialect::SqlServer] {
            let stripped = strip_comments(sql, rules(dialect));
            assert_eq!(stripped.trim_end(), r"SELECT 'a\', pg_read_file('/etc/passwd') AS x");
            assert!(blank_string_literals(&stripped, rules(dialect)).contains("pg_read_file("));
        }

        // MySQL: the backslash escapes the quote, so everything is one literal
        let blanked = blank_string_literals(sql, rules(Dialect::MySql));
        assert!(!blanked.contains("pg_read_file"));
    }

    #[test]
    fn test_postgres_escape_strings() {
        let pg = rules(Dialect::PostgreSql);
        let blanked = blank_string_literals(r"SELECT E'it\'s', 'x\' AS drop_me", pg);
        assert_eq!(blanked, "SELECT E'     ', '  ' AS drop_me");
        assert!(has_inner_terminator(r"SELECT 'a\'; DELETE FROM t", pg));
        assert!(!has_inner_terminator(r"SELECT E'a\'; DELETE FROM t'", pg));
    }

    #[test]
    fn test_is_single_read() {
        let pg = rules(Dialect::PostgreSql);
        assert!(is_single_read("select 1", pg));
        assert!(is_single_read("WITH x AS (SELECT 1) SELECT * FROM x", pg));
        assert!(is_single_read("SELECT ';' AS semi", pg));
        assert!(!is_single_read("SELECTED", pg));
        assert!(!is_single_read("SELECT 1; DELETE FROM t", pg));
        assert!(!is_single_read("VALUES (1)", pg));
    }

    #[test]
    fn test_sanitize_and_terminators() {
        let pg = rules(Dialect::PostgreSql);
        assert_eq!(sanitize("  SELECT 1;;  -- done\n", pg), "SELECT 1");
        assert!(has_inner_terminator("SELECT 1; DROP TABLE t", pg));
        assert!(!has_inner_terminator("SELECT ';' FROM t", pg));
    }

    #[test]
    fn test_find_top_level_keyword() {
        let sql = "WITH x AS (SELECT 1) SELECT * FROM x";
        assert_eq!(find_top_level_keyword(sql, "select"), Some(21));
        assert_eq!(find_top_level_keyword("SELECT selected FROM t", "select"), Some(0));
        assert_eq!(find_top_level_keyword("SELECT 'select'", "from"), None);
    }

    #[test]
    fn test_enforce_trailing_limit() {
        assert_eq!(enforce_trailing_limit("SELECT * FROM t", 100), "SELECT * FROM t LIMIT 100");
        assert_eq!(enforce_trailing_limit("SELECT * FROM t LIMIT 5", 100), "SELECT * FROM t LIMIT 5");
        assert_eq!(enforce_trailing_limit("SELECT * FROM t LIMIT 500", 100), "SELECT * FROM t LIMIT 100");
        assert_eq!(
            enforce_trailing_limit("SELECT * FROM t LIMIT 500 OFFSET 20", 100),
            "SELECT * FROM t LIMIT 100 OFFSET 20"
        );
        assert_eq!(enforce_trailing_limit("SELECT * FROM t LIMIT 10, 500", 100), "SELECT * FROM t LIMIT 10, 100");
        assert_eq!(enforce_trailing_limit("SELECT * FROM t LIMIT ALL", 100), "SELECT * FROM t LIMIT 100");
        assert_eq!(
            enforce_trailing_limit("SELECT * FROM (SELECT * FROM t LIMIT 5) s", 100),
            "SELECT * FROM (SELECT * FROM t LIMIT 5) s LIMIT 100"
        );
    }

    #[test]
    fn test_enforce_trailing_limit_is_idempotent() {
        for sql in [
            "SELECT * FROM t",
            "SELECT * FROM t LIMIT 3",
            "SELECT * FROM t LIMIT 9000 OFFSET 1",
            "SELECT * FROM t LIMIT 2, 9000",
        ] {
            let once = enforce_trailing_limit(sql, 50);
            assert_eq!(enforce_trailing_limit(&once, 50), once);
        }
    }
}
