//! Tokenizer for `@connection[.schema].table` references
//!
//! A byte scanner, not a regex: references inside string literals, line
//! comments and block comments must be ignored, and spans must be exact
//! so the planner can substitute either placeholders (federated) or
//! native identifiers (push-down).

use serde::{Deserialize, Serialize};

/// One parsed multi-query reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiQueryRef {
    /// Connection name, matched case-sensitively
    pub connection: String,
    /// Explicit schema, when the reference carries one
    pub schema: Option<String>,
    pub table: String,
    /// Trailing alias when one follows the reference
    pub alias: Option<String>,
    /// Byte span of the `@...` token in the original SQL
    pub span: (usize, usize),
    /// Identifier substituted for the span in the rewritten SQL
    pub placeholder: String,
}

/// Parse outcome: the rewritten SQL plus the ordered reference list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiQueryParse {
    pub rewritten: String,
    pub refs: Vec<MultiQueryRef>,
}

fn is_ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn is_ident_continue(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

/// Read one identifier starting at `pos`, returning (ident, next_pos)
fn read_ident(bytes: &[u8], pos: usize) -> Option<(String, usize)> {
    if pos >= bytes.len() || !is_ident_start(bytes[pos]) {
        return None;
    }
    let mut end = pos + 1;
    while end < bytes.len() && is_ident_continue(bytes[end]) {
        end += 1;
    }
    Some((String::from_utf8_lossy(&bytes[pos..end]).into_owned(), end))
}

/// Words that terminate a reference instead of naming an alias
fn is_reserved(word: &str) -> bool {
    matches!(
        word.to_uppercase().as_str(),
        "JOIN" | "INNER" | "LEFT" | "RIGHT" | "FULL" | "CROSS" | "OUTER" | "ON" | "USING"
            | "WHERE" | "GROUP" | "ORDER" | "HAVING" | "LIMIT" | "OFFSET" | "UNION" | "EXCEPT"
            | "INTERSECT" | "AS" | "AND" | "OR" | "NOT" | "SET" | "VALUES" | "SELECT" | "FROM"
    )
}

/// Tokenize `@conn[.schema].table [alias]` references in otherwise
/// ordinary SQL.
///
/// The rewritten SQL names each referenced table `__sqlhub_ref_<n>`,
/// aliased back to its original table name when the query supplied no
/// alias of its own, so column qualifiers keep resolving.
pub fn parse_multi_query(sql: &str) -> MultiQueryParse {
    let bytes = sql.as_bytes();
    let mut rewritten = String::with_capacity(sql.len());
    let mut refs: Vec<MultiQueryRef> = Vec::new();

    let mut i = 0;
    let mut in_string = false;
    let mut string_char = b'\'';
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while i < bytes.len() {
        let byte = bytes[i];
        let next = bytes.get(i + 1).copied();

        if in_line_comment {
            rewritten.push(byte as char);
            if byte == b'\n' {
                in_line_comment = false;
            }
            i += 1;
            continue;
        }
        if in_block_comment {
            rewritten.push(byte as char);
            if byte == b'*' && next == Some(b'/') {
                rewritten.push('/');
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if in_string {
            rewritten.push(byte as char);
            if byte == string_char {
                if next == Some(string_char) {
                    rewritten.push(string_char as char);
                    i += 2;
                    continue;
                }
                in_string = false;
            }
            i += 1;
            continue;
        }

        if byte == b'-' && next == Some(b'-') {
            in_line_comment = true;
            rewritten.push('-');
            i += 1;
            continue;
        }
        if byte == b'/' && next == Some(b'*') {
            in_block_comment = true;
            rewritten.push('/');
            i += 1;
            continue;
        }
        if byte == b'\'' || byte == b'"' {
            in_string = true;
            string_char = byte;
            rewritten.push(byte as char);
            i += 1;
            continue;
        }

        if byte == b'@' {
            // `@` inside a word (an email literal, a variable) is not a
            // reference.
            let preceded_by_word = i > 0 && is_ident_continue(bytes[i - 1]);
            if !preceded_by_word
                && let Some(parsed) = try_parse_ref(bytes, i, refs.len())
            {
                let (mut reference, end) = parsed;
                match &reference.alias {
                    // The span swallowed the alias; re-emit it after the
                    // placeholder so the rewritten SQL keeps it.
                    Some(alias) => {
                        rewritten.push_str(&format!("{} {}", reference.placeholder, alias));
                    }
                    // Alias back to the original table name so column
                    // qualifiers keep resolving.
                    None => {
                        rewritten.push_str(&format!(
                            "{} AS {}",
                            reference.placeholder, reference.table
                        ));
                    }
                }
                reference.span = (i, end);
                refs.push(reference);
                i = end;
                continue;
            }
        }

        // Copy non-ASCII sequences through untouched.
        if byte < 0x80 {
            rewritten.push(byte as char);
            i += 1;
        } else {
            let ch_len = utf8_len(byte);
            let end = (i + ch_len).min(bytes.len());
            rewritten.push_str(&String::from_utf8_lossy(&bytes[i..end]));
            i = end;
        }
    }

    MultiQueryParse { rewritten, refs }
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        b if b >= 0xC0 => 2,
        _ => 1,
    }
}

/// Parse the reference starting at the `@`; returns the ref (span filled
/// by the caller) and the byte offset just past it.
fn try_parse_ref(bytes: &[u8], at: usize, index: usize) -> Option<(MultiQueryRef, usize)> {
    let (first, mut pos) = read_ident(bytes, at + 1)?;

    let mut parts = vec![first];
    while parts.len() < 3 && pos < bytes.len() && bytes[pos] == b'.' {
        let Some((ident, next)) = read_ident(bytes, pos + 1) else {
            break;
        };
        parts.push(ident);
        pos = next;
    }

    // A bare `@name` names only a connection; the grammar needs a table.
    if parts.len() < 2 {
        return None;
    }

    let (connection, schema, table) = match parts.len() {
        2 => (parts[0].clone(), None, parts[1].clone()),
        _ => (parts[0].clone(), Some(parts[1].clone()), parts[2].clone()),
    };

    // Optional trailing alias: whitespace then a non-reserved identifier.
    let mut alias = None;
    let mut lookahead = pos;
    while lookahead < bytes.len() && (bytes[lookahead] == b' ' || bytes[lookahead] == b'\t') {
        lookahead += 1;
    }
    if let Some((word, after)) = read_ident(bytes, lookahead)
        && !is_reserved(&word)
    {
        alias = Some(word);
        pos = after;
    }

    Some((
        MultiQueryRef {
            connection,
            schema,
            table,
            alias,
            span: (at, pos),
            placeholder: format!("__sqlhub_ref_{}", index),
        },
        pos,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_two_part_reference() {
        let parse = parse_multi_query("SELECT * FROM @prod.users");
        assert_eq!(parse.refs.len(), 1);
        let r = &parse.refs[0];
        assert_eq!(r.connection, "prod");
        assert_eq!(r.schema, None);
        assert_eq!(r.table, "users");
        assert_eq!(r.alias, None);
        assert_eq!(parse.rewritten, "SELECT * FROM __sqlhub_ref_0 AS users");
    }

    #[test]
    fn test_three_part_reference_with_alias() {
        let parse = parse_multi_query("SELECT u.id FROM @prod.public.users u");
        let r = &parse.refs[0];
        assert_eq!(r.schema.as_deref(), Some("public"));
        assert_eq!(r.table, "users");
        assert_eq!(r.alias.as_deref(), Some("u"));
        assert_eq!(parse.rewritten, "SELECT u.id FROM __sqlhub_ref_0 u");
    }

    #[test]
    fn test_join_across_connections() {
        let sql = "SELECT u.name, count(*) FROM @prod.users u \
                   JOIN @analytics.events e ON e.user_id = u.id GROUP BY u.name";
        let parse = parse_multi_query(sql);
        assert_eq!(parse.refs.len(), 2);
        assert_eq!(parse.refs[0].connection, "prod");
        assert_eq!(parse.refs[1].connection, "analytics");
        assert!(parse.rewritten.contains("__sqlhub_ref_0 u"));
        assert!(parse.rewritten.contains("__sqlhub_ref_1 e"));
    }

    #[test]
    fn test_reserved_word_is_not_an_alias() {
        let parse = parse_multi_query("SELECT * FROM @prod.users WHERE id = 1");
        assert_eq!(parse.refs[0].alias, None);
        assert!(parse.rewritten.contains("__sqlhub_ref_0 AS users WHERE"));
    }

    #[test]
    fn test_references_in_strings_are_ignored() {
        let sql = "SELECT '@prod.users' AS t FROM @real.users";
        let parse = parse_multi_query(sql);
        assert_eq!(parse.refs.len(), 1);
        assert_eq!(parse.refs[0].connection, "real");
        assert!(parse.rewritten.contains("'@prod.users'"));
    }

    #[test]
    fn test_references_in_comments_are_ignored() {
        let sql = "SELECT 1 -- from @ghost.users\nFROM @prod.users /* @other.t */";
        let parse = parse_multi_query(sql);
        assert_eq!(parse.refs.len(), 1);
        assert_eq!(parse.refs[0].connection, "prod");
    }

    #[test]
    fn test_email_like_text_is_not_a_reference() {
        let parse = parse_multi_query("SELECT * FROM @prod.users WHERE note = alice@corp.example");
        assert_eq!(parse.refs.len(), 1);
        assert_eq!(parse.refs[0].connection, "prod");
    }

    #[test]
    fn test_bare_connection_is_not_a_reference() {
        let parse = parse_multi_query("SELECT @prod FROM t");
        assert!(parse.refs.is_empty());
        assert_eq!(parse.rewritten, "SELECT @prod FROM t");
    }

    #[test]
    fn test_spans_cover_the_token() {
        let sql = "SELECT * FROM @prod.users u";
        let parse = parse_multi_query(sql);
        let (start, end) = parse.refs[0].span;
        assert_eq!(&sql[start..end], "@prod.users u");
    }

    #[test]
    fn test_hyphenated_connection_names() {
        let parse = parse_multi_query("SELECT * FROM @prod-replica.users");
        assert_eq!(parse.refs[0].connection, "prod-replica");
    }
}
