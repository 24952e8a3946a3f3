// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Lightweight table name extraction from sql text
//!
//! This is a token scanner, not a parser. It collects the identifiers
//! following FROM and JOIN, which covers the select shapes the server
//! accepts. An explicit table list on the request always wins over it.

/// Extract the distinct table names referenced by `sql`, in first-seen
/// order.
pub fn table_names(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    let mut tokens = tokenize(sql).into_iter().peekable();

    while let Some(token) = tokens.next() {
        if token.eq_ignore_ascii_case("from") || token.eq_ignore_ascii_case("join") {
            // Skip subqueries, `from (select ...`.
            while let Some(next) = tokens.peek() {
                if next == "(" {
                    break;
                }

                let table = unquote(next);
                if !table.is_empty() && !tables.contains(&table) {
                    tables.push(table);
                }
                tokens.next();

                // `from a, b` keeps collecting, anything else stops.
                match tokens.peek().map(String::as_str) {
                    Some(",") => {
                        tokens.next();
                    }
                    _ => break,
                }
            }
        }
    }

    tables
}

fn tokenize(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in sql.chars() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                '(' | ')' | ',' | ';' => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    tokens.push(ch.to_string());
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn unquote(token: &str) -> String {
    token
        .trim_matches(|c| c == '`' || c == '"')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::table_names;

    #[test]
    fn test_simple_select() {
        assert_eq!(
            table_names("SELECT * FROM machine_table WHERE city = 'Beijing'"),
            vec!["machine_table"]
        );
    }

    #[test]
    fn test_join_and_comma_list() {
        assert_eq!(
            table_names("select a.ts from t1 join t2 on t1.id = t2.id"),
            vec!["t1", "t2"]
        );
        assert_eq!(table_names("select * from t1, t2"), vec!["t1", "t2"]);
    }

    #[test]
    fn test_quoted_and_duplicate() {
        assert_eq!(
            table_names("select * from `machine_table` join machine_table"),
            vec!["machine_table"]
        );
    }

    #[test]
    fn test_subquery_skipped() {
        assert_eq!(
            table_names("select * from (select * from inner_t) where x > 0"),
            vec!["inner_t"]
        );
    }

    #[test]
    fn test_keyword_in_string_ignored() {
        assert_eq!(
            table_names("select * from t where msg = 'from nowhere'"),
            vec!["t"]
        );
    }
}
