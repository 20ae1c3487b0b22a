//! Parser for typed query documents.
//!
//! Accepts the subset of GraphQL query syntax that the metric schema needs:
//!
//! ```text
//! query Revenue {
//!   monthly: revenue(grain: "month", start_date: "2024-01-01") { period revenue region }
//!   orders(grain: day) { period orders }
//! }
//! ```
//!
//! Commas are insignificant and `#` starts a comment running to the end of the
//! line. Argument values are strings or bare names.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub operation_name: Option<String>,
    pub selections: Vec<FieldSelection>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelection {
    pub alias: Option<String>,
    pub name: String,
    pub arguments: Vec<(String, String)>,
    pub sub_fields: Vec<String>,
}

impl FieldSelection {
    /// Key of this field in the response.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Unexpected end of query, expected {expected}")]
    UnexpectedEnd { expected: &'static str },

    #[error("Unexpected {found} at offset {offset}, expected {expected}")]
    Unexpected {
        found: String,
        expected: &'static str,
        offset: usize,
    },

    #[error("Unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },

    #[error("Invalid escape sequence at offset {offset}")]
    InvalidEscape { offset: usize },

    #[error("Unexpected character '{ch}' at offset {offset}")]
    InvalidCharacter { ch: char, offset: usize },

    #[error("Field {field} needs a selection of sub-fields")]
    MissingSelection { field: String },

    #[error("Argument {argument} given twice on field {field}")]
    DuplicateArgument { field: String, argument: String },

    #[error("Fields named {key} conflict, give one of them an alias")]
    ConflictingFields { key: String },

    #[error("Query selects no fields")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    Name(String),
    Str(String),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Colon => "':'".to_string(),
            Token::Name(name) => format!("name '{}'", name),
            Token::Str(_) => "string".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, DocumentError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some((offset, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() || c == ',' || c == '\u{feff}' => {}
            '#' => {
                while let Some((_, c)) = chars.peek() {
                    if *c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '{' => tokens.push((Token::LBrace, offset)),
            '}' => tokens.push((Token::RBrace, offset)),
            '(' => tokens.push((Token::LParen, offset)),
            ')' => tokens.push((Token::RParen, offset)),
            ':' => tokens.push((Token::Colon, offset)),
            '"' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        None => return Err(DocumentError::UnterminatedString { offset }),
                        Some((_, '"')) => break,
                        Some((escape_at, '\\')) => match chars.next() {
                            Some((_, '"')) => value.push('"'),
                            Some((_, '\\')) => value.push('\\'),
                            Some((_, '/')) => value.push('/'),
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, 'r')) => value.push('\r'),
                            _ => return Err(DocumentError::InvalidEscape { offset: escape_at }),
                        },
                        Some((_, '\n')) => return Err(DocumentError::UnterminatedString { offset }),
                        Some((_, c)) => value.push(c),
                    }
                }
                tokens.push((Token::Str(value), offset));
            }
            c if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::from(c);
                while let Some((_, c)) = chars.peek() {
                    if *c == '_' || c.is_ascii_alphanumeric() {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Name(name), offset));
            }
            // Numeric literals are read as bare values, e.g. `start_date: 20240101`.
            c if c.is_ascii_digit() || c == '-' => {
                let mut number = String::from(c);
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '-' || *c == '.' {
                        number.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Name(number), offset));
            }
            ch => return Err(DocumentError::InvalidCharacter { ch, offset }),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(t, _)| t)
    }

    fn next(&mut self, expected: &'static str) -> Result<(Token, usize), DocumentError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(DocumentError::UnexpectedEnd { expected })?;
        self.position += 1;
        Ok(token)
    }

    fn expect(&mut self, wanted: Token, expected: &'static str) -> Result<(), DocumentError> {
        let (token, offset) = self.next(expected)?;
        if token == wanted {
            Ok(())
        } else {
            Err(DocumentError::Unexpected {
                found: token.describe(),
                expected,
                offset,
            })
        }
    }

    fn name(&mut self, expected: &'static str) -> Result<String, DocumentError> {
        match self.next(expected)? {
            (Token::Name(name), _) => Ok(name),
            (token, offset) => Err(DocumentError::Unexpected {
                found: token.describe(),
                expected,
                offset,
            }),
        }
    }

    fn document(&mut self) -> Result<Document, DocumentError> {
        let mut operation_name = None;
        if let Some(Token::Name(keyword)) = self.peek() {
            if keyword != "query" {
                let (token, offset) = self.next("'query' or '{'")?;
                return Err(DocumentError::Unexpected {
                    found: token.describe(),
                    expected: "'query' or '{'",
                    offset,
                });
            }
            self.position += 1;
            if let Some(Token::Name(_)) = self.peek() {
                operation_name = Some(self.name("operation name")?);
            }
        }

        self.expect(Token::LBrace, "'{'")?;
        let mut selections = Vec::new();
        while self.peek() != Some(&Token::RBrace) {
            merge_selection(&mut selections, self.field()?)?;
        }
        self.expect(Token::RBrace, "'}'")?;

        if let Some((token, offset)) = self.tokens.get(self.position) {
            return Err(DocumentError::Unexpected {
                found: token.describe(),
                expected: "end of query",
                offset: *offset,
            });
        }
        if selections.is_empty() {
            return Err(DocumentError::Empty);
        }
        Ok(Document {
            operation_name,
            selections,
        })
    }

    fn field(&mut self) -> Result<FieldSelection, DocumentError> {
        let first = self.name("field name")?;
        let (alias, name) = if self.peek() == Some(&Token::Colon) {
            self.position += 1;
            (Some(first), self.name("field name after alias")?)
        } else {
            (None, first)
        };

        let mut arguments: Vec<(String, String)> = Vec::new();
        if self.peek() == Some(&Token::LParen) {
            self.position += 1;
            while self.peek() != Some(&Token::RParen) {
                let argument = self.name("argument name")?;
                self.expect(Token::Colon, "':'")?;
                let value = match self.next("argument value")? {
                    (Token::Str(value), _) | (Token::Name(value), _) => value,
                    (token, offset) => {
                        return Err(DocumentError::Unexpected {
                            found: token.describe(),
                            expected: "argument value",
                            offset,
                        })
                    }
                };
                if arguments.iter().any(|(n, _)| *n == argument) {
                    return Err(DocumentError::DuplicateArgument {
                        field: name,
                        argument,
                    });
                }
                arguments.push((argument, value));
            }
            self.expect(Token::RParen, "')'")?;
        }

        if self.peek() != Some(&Token::LBrace) {
            return Err(DocumentError::MissingSelection { field: name });
        }
        self.position += 1;
        let mut sub_fields = Vec::new();
        while self.peek() != Some(&Token::RBrace) {
            sub_fields.push(self.name("sub-field name or '}'")?);
        }
        self.expect(Token::RBrace, "'}'")?;
        if sub_fields.is_empty() {
            return Err(DocumentError::MissingSelection { field: name });
        }

        Ok(FieldSelection {
            alias,
            name,
            arguments,
            sub_fields,
        })
    }
}

/// Adds `selection` under its response key. A repeat of the same field with
/// the same arguments only adds its sub-fields; anything else would answer two
/// different questions under one key.
fn merge_selection(
    selections: &mut Vec<FieldSelection>,
    selection: FieldSelection,
) -> Result<(), DocumentError> {
    let Some(index) = selections
        .iter()
        .position(|s| s.response_key() == selection.response_key())
    else {
        selections.push(selection);
        return Ok(());
    };
    let existing = &mut selections[index];

    let same_arguments = existing.arguments.len() == selection.arguments.len()
        && selection
            .arguments
            .iter()
            .all(|argument| existing.arguments.contains(argument));
    if existing.name != selection.name || !same_arguments {
        return Err(DocumentError::ConflictingFields {
            key: selection.response_key().to_string(),
        });
    }
    for sub_field in selection.sub_fields {
        if !existing.sub_fields.contains(&sub_field) {
            existing.sub_fields.push(sub_field);
        }
    }
    Ok(())
}

pub fn parse_document(source: &str) -> Result<Document, DocumentError> {
    let tokens = tokenize(source)?;
    Parser {
        tokens,
        position: 0,
    }
    .document()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_anonymous_query() {
        let document = parse_document(r#"{ revenue(grain: "month") { period revenue region } }"#).unwrap();
        assert_eq!(document.operation_name, None);
        assert_eq!(
            document.selections,
            vec![FieldSelection {
                alias: None,
                name: "revenue".to_string(),
                arguments: vec![("grain".to_string(), "month".to_string())],
                sub_fields: vec!["period".to_string(), "revenue".to_string(), "region".to_string()],
            }]
        );
    }

    #[test]
    fn parses_named_query_with_aliases_commas_and_comments() {
        let source = r#"
            query Dashboard {
              # monthly revenue by region
              monthly: revenue(grain: "month", start_date: "2024-01-01",) { period, revenue, region }
              orders(grain: day end_date: 2024-12-31) { period orders }
            }
        "#;
        let document = parse_document(source).unwrap();
        assert_eq!(document.operation_name.as_deref(), Some("Dashboard"));
        assert_eq!(document.selections.len(), 2);

        let monthly = &document.selections[0];
        assert_eq!(monthly.response_key(), "monthly");
        assert_eq!(monthly.name, "revenue");
        assert_eq!(monthly.argument("start_date"), Some("2024-01-01"));

        let orders = &document.selections[1];
        assert_eq!(orders.response_key(), "orders");
        assert_eq!(orders.argument("grain"), Some("day"));
        assert_eq!(orders.argument("end_date"), Some("2024-12-31"));
    }

    #[test]
    fn decodes_string_escapes() {
        let document = parse_document(r#"{ m(grain: "a\"b\\c") { m } }"#).unwrap();
        assert_eq!(document.selections[0].argument("grain"), Some("a\"b\\c"));
    }

    #[rstest]
    #[case("", DocumentError::UnexpectedEnd { expected: "'{'" })]
    #[case("{ }", DocumentError::Empty)]
    #[case("{ revenue(grain: \"month\") }", DocumentError::MissingSelection { field: "revenue".to_string() })]
    #[case("{ revenue { } }", DocumentError::MissingSelection { field: "revenue".to_string() })]
    #[case("{ revenue(grain: \"month) { period } }", DocumentError::UnterminatedString { offset: 17 })]
    #[case("{ m(grain: \"a\\q\") { m } }", DocumentError::InvalidEscape { offset: 13 })]
    #[case("{ m { period } } extra", DocumentError::Unexpected { found: "name 'extra'".to_string(), expected: "end of query", offset: 17 })]
    #[case("mutation { m { m } }", DocumentError::Unexpected { found: "name 'mutation'".to_string(), expected: "'query' or '{'", offset: 0 })]
    #[case("{ m $x }", DocumentError::InvalidCharacter { ch: '$', offset: 4 })]
    fn reports_syntax_errors(#[case] source: &str, #[case] expected: DocumentError) {
        assert_eq!(parse_document(source).unwrap_err(), expected);
    }

    #[test]
    fn rejects_nested_selections() {
        let err = parse_document("{ m(grain: day) { period { x } } }").unwrap_err();
        assert!(matches!(err, DocumentError::Unexpected { expected: "sub-field name or '}'", .. }));
    }

    #[rstest]
    #[case("{ revenue(grain: day) { revenue } revenue(grain: month) { period } }", "revenue")]
    #[case("{ x: revenue(grain: day) { revenue } x: orders(grain: day) { orders } }", "x")]
    #[case("{ orders(grain: day) { orders } orders: revenue(grain: day) { revenue } }", "orders")]
    fn rejects_conflicting_response_keys(#[case] source: &str, #[case] key: &str) {
        assert_eq!(
            parse_document(source).unwrap_err(),
            DocumentError::ConflictingFields { key: key.to_string() }
        );
    }

    #[test]
    fn merges_repeated_identical_fields() {
        let document = parse_document(
            r#"{ revenue(grain: day, start_date: "2024-01-01") { period revenue } revenue(start_date: "2024-01-01", grain: day) { revenue region } }"#,
        )
        .unwrap();
        assert_eq!(document.selections.len(), 1);
        assert_eq!(document.selections[0].sub_fields, vec!["period", "revenue", "region"]);
    }

    #[test]
    fn rejects_duplicate_arguments() {
        let err = parse_document("{ m(grain: day, grain: month) { m } }").unwrap_err();
        assert_eq!(
            err,
            DocumentError::DuplicateArgument {
                field: "m".to_string(),
                argument: "grain".to_string()
            }
        );
    }
}
