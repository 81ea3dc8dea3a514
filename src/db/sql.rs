//! Static SQL text and its shape.
//!
//! Statements enter the crate only as [`Sql`], which wraps a `&'static str`.
//! Text assembled at runtime (for example by `format!` around user input)
//! is not `'static` and cannot become an `Sql`, so every runtime value has
//! to travel as a bound parameter.
//!
//! [`Sql::analyze`] tokenizes the text with the backend's `sqlparser` dialect
//! to classify the statement and count its placeholders. Placeholders inside
//! string literals and comments are not counted.

use crate::error::{DbError, DbResult};
use crate::models::Backend;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeSet;
use std::fmt;

/// A SQL statement known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sql(&'static str);

impl Sql {
    pub const fn new(text: &'static str) -> Self {
        Self(text)
    }

    pub const fn as_str(&self) -> &'static str {
        self.0
    }

    /// Classify the statement and count its placeholders.
    pub fn analyze(&self, backend: Backend) -> DbResult<SqlShape> {
        let dialect = backend.dialect();
        let tokens = Tokenizer::new(dialect.as_ref(), self.0)
            .tokenize()
            .map_err(|e| DbError::invalid_input(format!("Failed to tokenize [{self}]: {e}")))?;

        let mut kind = None;
        let mut placeholders = Placeholders::default();
        let mut terminated = false;

        for token in &tokens {
            match token {
                Token::Whitespace(_) | Token::EOF => {}
                Token::SemiColon => terminated = true,
                _ if terminated => {
                    return Err(DbError::invalid_input(format!(
                        "Multiple statements are not supported: [{self}]"
                    )));
                }
                Token::LParen if kind.is_none() => {}
                Token::Placeholder(name) => placeholders.record(name),
                Token::Word(word) if kind.is_none() => {
                    kind = Some(StatementKind::from_keyword(word.keyword));
                }
                _ => {
                    kind.get_or_insert(StatementKind::Other);
                }
            }
        }

        let kind = kind.ok_or_else(|| DbError::invalid_input("SQL statement is empty"))?;
        Ok(SqlShape {
            kind,
            placeholders: placeholders.count(self)?,
        })
    }
}

impl From<&'static str> for Sql {
    fn from(text: &'static str) -> Self {
        Self(text)
    }
}

/// Single-line rendering for logs and error messages.
impl fmt::Display for Sql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.split_whitespace().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(part)?;
        }
        Ok(())
    }
}

/// What a statement does, judged by its leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Select,
    /// `INSERT` and `REPLACE`
    Insert,
    Update,
    Delete,
    Ddl,
    Other,
}

impl StatementKind {
    fn from_keyword(keyword: Keyword) -> Self {
        match keyword {
            Keyword::SELECT | Keyword::WITH | Keyword::VALUES => Self::Select,
            Keyword::INSERT | Keyword::REPLACE => Self::Insert,
            Keyword::UPDATE => Self::Update,
            Keyword::DELETE => Self::Delete,
            Keyword::CREATE | Keyword::ALTER | Keyword::DROP | Keyword::TRUNCATE => Self::Ddl,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Ddl => "DDL",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Result of [`Sql::analyze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlShape {
    pub kind: StatementKind,
    /// Number of values the statement expects.
    pub placeholders: usize,
}

impl SqlShape {
    /// Fail with `ParameterCount` unless exactly one value is supplied per placeholder.
    pub fn check_params(&self, sql: Sql, supplied: usize) -> DbResult<()> {
        if self.placeholders == supplied {
            Ok(())
        } else {
            Err(DbError::parameter_count(sql, self.placeholders, supplied))
        }
    }
}

#[derive(Default)]
struct Placeholders {
    anonymous: usize,
    highest_numbered: usize,
    named: BTreeSet<String>,
}

impl Placeholders {
    fn record(&mut self, token: &str) {
        let digits = token.trim_start_matches(['?', '$']);
        if token == "?" {
            self.anonymous += 1;
        } else if let Ok(n) = digits.parse::<usize>() {
            self.highest_numbered = self.highest_numbered.max(n);
        } else {
            self.named.insert(token.to_string());
        }
    }

    fn count(&self, sql: &Sql) -> DbResult<usize> {
        let styles = [
            self.anonymous > 0,
            self.highest_numbered > 0,
            !self.named.is_empty(),
        ];
        if styles.iter().filter(|used| **used).count() > 1 {
            return Err(DbError::invalid_input(format!(
                "Statement mixes placeholder styles: [{sql}]"
            )));
        }
        Ok(self.anonymous + self.highest_numbered + self.named.len())
    }
}
