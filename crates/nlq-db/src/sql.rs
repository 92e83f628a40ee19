//! Statement text handling: completion sanitizing and read/write routing.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static FENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)```(?:sql)?").expect("fence pattern is valid")
});

static WHITESPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

static DATABASE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_$]{1,64}$").expect("identifier pattern is valid"));

const FENCE: &str = "```";

/// A single SQL statement produced from a raw completion.
///
/// The only way to build one is [`CandidateStatement::sanitize`], so the text never
/// holds a code fence and its whitespace is always collapsed to single spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CandidateStatement(String);

impl CandidateStatement {
    /// Strips markdown code fences (optionally tagged `sql`) and normalises whitespace.
    ///
    /// Total over all inputs; an empty completion yields an empty statement.
    pub fn sanitize(raw: &str) -> Self {
        let mut text = raw.trim().to_owned();
        // Removing one fence can splice two backtick runs into a new one.
        while text.contains(FENCE) {
            text = FENCE_REGEX.replace_all(&text, "").replace(FENCE, "");
        }
        let collapsed = WHITESPACE_REGEX.replace_all(&text, " ");
        Self(collapsed.trim().to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn kind(&self) -> StatementKind {
        classify(self)
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CandidateStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CandidateStatement {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Coarse routing decision: fetch a result set or report an effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Read,
    Write,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Read => "read",
            StatementKind::Write => "write",
        }
    }
}

/// Classifies by the leading keyword only: `SELECT` (any case) reads, everything else
/// writes. Statements opening with a CTE (`WITH ...`) therefore route as writes.
pub fn classify(statement: &CandidateStatement) -> StatementKind {
    let keyword: String = statement
        .as_str()
        .trim_start()
        .chars()
        .take_while(|ch| ch.is_ascii_alphabetic())
        .collect();

    if keyword.eq_ignore_ascii_case("SELECT") {
        StatementKind::Read
    } else {
        StatementKind::Write
    }
}

/// Database names are interpolated into DDL during provisioning, so only plain
/// unquoted MySQL identifiers are accepted.
pub fn is_valid_database_name(name: &str) -> bool {
    DATABASE_NAME_REGEX.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(raw: &str) -> CandidateStatement {
        CandidateStatement::sanitize(raw)
    }

    #[test]
    fn strips_tagged_fence() {
        let statement = candidate("```sql\nSELECT * FROM customers;\n```");
        assert_eq!(statement.as_str(), "SELECT * FROM customers;");
    }

    #[test]
    fn strips_untagged_and_uppercase_fences() {
        assert_eq!(candidate("```\nDELETE FROM t\n```").as_str(), "DELETE FROM t");
        assert_eq!(candidate("```SQL select 1 ```").as_str(), "select 1");
    }

    #[test]
    fn collapses_whitespace_runs() {
        let statement = candidate("  SELECT id,\n\t name\n\nFROM   users  ");
        assert_eq!(statement.as_str(), "SELECT id, name FROM users");
    }

    #[test]
    fn removes_fences_in_the_middle_of_text() {
        let statement = candidate("Here you go: ```sql SELECT 1``` done");
        assert_eq!(statement.as_str(), "Here you go: SELECT 1 done");
        assert!(!statement.as_str().contains(FENCE));
    }

    #[test]
    fn spliced_backticks_never_survive() {
        for raw in ["`` ```sql` x", "``````", "`````sql`", "a`` ```` `b", "``\n```\n`"] {
            let statement = candidate(raw);
            assert!(
                !statement.as_str().contains(FENCE),
                "fence survived for {raw:?}: {statement:?}"
            );
        }
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "",
            "   ",
            "```sql\nSELECT * FROM customers;\n```",
            "``````sql",
            "SELECT\u{00a0}1",
            "```\n  UPDATE t\n SET x = 1\n```\n",
            "text ``` with `` odd ```` backticks",
        ];
        for raw in inputs {
            let once = candidate(raw);
            let twice = candidate(once.as_str());
            assert_eq!(once, twice, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn empty_completion_is_an_empty_statement() {
        assert!(candidate("```sql\n```").is_empty());
        assert!(candidate("").is_empty());
    }

    #[test]
    fn classify_reads_and_writes() {
        assert_eq!(classify(&candidate(" select 1")), StatementKind::Read);
        assert_eq!(classify(&candidate("SELECT * FROM t")), StatementKind::Read);
        assert_eq!(classify(&candidate("SeLeCt*FROM t")), StatementKind::Read);
        assert_eq!(classify(&candidate("update t set x=1")), StatementKind::Write);
        assert_eq!(classify(&candidate("INSERT INTO t VALUES (1)")), StatementKind::Write);
        assert_eq!(classify(&candidate("SELECTED")), StatementKind::Write);
        assert_eq!(classify(&candidate("")), StatementKind::Write);
    }

    #[test]
    fn cte_statements_route_as_writes() {
        let statement = candidate("WITH c AS (SELECT 1) SELECT * FROM c");
        assert_eq!(statement.kind(), StatementKind::Write);
    }

    #[test]
    fn database_name_validation() {
        assert!(is_valid_database_name("shop"));
        assert!(is_valid_database_name("shop_2024$"));
        assert!(!is_valid_database_name(""));
        assert!(!is_valid_database_name("shop; DROP DATABASE x"));
        assert!(!is_valid_database_name("with`tick"));
        assert!(!is_valid_database_name(&"a".repeat(65)));
    }
}
