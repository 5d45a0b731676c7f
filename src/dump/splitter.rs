//! Split `pg_dump` output into complete statements.
//!
//! The scan is line based: blank lines and full-line `--` comments are
//! dropped, and a line starts a new statement only when the previous one
//! ended with `;` outside of any dollar-quoted body.

use regex::Regex;
use std::sync::LazyLock;

/// `$$` or `$tag$`, where the tag is identifier-like (any Unicode letter or `_`
/// first, then letters, digits or `_`).
static DOLLAR_QUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:[\p{L}_][\p{L}\p{N}_]*)?\$").expect("valid regex"));

/// One complete SQL command taken from a dump. Every line keeps its
/// trailing newline so statements concatenate back into a valid script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DumpStatement {
    text: String,
    multi_line: bool,
}

impl DumpStatement {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_multi_line(&self) -> bool {
        self.multi_line
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.text.contains(needle)
    }
}

impl From<&str> for DumpStatement {
    fn from(text: &str) -> Self {
        let text = if text.ends_with('\n') {
            text.to_string()
        } else {
            format!("{text}\n")
        };
        let multi_line = text.trim_end_matches('\n').contains('\n');
        DumpStatement { text, multi_line }
    }
}

/// Incremental splitter; feed it lines, then take the statements.
#[derive(Debug, Default)]
pub struct StatementSplitter {
    statements: Vec<DumpStatement>,
    terminated: bool,
    open_tag: Option<String>,
}

impl StatementSplitter {
    pub fn new() -> Self {
        StatementSplitter {
            statements: Vec::new(),
            terminated: true,
            open_tag: None,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with("--") {
            return;
        }

        match self.statements.last_mut() {
            Some(current) if !self.terminated => {
                current.text.push_str(line);
                current.text.push('\n');
                current.multi_line = true;
            }
            _ => self.statements.push(DumpStatement {
                text: format!("{line}\n"),
                multi_line: false,
            }),
        }

        self.track_dollar_quotes(line);
        self.terminated = self.open_tag.is_none() && line.trim_end().ends_with(';');
    }

    /// Whether the scan is currently inside a `$tag$ ... $tag$` body.
    pub fn in_dollar_quote(&self) -> bool {
        self.open_tag.is_some()
    }

    /// Finish the scan. An unterminated trailing statement is returned as is.
    pub fn finish(self) -> Vec<DumpStatement> {
        self.statements
    }

    fn track_dollar_quotes(&mut self, line: &str) {
        for token in DOLLAR_QUOTE.find_iter(line) {
            let tag = token.as_str();
            match &self.open_tag {
                None => self.open_tag = Some(tag.to_string()),
                Some(open) if open == tag => self.open_tag = None,
                // a different tag nested inside the open body is just text
                Some(_) => {}
            }
        }
    }
}

/// Split a whole dump into its statements.
pub fn split_statements(dump: &str) -> Vec<DumpStatement> {
    let mut splitter = StatementSplitter::new();
    for line in dump.lines() {
        splitter.push_line(line);
    }
    splitter.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(statements: &[DumpStatement]) -> Vec<&str> {
        statements.iter().map(DumpStatement::text).collect()
    }

    #[test]
    fn skips_blank_lines_and_comments() {
        let dump = "--\n-- PostgreSQL database dump\n--\n\nSET statement_timeout = 0;\n\n   -- indented comment\nSELECT 1;\n";
        let statements = split_statements(dump);
        assert_eq!(
            texts(&statements),
            vec!["SET statement_timeout = 0;\n", "SELECT 1;\n"]
        );
        assert!(statements.iter().all(|s| !s.is_multi_line()));
    }

    #[test]
    fn joins_multi_line_statements() {
        let dump = "CREATE TABLE public.users (\n    id bigint NOT NULL,\n    email text\n);\nALTER TABLE public.users OWNER TO owner;\n";
        let statements = split_statements(dump);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].is_multi_line());
        assert_eq!(
            statements[0].text(),
            "CREATE TABLE public.users (\n    id bigint NOT NULL,\n    email text\n);\n"
        );
    }

    #[test]
    fn semicolon_inside_single_line_dollar_body_is_not_a_boundary() {
        let dump = "CREATE FUNCTION f() RETURNS void AS $body$ BEGIN x := 1; END; $body$ LANGUAGE plpgsql;\n";
        let statements = split_statements(dump);
        assert_eq!(statements.len(), 1);
    }

    #[test]
    fn semicolons_inside_multi_line_dollar_body_are_not_boundaries() {
        let dump = "\
CREATE FUNCTION public.touch() RETURNS trigger
    LANGUAGE plpgsql
    AS $_$
BEGIN
    NEW.updated_at := now();
    RETURN NEW;
END;
$_$;
CREATE TABLE public.t (id integer);
";
        let statements = split_statements(dump);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].text().ends_with("$_$;\n"));
        assert_eq!(statements[1].text(), "CREATE TABLE public.t (id integer);\n");
    }

    #[test]
    fn only_the_matching_tag_closes_the_body() {
        let dump = "\
CREATE FUNCTION public.outer() RETURNS text AS $outer$
    SELECT $$inner;$$;
$outer$ LANGUAGE sql;
SELECT 2;
";
        let statements = split_statements(dump);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].text(), "SELECT 2;\n");
    }

    #[test]
    fn positional_parameters_are_not_dollar_quotes() {
        let dump = "CREATE FUNCTION add(integer, integer) RETURNS integer AS 'select $1 + $2;' LANGUAGE sql;\nSELECT 3;\n";
        assert_eq!(split_statements(dump).len(), 2);
    }

    #[test]
    fn unicode_tags_are_tracked() {
        let dump = "DO $ключ$\nBEGIN\n  PERFORM 1;\nEND\n$ключ$;\nSELECT 4;\n";
        let statements = split_statements(dump);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[1].text(), "SELECT 4;\n");
    }

    #[test]
    fn unterminated_tail_is_kept() {
        let mut splitter = StatementSplitter::new();
        splitter.push_line("SELECT 1;");
        splitter.push_line("CREATE FUNCTION broken() AS $$");
        splitter.push_line("BEGIN;");
        assert!(splitter.in_dollar_quote());
        let statements = splitter.finish();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[1].text(),
            "CREATE FUNCTION broken() AS $$\nBEGIN;\n"
        );
    }

    #[test]
    fn resplitting_joined_statements_is_stable() {
        let dump = "\
SET client_encoding = 'UTF8';
CREATE FUNCTION public.f() RETURNS void AS $$
BEGIN
  PERFORM 1;
END;
$$ LANGUAGE plpgsql;
CREATE TABLE public.parent (
    code text
);
ALTER TABLE ONLY public.parent ADD CONSTRAINT parent_pkey PRIMARY KEY (code);
";
        let first = split_statements(dump);
        let joined: String = first.iter().map(DumpStatement::text).collect();
        assert_eq!(split_statements(&joined), first);
    }

    #[test]
    fn from_str_marks_multi_line() {
        assert!(!DumpStatement::from("SELECT 1;").is_multi_line());
        assert!(DumpStatement::from("SELECT\n1;\n").is_multi_line());
        assert_eq!(DumpStatement::from("SELECT 1;").text(), "SELECT 1;\n");
    }
}
