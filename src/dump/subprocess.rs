// Running the Postgres client tools (pg_dump, pg_restore, psql).

use crate::error::{CutoverError, Result};
use regex::Regex;
use std::process::{Command, Stdio};
use std::sync::LazyLock;
use tracing::debug;

static PASSWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"password=(?:'(?:[^'\\]|\\.)*'|\S+)").expect("valid regex")
});

/// Output of a tool run that exited successfully.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Command line as shown in logs and errors, with passwords masked.
pub fn display_command(program: &str, args: &[String]) -> String {
    let line = std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ");
    PASSWORD.replace_all(&line, "password=***").into_owned()
}

/// Run `program` to completion. A nonzero exit is a [`CutoverError::Subprocess`]
/// carrying the tool's stderr verbatim.
pub fn run(program: &str, args: &[String]) -> Result<ToolOutput> {
    let command = display_command(program, args);
    debug!("Running `{command}`");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()?;
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(CutoverError::Subprocess {
            command,
            code: output.status.code(),
            stderr,
        });
    }
    Ok(ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr,
    })
}

/// `pg_dump --schema-only` of one schema, returned as text.
pub fn dump_schema(dsn: &str, schema: &str) -> Result<String> {
    let args = vec![
        "--schema-only".to_string(),
        "--no-owner".to_string(),
        format!("--schema={schema}"),
        format!("--dbname={dsn}"),
    ];
    Ok(run("pg_dump", &args)?.stdout)
}

/// Data-only custom-format dump of one table into `file`.
pub fn dump_table_data(dsn: &str, qualified_table: &str, file: &str) -> Result<()> {
    let args = vec![
        "--data-only".to_string(),
        "--format=custom".to_string(),
        format!("--table={qualified_table}"),
        format!("--file={file}"),
        format!("--dbname={dsn}"),
    ];
    run("pg_dump", &args)?;
    Ok(())
}

pub fn restore_table_data(dsn: &str, file: &str) -> Result<()> {
    let args = vec![
        "--data-only".to_string(),
        "--no-owner".to_string(),
        format!("--dbname={dsn}"),
        file.to_string(),
    ];
    run("pg_restore", &args)?;
    Ok(())
}

/// Apply a SQL script with psql. Statement errors are reported on stderr but
/// do not fail the run, so a partially applied script can be replayed.
pub fn apply_script(dsn: &str, file: &str) -> Result<ToolOutput> {
    let args = vec![
        "--no-psqlrc".to_string(),
        "--quiet".to_string(),
        format!("--dbname={dsn}"),
        format!("--file={file}"),
    ];
    run("psql", &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_passwords_in_displayed_command() {
        let args = vec![
            "--dbname=hostaddr=10.0.0.1 user=owner password='s3 cret' dbname=orders".to_string(),
            "--dbname=user=root password=plain".to_string(),
        ];
        let shown = display_command("pg_dump", &args);
        assert!(!shown.contains("s3 cret"));
        assert!(!shown.contains("plain"));
        assert!(shown.contains("password=*** dbname=orders"));
    }

    #[test]
    fn nonzero_exit_keeps_stderr() {
        let err = run(
            "sh",
            &["-c".to_string(), "echo 'relation exists' >&2; exit 3".to_string()],
        )
        .unwrap_err();
        match err {
            CutoverError::Subprocess { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "relation exists\n");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn successful_run_captures_stdout() {
        let out = run("sh", &["-c".to_string(), "printf hello".to_string()]).unwrap();
        assert_eq!(out.stdout, "hello");
    }
}
