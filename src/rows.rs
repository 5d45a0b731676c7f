// Rows fetched through the simple query protocol, where every value is text.

use crate::error::Result;
use postgres::{GenericClient, SimpleQueryMessage};
use serde::Serialize;

/// One result row with its column names. Values are the server's text
/// rendering; SQL NULL is `None`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TextRow {
    pub columns: Vec<String>,
    pub values: Vec<Option<String>>,
}

impl TextRow {
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Self {
        TextRow { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values[i].as_deref())
    }

    /// Drop every column whose name mentions a connection string or secret.
    pub fn without_credentials(self) -> TextRow {
        let (columns, values) = self
            .columns
            .into_iter()
            .zip(self.values)
            .filter(|(c, _)| {
                let c = c.to_lowercase();
                !(c.contains("dsn") || c.contains("password") || c.contains("conninfo"))
            })
            .unzip();
        TextRow { columns, values }
    }
}

/// Run `sql` with the simple query protocol and collect its rows.
pub fn query_text<C: GenericClient>(client: &mut C, sql: &str) -> Result<Vec<TextRow>> {
    let mut rows = Vec::new();
    for message in client.simple_query(sql)? {
        if let SimpleQueryMessage::Row(row) = message {
            let columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            let values = (0..row.len())
                .map(|i| row.get(i).map(str::to_string))
                .collect();
            rows.push(TextRow { columns, values });
        }
    }
    Ok(rows)
}
