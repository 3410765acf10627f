//! SQL text built from validated codec field names
//!
//! Only identifiers are interpolated. Every value travels as a bind
//! parameter, in the order the placeholders appear.

use crate::error::{StoreError, StoreResult};
use regex::Regex;
use std::sync::LazyLock;

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("Invalid identifier regex")
});

/// Validate a table or column name and return it backtick-quoted
pub fn quote_identifier(name: &str) -> StoreResult<String> {
    if IDENTIFIER_REGEX.is_match(name) {
        Ok(format!("`{}`", name))
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Column layout of one table
#[derive(Debug, Clone)]
pub struct TableLayout {
    table: String,
    keys: Vec<String>,
    values: Vec<String>,
    status: Option<String>,
}

impl TableLayout {
    /// Validate every name up front
    pub fn new(
        table: &str,
        keys: &[&str],
        values: &[&str],
        status: Option<&str>,
    ) -> StoreResult<Self> {
        if keys.is_empty() {
            return Err(StoreError::InvalidIdentifier(format!(
                "{} (no key fields)",
                table
            )));
        }
        quote_identifier(table)?;
        for name in keys.iter().chain(values).chain(status.iter()) {
            quote_identifier(name)?;
        }
        Ok(Self {
            table: table.to_string(),
            keys: keys.iter().map(|s| s.to_string()).collect(),
            values: values.iter().map(|s| s.to_string()).collect(),
            status: status.map(str::to_string),
        })
    }

    /// Unquoted table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Key column names
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Value column names
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Status column name, for queue tables
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    fn quoted(name: &str) -> String {
        format!("`{}`", name)
    }

    fn table_quoted(&self) -> String {
        Self::quoted(&self.table)
    }

    fn columns(&self) -> Vec<&String> {
        self.keys
            .iter()
            .chain(&self.values)
            .chain(self.status.iter())
            .collect()
    }

    fn column_list(&self) -> String {
        self.columns()
            .into_iter()
            .map(|c| Self::quoted(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn key_predicate(&self) -> String {
        self.keys
            .iter()
            .map(|k| format!("{} = ?", Self::quoted(k)))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn status_quoted(&self) -> StoreResult<String> {
        self.status
            .as_deref()
            .map(Self::quoted)
            .ok_or_else(|| StoreError::InvalidIdentifier(format!("{} (no status column)", self.table)))
    }

    /// One row by key. Binds: keys.
    pub fn select_by_key(&self, for_update: bool) -> String {
        format!(
            "SELECT {} FROM {} WHERE {}{}",
            self.column_list(),
            self.table_quoted(),
            self.key_predicate(),
            if for_update { " FOR UPDATE" } else { "" }
        )
    }

    /// Insert a full row. Binds: keys, values, status.
    pub fn insert(&self) -> String {
        let columns = self.columns();
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table_quoted(),
            self.column_list(),
            placeholders
        )
    }

    /// Overwrite value columns (and status when present). Binds: values,
    /// status, keys.
    pub fn update_by_key(&self) -> String {
        let assignments: Vec<String> = self
            .values
            .iter()
            .chain(self.status.iter())
            .map(|c| format!("{} = ?", Self::quoted(c)))
            .collect();
        if assignments.is_empty() {
            // Key-only rows have nothing to overwrite
            return format!(
                "UPDATE {} SET {} = {} WHERE {}",
                self.table_quoted(),
                Self::quoted(&self.keys[0]),
                Self::quoted(&self.keys[0]),
                self.key_predicate()
            );
        }
        format!(
            "UPDATE {} SET {} WHERE {}",
            self.table_quoted(),
            assignments.join(", "),
            self.key_predicate()
        )
    }

    /// Insert or overwrite without reading first. Binds: keys, values.
    pub fn upsert(&self) -> String {
        let columns: Vec<&String> = self.keys.iter().chain(&self.values).collect();
        let list = columns
            .iter()
            .map(|c| Self::quoted(c))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; columns.len()].join(", ");
        if self.values.is_empty() {
            return format!(
                "INSERT IGNORE INTO {} ({}) VALUES ({})",
                self.table_quoted(),
                list,
                placeholders
            );
        }
        let updates = self
            .values
            .iter()
            .map(|c| format!("{0} = VALUES({0})", Self::quoted(c)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            self.table_quoted(),
            list,
            placeholders,
            updates
        )
    }

    /// Delete one row by key. Binds: keys.
    pub fn delete_by_key(&self) -> String {
        format!(
            "DELETE FROM {} WHERE {}",
            self.table_quoted(),
            self.key_predicate()
        )
    }

    /// Delete one row by key if it has a given status. Binds: keys, status.
    pub fn delete_by_key_with_status(&self) -> StoreResult<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {} AND {} = ?",
            self.table_quoted(),
            self.key_predicate(),
            self.status_quoted()?
        ))
    }

    /// Claim candidate. Binds: status.
    pub fn select_first_with_status(&self, for_update: bool) -> StoreResult<String> {
        Ok(format!(
            "SELECT {} FROM {} WHERE {} = ? LIMIT 1{}",
            self.column_list(),
            self.table_quoted(),
            self.status_quoted()?,
            if for_update { " FOR UPDATE" } else { "" }
        ))
    }

    /// Status transition guarded by the current status. Binds: new status,
    /// keys, expected status.
    pub fn transition(&self) -> StoreResult<String> {
        let status = self.status_quoted()?;
        Ok(format!(
            "UPDATE {} SET {} = ? WHERE {} AND {} = ?",
            self.table_quoted(),
            status,
            self.key_predicate(),
            status
        ))
    }

    /// Page through rows with a status. Binds: status, offset.
    pub fn select_nth_with_status(&self) -> StoreResult<String> {
        Ok(format!(
            "SELECT {} FROM {} WHERE {} = ? LIMIT ?, 1",
            self.column_list(),
            self.table_quoted(),
            self.status_quoted()?
        ))
    }

    /// Count rows by key with a status. Binds: keys, status.
    pub fn count_by_key_with_status(&self) -> StoreResult<String> {
        Ok(format!(
            "SELECT COUNT(*) FROM {} WHERE {} AND {} = ?",
            self.table_quoted(),
            self.key_predicate(),
            self.status_quoted()?
        ))
    }

    /// Count rows by key. Binds: keys.
    pub fn count_by_key(&self) -> String {
        format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            self.table_quoted(),
            self.key_predicate()
        )
    }

    /// Count rows with a status. Binds: status.
    pub fn count_with_status(&self) -> StoreResult<String> {
        Ok(format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ?",
            self.table_quoted(),
            self.status_quoted()?
        ))
    }

    /// Count every row
    pub fn count_all(&self) -> String {
        format!("SELECT COUNT(*) FROM {}", self.table_quoted())
    }

    /// Delete rows with a status. Binds: status.
    pub fn delete_with_status(&self) -> StoreResult<String> {
        Ok(format!(
            "DELETE FROM {} WHERE {} = ?",
            self.table_quoted(),
            self.status_quoted()?
        ))
    }

    /// Delete every row
    pub fn delete_all(&self) -> String {
        format!("DELETE FROM {}", self.table_quoted())
    }

    /// Table bootstrap
    pub fn create_table(&self) -> String {
        let mut defs: Vec<String> = Vec::new();
        for key in &self.keys {
            defs.push(format!("{} VARCHAR(512) NOT NULL", Self::quoted(key)));
        }
        for value in &self.values {
            defs.push(format!("{} TEXT NULL", Self::quoted(value)));
        }
        if let Some(status) = &self.status {
            defs.push(format!("{} VARCHAR(16) NOT NULL", Self::quoted(status)));
        }
        let keys = self
            .keys
            .iter()
            .map(|k| Self::quoted(k))
            .collect::<Vec<_>>()
            .join(", ");
        defs.push(format!("PRIMARY KEY ({})", keys));
        if let Some(status) = &self.status {
            defs.push(format!("INDEX `status_idx` ({})", Self::quoted(status)));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table_quoted(),
            defs.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_layout() -> TableLayout {
        TableLayout::new("files", &["path"], &["doc_id"], Some("status")).unwrap()
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("files").unwrap(), "`files`");
        assert_eq!(quote_identifier("_x9").unwrap(), "`_x9`");
        assert!(quote_identifier("9lives").is_err());
        assert!(quote_identifier("files`; DROP TABLE x; --").is_err());
        assert!(quote_identifier(&"a".repeat(65)).is_err());
        assert!(quote_identifier("").is_err());
    }

    #[test]
    fn test_layout_rejects_bad_column() {
        assert!(TableLayout::new("files", &["pa th"], &[], None).is_err());
        assert!(TableLayout::new("files", &[], &["v"], None).is_err());
    }

    #[test]
    fn test_queue_statements() {
        let layout = queue_layout();
        assert_eq!(
            layout.select_by_key(true),
            "SELECT `path`, `doc_id`, `status` FROM `files` WHERE `path` = ? FOR UPDATE"
        );
        assert_eq!(
            layout.insert(),
            "INSERT INTO `files` (`path`, `doc_id`, `status`) VALUES (?, ?, ?)"
        );
        assert_eq!(
            layout.update_by_key(),
            "UPDATE `files` SET `doc_id` = ?, `status` = ? WHERE `path` = ?"
        );
        assert_eq!(
            layout.select_first_with_status(true).unwrap(),
            "SELECT `path`, `doc_id`, `status` FROM `files` WHERE `status` = ? LIMIT 1 FOR UPDATE"
        );
        assert_eq!(
            layout.transition().unwrap(),
            "UPDATE `files` SET `status` = ? WHERE `path` = ? AND `status` = ?"
        );
        assert_eq!(
            layout.select_nth_with_status().unwrap(),
            "SELECT `path`, `doc_id`, `status` FROM `files` WHERE `status` = ? LIMIT ?, 1"
        );
    }

    #[test]
    fn test_map_statements() {
        let layout =
            TableLayout::new("reports", &["path"], &["extraction_status", "error"], None).unwrap();
        assert_eq!(
            layout.upsert(),
            "INSERT INTO `reports` (`path`, `extraction_status`, `error`) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE `extraction_status` = VALUES(`extraction_status`), \
             `error` = VALUES(`error`)"
        );
        assert!(layout.transition().is_err());
        assert_eq!(layout.delete_by_key(), "DELETE FROM `reports` WHERE `path` = ?");
    }

    #[test]
    fn test_composite_key_predicate() {
        let layout = TableLayout::new("t", &["a", "b"], &[], None).unwrap();
        assert_eq!(layout.count_by_key(), "SELECT COUNT(*) FROM `t` WHERE `a` = ? AND `b` = ?");
        assert!(layout.upsert().starts_with("INSERT IGNORE INTO `t`"));
    }

    #[test]
    fn test_create_table() {
        let sql = queue_layout().create_table();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `files` ("));
        assert!(sql.contains("`path` VARCHAR(512) NOT NULL"));
        assert!(sql.contains("`doc_id` TEXT NULL"));
        assert!(sql.contains("PRIMARY KEY (`path`)"));
        assert!(sql.contains("INDEX `status_idx` (`status`)"));
    }
}
