//! Lazy, paged search over file records.
//!
//! Each page is a keyset query (`path > last_seen ORDER BY path LIMIT n`) in
//! its own read transaction, so a long iteration never holds the connection
//! between pages and never sees a record twice.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::VecDeque;

use super::records::{normalize_keyword, SearchCriteria, FileRecord, TIMESTAMP_FORMAT};
use super::{file_from_row, load_links, Repository, FILE_COLUMNS};
use crate::error::StoreResult;
use crate::tasks::CancelFlag;

pub struct SearchCursor<'r> {
    repo: &'r Repository,
    criteria: SearchCriteria,
    page_size: usize,
    last_path: Option<String>,
    buffer: VecDeque<FileRecord>,
    exhausted: bool,
    cancel: Option<CancelFlag>,
}

impl<'r> SearchCursor<'r> {
    pub(crate) fn new(repo: &'r Repository, criteria: SearchCriteria, page_size: usize) -> Self {
        Self {
            repo,
            criteria,
            page_size: page_size.max(1),
            last_path: None,
            buffer: VecDeque::new(),
            exhausted: false,
            cancel: None,
        }
    }

    /// Stop at the next page boundary once `flag` is raised.
    pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn criteria(&self) -> &SearchCriteria {
        &self.criteria
    }

    /// Start over from the first record with the same criteria.
    pub fn restart(&mut self) {
        self.last_path = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|flag| flag.is_cancelled())
    }

    fn fetch_next_page(&mut self) -> StoreResult<()> {
        let page = self
            .repo
            .read(|conn| fetch_page(conn, &self.criteria, self.last_path.as_deref(), self.page_size))?;
        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.last_path = Some(last.path.clone());
        }
        tracing::trace!(records = page.len(), "Fetched search page");
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for SearchCursor<'_> {
    type Item = StoreResult<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_cancelled() {
            if !self.exhausted {
                tracing::debug!("Search cancelled");
            }
            self.buffer.clear();
            self.exhausted = true;
            return None;
        }
        if let Some(record) = self.buffer.pop_front() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }
        if let Err(e) = self.fetch_next_page() {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Escape LIKE wildcards; pairs with `ESCAPE '\'`.
fn like_pattern(text: &str) -> String {
    let mut pattern = String::from("%");
    for c in text.to_lowercase().chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

pub(crate) fn fetch_page(
    conn: &Connection,
    criteria: &SearchCriteria,
    after: Option<&str>,
    limit: usize,
) -> StoreResult<Vec<FileRecord>> {
    let mut sql = format!("SELECT {} FROM files f WHERE 1 = 1", FILE_COLUMNS);
    let mut args: Vec<Value> = Vec::new();

    if let Some(after) = after {
        sql.push_str(" AND f.path > ?");
        args.push(Value::Text(after.to_string()));
    }
    if let Some(min) = criteria.rating_min {
        sql.push_str(" AND f.rating >= ?");
        args.push(Value::Integer(min.into()));
    }
    if let Some(max) = criteria.rating_max {
        sql.push_str(" AND f.rating <= ?");
        args.push(Value::Integer(max.into()));
    }
    if let Some(from) = criteria.taken_from {
        sql.push_str(" AND f.taken_at >= ?");
        args.push(Value::Text(from.format(TIMESTAMP_FORMAT).to_string()));
    }
    if let Some(to) = criteria.taken_to {
        sql.push_str(" AND f.taken_at <= ?");
        args.push(Value::Text(to.format(TIMESTAMP_FORMAT).to_string()));
    }
    if let Some(text) = criteria.text.as_deref().filter(|t| !t.trim().is_empty()) {
        sql.push_str(
            " AND (LOWER(COALESCE(f.title, '')) LIKE ? ESCAPE '\\' \
             OR LOWER(COALESCE(f.description, '')) LIKE ? ESCAPE '\\')",
        );
        let pattern = like_pattern(text.trim());
        args.push(Value::Text(pattern.clone()));
        args.push(Value::Text(pattern));
    }
    for keyword in criteria.keywords.iter().filter_map(|k| normalize_keyword(k)) {
        sql.push_str(
            " AND EXISTS (SELECT 1 FROM file_keywords fk JOIN keywords k ON k.id = fk.keyword_id \
             WHERE fk.file_id = f.id AND k.name = ?)",
        );
        args.push(Value::Text(keyword));
    }
    sql.push_str(" ORDER BY f.path LIMIT ?");
    args.push(Value::Integer(limit as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), file_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::with_capacity(rows.len());
    for (file_id, mut record) in rows {
        load_links(conn, file_id, &mut record)?;
        records.push(record);
    }
    Ok(records)
}
