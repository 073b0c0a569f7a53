//! Query model and naive evaluation.
//!
//! Datastores only have to produce a raw, unordered stream of entries. The
//! prefix, filters, orders, offset and limit of a `Query` are applied on the
//! consumer side by `QueryResults`, so every backend gets the same semantics
//! without implementing them itself.

use std::cmp::Ordering;
use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::error::QueryError;
use crate::key::Key;

/// One key returned by a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    /// `None` for keys-only queries.
    pub value: Option<Bytes>,
    pub size: u64,
}

pub type QueryResult = Result<Entry, QueryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Equal => ordering == Ordering::Equal,
            CompareOp::NotEqual => ordering != Ordering::Equal,
            CompareOp::GreaterThan => ordering == Ordering::Greater,
            CompareOp::GreaterThanOrEqual => ordering != Ordering::Less,
            CompareOp::LessThan => ordering == Ordering::Less,
            CompareOp::LessThanOrEqual => ordering != Ordering::Greater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Plain string prefix on the key, no path semantics.
    KeyPrefix(String),
    KeyCompare { op: CompareOp, key: Key },
    /// Byte comparison against the value. Entries without a value compare
    /// as empty.
    ValueCompare { op: CompareOp, value: Bytes },
}

impl Filter {
    pub fn matches(&self, entry: &Entry) -> bool {
        match self {
            Filter::KeyPrefix(prefix) => entry.key.as_str().starts_with(prefix.as_str()),
            Filter::KeyCompare { op, key } => op.holds(entry.key.cmp(key)),
            Filter::ValueCompare { op, value } => {
                let actual: &[u8] = entry.value.as_deref().unwrap_or(&[]);
                op.holds(actual.cmp(value.as_ref()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    ByKey,
    ByKeyDescending,
    ByValue,
    ByValueDescending,
}

impl Order {
    pub fn compare(self, a: &Entry, b: &Entry) -> Ordering {
        fn value(e: &Entry) -> &[u8] {
            e.value.as_deref().unwrap_or(&[])
        }
        match self {
            Order::ByKey => a.key.cmp(&b.key),
            Order::ByKeyDescending => b.key.cmp(&a.key),
            Order::ByValue => value(a).cmp(&value(b)),
            Order::ByValueDescending => value(b).cmp(&value(a)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Path prefix; `/a` matches `/a/b` but not `/ab`. Empty matches all.
    pub prefix: String,
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    /// Maximum number of entries, 0 for no limit.
    ///
    /// Only successful entries count toward `limit` and `offset`; per-entry
    /// errors are always yielded. See "Offset/limit and errors" in DESIGN.md.
    pub limit: usize,
    pub offset: usize,
    /// Skip fetching values.
    pub keys_only: bool,
}

impl Query {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Default::default()
        }
    }

    pub fn keys_only(mut self) -> Self {
        self.keys_only = true;
        self
    }

    /// String every matching key starts with, or `None` when the prefix
    /// selects the whole keyspace. Backends may push this down into their
    /// listing call.
    pub fn listing_prefix(&self) -> Option<String> {
        if self.prefix.is_empty() {
            return None;
        }
        let cleaned = clean_path(&self.prefix);
        if cleaned == "/" {
            None
        } else {
            Some(format!("{}/", cleaned))
        }
    }

    fn matches(&self, prefix: Option<&str>, entry: &Entry) -> bool {
        if let Some(prefix) = prefix {
            if !entry.key.as_str().starts_with(prefix) {
                return false;
            }
        }
        self.filters.iter().all(|f| f.matches(entry))
    }

    fn compare(&self, a: &Entry, b: &Entry) -> Ordering {
        self.orders
            .iter()
            .map(|o| o.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

/// Lexically clean a slash path: collapse repeated separators, drop `.`
/// segments and resolve `..` against the preceding segment. The result is
/// always rooted.
fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Lazily evaluated query results.
///
/// Entries are received from a producer over a channel; the query's
/// prefix, filters, orders, offset and limit are applied as they are pulled.
/// Dropping the results cancels the producer. Once the producer's token is
/// cancelled no further results are yielded, buffered ones included.
pub struct QueryResults {
    query: Query,
    prefix: Option<String>,
    rx: mpsc::Receiver<QueryResult>,
    sorted: Option<VecDeque<QueryResult>>,
    skipped: usize,
    returned: usize,
    cancel: Option<CancellationToken>,
    _guard: Option<DropGuard>,
}

impl QueryResults {
    pub fn new(
        query: Query,
        rx: mpsc::Receiver<QueryResult>,
        cancel: Option<CancellationToken>,
    ) -> Self {
        let prefix = query.listing_prefix();
        let guard = cancel.as_ref().map(|token| token.clone().drop_guard());
        Self {
            query,
            prefix,
            rx,
            sorted: None,
            skipped: 0,
            returned: 0,
            cancel,
            _guard: guard,
        }
    }

    /// Results over an already materialised set of entries.
    pub fn from_entries(query: Query, entries: Vec<Entry>) -> Self {
        let (tx, rx) = mpsc::channel(entries.len().max(1));
        for entry in entries {
            // Capacity covers every entry.
            let _ = tx.try_send(Ok(entry));
        }
        Self::new(query, rx, None)
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Next matching entry, or `None` once the stream is exhausted or the
    /// limit is reached.
    pub async fn next(&mut self) -> Option<QueryResult> {
        loop {
            if self.query.limit != 0 && self.returned >= self.query.limit {
                return None;
            }
            let item = if self.query.orders.is_empty() {
                self.next_matching().await?
            } else {
                self.next_ordered().await?
            };
            match item {
                Ok(entry) => {
                    if self.skipped < self.query.offset {
                        self.skipped += 1;
                        continue;
                    }
                    self.returned += 1;
                    return Some(Ok(entry));
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Collect every remaining entry, failing on the first error.
    pub async fn rest(mut self) -> Result<Vec<Entry>, QueryError> {
        let mut entries = Vec::new();
        while let Some(result) = self.next().await {
            entries.push(result?);
        }
        Ok(entries)
    }

    /// Next raw result from the producer, or `None` once it is done or the
    /// query has been cancelled.
    async fn recv(&mut self) -> Option<QueryResult> {
        let Some(cancel) = &self.cancel else {
            return self.rx.recv().await;
        };
        if cancel.is_cancelled() {
            self.rx.close();
            return None;
        }
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            item = self.rx.recv() => Some(item),
        };
        if received.is_none() {
            self.rx.close();
        }
        received.flatten()
    }

    async fn next_matching(&mut self) -> Option<QueryResult> {
        loop {
            match self.recv().await? {
                Ok(entry) => {
                    if self.query.matches(self.prefix.as_deref(), &entry) {
                        return Some(Ok(entry));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    async fn next_ordered(&mut self) -> Option<QueryResult> {
        if self.sorted.is_none() {
            let mut entries = Vec::new();
            while let Some(item) = self.next_matching().await {
                match item {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        // An error ends an ordered query.
                        self.sorted = Some(VecDeque::new());
                        self.rx.close();
                        return Some(Err(e));
                    }
                }
            }
            entries.sort_by(|a, b| self.query.compare(a, b));
            self.sorted = Some(entries.into_iter().map(Ok).collect());
        }
        self.sorted.as_mut()?.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatastoreError;

    fn entry(key: &str, value: &str) -> Entry {
        Entry {
            key: Key::new(key),
            value: Some(Bytes::from(value.to_string())),
            size: value.len() as u64,
        }
    }

    fn keys(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.key.as_str()).collect()
    }

    #[test]
    fn test_listing_prefix() {
        assert_eq!(Query::default().listing_prefix(), None);
        assert_eq!(Query::with_prefix("/").listing_prefix(), None);
        assert_eq!(Query::with_prefix("/a/").listing_prefix().as_deref(), Some("/a/"));
        assert_eq!(Query::with_prefix("a").listing_prefix().as_deref(), Some("/a/"));
        assert_eq!(Query::with_prefix("/a//b/../c/.").listing_prefix().as_deref(), Some("/a/c/"));
    }

    #[tokio::test]
    async fn test_prefix_is_path_based() {
        let entries = vec![entry("/bar/baz", "1"), entry("/barbaz", "2"), entry("/bar", "3")];
        let got = QueryResults::from_entries(Query::with_prefix("/bar"), entries)
            .rest()
            .await
            .unwrap();
        assert_eq!(keys(&got), vec!["/bar/baz"]);
    }

    #[tokio::test]
    async fn test_filters_order_offset_limit() {
        let entries = vec![
            entry("/k/d", "4"),
            entry("/k/a", "1"),
            entry("/k/c", "3"),
            entry("/k/b", "2"),
            entry("/k/e", "5"),
        ];
        let query = Query {
            prefix: "/k".to_string(),
            filters: vec![Filter::ValueCompare {
                op: CompareOp::GreaterThan,
                value: Bytes::from("1"),
            }],
            orders: vec![Order::ByKeyDescending],
            offset: 1,
            limit: 2,
            ..Default::default()
        };
        let got = QueryResults::from_entries(query, entries).rest().await.unwrap();
        assert_eq!(keys(&got), vec!["/k/d", "/k/c"]);
    }

    #[tokio::test]
    async fn test_key_filters() {
        let entries = vec![entry("/a", ""), entry("/b", ""), entry("/c", "")];
        let query = Query {
            filters: vec![
                Filter::KeyCompare {
                    op: CompareOp::GreaterThanOrEqual,
                    key: Key::new("/b"),
                },
                Filter::KeyPrefix("/c".to_string()),
            ],
            ..Default::default()
        };
        let got = QueryResults::from_entries(query, entries).rest().await.unwrap();
        assert_eq!(keys(&got), vec!["/c"]);
    }

    #[tokio::test]
    async fn test_errors_pass_through_unordered() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(entry("/a", "x"))).await.unwrap();
        tx.send(Err(QueryError::Fetch {
            key: Key::new("/b"),
            source: DatastoreError::NotFound,
        }))
        .await
        .unwrap();
        tx.send(Ok(entry("/c", "y"))).await.unwrap();
        drop(tx);

        let mut results = QueryResults::new(Query::default(), rx, None);
        assert!(results.next().await.unwrap().is_ok());
        let err = results.next().await.unwrap().unwrap_err();
        assert_eq!(err.key(), Some(&Key::new("/b")));
        assert!(results.next().await.unwrap().is_ok());
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_ends_ordered_query() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(entry("/a", "x"))).await.unwrap();
        tx.send(Err(QueryError::Listing(DatastoreError::NotFound)))
            .await
            .unwrap();
        drop(tx);

        let query = Query {
            orders: vec![Order::ByKey],
            ..Default::default()
        };
        let mut results = QueryResults::new(query, rx, None);
        assert!(results.next().await.unwrap().is_err());
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn test_errors_do_not_use_up_limit() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Err(QueryError::Fetch {
            key: Key::new("/a"),
            source: DatastoreError::NotFound,
        }))
        .await
        .unwrap();
        tx.send(Ok(entry("/b", "x"))).await.unwrap();
        tx.send(Ok(entry("/c", "y"))).await.unwrap();
        drop(tx);

        let query = Query {
            limit: 1,
            ..Default::default()
        };
        let mut results = QueryResults::new(query, rx, None);
        assert!(results.next().await.unwrap().is_err());
        assert_eq!(results.next().await.unwrap().unwrap().key, Key::new("/b"));
        assert!(results.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_discards_buffered_results() {
        let (tx, rx) = mpsc::channel(8);
        for key in ["/a", "/b", "/c"] {
            tx.send(Ok(entry(key, "x"))).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let mut results = QueryResults::new(Query::default(), rx, Some(cancel.clone()));
        assert!(results.next().await.unwrap().is_ok());
        cancel.cancel();
        assert!(results.next().await.is_none());
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn test_dropping_results_cancels_token() {
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let results = QueryResults::new(Query::default(), rx, Some(cancel.clone()));
        assert!(!cancel.is_cancelled());
        drop(results);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_order_by_value() {
        let entries = vec![entry("/a", "b"), entry("/b", "a"), entry("/c", "c")];
        let query = Query {
            orders: vec![Order::ByValue],
            ..Default::default()
        };
        let got = QueryResults::from_entries(query, entries).rest().await.unwrap();
        assert_eq!(keys(&got), vec!["/b", "/a", "/c"]);
    }
}
