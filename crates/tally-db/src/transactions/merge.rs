//! # K-Way Merge
//!
//! Interleaves child sources into one feed ordered by
//! `(created_at_millis DESC, id DESC)`.
//!
//! ## Merge Step
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  cursor ["a7", "", "c2"] ──► one page from each matching child         │
//! │                              (fetched concurrently)                     │
//! │                                                                         │
//! │   child 0: [t=90 a6] [t=40 a5] ...                                     │
//! │   child 1: [t=70 b9] ...                                               │
//! │   child 2: [t=95 c1] ...                                               │
//! │                                                                         │
//! │  repeat `limit` times: pop the newest head, advance that child's       │
//! │  cursor ──► c1, a6, b9, a5, ...                                        │
//! │                                                                         │
//! │  cursor out ["a5", "b9", "c1"]                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each child is asked for at most `limit` items, so the merge never holds
//! more than `children × limit` transactions at once.

use futures_util::future::{try_join_all, BoxFuture};
use std::collections::VecDeque;
use std::sync::Arc;
use tally_core::{Transaction, TransactionType};

use super::{source_matches, Page, PageItem, PageQuery, TransactionSource};
use crate::error::{DbError, PaymentsResult};

/// A source built from child sources.
#[derive(Clone)]
pub struct MergedSource {
    kind: Option<TransactionType>,
    sources: Vec<Arc<dyn TransactionSource>>,
}

impl std::fmt::Debug for MergedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedSource")
            .field("kind", &self.kind)
            .field("sources", &self.sources.len())
            .finish()
    }
}

/// Children still holding fetched items.
struct Buffer {
    source: usize,
    items: VecDeque<PageItem>,
    is_last: bool,
}

fn order_key(transaction: &Transaction) -> (i64, &str) {
    (transaction.created_at_millis, transaction.id.as_str())
}

fn encode_cursor(cursors: &[String]) -> String {
    serde_json::Value::from(cursors.to_vec()).to_string()
}

fn decode_cursor(cursor: Option<&str>, len: usize) -> PaymentsResult<Vec<String>> {
    let Some(raw) = cursor else {
        return Ok(vec![String::new(); len]);
    };
    let cursors: Vec<String> =
        serde_json::from_str(raw).map_err(|e| DbError::malformed("merged cursor", e))?;
    if cursors.len() != len {
        return Err(DbError::malformed(
            "merged cursor",
            format!("expected {} positions, got {}", len, cursors.len()),
        )
        .into());
    }
    Ok(cursors)
}

impl MergedSource {
    /// `kind` is the type every child yields, or `None` for a mixed feed.
    pub fn new(kind: Option<TransactionType>, sources: Vec<Arc<dyn TransactionSource>>) -> Self {
        MergedSource { kind, sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl TransactionSource for MergedSource {
    fn kind(&self) -> Option<TransactionType> {
        self.kind
    }

    fn next_page<'a>(&'a self, query: &'a PageQuery) -> BoxFuture<'a, PaymentsResult<Page>> {
        Box::pin(async move {
            let limit = query.limit.max(1);
            let mut cursors = decode_cursor(query.after(), self.sources.len())?;
            let is_first = cursors.iter().all(String::is_empty);

            let active: Vec<usize> = (0..self.sources.len())
                .filter(|&i| source_matches(self.sources[i].as_ref(), &query.filter))
                .collect();

            let pages = try_join_all(active.iter().map(|&i| {
                let source = Arc::clone(&self.sources[i]);
                let child = PageQuery {
                    cursor: Some(cursors[i].clone()),
                    limit,
                    filter: query.filter.clone(),
                };
                async move { source.next_page(&child).await }
            }))
            .await?;

            let mut buffers: Vec<Buffer> = active
                .iter()
                .zip(pages)
                .map(|(&source, page)| Buffer {
                    source,
                    is_last: page.is_last,
                    items: page.items.into(),
                })
                .collect();

            let mut items = Vec::new();
            while items.len() < limit {
                // A drained child that has more pages could hold the next item.
                if buffers.iter().any(|b| b.items.is_empty() && !b.is_last) {
                    break;
                }
                let newest = buffers
                    .iter()
                    .enumerate()
                    .filter_map(|(b, buffer)| buffer.items.front().map(|item| (b, item)))
                    .max_by(|(_, x), (_, y)| order_key(&x.transaction).cmp(&order_key(&y.transaction)))
                    .map(|(b, _)| b);
                let Some(b) = newest else {
                    break;
                };
                let Some(item) = buffers[b].items.pop_front() else {
                    break;
                };

                let prev_cursor = encode_cursor(&cursors);
                cursors[buffers[b].source] = item.next_cursor;
                items.push(PageItem {
                    transaction: item.transaction,
                    prev_cursor,
                    next_cursor: encode_cursor(&cursors),
                });
            }

            let is_last = buffers.iter().all(|b| b.items.is_empty() && b.is_last);
            Ok(Page {
                items,
                is_first,
                is_last,
                cursor: encode_cursor(&cursors),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transactions::{EmptySource, TransactionFilter};

    /// In-memory source over fixed transactions, newest first.
    struct FixedSource {
        kind: TransactionType,
        transactions: Vec<Transaction>,
    }

    impl FixedSource {
        fn new(kind: TransactionType, times: &[(i64, &str)]) -> Self {
            let mut transactions: Vec<Transaction> = times
                .iter()
                .map(|(at, id)| Transaction::new(*id, kind, *at, Vec::new(), false))
                .collect();
            transactions.sort_by(|a, b| order_key(b).cmp(&order_key(a)));
            FixedSource { kind, transactions }
        }
    }

    impl TransactionSource for FixedSource {
        fn kind(&self) -> Option<TransactionType> {
            Some(self.kind)
        }

        fn next_page<'a>(&'a self, query: &'a PageQuery) -> BoxFuture<'a, PaymentsResult<Page>> {
            Box::pin(async move {
                let start = match query.after() {
                    Some(after) => {
                        self.transactions
                            .iter()
                            .position(|t| t.id == after)
                            .map(|p| p + 1)
                            .unwrap_or(self.transactions.len())
                    }
                    None => 0,
                };
                let end = (start + query.limit).min(self.transactions.len());
                let mut prev = query.after().unwrap_or_default().to_string();
                let items = self.transactions[start..end]
                    .iter()
                    .map(|t| PageItem {
                        transaction: t.clone(),
                        prev_cursor: std::mem::replace(&mut prev, t.id.clone()),
                        next_cursor: t.id.clone(),
                    })
                    .collect();
                Ok(Page {
                    items,
                    is_first: start == 0,
                    is_last: end == self.transactions.len(),
                    cursor: prev,
                })
            })
        }
    }

    fn merged() -> MergedSource {
        MergedSource::new(
            None,
            vec![
                Arc::new(FixedSource::new(
                    TransactionType::SubscriptionStart,
                    &[(90, "a6"), (40, "a5"), (10, "a1")],
                )),
                Arc::new(FixedSource::new(TransactionType::OneTimePurchase, &[(70, "b9"), (40, "b2")])),
                Arc::new(EmptySource::new(TransactionType::Chargeback)),
            ],
        )
    }

    #[tokio::test]
    async fn test_merge_orders_across_sources() {
        let source = merged();
        let mut query = PageQuery::first(2, TransactionFilter::default());
        let mut ids = Vec::new();
        loop {
            let page = source.next_page(&query).await.unwrap();
            assert!(page.items.len() <= 2);
            ids.extend(page.items.iter().map(|i| i.transaction.id.clone()));
            query.cursor = Some(page.cursor.clone());
            if page.is_last {
                break;
            }
        }
        // Ties on time fall back to descending id.
        assert_eq!(ids, vec!["a6", "b9", "b2", "a5", "a1"]);
    }

    #[tokio::test]
    async fn test_item_cursors_chain() {
        let source = merged();
        let page = source
            .next_page(&PageQuery::first(10, TransactionFilter::default()))
            .await
            .unwrap();
        assert!(page.is_first);
        assert!(page.is_last);
        for pair in page.items.windows(2) {
            assert_eq!(pair[0].next_cursor, pair[1].prev_cursor);
        }
        assert_eq!(page.items.last().unwrap().next_cursor, page.cursor);
    }

    #[tokio::test]
    async fn test_type_filter_skips_other_sources() {
        let source = merged();
        let filter = TransactionFilter::default().with_type(TransactionType::OneTimePurchase);
        let page = source.next_page(&PageQuery::first(10, filter)).await.unwrap();
        let ids: Vec<_> = page.items.iter().map(|i| i.transaction.id.as_str()).collect();
        assert_eq!(ids, vec!["b9", "b2"]);
    }

    #[tokio::test]
    async fn test_rejects_foreign_cursor() {
        let source = merged();
        let query = PageQuery {
            cursor: Some("[\"only-one\"]".into()),
            limit: 5,
            filter: TransactionFilter::default(),
        };
        assert!(source.next_page(&query).await.is_err());
    }
}
