//! # Item Grant Renewals
//!
//! Synthesizes the `item-grant-renewal` transactions that have no backing
//! row: repeating items of paid grants, and item grants of include-by-default
//! products while nothing paid covers them.
//!
//! ## Paid Grant Timeline
//! ```text
//!   anchor        +1w           +2w           revoked
//!     │  start      │ renewal:1   │ renewal:2   │ end / refund
//!     ├─────────────┼─────────────┼─────────────┤
//!     +10           -10 +10       -10 +10       renewal-end: -10
//!                   (when-repeated items expire the previous grant)
//! ```
//!
//! ## Default Product Windows
//! ```text
//!   snapshot ─────────────────────────────────────────────────────► ∞
//!   paid in line        [=========)            [=======)
//!   default window  [===)         [============)       [==========► ∞
//!                   grant  end    grant        end     grant
//! ```
//!
//! Everything is computed eagerly up to `now`; callers paginate the result.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexSet;
use tracing::debug;

use crate::builders::{
    create_item_quantity_change_entries_for_product, create_item_quantity_change_entry,
    create_item_quantity_expire_entry, granted_item_quantities,
};
use crate::error::{CoreError, CoreResult};
use crate::interval::{add_interval, intervals_elapsed, RepeatInterval};
use crate::ledger::FAR_FUTURE_MILLIS;
use crate::transaction::{
    EntryRef, GrantSource, Transaction, TransactionEntry, TransactionType,
};
use crate::types::{Customer, ItemExpiry, Product, ProductSnapshot};

/// Inputs of [`generate_item_grant_renewals`].
#[derive(Debug, Clone, Copy)]
pub struct RenewalInput<'a> {
    /// `subscription-start` and `one-time-purchase` transactions.
    pub grants: &'a [Transaction],
    /// Transactions that may carry `product_revocation` entries.
    pub revocations: &'a [Transaction],
    /// `default-products-change` transactions.
    pub default_snapshots: &'a [Transaction],
    /// Product line ids declared in the tenancy config.
    pub product_line_ids: &'a BTreeSet<String>,
    /// Default-product grants are only generated for a known customer.
    pub customer: Option<&'a Customer>,
    pub now: i64,
}

/// Revoked transaction id → earliest revocation instant.
pub fn revocation_times(revocations: &[Transaction]) -> BTreeMap<String, i64> {
    let mut times: BTreeMap<String, i64> = BTreeMap::new();
    for tx in revocations {
        for entry in &tx.entries {
            if let TransactionEntry::ProductRevocation(revocation) = entry {
                let at = times
                    .entry(revocation.adjusted.transaction_id.clone())
                    .or_insert(tx.effective_at_millis);
                *at = (*at).min(tx.effective_at_millis);
            }
        }
    }
    times
}

/// Generates every renewal transaction effective at or before `now`.
///
/// The result is unordered; callers sort it.
///
/// ## Errors
/// `CoreError::Invariant` when a grant lacks the change index of a
/// repeating item it produced.
pub fn generate_item_grant_renewals(input: RenewalInput<'_>) -> CoreResult<Vec<Transaction>> {
    let revoked = revocation_times(input.revocations);
    let mut out = Vec::new();

    for tx in input.grants {
        paid_grant_renewals(&mut out, tx, revoked.get(&tx.id).copied(), input.now)?;
    }

    if let Some(customer) = input.customer {
        let coverage = PaidCoverage::from_grants(input.grants, &revoked);
        for segment in default_segments(input.default_snapshots) {
            if segment.product.customer_type != customer.customer_type {
                continue;
            }
            for window in coverage.default_windows(&segment, input.product_line_ids) {
                default_window_grants(&mut out, customer, &segment, window, input.now)?;
            }
        }
    }

    debug!(generated = out.len(), "generated item grant renewals");
    Ok(out)
}

// =============================================================================
// Shared Renewal Loop
// =============================================================================

/// A granted item and the change entries of it that are still live.
#[derive(Debug, Clone)]
struct LiveItem {
    item_id: String,
    quantity: i64,
    expires: ItemExpiry,
    repeat: Option<RepeatInterval>,
    origin: EntryRef,
    live: Vec<EntryRef>,
}

impl LiveItem {
    fn new(
        item_id: &str,
        quantity: i64,
        expires: ItemExpiry,
        repeat: Option<RepeatInterval>,
        origin: EntryRef,
    ) -> Self {
        LiveItem {
            item_id: item_id.to_string(),
            quantity,
            expires,
            repeat,
            live: vec![origin.clone()],
            origin,
        }
    }
}

/// Distinct repeat intervals in declaration order, with the items using each.
fn group_by_repeat(items: &[LiveItem]) -> Vec<(RepeatInterval, Vec<usize>)> {
    let repeats: IndexSet<RepeatInterval> = items.iter().filter_map(|item| item.repeat).collect();
    repeats
        .into_iter()
        .map(|repeat| {
            let members = items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.repeat == Some(repeat))
                .map(|(i, _)| i)
                .collect();
            (repeat, members)
        })
        .collect()
}

struct RenewalRun<'a> {
    customer: &'a Customer,
    repeat: RepeatInterval,
    anchor: i64,
    /// Renewals occur strictly after this instant; the anchor keeps the phase.
    after: i64,
    /// Last instant (inclusive) a renewal may occur at.
    last: i64,
    test_mode: bool,
}

/// Emits one transaction per elapsed occurrence of `run.repeat`.
fn emit_renewals(
    out: &mut Vec<Transaction>,
    run: &RenewalRun<'_>,
    items: &mut [LiveItem],
    members: &[usize],
    tx_id: impl Fn(u32) -> String,
) -> CoreResult<()> {
    let skipped = intervals_elapsed(run.anchor, run.after, run.repeat);
    let count = intervals_elapsed(run.anchor, run.last, run.repeat);
    for k in skipped.saturating_add(1)..=count {
        let Some(at) = add_interval(run.anchor, run.repeat, k) else {
            break;
        };
        let id = tx_id(k);
        let mut entries = Vec::new();
        for &i in members {
            let item = &mut items[i];
            if item.expires == ItemExpiry::WhenRepeated {
                for previous in std::mem::take(&mut item.live) {
                    entries.push(create_item_quantity_expire_entry(
                        run.customer,
                        &item.item_id,
                        item.quantity,
                        previous,
                    )?);
                }
            }
            entries.push(create_item_quantity_change_entry(
                run.customer,
                &item.item_id,
                item.quantity,
            )?);
            item.live.push(EntryRef::new(id.clone(), entries.len() - 1));
        }
        out.push(Transaction::new(
            id,
            TransactionType::ItemGrantRenewal,
            at,
            entries,
            run.test_mode,
        ));
    }
    Ok(())
}

fn expire_refs<'a>(
    customer: &Customer,
    item: &LiveItem,
    refs: impl Iterator<Item = &'a EntryRef>,
    entries: &mut Vec<TransactionEntry>,
) -> CoreResult<()> {
    for reference in refs {
        entries.push(create_item_quantity_expire_entry(
            customer,
            &item.item_id,
            item.quantity,
            reference.clone(),
        )?);
    }
    Ok(())
}

// =============================================================================
// Paid Grants
// =============================================================================

fn paid_grant_renewals(
    out: &mut Vec<Transaction>,
    tx: &Transaction,
    revoked_at: Option<i64>,
    now: i64,
) -> CoreResult<()> {
    let Some((_, grant)) = tx.product_grant() else {
        return Ok(());
    };

    let mut items = Vec::new();
    for (item_id, item) in &grant.product.included_items {
        let Some(repeat) = item.repeat else { continue };
        let quantity = item.quantity.saturating_mul(grant.quantity);
        if quantity <= 0 {
            continue;
        }
        let index = grant
            .item_quantity_change_indices
            .get(item_id)
            .copied()
            .ok_or_else(|| {
                CoreError::invariant(format!(
                    "item_quantity_change index not found for item {} in {}",
                    item_id, tx.id
                ))
            })?;
        items.push(LiveItem::new(
            item_id,
            quantity,
            item.expires,
            Some(repeat),
            EntryRef::new(tx.id.clone(), index),
        ));
    }
    if items.is_empty() {
        return Ok(());
    }

    // Renewals stop strictly before the revocation.
    let last = match revoked_at {
        Some(revoked) => revoked.saturating_sub(1).min(now),
        None => now,
    };

    for (repeat, members) in group_by_repeat(&items) {
        let run = RenewalRun {
            customer: &grant.customer,
            repeat,
            anchor: grant.cycle_anchor,
            after: tx.effective_at_millis,
            last,
            test_mode: tx.test_mode,
        };
        emit_renewals(out, &run, &mut items, &members, |k| {
            format!("{}:renewal:{}:{}", tx.id, k, repeat.key())
        })?;

        let Some(revoked) = revoked_at.filter(|revoked| *revoked <= now) else {
            continue;
        };
        let mut entries = Vec::new();
        for &i in &members {
            let item = &items[i];
            match item.expires {
                ItemExpiry::WhenRepeated => {
                    expire_refs(&grant.customer, item, item.live.iter(), &mut entries)?
                }
                // The original grant is expired by the end/refund transaction.
                ItemExpiry::WhenPurchaseExpires => expire_refs(
                    &grant.customer,
                    item,
                    item.live.iter().filter(|r| **r != item.origin),
                    &mut entries,
                )?,
                ItemExpiry::Never => {}
            }
        }
        if !entries.is_empty() {
            out.push(Transaction::new(
                format!("{}:renewal-end:{}", tx.id, repeat.key()),
                TransactionType::ItemGrantRenewal,
                revoked,
                entries,
                tx.test_mode,
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Default Products
// =============================================================================

/// A stretch of time during which one default product stayed unchanged.
#[derive(Debug, Clone, Copy)]
struct DefaultSegment<'a> {
    product_id: &'a str,
    product: &'a Product,
    start: i64,
    end: i64,
}

/// Splits the snapshot history into per-product segments.
///
/// Consecutive snapshots carrying an identical product extend one segment.
fn default_segments(snapshot_txs: &[Transaction]) -> Vec<DefaultSegment<'_>> {
    let mut snapshots: Vec<(i64, &ProductSnapshot)> = snapshot_txs
        .iter()
        .flat_map(|tx| {
            tx.entries.iter().filter_map(move |entry| match entry {
                TransactionEntry::DefaultProductsChange(change) => {
                    Some((tx.effective_at_millis, &change.snapshot))
                }
                _ => None,
            })
        })
        .collect();
    snapshots.sort_by_key(|(at, _)| *at);

    let mut open: indexmap::IndexMap<&str, DefaultSegment<'_>> = indexmap::IndexMap::new();
    let mut closed = Vec::new();
    for (at, snapshot) in snapshots {
        open.retain(|id, segment| {
            let unchanged = snapshot.get(*id).is_some_and(|p| p == segment.product);
            if !unchanged {
                closed.push(DefaultSegment { end: at, ..*segment });
            }
            unchanged
        });
        for (id, product) in snapshot {
            open.entry(id.as_str()).or_insert(DefaultSegment {
                product_id: id,
                product,
                start: at,
                end: FAR_FUTURE_MILLIS,
            });
        }
    }
    closed.extend(open.into_values());
    closed
}

/// Paid ownership intervals, used to find where defaults apply.
struct PaidCoverage<'a> {
    /// `(product_id, product_line_id, [start, end))` per paid grant.
    intervals: Vec<(Option<&'a str>, Option<&'a str>, i64, i64)>,
}

impl<'a> PaidCoverage<'a> {
    fn from_grants(grants: &'a [Transaction], revoked: &BTreeMap<String, i64>) -> Self {
        let intervals = grants
            .iter()
            .filter_map(|tx| {
                let (_, grant) = tx.product_grant()?;
                if grant.source == GrantSource::IncludeByDefault || grant.quantity <= 0 {
                    return None;
                }
                let end = revoked.get(&tx.id).copied().unwrap_or(FAR_FUTURE_MILLIS);
                Some((
                    grant.product_id.as_deref(),
                    grant.product.product_line_id.as_deref(),
                    tx.effective_at_millis,
                    end,
                ))
            })
            .collect();
        PaidCoverage { intervals }
    }

    fn default_windows(
        &self,
        segment: &DefaultSegment<'_>,
        product_line_ids: &BTreeSet<String>,
    ) -> Vec<(i64, i64)> {
        let line = segment
            .product
            .product_line_id
            .as_deref()
            .filter(|line| product_line_ids.contains(*line));

        match line {
            Some(line) => {
                let covered: Vec<(i64, i64)> = self
                    .intervals
                    .iter()
                    .filter(|(_, l, start, end)| *l == Some(line) && start < end)
                    .map(|(_, _, start, end)| (*start, *end))
                    .collect();
                complement(covered)
                    .into_iter()
                    .filter_map(|(gap_start, gap_end)| {
                        let start = gap_start.max(segment.start);
                        let end = gap_end.min(segment.end);
                        (start < end).then_some((start, end))
                    })
                    .collect()
            }
            None => {
                let ever_paid = self
                    .intervals
                    .iter()
                    .any(|(id, _, _, _)| *id == Some(segment.product_id));
                if ever_paid {
                    Vec::new()
                } else {
                    vec![(segment.start, segment.end)]
                }
            }
        }
    }
}

/// Gaps between the merged intervals, from the beginning of time to `+∞`.
fn complement(mut covered: Vec<(i64, i64)>) -> Vec<(i64, i64)> {
    covered.sort();
    let mut gaps = Vec::new();
    let mut cursor = i64::MIN;
    for (start, end) in covered {
        if start > cursor {
            gaps.push((cursor, start));
        }
        cursor = cursor.max(end);
    }
    if cursor < FAR_FUTURE_MILLIS {
        gaps.push((cursor, FAR_FUTURE_MILLIS));
    }
    gaps
}

fn default_window_grants(
    out: &mut Vec<Transaction>,
    customer: &Customer,
    segment: &DefaultSegment<'_>,
    (start, end): (i64, i64),
    now: i64,
) -> CoreResult<()> {
    if start > now {
        return Ok(());
    }
    let product = segment.product;
    let prefix = format!("default:{}:{}", segment.product_id, start);
    let grant_id = format!("{}:grant", prefix);

    let changes = create_item_quantity_change_entries_for_product(customer, product, 1)?;
    if changes.is_empty() {
        return Ok(());
    }
    let mut items: Vec<LiveItem> = granted_item_quantities(product, 1)
        .into_iter()
        .enumerate()
        .map(|(index, (item_id, quantity))| {
            let config = product.included_items.get(item_id);
            LiveItem::new(
                item_id,
                quantity,
                config.map(|c| c.expires).unwrap_or_default(),
                config.and_then(|c| c.repeat),
                EntryRef::new(grant_id.clone(), index),
            )
        })
        .collect();
    out.push(Transaction::new(
        grant_id,
        TransactionType::ItemGrantRenewal,
        start,
        changes,
        false,
    ));

    let last = end.saturating_sub(1).min(now);
    for (repeat, members) in group_by_repeat(&items) {
        let run = RenewalRun {
            customer,
            repeat,
            anchor: start,
            after: start,
            last,
            test_mode: false,
        };
        emit_renewals(out, &run, &mut items, &members, |k| {
            format!("{}:{}:{}", prefix, repeat.key(), k)
        })?;
    }

    if end > now || end >= FAR_FUTURE_MILLIS {
        return Ok(());
    }
    let mut entries = Vec::new();
    for item in items.iter().filter(|item| item.expires != ItemExpiry::Never) {
        expire_refs(customer, item, item.live.iter(), &mut entries)?;
    }
    if !entries.is_empty() {
        out.push(Transaction::new(
            format!("{}:end", prefix),
            TransactionType::ItemGrantRenewal,
            end,
            entries,
            false,
        ));
    }
    Ok(())
}
