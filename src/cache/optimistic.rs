//! Optimistic cache edits for REST mutations.
//!
//! Each edit returns a [`Rollback`] listing the exact steps it took. Undoing
//! reverts only those steps, so notifications the stream inserted while the
//! request was running survive a failed mutation.

use super::key::{CacheKey, KeyFilter};
use super::store::{CacheTxn, CacheValue, NotificationListing};
use crate::notifications::Notification;

#[derive(Debug, Clone, PartialEq)]
enum Undo {
    /// The notification was flagged read in this listing.
    Unread { key: CacheKey, id: u64 },
    /// The notification was taken out of page `page` of this listing.
    Reinsert {
        key: CacheKey,
        page: usize,
        notification: Notification,
    },
    /// Page totals were lowered by these amounts.
    Totals { key: CacheKey, removed: Vec<u64> },
    /// The unread counter was lowered.
    Counter { user_id: usize, by: u64 },
}

/// Inverse of one optimistic edit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Rollback {
    steps: Vec<Undo>,
}

impl Rollback {
    pub fn undo(self, txn: &mut CacheTxn<'_>) {
        for step in self.steps.into_iter().rev() {
            match step {
                Undo::Unread { key, id } => {
                    with_listing(txn, &key, |listing| {
                        for notification in items_mut(listing).filter(|n| n.id == id) {
                            notification.is_read = false;
                        }
                    });
                }
                Undo::Reinsert {
                    key,
                    page,
                    notification,
                } => {
                    with_listing(txn, &key, |listing| reinsert(listing, page, notification));
                }
                Undo::Totals { key, removed } => {
                    with_listing(txn, &key, |listing| {
                        for (page, by) in listing.pages.iter_mut().zip(removed) {
                            page.total_count += by;
                        }
                    });
                }
                Undo::Counter { user_id, by } => {
                    txn.modify(&CacheKey::unread_count(user_id), |value| {
                        if let Some(CacheValue::UnreadCount(count)) = value {
                            *count += by;
                        }
                    });
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

fn with_listing<F>(txn: &mut CacheTxn<'_>, key: &CacheKey, f: F)
where
    F: FnOnce(&mut NotificationListing),
{
    txn.modify(key, |value| {
        if let Some(listing) = listing_mut(value) {
            f(listing);
        }
    });
}

fn listing_mut(value: &mut Option<CacheValue>) -> Option<&mut NotificationListing> {
    match value {
        Some(CacheValue::Notifications(listing)) => Some(listing),
        _ => None,
    }
}

fn items_mut(listing: &mut NotificationListing) -> impl Iterator<Item = &mut Notification> {
    listing
        .pages
        .iter_mut()
        .flat_map(|page| page.notifications.iter_mut())
}

/// Put a removed notification back on its page, keeping newest-first order.
fn reinsert(listing: &mut NotificationListing, page: usize, notification: Notification) {
    if listing.contains(notification.id) || listing.pages.is_empty() {
        return;
    }
    let page = page.min(listing.pages.len() - 1);
    let items = &mut listing.pages[page].notifications;
    let at = items
        .iter()
        .position(|n| n.created_at < notification.created_at)
        .unwrap_or(items.len());
    items.insert(at, notification);
}

/// Lower the unread counter by at most `by`.
fn decrement_unread(txn: &mut CacheTxn<'_>, user_id: usize, by: u64) -> Option<Undo> {
    if by == 0 {
        return None;
    }
    let mut lowered = 0;
    txn.modify(&CacheKey::unread_count(user_id), |value| {
        if let Some(CacheValue::UnreadCount(count)) = value {
            lowered = by.min(*count);
            *count -= lowered;
        }
    });
    (lowered > 0).then_some(Undo::Counter {
        user_id,
        by: lowered,
    })
}

/// Remove `id` from a listing and lower the page totals.
fn remove_from_listing(key: &CacheKey, listing: &mut NotificationListing, id: u64) -> Vec<Undo> {
    let mut steps = Vec::new();
    for (index, page) in listing.pages.iter_mut().enumerate() {
        if let Some(at) = page.notifications.iter().position(|n| n.id == id) {
            steps.push(Undo::Reinsert {
                key: key.clone(),
                page: index,
                notification: page.notifications.remove(at),
            });
        }
    }
    if !steps.is_empty() {
        let removed = listing
            .pages
            .iter_mut()
            .map(|page| {
                let before = page.total_count;
                page.total_count = before.saturating_sub(1);
                before - page.total_count
            })
            .collect();
        steps.push(Undo::Totals {
            key: key.clone(),
            removed,
        });
    }
    steps
}

/// Flag one notification as read in every listing of the user. Unread-only
/// listings drop it.
pub fn mark_read(txn: &mut CacheTxn<'_>, user_id: usize, id: u64) -> Rollback {
    let mut steps = Vec::new();
    let mut was_unread = false;

    for key in txn.keys(&KeyFilter::NotificationListsOf(user_id)) {
        let unread_only = key.filter.is_read == Some(false);
        with_listing(txn, &key, |listing| {
            if listing.items().any(|n| n.id == id && !n.is_read) {
                was_unread = true;
            }
            if unread_only {
                steps.extend(remove_from_listing(&key, listing, id));
                return;
            }
            let mut flipped = false;
            for notification in items_mut(listing).filter(|n| n.id == id && !n.is_read) {
                notification.is_read = true;
                flipped = true;
            }
            if flipped {
                steps.push(Undo::Unread {
                    key: key.clone(),
                    id,
                });
            }
        });
    }

    if was_unread {
        steps.extend(decrement_unread(txn, user_id, 1));
    }
    Rollback { steps }
}

/// Flag everything read. Unread-only listings become empty and the counter
/// drops to zero.
pub fn mark_all_read(txn: &mut CacheTxn<'_>, user_id: usize) -> Rollback {
    let mut steps = Vec::new();

    for key in txn.keys(&KeyFilter::NotificationListsOf(user_id)) {
        let unread_only = key.filter.is_read == Some(false);
        with_listing(txn, &key, |listing| {
            if unread_only {
                let mut removed = Vec::with_capacity(listing.pages.len());
                for (index, page) in listing.pages.iter_mut().enumerate() {
                    for notification in page.notifications.drain(..) {
                        steps.push(Undo::Reinsert {
                            key: key.clone(),
                            page: index,
                            notification,
                        });
                    }
                    removed.push(std::mem::take(&mut page.total_count));
                }
                steps.push(Undo::Totals {
                    key: key.clone(),
                    removed,
                });
                return;
            }
            for notification in items_mut(listing).filter(|n| !n.is_read) {
                notification.is_read = true;
                steps.push(Undo::Unread {
                    key: key.clone(),
                    id: notification.id,
                });
            }
        });
    }

    let unread = match txn.value(&CacheKey::unread_count(user_id)) {
        Some(CacheValue::UnreadCount(count)) => *count,
        _ => 0,
    };
    steps.extend(decrement_unread(txn, user_id, unread));
    Rollback { steps }
}

/// Drop a notification from every listing of the user.
pub fn delete(txn: &mut CacheTxn<'_>, user_id: usize, id: u64) -> Rollback {
    let mut steps = Vec::new();
    let mut was_unread = false;

    for key in txn.keys(&KeyFilter::NotificationListsOf(user_id)) {
        with_listing(txn, &key, |listing| {
            if listing.items().any(|n| n.id == id && !n.is_read) {
                was_unread = true;
            }
            steps.extend(remove_from_listing(&key, listing, id));
        });
    }

    if was_unread {
        steps.extend(decrement_unread(txn, user_id, 1));
    }
    Rollback { steps }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::QueryCache;
    use crate::notifications::test_support::notification;
    use crate::notifications::{NotificationFilter, NotificationPage};

    async fn seeded() -> (QueryCache, CacheKey, CacheKey) {
        let cache = QueryCache::new();
        let all = CacheKey::notifications(1, NotificationFilter::default());
        let unread = CacheKey::notifications(1, NotificationFilter::unread_only());
        let mut read_one = notification(1, "old");
        read_one.is_read = true;
        cache
            .set(
                &all,
                CacheValue::Notifications(NotificationListing::new(vec![NotificationPage {
                    notifications: vec![notification(3, "c"), notification(2, "b"), read_one],
                    total_count: 3,
                    current_page: 1,
                    per_page: 20,
                }])),
            )
            .await;
        cache
            .set(
                &unread,
                CacheValue::Notifications(NotificationListing::new(vec![NotificationPage {
                    notifications: vec![notification(3, "c"), notification(2, "b")],
                    total_count: 2,
                    current_page: 1,
                    per_page: 20,
                }])),
            )
            .await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(2))
            .await;
        (cache, all, unread)
    }

    #[tokio::test]
    async fn test_mark_read() {
        let (cache, all, unread) = seeded().await;

        cache.transaction(|txn| mark_read(txn, 1, 2)).await;

        let listing = cache.listing(&all).await.unwrap();
        assert!(listing.items().find(|n| n.id == 2).unwrap().is_read);
        assert_eq!(listing.total_count(), 3);
        let unread_listing = cache.listing(&unread).await.unwrap();
        assert_eq!(unread_listing.ids(), vec![3]);
        assert_eq!(unread_listing.total_count(), 1);
        assert_eq!(cache.unread_count(1).await, Some(1));
    }

    #[tokio::test]
    async fn test_mark_read_on_read_item_keeps_counter() {
        let (cache, _all, _unread) = seeded().await;

        cache.transaction(|txn| mark_read(txn, 1, 1)).await;

        assert_eq!(cache.unread_count(1).await, Some(2));
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let (cache, all, unread) = seeded().await;

        cache.transaction(|txn| mark_all_read(txn, 1)).await;

        assert!(cache.listing(&all).await.unwrap().items().all(|n| n.is_read));
        assert!(cache.listing(&unread).await.unwrap().is_empty());
        assert_eq!(cache.unread_count(1).await, Some(0));
    }

    #[tokio::test]
    async fn test_delete() {
        let (cache, all, unread) = seeded().await;

        cache.transaction(|txn| delete(txn, 1, 3)).await;

        let listing = cache.listing(&all).await.unwrap();
        assert_eq!(listing.ids(), vec![2, 1]);
        assert_eq!(listing.total_count(), 2);
        assert_eq!(cache.listing(&unread).await.unwrap().ids(), vec![2]);
        assert_eq!(cache.unread_count(1).await, Some(1));
    }

    #[tokio::test]
    async fn test_undo_restores_everything() {
        let (cache, all, unread) = seeded().await;
        let before_all = cache.get(&all).await;
        let before_unread = cache.get(&unread).await;

        let rollback = cache.transaction(|txn| delete(txn, 1, 3)).await;
        assert!(!rollback.is_empty());
        cache.transaction(|txn| rollback.undo(txn)).await;

        assert_eq!(cache.get(&all).await, before_all);
        assert_eq!(cache.get(&unread).await, before_unread);
        assert_eq!(cache.unread_count(1).await, Some(2));
    }

    #[tokio::test]
    async fn test_undo_mark_all_read_restores_order() {
        let (cache, all, unread) = seeded().await;
        let before_all = cache.get(&all).await;
        let before_unread = cache.get(&unread).await;

        let rollback = cache.transaction(|txn| mark_all_read(txn, 1)).await;
        cache.transaction(|txn| rollback.undo(txn)).await;

        assert_eq!(cache.get(&all).await, before_all);
        assert_eq!(cache.get(&unread).await, before_unread);
        assert_eq!(cache.unread_count(1).await, Some(2));
    }

    #[tokio::test]
    async fn test_undo_keeps_items_inserted_after_the_edit() {
        let (cache, all, unread) = seeded().await;

        let rollback = cache.transaction(|txn| delete(txn, 1, 2)).await;
        // A newer notification lands before the request fails.
        cache
            .transaction(|txn| {
                for key in [&all, &unread] {
                    with_listing(txn, key, |listing| {
                        listing.pages[0].notifications.insert(0, notification(4, "d"));
                        listing.pages[0].total_count += 1;
                    });
                }
                txn.modify(&CacheKey::unread_count(1), |value| {
                    if let Some(CacheValue::UnreadCount(count)) = value {
                        *count += 1;
                    }
                });
            })
            .await;
        cache.transaction(|txn| rollback.undo(txn)).await;

        let listing = cache.listing(&all).await.unwrap();
        assert_eq!(listing.ids(), vec![4, 3, 2, 1]);
        assert_eq!(listing.total_count(), 4);
        let unread_listing = cache.listing(&unread).await.unwrap();
        assert_eq!(unread_listing.ids(), vec![4, 3, 2]);
        assert_eq!(unread_listing.total_count(), 3);
        assert_eq!(cache.unread_count(1).await, Some(3));
    }
}
