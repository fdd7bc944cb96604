//! Applies notifications received from the stream to the query cache.
//!
//! For each notification of the current user, inside a single cache
//! transaction:
//! 1. every cached listing of that user whose filter accepts the item gets
//!    it prepended to its first page (empty entries are initialized),
//! 2. the unread counter is incremented by one,
//! 3. all listings of that user are marked stale,
//!
//! then the stale listings are handed to the background refresher.
//! Settings and unrelated entries are never touched.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::key::{CacheKey, KeyFilter};
use super::refresher::RefreshRequest;
use super::store::{CacheTxn, CacheValue, NotificationListing, QueryCache};
use crate::auth::IdentityReceiver;
use crate::notifications::{Notification, NotificationPage};

/// How many applied ids are remembered per user for redelivery checks.
const RECENT_IDS_CAPACITY: usize = 256;

/// Result of applying one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        lists_updated: usize,
        counter_incremented: bool,
    },
    /// The id was already applied or is already cached.
    Duplicate,
    /// The event targets a user that is no longer authenticated.
    StaleUser,
}

#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<u64>,
    ids: HashSet<u64>,
}

impl RecentIds {
    fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    fn remember(&mut self, id: u64) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > RECENT_IDS_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

pub struct CacheSynchronizer {
    cache: Arc<QueryCache>,
    identity: IdentityReceiver,
    refresh_tx: Option<mpsc::UnboundedSender<RefreshRequest>>,
    recent: HashMap<usize, RecentIds>,
}

impl CacheSynchronizer {
    pub fn new(
        cache: Arc<QueryCache>,
        identity: IdentityReceiver,
        refresh_tx: Option<mpsc::UnboundedSender<RefreshRequest>>,
    ) -> Self {
        Self {
            cache,
            identity,
            refresh_tx,
            recent: HashMap::new(),
        }
    }

    pub async fn apply(&mut self, user_id: usize, notification: Notification) -> ApplyOutcome {
        let current_user = self.identity.borrow().as_ref().map(|i| i.user_id);
        if current_user != Some(user_id) {
            info!(
                "Discarding notification {} for user {}: no longer the authenticated user",
                notification.id, user_id
            );
            return ApplyOutcome::StaleUser;
        }

        // Redelivery windows of earlier users are of no further use.
        self.recent.retain(|user, _| *user == user_id);

        let id = notification.id;
        if self
            .recent
            .get(&user_id)
            .is_some_and(|recent| recent.contains(id))
        {
            debug!("Notification {} already applied for user {}", id, user_id);
            return ApplyOutcome::Duplicate;
        }

        let applied = self
            .cache
            .transaction(|txn| apply_to_entries(txn, user_id, &notification))
            .await;

        self.recent.entry(user_id).or_default().remember(id);

        let Some((outcome, stale_keys)) = applied else {
            debug!("Notification {} already cached for user {}", id, user_id);
            return ApplyOutcome::Duplicate;
        };

        debug!(
            "Applied notification {} for user {}: {:?}",
            id, user_id, outcome
        );

        if !stale_keys.is_empty() {
            if let Some(refresh_tx) = &self.refresh_tx {
                let request = RefreshRequest {
                    user_id,
                    keys: stale_keys,
                };
                if refresh_tx.send(request).is_err() {
                    warn!("Refresher is gone, skipping background refresh");
                }
            }
        }

        outcome
    }
}

/// Steps 1 to 3, run under the cache write lock.
///
/// Returns `None` without mutating anything if the id is already present in
/// one of the user's listings.
fn apply_to_entries(
    txn: &mut CacheTxn<'_>,
    user_id: usize,
    notification: &Notification,
) -> Option<(ApplyOutcome, Vec<CacheKey>)> {
    let list_keys = txn.keys(&KeyFilter::NotificationListsOf(user_id));

    let already_cached = list_keys.iter().any(|key| {
        txn.value(key)
            .and_then(CacheValue::as_listing)
            .is_some_and(|listing| listing.contains(notification.id))
    });
    if already_cached {
        return None;
    }

    let mut lists_updated = 0;
    for key in &list_keys {
        if !key.filter.accepts(notification) {
            continue;
        }
        let per_page = key.filter.per_page();
        txn.modify(key, |value| prepend(value, notification.clone(), per_page));
        lists_updated += 1;
    }

    let counter_key = CacheKey::unread_count(user_id);
    let counter_incremented = !notification.is_read
        && matches!(txn.value(&counter_key), Some(CacheValue::UnreadCount(_)))
        && txn.modify(&counter_key, |value| {
            if let Some(CacheValue::UnreadCount(count)) = value {
                *count += 1;
            }
        });

    for key in &list_keys {
        txn.mark_stale(key);
    }

    Some((
        ApplyOutcome::Applied {
            lists_updated,
            counter_incremented,
        },
        list_keys,
    ))
}

/// Insert at the front of the first page. Never appends, never reorders
/// existing pages.
fn prepend(value: &mut Option<CacheValue>, notification: Notification, per_page: u32) {
    match value {
        Some(CacheValue::Notifications(listing)) if !listing.pages.is_empty() => {
            listing.pages[0].notifications.insert(0, notification);
            for page in listing.pages.iter_mut() {
                page.total_count += 1;
            }
        }
        _ => {
            *value = Some(CacheValue::Notifications(NotificationListing::new(vec![
                NotificationPage::single(notification, per_page),
            ])));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthState;
    use crate::cache::store::EntryStatus;
    use crate::notifications::test_support::notification;
    use crate::notifications::{NotificationFilter, NotificationSettings, NotificationType};

    fn empty_page() -> CacheValue {
        CacheValue::Notifications(NotificationListing::new(vec![NotificationPage {
            notifications: vec![],
            total_count: 0,
            current_page: 1,
            per_page: 20,
        }]))
    }

    async fn setup(user_id: usize) -> (AuthState, Arc<QueryCache>, CacheSynchronizer) {
        let auth = AuthState::new();
        auth.login(user_id, "token");
        let cache = Arc::new(QueryCache::new());
        let sync = CacheSynchronizer::new(cache.clone(), auth.subscribe(), None);
        (auth, cache, sync)
    }

    #[tokio::test]
    async fn test_two_frames_end_up_newest_first() {
        let (_auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        cache.set(&list, empty_page()).await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(0))
            .await;

        sync.apply(1, notification(1, "A")).await;
        sync.apply(1, notification(2, "B")).await;

        let listing = cache.listing(&list).await.unwrap();
        let titles: Vec<&str> = listing.items().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["B", "A"]);
        assert_eq!(listing.total_count(), 2);
        assert_eq!(cache.unread_count(1).await, Some(2));
    }

    #[tokio::test]
    async fn test_prepends_ahead_of_existing_items() {
        let (_auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        cache
            .set(
                &list,
                CacheValue::Notifications(NotificationListing::new(vec![NotificationPage {
                    notifications: vec![notification(10, "old2"), notification(9, "old1")],
                    total_count: 2,
                    current_page: 1,
                    per_page: 20,
                }])),
            )
            .await;

        for id in 11..=13 {
            sync.apply(1, notification(id, "new")).await;
        }

        let listing = cache.listing(&list).await.unwrap();
        assert_eq!(listing.ids(), vec![13, 12, 11, 10, 9]);
        assert_eq!(listing.total_count(), 5);
    }

    #[tokio::test]
    async fn test_later_pages_are_not_reshuffled() {
        let (_auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        let page = |n: u32, ids: &[u64]| NotificationPage {
            notifications: ids.iter().map(|id| notification(*id, "x")).collect(),
            total_count: 4,
            current_page: n,
            per_page: 2,
        };
        cache
            .set(
                &list,
                CacheValue::Notifications(NotificationListing::new(vec![
                    page(1, &[4, 3]),
                    page(2, &[2, 1]),
                ])),
            )
            .await;

        sync.apply(1, notification(5, "new")).await;

        let listing = cache.listing(&list).await.unwrap();
        assert_eq!(listing.pages[0].notifications.len(), 3);
        assert_eq!(listing.pages[1].notifications.len(), 2);
        assert_eq!(listing.ids(), vec![5, 4, 3, 2, 1]);
        assert!(listing.pages.iter().all(|p| p.total_count == 5));
    }

    #[tokio::test]
    async fn test_observed_empty_entry_is_initialized() {
        let (_auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        let _observer = cache.observe(list.clone()).await;

        sync.apply(1, notification(1, "A")).await;

        let listing = cache.listing(&list).await.unwrap();
        assert_eq!(listing.ids(), vec![1]);
        assert_eq!(listing.total_count(), 1);
    }

    #[tokio::test]
    async fn test_same_id_twice_is_applied_once() {
        let (_auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        cache.set(&list, empty_page()).await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(3))
            .await;

        let first = sync.apply(1, notification(7, "A")).await;
        let second = sync.apply(1, notification(7, "A")).await;

        assert_eq!(
            first,
            ApplyOutcome::Applied {
                lists_updated: 1,
                counter_incremented: true
            }
        );
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(cache.listing(&list).await.unwrap().ids(), vec![7]);
        assert_eq!(cache.unread_count(1).await, Some(4));
    }

    #[tokio::test]
    async fn test_item_already_fetched_by_rest_is_not_counted() {
        let (_auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        cache
            .set(
                &list,
                CacheValue::Notifications(NotificationListing::new(vec![NotificationPage::single(
                    notification(7, "A"),
                    20,
                )])),
            )
            .await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(1))
            .await;

        let outcome = sync.apply(1, notification(7, "A")).await;

        assert_eq!(outcome, ApplyOutcome::Duplicate);
        assert_eq!(cache.unread_count(1).await, Some(1));
    }

    #[tokio::test]
    async fn test_counter_tracks_distinct_notifications() {
        let (_auth, cache, mut sync) = setup(1).await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(5))
            .await;

        for id in 1..=4 {
            sync.apply(1, notification(id, "n")).await;
        }

        assert_eq!(cache.unread_count(1).await, Some(9));
    }

    #[tokio::test]
    async fn test_missing_counter_stays_missing() {
        let (_auth, cache, mut sync) = setup(1).await;

        let outcome = sync.apply(1, notification(1, "A")).await;

        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                lists_updated: 0,
                counter_incremented: false
            }
        );
        assert!(cache.unread_count(1).await.is_none());
    }

    #[tokio::test]
    async fn test_read_notification_does_not_increment_counter() {
        let (_auth, cache, mut sync) = setup(1).await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(0))
            .await;
        let mut read = notification(1, "A");
        read.is_read = true;

        sync.apply(1, read).await;

        assert_eq!(cache.unread_count(1).await, Some(0));
    }

    #[tokio::test]
    async fn test_other_users_entries_are_untouched() {
        let (_auth, cache, mut sync) = setup(1).await;
        let other_list = CacheKey::notifications(2, NotificationFilter::default());
        cache.set(&other_list, empty_page()).await;
        cache
            .set(&CacheKey::unread_count(2), CacheValue::UnreadCount(0))
            .await;

        sync.apply(1, notification(1, "A")).await;

        assert!(cache.listing(&other_list).await.unwrap().is_empty());
        assert_eq!(cache.unread_count(2).await, Some(0));
        assert_eq!(
            cache.entry(&other_list).await.unwrap().status,
            EntryStatus::Fresh
        );
    }

    #[tokio::test]
    async fn test_event_for_former_user_is_discarded() {
        let (auth, cache, mut sync) = setup(1).await;
        let list = CacheKey::notifications(1, NotificationFilter::default());
        cache.set(&list, empty_page()).await;

        auth.login(2, "other-token");
        let outcome = sync.apply(1, notification(1, "A")).await;

        assert_eq!(outcome, ApplyOutcome::StaleUser);
        assert!(cache.listing(&list).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_and_unrelated_entries_untouched() {
        let (_auth, cache, mut sync) = setup(1).await;
        let settings = CacheKey::settings(1);
        let jobs = CacheKey::other("jobs", 1);
        let settings_value = CacheValue::Settings(NotificationSettings {
            email_enabled: true,
            push_enabled: false,
            muted_types: vec![],
        });
        cache.set(&settings, settings_value.clone()).await;
        cache
            .set(&jobs, CacheValue::Json(serde_json::json!([1, 2])))
            .await;

        sync.apply(1, notification(1, "A")).await;

        assert_eq!(cache.get(&settings).await, Some(settings_value));
        assert_eq!(cache.entry(&settings).await.unwrap().status, EntryStatus::Fresh);
        assert_eq!(cache.entry(&jobs).await.unwrap().status, EntryStatus::Fresh);
    }

    #[tokio::test]
    async fn test_rejecting_filters_are_only_marked_stale() {
        let (_auth, cache, mut sync) = setup(1).await;
        let unread = CacheKey::notifications(1, NotificationFilter::unread_only());
        let errors = CacheKey::notifications(1, NotificationFilter::of_type(NotificationType::Error));
        cache.set(&unread, empty_page()).await;
        cache.set(&errors, empty_page()).await;

        let outcome = sync.apply(1, notification(1, "info item")).await;

        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                lists_updated: 1,
                counter_incremented: false
            }
        );
        assert_eq!(cache.listing(&unread).await.unwrap().ids(), vec![1]);
        assert!(cache.listing(&errors).await.unwrap().is_empty());
        assert_eq!(cache.entry(&errors).await.unwrap().status, EntryStatus::Stale);
        assert_eq!(cache.entry(&unread).await.unwrap().status, EntryStatus::Stale);
    }

    #[tokio::test]
    async fn test_refresh_request_lists_user_views() {
        let auth = AuthState::new();
        auth.login(1, "token");
        let cache = Arc::new(QueryCache::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sync = CacheSynchronizer::new(cache.clone(), auth.subscribe(), Some(tx));
        let list = CacheKey::notifications(1, NotificationFilter::default());
        cache.set(&list, empty_page()).await;
        cache
            .set(&CacheKey::unread_count(1), CacheValue::UnreadCount(0))
            .await;

        sync.apply(1, notification(1, "A")).await;

        let request = rx.try_recv().unwrap();
        assert_eq!(request.user_id, 1);
        assert_eq!(request.keys, vec![list]);
    }

    #[tokio::test]
    async fn test_recent_ids_are_kept_for_current_user_only() {
        let (auth, _cache, mut sync) = setup(1).await;
        sync.apply(1, notification(1, "A")).await;
        assert!(sync.recent.contains_key(&1));

        auth.login(2, "other-token");
        sync.apply(2, notification(5, "B")).await;

        assert_eq!(sync.recent.keys().copied().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_recent_ids_are_bounded() {
        let mut recent = RecentIds::default();
        for id in 0..(RECENT_IDS_CAPACITY as u64 + 10) {
            recent.remember(id);
        }
        assert_eq!(recent.order.len(), RECENT_IDS_CAPACITY);
        assert!(!recent.contains(0));
        assert!(recent.contains(RECENT_IDS_CAPACITY as u64 + 9));
    }
}
