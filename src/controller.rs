//! Cart sync controller.
//!
//! Bridges user intents to the cart API. Every mutation is applied to the
//! view model first (optimistic), then confirmed or rolled back once the
//! network call settles:
//!
//! - quantity changes are debounced per product and sent once, after a
//!   quiet period, with the last requested value; on failure the cart is
//!   re-fetched from the server
//! - modality flips are sent immediately in the background and reverted if
//!   the call fails
//! - removals are not optimistic: the line disappears only once the server
//!   confirms it
//!
//! Network calls for the same product are serialized through a per-key
//! lock, so at most one request per cart line is in flight at any time.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::CartApi;
use crate::config::CartSyncConfig;
use crate::db::{self, DbState};
use crate::debounce::Debouncer;
use crate::error::CartError;
use crate::import::{parse_manual_entries, ImportReport};
use crate::key_lock::KeyedLocks;
use crate::model::{
    clamp_quantity, AddItemRequest, CartItem, CartTotals, ClearScope, Modality, ModalityFilter,
    Mutation, MutationKind,
};
use crate::notice::{Notice, NoticeEmitter};
use crate::retry::{with_retry, RetryPolicy};
use crate::view_model::{CartChange, CartView, CartViewModel};

const AUTH_PROMPT: &str = "Please sign in to your grocery account before changing the cart";

// ---------------------------------------------------------------------------
// Pending mutations
// ---------------------------------------------------------------------------

/// Whether a cart line has an unconfirmed local change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Idle,
    OptimisticPending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub product_id: String,
    pub kind: MutationKind,
    pub desired: Mutation,
    pub seq: u64,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct PendingTable {
    next_seq: u64,
    entries: HashMap<(String, MutationKind), PendingMutation>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

struct Inner<A> {
    api: A,
    retry: RetryPolicy,
    debounce: Duration,
    model: Mutex<CartViewModel>,
    /// Last state the server acknowledged for each line; rollback target.
    confirmed: Mutex<HashMap<String, CartItem>>,
    pending: Mutex<PendingTable>,
    locks: KeyedLocks,
    debouncer: Debouncer,
    tracker: TaskTracker,
    notices: NoticeEmitter,
    db: DbState,
    authenticated: Mutex<Option<bool>>,
    last_synced: Mutex<Option<DateTime<Utc>>>,
}

/// Owns the cart session: constructed at session start, torn down by
/// [`CartSyncController::logout`]. Cloning shares the same session.
pub struct CartSyncController<A: CartApi> {
    inner: Arc<Inner<A>>,
}

impl<A: CartApi> Clone for CartSyncController<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_in_cart(product_id: &str) -> CartError {
    CartError::Validation(format!("Product {product_id} is not in the cart"))
}

impl<A: CartApi> CartSyncController<A> {
    /// Build a session over `api`, restoring the persisted filter and the
    /// last saved snapshot from `db`.
    pub fn new(api: A, config: &CartSyncConfig, db: DbState) -> Self {
        let (filter, snapshot) = {
            let conn = db.conn();
            let snapshot = db::load_snapshot(&conn).unwrap_or_else(|e| {
                warn!("Could not read saved cart snapshot: {e}");
                None
            });
            (db::load_filter(&conn), snapshot)
        };

        let mut model = CartViewModel::new(filter);
        let mut last_synced = None;
        if let Some((items, saved_at)) = snapshot {
            info!(items = items.len(), saved_at = %saved_at, "Restored saved cart snapshot");
            model.reconcile(items);
            last_synced = Some(saved_at);
        }
        if model.filter() != filter {
            if let Err(e) = db::save_filter(&db.conn(), model.filter()) {
                warn!("Could not persist cart filter: {e}");
            }
        }

        let confirmed = model
            .items()
            .iter()
            .map(|i| (i.product_id.clone(), i.clone()))
            .collect();
        let tracker = TaskTracker::new();
        Self {
            inner: Arc::new(Inner {
                api,
                retry: config.retry,
                debounce: config.debounce(),
                model: Mutex::new(model),
                confirmed: Mutex::new(confirmed),
                pending: Mutex::new(PendingTable::default()),
                locks: KeyedLocks::new(),
                debouncer: Debouncer::new(tracker.clone()),
                tracker,
                notices: NoticeEmitter::new(),
                db,
                authenticated: Mutex::new(None),
                last_synced: Mutex::new(last_synced),
            }),
        }
    }

    pub fn api(&self) -> &A {
        &self.inner.api
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CartChange> {
        lock(&self.inner.model).subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_synced)
    }

    /// Wait until every scheduled and background mutation has settled.
    pub async fn settle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    // -----------------------------------------------------------------------
    // Model access
    // -----------------------------------------------------------------------

    /// Run `f` against the view model and persist the filter if `f` (or the
    /// auto-reset it triggered) changed it.
    fn with_model<R>(&self, f: impl FnOnce(&mut CartViewModel) -> R) -> R {
        let (result, changed_filter) = {
            let mut model = lock(&self.inner.model);
            let before = model.filter();
            let result = f(&mut model);
            let after = model.filter();
            (result, (before != after).then_some(after))
        };
        if let Some(filter) = changed_filter {
            if let Err(e) = db::save_filter(&self.inner.db.conn(), filter) {
                warn!("Could not persist cart filter: {e}");
            }
        }
        result
    }

    fn save_snapshot(&self) {
        let items = lock(&self.inner.model).items().to_vec();
        if let Err(e) = db::save_snapshot(&self.inner.db.conn(), &items) {
            warn!("Could not persist cart snapshot: {e}");
        }
    }

    fn confirm_all(&self, items: &[CartItem]) {
        *lock(&self.inner.confirmed) = items
            .iter()
            .map(|i| (i.product_id.clone(), i.clone()))
            .collect();
    }

    fn confirm_line(&self, product_id: &str, update: impl FnOnce(&mut CartItem)) {
        if let Some(line) = lock(&self.inner.confirmed).get_mut(product_id) {
            update(line);
        }
    }

    /// Record the model's current line as server state.
    fn confirm_from_model(&self, product_id: &str) {
        let line = lock(&self.inner.model).get(product_id).cloned();
        let mut confirmed = lock(&self.inner.confirmed);
        match line {
            Some(line) => confirmed.insert(product_id.to_string(), line),
            None => confirmed.remove(product_id),
        };
    }

    fn confirmed(&self, product_id: &str) -> Option<CartItem> {
        lock(&self.inner.confirmed).get(product_id).cloned()
    }

    pub fn item(&self, product_id: &str) -> Option<CartItem> {
        lock(&self.inner.model).get(product_id).cloned()
    }

    pub fn items(&self) -> Vec<CartItem> {
        lock(&self.inner.model).items().to_vec()
    }

    pub fn filter(&self) -> ModalityFilter {
        lock(&self.inner.model).filter()
    }

    /// Select the modality filter. Returns the filter actually in effect,
    /// which is ALL when the requested one would hide every item.
    pub fn set_filter(&self, filter: ModalityFilter) -> ModalityFilter {
        self.with_model(|m| {
            m.set_filter(filter);
            m.filter()
        })
    }

    pub fn totals(&self, filter: ModalityFilter) -> CartTotals {
        lock(&self.inner.model).compute_totals(filter)
    }

    pub fn view(&self) -> CartView {
        let pending = self.pending_ids();
        lock(&self.inner.model).view(pending)
    }

    // -----------------------------------------------------------------------
    // Pending bookkeeping
    // -----------------------------------------------------------------------

    fn begin_pending(&self, product_id: &str, desired: Mutation) -> u64 {
        let mut table = lock(&self.inner.pending);
        table.next_seq += 1;
        let seq = table.next_seq;
        let kind = desired.kind();
        table.entries.insert(
            (product_id.to_string(), kind),
            PendingMutation {
                product_id: product_id.to_string(),
                kind,
                desired,
                seq,
                started_at: Utc::now(),
            },
        );
        seq
    }

    /// Clear a pending entry unless a newer intent of the same kind replaced it.
    fn resolve_pending(&self, product_id: &str, kind: MutationKind, seq: u64) {
        let mut table = lock(&self.inner.pending);
        let key = (product_id.to_string(), kind);
        if table.entries.get(&key).is_some_and(|p| p.seq == seq) {
            table.entries.remove(&key);
        }
    }

    fn is_latest(&self, product_id: &str, kind: MutationKind, seq: u64) -> bool {
        lock(&self.inner.pending)
            .entries
            .get(&(product_id.to_string(), kind))
            .is_some_and(|p| p.seq == seq)
    }

    fn drop_pending_for(&self, product_id: &str) {
        lock(&self.inner.pending)
            .entries
            .retain(|(id, _), _| id != product_id);
    }

    pub fn mutation_state(&self, product_id: &str) -> MutationState {
        let table = lock(&self.inner.pending);
        if table.entries.keys().any(|(id, _)| id == product_id) {
            MutationState::OptimisticPending
        } else {
            MutationState::Idle
        }
    }

    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        let mut pending: Vec<PendingMutation> =
            lock(&self.inner.pending).entries.values().cloned().collect();
        pending.sort_by_key(|p| p.seq);
        pending
    }

    fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.pending)
            .entries
            .keys()
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    // -----------------------------------------------------------------------
    // Auth gate
    // -----------------------------------------------------------------------

    /// Ask the auth collaborator whether the user is signed in.
    pub async fn refresh_auth(&self) -> Result<bool, CartError> {
        let authenticated = self.inner.api.auth_status().await?;
        *lock(&self.inner.authenticated) = Some(authenticated);
        Ok(authenticated)
    }

    async fn require_auth(&self) -> Result<(), CartError> {
        let cached = *lock(&self.inner.authenticated);
        let authenticated = match cached {
            Some(true) => true,
            _ => self.refresh_auth().await.map_err(|e| {
                self.inner
                    .notices
                    .error(format!("Could not check sign-in status: {e}"));
                e
            })?,
        };
        if authenticated {
            Ok(())
        } else {
            self.inner.notices.warning(AUTH_PROMPT);
            Err(CartError::AuthRequired)
        }
    }

    /// Surface a terminal failure to the user.
    fn report_failure(&self, context: &str, err: &CartError) {
        if err.is_auth_failure() {
            *lock(&self.inner.authenticated) = None;
            self.inner.notices.warning(AUTH_PROMPT);
            return;
        }
        self.inner.notices.error(format!("{context}: {err}"));
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    async fn reconcile_from_server(&self) -> Result<usize, CartError> {
        let api = &self.inner.api;
        let items = with_retry(&self.inner.retry, "view_cart", move || api.view_cart()).await?;
        let items = self.with_model(|m| {
            m.reconcile(items);
            m.items().to_vec()
        });
        let count = items.len();
        self.confirm_all(&items);
        self.save_snapshot();
        *lock(&self.inner.last_synced) = Some(Utc::now());
        info!(items = count, "Cart reconciled with server");
        Ok(count)
    }

    /// Replace local state with the server cart. Server data always wins
    /// over unconfirmed local changes.
    pub async fn fetch_remote_cart(&self) -> Result<usize, CartError> {
        self.reconcile_from_server().await.map_err(|e| {
            self.report_failure("Could not load your cart", &e);
            e
        })
    }

    /// Put still-pending optimistic intents back on top of fresh server data.
    fn reapply_pending(&self) {
        let pending = self.pending_mutations();
        self.with_model(|m| {
            for p in &pending {
                if matches!(p.desired, Mutation::SetQuantity(_) | Mutation::SetModality(_)) {
                    m.apply_optimistic(&p.product_id, &p.desired);
                }
            }
        });
    }

    /// Re-fetch server truth after a failed mutation. When the fetch fails
    /// too, `rollback` undoes the optimistic change locally.
    async fn restore_after_failure(&self, rollback: impl FnOnce(&mut CartViewModel) + Send) {
        match self.reconcile_from_server().await {
            Ok(_) => self.reapply_pending(),
            Err(e) => {
                warn!("Reconciliation after failed mutation also failed: {e}");
                self.with_model(rollback);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Add
    // -----------------------------------------------------------------------

    pub async fn add_item(
        &self,
        product_id: &str,
        quantity: i64,
        modality: Modality,
    ) -> Result<(), CartError> {
        let product_id = product_id.trim();
        if product_id.is_empty() {
            return Err(CartError::Validation("Product id is required".into()));
        }
        self.require_auth().await?;

        let request = AddItemRequest {
            product_id: product_id.to_string(),
            quantity: clamp_quantity(quantity),
            modality,
        };
        let local_line = CartItem::new(product_id, request.quantity, modality);
        let seq = self.begin_pending(product_id, Mutation::Add(local_line.clone()));

        let result = {
            let _guard = self.inner.locks.lock(product_id).await;
            let api = &self.inner.api;
            let request = &request;
            with_retry(&self.inner.retry, "add_item", move || api.add_item(request)).await
        };
        self.resolve_pending(product_id, MutationKind::Add, seq);

        match result {
            Ok(()) => {
                info!(product_id, quantity = request.quantity, %modality, "Item added to cart");
                if let Err(e) = self.reconcile_from_server().await {
                    debug!("Falling back to local merge after add: {e}");
                    self.with_model(|m| {
                        m.apply_optimistic(product_id, &Mutation::Add(local_line));
                    });
                    self.confirm_from_model(product_id);
                    self.save_snapshot();
                }
                self.inner
                    .notices
                    .success(format!("Added {} item(s) to cart", request.quantity));
                Ok(())
            }
            Err(e) => {
                self.report_failure("Could not add item to cart", &e);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Quantity (debounced)
    // -----------------------------------------------------------------------

    /// Optimistically set a line's quantity and schedule the debounced
    /// update. Returns the clamped quantity now shown.
    pub async fn set_quantity(&self, product_id: &str, quantity: i64) -> Result<u32, CartError> {
        self.require_auth().await?;
        let quantity = clamp_quantity(quantity);

        let previous =
            self.with_model(|m| m.apply_optimistic(product_id, &Mutation::SetQuantity(quantity)));
        if previous.is_none() {
            return Err(not_in_cart(product_id));
        }
        let seq = self.begin_pending(product_id, Mutation::SetQuantity(quantity));

        let controller = self.clone();
        let key = product_id.to_string();
        self.inner
            .debouncer
            .schedule(product_id, self.inner.debounce, move || async move {
                controller.flush_quantity(&key, quantity, seq).await;
            });
        Ok(quantity)
    }

    async fn flush_quantity(&self, product_id: &str, quantity: u32, seq: u64) {
        // Held through recovery so a queued call for this line cannot
        // interleave with the reconcile.
        let _guard = self.inner.locks.lock(product_id).await;
        if !self.is_latest(product_id, MutationKind::SetQuantity, seq) {
            debug!(product_id, quantity, "Quantity intent superseded, not sending");
            return;
        }

        let api = &self.inner.api;
        let result = with_retry(&self.inner.retry, "update_quantity", move || {
            api.update_quantity(product_id, quantity)
        })
        .await;
        let latest = self.is_latest(product_id, MutationKind::SetQuantity, seq);
        self.resolve_pending(product_id, MutationKind::SetQuantity, seq);

        match result {
            Ok(()) => {
                debug!(product_id, quantity, "Quantity confirmed");
                self.confirm_line(product_id, |line| line.quantity = quantity);
                if latest {
                    self.with_model(|m| {
                        if m.get(product_id).is_some_and(|i| i.quantity != quantity) {
                            m.apply_optimistic(product_id, &Mutation::SetQuantity(quantity));
                        }
                    });
                }
                self.save_snapshot();
            }
            Err(e) => {
                warn!(product_id, quantity, error = %e, "Quantity update failed");
                self.report_failure("Could not update quantity", &e);
                if !latest {
                    return;
                }
                let confirmed = self.confirmed(product_id).map(|line| line.quantity);
                self.restore_after_failure(move |m| {
                    if let Some(previous) = confirmed {
                        m.revert_quantity(product_id, quantity, previous);
                    }
                })
                .await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Remove
    // -----------------------------------------------------------------------

    /// Remove a line. The line stays visible until the server confirms.
    pub async fn remove_item(&self, product_id: &str) -> Result<(), CartError> {
        self.require_auth().await?;
        if self.item(product_id).is_none() {
            return Err(not_in_cart(product_id));
        }
        let seq = self.begin_pending(product_id, Mutation::Remove);

        // Held until queued intents for this line are dropped.
        let _guard = self.inner.locks.lock(product_id).await;
        let api = &self.inner.api;
        let result = with_retry(&self.inner.retry, "remove_item", move || {
            api.remove_item(product_id)
        })
        .await;
        self.resolve_pending(product_id, MutationKind::Remove, seq);

        match result {
            Ok(()) => {
                // Queued intents for a removed line are moot.
                self.inner.debouncer.cancel(product_id);
                self.drop_pending_for(product_id);
                self.with_model(|m| m.apply_optimistic(product_id, &Mutation::Remove));
                lock(&self.inner.confirmed).remove(product_id);
                self.save_snapshot();
                info!(product_id, "Item removed from cart");
                self.inner.notices.success("Item removed from cart");
                Ok(())
            }
            Err(e) => {
                self.report_failure("Could not remove item", &e);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Modality
    // -----------------------------------------------------------------------

    /// Flip a line's fulfillment method now; the update is sent in the
    /// background and reverted if it fails.
    pub async fn set_modality(
        &self,
        product_id: &str,
        modality: Modality,
    ) -> Result<(), CartError> {
        self.require_auth().await?;
        let previous = self
            .item(product_id)
            .map(|i| i.modality)
            .ok_or_else(|| not_in_cart(product_id))?;
        if previous == modality {
            return Ok(());
        }

        self.with_model(|m| m.apply_optimistic(product_id, &Mutation::SetModality(modality)));
        let seq = self.begin_pending(product_id, Mutation::SetModality(modality));

        let controller = self.clone();
        let key = product_id.to_string();
        self.inner.tracker.spawn(async move {
            controller.flush_modality(&key, modality, previous, seq).await;
        });
        Ok(())
    }

    async fn flush_modality(
        &self,
        product_id: &str,
        modality: Modality,
        previous: Modality,
        seq: u64,
    ) {
        let _guard = self.inner.locks.lock(product_id).await;
        if !self.is_latest(product_id, MutationKind::SetModality, seq) {
            debug!(product_id, %modality, "Modality intent superseded, not sending");
            return;
        }

        let api = &self.inner.api;
        let result = with_retry(&self.inner.retry, "update_modality", move || {
            api.update_modality(product_id, modality)
        })
        .await;
        let latest = self.is_latest(product_id, MutationKind::SetModality, seq);
        self.resolve_pending(product_id, MutationKind::SetModality, seq);

        match result {
            Ok(()) => {
                debug!(product_id, %modality, "Modality confirmed");
                self.confirm_line(product_id, |line| line.modality = modality);
                if latest {
                    self.with_model(|m| {
                        if m.get(product_id).is_some_and(|i| i.modality != modality) {
                            m.apply_optimistic(product_id, &Mutation::SetModality(modality));
                        }
                    });
                }
                self.save_snapshot();
            }
            Err(e) => {
                let target = self.confirmed(product_id).map_or(previous, |line| line.modality);
                let reverted = latest
                    && self.with_model(|m| m.revert_modality(product_id, modality, target));
                warn!(
                    product_id,
                    %modality,
                    %target,
                    reverted,
                    error = %e,
                    "Modality update failed"
                );
                self.report_failure("Could not change pickup/delivery", &e);
            }
        }
    }

    /// Switch every line to `modality`. Returns how many lines changed.
    pub async fn set_all_modality(&self, modality: Modality) -> Result<usize, CartError> {
        self.require_auth().await?;

        let previous: Vec<(String, Modality)> = self.with_model(|m| {
            let previous: Vec<(String, Modality)> = m
                .items()
                .iter()
                .filter(|i| i.modality != modality)
                .map(|i| (i.product_id.clone(), i.modality))
                .collect();
            for (id, _) in &previous {
                m.apply_optimistic(id, &Mutation::SetModality(modality));
            }
            previous
        });
        if previous.is_empty() {
            return Ok(0);
        }
        let seqs: Vec<u64> = previous
            .iter()
            .map(|(id, _)| self.begin_pending(id, Mutation::SetModality(modality)))
            .collect();

        let result = {
            let _guards = self
                .inner
                .locks
                .lock_many(previous.iter().map(|(id, _)| id.as_str()))
                .await;
            let api = &self.inner.api;
            with_retry(&self.inner.retry, "update_all_modality", move || {
                api.update_all_modality(modality)
            })
            .await
        };
        for ((id, _), seq) in previous.iter().zip(seqs) {
            self.resolve_pending(id, MutationKind::SetModality, seq);
        }

        match result {
            Ok(()) => {
                for (id, _) in &previous {
                    self.confirm_line(id, |line| line.modality = modality);
                }
                self.save_snapshot();
                let changed = previous.len();
                info!(changed, %modality, "All items switched");
                self.inner
                    .notices
                    .success(format!("Updated {changed} item(s) to {modality}"));
                Ok(changed)
            }
            Err(e) => {
                let targets: Vec<(String, Modality)> = previous
                    .iter()
                    .map(|(id, prior)| {
                        let target = self.confirmed(id).map_or(*prior, |line| line.modality);
                        (id.clone(), target)
                    })
                    .collect();
                self.with_model(|m| {
                    for (id, target) in &targets {
                        m.revert_modality(id, modality, *target);
                    }
                });
                self.report_failure("Could not change pickup/delivery", &e);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Clear / import / logout
    // -----------------------------------------------------------------------

    /// `Remote` empties the retailer cart too and needs explicit
    /// confirmation; `LocalOnly` only forgets the local tracking snapshot.
    pub async fn clear_cart(&self, scope: ClearScope, confirmed: bool) -> Result<(), CartError> {
        if scope == ClearScope::Remote {
            if !confirmed {
                return Err(CartError::Validation(
                    "Clearing the retailer cart must be confirmed".into(),
                ));
            }
            self.require_auth().await?;
        }

        let cancelled = self.inner.debouncer.cancel_all();
        let api = &self.inner.api;
        let result = with_retry(&self.inner.retry, "clear_cart", move || api.clear(scope)).await;

        match result {
            Ok(()) => {
                lock(&self.inner.pending).entries.clear();
                lock(&self.inner.confirmed).clear();
                self.with_model(|m| m.clear());
                if let Err(e) = db::clear_snapshot(&self.inner.db.conn()) {
                    warn!("Could not clear saved cart snapshot: {e}");
                }
                info!(?scope, cancelled, "Cart cleared");
                self.inner.notices.success("Cart cleared");
                Ok(())
            }
            Err(e) => {
                self.report_failure("Could not clear cart", &e);
                if cancelled > 0 {
                    // Cancelled quantity intents never reached the server.
                    let dropped: Vec<(String, u32, Option<u32>)> = {
                        let mut table = lock(&self.inner.pending);
                        let dropped = table
                            .entries
                            .values()
                            .filter_map(|p| match p.desired {
                                Mutation::SetQuantity(q) => Some((p.product_id.clone(), q)),
                                _ => None,
                            })
                            .collect::<Vec<_>>();
                        table
                            .entries
                            .retain(|(_, kind), _| *kind != MutationKind::SetQuantity);
                        dropped
                    }
                    .into_iter()
                    .map(|(id, q)| {
                        let confirmed = self.confirmed(&id).map(|line| line.quantity);
                        (id, q, confirmed)
                    })
                    .collect();
                    self.restore_after_failure(move |m| {
                        for (id, attempted, confirmed) in &dropped {
                            if let Some(previous) = confirmed {
                                m.revert_quantity(id, *attempted, *previous);
                            }
                        }
                    })
                    .await;
                }
                Err(e)
            }
        }
    }

    /// Import manual cart entry lines. Malformed lines are reported in the
    /// returned report and do not stop the valid ones.
    pub async fn import_items(&self, text: &str) -> Result<ImportReport, CartError> {
        let parsed = parse_manual_entries(text);
        if !parsed.rejected.is_empty() {
            for rejected in &parsed.rejected {
                warn!(line = rejected.line, reason = %rejected.reason, "Skipping cart entry line");
            }
            let lines: Vec<String> = parsed
                .rejected
                .iter()
                .map(|r| format!("line {}: {}", r.line, r.reason))
                .collect();
            self.inner.notices.warning(format!(
                "Skipped {} invalid line(s) ({})",
                lines.len(),
                lines.join("; ")
            ));
        }
        if parsed.items.is_empty() {
            return Ok(ImportReport {
                imported: 0,
                rejected: parsed.rejected,
            });
        }

        self.require_auth().await?;
        let api = &self.inner.api;
        let items = &parsed.items;
        let result =
            with_retry(&self.inner.retry, "import_items", move || api.import_items(items)).await;
        if let Err(e) = result {
            self.report_failure("Could not import items", &e);
            return Err(e);
        }

        if let Err(e) = self.reconcile_from_server().await {
            debug!("Falling back to local merge after import: {e}");
            self.with_model(|m| {
                for item in &parsed.items {
                    let line = CartItem::new(item.product_id.clone(), item.quantity, item.modality);
                    m.apply_optimistic(&item.product_id, &Mutation::Add(line));
                }
            });
            for item in &parsed.items {
                self.confirm_from_model(&item.product_id);
            }
            self.save_snapshot();
        }

        let imported = parsed.items.len();
        info!(imported, rejected = parsed.rejected.len(), "Cart entries imported");
        self.inner
            .notices
            .success(format!("Successfully imported {imported} item(s)"));
        Ok(ImportReport {
            imported,
            rejected: parsed.rejected,
        })
    }

    /// Tear down the session: drop unsent intents, forget the local cart
    /// and the cached sign-in state. The retailer cart is not touched.
    pub fn logout(&self) {
        let cancelled = self.inner.debouncer.cancel_all();
        lock(&self.inner.pending).entries.clear();
        lock(&self.inner.confirmed).clear();
        self.with_model(|m| m.clear());
        if let Err(e) = db::clear_snapshot(&self.inner.db.conn()) {
            warn!("Could not clear saved cart snapshot: {e}");
        }
        *lock(&self.inner.authenticated) = None;
        *lock(&self.inner.last_synced) = None;
        info!(cancelled, "Cart session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Pricing;
    use crate::notice::NoticeLevel;
    use crate::test_support::{priced_item, ApiCall, FakeCartApi, Op};
    use reqwest::StatusCode;

    fn controller(api: FakeCartApi) -> CartSyncController<FakeCartApi> {
        let db = db::init_in_memory().expect("db");
        CartSyncController::new(api, &CartSyncConfig::default(), db)
    }

    fn two_item_server() -> Vec<CartItem> {
        vec![
            priced_item("milk", "Whole Milk", 1, Modality::Pickup, 3.49),
            priced_item("eggs", "Large Eggs", 2, Modality::Delivery, 4.99),
        ]
    }

    async fn loaded(api: FakeCartApi) -> CartSyncController<FakeCartApi> {
        let ctrl = controller(api);
        ctrl.fetch_remote_cart().await.expect("initial fetch");
        ctrl
    }

    fn drain_notices(rx: &mut broadcast::Receiver<Notice>) -> Vec<Notice> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_quantity_burst_sends_one_call_with_last_value() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;

        for qty in [2, 3, 4, 5] {
            ctrl.set_quantity("milk", qty).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(ctrl.item("milk").unwrap().quantity, 5);
        assert_eq!(ctrl.mutation_state("milk"), MutationState::OptimisticPending);

        ctrl.settle().await;
        let updates: Vec<ApiCall> = ctrl
            .api()
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ApiCall::UpdateQuantity(..)))
            .collect();
        assert_eq!(updates, vec![ApiCall::UpdateQuantity("milk".into(), 5)]);
        assert_eq!(ctrl.mutation_state("milk"), MutationState::Idle);
        assert_eq!(ctrl.api().server_items()[0].quantity, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quantity_is_clamped() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;

        assert_eq!(ctrl.set_quantity("milk", 150).await.unwrap(), 99);
        assert_eq!(ctrl.item("milk").unwrap().quantity, 99);
        ctrl.settle().await;

        assert_eq!(ctrl.set_quantity("milk", 0).await.unwrap(), 1);
        assert_eq!(ctrl.item("milk").unwrap().quantity, 1);
        ctrl.settle().await;

        let calls = ctrl.api().calls();
        assert!(calls.contains(&ApiCall::UpdateQuantity("milk".into(), 99)));
        assert!(calls.contains(&ApiCall::UpdateQuantity("milk".into(), 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_quantity_update_reconciles_and_notifies() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(
            Op::UpdateQuantity,
            CartError::http(StatusCode::SERVICE_UNAVAILABLE, "down"),
        );
        let ctrl = loaded(api).await;
        let mut notices = ctrl.subscribe_notices();

        ctrl.set_quantity("eggs", 6).await.unwrap();
        assert_eq!(ctrl.item("eggs").unwrap().quantity, 6);
        ctrl.settle().await;

        assert_eq!(ctrl.api().count(Op::UpdateQuantity), 3);
        assert_eq!(ctrl.item("eggs").unwrap().quantity, 2);
        let notices = drain_notices(&mut notices);
        assert!(notices.iter().any(|n| {
            n.level == NoticeLevel::Error && n.message.contains("Could not update quantity")
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_quantity_for_unknown_product_is_rejected() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        let err = ctrl.set_quantity("bread", 2).await.unwrap_err();
        assert!(matches!(err, CartError::Validation(_)));
        ctrl.settle().await;
        assert_eq!(ctrl.api().count(Op::UpdateQuantity), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modality_rolls_back_after_three_failures() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(Op::UpdateModality, CartError::Network("Connection reset".into()));
        let ctrl = loaded(api).await;
        let mut changes = ctrl.subscribe();

        ctrl.set_modality("milk", Modality::Delivery).await.unwrap();
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Delivery);

        ctrl.settle().await;
        assert_eq!(ctrl.api().count(Op::UpdateModality), 3);
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Pickup);
        assert_eq!(ctrl.mutation_state("milk"), MutationState::Idle);

        let mut saw_rollback = false;
        while let Ok(change) = changes.try_recv() {
            if change == (CartChange::RolledBack { product_id: "milk".into() }) {
                saw_rollback = true;
            }
        }
        assert!(saw_rollback);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modality_client_error_fails_fast_and_rolls_back() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(
            Op::UpdateModality,
            CartError::http(StatusCode::BAD_REQUEST, "bad modality"),
        );
        let ctrl = loaded(api).await;

        ctrl.set_modality("eggs", Modality::Pickup).await.unwrap();
        ctrl.settle().await;

        assert_eq!(ctrl.api().count(Op::UpdateModality), 1);
        assert_eq!(ctrl.item("eggs").unwrap().modality, Modality::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_modality_success_matches_server() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_next(Op::UpdateModality, 1, CartError::Network("blip".into()));
        let ctrl = loaded(api).await;

        ctrl.set_modality("milk", Modality::Delivery).await.unwrap();
        ctrl.settle().await;

        assert_eq!(ctrl.api().count(Op::UpdateModality), 2);
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Delivery);
        assert_eq!(ctrl.api().server_items()[0].modality, Modality::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_calls_never_overlap() {
        let api =
            FakeCartApi::new(true, two_item_server()).with_latency(Duration::from_millis(800));
        let ctrl = loaded(api).await;

        ctrl.set_quantity("milk", 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        // The quantity call is now in flight; the modality call must queue.
        ctrl.set_modality("milk", Modality::Delivery).await.unwrap();
        ctrl.set_quantity("milk", 4).await.unwrap();
        ctrl.settle().await;

        assert_eq!(ctrl.api().max_in_flight("milk"), 1);
        let server = ctrl.api().server_items();
        assert_eq!(server[0].quantity, 4);
        assert_eq!(server[0].modality, Modality::Delivery);
        assert_eq!(ctrl.item("milk").unwrap().quantity, 4);
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failed_modality_flips_end_on_server_value() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(Op::UpdateModality, CartError::Network("Connection reset".into()));
        let ctrl = loaded(api).await;
        let mut notices = ctrl.subscribe_notices();

        ctrl.set_modality("milk", Modality::Delivery).await.unwrap();
        ctrl.set_modality("milk", Modality::Pickup).await.unwrap();
        ctrl.settle().await;

        // Only the newest intent is sent.
        assert_eq!(ctrl.api().count(Op::UpdateModality), 3);
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Pickup);
        assert_eq!(ctrl.api().server_items()[0].modality, Modality::Pickup);
        assert_eq!(ctrl.mutation_state("milk"), MutationState::Idle);
        let errors = drain_notices(&mut notices)
            .into_iter()
            .filter(|n| n.level == NoticeLevel::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_modality_rolls_back_to_last_confirmed_value() {
        let api =
            FakeCartApi::new(true, two_item_server()).with_latency(Duration::from_millis(800));
        let ctrl = loaded(api).await;

        ctrl.set_modality("milk", Modality::Delivery).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctrl.set_modality("milk", Modality::Pickup).await.unwrap();
        // The first call lands at 800 ms; fail everything after it.
        tokio::time::sleep(Duration::from_millis(800)).await;
        ctrl.api().fail_always(
            Op::UpdateModality,
            CartError::http(StatusCode::BAD_REQUEST, "bad modality"),
        );
        ctrl.settle().await;

        assert_eq!(ctrl.api().count(Op::UpdateModality), 2);
        assert_eq!(ctrl.api().server_items()[0].modality, Modality::Delivery);
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_quantity_keeps_queued_modality() {
        let api =
            FakeCartApi::new(true, two_item_server()).with_latency(Duration::from_millis(800));
        api.fail_always(
            Op::UpdateQuantity,
            CartError::http(StatusCode::BAD_REQUEST, "bad quantity"),
        );
        let ctrl = loaded(api).await;

        ctrl.set_quantity("milk", 5).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        ctrl.set_modality("milk", Modality::Delivery).await.unwrap();
        ctrl.settle().await;

        let server = ctrl.api().server_items();
        let milk = ctrl.item("milk").unwrap();
        assert_eq!(server[0].modality, Modality::Delivery);
        assert_eq!(milk.modality, Modality::Delivery);
        assert_eq!(milk.quantity, server[0].quantity);
        assert_eq!(milk.quantity, 1);
        assert_eq!(ctrl.api().max_in_flight("milk"), 1);
        assert_eq!(ctrl.mutation_state("milk"), MutationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quantity_rolls_back_when_refetch_also_fails() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        ctrl.api().fail_always(
            Op::UpdateQuantity,
            CartError::http(StatusCode::SERVICE_UNAVAILABLE, "down"),
        );
        ctrl.api().fail_always(Op::ViewCart, CartError::Network("offline".into()));

        ctrl.set_quantity("eggs", 6).await.unwrap();
        ctrl.settle().await;

        assert_eq!(ctrl.item("eggs").unwrap().quantity, 2);
        assert_eq!(ctrl.api().server_items()[1].quantity, 2);
        assert_eq!(ctrl.mutation_state("eggs"), MutationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_clear_restores_cancelled_quantity() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(Op::Clear, CartError::http(StatusCode::FORBIDDEN, "locked"));
        let ctrl = loaded(api).await;
        let mut notices = ctrl.subscribe_notices();

        ctrl.set_quantity("milk", 7).await.unwrap();
        assert!(ctrl.clear_cart(ClearScope::Remote, true).await.is_err());
        ctrl.settle().await;

        assert_eq!(ctrl.api().count(Op::Clear), 1);
        assert_eq!(ctrl.api().count(Op::UpdateQuantity), 0);
        assert_eq!(ctrl.items().len(), 2);
        assert_eq!(ctrl.item("milk").unwrap().quantity, 1);
        assert_eq!(ctrl.mutation_state("milk"), MutationState::Idle);
        assert!(drain_notices(&mut notices)
            .iter()
            .any(|n| n.level == NoticeLevel::Error && n.message.contains("Could not clear cart")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_skips_queued_modality_update() {
        let api =
            FakeCartApi::new(true, two_item_server()).with_latency(Duration::from_millis(800));
        let ctrl = loaded(api).await;
        let mut notices = ctrl.subscribe_notices();

        ctrl.set_modality("eggs", Modality::Pickup).await.unwrap();
        ctrl.remove_item("eggs").await.unwrap();
        ctrl.settle().await;

        assert!(ctrl.item("eggs").is_none());
        assert_eq!(ctrl.api().server_items().len(), 1);
        assert_eq!(ctrl.api().count(Op::UpdateModality), 0);
        assert!(drain_notices(&mut notices)
            .iter()
            .all(|n| n.level != NoticeLevel::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_failure_keeps_item() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(Op::Remove, CartError::http(StatusCode::BAD_GATEWAY, "gateway"));
        let ctrl = loaded(api).await;
        let mut notices = ctrl.subscribe_notices();

        let err = ctrl.remove_item("eggs").await.unwrap_err();
        assert!(matches!(err, CartError::Http { status: 502, .. }));
        assert_eq!(ctrl.api().count(Op::Remove), 3);
        assert!(ctrl.item("eggs").is_some());
        assert_eq!(ctrl.mutation_state("eggs"), MutationState::Idle);
        assert!(drain_notices(&mut notices)
            .iter()
            .any(|n| n.level == NoticeLevel::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_success_drops_line_and_pending_quantity() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;

        ctrl.set_quantity("eggs", 7).await.unwrap();
        ctrl.remove_item("eggs").await.unwrap();
        ctrl.settle().await;

        assert!(ctrl.item("eggs").is_none());
        assert_eq!(ctrl.api().count(Op::UpdateQuantity), 0);
        assert_eq!(ctrl.mutation_state("eggs"), MutationState::Idle);
        assert_eq!(ctrl.api().server_items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_requires_authentication() {
        let ctrl = controller(FakeCartApi::new(false, Vec::new()));
        let mut notices = ctrl.subscribe_notices();

        let err = ctrl.add_item("milk", 1, Modality::Pickup).await.unwrap_err();
        assert_eq!(err, CartError::AuthRequired);
        assert_eq!(ctrl.api().count(Op::Add), 0);
        let notices = drain_notices(&mut notices);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Warning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_status_is_cached_once_signed_in() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        ctrl.set_quantity("milk", 2).await.unwrap();
        ctrl.set_quantity("milk", 3).await.unwrap();
        ctrl.settle().await;
        assert_eq!(ctrl.api().count(Op::AuthStatus), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_mid_session_clears_cache() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_next(Op::Remove, 1, CartError::AuthRequired);
        let ctrl = loaded(api).await;

        assert_eq!(ctrl.remove_item("milk").await.unwrap_err(), CartError::AuthRequired);
        ctrl.api().set_authenticated(false);
        assert_eq!(ctrl.remove_item("milk").await.unwrap_err(), CartError::AuthRequired);
        assert_eq!(ctrl.api().count(Op::Remove), 1);
        assert_eq!(ctrl.api().count(Op::AuthStatus), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_reconciles_with_server() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;

        ctrl.add_item("bread", 150, Modality::Delivery).await.unwrap();
        assert_eq!(
            ctrl.api().calls().iter().find(|c| matches!(c, ApiCall::Add(_))),
            Some(&ApiCall::Add(AddItemRequest {
                product_id: "bread".into(),
                quantity: 99,
                modality: Modality::Delivery,
            }))
        );
        let bread = ctrl.item("bread").unwrap();
        assert_eq!(bread.quantity, 99);
        assert_eq!(bread.description, "Product bread");
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_failure_leaves_cart_untouched() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(Op::Add, CartError::http(StatusCode::BAD_REQUEST, "Invalid UPC"));
        let ctrl = loaded(api).await;

        assert!(ctrl.add_item("bread", 1, Modality::Pickup).await.is_err());
        assert_eq!(ctrl.api().count(Op::Add), 1);
        assert!(ctrl.item("bread").is_none());
        assert_eq!(ctrl.items().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_merges_locally_when_refetch_fails() {
        let api = FakeCartApi::new(true, two_item_server());
        let ctrl = loaded(api).await;
        ctrl.api().fail_always(Op::ViewCart, CartError::Network("offline".into()));

        ctrl.add_item("milk", 2, Modality::Pickup).await.unwrap();
        assert_eq!(ctrl.item("milk").unwrap().quantity, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_overrides_optimistic_state() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        ctrl.set_quantity("milk", 9).await.unwrap();

        ctrl.api()
            .set_server_items(vec![priced_item("milk", "Whole Milk", 4, Modality::Pickup, 3.49)]);
        ctrl.fetch_remote_cart().await.unwrap();
        assert_eq!(ctrl.item("milk").unwrap().quantity, 4);
        assert!(ctrl.item("eggs").is_none());
        assert!(ctrl.last_synced().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_resets_and_persists() {
        let api = FakeCartApi::new(
            true,
            vec![
                priced_item("a", "A", 1, Modality::Delivery, 1.0),
                priced_item("b", "B", 1, Modality::Delivery, 1.0),
            ],
        );
        let ctrl = loaded(api).await;

        assert_eq!(ctrl.set_filter(ModalityFilter::Pickup), ModalityFilter::All);
        let view = ctrl.view();
        assert_eq!(view.filter, ModalityFilter::All);
        assert_eq!(view.items.len(), 2);
        assert_eq!(db::load_filter(&ctrl.inner.db.conn()), ModalityFilter::All);

        assert_eq!(ctrl.set_filter(ModalityFilter::Delivery), ModalityFilter::Delivery);
        assert_eq!(db::load_filter(&ctrl.inner.db.conn()), ModalityFilter::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_totals_scenario() {
        let mut milk = priced_item("milk", "Milk", 2, Modality::Pickup, 5.00);
        milk.pricing = Pricing {
            regular_price: 5.00,
            sale_price: Some(4.00),
            on_sale: true,
        };
        let ctrl = loaded(FakeCartApi::new(true, vec![milk])).await;

        let totals = ctrl.totals(ModalityFilter::All);
        assert_eq!(totals.subtotal, 8.00);
        assert_eq!(totals.savings, 2.00);
        assert_eq!(totals.total, 8.00);
        assert_eq!(ctrl.totals(ModalityFilter::Delivery), CartTotals::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_clear_needs_confirmation() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;

        assert!(matches!(
            ctrl.clear_cart(ClearScope::Remote, false).await,
            Err(CartError::Validation(_))
        ));
        assert_eq!(ctrl.api().count(Op::Clear), 0);

        ctrl.clear_cart(ClearScope::Remote, true).await.unwrap();
        assert!(ctrl.items().is_empty());
        assert!(ctrl.api().server_items().is_empty());
        assert!(ctrl.api().calls().contains(&ApiCall::Clear(ClearScope::Remote)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_clear_keeps_retailer_cart() {
        let ctrl = loaded(FakeCartApi::new(false, two_item_server())).await;

        ctrl.clear_cart(ClearScope::LocalOnly, false).await.unwrap();
        assert!(ctrl.items().is_empty());
        assert_eq!(ctrl.api().server_items().len(), 2);
        assert!(ctrl.api().calls().contains(&ApiCall::Clear(ClearScope::LocalOnly)));
        assert_eq!(ctrl.api().count(Op::AuthStatus), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_all_modality_reverts_on_failure() {
        let api = FakeCartApi::new(true, two_item_server());
        api.fail_always(Op::UpdateAllModality, CartError::Rejected("busy".into()));
        let ctrl = loaded(api).await;

        assert!(ctrl.set_all_modality(Modality::Delivery).await.is_err());
        assert_eq!(ctrl.api().count(Op::UpdateAllModality), 3);
        assert_eq!(ctrl.item("milk").unwrap().modality, Modality::Pickup);
        assert_eq!(ctrl.item("eggs").unwrap().modality, Modality::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_all_modality_success() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        assert_eq!(ctrl.set_all_modality(Modality::Pickup).await.unwrap(), 1);
        assert!(ctrl.items().iter().all(|i| i.modality == Modality::Pickup));
        assert_eq!(ctrl.set_all_modality(Modality::Pickup).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_reports_bad_lines_and_imports_rest() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;

        let report = ctrl
            .import_items("bread,2\nbad,qty\njam,1,delivery\n")
            .await
            .unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].line, 2);
        assert!(ctrl.item("bread").is_some());
        assert_eq!(ctrl.item("jam").unwrap().modality, Modality::Delivery);
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_with_only_bad_lines_skips_network() {
        let ctrl = controller(FakeCartApi::new(true, Vec::new()));
        let report = ctrl.import_items(",1\nx,1,boat").await.unwrap();
        assert_eq!(report.imported, 0);
        assert_eq!(report.rejected.len(), 2);
        assert!(ctrl.api().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_pending_and_clears() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        ctrl.set_quantity("milk", 8).await.unwrap();

        ctrl.logout();
        ctrl.settle().await;

        assert!(ctrl.items().is_empty());
        assert_eq!(ctrl.api().count(Op::UpdateQuantity), 0);
        assert!(ctrl.pending_mutations().is_empty());
        assert!(db::load_snapshot(&ctrl.inner.db.conn()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restores_saved_snapshot_and_filter() {
        let db = db::init_in_memory().unwrap();
        {
            let conn = db.conn();
            db::save_snapshot(&conn, &two_item_server()).unwrap();
            db::save_filter(&conn, ModalityFilter::Delivery).unwrap();
        }
        let api = FakeCartApi::new(true, Vec::new());
        let ctrl = CartSyncController::new(api, &CartSyncConfig::default(), db);

        let view = ctrl.view();
        assert_eq!(view.filter, ModalityFilter::Delivery);
        assert_eq!(view.items.len(), 1);
        assert_eq!(view.total_lines, 2);
        assert!(ctrl.last_synced().is_some());
        assert!(ctrl.api().calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_lists_pending_lines() {
        let ctrl = loaded(FakeCartApi::new(true, two_item_server())).await;
        ctrl.set_quantity("eggs", 3).await.unwrap();
        assert_eq!(ctrl.view().pending, vec!["eggs".to_string()]);
        let pending = ctrl.pending_mutations();
        assert_eq!(pending[0].desired, Mutation::SetQuantity(3));
        ctrl.settle().await;
        assert!(ctrl.view().pending.is_empty());
    }
}
