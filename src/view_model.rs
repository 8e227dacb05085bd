//! Cart view model: the single owned copy of the cart snapshot.
//!
//! Only the sync controller writes to it. Every change is announced on a
//! broadcast channel so the render layer can subscribe once and redraw.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{
    clamp_quantity, round_cents, CartItem, CartTotals, Modality, ModalityFilter, Mutation,
    MAX_QUANTITY,
};

const CHANGE_CHANNEL_CAPACITY: usize = 128;

/// Change notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartChange {
    Reconciled { item_count: usize },
    ItemAdded { product_id: String },
    ItemUpdated { product_id: String },
    ItemRemoved { product_id: String },
    RolledBack { product_id: String },
    FilterChanged { filter: ModalityFilter },
    Cleared,
}

/// Render-ready projection of the cart.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub filter: ModalityFilter,
    pub items: Vec<CartItem>,
    pub totals: CartTotals,
    pub pending: Vec<String>,
    /// Number of lines in the whole cart, regardless of filter.
    pub total_lines: usize,
}

pub struct CartViewModel {
    items: Vec<CartItem>,
    filter: ModalityFilter,
    changes: broadcast::Sender<CartChange>,
}

impl Default for CartViewModel {
    fn default() -> Self {
        Self::new(ModalityFilter::All)
    }
}

impl CartViewModel {
    pub fn new(filter: ModalityFilter) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            items: Vec::new(),
            filter,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CartChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: CartChange) {
        let _ = self.changes.send(change);
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn get(&self, product_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|i| i.product_id == product_id)
    }

    fn position(&self, product_id: &str) -> Option<usize> {
        self.items.iter().position(|i| i.product_id == product_id)
    }

    /// Apply a local change ahead of server confirmation.
    ///
    /// Returns the line as it was before the change (`None` if it did not
    /// exist) so the caller can roll back.
    pub fn apply_optimistic(&mut self, product_id: &str, mutation: &Mutation) -> Option<CartItem> {
        let idx = self.position(product_id);
        let previous = idx.map(|i| self.items[i].clone());

        let change = match (mutation, idx) {
            (Mutation::SetQuantity(quantity), Some(i)) => {
                self.items[i].quantity = clamp_quantity(i64::from(*quantity));
                Some(CartChange::ItemUpdated {
                    product_id: product_id.to_string(),
                })
            }
            (Mutation::SetModality(modality), Some(i)) => {
                self.items[i].modality = *modality;
                Some(CartChange::ItemUpdated {
                    product_id: product_id.to_string(),
                })
            }
            (Mutation::Remove, Some(i)) => {
                self.items.remove(i);
                Some(CartChange::ItemRemoved {
                    product_id: product_id.to_string(),
                })
            }
            (Mutation::Add(item), Some(i)) => {
                let existing = &mut self.items[i];
                existing.quantity = (existing.quantity + item.quantity).min(MAX_QUANTITY);
                existing.modality = item.modality;
                Some(CartChange::ItemUpdated {
                    product_id: product_id.to_string(),
                })
            }
            (Mutation::Add(item), None) => {
                let mut item = item.clone();
                item.product_id = product_id.to_string();
                item.quantity = clamp_quantity(i64::from(item.quantity));
                self.items.push(item);
                Some(CartChange::ItemAdded {
                    product_id: product_id.to_string(),
                })
            }
            (_, None) => None,
        };

        if let Some(change) = change {
            debug!(product_id, kind = ?mutation.kind(), "optimistic update applied");
            self.emit(change);
            self.normalize_filter();
        }
        previous
    }

    /// Put back a quantity the server never accepted, but only if the line
    /// still shows the value that failed.
    pub fn revert_quantity(&mut self, product_id: &str, attempted: u32, previous: u32) -> bool {
        let Some(i) = self.position(product_id) else {
            return false;
        };
        if self.items[i].quantity != attempted || attempted == previous {
            return false;
        }
        self.items[i].quantity = clamp_quantity(i64::from(previous));
        self.emit(CartChange::RolledBack {
            product_id: product_id.to_string(),
        });
        true
    }

    /// Revert a modality flip, but only if nothing newer replaced it.
    pub fn revert_modality(
        &mut self,
        product_id: &str,
        attempted: Modality,
        previous: Modality,
    ) -> bool {
        let Some(i) = self.position(product_id) else {
            return false;
        };
        if self.items[i].modality != attempted {
            return false;
        }
        self.items[i].modality = previous;
        self.emit(CartChange::RolledBack {
            product_id: product_id.to_string(),
        });
        self.normalize_filter();
        true
    }

    /// Replace the local snapshot with authoritative server data.
    ///
    /// Duplicate product ids keep their first occurrence; quantities are
    /// clamped into range.
    pub fn reconcile(&mut self, server_items: Vec<CartItem>) {
        let mut items: Vec<CartItem> = Vec::with_capacity(server_items.len());
        for mut item in server_items {
            if items.iter().any(|i| i.product_id == item.product_id) {
                continue;
            }
            item.quantity = clamp_quantity(i64::from(item.quantity));
            items.push(item);
        }
        self.items = items;
        self.emit(CartChange::Reconciled {
            item_count: self.items.len(),
        });
        self.normalize_filter();
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.emit(CartChange::Cleared);
    }

    // -----------------------------------------------------------------------
    // Filter
    // -----------------------------------------------------------------------

    pub fn filter(&self) -> ModalityFilter {
        self.filter
    }

    pub fn set_filter(&mut self, filter: ModalityFilter) {
        if self.filter != filter {
            self.filter = filter;
            self.emit(CartChange::FilterChanged { filter });
        }
        self.normalize_filter();
    }

    /// Reset the filter to ALL when it would hide every item in a non-empty
    /// cart. Returns whether the filter changed.
    pub fn normalize_filter(&mut self) -> bool {
        if self.filter == ModalityFilter::All || self.items.is_empty() {
            return false;
        }
        let filter = self.filter;
        if self.items.iter().any(|i| filter.matches(i.modality)) {
            return false;
        }
        debug!(%filter, "filter hides every item, resetting to ALL");
        self.filter = ModalityFilter::All;
        self.emit(CartChange::FilterChanged {
            filter: ModalityFilter::All,
        });
        true
    }

    // -----------------------------------------------------------------------
    // Derived data
    // -----------------------------------------------------------------------

    pub fn visible_items(&self) -> Vec<CartItem> {
        let mut items: Vec<CartItem> = self
            .items
            .iter()
            .filter(|i| self.filter.matches(i.modality))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            a.description
                .to_lowercase()
                .cmp(&b.description.to_lowercase())
                .then_with(|| a.product_id.cmp(&b.product_id))
        });
        items
    }

    pub fn compute_totals(&self, filter: ModalityFilter) -> CartTotals {
        let mut totals = CartTotals::default();
        for item in self.items.iter().filter(|i| filter.matches(i.modality)) {
            totals.item_count += item.quantity;
            totals.subtotal += item.line_total();
            totals.savings += item.line_savings();
        }
        totals.subtotal = round_cents(totals.subtotal);
        totals.savings = round_cents(totals.savings);
        totals.total = totals.subtotal;
        totals
    }

    pub fn view(&self, pending: Vec<String>) -> CartView {
        CartView {
            filter: self.filter,
            items: self.visible_items(),
            totals: self.compute_totals(self.filter),
            pending,
            total_lines: self.items.len(),
        }
    }
}
