//! Scripted in-memory cart service for controller tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::api::CartApi;
use crate::error::CartError;
use crate::model::{
    clamp_quantity, AddItemRequest, CartItem, ClearScope, Modality, Pricing, MAX_QUANTITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    AuthStatus,
    ViewCart,
    Add,
    Remove,
    UpdateQuantity,
    UpdateModality,
    UpdateAllModality,
    Clear,
    Import,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiCall {
    AuthStatus,
    ViewCart,
    Add(AddItemRequest),
    Remove(String),
    UpdateQuantity(String, u32),
    UpdateModality(String, Modality),
    UpdateAllModality(Modality),
    Clear(ClearScope),
    Import(Vec<AddItemRequest>),
}

impl ApiCall {
    fn op(&self) -> Op {
        match self {
            Self::AuthStatus => Op::AuthStatus,
            Self::ViewCart => Op::ViewCart,
            Self::Add(_) => Op::Add,
            Self::Remove(_) => Op::Remove,
            Self::UpdateQuantity(..) => Op::UpdateQuantity,
            Self::UpdateModality(..) => Op::UpdateModality,
            Self::UpdateAllModality(_) => Op::UpdateAllModality,
            Self::Clear(_) => Op::Clear,
            Self::Import(_) => Op::Import,
        }
    }
}

#[derive(Default)]
struct FakeState {
    authenticated: bool,
    items: Vec<CartItem>,
    calls: Vec<ApiCall>,
    scripted: HashMap<Op, VecDeque<CartError>>,
    always: HashMap<Op, CartError>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Cart service double. Successful mutations change its server-side items,
/// so a reconciliation fetch returns what a real server would.
#[derive(Default)]
pub struct FakeCartApi {
    state: Mutex<FakeState>,
    latency: Duration,
}

pub fn priced_item(
    id: &str,
    description: &str,
    quantity: u32,
    modality: Modality,
    regular: f64,
) -> CartItem {
    CartItem {
        product_id: id.to_string(),
        description: description.to_string(),
        brand: Some("Store Brand".to_string()),
        quantity,
        modality,
        pricing: Pricing {
            regular_price: regular,
            sale_price: None,
            on_sale: false,
        },
        images: Vec::new(),
    }
}

impl FakeCartApi {
    pub fn new(authenticated: bool, items: Vec<CartItem>) -> Self {
        Self {
            state: Mutex::new(FakeState {
                authenticated,
                items,
                ..FakeState::default()
            }),
            latency: Duration::ZERO,
        }
    }

    /// Every key-scoped mutation takes `latency` to complete.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next(&self, op: Op, times: usize, error: CartError) {
        let mut state = self.state();
        let queue = state.scripted.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn fail_always(&self, op: Op, error: CartError) {
        self.state().always.insert(op, error);
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.state().authenticated = authenticated;
    }

    pub fn set_server_items(&self, items: Vec<CartItem>) {
        self.state().items = items;
    }

    pub fn server_items(&self) -> Vec<CartItem> {
        self.state().items.clone()
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.state().calls.iter().filter(|c| c.op() == op).count()
    }

    pub fn max_in_flight(&self, key: &str) -> usize {
        self.state().max_in_flight.get(key).copied().unwrap_or(0)
    }

    fn record(&self, call: ApiCall) -> Result<(), CartError> {
        let mut state = self.state();
        let op = call.op();
        state.calls.push(call);
        if let Some(err) = state.scripted.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        if let Some(err) = state.always.get(&op) {
            return Err(err.clone());
        }
        Ok(())
    }

    async fn in_flight(&self, key: &str) {
        {
            let mut state = self.state();
            let now = {
                let count = state.in_flight.entry(key.to_string()).or_insert(0);
                *count += 1;
                *count
            };
            let max = state.max_in_flight.entry(key.to_string()).or_insert(0);
            *max = (*max).max(now);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(count) = self.state().in_flight.get_mut(key) {
            *count -= 1;
        }
    }

    fn add_to_server(state: &mut FakeState, req: &AddItemRequest) {
        match state.items.iter_mut().find(|i| i.product_id == req.product_id) {
            Some(existing) => {
                existing.quantity = (existing.quantity + req.quantity).min(MAX_QUANTITY);
                existing.modality = req.modality;
            }
            None => state.items.push(priced_item(
                &req.product_id,
                &format!("Product {}", req.product_id),
                req.quantity,
                req.modality,
                1.0,
            )),
        }
    }

    fn not_found() -> CartError {
        CartError::Rejected("Item not found in cart".into())
    }
}

impl CartApi for FakeCartApi {
    async fn auth_status(&self) -> Result<bool, CartError> {
        self.record(ApiCall::AuthStatus)?;
        Ok(self.state().authenticated)
    }

    async fn view_cart(&self) -> Result<Vec<CartItem>, CartError> {
        self.record(ApiCall::ViewCart)?;
        Ok(self.server_items())
    }

    async fn add_item(&self, item: &AddItemRequest) -> Result<(), CartError> {
        self.in_flight(&item.product_id).await;
        self.record(ApiCall::Add(item.clone()))?;
        Self::add_to_server(&mut self.state(), item);
        Ok(())
    }

    async fn remove_item(&self, product_id: &str) -> Result<(), CartError> {
        self.in_flight(product_id).await;
        self.record(ApiCall::Remove(product_id.to_string()))?;
        let mut state = self.state();
        let before = state.items.len();
        state.items.retain(|i| i.product_id != product_id);
        if state.items.len() == before {
            return Err(Self::not_found());
        }
        Ok(())
    }

    async fn update_quantity(&self, product_id: &str, quantity: u32) -> Result<(), CartError> {
        self.in_flight(product_id).await;
        self.record(ApiCall::UpdateQuantity(product_id.to_string(), quantity))?;
        let mut state = self.state();
        let item = state
            .items
            .iter_mut()
            .find(|i| i.product_id == product_id)
            .ok_or_else(Self::not_found)?;
        item.quantity = clamp_quantity(i64::from(quantity));
        Ok(())
    }

    async fn update_modality(&self, product_id: &str, modality: Modality) -> Result<(), CartError> {
        self.in_flight(product_id).await;
        self.record(ApiCall::UpdateModality(product_id.to_string(), modality))?;
        let mut state = self.state();
        let item = state
            .items
            .iter_mut()
            .find(|i| i.product_id == product_id)
            .ok_or_else(Self::not_found)?;
        item.modality = modality;
        Ok(())
    }

    async fn update_all_modality(&self, modality: Modality) -> Result<(), CartError> {
        self.record(ApiCall::UpdateAllModality(modality))?;
        for item in self.state().items.iter_mut() {
            item.modality = modality;
        }
        Ok(())
    }

    async fn clear(&self, scope: ClearScope) -> Result<(), CartError> {
        self.record(ApiCall::Clear(scope))?;
        if scope == ClearScope::Remote {
            self.state().items.clear();
        }
        Ok(())
    }

    async fn import_items(&self, items: &[AddItemRequest]) -> Result<(), CartError> {
        self.record(ApiCall::Import(items.to_vec()))?;
        let mut state = self.state();
        for item in items {
            Self::add_to_server(&mut state, item);
        }
        Ok(())
    }
}
