//! Cart data model: items, modality, pricing and the derived totals.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CartError;

/// Lowest quantity a cart line may hold. Removing is the only way to zero.
pub const MIN_QUANTITY: u32 = 1;
/// Highest quantity the retailer accepts for a single line.
pub const MAX_QUANTITY: u32 = 99;

/// Clamp a requested quantity into `[MIN_QUANTITY, MAX_QUANTITY]`.
pub fn clamp_quantity(requested: i64) -> u32 {
    requested.clamp(i64::from(MIN_QUANTITY), i64::from(MAX_QUANTITY)) as u32
}

/// Round a money amount to whole cents.
pub fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Modality
// ---------------------------------------------------------------------------

/// Fulfillment method for a cart line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    #[default]
    Pickup,
    Delivery,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pickup => "PICKUP",
            Self::Delivery => "DELIVERY",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = CartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PICKUP" => Ok(Self::Pickup),
            "DELIVERY" => Ok(Self::Delivery),
            other => Err(CartError::Validation(format!("Unknown modality: {other}"))),
        }
    }
}

/// View-only filter over the cart. Never sent to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModalityFilter {
    #[default]
    All,
    Pickup,
    Delivery,
}

impl ModalityFilter {
    pub fn matches(self, modality: Modality) -> bool {
        match self {
            Self::All => true,
            Self::Pickup => modality == Modality::Pickup,
            Self::Delivery => modality == Modality::Delivery,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Pickup => "PICKUP",
            Self::Delivery => "DELIVERY",
        }
    }
}

impl fmt::Display for ModalityFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModalityFilter {
    type Err = CartError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(Self::All),
            "PICKUP" => Ok(Self::Pickup),
            "DELIVERY" => Ok(Self::Delivery),
            other => Err(CartError::Validation(format!("Unknown filter: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Cart items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default, deserialize_with = "null_as_default")]
    pub regular_price: f64,
    #[serde(default)]
    pub sale_price: Option<f64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub on_sale: bool,
}

impl Pricing {
    /// Unit price actually charged: the sale price while on sale.
    pub fn effective_price(&self) -> f64 {
        match (self.on_sale, self.sale_price) {
            (true, Some(sale)) => sale,
            _ => self.regular_price,
        }
    }

    /// Per-unit discount; zero unless the item is on sale.
    pub fn unit_savings(&self) -> f64 {
        match (self.on_sale, self.sale_price) {
            (true, Some(sale)) => (self.regular_price - sale).max(0.0),
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductImage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub perspective: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(default)]
    pub brand: Option<String>,
    pub quantity: u32,
    #[serde(default)]
    pub modality: Modality,
    #[serde(default, deserialize_with = "null_as_default")]
    pub pricing: Pricing,
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<ProductImage>,
}

impl CartItem {
    /// Bare line for a product the server has not described yet.
    pub fn new(product_id: impl Into<String>, quantity: u32, modality: Modality) -> Self {
        Self {
            product_id: product_id.into(),
            description: String::new(),
            brand: None,
            quantity: quantity.clamp(MIN_QUANTITY, MAX_QUANTITY),
            modality,
            pricing: Pricing::default(),
            images: Vec::new(),
        }
    }

    pub fn line_total(&self) -> f64 {
        self.pricing.effective_price() * f64::from(self.quantity)
    }

    pub fn line_savings(&self) -> f64 {
        self.pricing.unit_savings() * f64::from(self.quantity)
    }
}

// ---------------------------------------------------------------------------
// Totals
// ---------------------------------------------------------------------------

/// Aggregates over the items matching a filter.
///
/// `subtotal` is already priced at sale prices, so `total == subtotal` and
/// `savings` is informational (what the sale prices saved against regular).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CartTotals {
    pub item_count: u32,
    pub subtotal: f64,
    pub savings: f64,
    pub total: f64,
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    SetQuantity,
    Remove,
    SetModality,
    Add,
}

/// A local change applied ahead of server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    SetQuantity(u32),
    Remove,
    SetModality(Modality),
    Add(CartItem),
}

impl Mutation {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::SetQuantity(_) => MutationKind::SetQuantity,
            Self::Remove => MutationKind::Remove,
            Self::SetModality(_) => MutationKind::SetModality,
            Self::Add(_) => MutationKind::Add,
        }
    }
}

/// Where a clear applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClearScope {
    /// Clear the retailer cart and the local snapshot.
    Remote,
    /// Forget the local tracking snapshot; the retailer cart is untouched.
    LocalOnly,
}

/// One line of a cart add/import request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub modality: Modality,
}
