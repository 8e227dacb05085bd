//! Plain-text rendering of a [`CartView`].

use crate::model::CartItem;
use crate::view_model::CartView;

/// Column width of the rendered cart.
pub const LINE_WIDTH: usize = 48;

fn money(value: f64) -> String {
    format!("{value:.2}")
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('~');
    out
}

/// Left text and right-aligned amount on one line.
fn columns(left: &str, right: &str) -> String {
    let room = LINE_WIDTH.saturating_sub(right.chars().count() + 1);
    let left = truncate(left, room);
    let pad = LINE_WIDTH.saturating_sub(left.chars().count() + right.chars().count());
    format!("{left}{}{right}", " ".repeat(pad.max(1)))
}

fn item_label(item: &CartItem) -> String {
    let name = if item.description.is_empty() {
        item.product_id.as_str()
    } else {
        item.description.as_str()
    };
    match item.brand.as_deref().filter(|b| !b.is_empty()) {
        Some(brand) => format!("{} x {name} ({brand})", item.quantity),
        None => format!("{} x {name}", item.quantity),
    }
}

pub fn render_text(view: &CartView) -> String {
    let mut out = Vec::new();
    out.push(columns(
        &format!("Cart [{}]", view.filter),
        &format!("{} of {} lines", view.items.len(), view.total_lines),
    ));
    out.push("-".repeat(LINE_WIDTH));

    if view.items.is_empty() {
        out.push("(empty)".to_string());
    }
    for item in &view.items {
        let marker = if view.pending.contains(&item.product_id) {
            '*'
        } else {
            ' '
        };
        out.push(columns(
            &format!("{marker} {}", item_label(item)),
            &money(item.line_total()),
        ));
        let mut detail = format!("    {}", item.modality);
        if item.line_savings() > 0.0 {
            detail.push_str(&format!(", on sale, save {}", money(item.line_savings())));
        }
        out.push(detail);
    }

    out.push("-".repeat(LINE_WIDTH));
    out.push(columns("Items", &view.totals.item_count.to_string()));
    out.push(columns("Subtotal", &money(view.totals.subtotal)));
    if view.totals.savings > 0.0 {
        out.push(columns("You save", &money(view.totals.savings)));
    }
    out.push(columns("Total", &money(view.totals.total)));
    if !view.pending.is_empty() {
        out.push("* awaiting server confirmation".to_string());
    }
    out.join("\n")
}
