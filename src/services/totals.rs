//! Cart totals and tender classification.
//!
//! Every line component is rounded to cents before it is summed, so the grand
//! total is always the exact sum of its lines. Split slices are validated
//! against that total in integer cents.

use crate::errors::ServiceError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One line of the cart as captured at checkout time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CartLine {
    pub sku: String,
    #[serde(default)]
    pub title: String,
    #[schema(value_type = String, example = "19.99")]
    pub unit_price: Decimal,
    pub quantity: u32,
    /// Absolute per-line discount; clamped to the line's gross
    #[serde(default)]
    #[schema(value_type = String, example = "0.00")]
    pub discount: Decimal,
    #[serde(default = "default_taxable")]
    pub taxable: bool,
}

fn default_taxable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TotalsCents {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

impl Totals {
    pub fn cents(&self) -> Result<TotalsCents, ServiceError> {
        Ok(TotalsCents {
            subtotal_cents: to_cents(self.subtotal)?,
            discount_cents: to_cents(self.discount)?,
            tax_cents: to_cents(self.tax)?,
            total_cents: to_cents(self.total)?,
        })
    }
}

pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

pub fn to_cents(value: Decimal) -> Result<i64, ServiceError> {
    (round2(value) * Decimal::ONE_HUNDRED)
        .to_i64()
        .ok_or_else(|| ServiceError::ValidationError(format!("amount {} is out of range", value)))
}

pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, abs / 100, abs % 100)
}

/// Totals a cart with line-level rounding.
pub fn compute_totals(lines: &[CartLine], tax_rate: Decimal) -> Result<Totals, ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "cart must contain at least one line".to_string(),
        ));
    }
    if tax_rate < Decimal::ZERO {
        return Err(ServiceError::ValidationError(
            "tax rate cannot be negative".to_string(),
        ));
    }

    let mut subtotal = Decimal::ZERO;
    let mut discount = Decimal::ZERO;
    let mut tax = Decimal::ZERO;

    for line in lines {
        if line.quantity == 0 {
            return Err(ServiceError::ValidationError(format!(
                "line {} has zero quantity",
                line.sku
            )));
        }
        if line.unit_price < Decimal::ZERO || line.discount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "line {} has a negative price or discount",
                line.sku
            )));
        }

        let gross = round2(line.unit_price * Decimal::from(line.quantity));
        let line_discount = round2(line.discount.min(gross));
        let line_tax = if line.taxable {
            round2((gross - line_discount) * tax_rate)
        } else {
            Decimal::ZERO
        };

        subtotal += gross;
        discount += line_discount;
        tax += line_tax;
    }

    Ok(Totals {
        subtotal,
        discount,
        tax,
        total: subtotal - discount + tax,
    })
}

/// Tender family parsed from a method string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenderKind {
    Cash,
    Wallet,
    Card { brand: Option<String> },
}

impl TenderKind {
    pub fn parse(method: &str) -> Result<Self, ServiceError> {
        let normalized = method.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cash" => Ok(TenderKind::Cash),
            "wallet" | "store_credit" | "store-credit" | "credit" => Ok(TenderKind::Wallet),
            "card" => Ok(TenderKind::Card { brand: None }),
            other => match other.strip_prefix("card:") {
                Some(brand) if !brand.trim().is_empty() => Ok(TenderKind::Card {
                    brand: Some(brand.trim().to_string()),
                }),
                _ => Err(ServiceError::ValidationError(format!(
                    "unsupported tender method '{}'",
                    method
                ))),
            },
        }
    }

    pub fn is_card(&self) -> bool {
        matches!(self, TenderKind::Card { .. })
    }

    pub fn label(&self) -> String {
        match self {
            TenderKind::Cash => "cash".to_string(),
            TenderKind::Wallet => "wallet".to_string(),
            TenderKind::Card { brand: None } => "card".to_string(),
            TenderKind::Card { brand: Some(b) } => format!("card:{}", b),
        }
    }
}

/// Caller-supplied split entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SplitPart {
    #[schema(example = "card:visa")]
    pub method: String,
    #[schema(value_type = String, example = "30.00")]
    pub amount: Decimal,
}

/// A priced tender portion. Card slices become terminal sessions in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SplitSlice {
    pub method: String,
    pub amount_cents: i64,
}

impl SplitSlice {
    pub fn is_card(&self) -> bool {
        TenderKind::parse(&self.method)
            .map(|kind| kind.is_card())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenderPlan {
    /// No card involved; the sale can be written right away
    Immediate { parts: Vec<SplitSlice> },
    /// One or more card slices must be approved at the terminal first
    Terminal {
        slices: Vec<SplitSlice>,
        parts: Vec<SplitSlice>,
    },
}

impl TenderPlan {
    pub fn parts(&self) -> &[SplitSlice] {
        match self {
            TenderPlan::Immediate { parts } | TenderPlan::Terminal { parts, .. } => parts,
        }
    }

    pub fn slices(&self) -> &[SplitSlice] {
        match self {
            TenderPlan::Immediate { .. } => &[],
            TenderPlan::Terminal { slices, .. } => slices,
        }
    }
}

fn is_split(tender: &str) -> bool {
    tender.trim().eq_ignore_ascii_case("split")
}

/// Decides whether the terminal is needed and, if so, which slices to charge.
pub fn classify(
    totals: &Totals,
    tender: &str,
    split: &[SplitPart],
) -> Result<TenderPlan, ServiceError> {
    let total_cents = to_cents(totals.total)?;

    if !is_split(tender) {
        if !split.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "split parts supplied for non-split tender '{}'",
                tender
            )));
        }
        let kind = TenderKind::parse(tender)?;
        let part = SplitSlice {
            method: kind.label(),
            amount_cents: total_cents,
        };
        return Ok(if kind.is_card() {
            TenderPlan::Terminal {
                slices: vec![part.clone()],
                parts: vec![part],
            }
        } else {
            TenderPlan::Immediate { parts: vec![part] }
        });
    }

    if split.is_empty() {
        return Err(ServiceError::ValidationError(
            "split tender requires at least one part".to_string(),
        ));
    }

    let mut parts = Vec::with_capacity(split.len());
    for part in split {
        if part.amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(format!(
                "split part '{}' must have a positive amount",
                part.method
            )));
        }
        if part.amount.normalize().scale() > 2 {
            return Err(ServiceError::ValidationError(format!(
                "split part '{}' has more than two decimal places",
                part.method
            )));
        }
        let kind = TenderKind::parse(&part.method)?;
        parts.push(SplitSlice {
            method: kind.label(),
            amount_cents: to_cents(part.amount)?,
        });
    }

    let sum: i64 = parts.iter().map(|p| p.amount_cents).sum();
    if sum != total_cents {
        return Err(ServiceError::ValidationError(format!(
            "split parts sum to {} cents but the sale total is {} cents",
            sum, total_cents
        )));
    }

    let slices: Vec<SplitSlice> = parts.iter().filter(|p| p.is_card()).cloned().collect();
    if slices.is_empty() {
        Ok(TenderPlan::Immediate { parts })
    } else {
        Ok(TenderPlan::Terminal { slices, parts })
    }
}

/// Human-readable tender line stored on the sale.
pub fn payment_description(tender: &str, parts: &[SplitSlice]) -> String {
    if is_split(tender) {
        let rendered: Vec<String> = parts
            .iter()
            .map(|p| format!("{} {}", p.method, format_cents(p.amount_cents)))
            .collect();
        format!("split({})", rendered.join(", "))
    } else {
        parts
            .first()
            .map(|p| p.method.clone())
            .unwrap_or_else(|| tender.trim().to_ascii_lowercase())
    }
}

/// Immutable record captured when a checkout starts. Reconciliation reads
/// only this, never live cart state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PosSnapshot {
    pub items: Vec<CartLine>,
    pub totals: TotalsCents,
    pub tender: String,
    pub payment_description: String,
    /// Card slices in charge order
    pub slices: Vec<SplitSlice>,
    /// Every tender part, card and non-card
    pub parts: Vec<SplitSlice>,
}

impl PosSnapshot {
    pub fn needs_terminal(&self) -> bool {
        !self.slices.is_empty()
    }

    pub fn slice(&self, index: usize) -> Option<&SplitSlice> {
        self.slices.get(index)
    }

    pub fn slice_count(&self) -> i32 {
        self.slices.len() as i32
    }

    pub fn to_json(&self) -> Result<serde_json::Value, ServiceError> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, ServiceError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Totals the cart, classifies the tender and captures the snapshot.
pub fn prepare_sale(
    items: Vec<CartLine>,
    tender: &str,
    split: &[SplitPart],
    tax_rate: Decimal,
) -> Result<PosSnapshot, ServiceError> {
    let totals = compute_totals(&items, tax_rate)?;
    let plan = classify(&totals, tender, split)?;
    let payment_description = payment_description(tender, plan.parts());

    Ok(PosSnapshot {
        items,
        totals: totals.cents()?,
        tender: tender.trim().to_ascii_lowercase(),
        payment_description,
        slices: plan.slices().to_vec(),
        parts: plan.parts().to_vec(),
    })
}
