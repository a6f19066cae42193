use std::str::FromStr;

use axum::http::StatusCode;
use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use rentflow_core::{DomainError, ItemId, LocationId, TransactionId, UnitId};
use rentflow_infra::{BookingRequest, PaymentInput};
use rentflow_rental::{ExtraCharge, RatePeriod, UnitReturn};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct OnboardUnitRequest {
    /// Generated when omitted.
    pub unit_id: Option<String>,
    pub item_id: String,
    pub location_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    /// A new transaction is opened when omitted.
    pub transaction_id: Option<String>,
    pub item_id: String,
    pub location_id: String,
    pub quantity: u32,
    pub unit_rate: i64,
    #[serde(default = "RatePeriod::daily")]
    pub rate_period: RatePeriod,
    pub daily_late_rate: Option<i64>,
    pub rental_start: NaiveDate,
    pub rental_end: NaiveDate,
    #[serde(default)]
    pub discount: i64,
    #[serde(default)]
    pub tax: i64,
    pub booked_on: Option<NaiveDate>,
    pub idempotency_key: Option<String>,
}

impl CreateBookingRequest {
    pub fn into_booking(self) -> Result<BookingRequest, axum::response::Response> {
        let transaction_id = match self.transaction_id.as_deref() {
            Some(raw) => parse_id::<TransactionId>(raw)?,
            None => TransactionId::new(),
        };
        Ok(BookingRequest {
            transaction_id,
            item_id: parse_id::<ItemId>(&self.item_id)?,
            location_id: parse_id::<LocationId>(&self.location_id)?,
            quantity: self.quantity,
            unit_rate: self.unit_rate,
            rate_period: self.rate_period,
            daily_late_rate: self.daily_late_rate,
            rental_start: self.rental_start,
            rental_end: self.rental_end,
            discount: self.discount,
            tax: self.tax,
            booked_on: self.booked_on.unwrap_or_else(today),
            idempotency_key: self.idempotency_key,
        })
    }
}

/// Body of `POST /lines/:id/returns`; the line comes from the path.
#[derive(Debug, Deserialize)]
pub struct ProcessReturnRequest {
    pub idempotency_key: String,
    pub return_date: NaiveDate,
    pub inspector: Option<String>,
    pub units: Vec<UnitReturn>,
    #[serde(default)]
    pub extra_charges: Vec<ExtraCharge>,
}

#[derive(Debug, Deserialize)]
pub struct AddExtraChargeRequest {
    pub description: String,
    pub amount: i64,
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub amount: i64,
    pub method: String,
    pub reference: Option<String>,
    pub idempotency_key: Option<String>,
    pub as_of: Option<NaiveDate>,
}

impl PaymentRequest {
    pub fn into_input(self) -> (PaymentInput, NaiveDate) {
        let as_of = self.as_of.unwrap_or_else(today);
        (
            PaymentInput {
                amount: self.amount,
                method: self.method,
                reference: self.reference,
                idempotency_key: self.idempotency_key,
            },
            as_of,
        )
    }
}

/// `?as_of=YYYY-MM-DD`; defaults to today (UTC).
#[derive(Debug, Default, Deserialize)]
pub struct AsOfQuery {
    pub as_of: Option<NaiveDate>,
}

impl AsOfQuery {
    pub fn date(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(today)
    }
}

/// Optional `{ "as_of": ... }` body for state-changing line/booking actions.
#[derive(Debug, Default, Deserialize)]
pub struct AsOfBody {
    pub as_of: Option<NaiveDate>,
}

impl AsOfBody {
    pub fn date(&self) -> NaiveDate {
        self.as_of.unwrap_or_else(today)
    }
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Parse a path or body identifier, answering 400 on failure.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: FromStr<Err = DomainError>,
{
    raw.parse::<T>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

pub fn parse_unit_id(raw: &str) -> Result<UnitId, axum::response::Response> {
    parse_id::<UnitId>(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn booking_defaults_fill_in() {
        let body: CreateBookingRequest = serde_json::from_value(serde_json::json!({
            "item_id": ItemId::new().to_string(),
            "location_id": LocationId::new().to_string(),
            "quantity": 2,
            "unit_rate": 100,
            "rental_start": "2024-03-01",
            "rental_end": "2024-03-04",
        }))
        .unwrap();
        let booking = body.into_booking().unwrap();
        assert_eq!(booking.rate_period, RatePeriod::daily());
        assert_eq!(booking.discount, 0);
        assert_eq!(booking.daily_late_rate, None);
        assert_eq!(booking.booked_on, today());
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let res = parse_id::<LocationId>("not-a-uuid").unwrap_err();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
