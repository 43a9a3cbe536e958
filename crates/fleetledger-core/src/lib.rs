//! Core domain model, name normalization and identity resolution for Fleet Ledger.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleetledger-core";

/// Schemaless stored document body.
pub type Document = serde_json::Map<String, Value>;

pub const USERS: &str = "users";
pub const DRIVERS: &str = "drivers";
pub const VEHICLES: &str = "vehicles";
pub const CHARGES: &str = "charges";
pub const COUNTERS: &str = "counters";
pub const SERVICES: &str = "services";

/// Charge fields that name the billed subscriber, canonical first.
pub const CHARGE_SUBSCRIBER_FIELDS: &[&str] = &["subscriberId", "driverId"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Per-field payload value; `Delete` removes the field from the stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum FieldWrite {
    Set(Value),
    Delete,
}

/// Apply a field patch in place.
pub fn apply_field_writes(doc: &mut Document, fields: &BTreeMap<String, FieldWrite>) {
    for (field, write) in fields {
        match write {
            FieldWrite::Set(value) => {
                doc.insert(field.clone(), value.clone());
            }
            FieldWrite::Delete => {
                doc.remove(field);
            }
        }
    }
}

/// Canonicalize a free-text person name for fuzzy comparison.
///
/// Trims, lowercases, strips diacritics (NFD + combining mark removal) and
/// collapses whitespace runs. `None` yields the empty string.
pub fn normalize_name(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return String::new();
    };
    raw.trim()
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Same as [`normalize_name`] for loosely typed stored values; non-strings yield "".
pub fn normalize_name_value(value: &Value) -> String {
    normalize_name(value.as_str())
}

/// Parse a stored monetary/rate value. Accepts JSON numbers and numeric strings
/// (`"1,250.50"`, `"$300"`); rejects everything else.
pub fn decimal_from_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                n.as_f64()
                    .filter(|f| f.is_finite())
                    .and_then(|f| Decimal::try_from(f).ok())
            }
        }
        Value::String(s) => {
            let cleaned = s.trim().trim_start_matches('$').replace(',', "");
            if cleaned.is_empty() {
                return None;
            }
            Decimal::from_str(&cleaned)
                .or_else(|_| Decimal::from_scientific(&cleaned))
                .ok()
        }
        _ => None,
    }
}

/// Whole amounts are stored as JSON integers, everything else as floats.
pub fn decimal_to_value(amount: Decimal) -> Value {
    if amount.fract().is_zero() {
        if let Some(whole) = amount.to_i64() {
            return Value::from(whole);
        }
    }
    amount
        .to_f64()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(amount.to_string()))
}

/// First non-empty string among `fields`, in order.
pub fn first_str<'a>(doc: &'a Document, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .filter_map(|f| doc.get(*f))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Day arithmetic in the fleet's billing timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingCalendar {
    offset: FixedOffset,
}

impl Default for BillingCalendar {
    fn default() -> Self {
        Self { offset: Utc.fix() }
    }
}

impl BillingCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn from_utc_offset_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes.checked_mul(60)?).map(Self::new)
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// Instant of local midnight for `day`.
    pub fn start_of_day(&self, day: NaiveDate) -> DateTime<Utc> {
        let local = day.and_time(NaiveTime::MIN);
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }

    /// Parse a stored date: `YYYY-MM-DD`, RFC 3339, or an exported timestamp
    /// object (`{"_seconds": ..}` / `{"seconds": ..}`).
    pub fn parse_day(&self, value: &Value) -> Option<NaiveDate> {
        match value {
            Value::String(s) => {
                let s = s.trim();
                if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                    return Some(day);
                }
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| self.day_of(dt.with_timezone(&Utc)))
            }
            Value::Object(obj) => {
                let seconds = obj
                    .get("_seconds")
                    .or_else(|| obj.get("seconds"))
                    .and_then(Value::as_i64)?;
                DateTime::from_timestamp(seconds, 0).map(|dt| self.day_of(dt))
            }
            _ => None,
        }
    }

    pub fn parse_instant(&self, value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(s) => match DateTime::parse_from_rfc3339(s.trim()) {
                Ok(dt) => Some(dt.with_timezone(&Utc)),
                Err(_) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .ok()
                    .map(|day| self.start_of_day(day)),
            },
            Value::Object(obj) => obj
                .get("_seconds")
                .or_else(|| obj.get("seconds"))
                .and_then(Value::as_i64)
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            _ => None,
        }
    }
}

/// Known person from the user directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub display_name: String,
    pub normalized_name: String,
    pub commission_rate: Option<Decimal>,
    pub signature: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            id: id.into(),
            normalized_name: normalize_name(Some(&display_name)),
            display_name,
            commission_rate: None,
            signature: None,
        }
    }

    pub fn with_commission_rate(mut self, rate: Decimal) -> Self {
        self.commission_rate = Some(rate);
        self
    }

    pub fn from_document(id: &str, doc: &Document) -> Self {
        let display_name = first_str(doc, &["name", "displayName", "nombre"]).unwrap_or_default();
        let mut identity = Self::new(id, display_name);
        identity.commission_rate = ["commissionRate", "comision"]
            .iter()
            .filter_map(|f| doc.get(*f))
            .find_map(decimal_from_value);
        identity.signature = first_str(doc, &["signature"]).map(str::to_string);
        identity
    }
}

/// Outcome of matching a free-text name against the directory.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<'a> {
    Unique(&'a Identity),
    Ambiguous(Vec<&'a Identity>),
    NotFound,
}

impl<'a> Resolution<'a> {
    pub fn unique(&self) -> Option<&'a Identity> {
        match self {
            Resolution::Unique(identity) => Some(identity),
            _ => None,
        }
    }
}

/// Bidirectional substring containment over normalized names.
///
/// Empty names never match; more than one hit is reported as ambiguous and
/// never narrowed down.
pub fn resolve_identity<'a>(raw_name: &str, directory: &'a [Identity]) -> Resolution<'a> {
    let needle = normalize_name(Some(raw_name));
    if needle.is_empty() {
        return Resolution::NotFound;
    }
    let mut matches: Vec<&Identity> = directory
        .iter()
        .filter(|entry| !entry.normalized_name.is_empty())
        .filter(|entry| {
            entry.normalized_name.contains(&needle) || needle.contains(&entry.normalized_name)
        })
        .collect();
    match matches.len() {
        0 => Resolution::NotFound,
        1 => Resolution::Unique(matches.remove(0)),
        _ => Resolution::Ambiguous(matches),
    }
}

/// Identity directory loaded once per run.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    identities: Vec<Identity>,
}

impl Directory {
    pub fn new(identities: Vec<Identity>) -> Self {
        Self { identities }
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn by_id(&self, id: &str) -> Option<&Identity> {
        self.identities.iter().find(|i| i.id == id)
    }

    pub fn resolve(&self, raw_name: &str) -> Resolution<'_> {
        resolve_identity(raw_name, &self.identities)
    }
}

/// Fleet driver enrolled in daily rental billing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSubscriber {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub assigned_resource_id: Option<String>,
    pub contract_start_date: Option<NaiveDate>,
}

impl RecurringSubscriber {
    pub fn from_document(id: &str, doc: &Document, calendar: &BillingCalendar) -> Self {
        Self {
            id: id.to_string(),
            name: first_str(doc, &["name", "nombre"]).unwrap_or_default().to_string(),
            active: ["active", "activo"]
                .iter()
                .filter_map(|f| doc.get(*f))
                .find_map(Value::as_bool)
                .unwrap_or(false),
            assigned_resource_id: first_str(doc, &["vehicleId", "assignedVehicleId"])
                .map(str::to_string),
            contract_start_date: doc
                .get("contractStartDate")
                .and_then(|v| calendar.parse_day(v)),
        }
    }
}

/// Billable vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableResource {
    pub id: String,
    pub daily_rate: Decimal,
    pub label: String,
}

impl BillableResource {
    pub fn from_document(id: &str, doc: &Document) -> Self {
        Self {
            id: id.to_string(),
            daily_rate: ["dailyRate", "rentaDiaria"]
                .iter()
                .filter_map(|f| doc.get(*f))
                .find_map(decimal_from_value)
                .unwrap_or(Decimal::ZERO),
            label: first_str(doc, &["label", "plates", "name"])
                .unwrap_or(id)
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringCharge {
    pub id: String,
    pub subscriber_id: String,
    pub resource_id: String,
    pub billing_date: DateTime<Utc>,
    pub amount: Decimal,
    pub resource_label: String,
}

impl RecurringCharge {
    /// Stable id for a (subscriber, billing day) pair.
    pub fn deterministic_id(subscriber_id: &str, day: NaiveDate) -> String {
        let source = format!("charge:{subscriber_id}:{}", day.format("%Y-%m-%d"));
        Uuid::new_v5(&Uuid::NAMESPACE_OID, source.as_bytes()).to_string()
    }

    pub fn from_document(id: &str, doc: &Document, calendar: &BillingCalendar) -> Option<Self> {
        Some(Self {
            id: id.to_string(),
            subscriber_id: first_str(doc, CHARGE_SUBSCRIBER_FIELDS)?.to_string(),
            resource_id: first_str(doc, &["resourceId", "vehicleId"])
                .unwrap_or_default()
                .to_string(),
            billing_date: doc
                .get("billingDate")
                .or_else(|| doc.get("date"))
                .and_then(|v| calendar.parse_instant(v))?,
            amount: doc
                .get("amount")
                .and_then(decimal_from_value)
                .unwrap_or(Decimal::ZERO),
            resource_label: first_str(doc, &["resourceLabel"])
                .unwrap_or_default()
                .to_string(),
        })
    }

    pub fn to_document(&self, created_at: DateTime<Utc>) -> Document {
        let mut doc = Document::new();
        doc.insert("subscriberId".into(), Value::String(self.subscriber_id.clone()));
        doc.insert("resourceId".into(), Value::String(self.resource_id.clone()));
        doc.insert("billingDate".into(), Value::String(self.billing_date.to_rfc3339()));
        doc.insert("amount".into(), decimal_to_value(self.amount));
        doc.insert("resourceLabel".into(), Value::String(self.resource_label.clone()));
        doc.insert("createdAt".into(), Value::String(created_at.to_rfc3339()));
        doc
    }
}

/// Named monotonic counter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceKey {
    pub scope: String,
    pub count: u64,
}

impl SequenceKey {
    pub fn from_document(scope: &str, doc: Option<&Document>) -> Self {
        Self {
            scope: scope.to_string(),
            count: doc
                .and_then(|d| d.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
        }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("count".into(), Value::from(self.count));
        doc
    }
}
