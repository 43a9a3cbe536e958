//! Ledger computations: recurring daily charges, commission reconciliation and
//! legacy alias collapse. Everything here is pure; jobs persist the results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use fleetledger_core::{
    apply_field_writes, decimal_from_value, decimal_to_value, normalize_name, BillableResource,
    BillingCalendar, Directory, Document, FieldWrite, Identity, RecurringCharge,
    RecurringSubscriber, Resolution,
};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strsim::jaro_winkler;
use tracing::warn;

pub const CRATE_NAME: &str = "fleetledger-engine";

/// Why a subscriber or record produced no write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Inactive,
    NoAssignedResource,
    UnknownResource,
    NonPositiveRate,
    NoContractStart,
    EmptyRange,
    AlreadyCovered,
    AlreadyReconciled,
    NoResolvableTotal,
    ZeroTotal,
    NoTechnician,
    UnknownTechnicianId,
    TechnicianNotFound,
    TechnicianAmbiguous,
    NoCommissionRate,
    AlreadyCanonical,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Inactive => "inactive",
            SkipReason::NoAssignedResource => "no assigned resource",
            SkipReason::UnknownResource => "unknown resource",
            SkipReason::NonPositiveRate => "non-positive daily rate",
            SkipReason::NoContractStart => "no contract start date",
            SkipReason::EmptyRange => "empty billing range",
            SkipReason::AlreadyCovered => "every day already charged",
            SkipReason::AlreadyReconciled => "already reconciled",
            SkipReason::NoResolvableTotal => "no resolvable total",
            SkipReason::ZeroTotal => "zero total",
            SkipReason::NoTechnician => "no technician on record",
            SkipReason::UnknownTechnicianId => "technician id not in directory",
            SkipReason::TechnicianNotFound => "technician name not found",
            SkipReason::TechnicianAmbiguous => "technician name ambiguous",
            SkipReason::NoCommissionRate => "no positive commission rate",
            SkipReason::AlreadyCanonical => "fields already canonical",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the first billable day is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StartDatePolicy {
    /// Each subscriber's own contract start date.
    PerSubscriber,
    /// One cutoff for everyone; later contract starts still win.
    FixedCutoff(NaiveDate),
}

impl StartDatePolicy {
    pub fn reference_start(&self) -> Option<NaiveDate> {
        match self {
            StartDatePolicy::PerSubscriber => None,
            StartDatePolicy::FixedCutoff(day) => Some(*day),
        }
    }
}

impl FromStr for StartDatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("per-subscriber") {
            return Ok(StartDatePolicy::PerSubscriber);
        }
        match s.split_once(':') {
            Some((kind, date)) if kind.eq_ignore_ascii_case("fixed-cutoff") => {
                NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
                    .map(StartDatePolicy::FixedCutoff)
                    .map_err(|err| format!("invalid cutoff date {date:?}: {err}"))
            }
            _ => Err(format!(
                "unknown start date policy {s:?} (expected per-subscriber or fixed-cutoff:YYYY-MM-DD)"
            )),
        }
    }
}

impl TryFrom<String> for StartDatePolicy {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StartDatePolicy> for String {
    fn from(policy: StartDatePolicy) -> Self {
        policy.to_string()
    }
}

impl fmt::Display for StartDatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartDatePolicy::PerSubscriber => f.write_str("per-subscriber"),
            StartDatePolicy::FixedCutoff(day) => write!(f, "fixed-cutoff:{}", day.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriberSkip {
    pub subscriber_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChargePlan {
    pub charges: Vec<RecurringCharge>,
    pub skipped: Vec<SubscriberSkip>,
    /// Days inside the billing ranges that already had a charge.
    pub covered_days: usize,
}

/// Compute the missing daily charges for every eligible subscriber.
///
/// Existing charges are matched by calendar day in the billing timezone, so
/// historical charges stamped at creation time still count as coverage.
pub fn generate_charges(
    subscribers: &[RecurringSubscriber],
    resources: &[BillableResource],
    existing_charges: &[RecurringCharge],
    policy: &StartDatePolicy,
    reference_end: NaiveDate,
    calendar: &BillingCalendar,
) -> ChargePlan {
    let resources_by_id: HashMap<&str, &BillableResource> =
        resources.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut covered: HashMap<&str, HashSet<NaiveDate>> = HashMap::new();
    for charge in existing_charges {
        covered
            .entry(charge.subscriber_id.as_str())
            .or_default()
            .insert(calendar.day_of(charge.billing_date));
    }

    let mut plan = ChargePlan::default();
    for subscriber in subscribers {
        let mut skip = |reason: SkipReason| {
            plan.skipped.push(SubscriberSkip {
                subscriber_id: subscriber.id.clone(),
                reason,
            });
        };

        if !subscriber.active {
            skip(SkipReason::Inactive);
            continue;
        }
        let Some(resource_id) = subscriber.assigned_resource_id.as_deref() else {
            skip(SkipReason::NoAssignedResource);
            continue;
        };
        let Some(resource) = resources_by_id.get(resource_id) else {
            skip(SkipReason::UnknownResource);
            continue;
        };
        if resource.daily_rate <= Decimal::ZERO {
            warn!(
                subscriber_id = %subscriber.id,
                resource_id,
                daily_rate = %resource.daily_rate,
                "skipping subscriber: resource has no positive daily rate"
            );
            skip(SkipReason::NonPositiveRate);
            continue;
        }

        let start = match (policy.reference_start(), subscriber.contract_start_date) {
            (Some(cutoff), Some(contract)) => cutoff.max(contract),
            (Some(cutoff), None) => cutoff,
            (None, Some(contract)) => contract,
            (None, None) => {
                skip(SkipReason::NoContractStart);
                continue;
            }
        };
        if start > reference_end {
            skip(SkipReason::EmptyRange);
            continue;
        }

        let days = covered.entry(subscriber.id.as_str()).or_default();
        let before = plan.charges.len();
        for day in start.iter_days().take_while(|d| *d <= reference_end) {
            if days.contains(&day) {
                plan.covered_days += 1;
                continue;
            }
            days.insert(day);
            plan.charges.push(RecurringCharge {
                id: RecurringCharge::deterministic_id(&subscriber.id, day),
                subscriber_id: subscriber.id.clone(),
                resource_id: resource.id.clone(),
                billing_date: calendar.start_of_day(day),
                amount: resource.daily_rate,
                resource_label: resource.label.clone(),
            });
        }
        if plan.charges.len() == before {
            plan.skipped.push(SubscriberSkip {
                subscriber_id: subscriber.id.clone(),
                reason: SkipReason::AlreadyCovered,
            });
        }
    }
    plan
}

/// A name that matched several identities; left for a human to resolve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousName {
    pub field: String,
    pub raw_name: String,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub display_name: String,
    /// Jaro-Winkler similarity to the raw name; ordering only.
    pub similarity: f64,
}

impl AmbiguousName {
    pub fn new(field: &str, raw_name: &str, candidates: &[&Identity]) -> Self {
        let needle = normalize_name(Some(raw_name));
        let mut ranked = candidates
            .iter()
            .map(|c| Candidate {
                id: c.id.clone(),
                display_name: c.display_name.clone(),
                similarity: jaro_winkler(&needle, &c.normalized_name),
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|a, b| b.similarity.total_cmp(&a.similarity).then_with(|| a.id.cmp(&b.id)));
        Self {
            field: field.to_string(),
            raw_name: raw_name.to_string(),
            candidates: ranked,
        }
    }
}

/// One logical identity attribute spread over several legacy field names.
#[derive(Debug, Clone, Copy)]
pub struct AliasSet {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
}

impl AliasSet {
    /// Canonical name first, then aliases in priority order.
    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.canonical).chain(self.aliases.iter().copied())
    }
}

pub const ADVISOR_ID: AliasSet = AliasSet {
    canonical: "advisorId",
    aliases: &["asesorId", "advisor_id", "serviceAdvisorId"],
};
pub const ADVISOR_NAME: AliasSet = AliasSet {
    canonical: "advisorName",
    aliases: &["asesorName", "asesor", "advisor", "serviceAdvisor"],
};
pub const TECHNICIAN_ID: AliasSet = AliasSet {
    canonical: "technicianId",
    aliases: &["tecnicoId", "technician_id", "mechanicId"],
};
pub const TECHNICIAN_NAME: AliasSet = AliasSet {
    canonical: "technicianName",
    aliases: &["tecnicoName", "tecnico", "technician", "mechanic"],
};

pub const TOTAL_FIELD: &str = "total";
/// Deletable total aliases. The nested first payment entry is read, never removed.
pub const TOTAL_ALIASES: &[&str] = &["amount", "price", "totalCost", "Total", "serviceTotal"];
pub const COMMISSION_FIELD: &str = "commission";
pub const LINE_ITEMS_FIELD: &str = "services";

/// Where a resolved total came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TotalSource {
    Field(&'static str),
    FirstPayment,
}

const TOTAL_PRIORITY: &[TotalSource] = &[
    TotalSource::Field("amount"),
    TotalSource::Field("price"),
    TotalSource::FirstPayment,
    TotalSource::Field("total"),
    TotalSource::Field("totalCost"),
    TotalSource::Field("Total"),
    TotalSource::Field("serviceTotal"),
];

/// First finite numeric total in documented priority order.
pub fn resolve_total(record: &Document) -> Option<(TotalSource, Decimal)> {
    TOTAL_PRIORITY.iter().find_map(|source| {
        let value = match source {
            TotalSource::Field(field) => record.get(*field),
            TotalSource::FirstPayment => record
                .get("payments")
                .and_then(Value::as_array)
                .and_then(|payments| payments.first())
                .and_then(|payment| payment.get("amount")),
        }?;
        decimal_from_value(value).map(|amount| (*source, amount))
    })
}

/// Id-like value: non-empty string, or a number rendered as text.
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(record: &Document, set: &AliasSet) -> Option<String> {
    set.fields().filter_map(|f| record.get(f)).find_map(text_value)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Disposition {
    Updated,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub disposition: Disposition,
    pub commission: Option<Decimal>,
    pub technician_id: Option<String>,
    /// Patch to persist; empty when skipped.
    pub fields: BTreeMap<String, FieldWrite>,
    /// Input record with the patch applied.
    pub record: Document,
    pub ambiguous: Option<AmbiguousName>,
    pub unmatched_name: Option<String>,
}

impl Reconciliation {
    fn skipped(record: &Document, reason: SkipReason) -> Self {
        Self {
            disposition: Disposition::Skipped(reason),
            commission: None,
            technician_id: None,
            fields: BTreeMap::new(),
            record: record.clone(),
            ambiguous: None,
            unmatched_name: None,
        }
    }
}

/// Recompute the commission of a historical record that lacks one.
///
/// The whole amount is attributed to the first line item; other items are
/// left alone.
pub fn reconcile_commission(record: &Document, directory: &Directory) -> Reconciliation {
    if record
        .get(COMMISSION_FIELD)
        .and_then(Value::as_f64)
        .is_some_and(f64::is_finite)
    {
        return Reconciliation::skipped(record, SkipReason::AlreadyReconciled);
    }

    let total = match resolve_total(record) {
        None => return Reconciliation::skipped(record, SkipReason::NoResolvableTotal),
        Some((_, amount)) if amount.is_zero() => {
            return Reconciliation::skipped(record, SkipReason::ZeroTotal)
        }
        Some((_, amount)) => amount,
    };

    let technician = if let Some(id) = first_text(record, &TECHNICIAN_ID) {
        match directory.by_id(&id) {
            Some(identity) => identity,
            None => return Reconciliation::skipped(record, SkipReason::UnknownTechnicianId),
        }
    } else {
        let Some(name) = first_text(record, &TECHNICIAN_NAME) else {
            return Reconciliation::skipped(record, SkipReason::NoTechnician);
        };
        match directory.resolve(&name) {
            Resolution::Unique(identity) => identity,
            Resolution::Ambiguous(candidates) => {
                let mut out = Reconciliation::skipped(record, SkipReason::TechnicianAmbiguous);
                out.ambiguous = Some(AmbiguousName::new(TECHNICIAN_NAME.canonical, &name, &candidates));
                return out;
            }
            Resolution::NotFound => {
                let mut out = Reconciliation::skipped(record, SkipReason::TechnicianNotFound);
                out.unmatched_name = Some(name);
                return out;
            }
        }
    };

    let Some(rate) = technician.commission_rate.filter(|r| *r > Decimal::ZERO) else {
        return Reconciliation::skipped(record, SkipReason::NoCommissionRate);
    };

    let commission = (total * rate / Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let commission_value = decimal_to_value(commission);

    let mut fields = BTreeMap::new();
    fields.insert(COMMISSION_FIELD.to_string(), FieldWrite::Set(commission_value.clone()));
    if let Some(items) = record.get(LINE_ITEMS_FIELD).and_then(Value::as_array) {
        if let Some(Value::Object(first)) = items.first() {
            let mut items = items.clone();
            let mut first = first.clone();
            first.insert(COMMISSION_FIELD.to_string(), commission_value);
            items[0] = Value::Object(first);
            fields.insert(LINE_ITEMS_FIELD.to_string(), FieldWrite::Set(Value::Array(items)));
        }
    }

    let mut updated = record.clone();
    apply_field_writes(&mut updated, &fields);
    Reconciliation {
        disposition: Disposition::Updated,
        commission: Some(commission),
        technician_id: Some(technician.id.clone()),
        fields,
        record: updated,
        ambiguous: None,
        unmatched_name: None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Unification {
    pub payload: BTreeMap<String, FieldWrite>,
    pub changed: bool,
    pub ambiguous: Vec<AmbiguousName>,
    /// (canonical field, raw name) pairs with no directory match.
    pub unmatched: Vec<(&'static str, String)>,
}

impl Unification {
    pub fn apply_to(&self, record: &Document) -> Document {
        let mut out = record.clone();
        apply_field_writes(&mut out, &self.payload);
        out
    }
}

/// Collapse legacy aliases into canonical advisor, technician and total fields.
pub fn unify_fields(record: &Document, directory: &Directory) -> Unification {
    let mut out = Unification::default();
    unify_identity(record, directory, &ADVISOR_ID, &ADVISOR_NAME, &mut out);
    unify_identity(record, directory, &TECHNICIAN_ID, &TECHNICIAN_NAME, &mut out);
    unify_total(record, &mut out);
    out.changed = !out.payload.is_empty();
    out
}

fn unify_identity(
    record: &Document,
    directory: &Directory,
    id_set: &AliasSet,
    name_set: &AliasSet,
    out: &mut Unification,
) {
    let mut id = first_text(record, id_set);
    let mut name = first_text(record, name_set);

    match (&id, &name) {
        (None, Some(raw)) => match directory.resolve(raw) {
            Resolution::Unique(identity) => id = Some(identity.id.clone()),
            Resolution::Ambiguous(candidates) => out
                .ambiguous
                .push(AmbiguousName::new(name_set.canonical, raw, &candidates)),
            Resolution::NotFound => out.unmatched.push((name_set.canonical, raw.clone())),
        },
        (Some(known), None) => {
            name = directory.by_id(known).map(|i| i.display_name.clone());
        }
        _ => {}
    }

    canonicalize(record, id_set, id.map(Value::String), out);
    canonicalize(record, name_set, name.map(Value::String), out);
}

/// Write `value` to the canonical field if it differs, then drop present aliases.
fn canonicalize(record: &Document, set: &AliasSet, value: Option<Value>, out: &mut Unification) {
    if let Some(value) = value {
        if record.get(set.canonical) != Some(&value) {
            out.payload.insert(set.canonical.to_string(), FieldWrite::Set(value));
        }
    }
    drop_aliases(record, set.aliases, |_| true, out);
}

fn drop_aliases(
    record: &Document,
    aliases: &[&str],
    removable: impl Fn(&Value) -> bool,
    out: &mut Unification,
) {
    for alias in aliases {
        if record.get(*alias).is_some_and(&removable) {
            out.payload.insert((*alias).to_string(), FieldWrite::Delete);
        }
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn unify_total(record: &Document, out: &mut Unification) {
    let Some((_, amount)) = resolve_total(record) else {
        // unparseable totals stay for manual review; empty ones carry nothing
        drop_aliases(record, TOTAL_ALIASES, is_blank, out);
        return;
    };
    let already_numeric = record
        .get(TOTAL_FIELD)
        .filter(|v| v.is_number())
        .and_then(decimal_from_value)
        == Some(amount);
    if !already_numeric {
        out.payload
            .insert(TOTAL_FIELD.to_string(), FieldWrite::Set(decimal_to_value(amount)));
    }
    drop_aliases(record, TOTAL_ALIASES, |_| true, out);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().expect("object")
    }

    fn driver(id: &str, contract: Option<NaiveDate>) -> RecurringSubscriber {
        RecurringSubscriber {
            id: id.to_string(),
            name: format!("Driver {id}"),
            active: true,
            assigned_resource_id: Some("v1".to_string()),
            contract_start_date: contract,
        }
    }

    fn vehicle(rate: i64) -> BillableResource {
        BillableResource {
            id: "v1".to_string(),
            daily_rate: Decimal::from(rate),
            label: "ABC-123".to_string(),
        }
    }

    fn directory() -> Directory {
        Directory::new(vec![
            Identity::new("t1", "Juan Perez Garcia").with_commission_rate(Decimal::from(10)),
            Identity::new("t2", "Ana Torres").with_commission_rate(Decimal::from(8)),
            Identity::new("t3", "Juliana Ana Ruiz").with_commission_rate(Decimal::from(8)),
            Identity::new("a1", "Roberto Sánchez"),
        ])
    }

    #[test]
    fn emits_one_charge_per_day_from_contract_start() {
        let calendar = BillingCalendar::default();
        let plan = generate_charges(
            &[driver("d1", Some(day(2025, 1, 1)))],
            &[vehicle(200)],
            &[],
            &StartDatePolicy::PerSubscriber,
            day(2025, 1, 3),
            &calendar,
        );
        let days = plan
            .charges
            .iter()
            .map(|c| calendar.day_of(c.billing_date))
            .collect::<Vec<_>>();
        assert_eq!(days, vec![day(2025, 1, 1), day(2025, 1, 2), day(2025, 1, 3)]);
        assert!(plan.charges.iter().all(|c| c.amount == Decimal::from(200)));
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn existing_charge_with_time_of_day_covers_its_calendar_day() {
        let calendar = BillingCalendar::from_utc_offset_minutes(-360).expect("offset");
        let existing = RecurringCharge {
            id: "legacy".to_string(),
            subscriber_id: "d1".to_string(),
            resource_id: "v1".to_string(),
            billing_date: calendar.start_of_day(day(2025, 1, 2)) + chrono::Duration::hours(15),
            amount: Decimal::from(200),
            resource_label: "ABC-123".to_string(),
        };
        let plan = generate_charges(
            &[driver("d1", Some(day(2025, 1, 1)))],
            &[vehicle(200)],
            &[existing],
            &StartDatePolicy::PerSubscriber,
            day(2025, 1, 3),
            &calendar,
        );
        let days = plan
            .charges
            .iter()
            .map(|c| calendar.day_of(c.billing_date))
            .collect::<Vec<_>>();
        assert_eq!(days, vec![day(2025, 1, 1), day(2025, 1, 3)]);
        assert_eq!(plan.covered_days, 1);
    }

    #[test]
    fn second_run_over_first_run_output_is_empty() {
        let calendar = BillingCalendar::from_utc_offset_minutes(-360).expect("offset");
        let subscribers = [driver("d1", Some(day(2024, 12, 20))), driver("d2", None)];
        let policy = StartDatePolicy::FixedCutoff(day(2025, 1, 1));
        let first = generate_charges(&subscribers, &[vehicle(150)], &[], &policy, day(2025, 1, 31), &calendar);
        assert_eq!(first.charges.len(), 62);
        let second = generate_charges(
            &subscribers,
            &[vehicle(150)],
            &first.charges,
            &policy,
            day(2025, 1, 31),
            &calendar,
        );
        assert!(second.charges.is_empty());
        assert!(second
            .skipped
            .iter()
            .all(|s| s.reason == SkipReason::AlreadyCovered));
    }

    #[test]
    fn duplicate_subscriber_entries_never_double_charge_a_day() {
        let calendar = BillingCalendar::default();
        let subscribers = [driver("d1", Some(day(2025, 1, 1))), driver("d1", Some(day(2025, 1, 1)))];
        let plan = generate_charges(
            &subscribers,
            &[vehicle(100)],
            &[],
            &StartDatePolicy::PerSubscriber,
            day(2025, 1, 5),
            &calendar,
        );
        let unique = plan
            .charges
            .iter()
            .map(|c| (c.subscriber_id.clone(), calendar.day_of(c.billing_date)))
            .collect::<HashSet<_>>();
        assert_eq!(unique.len(), plan.charges.len());
        assert_eq!(plan.charges.len(), 5);
    }

    #[test]
    fn fixed_cutoff_respects_later_contract_start() {
        let calendar = BillingCalendar::default();
        let plan = generate_charges(
            &[driver("d1", Some(day(2025, 1, 10)))],
            &[vehicle(100)],
            &[],
            &StartDatePolicy::FixedCutoff(day(2025, 1, 1)),
            day(2025, 1, 12),
            &calendar,
        );
        assert_eq!(plan.charges.len(), 3);
    }

    #[test]
    fn ineligible_subscribers_are_skipped_with_reasons() {
        let calendar = BillingCalendar::default();
        let mut inactive = driver("inactive", Some(day(2025, 1, 1)));
        inactive.active = false;
        let mut unassigned = driver("unassigned", Some(day(2025, 1, 1)));
        unassigned.assigned_resource_id = None;
        let mut dangling = driver("dangling", Some(day(2025, 1, 1)));
        dangling.assigned_resource_id = Some("gone".to_string());
        let no_contract = driver("no-contract", None);
        let future = driver("future", Some(day(2025, 3, 1)));
        let plan = generate_charges(
            &[inactive, unassigned, dangling, no_contract, future],
            &[vehicle(100)],
            &[],
            &StartDatePolicy::PerSubscriber,
            day(2025, 1, 3),
            &calendar,
        );
        assert!(plan.charges.is_empty());
        let reasons = plan.skipped.iter().map(|s| s.reason).collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                SkipReason::Inactive,
                SkipReason::NoAssignedResource,
                SkipReason::UnknownResource,
                SkipReason::NoContractStart,
                SkipReason::EmptyRange,
            ]
        );
    }

    #[test]
    fn zero_rate_vehicle_is_a_warning_skip() {
        let plan = generate_charges(
            &[driver("d1", Some(day(2025, 1, 1)))],
            &[vehicle(0)],
            &[],
            &StartDatePolicy::PerSubscriber,
            day(2025, 1, 3),
            &BillingCalendar::default(),
        );
        assert!(plan.charges.is_empty());
        assert_eq!(plan.skipped[0].reason, SkipReason::NonPositiveRate);
    }

    #[test]
    fn start_policy_parses_both_forms() {
        assert_eq!("per-subscriber".parse(), Ok(StartDatePolicy::PerSubscriber));
        assert_eq!(
            "fixed-cutoff:2025-01-01".parse(),
            Ok(StartDatePolicy::FixedCutoff(day(2025, 1, 1)))
        );
        assert!("fixed-cutoff:nope".parse::<StartDatePolicy>().is_err());
        assert!("whenever".parse::<StartDatePolicy>().is_err());
    }

    #[test]
    fn commission_is_computed_for_uniquely_matched_technician() {
        let record = doc(json!({
            "technicianName": "Juan Perez",
            "total": 1500,
            "services": [{"name": "Afinación"}, {"name": "Frenos"}]
        }));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Updated);
        assert_eq!(out.commission, Some(Decimal::from(150)));
        assert_eq!(out.technician_id.as_deref(), Some("t1"));
        assert_eq!(out.record.get("commission"), Some(&json!(150)));
        assert_eq!(out.record["services"][0]["commission"], json!(150));
        assert!(out.record["services"][1].get("commission").is_none());
    }

    #[test]
    fn ambiguous_technician_is_skipped_and_reported() {
        let record = doc(json!({"technicianName": "Ana", "total": 800}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::TechnicianAmbiguous));
        assert!(out.fields.is_empty());
        assert!(!out.record.contains_key("commission"));
        let ambiguous = out.ambiguous.expect("ambiguous report");
        assert_eq!(ambiguous.candidates.len(), 2);
    }

    #[test]
    fn zero_total_is_skipped_without_writing_commission() {
        let record = doc(json!({"technicianName": "Juan Perez", "total": 0}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::ZeroTotal));
        assert!(out.fields.is_empty());
        assert!(!out.record.contains_key("commission"));
    }

    #[test]
    fn already_reconciled_record_is_returned_unchanged() {
        let record = doc(json!({"technicianName": "Juan Perez", "total": 1000, "commission": 12.5}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::AlreadyReconciled));
        assert_eq!(out.record, record);
    }

    #[test]
    fn total_follows_alias_priority() {
        let record = doc(json!({
            "total": 999,
            "payments": [{"amount": "450.50"}],
            "serviceTotal": 1
        }));
        let (source, amount) = resolve_total(&record).expect("total");
        assert_eq!(source, TotalSource::FirstPayment);
        assert_eq!(amount, Decimal::from_str("450.50").expect("decimal"));
        assert!(resolve_total(&doc(json!({"total": "n/a"}))).is_none());
    }

    #[test]
    fn unparseable_total_is_skipped() {
        let record = doc(json!({"total": "n/a", "technicianName": "Juan Perez"}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::NoResolvableTotal));
        assert!(out.fields.is_empty());
    }

    #[test]
    fn record_without_technician_is_skipped() {
        let record = doc(json!({"total": 100, "tecnico": "   "}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::NoTechnician));
        assert!(out.ambiguous.is_none());
        assert!(out.unmatched_name.is_none());
    }

    #[test]
    fn unknown_technician_name_is_skipped_and_reported() {
        let record = doc(json!({"technicianName": "Pedro Infante", "total": 100}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.disposition, Disposition::Skipped(SkipReason::TechnicianNotFound));
        assert_eq!(out.unmatched_name.as_deref(), Some("Pedro Infante"));
        assert!(out.ambiguous.is_none());
        assert!(!out.record.contains_key("commission"));
    }

    #[test]
    fn technician_id_alias_wins_over_name() {
        let record = doc(json!({"tecnicoId": "t2", "technicianName": "Juan Perez", "price": 100}));
        let out = reconcile_commission(&record, &directory());
        assert_eq!(out.technician_id.as_deref(), Some("t2"));
        assert_eq!(out.commission, Some(Decimal::from(8)));

        let unknown = doc(json!({"tecnicoId": "zz", "price": 100}));
        assert_eq!(
            reconcile_commission(&unknown, &directory()).disposition,
            Disposition::Skipped(SkipReason::UnknownTechnicianId)
        );
    }

    #[test]
    fn technician_without_rate_is_skipped() {
        let record = doc(json!({"technicianId": "a1", "total": 500}));
        assert_eq!(
            reconcile_commission(&record, &directory()).disposition,
            Disposition::Skipped(SkipReason::NoCommissionRate)
        );
    }

    #[test]
    fn unify_cross_fills_id_from_name_and_drops_aliases() {
        let record = doc(json!({
            "asesor": "roberto sanchez",
            "tecnico": "J. Perez",
            "tecnicoName": "Juan Perez",
            "price": "1200",
            "Total": 1200
        }));
        let out = unify_fields(&record, &directory());
        assert!(out.changed);
        let unified = out.apply_to(&record);
        assert_eq!(unified.get("advisorId"), Some(&json!("a1")));
        assert_eq!(unified.get("advisorName"), Some(&json!("roberto sanchez")));
        assert_eq!(unified.get("technicianId"), Some(&json!("t1")));
        // tecnicoName outranks tecnico.
        assert_eq!(unified.get("technicianName"), Some(&json!("Juan Perez")));
        assert_eq!(unified.get("total"), Some(&json!(1200)));
        for alias in ["asesor", "tecnico", "tecnicoName", "price", "Total"] {
            assert!(!unified.contains_key(alias), "{alias} should be removed");
        }
    }

    #[test]
    fn unify_fills_name_from_id() {
        let record = doc(json!({"mechanicId": "t2"}));
        let unified = unify_fields(&record, &directory()).apply_to(&record);
        assert_eq!(unified.get("technicianId"), Some(&json!("t2")));
        assert_eq!(unified.get("technicianName"), Some(&json!("Ana Torres")));
        assert!(!unified.contains_key("mechanicId"));
    }

    #[test]
    fn unify_leaves_ambiguous_name_without_id() {
        let record = doc(json!({"technicianName": "Ana"}));
        let out = unify_fields(&record, &directory());
        assert!(!out.changed);
        assert_eq!(out.ambiguous.len(), 1);
        assert!(!out.payload.contains_key("technicianId"));
    }

    #[test]
    fn unify_reports_unmatched_names_per_field() {
        let record = doc(json!({"asesor": "Pedro Infante", "tecnico": "Pedro Infante"}));
        let out = unify_fields(&record, &directory());
        assert_eq!(
            out.unmatched,
            vec![
                ("advisorName", "Pedro Infante".to_string()),
                ("technicianName", "Pedro Infante".to_string()),
            ]
        );
    }

    #[test]
    fn unify_removes_blank_aliases_without_a_value() {
        let record = doc(json!({"tecnico": "  ", "total": 5}));
        let out = unify_fields(&record, &directory());
        assert!(out.changed);
        assert_eq!(out.payload.get("tecnico"), Some(&FieldWrite::Delete));
        assert!(!out.payload.contains_key("technicianName"));

        let record = doc(json!({"asesorId": null, "technicianName": "Juan", "price": ""}));
        let unified = unify_fields(&record, &directory()).apply_to(&record);
        assert!(!unified.contains_key("asesorId"));
        assert!(!unified.contains_key("price"));
        assert_eq!(unified.get("technicianName"), Some(&json!("Juan")));
    }

    #[test]
    fn unify_keeps_unparseable_total_alias() {
        let record = doc(json!({"price": "n/a", "technicianName": "Juan Perez Garcia"}));
        let out = unify_fields(&record, &directory());
        assert!(!out.payload.contains_key("price"));
        assert!(!out.payload.contains_key("total"));
    }

    #[test]
    fn canonical_record_is_unchanged() {
        let record = doc(json!({
            "advisorId": "a1",
            "advisorName": "Roberto Sánchez",
            "technicianId": "t1",
            "technicianName": "Juan Perez Garcia",
            "total": 300
        }));
        let out = unify_fields(&record, &directory());
        assert!(!out.changed);
        assert!(out.payload.is_empty());
    }
}
