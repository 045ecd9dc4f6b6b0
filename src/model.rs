use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Milliseconds since the Unix epoch. Windows and appointment spans are read
/// on the establishment's wall clock; `now` arguments and audit stamps are
/// UTC instants, shifted by [`Establishment::local_time`] before comparing.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const DAY_MS: Ms = 24 * 60 * MINUTE_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Midnight of `date`.
pub fn day_start(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// `[midnight, next midnight)` of `date`.
pub fn day_span(date: NaiveDate) -> Span {
    let start = day_start(date);
    Span::new(start, start + DAY_MS)
}

/// Calendar date an instant falls on.
pub fn date_of(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

/// 0 = Sunday … 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Time of day ──────────────────────────────────────────────────

/// Minutes after midnight, `0..=1440`. `24:00` is allowed so a window can
/// close at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(24 * 60);

    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        if minute >= 60 {
            return None;
        }
        let total = hour.checked_mul(60)?.checked_add(minute)?;
        (total <= Self::END_OF_DAY.0).then_some(Self(total))
    }

    /// Parses `HH:MM` or `HH:MM:SS` (seconds must be zero).
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split(':');
        let hour = parts.next()?.parse().ok()?;
        let minute = parts.next()?.parse().ok()?;
        if let Some(sec) = parts.next()
            && sec.parse::<u16>().ok()? != 0 {
                return None;
            }
        if parts.next().is_some() {
            return None;
        }
        Self::from_hm(hour, minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }

    pub fn offset_ms(self) -> Ms {
        Ms::from(self.0) * MINUTE_MS
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

// ── Catalog records ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Establishment {
    pub id: Ulid,
    pub name: String,
    pub owner_id: Ulid,
    /// Wall clock minus UTC, e.g. `-180` for UTC-3.
    pub utc_offset_minutes: i16,
}

impl Establishment {
    /// The establishment's wall-clock reading of the UTC instant `utc`.
    pub fn local_time(&self, utc: Ms) -> Ms {
        utc.saturating_add(Ms::from(self.utc_offset_minutes) * MINUTE_MS)
    }
}

/// A recurring weekly opening window. Immutable; edits are remove + add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub day_of_week: u8,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl AvailabilityWindow {
    /// Anchor the window's time of day onto `date`.
    pub fn anchor(&self, date: NaiveDate) -> Span {
        let midnight = day_start(date);
        Span::new(midnight + self.start.offset_ms(), midnight + self.end.offset_ms())
    }
}

/// Recurring open windows of one establishment, kept sorted by (day, start).
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    windows: Vec<AvailabilityWindow>,
}

impl RuleSet {
    pub fn insert(&mut self, window: AvailabilityWindow) {
        let key = (window.day_of_week, window.start);
        let pos = self
            .windows
            .partition_point(|w| (w.day_of_week, w.start) <= key);
        self.windows.insert(pos, window);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter()
    }

    /// Open windows on `date` as absolute spans, earliest first.
    /// Empty means the establishment is closed that day.
    pub fn windows_on(&self, date: NaiveDate) -> Vec<Span> {
        let dow = day_of_week(date);
        self.windows
            .iter()
            .filter(|w| w.day_of_week == dow)
            .map(|w| w.anchor(date))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_minor_units: u64,
}

impl Service {
    pub fn duration_ms(&self) -> Ms {
        Ms::from(self.duration_minutes) * MINUTE_MS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffMember {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub name: String,
    /// Services this member may perform.
    pub services: HashSet<Ulid>,
}

// ── Appointments ─────────────────────────────────────────────────

/// The unit of double-booking prevention: the whole establishment, or one
/// staff member of it. Scopes never share capacity with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceScope {
    pub establishment_id: Ulid,
    pub staff_id: Option<Ulid>,
}

impl ResourceScope {
    pub fn new(establishment_id: Ulid, staff_id: Option<Ulid>) -> Self {
        Self {
            establishment_id,
            staff_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppointmentStatus {
    Confirmed,
    Cancelled,
    /// Derived: a confirmed appointment whose end has passed.
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub actor_id: Ulid,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub scope: ResourceScope,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub span: Span,
    pub created_at: Ms,
    pub cancellation: Option<Cancellation>,
}

impl Appointment {
    /// Part of the busy set.
    pub fn is_active(&self) -> bool {
        self.cancellation.is_none()
    }

    pub fn status_at(&self, now: Ms) -> AppointmentStatus {
        match self.cancellation {
            Some(_) => AppointmentStatus::Cancelled,
            None if now >= self.span.end => AppointmentStatus::Completed,
            None => AppointmentStatus::Confirmed,
        }
    }
}

/// Every appointment ever committed for one resource scope, sorted by
/// `span.start`. Cancelled entries stay for audit and are skipped by
/// [`Ledger::busy`].
#[derive(Debug, Clone)]
pub struct Ledger {
    pub scope: ResourceScope,
    pub appointments: Vec<Appointment>,
}

impl Ledger {
    pub fn new(scope: ResourceScope) -> Self {
        Self {
            scope,
            appointments: Vec::new(),
        }
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .partition_point(|a| a.span.start <= appointment.span.start);
        self.appointments.insert(pos, appointment);
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == id)
    }

    /// Appointments (any status) whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start < query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| a.span.end > query.start)
    }

    /// Non-cancelled appointments overlapping the query window.
    pub fn busy(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        self.overlapping(query).filter(|a| a.is_active())
    }
}

/// The WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EstablishmentCreated {
        id: Ulid,
        name: String,
        owner_id: Ulid,
        utc_offset_minutes: i16,
    },
    StaffAdded {
        id: Ulid,
        establishment_id: Ulid,
        name: String,
    },
    ServiceCreated {
        id: Ulid,
        establishment_id: Ulid,
        name: String,
        duration_minutes: u32,
        price_minor_units: u64,
    },
    ServiceRemoved {
        id: Ulid,
        establishment_id: Ulid,
    },
    ServiceAssigned {
        establishment_id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
    },
    WindowAdded {
        id: Ulid,
        establishment_id: Ulid,
        day_of_week: u8,
        start: TimeOfDay,
        end: TimeOfDay,
    },
    WindowRemoved {
        id: Ulid,
        establishment_id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        scope: ResourceScope,
        service_id: Ulid,
        client_id: Ulid,
        span: Span,
        created_at: Ms,
    },
    AppointmentCancelled {
        id: Ulid,
        scope: ResourceScope,
        actor_id: Ulid,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub establishment_id: Ulid,
    pub staff_id: Option<Ulid>,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: AppointmentStatus,
}

impl AppointmentInfo {
    pub fn at(appointment: &Appointment, now: Ms) -> Self {
        Self {
            id: appointment.id,
            establishment_id: appointment.scope.establishment_id,
            staff_id: appointment.scope.staff_id,
            service_id: appointment.service_id,
            client_id: appointment.client_id,
            start: appointment.span.start,
            end: appointment.span.end,
            status: appointment.status_at(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: Ms = MINUTE_MS;

    fn appt(start: Ms, end: Ms) -> Appointment {
        Appointment {
            id: Ulid::new(),
            scope: ResourceScope::new(Ulid::new(), None),
            service_id: Ulid::new(),
            client_id: Ulid::new(),
            span: Span::new(start, end),
            created_at: 0,
            cancellation: None,
        }
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 1, 7).unwrap()
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // touching
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_contains() {
        let outer = Span::new(100, 400);
        assert!(outer.contains(&Span::new(150, 300)));
        assert!(outer.contains(&outer));
        assert!(!outer.contains(&Span::new(50, 200)));
        assert!(!outer.contains(&Span::new(300, 401)));
    }

    #[test]
    fn time_of_day_parse() {
        assert_eq!(TimeOfDay::parse("09:00"), TimeOfDay::from_hm(9, 0));
        assert_eq!(TimeOfDay::parse("9:30"), TimeOfDay::from_hm(9, 30));
        assert_eq!(TimeOfDay::parse("17:45:00"), TimeOfDay::from_hm(17, 45));
        assert_eq!(TimeOfDay::parse("24:00"), Some(TimeOfDay::END_OF_DAY));
        assert_eq!(TimeOfDay::parse("24:01"), None);
        assert_eq!(TimeOfDay::parse("10:60"), None);
        assert_eq!(TimeOfDay::parse("10:00:30"), None);
        assert_eq!(TimeOfDay::parse("noon"), None);
        assert_eq!(TimeOfDay::from_hm(9, 5).unwrap().to_string(), "09:05");
    }

    #[test]
    fn day_of_week_is_sunday_based() {
        assert_eq!(day_of_week(monday()), 1);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2030, 1, 6).unwrap()), 0);
        assert_eq!(day_of_week(NaiveDate::from_ymd_opt(2030, 1, 12).unwrap()), 6);
    }

    #[test]
    fn date_of_roundtrips_day_start() {
        let d = monday();
        assert_eq!(date_of(day_start(d)), Some(d));
        assert_eq!(date_of(day_start(d) + DAY_MS - 1), Some(d));
    }

    #[test]
    fn window_anchors_onto_date() {
        let w = AvailabilityWindow {
            id: Ulid::new(),
            establishment_id: Ulid::new(),
            day_of_week: 1,
            start: TimeOfDay::from_hm(9, 0).unwrap(),
            end: TimeOfDay::from_hm(12, 0).unwrap(),
        };
        let base = day_start(monday());
        assert_eq!(w.anchor(monday()), Span::new(base + 9 * 60 * M, base + 12 * 60 * M));
    }

    #[test]
    fn rule_set_selects_by_weekday() {
        let est = Ulid::new();
        let mut rules = RuleSet::default();
        for (dow, sh, eh) in [(1, 14, 16), (2, 9, 17), (1, 9, 12)] {
            rules.insert(AvailabilityWindow {
                id: Ulid::new(),
                establishment_id: est,
                day_of_week: dow,
                start: TimeOfDay::from_hm(sh, 0).unwrap(),
                end: TimeOfDay::from_hm(eh, 0).unwrap(),
            });
        }
        let base = day_start(monday());
        assert_eq!(
            rules.windows_on(monday()),
            vec![
                Span::new(base + 9 * 60 * M, base + 12 * 60 * M),
                Span::new(base + 14 * 60 * M, base + 16 * 60 * M),
            ]
        );
        // Sunday: closed
        assert!(rules.windows_on(NaiveDate::from_ymd_opt(2030, 1, 6).unwrap()).is_empty());
    }

    #[test]
    fn rule_set_remove() {
        let mut rules = RuleSet::default();
        let id = Ulid::new();
        rules.insert(AvailabilityWindow {
            id,
            establishment_id: Ulid::new(),
            day_of_week: 3,
            start: TimeOfDay::MIDNIGHT,
            end: TimeOfDay::END_OF_DAY,
        });
        assert_eq!(rules.len(), 1);
        assert!(rules.remove(Ulid::new()).is_none());
        assert!(rules.remove(id).is_some());
        assert!(rules.is_empty());
    }

    #[test]
    fn ledger_keeps_start_order() {
        let mut ledger = Ledger::new(ResourceScope::new(Ulid::new(), None));
        ledger.insert(appt(300, 400));
        ledger.insert(appt(100, 200));
        ledger.insert(appt(200, 300));
        let starts: Vec<_> = ledger.appointments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn ledger_overlapping_skips_adjacent_and_future() {
        let mut ledger = Ledger::new(ResourceScope::new(Ulid::new(), None));
        ledger.insert(appt(100, 200));
        ledger.insert(appt(450, 600));
        ledger.insert(appt(1000, 1100));

        let hits: Vec<_> = ledger.overlapping(&Span::new(200, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn ledger_busy_ignores_cancelled() {
        let mut ledger = Ledger::new(ResourceScope::new(Ulid::new(), None));
        let mut cancelled = appt(100, 200);
        cancelled.cancellation = Some(Cancellation { actor_id: Ulid::new(), at: 50 });
        ledger.insert(cancelled);
        ledger.insert(appt(150, 250));

        let query = Span::new(0, 1000);
        assert_eq!(ledger.overlapping(&query).count(), 2);
        let busy: Vec<_> = ledger.busy(&query).collect();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].span, Span::new(150, 250));
    }

    #[test]
    fn status_is_derived_from_clock() {
        let mut a = appt(100, 200);
        assert_eq!(a.status_at(50), AppointmentStatus::Confirmed);
        assert_eq!(a.status_at(199), AppointmentStatus::Confirmed);
        assert_eq!(a.status_at(200), AppointmentStatus::Completed);

        a.cancellation = Some(Cancellation { actor_id: Ulid::new(), at: 60 });
        assert_eq!(a.status_at(50), AppointmentStatus::Cancelled);
        assert_eq!(a.status_at(500), AppointmentStatus::Cancelled);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::WindowAdded {
            id: Ulid::new(),
            establishment_id: Ulid::new(),
            day_of_week: 1,
            start: TimeOfDay::from_hm(9, 0).unwrap(),
            end: TimeOfDay::from_hm(12, 0).unwrap(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn local_time_applies_the_offset() {
        let est = |utc_offset_minutes| Establishment {
            id: Ulid::new(),
            name: "Studio".into(),
            owner_id: Ulid::new(),
            utc_offset_minutes,
        };
        let noon_utc = day_start(monday()) + 12 * 60 * M;
        assert_eq!(est(0).local_time(noon_utc), noon_utc);
        assert_eq!(est(-180).local_time(noon_utc), noon_utc - 180 * M);
        assert_eq!(est(330).local_time(noon_utc), noon_utc + 330 * M);
    }
}
