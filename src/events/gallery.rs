//! Browsable history of detection events: client-side date filtering and
//! batch paging over the backend's event list.

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::json;

use super::{EventImage, EventRecord, EventStore};
use crate::error::LookupError;
use crate::logging::{log, obj, v_str, Domain, Level};

pub const BATCH_SIZE: usize = 10;

/// Inclusive calendar-day range. Filtering only applies when both bounds are set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_active(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    pub fn contains(&self, at: NaiveDateTime) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => {
                let day = at.date();
                day >= start && day <= end
            }
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventGallery {
    events: Vec<EventRecord>,
    filtered: Vec<EventRecord>,
    range: DateRange,
    visible_count: usize,
}

impl EventGallery {
    pub async fn load<S: EventStore + ?Sized>(store: &S) -> Result<Self, LookupError> {
        let mut gallery = Self::default();
        gallery.refresh(store).await?;
        Ok(gallery)
    }

    pub fn from_records(events: Vec<EventRecord>) -> Self {
        let mut gallery = Self {
            events,
            ..Default::default()
        };
        gallery.recompute();
        gallery
    }

    /// Refetch the list and reapply the current filter. On failure the
    /// previous contents stay in place.
    pub async fn refresh<S: EventStore + ?Sized>(&mut self, store: &S) -> Result<usize, LookupError> {
        match store.list().await {
            Ok(events) => {
                self.events = events;
                self.recompute();
                log(
                    Level::Info,
                    Domain::Gallery,
                    "loaded",
                    obj(&[
                        ("total", json!(self.events.len())),
                        ("matching", json!(self.filtered.len())),
                    ]),
                );
                Ok(self.filtered.len())
            }
            Err(err) => {
                log(
                    Level::Warn,
                    Domain::Gallery,
                    "load_failed",
                    obj(&[("msg", v_str(&err.to_string()))]),
                );
                Err(err)
            }
        }
    }

    /// Returns the number of matching events. Paging restarts.
    pub fn apply_filter(&mut self, range: DateRange) -> usize {
        self.range = range;
        self.recompute();
        self.filtered.len()
    }

    pub fn clear_filter(&mut self) -> usize {
        self.apply_filter(DateRange::all())
    }

    fn recompute(&mut self) {
        let range = self.range;
        self.filtered = if range.is_active() {
            // Undated events cannot be placed in a range.
            self.events
                .iter()
                .filter(|e| e.occurred_at().map(|t| range.contains(t)).unwrap_or(false))
                .cloned()
                .collect()
        } else {
            self.events.clone()
        };
        self.visible_count = BATCH_SIZE;
    }

    pub fn visible(&self) -> &[EventRecord] {
        let n = self.visible_count.min(self.filtered.len());
        &self.filtered[..n]
    }

    /// Grow the visible window by one batch; returns the new visible length.
    pub fn load_more(&mut self) -> usize {
        if self.has_more() {
            self.visible_count += BATCH_SIZE;
        }
        self.visible().len()
    }

    pub fn has_more(&self) -> bool {
        self.visible_count < self.filtered.len()
    }

    pub fn matching(&self) -> usize {
        self.filtered.len()
    }

    pub fn total(&self) -> usize {
        self.events.len()
    }

    pub fn range(&self) -> DateRange {
        self.range
    }

    pub fn find(&self, id: &str) -> Option<&EventRecord> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Oldest first, ready for `EnrichmentPipeline::seed`.
    pub fn history(&self) -> Vec<EventRecord> {
        let mut out = self.events.clone();
        out.sort_by_key(|e| e.occurred_at());
        out
    }

    pub async fn download_image<S: EventStore + ?Sized>(&self, store: &S, id: &str) -> Result<EventImage, LookupError> {
        let result = store.download_image(id).await;
        match &result {
            Ok(image) => log(
                Level::Info,
                Domain::Gallery,
                "downloaded",
                obj(&[
                    ("event_id", v_str(id)),
                    ("file_name", v_str(&image.file_name)),
                    ("bytes", json!(image.bytes.len())),
                ]),
            ),
            Err(err) => log(
                Level::Warn,
                Domain::Gallery,
                "download_failed",
                obj(&[("event_id", v_str(id)), ("msg", v_str(&err.to_string()))]),
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{record, MemoryStore};

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn fixture() -> Vec<EventRecord> {
        vec![
            record("e1", "DROWSINESS", "2025-03-01T08:00:00"),
            record("e2", "YAWNING", "2025-03-02T23:59:59.900"),
            record("e3", "DROWSINESS", "2025-03-03T00:00:00"),
            record("e4", "DROWSINESS", "not a date"),
        ]
    }

    #[test]
    fn test_range_is_inclusive_of_end_day() {
        let range = DateRange::between(day(2025, 3, 1), day(2025, 3, 2));
        let mut gallery = EventGallery::from_records(fixture());
        assert_eq!(gallery.apply_filter(range), 2);
        let ids: Vec<&str> = gallery.visible().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        // Last instant of the end day is in, midnight after it is out.
        let end_of_day = day(2025, 3, 2).and_hms_milli_opt(23, 59, 59, 999).unwrap();
        assert!(range.contains(end_of_day));
        assert!(!range.contains(day(2025, 3, 3).and_hms_opt(0, 0, 0).unwrap()));
    }

    #[test]
    fn test_half_open_range_means_no_filter() {
        let mut gallery = EventGallery::from_records(fixture());
        let range = DateRange {
            start: Some(day(2025, 3, 3)),
            end: None,
        };
        assert_eq!(gallery.apply_filter(range), 4);
        assert_eq!(gallery.clear_filter(), 4);
    }

    #[test]
    fn test_paging_in_batches() {
        let events: Vec<EventRecord> = (0..25)
            .map(|i| record(&format!("e{}", i), "DROWSINESS", "2025-03-01T08:00:00"))
            .collect();
        let mut gallery = EventGallery::from_records(events);
        assert_eq!(gallery.visible().len(), 10);
        assert!(gallery.has_more());
        assert_eq!(gallery.load_more(), 20);
        assert_eq!(gallery.load_more(), 25);
        assert!(!gallery.has_more());
        assert_eq!(gallery.load_more(), 25);

        // A new filter restarts paging.
        gallery.apply_filter(DateRange::between(day(2025, 3, 1), day(2025, 3, 1)));
        assert_eq!(gallery.visible().len(), 10);
    }

    #[test]
    fn test_history_is_oldest_first() {
        let gallery = EventGallery::from_records(fixture());
        let ids: Vec<String> = gallery.history().into_iter().map(|e| e.id).collect();
        // Undated sorts first.
        assert_eq!(ids, vec!["e4", "e1", "e2", "e3"]);
    }

    #[tokio::test]
    async fn test_load_and_download() {
        let store = MemoryStore::with(fixture());
        let gallery = EventGallery::load(&store).await.unwrap();
        assert_eq!(gallery.total(), 4);
        assert!(gallery.find("e2").is_some());

        let image = gallery.download_image(&store, "e2").await.unwrap();
        assert_eq!(image.file_name, "e2.png");
        assert!(matches!(
            gallery.download_image(&store, "missing").await,
            Err(LookupError::NotFound(_))
        ));
    }
}
