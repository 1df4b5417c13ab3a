//! Data gap detection.
//!
//! A gap is a range of change log ids that has not been routed yet. The
//! last gap is open ended (as wide as `routing_largest_gap_size`) and is
//! where new changes land. Ranges left behind by ids that never showed up,
//! such as those reserved by a rolled back capture transaction, stay as
//! small gaps until they are older than the stale gap time and are then
//! dropped.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use sync_core::{DataGap, Store};

use crate::params::EngineParameters;

#[derive(Debug, Clone, Copy)]
struct GapSettings {
    largest_gap_size: i64,
    stale_gap_time_ms: i64,
    busy_expire_time_ms: i64,
    detect_invalid_gaps: bool,
    increment_by: i64,
}

#[derive(Debug)]
struct DetectorState {
    gaps: Vec<DataGap>,
    full_gap_analysis: bool,
    first_time: bool,
    last_busy_expire_run_time: Option<DateTime<Utc>>,
    pass: PassState,
}

/// What one routing pass learned, consumed by [`DataGapDetector::after_routing`].
#[derive(Debug)]
struct PassState {
    data_ids: Vec<i64>,
    all_data_read: bool,
    routing_start_time: DateTime<Utc>,
    detect_invalid_gaps: bool,
}

impl PassState {
    fn new(detect_invalid_gaps: bool) -> Self {
        Self {
            data_ids: Vec::new(),
            all_data_read: true,
            routing_start_time: Utc::now(),
            detect_invalid_gaps,
        }
    }
}

/// Keeps the gap table in step with what routing has consumed.
pub struct DataGapDetector {
    store: Arc<dyn Store>,
    settings: GapSettings,
    state: Mutex<DetectorState>,
}

/// Gap bookkeeping for one `after_routing` run.
struct GapChanges<'a> {
    settings: GapSettings,
    validate: bool,
    all: BTreeSet<DataGap>,
    added: Vec<DataGap>,
    deleted: Vec<DataGap>,
    data_ids: &'a [i64],
}

impl GapChanges<'_> {
    fn add(&mut self, gap: DataGap) -> bool {
        if self.validate {
            let largest = self.settings.largest_gap_size;
            let problem = if self.all.contains(&gap) {
                Some("Detected a duplicate data gap")
            } else if gap.start_id > gap.end_id {
                Some("Detected an invalid gap range")
            } else if gap.gap_size() < largest - 1 && gap.gap_size() >= (largest as f64 * 0.75) as i64 {
                Some("Detected a very large gap range")
            } else {
                None
            };
            if let Some(problem) = problem {
                tracing::warn!("{}: {}", problem, gap);
                tracing::info!(
                    "Data IDs: {:?}, Data Gaps: {:?}, Added Data Gaps: {:?}, Deleted Data Gaps: {:?}",
                    self.data_ids,
                    self.all,
                    self.added,
                    self.deleted
                );
                return false;
            }
        }
        self.all.insert(gap.clone());
        self.added.push(gap);
        true
    }

    fn delete(&mut self, gap: &DataGap) {
        self.all.remove(gap);
        self.deleted.push(gap.clone());
    }
}

impl DataGapDetector {
    pub fn new(store: Arc<dyn Store>, params: &EngineParameters) -> Self {
        let settings = GapSettings {
            largest_gap_size: params.routing_largest_gap_size,
            stale_gap_time_ms: params.routing_stale_data_id_gap_time_ms,
            busy_expire_time_ms: params.routing_stale_gap_busy_expire_time_ms,
            detect_invalid_gaps: params.routing_detect_invalid_gaps,
            increment_by: params.data_id_increment_by.max(1),
        };
        Self {
            store,
            settings,
            state: Mutex::new(DetectorState {
                gaps: Vec::new(),
                full_gap_analysis: true,
                first_time: true,
                last_busy_expire_run_time: None,
                pass: PassState::new(true),
            }),
        }
    }

    /// Load the gaps a routing pass should read, running a full analysis on the first pass.
    pub async fn before_routing(&self) -> Result<Vec<DataGap>> {
        let mut state = self.state.lock().await;
        let detect_invalid = self.settings.detect_invalid_gaps || state.first_time;
        state.first_time = false;
        state.pass = PassState::new(detect_invalid);

        let mut gaps = self.store.data_gaps().await?;
        gaps.sort();
        if detect_invalid {
            gaps = self.fix_overlapping_gaps(gaps).await?;
        }
        if gaps.is_empty() {
            gaps.push(self.insert_last_gap().await?);
        }
        state.gaps = gaps;

        if state.full_gap_analysis {
            tracing::info!("Full gap analysis is running");
            let started = std::time::Instant::now();
            let mut routed = Vec::new();
            for gap in &state.gaps {
                routed.extend(
                    self.store
                        .select_routed_data_ids(gap.start_id, gap.end_id)
                        .await?,
                );
            }
            tracing::info!(
                "Querying data in gaps from database took {} ms",
                started.elapsed().as_millis()
            );
            state.pass.data_ids = routed;
            state.pass.all_data_read = false;
            self.reconcile(&mut state).await?;
            state.pass = PassState::new(detect_invalid);
            tracing::info!(
                "Full gap analysis is done after {} ms",
                started.elapsed().as_millis()
            );
        }
        Ok(state.gaps.clone())
    }

    /// Record change rows routed and committed during the current pass.
    pub async fn add_data_ids(&self, data_ids: &[i64]) {
        self.state.lock().await.pass.data_ids.extend_from_slice(data_ids);
    }

    /// Report whether a channel read everything available. Once false it stays false for the pass.
    pub async fn set_all_data_read(&self, all_data_read: bool) {
        self.state.lock().await.pass.all_data_read &= all_data_read;
    }

    /// Persist gap changes implied by the ids routed in this pass.
    pub async fn after_routing(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reconcile(&mut state).await
    }

    /// Gaps as of the last reconciliation.
    pub async fn gaps(&self) -> Vec<DataGap> {
        self.state.lock().await.gaps.clone()
    }

    async fn reconcile(&self, state: &mut DetectorState) -> Result<()> {
        let now = state.pass.routing_start_time;
        let all_data_read = state.pass.all_data_read;
        let increment = self.settings.increment_by;

        let mut busy_expire = false;
        if !all_data_read {
            match state.last_busy_expire_run_time {
                None => state.last_busy_expire_run_time = Some(Utc::now()),
                Some(last) => {
                    busy_expire = (Utc::now() - last).num_milliseconds()
                        >= self.settings.busy_expire_time_ms;
                }
            }
        } else {
            state.last_busy_expire_run_time = None;
        }

        let mut data_ids = std::mem::take(&mut state.pass.data_ids);
        data_ids.sort_unstable();
        data_ids.dedup();
        let ids_by_gap = map_ids_to_gaps(&state.gaps, &data_ids);

        let mut changes = GapChanges {
            settings: self.settings,
            validate: state.pass.detect_invalid_gaps,
            all: state.gaps.iter().cloned().collect(),
            added: Vec::new(),
            deleted: Vec::new(),
            data_ids: &data_ids,
        };
        let mut skipped = Vec::new();
        let mut last_data_id = -1;

        let gap_count = state.gaps.len();
        for (index, gap) in state.gaps.iter().enumerate() {
            let is_last_gap = index + 1 == gap_count;
            let ids = ids_by_gap.get(&index).map(Vec::as_slice).unwrap_or(&[]);
            last_data_id = -1;

            if !ids.is_empty() {
                changes.delete(gap);
            } else if !is_last_gap && (all_data_read || busy_expire) {
                let expired =
                    (now - gap.create_time).num_milliseconds() > self.settings.stale_gap_time_ms;
                if expired {
                    let confirmed_empty = !all_data_read
                        && self
                            .store
                            .count_data_in_range(gap.start_id - 1, gap.end_id + 1)
                            .await?
                            == 0;
                    if all_data_read || confirmed_empty {
                        skipped.push(gap.clone());
                        changes.delete(gap);
                    }
                }
            }

            for &data_id in ids {
                if last_data_id == -1 && gap.start_id + increment <= data_id {
                    changes.add(DataGap::created_at(gap.start_id, data_id - 1, now));
                } else if last_data_id != -1
                    && last_data_id + increment != data_id
                    && last_data_id != data_id
                {
                    changes.add(DataGap::created_at(last_data_id + 1, data_id - 1, now));
                }
                last_data_id = data_id;
            }

            if last_data_id != -1 && !is_last_gap && last_data_id + increment <= gap.end_id {
                changes.add(DataGap::created_at(last_data_id + increment, gap.end_id, now));
            }
        }

        if last_data_id != -1 {
            let new_gap = DataGap::created_at(
                last_data_id + 1,
                last_data_id + self.settings.largest_gap_size,
                now,
            );
            if changes.add(new_gap.clone()) {
                tracing::debug!("Inserting new last data gap: {}", new_gap);
            }
        }

        if !changes.added.is_empty() || !changes.deleted.is_empty() {
            self.store
                .replace_data_gaps(&changes.deleted, &changes.added)
                .await?;
            state.gaps = changes.all.into_iter().collect();
        }
        state.full_gap_analysis = false;
        if busy_expire {
            state.last_busy_expire_run_time = Some(Utc::now());
        }
        log_skipped_gaps(&skipped);
        Ok(())
    }

    /// Remove gaps that overlap their predecessor or follow the open-ended last gap.
    async fn fix_overlapping_gaps(&self, gaps: Vec<DataGap>) -> Result<Vec<DataGap>> {
        let largest = self.settings.largest_gap_size;
        let mut fixed: Vec<DataGap> = Vec::with_capacity(gaps.len());
        let mut deleted = Vec::new();
        let mut added = Vec::new();
        let mut last_gap: Option<DataGap> = None;

        for gap in gaps {
            if last_gap.is_some() {
                tracing::warn!("Removing gap found after last gap: {}", gap);
                deleted.push(gap);
                continue;
            }
            let mut current = gap;
            if current.gap_size() >= largest - 1 {
                last_gap = Some(current.clone());
            }
            if let Some(previous) = fixed.last() {
                if previous.overlaps(&current) {
                    tracing::warn!("Removing overlapping gaps: {}, {}", previous, current);
                    let merged = if last_gap.as_ref() == Some(&current) {
                        DataGap::new(previous.start_id, previous.start_id + largest - 1)
                    } else {
                        DataGap::new(previous.start_id, previous.end_id.max(current.end_id))
                    };
                    tracing::warn!("Inserting new gap to fix overlap: {}", merged);
                    deleted.push(previous.clone());
                    deleted.push(current);
                    added.push(merged.clone());
                    fixed.pop();
                    if last_gap.is_some() {
                        last_gap = Some(merged.clone());
                    }
                    current = merged;
                }
            }
            fixed.push(current);
        }

        if !deleted.is_empty() {
            self.store.replace_data_gaps(&deleted, &added).await?;
            tracing::info!("Fixed gaps: {:?}", fixed);
        }
        Ok(fixed)
    }

    /// Insert the open-ended last gap when the gap table is empty.
    async fn insert_last_gap(&self) -> Result<DataGap> {
        let below_min = self
            .store
            .min_data_id()
            .await?
            .map(|id| id - 1)
            .unwrap_or(0);
        let max_routed = self.store.max_routed_data_id().await?.unwrap_or(0);
        let start = below_min.max(max_routed) + 1;
        let gap = DataGap::new(start, start + self.settings.largest_gap_size - 1);
        tracing::info!("Inserting missing last data gap: {}", gap);
        self.store.replace_data_gaps(&[], &[gap.clone()]).await?;
        Ok(gap)
    }
}

/// Group sorted ids by the index of the gap that contains them.
fn map_ids_to_gaps(gaps: &[DataGap], sorted_ids: &[i64]) -> BTreeMap<usize, Vec<i64>> {
    let mut map: BTreeMap<usize, Vec<i64>> = BTreeMap::new();
    let mut ids = sorted_ids.iter().peekable();
    for (index, gap) in gaps.iter().enumerate() {
        while let Some(&&id) = ids.peek() {
            if id < gap.start_id {
                ids.next();
            } else if id <= gap.end_id {
                map.entry(index).or_default().push(id);
                ids.next();
            } else {
                break;
            }
        }
    }
    map
}

fn log_skipped_gaps(skipped: &[DataGap]) {
    let Some(first) = skipped.first() else {
        return;
    };
    if tracing::enabled!(tracing::Level::DEBUG) {
        for gap in skipped {
            if gap.start_id == gap.end_id {
                tracing::debug!(
                    "Expired data gap at data_id {} create_time {}.  Skipping it because the gap expired",
                    gap.start_id,
                    gap.create_time
                );
            } else {
                tracing::debug!(
                    "Expired data gap between data_id {} and {} create_time {}.  Skipping it because the gap expired",
                    gap.start_id,
                    gap.end_id,
                    gap.create_time
                );
            }
        }
        return;
    }
    let mut min_date = first.create_time;
    let mut max_date = first.create_time;
    let mut min_id = first.start_id;
    let mut max_id = first.end_id;
    for gap in skipped {
        min_date = min_date.min(gap.create_time);
        max_date = max_date.max(gap.create_time);
        min_id = min_id.min(gap.start_id);
        max_id = max_id.max(gap.end_id);
    }
    tracing::info!(
        "Expired {} data gap(s) between data_id {} and {} and between create_time {} and {}",
        skipped.len(),
        min_id,
        max_id,
        min_date,
        max_date
    );
}
