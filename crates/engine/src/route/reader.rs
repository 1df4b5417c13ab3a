//! Background reader feeding change rows to the router.
//!
//! The reader runs on its own task and hands rows over a bounded channel.
//! Rows of the same source transaction are kept together: once a row with a
//! transaction id has been handed over, the rest of that transaction is
//! pulled out of the peek-ahead window before anything else.

use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sync_core::{Data, DataGap, DataRange, Store, SyncError};

use crate::params::EngineParameters;

/// What the reader did in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSummary {
    pub data_count: usize,
    /// False when the reader stopped at the channel's max data to route.
    pub all_data_read: bool,
}

/// Reader settings for one channel pass.
#[derive(Debug, Clone)]
pub struct ReaderSettings {
    pub channel_id: String,
    pub max_data_to_route: usize,
    pub nontransactional: bool,
    pub peek_ahead_window: usize,
    pub max_gaps_to_qualify: usize,
    pub greater_than_threshold: usize,
    pub take_timeout: Duration,
}

impl ReaderSettings {
    pub fn new(
        channel_id: impl Into<String>,
        max_data_to_route: usize,
        nontransactional: bool,
        params: &EngineParameters,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            max_data_to_route,
            nontransactional,
            peek_ahead_window: params.routing_peek_ahead_window.max(1),
            max_gaps_to_qualify: params.routing_max_gaps_to_qualify_in_sql.max(1),
            greater_than_threshold: params
                .routing_data_reader_threshold_gaps_to_use_greater_query,
            take_timeout: params.routing_wait_for_data_timeout(),
        }
    }
}

type Message = Result<Option<Data>>;

/// Router-side handle of a running reader.
pub struct DataGapRouteReader {
    receiver: mpsc::Receiver<Message>,
    handle: Option<JoinHandle<ReadSummary>>,
    take_timeout: Duration,
    finished: bool,
}

impl DataGapRouteReader {
    /// Spawn a reader over `gaps` for one channel.
    pub fn start(
        store: Arc<dyn Store>,
        gaps: Vec<DataGap>,
        settings: ReaderSettings,
        greater_query_in_use: Arc<AtomicBool>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(settings.peek_ahead_window);
        let take_timeout = settings.take_timeout;
        let producer = Producer {
            store,
            settings,
            sender,
            greater_query_in_use,
        };
        let handle = tokio::spawn(producer.run(gaps));
        Self {
            receiver,
            handle: Some(handle),
            take_timeout,
            finished: false,
        }
    }

    /// Next row in routing order, or `None` once the reader is done.
    pub async fn take(&mut self) -> Result<Option<Data>> {
        if self.finished {
            return Ok(None);
        }
        match tokio::time::timeout(self.take_timeout, self.receiver.recv()).await {
            Err(_) => Err(SyncError::Timeout(
                "The read of the data to route queue has timed out".to_string(),
            )
            .into()),
            Ok(None) | Ok(Some(Ok(None))) => {
                self.finished = true;
                Ok(None)
            }
            Ok(Some(Ok(Some(data)))) => Ok(Some(data)),
            Ok(Some(Err(e))) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    /// Stop the reader and collect its summary.
    pub async fn finish(mut self) -> ReadSummary {
        self.receiver.close();
        let handle = self.handle.take();
        match handle {
            Some(handle) => handle.await.unwrap_or(ReadSummary {
                data_count: 0,
                all_data_read: false,
            }),
            None => ReadSummary {
                data_count: 0,
                all_data_read: false,
            },
        }
    }
}

impl Drop for DataGapRouteReader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Producer {
    store: Arc<dyn Store>,
    settings: ReaderSettings,
    sender: mpsc::Sender<Message>,
    greater_query_in_use: Arc<AtomicBool>,
}

/// Keyset cursor over the change log restricted to the current gaps.
struct GapCursor {
    range: DataRange,
    gaps: std::collections::VecDeque<DataGap>,
    current_gap: Option<DataGap>,
    last_data_id: i64,
    page: std::collections::VecDeque<Data>,
    exhausted: bool,
}

impl GapCursor {
    /// Whether a row falls inside a gap, advancing past gaps that are behind it.
    fn process(&mut self, data_id: i64) -> bool {
        while let Some(gap) = &self.current_gap {
            if data_id < gap.start_id {
                return false;
            }
            if data_id <= gap.end_id {
                return true;
            }
            self.current_gap = self.gaps.pop_front();
        }
        false
    }
}

impl Producer {
    async fn run(self, gaps: Vec<DataGap>) -> ReadSummary {
        let summary = match self.execute(gaps).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(
                    "Failed to read data to route on channel {}: {:#}",
                    self.settings.channel_id,
                    e
                );
                let _ = self.sender.send(Err(e)).await;
                return ReadSummary {
                    data_count: 0,
                    all_data_read: false,
                };
            }
        };
        let _ = self.sender.send(Ok(None)).await;
        summary
    }

    async fn execute(&self, gaps: Vec<DataGap>) -> Result<ReadSummary> {
        let Some(mut cursor) = self.prepare_cursor(gaps) else {
            return Ok(ReadSummary {
                data_count: 0,
                all_data_read: true,
            });
        };
        let max = self.settings.max_data_to_route;
        let window = self.settings.peek_ahead_window;
        let mut peek_ahead: Vec<Data> = Vec::with_capacity(window);
        let mut last_transaction_id: Option<String> = None;
        let mut data_count = 0usize;
        let mut more_data = true;

        while data_count <= max || last_transaction_id.is_some() {
            if more_data {
                more_data = self.fill_peek_ahead(&mut peek_ahead, &mut cursor).await?;
            }
            if peek_ahead.is_empty() {
                return Ok(ReadSummary {
                    data_count,
                    all_data_read: true,
                });
            }
            if last_transaction_id.is_none() || self.settings.nontransactional {
                let data = peek_ahead.remove(0);
                last_transaction_id = data.transaction_id.clone();
                if !self.hand_over(data).await {
                    return Ok(self.stopped(data_count));
                }
                data_count += 1;
            } else {
                let current = last_transaction_id.clone();
                let (same, rest): (Vec<Data>, Vec<Data>) = std::mem::take(&mut peek_ahead)
                    .into_iter()
                    .partition(|d| d.transaction_id == current);
                peek_ahead = rest;
                if same.is_empty() {
                    last_transaction_id = None;
                }
                for data in same {
                    if !self.hand_over(data).await {
                        return Ok(self.stopped(data_count));
                    }
                    data_count += 1;
                }
            }
        }

        let all_data_read = !more_data && peek_ahead.is_empty();
        Ok(ReadSummary {
            data_count,
            all_data_read,
        })
    }

    fn stopped(&self, data_count: usize) -> ReadSummary {
        ReadSummary {
            data_count,
            all_data_read: false,
        }
    }

    /// Send one row to the router. Returns false when the router has gone away.
    async fn hand_over(&self, data: Data) -> bool {
        self.sender.send(Ok(Some(data))).await.is_ok()
    }

    fn prepare_cursor(&self, gaps: Vec<DataGap>) -> Option<GapCursor> {
        let mut gaps: std::collections::VecDeque<DataGap> = gaps.into();
        let first = gaps.front()?.clone();
        let settings = &self.settings;

        let use_greater_than =
            settings.greater_than_threshold > 0 && gaps.len() > settings.greater_than_threshold;
        let range = if use_greater_than {
            if !self.greater_query_in_use.swap(true, Ordering::SeqCst) {
                tracing::info!("Switching to select from the data table where data_id >= start gap");
            }
            DataRange::StartingAt(first.start_id)
        } else {
            if self.greater_query_in_use.swap(false, Ordering::SeqCst) {
                tracing::info!("Switching to select from the data table where data_id between gaps");
            }
            let qualified = settings.max_gaps_to_qualify.min(gaps.len());
            let last_end = gaps.back().map(|g| g.end_id).unwrap_or(first.end_id);
            let ranges = gaps
                .iter()
                .take(qualified)
                .enumerate()
                .map(|(i, gap)| {
                    if i + 1 == qualified && qualified < gaps.len() {
                        (gap.start_id, last_end)
                    } else {
                        (gap.start_id, gap.end_id)
                    }
                })
                .collect();
            DataRange::Ranges(ranges)
        };

        let current_gap = gaps.pop_front();
        Some(GapCursor {
            range,
            gaps,
            current_gap,
            last_data_id: first.start_id - 1,
            page: std::collections::VecDeque::new(),
            exhausted: false,
        })
    }

    /// Top the peek-ahead window up. Returns false once the cursor is exhausted.
    async fn fill_peek_ahead(&self, peek_ahead: &mut Vec<Data>, cursor: &mut GapCursor) -> Result<bool> {
        let window = self.settings.peek_ahead_window;
        while peek_ahead.len() < window {
            if cursor.page.is_empty() {
                if cursor.exhausted {
                    return Ok(false);
                }
                let page = self
                    .store
                    .select_data(&self.settings.channel_id, &cursor.range, cursor.last_data_id, window)
                    .await?;
                if page.len() < window {
                    cursor.exhausted = true;
                }
                if let Some(last) = page.last() {
                    cursor.last_data_id = last.data_id;
                }
                cursor.page.extend(page);
                if cursor.page.is_empty() {
                    return Ok(false);
                }
            }
            if let Some(data) = cursor.page.pop_front() {
                if cursor.process(data.data_id) {
                    peek_ahead.push(data);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{DataEventType, DataStore, MemoryStore};

    fn row(channel: &str, tx: Option<&str>) -> Data {
        let data = Data::new("item", DataEventType::Insert, 1, channel);
        match tx {
            Some(tx) => data.with_transaction_id(tx),
            None => data,
        }
    }

    fn settings(max: usize, nontransactional: bool) -> ReaderSettings {
        let params = EngineParameters {
            routing_peek_ahead_window: 3,
            ..EngineParameters::default()
        };
        ReaderSettings::new("default", max, nontransactional, &params)
    }

    async fn read_all(store: &MemoryStore, gaps: Vec<DataGap>, settings: ReaderSettings) -> (Vec<i64>, ReadSummary) {
        let mut reader = DataGapRouteReader::start(
            Arc::new(store.clone()),
            gaps,
            settings,
            Arc::new(AtomicBool::new(false)),
        );
        let mut ids = Vec::new();
        while let Some(data) = reader.take().await.unwrap() {
            ids.push(data.data_id);
        }
        (ids, reader.finish().await)
    }

    #[tokio::test]
    async fn test_reads_only_inside_gaps_and_channel() {
        let store = MemoryStore::new();
        for channel in ["default", "default", "other", "default", "default"] {
            store.insert_data(&row(channel, None)).await.unwrap();
        }
        let gaps = vec![DataGap::new(2, 2), DataGap::new(4, 1000)];
        let (ids, summary) = read_all(&store, gaps, settings(100, false)).await;
        assert_eq!(ids, vec![2, 4, 5]);
        assert!(summary.all_data_read);
    }

    #[tokio::test]
    async fn test_transaction_rows_are_kept_together() {
        let store = MemoryStore::new();
        for tx in ["a", "b", "a", "b", "a"] {
            store.insert_data(&row("default", Some(tx))).await.unwrap();
        }
        let (ids, _) = read_all(&store, vec![DataGap::new(1, 1000)], settings(100, false)).await;
        // window of 3 holds 1,2,3 first, so transaction a pulls 3 forward
        assert_eq!(ids, vec![1, 3, 5, 2, 4]);

        let (ids, _) = read_all(&store, vec![DataGap::new(1, 1000)], settings(100, true)).await;
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stops_at_max_data_to_route() {
        let store = MemoryStore::new();
        for _ in 0..10 {
            store.insert_data(&row("default", None)).await.unwrap();
        }
        let (ids, summary) = read_all(&store, vec![DataGap::new(1, 1000)], settings(4, false)).await;
        assert_eq!(ids.len(), 5);
        assert!(!summary.all_data_read);
    }

    #[tokio::test]
    async fn test_greater_than_query_when_many_gaps() {
        let store = MemoryStore::new();
        for _ in 0..6 {
            store.insert_data(&row("default", None)).await.unwrap();
        }
        let params = EngineParameters {
            routing_data_reader_threshold_gaps_to_use_greater_query: 2,
            ..EngineParameters::default()
        };
        let settings = ReaderSettings::new("default", 100, false, &params);
        let in_use = Arc::new(AtomicBool::new(false));
        let gaps = vec![DataGap::new(1, 1), DataGap::new(3, 3), DataGap::new(5, 1000)];
        let mut reader =
            DataGapRouteReader::start(Arc::new(store.clone()), gaps, settings, Arc::clone(&in_use));
        let mut ids = Vec::new();
        while let Some(data) = reader.take().await.unwrap() {
            ids.push(data.data_id);
        }
        reader.finish().await;
        assert_eq!(ids, vec![1, 3, 5, 6]);
        assert!(in_use.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_last_qualified_range_extends_to_final_gap() {
        let store = MemoryStore::new();
        for _ in 0..8 {
            store.insert_data(&row("default", None)).await.unwrap();
        }
        let params = EngineParameters {
            routing_max_gaps_to_qualify_in_sql: 2,
            ..EngineParameters::default()
        };
        let settings = ReaderSettings::new("default", 100, false, &params);
        let gaps = vec![DataGap::new(1, 1), DataGap::new(3, 3), DataGap::new(7, 1000)];
        let (ids, _) = read_all(&store, gaps, settings).await;
        assert_eq!(ids, vec![1, 3, 7, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_times_out() {
        let (_sender, receiver) = mpsc::channel::<Message>(1);
        let mut reader = DataGapRouteReader {
            receiver,
            handle: None,
            take_timeout: Duration::from_secs(330),
            finished: false,
        };
        let err = reader.take().await.unwrap_err();
        assert!(matches!(SyncError::find(&err), Some(SyncError::Timeout(_))));
    }
}
