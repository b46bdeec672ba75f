//! Per-session detection state.
use serde::Serialize;

/// Source of history timestamps.
pub trait Clock: Send + Sync {
    /// Current wall-clock time as `HH:MM:SS`.
    fn timestamp(&self) -> String;
}

/// Local time of the host.
pub struct LocalClock;

impl Clock for LocalClock {
    fn timestamp(&self) -> String {
        chrono::Local::now().format("%H:%M:%S").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelCount {
    pub label: String,
    pub count: usize,
}

/// Label counts of a single run, in order of first appearance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: String,
    pub label_counts: Vec<LabelCount>,
}

impl HistoryEntry {
    /// How often `label` was detected in this run.
    pub fn count(&self, label: &str) -> usize {
        self.label_counts
            .iter()
            .find(|c| c.label == label)
            .map(|c| c.count)
            .unwrap_or(0)
    }
}

/// History laid out as rows over all classes ever seen in the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryTable {
    /// `"time"` followed by the class names in order of first appearance.
    pub columns: Vec<String>,
    pub rows: Vec<HistoryRow>,
}

impl Default for HistoryTable {
    fn default() -> Self {
        Self {
            columns: vec!["time".to_owned()],
            rows: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRow {
    pub time: String,
    /// One count per class column, 0 where the class was absent from the run.
    pub counts: Vec<usize>,
}

pub struct SessionState {
    recent_labels: Vec<String>,
    history: Vec<HistoryEntry>,
    clock: Box<dyn Clock>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::with_clock(Box::new(LocalClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        Self {
            recent_labels: Vec::new(),
            history: Vec::new(),
            clock,
        }
    }

    /// Replace the recent labels and, for non-empty runs, append a history entry.
    ///
    /// Runs without detections clear the recent labels but leave the history alone.
    pub fn record_run(&mut self, labels: Vec<String>) {
        if !labels.is_empty() {
            let mut label_counts: Vec<LabelCount> = Vec::new();
            for label in labels.iter() {
                match label_counts.iter_mut().find(|c| &c.label == label) {
                    Some(seen) => seen.count += 1,
                    None => label_counts.push(LabelCount {
                        label: label.clone(),
                        count: 1,
                    }),
                }
            }
            self.history.push(HistoryEntry {
                timestamp: self.clock.timestamp(),
                label_counts,
            });
        }
        self.recent_labels = labels;
    }

    pub fn reset(&mut self) {
        self.recent_labels.clear();
        self.history.clear();
    }

    pub fn recent_labels(&self) -> &[String] {
        &self.recent_labels
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn history_table(&self) -> HistoryTable {
        let mut classes: Vec<String> = Vec::new();
        for entry in self.history.iter() {
            for LabelCount { label, .. } in entry.label_counts.iter() {
                if !classes.contains(label) {
                    classes.push(label.clone());
                }
            }
        }

        let rows = self
            .history
            .iter()
            .map(|entry| HistoryRow {
                time: entry.timestamp.clone(),
                counts: classes
                    .iter()
                    .map(|class| entry.count(class))
                    .collect(),
            })
            .collect();

        let mut table = HistoryTable {
            rows,
            ..HistoryTable::default()
        };
        table.columns.extend(classes);
        table
    }
}
