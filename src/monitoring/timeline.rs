//! Execution Timeline
//!
//! Tracks block start/end times of one job for result durations and
//! the Gantt chart logged when the job ends.

use std::fmt::Write as _;
use std::time::Duration;

use tokio::time::Instant;

/// Chart width in characters.
const CHART_WIDTH: f64 = 50.0;

/// Width of the block label column.
const LABEL_WIDTH: usize = 14;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
    /// Block interrupted by job cancellation
    Cancelled,
}

impl EventType {
    fn is_end(&self) -> bool {
        !matches!(self, EventType::Started)
    }
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub block_id: String,
    pub event_type: EventType,
    pub timestamp: Instant,
}

/// A block's span on the timeline, relative to the timeline start.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpan {
    pub block_id: String,
    pub start: Duration,
    pub end: Duration,
    pub outcome: EventType,
}

impl BlockSpan {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

/// Tracks the execution timeline of a job.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    /// Creates a new timeline starting now.
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    /// Records an event for a block and returns its time offset.
    pub fn record(&mut self, block_id: &str, event_type: EventType) -> Duration {
        let timestamp = Instant::now();
        self.events.push(TimelineEvent {
            block_id: block_id.to_string(),
            event_type,
            timestamp,
        });
        timestamp.duration_since(self.start_time)
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finished block spans in start order. Blocks still running are skipped.
    pub fn spans(&self) -> Vec<BlockSpan> {
        let mut spans: Vec<BlockSpan> = Vec::new();
        let mut open: Vec<(String, Duration)> = Vec::new();

        for event in &self.events {
            let offset = event.timestamp.duration_since(self.start_time);
            if !event.event_type.is_end() {
                open.retain(|(id, _)| id != &event.block_id);
                open.push((event.block_id.clone(), offset));
                continue;
            }
            if let Some(pos) = open.iter().position(|(id, _)| id == &event.block_id) {
                let (block_id, start) = open.remove(pos);
                spans.push(BlockSpan {
                    block_id,
                    start,
                    end: offset,
                    outcome: event.event_type,
                });
            }
        }

        spans.sort_by_key(|span| span.start);
        spans
    }

    /// Duration of the most recent finished run of `block_id`.
    pub fn duration_of(&self, block_id: &str) -> Option<Duration> {
        self.spans()
            .into_iter()
            .rev()
            .find(|span| span.block_id == block_id)
            .map(|span| span.duration())
    }

    /// Renders an ASCII Gantt chart of the finished blocks.
    ///
    /// Completed blocks are drawn with `#`, failed ones with `!` and
    /// cancelled ones with `-`.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("Execution Timeline:\n");
        let spans = self.spans();
        let total = spans
            .iter()
            .map(|span| span.end)
            .max()
            .unwrap_or_default()
            .max(self.elapsed())
            .as_millis()
            .max(1);
        let scale = CHART_WIDTH / total as f64;

        for span in &spans {
            let start_pos = (span.start.as_millis() as f64 * scale) as usize;
            let width = ((span.duration().as_millis() as f64 * scale) as usize).max(1);
            let mark = match span.outcome {
                EventType::Failed => "!",
                EventType::Cancelled => "-",
                _ => "#",
            };
            let _ = writeln!(
                output,
                "{} |{}{}| ({} ms)",
                label(&span.block_id),
                " ".repeat(start_pos),
                mark.repeat(width),
                span.duration().as_millis()
            );
        }

        let _ = write!(output, "Total: {} ms", total);
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a block id to the label width.
fn label(block_id: &str) -> String {
    if block_id.chars().count() <= LABEL_WIDTH {
        format!("{:width$}", block_id, width = LABEL_WIDTH)
    } else {
        let head: String = block_id.chars().take(LABEL_WIDTH - 3).collect();
        format!("{}...", head)
    }
}
