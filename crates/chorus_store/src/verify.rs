//! Per-key linearizability oracle.
//!
//! Verifies that no observation views history backwards or forwards in time:
//! the periods each unique sequence is witnessable for are disjoint, and
//! every sequence is a prefix of any sequence witnessed later. Violations are
//! explicit values rather than panics, so tests assert on them.

use std::collections::VecDeque;
use std::fmt;

/// A detected history violation on one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryViolation {
    pub key: u64,
    pub message: String,
}

impl fmt::Display for HistoryViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "history violation on {}: {}", self.key, self.message)
    }
}

impl std::error::Error for HistoryViolation {}

/// Per-event record: where it sits in the sequence, the window it was
/// provably visible in, and whether its write reported success.
struct Event {
    event_id: i64,
    event_position: i64,
    sequence: Option<Vec<u32>>,
    /// Witnessed by at least this time.
    visible_by: i64,
    /// Witnessed until at least this time (nothing newer seen by then).
    visible_until: i64,
    /// None = unknown, Some(true) = success, Some(false) = implied absent.
    result: Option<bool>,
}

impl Event {
    fn new(event_id: i64) -> Event {
        Event {
            event_id,
            event_position: -1,
            sequence: None,
            visible_by: i64::MAX,
            visible_until: -1,
            result: None,
        }
    }
}

/// Linearizability checker for a single key.
pub struct LinearizabilityVerifier {
    key: u64,
    arena: Vec<Event>,
    /// sequence position -> event
    events: Vec<Option<usize>>,
    /// event id -> event
    by_id: Vec<Option<usize>>,
    unwitnessed: VecDeque<usize>,
}

impl LinearizabilityVerifier {
    pub fn new(key: u64) -> LinearizabilityVerifier {
        LinearizabilityVerifier {
            key,
            arena: Vec::new(),
            events: Vec::new(),
            by_id: Vec::new(),
            unwitnessed: VecDeque::new(),
        }
    }

    fn fail(&self, message: String) -> HistoryViolation {
        HistoryViolation {
            key: self.key,
            message,
        }
    }

    /// Record a read that observed `sequence` over the logical interval
    /// [start, end].
    pub fn witness_read(
        &mut self,
        sequence: &[u32],
        start: i64,
        end: i64,
    ) -> Result<(), HistoryViolation> {
        let position = sequence.len();
        let event_id = if position == 0 {
            -1
        } else {
            i64::from(sequence[position - 1])
        };
        let event = self.get(position, event_id)?;
        self.record_witness(event, position, sequence)?;
        self.record_visible_by(event, end)?;
        self.record_visible_until(event, start)?;

        // Events that must have been visible before this read started but
        // were not observed can be ruled out as failed; if one already
        // reported success, the history is broken.
        let mut idx = 0;
        while idx < self.unwitnessed.len() {
            let event = self.unwitnessed[idx];
            if self.arena[event].visible_by < start {
                match self.arena[event].result {
                    None => {
                        // Still reachable by id, so a later sighting flags
                        // the inconsistency.
                        self.arena[event].result = Some(false);
                        self.unwitnessed.remove(idx);
                        continue;
                    }
                    Some(true) => {
                        return Err(self.fail(format!(
                            "{} witnessed as absent at T{}",
                            self.arena[event].event_id, end
                        )));
                    }
                    Some(false) => {}
                }
            }
            idx += 1;
        }
        Ok(())
    }

    /// Record a write of `event_id` over [start, end]. `success` is false
    /// when the writer's outcome is unknown (e.g. a timed-out client).
    pub fn witness_write(
        &mut self,
        event_id: u32,
        start: i64,
        end: i64,
        success: bool,
    ) -> Result<(), HistoryViolation> {
        let id = event_id as usize;
        if self.by_id.len() <= id {
            self.by_id.resize(id + 1 + id / 2, None);
        }
        let event = match self.by_id[id] {
            Some(event) => event,
            None => {
                let event = self.alloc(Event::new(i64::from(event_id)));
                self.by_id[id] = Some(event);
                self.unwitnessed.push_back(event);
                event
            }
        };

        self.record_visible_until(event, start)?;
        // Even when the outcome is unknown, the write must be visible to
        // other operations by the time it terminates.
        self.record_visible_by(event, end)?;
        if success {
            if self.arena[event].result == Some(false) {
                return Err(self.fail(format!(
                    "witnessed absence of {event_id} but event returned success"
                )));
            }
            self.arena[event].result = Some(true);
        }
        Ok(())
    }

    fn alloc(&mut self, event: Event) -> usize {
        self.arena.push(event);
        self.arena.len() - 1
    }

    fn record_witness(
        &mut self,
        event: usize,
        position: usize,
        sequence: &[u32],
    ) -> Result<(), HistoryViolation> {
        let mut event = event;
        let mut position = position;
        let mut sequence = sequence.to_vec();
        loop {
            if let Some(existing) = &self.arena[event].sequence {
                if *existing != sequence {
                    return Err(self.fail(format!(
                        "{sequence:?} previously witnessed as {existing:?}"
                    )));
                }
                return Ok(());
            }

            self.arena[event].sequence = Some(sequence.clone());
            self.arena[event].event_position = position as i64;

            let Some(prev) = self.prev(event)? else {
                return Ok(());
            };

            if let Some(prev_seq) = &self.arena[prev].sequence {
                // The predecessor must hold a strict prefix.
                let check = sequence.len().saturating_sub(1);
                if prev_seq.len() < check || prev_seq[..check] != sequence[..check] {
                    return Err(self.fail(format!(
                        "{sequence:?} conflicts with earlier witness {prev_seq:?}"
                    )));
                }
                return Ok(());
            }

            // The predecessor was never witnessed directly; witness it by
            // implication from this observation.
            position -= 1;
            sequence.truncate(position);
            event = prev;
        }
    }

    fn record_visible_by(&mut self, event: usize, visible_by: i64) -> Result<(), HistoryViolation> {
        if visible_by >= self.arena[event].visible_by {
            return Ok(());
        }
        self.arena[event].visible_by = visible_by;
        if let Some(prev) = self.prev(event)? {
            if self.arena[prev].visible_until >= visible_by {
                return Err(self.fail(format!(
                    "{:?} {} not witnessed >= {}, but also witnessed <= {}",
                    self.arena[event].sequence,
                    self.arena[event].event_id,
                    self.arena[prev].visible_until,
                    visible_by
                )));
            }
        }
        Ok(())
    }

    fn record_visible_until(
        &mut self,
        event: usize,
        visible_until: i64,
    ) -> Result<(), HistoryViolation> {
        if visible_until <= self.arena[event].visible_until {
            return Ok(());
        }
        self.arena[event].visible_until = visible_until;
        if let Some(next) = self.next(event) {
            if visible_until >= self.arena[next].visible_by {
                return Err(self.fail(format!(
                    "{:?} {} not witnessed >= {}, but also witnessed <= {}",
                    self.arena[next].sequence,
                    self.arena[next].event_id,
                    visible_until,
                    self.arena[next].visible_by
                )));
            }
        }
        Ok(())
    }

    /// The event representing both `position` and `event_id`, created or
    /// imported from the by-id table on first sight. A duplicate
    /// (eventId, position) pairing is a violation.
    fn get(&mut self, position: usize, event_id: i64) -> Result<usize, HistoryViolation> {
        if position >= self.events.len() {
            self.events
                .resize((position + 1).max(self.events.len() * 2), None);
        }

        if let Some(event) = self.events[position] {
            if event_id != self.arena[event].event_id {
                return Err(self.fail(format!(
                    "(eventId, position): ({event_id}, {position}) != ({}, {})",
                    self.arena[event].event_id, self.arena[event].event_position
                )));
            }
            if position as i64 != self.arena[event].event_position {
                return Err(self.fail(format!(
                    "{event_id} occurs at positions {position} and {}",
                    self.arena[event].event_position
                )));
            }
            return Ok(event);
        }

        if event_id < 0 {
            debug_assert_eq!(event_id, -1);
            let event = self.alloc(Event::new(event_id));
            self.arena[event].event_position = position as i64;
            self.events[position] = Some(event);
            return Ok(event);
        }

        let id = event_id as usize;
        if self.by_id.len() <= id {
            self.by_id.resize(id + 1 + id / 2, None);
        }
        match self.by_id[id] {
            Some(event) => {
                if self.arena[event].event_position >= 0 {
                    return Err(self.fail(format!(
                        "{event_id} occurs at positions {position} and {}",
                        self.arena[event].event_position
                    )));
                }
                self.arena[event].event_position = position as i64;
                self.events[position] = Some(event);
                self.unwitnessed.retain(|e| *e != event);
                Ok(event)
            }
            None => {
                let event = self.alloc(Event::new(event_id));
                self.arena[event].event_position = position as i64;
                self.by_id[id] = Some(event);
                self.events[position] = Some(event);
                Ok(event)
            }
        }
    }

    fn prev(&mut self, event: usize) -> Result<Option<usize>, HistoryViolation> {
        // Without an observed sequence the predecessor is unknowable.
        let Some(sequence) = self.arena[event].sequence.clone() else {
            return Ok(None);
        };
        let position = self.arena[event].event_position - 1;
        if position < 0 {
            return Ok(None);
        }
        let position = position as usize;
        let event_id = if position == 0 {
            -1
        } else {
            i64::from(sequence[position - 1])
        };
        self.get(position, event_id).map(Some)
    }

    fn next(&self, event: usize) -> Option<usize> {
        let position = self.arena[event].event_position + 1;
        if position <= 0 || position as usize >= self.events.len() {
            return None;
        }
        self.events[position as usize]
    }
}
