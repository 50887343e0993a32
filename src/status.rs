use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::cancel::CancelToken;
use crate::domain::ResourceId;
use crate::error::StplugError;

pub const CANCELLED_BY_USER: &str = "Cancelled by user";

pub trait StatusRecord: Clone + Default {
    /// A record that has started and not yet reached a terminal state.
    fn is_active(&self) -> bool;
    fn is_terminal(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadPhase {
    Queued,
    Checking,
    Downloading,
    Processing,
    Installing,
    Done,
    Failed,
    Cancelled,
}

impl DownloadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadPhase::Done | DownloadPhase::Failed | DownloadPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FixPhase {
    Queued,
    Downloading,
    Extracting,
    Done,
    Failed,
    Cancelled,
}

impl FixPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, FixPhase::Done | FixPhase::Failed | FixPhase::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnfixPhase {
    Queued,
    Removing,
    Done,
    Failed,
}

impl UnfixPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnfixPhase::Done | UnfixPhase::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStatus {
    pub status: Option<DownloadPhase>,
    pub current_source: Option<String>,
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub destination: Option<Utf8PathBuf>,
    pub error: Option<String>,
    pub installed_path: Option<Utf8PathBuf>,
    pub success: bool,
    pub api_used: Option<String>,
}

impl DownloadStatus {
    pub fn queued() -> Self {
        Self {
            status: Some(DownloadPhase::Queued),
            ..Self::default()
        }
    }
}

impl StatusRecord for DownloadStatus {
    fn is_active(&self) -> bool {
        self.status.is_some_and(|phase| !phase.is_terminal())
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(DownloadPhase::is_terminal)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FixStatus {
    pub status: Option<FixPhase>,
    pub bytes_read: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub success: bool,
    pub files_extracted: usize,
}

impl FixStatus {
    pub fn queued() -> Self {
        Self {
            status: Some(FixPhase::Queued),
            ..Self::default()
        }
    }
}

impl StatusRecord for FixStatus {
    fn is_active(&self) -> bool {
        self.status.is_some_and(|phase| !phase.is_terminal())
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(FixPhase::is_terminal)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnfixStatus {
    pub status: Option<UnfixPhase>,
    pub progress: String,
    pub error: Option<String>,
    pub success: bool,
    pub files_removed: usize,
}

impl UnfixStatus {
    pub fn queued() -> Self {
        Self {
            status: Some(UnfixPhase::Queued),
            ..Self::default()
        }
    }
}

impl StatusRecord for UnfixStatus {
    fn is_active(&self) -> bool {
        self.status.is_some_and(|phase| !phase.is_terminal())
    }

    fn is_terminal(&self) -> bool {
        self.status.is_some_and(UnfixPhase::is_terminal)
    }
}

/// Returned once a background run has been queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub id: ResourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NothingToCancel,
}

/// Handed to the worker that owns one run of a record. Updates made through
/// a ticket from an older run are discarded.
#[derive(Debug, Clone)]
pub struct Ticket {
    id: ResourceId,
    generation: u64,
    token: CancelToken,
}

impl Ticket {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

struct Slot<T> {
    generation: u64,
    token: CancelToken,
    record: T,
}

struct MapState<T> {
    next_generation: u64,
    slots: HashMap<ResourceId, Slot<T>>,
}

impl<T> MapState<T> {
    fn fresh_slot(&mut self, record: T) -> Slot<T> {
        self.next_generation += 1;
        Slot {
            generation: self.next_generation,
            token: CancelToken::new(),
            record,
        }
    }
}

/// Per-id status records behind a single mutex.
pub struct StatusMap<T> {
    state: Mutex<MapState<T>>,
}

impl<T> Default for StatusMap<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(MapState {
                next_generation: 0,
                slots: HashMap::new(),
            }),
        }
    }
}

impl<T: StatusRecord> StatusMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MapState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot copy; an unknown id yields the empty record.
    pub fn get(&self, id: ResourceId) -> T {
        self.lock()
            .slots
            .get(&id)
            .map(|slot| slot.record.clone())
            .unwrap_or_default()
    }

    /// Read-modify-write, creating the record on first use. Terminal records
    /// are left untouched. Returns whether the update was applied.
    pub fn merge(&self, id: ResourceId, update: impl FnOnce(&mut T)) -> bool {
        let mut state = self.lock();
        if !state.slots.contains_key(&id) {
            let slot = state.fresh_slot(T::default());
            state.slots.insert(id, slot);
        }
        match state.slots.get_mut(&id) {
            Some(slot) if !slot.record.is_terminal() => {
                update(&mut slot.record);
                true
            }
            _ => false,
        }
    }

    /// Starts a new run for `id`, replacing a finished or absent record.
    pub fn begin(&self, id: ResourceId, initial: T) -> Result<Ticket, StplugError> {
        let mut state = self.lock();
        if state
            .slots
            .get(&id)
            .is_some_and(|slot| slot.record.is_active())
        {
            return Err(StplugError::AlreadyRunning(id.get()));
        }
        let slot = state.fresh_slot(initial);
        let ticket = Ticket {
            id,
            generation: slot.generation,
            token: slot.token.clone(),
        };
        state.slots.insert(id, slot);
        Ok(ticket)
    }

    /// Applies `update` only if the ticket still owns the record and the
    /// record is not terminal.
    pub fn update(&self, ticket: &Ticket, update: impl FnOnce(&mut T)) -> bool {
        let mut state = self.lock();
        match state.slots.get_mut(&ticket.id) {
            Some(slot) if slot.generation == ticket.generation && !slot.record.is_terminal() => {
                update(&mut slot.record);
                true
            }
            _ => false,
        }
    }

    /// Marks an active record cancelled via `mark` and fires its token.
    pub fn cancel(&self, id: ResourceId, mark: impl FnOnce(&mut T)) -> CancelOutcome {
        let mut state = self.lock();
        match state.slots.get_mut(&id) {
            Some(slot) if slot.record.is_active() => {
                mark(&mut slot.record);
                slot.token.cancel();
                CancelOutcome::Cancelled
            }
            _ => CancelOutcome::NothingToCancel,
        }
    }
}

/// The three independent status partitions.
#[derive(Default)]
pub struct StatusStore {
    pub downloads: StatusMap<DownloadStatus>,
    pub fixes: StatusMap<FixStatus>,
    pub unfixes: StatusMap<UnfixStatus>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn id(value: u32) -> ResourceId {
        ResourceId::new(value).unwrap()
    }

    #[test]
    fn absent_id_yields_empty_record() {
        let map = StatusMap::<DownloadStatus>::new();
        assert_eq!(map.get(id(1)), DownloadStatus::default());
    }

    #[test]
    fn merge_creates_and_stops_at_terminal() {
        let map = StatusMap::<DownloadStatus>::new();
        assert!(map.merge(id(7), |s| s.status = Some(DownloadPhase::Checking)));
        assert!(map.merge(id(7), |s| s.status = Some(DownloadPhase::Done)));
        assert!(!map.merge(id(7), |s| s.status = Some(DownloadPhase::Checking)));
        assert_eq!(map.get(id(7)).status, Some(DownloadPhase::Done));
    }

    #[test]
    fn begin_rejects_while_active() {
        let map = StatusMap::<FixStatus>::new();
        let _ticket = map.begin(id(3), FixStatus::queued()).unwrap();
        assert_matches!(
            map.begin(id(3), FixStatus::queued()),
            Err(StplugError::AlreadyRunning(3))
        );
    }

    #[test]
    fn stale_ticket_updates_are_discarded() {
        let map = StatusMap::<DownloadStatus>::new();
        let first = map.begin(id(5), DownloadStatus::queued()).unwrap();
        assert_eq!(
            map.cancel(id(5), |s| s.status = Some(DownloadPhase::Cancelled)),
            CancelOutcome::Cancelled
        );
        assert!(first.token().is_cancelled());

        let second = map.begin(id(5), DownloadStatus::queued()).unwrap();
        assert!(!map.update(&first, |s| s.bytes_read = 99));
        assert!(map.update(&second, |s| s.bytes_read = 1));
        assert_eq!(map.get(id(5)).bytes_read, 1);
        assert!(!second.token().is_cancelled());
    }

    #[test]
    fn cancel_is_a_no_op_on_terminal_or_absent() {
        let map = StatusMap::<UnfixStatus>::new();
        assert_eq!(map.cancel(id(9), |_| {}), CancelOutcome::NothingToCancel);
        let ticket = map.begin(id(9), UnfixStatus::queued()).unwrap();
        map.update(&ticket, |s| s.status = Some(UnfixPhase::Done));
        assert_eq!(map.cancel(id(9), |_| {}), CancelOutcome::NothingToCancel);
        assert!(!ticket.token().is_cancelled());
    }
}
