use std::sync::{Arc, Weak};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use shared::types::ServiceIdentity;
use crate::record::{RecordUpdate, RemoteRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionEvent {
    RecordSelected(Option<ServiceIdentity>),
    CategorySelected(Option<usize>),
    /// A facet of the selected record and category finished fetching
    Updated(RecordUpdate),
}

#[derive(Default)]
struct State {
    record: Option<Arc<RemoteRecord>>,
    category: Option<usize>,
    /// Bumped on every record change; listeners from older generations are ignored
    generation: u64,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<SelectionEvent>,
}

impl Inner {
    fn forward(&self, generation: u64, update: &RecordUpdate) {
        // Checked and sent under the lock so a concurrent deselect cannot slip in between
        let state = self.state.lock();
        if state.generation != generation {
            return;
        }
        let Some(selected) = state.record.as_ref() else {
            return;
        };
        if *selected.identity() != update.identity {
            return;
        }
        match update.category {
            Some(category) if state.category == Some(category) => {
                let _ = self.events.send(SelectionEvent::Updated(update.clone()));
            }
            _ => {}
        }
    }
}

/// The operator's current record and category, with update fan-out to observers.
#[derive(Clone)]
pub struct Selection {
    inner: Arc<Inner>,
}

impl Selection {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SelectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn selected_record(&self) -> Option<Arc<RemoteRecord>> {
        self.inner.state.lock().record.clone()
    }

    pub fn selected_category(&self) -> Option<usize> {
        self.inner.state.lock().category
    }

    /// Switch records. The category is reset to none.
    pub fn select_record(&self, record: Option<Arc<RemoteRecord>>) {
        let mut state = self.inner.state.lock();
        self.replace_record(&mut state, record);
    }

    pub fn select_category(&self, category: Option<usize>) {
        let mut state = self.inner.state.lock();
        state.category = category;
        let _ = self.inner.events.send(SelectionEvent::CategorySelected(category));
    }

    /// Deselect `identity` if it is the selected record.
    pub fn forget(&self, identity: &ServiceIdentity) {
        let mut state = self.inner.state.lock();
        let selected = state.record.as_ref().is_some_and(|r| r.identity() == identity);
        if selected {
            tracing::info!("Selected portal {} went away", identity);
            self.replace_record(&mut state, None);
        }
    }

    fn replace_record(&self, state: &mut State, record: Option<Arc<RemoteRecord>>) {
        if let Some(previous) = state.record.take() {
            previous.clear_update_listener();
        }
        state.generation += 1;
        state.category = None;

        if let Some(record) = &record {
            let inner: Weak<Inner> = Arc::downgrade(&self.inner);
            let generation = state.generation;
            record.set_update_listener(Arc::new(move |update: &RecordUpdate| {
                if let Some(inner) = inner.upgrade() {
                    inner.forward(generation, update);
                }
            }));
        }

        let identity = record.as_ref().map(|r| r.identity().clone());
        state.record = record;
        let _ = self.inner.events.send(SelectionEvent::RecordSelected(identity));
    }
}
