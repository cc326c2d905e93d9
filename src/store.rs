//! Stream-coherent revision cache.
//!
//! Membership in the store is only meaningful while the change stream is
//! connected: a `set` against a closed or connecting stream is a warn-level
//! no-op, because an entry written then could silently miss a visibility or
//! tag event and serve stale — or worse, supposedly-hidden — data.
//!
//! A non-privileged store subscribes to both the visibility-change and the
//! tags-change topics. A privileged store subscribes only to tags-change,
//! on the assumption that its consumers are allowed to see suppressed
//! data; because that assumption has safety implications, privileged mode
//! can only be selected through
//! [`StoreOptions::privileged_acknowledging_suppression`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

use crate::events::{ChangeEvent, ChangeStream, StreamState, Topic};
use crate::models::Revision;

/// Construction options for [`RevisionStore`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    privileged: bool,
    autostart: bool,
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the change stream at construction.
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Skip the visibility-change subscription. The store will keep serving
    /// field values that the wiki has since hidden; callers must be
    /// entitled to see suppressed data.
    pub fn privileged_acknowledging_suppression(mut self) -> Self {
        self.privileged = true;
        self
    }
}

/// Shared map of `(wiki, revid)` → expanded revision.
pub struct RevisionStore {
    map: Mutex<HashMap<(String, u64), Revision>>,
    stream: ChangeStream,
    state_rx: watch::Receiver<StreamState>,
    topics: Vec<Topic>,
}

impl RevisionStore {
    pub fn new(options: StoreOptions) -> Arc<Self> {
        let topics = if options.privileged {
            vec![Topic::TagsChange]
        } else {
            vec![Topic::VisibilityChange, Topic::TagsChange]
        };
        let stream = ChangeStream::new(&topics);
        let state_rx = stream.state();
        let store = Arc::new(Self {
            map: Mutex::new(HashMap::new()),
            stream,
            state_rx,
            topics,
        });
        if options.autostart {
            store.start_stream();
        }
        store
    }

    #[cfg(test)]
    fn new_detached(options: StoreOptions) -> (Arc<Self>, watch::Sender<StreamState>) {
        let topics = if options.privileged {
            vec![Topic::TagsChange]
        } else {
            vec![Topic::VisibilityChange, Topic::TagsChange]
        };
        let (tx, rx) = watch::channel(StreamState::Closed);
        let store = Arc::new(Self {
            map: Mutex::new(HashMap::new()),
            stream: ChangeStream::new(&topics),
            state_rx: rx,
            topics,
        });
        (store, tx)
    }

    /// Topics this store subscribes to when the stream starts.
    pub fn subscribed_topics(&self) -> &[Topic] {
        &self.topics
    }

    /// Starts the change stream and the event-application task. Idempotent:
    /// repeated starts on an already Connecting or Open stream are no-ops.
    pub fn start_stream(self: &Arc<Self>) {
        if *self.state_rx.borrow() != StreamState::Closed {
            return;
        }
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(256);
        self.stream.start(tx);

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                store.apply_event(event);
            }
        });
    }

    /// Closes the stream; later `set` calls become no-ops until restart.
    pub fn stop_stream(&self) {
        self.stream.stop();
    }

    /// Stores a revision — but only while the stream is Open. Otherwise the
    /// write is dropped with a warning and the rest of the state is
    /// preserved.
    pub fn set(&self, wiki: &str, revision: Revision) {
        if *self.state_rx.borrow() != StreamState::Open {
            tracing::warn!(
                wiki,
                revid = revision.revid(),
                "revision store write ignored: change stream is not open"
            );
            return;
        }
        let revid = revision.revid();
        self.map
            .lock()
            .unwrap()
            .insert((wiki.to_string(), revid), revision);
    }

    pub fn get(&self, wiki: &str, revid: u64) -> Option<Revision> {
        self.map
            .lock()
            .unwrap()
            .get(&(wiki.to_string(), revid))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }

    /// Applies one stream event. Events for untracked revids are ignored.
    pub(crate) fn apply_event(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::VisibilityChange {
                wiki,
                revid,
                hidden,
            } => {
                let mut map = self.map.lock().unwrap();
                let key = (wiki, revid);
                let Some(Revision::Live(old)) = map.get(&key) else {
                    return;
                };
                // Rewrite with a fresh value: blank what the event hides,
                // attach the snapshot. A cleared flag cannot restore a
                // field that was blanked earlier — the data is gone.
                let mut updated = old.clone();
                if hidden.user {
                    updated.user = None;
                }
                if hidden.comment {
                    updated.comment = None;
                    updated.parsedcomment = None;
                }
                updated.visibility = Some(hidden);
                map.insert(key, Revision::Live(updated));
                tracing::debug!(revid, "visibility rewrite applied");
            }
            ChangeEvent::TagsChange { wiki, revid, tags } => {
                let mut map = self.map.lock().unwrap();
                let key = (wiki, revid);
                let Some(Revision::Live(old)) = map.get(&key) else {
                    return;
                };
                let mut updated = old.clone();
                updated.tags = tags;
                map.insert(key, Revision::Live(updated));
            }
        }
    }
}
