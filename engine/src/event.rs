//! Listener registrations and event generation.
//!
//! Each registration remembers the last snapshot it was shown. When the
//! resolved view at its path changes, the old and new snapshots are diffed
//! and the resulting events are emitted in a fixed order: child removals,
//! child changes, child moves, child additions, then the value.

use crate::{error::Result, overlay::View, ChildKey, Error, Node, Path};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Identifier of a listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Kind of event a registration listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Value,
    ChildAdded,
    ChildChanged,
    ChildRemoved,
    ChildMoved,
}

impl EventKind {
    /// Position of this kind in the emission order.
    fn rank(self) -> u8 {
        match self {
            EventKind::ChildRemoved => 0,
            EventKind::ChildChanged => 1,
            EventKind::ChildMoved => 2,
            EventKind::ChildAdded => 3,
            EventKind::Value => 4,
        }
    }
}

/// How children are ordered for child events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChildOrder {
    /// By key (integers first)
    #[default]
    Key,
    /// By child value, ties broken by key
    Value,
}

/// A single notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    /// Location the snapshot describes
    pub path: Path,
    /// The new value; the old value for `ChildRemoved`
    pub snapshot: Node,
    /// Key of the preceding sibling, for added, changed and moved children
    pub prev_key: Option<ChildKey>,
}

/// Receiver of events for one registration.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// An event ready to be handed to its sink.
pub struct PendingEvent {
    pub registration: RegistrationId,
    pub sink: EventSink,
    pub event: Event,
}

impl PendingEvent {
    pub fn deliver(self) {
        (self.sink)(self.event);
    }
}

impl fmt::Debug for PendingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEvent")
            .field("registration", &self.registration)
            .field("event", &self.event)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationState {
    Attached,
    Detached,
}

/// An observer of one path and one event kind.
pub struct Registration {
    pub id: RegistrationId,
    pub path: Path,
    pub kind: EventKind,
    pub order: ChildOrder,
    sink: EventSink,
    state: RegistrationState,
    /// Snapshot the observer has seen, `None` before the first delivery
    last: Option<Node>,
}

impl Registration {
    pub fn is_attached(&self) -> bool {
        self.state == RegistrationState::Attached
    }

    /// The snapshot most recently shown to this observer.
    pub fn last_seen(&self) -> Option<&Node> {
        self.last.as_ref()
    }

    /// Bring this observer up to date with `view`.
    fn refresh(&mut self, view: &View) -> Vec<Event> {
        if !self.is_attached() || !view.complete {
            return Vec::new();
        }
        let events = diff(
            self.kind,
            self.order,
            &self.path,
            self.last.as_ref(),
            &view.node,
        );
        self.last = Some(view.node.clone());
        events
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("kind", &self.kind)
            .field("order", &self.order)
            .field("state", &self.state)
            .field("last", &self.last)
            .finish()
    }
}

/// All registrations, in attach order.
#[derive(Debug, Default)]
pub struct EventRegistry {
    registrations: BTreeMap<RegistrationId, Registration>,
    next_id: u64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(
        &mut self,
        path: Path,
        kind: EventKind,
        order: ChildOrder,
        sink: EventSink,
    ) -> RegistrationId {
        self.next_id += 1;
        let id = RegistrationId(self.next_id);
        self.registrations.insert(
            id,
            Registration {
                id,
                path,
                kind,
                order,
                sink,
                state: RegistrationState::Attached,
                last: None,
            },
        );
        id
    }

    /// Detach a registration. It never receives another event.
    pub fn detach(&mut self, id: RegistrationId) -> Result<Registration> {
        let mut registration = self
            .registrations
            .remove(&id)
            .ok_or(Error::UnknownRegistration(id.0))?;
        registration.state = RegistrationState::Detached;
        Ok(registration)
    }

    pub fn get(&self, id: RegistrationId) -> Option<&Registration> {
        self.registrations.get(&id)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Refresh every registration whose path is related to `changed`.
    ///
    /// `view_at` resolves the current view for a registration path.
    pub fn raise<F>(&mut self, changed: &Path, view_at: F) -> Vec<PendingEvent>
    where
        F: Fn(&Path) -> View,
    {
        let mut views: BTreeMap<Path, View> = BTreeMap::new();
        let mut raised = Vec::new();

        for registration in self.registrations.values_mut() {
            if !registration.path.is_related(changed) {
                continue;
            }
            let view = views
                .entry(registration.path.clone())
                .or_insert_with(|| view_at(&registration.path));
            for event in registration.refresh(view) {
                raised.push(PendingEvent {
                    registration: registration.id,
                    sink: Arc::clone(&registration.sink),
                    event,
                });
            }
        }

        raised.sort_by_key(|pending| pending.event.kind.rank());
        raised
    }

    /// Initial events for a freshly attached registration.
    pub fn raise_initial(&mut self, id: RegistrationId, view: &View) -> Vec<PendingEvent> {
        let Some(registration) = self.registrations.get_mut(&id) else {
            return Vec::new();
        };
        registration
            .refresh(view)
            .into_iter()
            .map(|event| PendingEvent {
                registration: id,
                sink: Arc::clone(&registration.sink),
                event,
            })
            .collect()
    }
}

/// Children sorted for a registration's order.
fn ordered(node: &Node, order: ChildOrder) -> Vec<(&ChildKey, &Node)> {
    let mut children: Vec<_> = node.children().collect();
    if order == ChildOrder::Value {
        children.sort_by(|(ka, a), (kb, b)| a.cmp_by_value(b).then_with(|| ka.cmp(kb)));
    }
    children
}

fn prev_key(sorted: &[(&ChildKey, &Node)], index: usize) -> Option<ChildKey> {
    index
        .checked_sub(1)
        .map(|prev| sorted[prev].0.clone())
}

/// Key just before `key` in `sorted`, `None` when it comes first or is absent.
fn prev_sibling(sorted: &[(&ChildKey, &Node)], key: &ChildKey) -> Option<ChildKey> {
    sorted
        .iter()
        .position(|(k, _)| *k == key)
        .and_then(|index| prev_key(sorted, index))
}

/// Events of `kind` that turn `old` into `new` for an observer at `path`.
fn diff(
    kind: EventKind,
    order: ChildOrder,
    path: &Path,
    old: Option<&Node>,
    new: &Node,
) -> Vec<Event> {
    if kind == EventKind::Value {
        if old == Some(new) {
            return Vec::new();
        }
        return vec![Event {
            kind,
            path: path.clone(),
            snapshot: new.clone(),
            prev_key: None,
        }];
    }

    let empty = Node::Empty;
    let old = old.unwrap_or(&empty);
    let child_event = |key: &ChildKey, snapshot: &Node, prev_key: Option<ChildKey>| Event {
        kind,
        path: path.child(key),
        snapshot: snapshot.clone(),
        prev_key,
    };

    if kind == EventKind::ChildRemoved {
        return ordered(old, order)
            .into_iter()
            .filter(|(key, _)| new.child(key).is_empty())
            .map(|(key, before)| child_event(key, before, None))
            .collect();
    }

    let sorted = ordered(new, order);
    let previous = ordered(old, order);
    sorted
        .iter()
        .enumerate()
        .filter(|(_, (key, after))| {
            let before = old.child(key);
            match kind {
                EventKind::ChildAdded => before.is_empty(),
                EventKind::ChildChanged => !before.is_empty() && before != **after,
                EventKind::ChildMoved => {
                    order == ChildOrder::Value
                        && !before.is_empty()
                        && before != **after
                        && prev_sibling(&previous, key) != prev_sibling(&sorted, key)
                }
                EventKind::Value | EventKind::ChildRemoved => false,
            }
        })
        .map(|(index, (key, after))| child_event(*key, *after, prev_key(&sorted, index)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    fn node(value: Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn complete(value: Value) -> View {
        View {
            node: node(value),
            complete: true,
        }
    }

    fn recorder() -> (EventSink, Arc<Mutex<Vec<Event>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink_log = Arc::clone(&log);
        let sink: EventSink = Arc::new(move |event| sink_log.lock().unwrap().push(event));
        (sink, log)
    }

    fn deliver(events: Vec<PendingEvent>) {
        for pending in events {
            pending.deliver();
        }
    }

    #[test]
    fn value_event_on_attach_and_change() {
        let mut registry = EventRegistry::new();
        let (sink, log) = recorder();
        let id = registry.attach(path("foo"), EventKind::Value, ChildOrder::Key, sink);

        deliver(registry.raise_initial(id, &complete(json!("a"))));
        deliver(registry.raise(&path("foo"), |_| complete(json!("a"))));
        deliver(registry.raise(&path("foo"), |_| complete(json!("b"))));

        let values: Vec<Value> = log
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.snapshot.to_json())
            .collect();
        assert_eq!(values, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn incomplete_views_raise_nothing() {
        let mut registry = EventRegistry::new();
        let (sink, log) = recorder();
        let id = registry.attach(path("foo"), EventKind::Value, ChildOrder::Key, sink);

        let view = View {
            node: Node::Empty,
            complete: false,
        };
        deliver(registry.raise_initial(id, &view));
        assert!(log.lock().unwrap().is_empty());
        assert!(registry.get(id).unwrap().last_seen().is_none());
    }

    #[test]
    fn unrelated_paths_are_not_refreshed() {
        let mut registry = EventRegistry::new();
        let (sink, log) = recorder();
        registry.attach(path("foo"), EventKind::Value, ChildOrder::Key, sink);

        deliver(registry.raise(&path("bar"), |_| complete(json!(1))));
        assert!(log.lock().unwrap().is_empty());

        deliver(registry.raise(&path("foo/deep"), |_| complete(json!(1))));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn child_events_follow_fixed_order() {
        let mut registry = EventRegistry::new();
        let (sink, log) = recorder();
        for kind in [
            EventKind::Value,
            EventKind::ChildAdded,
            EventKind::ChildMoved,
            EventKind::ChildChanged,
            EventKind::ChildRemoved,
        ] {
            let id = registry.attach(path("list"), kind, ChildOrder::Value, Arc::clone(&sink));
            registry.raise_initial(id, &complete(json!({"a": 1, "b": 2, "c": 3})));
        }

        deliver(registry.raise(&path("list"), |_| {
            complete(json!({"a": 1, "b": 5, "d": 4}))
        }));

        let seen: Vec<(EventKind, String)> = log
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.kind, e.path.to_string()))
            .collect();
        assert_eq!(
            seen,
            vec![
                (EventKind::ChildRemoved, "/list/c".to_string()),
                (EventKind::ChildChanged, "/list/b".to_string()),
                (EventKind::ChildMoved, "/list/b".to_string()),
                (EventKind::ChildAdded, "/list/d".to_string()),
                (EventKind::Value, "/list".to_string()),
            ]
        );
    }

    #[test]
    fn prev_key_follows_value_order() {
        let old = node(json!({"a": 1, "b": 2}));
        let new = node(json!({"a": 3, "b": 2}));
        let events = diff(
            EventKind::ChildMoved,
            ChildOrder::Value,
            &path("scores"),
            Some(&old),
            &new,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, path("scores/a"));
        assert_eq!(events[0].prev_key.as_ref().map(ChildKey::as_str), Some("b"));
    }

    #[test]
    fn value_change_in_same_slot_is_not_a_move() {
        let old = node(json!({"a": 1, "b": 5}));
        let new = node(json!({"a": 2, "b": 5}));
        let events = diff(
            EventKind::ChildMoved,
            ChildOrder::Value,
            &path("scores"),
            Some(&old),
            &new,
        );
        assert!(events.is_empty());

        let changed = diff(
            EventKind::ChildChanged,
            ChildOrder::Value,
            &path("scores"),
            Some(&old),
            &new,
        );
        assert_eq!(changed.len(), 1);
    }

    #[test]
    fn key_order_never_moves() {
        let old = node(json!({"a": 1, "b": 2}));
        let new = node(json!({"a": 3, "b": 2}));
        let events = diff(
            EventKind::ChildMoved,
            ChildOrder::Key,
            &path("scores"),
            Some(&old),
            &new,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn initial_child_added_for_every_child() {
        let events = diff(
            EventKind::ChildAdded,
            ChildOrder::Key,
            &path("room"),
            None,
            &node(json!({"x": 1, "y": 2})),
        );
        let prevs: Vec<Option<String>> = events
            .iter()
            .map(|e| e.prev_key.as_ref().map(|k| k.to_string()))
            .collect();
        assert_eq!(prevs, vec![None, Some("x".to_string())]);
    }

    #[test]
    fn detach_stops_delivery() {
        let mut registry = EventRegistry::new();
        let (sink, log) = recorder();
        let id = registry.attach(path("foo"), EventKind::Value, ChildOrder::Key, sink);
        let detached = registry.detach(id).unwrap();
        assert!(!detached.is_attached());
        assert!(matches!(
            registry.detach(id),
            Err(Error::UnknownRegistration(_))
        ));

        deliver(registry.raise(&path("foo"), |_| complete(json!(1))));
        assert!(log.lock().unwrap().is_empty());
    }
}
