use crate::{
    cache::ViewModelCache,
    entity::EntityType,
    error::{CacheError, Result},
    field_set::FieldSet,
    pointer::RecordPointer,
    record::Record,
    types::{ChangeListener, PkKey, Unsubscribe},
};
use serde_json::Value;
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt::Debug,
    rc::Rc,
    sync::Arc,
};
use tracing::{debug, trace};

enum Slot {
    Record(Record),
    Pointer(RecordPointer),
}

impl Slot {
    /// The record the slot's value is taken from.
    fn underlying(&self) -> &Record {
        match self {
            Self::Record(record) => record,
            Self::Pointer(pointer) => pointer.record(),
        }
    }

    /// What a pointer replacing this slot must compare against.
    fn previous_for_pointer(&self) -> Option<Record> {
        match self {
            Self::Record(record) => Some(record.clone()),
            Self::Pointer(pointer) => pointer.previous().cloned(),
        }
    }

    fn materialize(&self, fs: &FieldSet) -> Result<Record> {
        match self {
            Self::Record(record) => Ok(record.clone()),
            Self::Pointer(pointer) => pointer.materialize(fs),
        }
    }
}

struct ListenerEntry {
    id:       u64,
    callback: ChangeListener,
    batched:  bool,
}

struct RelationSubscription {
    pks:         Vec<PkKey>,
    unsubscribe: Unsubscribe,
}

#[derive(Default)]
struct State {
    slots:         HashMap<String, Slot>,
    // Every key the cache knows about: keys with data, with listeners, or placeholders.
    field_sets:    HashMap<String, Arc<FieldSet>>,
    listeners:     HashMap<String, Vec<ListenerEntry>>,
    // Write order of keys that received a record directly through `add`.
    latest:        HashMap<String, u64>,
    counter:       u64,
    // Keyed by (relation name, owning slot key).
    relation_subs: HashMap<(String, String), RelationSubscription>,
}

/// All cached views of one primary key of one entity type.
///
/// Each view lives in a slot keyed by its [`FieldSet`] key. Writes propagate to every slot the written record covers;
/// reads of a missing slot fall back to the most recently written covering record.
pub(crate) struct RecordCache {
    entity:      Rc<EntityType>,
    pk:          PkKey,
    state:       RefCell<State>,
    listener_id: Cell<u64>,
}

impl RecordCache {
    pub(crate) fn new(entity: Rc<EntityType>, pk: PkKey) -> Rc<Self> {
        Rc::new(Self {
            entity,
            pk,
            state: RefCell::new(State::default()),
            listener_id: Cell::new(0),
        })
    }

    fn tracked(&self, key: &str) -> Option<Arc<FieldSet>> {
        self.state.borrow().field_sets.get(key).cloned()
    }

    fn has_slot(&self, key: &str) -> bool {
        self.state.borrow().slots.contains_key(key)
    }

    fn has_listeners(&self, key: &str) -> bool {
        self.state.borrow().listeners.contains_key(key)
    }

    pub(crate) fn is_vacant(&self) -> bool {
        let state = self.state.borrow();
        state.slots.is_empty()
            && state.listeners.is_empty()
            && state.relation_subs.is_empty()
            && state.field_sets.is_empty()
    }

    /// The value of a slot, materialized but not stored.
    fn current(&self, key: &str) -> Result<Option<Record>> {
        let state = self.state.borrow();
        match (state.slots.get(key), state.field_sets.get(key)) {
            (Some(slot), Some(fs)) => slot.materialize(fs).map(Some),
            (Some(_), None) => Err(CacheError::internal(format!(
                "{}({}) holds a value for [{key}] without its field set",
                self.entity.name(),
                self.pk
            ))),
            _ => Ok(None),
        }
    }

    /// Make sure `fs` is tracked even without data, so writes covering it are propagated to it.
    pub(crate) fn add_key_placeholder(&self, fs: &Arc<FieldSet>) -> bool {
        let mut state = self.state.borrow_mut();
        if state.field_sets.contains_key(fs.key()) {
            return false;
        }
        state.field_sets.insert(fs.key().to_string(), fs.clone());
        true
    }

    /// Set the value of a tracked slot, notifying its listeners when the observable value changes.
    fn write(&self, owner: &ViewModelCache, key: &str, value: Option<Slot>) -> Result<bool> {
        let fs = self.tracked(key).ok_or_else(|| {
            CacheError::internal(format!(
                "{}({}) is writing to untracked key [{key}]",
                self.entity.name(),
                self.pk
            ))
        })?;

        let listeners = self
            .state
            .borrow()
            .listeners
            .get(key)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| (entry.callback.clone(), entry.batched))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        if listeners.is_empty() {
            let mut state = self.state.borrow_mut();
            let unchanged = match (&value, state.slots.get(key)) {
                (None, None) => true,
                (Some(Slot::Record(new)), Some(Slot::Record(old))) => new.is_equal(old),
                (Some(Slot::Pointer(new)), Some(old)) => {
                    new.record().ptr_eq(old.underlying()) || new.materialize(&fs)?.is_equal(&old.materialize(&fs)?)
                }
                _ => false,
            };
            if unchanged {
                return Ok(false);
            }
            trace!("{}({}) [{}] <- {}", self.entity.name(), self.pk, key, describe(&value));
            match value {
                Some(slot) => {
                    state.slots.insert(key.to_string(), slot);
                }
                None => {
                    state.slots.remove(key);
                    state.latest.remove(key);
                }
            }
            return Ok(true);
        }

        let before = self.current(key)?;
        let after = value.as_ref().map(|slot| slot.materialize(&fs)).transpose()?;
        let unchanged = match (&before, &after) {
            (None, None) => true,
            (Some(before), Some(after)) => before.is_equal(after),
            _ => false,
        };
        if unchanged {
            // Keep the materialized value so the pointer is not cloned again on read.
            if let Some(before) = before {
                self.state
                    .borrow_mut()
                    .slots
                    .insert(key.to_string(), Slot::Record(before));
            }
            return Ok(false);
        }

        {
            let mut state = self.state.borrow_mut();
            trace!("{}({}) [{}] <- {}", self.entity.name(), self.pk, key, describe(&value));
            match &after {
                Some(record) => {
                    state.slots.insert(key.to_string(), Slot::Record(record.clone()));
                }
                None => {
                    state.slots.remove(key);
                    state.latest.remove(key);
                }
            }
        }

        let batcher = owner.batcher();
        for (callback, batched) in listeners {
            batcher.call(&callback, before.clone(), after.clone(), batched);
        }
        Ok(true)
    }

    /// Cache `record` under its own field set and propagate it to every slot it covers.
    ///
    /// Returns whether anything observable changed. Writing a record equal to the one already cached for its field set
    /// changes nothing, not even the write order.
    pub(crate) fn add(self: &Rc<Self>, owner: &ViewModelCache, record: Record) -> Result<bool> {
        let fs = record.field_set()?;
        let key = fs.key().to_string();

        if let Some(current) = self.current(&key)? {
            if current.is_equal(&record) {
                trace!("{}({}) [{}]: same value, skipping", self.entity.name(), self.pk, key);
                return Ok(false);
            }
        }

        {
            let mut state = self.state.borrow_mut();
            state.counter += 1;
            let counter = state.counter;
            state.latest.insert(key.clone(), counter);
            state.field_sets.insert(key.clone(), fs.clone());
        }
        let mut changed = self.write(owner, &key, Some(Slot::Record(record.clone())))?;

        let others = self
            .state
            .borrow()
            .field_sets
            .iter()
            .filter(|(other, _)| **other != key)
            .map(|(other, other_fs)| (other.clone(), other_fs.clone()))
            .collect::<Vec<_>>();
        // Views waiting for related records, watched once every slot has the new record.
        let mut waiting = Vec::new();

        for (other_key, other_fs) in others {
            if record.covers(&other_fs) {
                let previous = self
                    .state
                    .borrow()
                    .slots
                    .get(&other_key)
                    .and_then(Slot::previous_for_pointer);
                let pointer = RecordPointer::new(previous, record.clone());
                changed |= self.write(owner, &other_key, Some(Slot::Pointer(pointer)))?;
                if other_fs.has_relations() {
                    self.track_relations(owner, &other_key)?;
                }
            }
            else if other_fs.has_relations() {
                let shape_fs = self.entity.shape_of(&other_fs)?;
                if !record.covers(&shape_fs) {
                    continue;
                }
                let shape = record.clone_fields(&shape_fs)?;
                match owner.join(&shape, &other_fs)? {
                    Some(joined) => {
                        changed |= self.write(owner, &other_key, Some(Slot::Record(joined)))?;
                        self.track_relations(owner, &other_key)?;
                    }
                    None => {
                        trace!(
                            "{}({}) [{}]: relations not resolvable, waiting for them",
                            self.entity.name(),
                            self.pk,
                            other_key
                        );
                        // The old value was joined from what the record referred to before.
                        let stale = self.has_slot(&other_key);
                        changed |= self.write(owner, &other_key, None)?;
                        if stale && !self.has_listeners(&other_key) {
                            self.untrack(&other_key);
                        }
                        else {
                            waiting.push(other_key);
                        }
                    }
                }
            }
        }

        for other_key in &waiting {
            self.track_relations(owner, other_key)?;
        }
        if fs.has_relations() {
            self.track_relations(owner, &key)?;
        }
        Ok(changed)
    }

    /// The cached value for `fs`. Without an exact slot the most recently added record covering `fs` is used and the
    /// result is cached.
    pub(crate) fn get(&self, fs: &Arc<FieldSet>) -> Result<Option<Record>> {
        let key = fs.key();

        let exact = {
            let state = self.state.borrow();
            state
                .slots
                .get(key)
                .map(|slot| (slot.materialize(fs), matches!(slot, Slot::Pointer(_))))
        };
        if let Some((record, was_pointer)) = exact {
            let record = record?;
            if was_pointer {
                trace!("{}({}) [{}]: materialized pointer", self.entity.name(), self.pk, key);
                self.state
                    .borrow_mut()
                    .slots
                    .insert(key.to_string(), Slot::Record(record.clone()));
            }
            return Ok(Some(record));
        }

        let found = {
            let state = self.state.borrow();
            let mut order = state.latest.iter().collect::<Vec<_>>();
            order.sort_by(|a, b| b.1.cmp(a.1));
            let mut found = None;
            for (candidate, _) in order {
                let slot = state.slots.get(candidate).ok_or_else(|| {
                    CacheError::internal(format!(
                        "Value for key [{candidate}] of {}({}) is missing in cache but exists in write order",
                        self.entity.name(),
                        self.pk
                    ))
                })?;
                let underlying = slot.underlying();
                if underlying.covers(fs) {
                    trace!(
                        "{}({}) [{}]: backfilling from [{}]",
                        self.entity.name(),
                        self.pk,
                        key,
                        candidate
                    );
                    found = Some(underlying.clone_fields(fs)?);
                    break;
                }
            }
            found
        };

        let Some(record) = found
        else {
            return Ok(None);
        };
        let mut state = self.state.borrow_mut();
        state
            .field_sets
            .entry(key.to_string())
            .or_insert_with(|| fs.clone());
        state.slots.insert(key.to_string(), Slot::Record(record.clone()));
        Ok(Some(record))
    }

    /// Store a value joined from related caches.
    pub(crate) fn store_joined(
        self: &Rc<Self>,
        owner: &ViewModelCache,
        fs: &Arc<FieldSet>,
        record: Record,
    ) -> Result<()> {
        self.add_key_placeholder(fs);
        self.write(owner, fs.key(), Some(Slot::Record(record)))?;
        self.track_relations(owner, fs.key())
    }

    /// Remove one slot, or every slot when `fs` is `None`. Returns whether anything was removed.
    pub(crate) fn delete(&self, owner: &ViewModelCache, fs: Option<&FieldSet>) -> Result<bool> {
        match fs {
            None => {
                let keys = self.state.borrow().slots.keys().cloned().collect::<Vec<_>>();
                let mut removed = false;
                for key in &keys {
                    removed |= self.write(owner, key, None)?;
                }
                let subscriptions = {
                    let mut state = self.state.borrow_mut();
                    state.latest.clear();
                    let State {
                        field_sets, listeners, ..
                    } = &mut *state;
                    field_sets.retain(|key, _| listeners.contains_key(key));
                    state.relation_subs.drain().map(|(_, sub)| sub).collect::<Vec<_>>()
                };
                for sub in subscriptions {
                    sub.unsubscribe.unsubscribe();
                }
                Ok(removed)
            }
            Some(fs) => {
                let key = fs.key();
                if !self.has_slot(key) {
                    return Ok(false);
                }
                self.write(owner, key, None)?;
                self.drop_relation_subs(key);
                if !self.has_listeners(key) {
                    self.untrack(key);
                }
                Ok(true)
            }
        }
    }

    /// Register `callback` for changes of the value for `fs`.
    ///
    /// Without a slot for `fs` the value is backfilled when possible, so a later delete is observed even if nothing was
    /// written under the exact key yet.
    pub(crate) fn add_listener(
        self: &Rc<Self>,
        owner: &ViewModelCache,
        fs: Arc<FieldSet>,
        callback: ChangeListener,
        batched: bool,
    ) -> Result<Unsubscribe> {
        let key = fs.key().to_string();
        let id = self.listener_id.get() + 1;
        self.listener_id.set(id);

        self.add_key_placeholder(&fs);
        self.state
            .borrow_mut()
            .listeners
            .entry(key.clone())
            .or_default()
            .push(ListenerEntry { id, callback, batched });

        if let Err(err) = self.fill(owner, &fs) {
            self.remove_listener(&key, id);
            return Err(err);
        }

        let cache = Rc::downgrade(self);
        Ok(Unsubscribe::new(move || {
            if let Some(cache) = cache.upgrade() {
                cache.remove_listener(&key, id);
            }
        }))
    }

    /// Backfill the value for `fs` when possible and watch the records its relations refer to.
    fn fill(self: &Rc<Self>, owner: &ViewModelCache, fs: &Arc<FieldSet>) -> Result<()> {
        if !self.has_slot(fs.key()) {
            owner.lookup(self, fs)?;
        }
        if fs.has_relations() {
            self.track_relations(owner, fs.key())?;
        }
        Ok(())
    }

    fn remove_listener(&self, key: &str, id: u64) {
        {
            let mut state = self.state.borrow_mut();
            if let Some(entries) = state.listeners.get_mut(key) {
                entries.retain(|entry| entry.id != id);
                if entries.is_empty() {
                    state.listeners.remove(key);
                }
            }
        }
        if !self.has_listeners(key) && !self.has_slot(key) {
            self.untrack(key);
        }
    }

    fn drop_relation_subs(&self, key: &str) {
        let subscriptions = {
            let mut state = self.state.borrow_mut();
            let stale = state
                .relation_subs
                .keys()
                .filter(|(_, owning)| owning == key)
                .cloned()
                .collect::<Vec<_>>();
            stale
                .into_iter()
                .filter_map(|sub_key| state.relation_subs.remove(&sub_key))
                .collect::<Vec<_>>()
        };
        for sub in subscriptions {
            sub.unsubscribe.unsubscribe();
        }
    }

    fn untrack(&self, key: &str) {
        self.state.borrow_mut().field_sets.remove(key);
        self.drop_relation_subs(key);
    }

    /// Subscribe to the related records the value for `key` depends on, replacing subscriptions to records it no
    /// longer refers to.
    pub(crate) fn track_relations(self: &Rc<Self>, owner: &ViewModelCache, key: &str) -> Result<()> {
        let Some(fs) = self.tracked(key)
        else {
            return Ok(());
        };
        if !fs.has_relations() {
            return Ok(());
        }

        let source = match self.current(key)? {
            Some(record) => Some(record),
            None => self.get(&self.entity.shape_of(&fs)?)?,
        };

        for (name, nested) in fs.relations() {
            let rel = self.entity.relation(name)?;
            let ids = match source.as_ref().and_then(|record| record.value(rel.source_field_name())) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(ids)) if rel.many() => ids.clone(),
                Some(id) => vec![id.clone()],
            };
            let target = owner.related_cache(name)?;
            let target_entity = target.entity();
            // Ids that are no valid key can't be cached, there is nothing to watch for them.
            let pks = ids
                .iter()
                .filter_map(|id| target_entity.pk_key(id).ok())
                .collect::<Vec<_>>();

            let sub_key = (name.clone(), key.to_string());
            let stale = {
                let mut state = self.state.borrow_mut();
                if state.relation_subs.get(&sub_key).is_some_and(|existing| existing.pks == pks) {
                    continue;
                }
                state.relation_subs.remove(&sub_key)
            };
            if let Some(stale) = stale {
                stale.unsubscribe.unsubscribe();
            }
            if pks.is_empty() {
                continue;
            }

            trace!(
                "{}({}) [{}]: watching {} {:?}",
                self.entity.name(),
                self.pk,
                key,
                target_entity.name(),
                pks
            );
            let callback = owner.refresher(self.pk.clone(), key.to_string());
            let unsubscribe = target.subscribe_relation(&pks, nested, callback)?;
            self.state
                .borrow_mut()
                .relation_subs
                .insert(sub_key, RelationSubscription { pks, unsubscribe });
        }
        Ok(())
    }

    /// Recompute the value for `key` after a related record changed. A value whose relations can no longer be
    /// resolved is removed.
    pub(crate) fn refresh(self: &Rc<Self>, owner: &ViewModelCache, key: &str) -> Result<bool> {
        let Some(fs) = self.tracked(key)
        else {
            return Ok(false);
        };
        let shape_fs = self.entity.shape_of(&fs)?;
        let current = self.current(key)?;
        // The latest record decides what is referred to, the joined value may predate it.
        let shape = match self.get(&shape_fs)? {
            Some(shape) => Some(shape),
            None => current.as_ref().map(|record| record.clone_fields(&shape_fs)).transpose()?,
        };
        let next = match &shape {
            Some(shape) => owner.join(shape, &fs)?,
            None => None,
        };

        match next {
            Some(record) => {
                let changed = self.write(owner, key, Some(Slot::Record(record)))?;
                self.track_relations(owner, key)?;
                Ok(changed)
            }
            None if current.is_some() => {
                debug!(
                    "{}({}) [{}]: related record is gone, dropping the value",
                    self.entity.name(),
                    self.pk,
                    key
                );
                let changed = self.write(owner, key, None)?;
                // Listeners keep the subscriptions so the value comes back with the related record.
                if self.has_listeners(key) {
                    self.track_relations(owner, key)?;
                }
                else {
                    self.untrack(key);
                }
                Ok(changed)
            }
            None => {
                self.track_relations(owner, key)?;
                Ok(false)
            }
        }
    }
}

fn describe(value: &Option<Slot>) -> String {
    match value {
        None => "null".to_string(),
        Some(Slot::Record(record)) => format!("{record:?}"),
        Some(Slot::Pointer(pointer)) => format!("-> {:?}", pointer.record()),
    }
}

impl Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        let mut keys = state.field_sets.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        f.debug_struct("RecordCache")
            .field("entity", &self.entity.name())
            .field("pk", &self.pk)
            .field("keys", &keys)
            .field("slots", &state.slots.len())
            .field("counter", &state.counter)
            .finish()
    }
}
