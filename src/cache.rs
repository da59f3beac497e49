use crate::{
    batcher::ListenerBatcher,
    entity::EntityType,
    error::{CacheError, Result},
    field_path::FieldPath,
    field_set::FieldSet,
    record::{FieldValue, Record},
    record_cache::RecordCache,
    registry::CacheSystem,
    types::{AnyChangeListener, ChangeListener, Listen, LookupKey, MultiChangeListener, PkKey, RecordInput, Unsubscribe},
};
use fieldx_plus::{child_build, fx_plus};
use serde_json::Value;
use std::{cell::RefCell, collections::HashMap, fmt::Debug, rc::Rc, sync::Arc};
use tracing::{debug, error, trace, warn};

/// The cache of one entity type.
///
/// Records are stored per primary key and per field set. Adding a record updates every cached view of the same key
/// that it covers; reading a view that was never stored is served from the most recently added record covering it.
/// Views including relations are joined from the related types' caches and kept up to date when related records
/// change or go away.
///
/// ```ignore
/// let cache = user.cache();
/// cache.add(json!({"id": 1, "name": "Jo", "email": "jo@example.com"}))?;
///
/// // Served from the record above.
/// let jo = cache.get(1, &FieldPath::list(["name"]))?;
///
/// let unsubscribe = cache.add_listener(Listen::record(1, FieldPath::list(["name"]), |before, after| {
///     println!("{before:?} -> {after:?}");
/// }))?;
/// cache.add(json!({"id": 1, "name": "Joanna"}))?;
/// unsubscribe.unsubscribe();
/// ```
#[fx_plus(child(EntityType, unwrap), rc, no_new, default(off))]
pub struct ViewModelCache {
    name:          String,
    #[fieldx(get(vis(pub(crate))))]
    batcher:       Rc<ListenerBatcher>,
    #[fieldx(inner_mut, private, get, get_mut, builder(off))]
    records:       HashMap<PkKey, Rc<RecordCache>>,
    // Primary keys in the order their record caches were created.
    #[fieldx(inner_mut, private, get, get_mut, builder(off))]
    order:         Vec<PkKey>,
    #[fieldx(inner_mut, private, get, get_mut, builder(off))]
    any_listeners: Vec<(u64, AnyChangeListener)>,
    #[fieldx(inner_mut, private, get(copy), set, builder(off))]
    listener_id:   u64,
    #[fieldx(inner_mut, private, get_mut, builder(off))]
    last_all:      HashMap<String, Rc<Vec<Record>>>,
}

impl ViewModelCache {
    pub(crate) fn new(entity: &EntityType, system: &CacheSystem) -> Result<Rc<Self>> {
        debug!("[{}] creating the cache of {}", system.config().name(), entity.name());
        child_build!(
            entity,
            ViewModelCache {
                name:    system.config().name(),
                batcher: system.batcher().clone(),
            }
        )
        .map_err(CacheError::internal)
    }

    pub fn entity(&self) -> Rc<EntityType> {
        self.parent()
    }

    /// Forget every record cache and listener. The system drops its types through this.
    pub(crate) fn release(&self) {
        let records = std::mem::take(&mut *self.records_mut());
        let any_listeners = std::mem::take(&mut *self.any_listeners_mut());
        self.order_mut().clear();
        self.last_all_mut().clear();
        trace!("[{}] released {} record caches", self.name, records.len());
        drop(records);
        drop(any_listeners);
    }

    /// A relation listener refreshing the view `key` of `pk` in this cache.
    pub(crate) fn refresher(&self, pk: PkKey, key: String) -> ChangeListener {
        let cache = self.myself_downgrade();
        Rc::new(move |_, _| {
            if let Some(cache) = cache.upgrade() {
                cache.refresh(&pk, &key);
            }
        })
    }

    pub(crate) fn related_cache(&self, relation: &str) -> Result<Rc<ViewModelCache>> {
        Ok(self.entity().related(relation)?.cache())
    }

    fn record_cache(&self, pk: &PkKey) -> Option<Rc<RecordCache>> {
        self.records().get(pk).cloned()
    }

    fn record_cache_or_create(&self, pk: &PkKey) -> Rc<RecordCache> {
        if let Some(cache) = self.record_cache(pk) {
            return cache;
        }
        let cache = RecordCache::new(self.entity(), pk.clone());
        self.records_mut().insert(pk.clone(), cache.clone());
        self.order_mut().push(pk.clone());
        cache
    }

    fn forget_if_vacant(&self, pk: &PkKey) {
        let vacant = self.record_cache(pk).is_some_and(|cache| cache.is_vacant());
        if vacant {
            trace!("[{}] forgetting {}({})", self.name, self.entity().name(), pk);
            self.records_mut().remove(pk);
            self.order_mut().retain(|p| p != pk);
        }
    }

    /// Listen on the view `fs` of `pk`. The record cache is forgotten once nothing holds it anymore.
    fn listen_on(
        &self,
        pk: &PkKey,
        fs: Arc<FieldSet>,
        callback: ChangeListener,
        batched: bool,
    ) -> Result<Unsubscribe> {
        let unsubscribe = match self.record_cache_or_create(pk).add_listener(self, fs, callback, batched) {
            Ok(unsubscribe) => unsubscribe,
            Err(err) => {
                self.forget_if_vacant(pk);
                return Err(err);
            }
        };
        let cache = self.myself_downgrade();
        let pk = pk.clone();
        Ok(Unsubscribe::new(move || {
            unsubscribe.unsubscribe();
            if let Some(cache) = cache.upgrade() {
                cache.forget_if_vacant(&pk);
            }
        }))
    }

    fn next_listener_id(&self) -> u64 {
        let id = self.listener_id() + 1;
        self.set_listener_id(id);
        id
    }

    fn check_entity(&self, record: &Record) -> Result<()> {
        if Rc::ptr_eq(record.entity(), &self.entity()) {
            Ok(())
        }
        else {
            Err(CacheError::WrongEntityType {
                expected: self.entity().name().to_string(),
                got:      record.entity().name().to_string(),
            })
        }
    }

    fn coerce(&self, input: RecordInput) -> Result<Record> {
        match input {
            RecordInput::Record(record) => {
                self.check_entity(&record)?;
                Ok(record)
            }
            RecordInput::Data(Value::Array(_)) => Err(CacheError::InvalidData {
                entity:  self.entity().name().to_string(),
                message: "add() takes a single record, use add_list() for a list".to_string(),
            }),
            RecordInput::Data(data) => self.entity().record(&data),
        }
    }

    fn resolve_pk(&self, key: &LookupKey) -> Result<PkKey> {
        match key {
            LookupKey::Pk(value) => self.entity().pk_key(value),
            LookupKey::Record(record) => {
                self.check_entity(record)?;
                Ok(record.pk_key().clone())
            }
        }
    }

    /// Primary key and field set a lookup is about. A record key with no fields requested stands for its own fields.
    fn resolve_lookup(&self, key: &LookupKey, fields: &[FieldPath]) -> Result<(PkKey, Arc<FieldSet>)> {
        let pk = self.resolve_pk(key)?;
        let fs = match key {
            LookupKey::Record(record) if fields.is_empty() => record.field_set()?,
            _ => self.entity().field_set(fields)?,
        };
        Ok((pk, fs))
    }

    fn notify_any_change(&self) {
        let listeners = self
            .any_listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect::<Vec<_>>();
        for listener in &listeners {
            self.batcher.call_all(listener);
        }
    }

    /// Cache a record given as data or as a record instance of this type. Nested relation data is added to the
    /// related caches.
    pub fn add(&self, input: impl Into<RecordInput>) -> Result<Record> {
        let record = self.coerce(input.into())?;
        let _scope = self.batcher.listeners_enabled();
        self.batcher.batch(|| self.add_record(&record))?;
        Ok(record)
    }

    /// Cache several records in one batch: every listener is notified at most once for the whole list.
    pub fn add_list<I, R>(&self, inputs: I) -> Result<Vec<Record>>
    where
        I: IntoIterator<Item = R>,
        R: Into<RecordInput>,
    {
        let records = inputs
            .into_iter()
            .map(|input| self.coerce(input.into()))
            .collect::<Result<Vec<_>>>()?;
        let _scope = self.batcher.listeners_enabled();
        self.batcher.batch(|| {
            for record in &records {
                self.add_record(record)?;
            }
            Ok(())
        })?;
        Ok(records)
    }

    pub(crate) fn add_record(&self, record: &Record) -> Result<()> {
        debug!("[{}] ADD({}: {})", self.name, self.entity().name(), record.pk_key());

        for (name, value) in record.iter() {
            match value {
                FieldValue::One(Some(related)) => self.related_cache(name)?.add_record(related)?,
                FieldValue::Many(related) if !related.is_empty() => {
                    let target = self.related_cache(name)?;
                    for related in related {
                        target.add_record(related)?;
                    }
                }
                _ => (),
            }
        }

        let cache = self.record_cache_or_create(record.pk_key());
        if cache.add(self, record.clone())? {
            self.notify_any_change();
        }
        Ok(())
    }

    /// The cached record for `key` holding exactly `fields`, or `None` when it can't be served from the cache.
    pub fn get(&self, key: impl Into<LookupKey>, fields: &[FieldPath]) -> Result<Option<Record>> {
        let key = key.into();
        let (pk, fs) = self.resolve_lookup(&key, fields)?;
        self.get_resolved(&pk, &fs)
    }

    pub(crate) fn get_resolved(&self, pk: &PkKey, fs: &Arc<FieldSet>) -> Result<Option<Record>> {
        match self.record_cache(pk) {
            Some(cache) => self.lookup(&cache, fs),
            None => Ok(None),
        }
    }

    /// Read a value, joining relations from the related caches when no cached value exists. Joined values are cached.
    pub(crate) fn lookup(&self, cache: &Rc<RecordCache>, fs: &Arc<FieldSet>) -> Result<Option<Record>> {
        let _scope = self.batcher.listeners_suppressed();

        if let Some(record) = cache.get(fs)? {
            return Ok(Some(record));
        }
        if !fs.has_relations() {
            return Ok(None);
        }

        let shape_fs = self.entity().shape_of(fs)?;
        let Some(shape) = cache.get(&shape_fs)?
        else {
            return Ok(None);
        };
        let Some(joined) = self.join(&shape, fs)?
        else {
            return Ok(None);
        };
        cache.store_joined(self, fs, joined.clone())?;
        Ok(Some(joined))
    }

    /// Fill the relations of `fs` into `shape` from the related caches. `None` if any related record expected by a
    /// non-null id is not cached. An id that is not a valid key of the related type counts as not cached.
    pub(crate) fn join(&self, shape: &Record, fs: &FieldSet) -> Result<Option<Record>> {
        let entity = self.entity();
        let mut values = Vec::with_capacity(fs.relations().len());

        for (name, nested) in fs.relations() {
            let rel = entity.relation(name)?;
            let target = self.related_cache(name)?;
            let source = shape.value(rel.source_field_name()).cloned().unwrap_or(Value::Null);

            let lookup = |id: &Value| -> Result<Option<Record>> {
                let target_entity = target.entity();
                let pk = match target_entity.pk_key(id) {
                    Ok(pk) => pk,
                    Err(err) => {
                        trace!("[{}] JOIN {}.{}: {err}", self.name, entity.name(), name);
                        return Ok(None);
                    }
                };
                let found = target.get_resolved(&pk, nested)?;
                if found.is_none() {
                    trace!(
                        "[{}] JOIN {}.{}: {}({}) not cached",
                        self.name,
                        entity.name(),
                        name,
                        target_entity.name(),
                        pk
                    );
                }
                Ok(found)
            };

            let value = match source {
                Value::Null if rel.many() => FieldValue::Many(Vec::new()),
                Value::Null => FieldValue::One(None),
                Value::Array(ids) if rel.many() => {
                    let mut related = Vec::with_capacity(ids.len());
                    for id in &ids {
                        let Some(record) = lookup(id)?
                        else {
                            return Ok(None);
                        };
                        related.push(record);
                    }
                    FieldValue::Many(related)
                }
                ref other if rel.many() => {
                    warn!(
                        "[{}] {}.{} holds {} which is not a list of ids",
                        self.name,
                        entity.name(),
                        rel.source_field_name(),
                        other
                    );
                    return Ok(None);
                }
                id => match lookup(&id)? {
                    Some(record) => FieldValue::One(Some(record)),
                    None => return Ok(None),
                },
            };
            values.push((name.clone(), value));
        }

        shape.with_relations(values).map(Some)
    }

    /// [`get`](Self::get) for several keys. Misses are `None` unless `remove_nulls` drops them.
    pub fn get_list<I, K>(&self, keys: I, fields: &[FieldPath], remove_nulls: bool) -> Result<Vec<Option<Record>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<LookupKey>,
    {
        let mut out = Vec::new();
        for key in keys {
            let record = self.get(key, fields)?;
            if record.is_some() || !remove_nulls {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Every cached record that can be served with `fields`.
    ///
    /// As long as none of the returned records change, repeated calls return the same vector instance.
    pub fn get_all(&self, fields: &[FieldPath]) -> Result<Rc<Vec<Record>>> {
        let fs = self.entity().field_set(fields)?;
        let pks = self.order().clone();

        let mut records = Vec::with_capacity(pks.len());
        for pk in &pks {
            if let Some(record) = self.get_resolved(pk, &fs)? {
                records.push(record);
            }
        }

        let mut last_all = self.last_all_mut();
        if let Some(last) = last_all.get(fs.key()) {
            if last.len() == records.len() && last.iter().zip(&records).all(|(a, b)| a.ptr_eq(b)) {
                return Ok(last.clone());
            }
        }
        let records = Rc::new(records);
        last_all.insert(fs.key().to_string(), records.clone());
        Ok(records)
    }

    /// Remove the record for `key`: every cached view of it, or only the one for `fields`. Returns whether anything
    /// was removed.
    pub fn delete(&self, key: impl Into<LookupKey>, fields: Option<&[FieldPath]>) -> Result<bool> {
        let key = key.into();
        let pk = self.resolve_pk(&key)?;
        let fs = fields.map(|fields| self.entity().field_set(fields)).transpose()?;
        let _scope = self.batcher.listeners_enabled();
        self.batcher.batch(|| self.delete_resolved(&pk, fs.as_deref()))
    }

    fn delete_resolved(&self, pk: &PkKey, fs: Option<&FieldSet>) -> Result<bool> {
        let Some(cache) = self.record_cache(pk)
        else {
            return Ok(false);
        };
        let removed = cache.delete(self, fs)?;
        if removed {
            debug!(
                "[{}] DELETE({}: {}{})",
                self.name,
                self.entity().name(),
                pk,
                fs.map_or(String::new(), |fs| format!(" [{fs}]"))
            );
            self.notify_any_change();
        }
        self.forget_if_vacant(pk);
        Ok(removed)
    }

    /// Remove every cached record of this type. Listeners stay registered.
    pub fn clear(&self) -> Result<()> {
        let pks = self.order().clone();
        let _scope = self.batcher.listeners_enabled();
        self.batcher.batch(|| {
            for pk in &pks {
                self.delete_resolved(pk, None)?;
            }
            Ok(())
        })
    }

    /// Track the view of `key` for `fields` before any data exists, so records added later propagate into it.
    /// Returns `false` if the view was already tracked.
    pub fn add_key_placeholder(&self, key: impl Into<LookupKey>, fields: &[FieldPath]) -> Result<bool> {
        let key = key.into();
        let (pk, fs) = self.resolve_lookup(&key, fields)?;
        Ok(self.record_cache_or_create(&pk).add_key_placeholder(&fs))
    }

    pub fn add_listener(&self, listen: Listen) -> Result<Unsubscribe> {
        match listen {
            Listen::AnyChange(listener) => {
                let id = self.next_listener_id();
                self.any_listeners_mut().push((id, listener));
                let cache = self.myself_downgrade();
                Ok(Unsubscribe::new(move || {
                    if let Some(cache) = cache.upgrade() {
                        cache.any_listeners_mut().retain(|(lid, _)| *lid != id);
                    }
                }))
            }
            Listen::Record { key, fields, listener } => {
                let (pk, fs) = self.resolve_lookup(&key, &fields)?;
                self.listen_on(&pk, fs, listener, true)
            }
            Listen::Records { keys, fields, listener } => self.listen_list(keys, &fields, listener),
        }
    }

    /// Listen to several keys at once. The listener gets the values of all keys before and after a change, once per
    /// batch, in the order the keys were given.
    pub fn add_listener_list<I, K>(
        &self,
        keys: I,
        fields: &[FieldPath],
        listener: impl Fn(Vec<Option<Record>>, Vec<Option<Record>>) + 'static,
    ) -> Result<Unsubscribe>
    where
        I: IntoIterator<Item = K>,
        K: Into<LookupKey>,
    {
        self.listen_list(keys.into_iter().map(Into::into).collect(), fields, Rc::new(listener))
    }

    fn listen_list(
        &self,
        keys: Vec<LookupKey>,
        fields: &[FieldPath],
        listener: MultiChangeListener,
    ) -> Result<Unsubscribe> {
        let resolved = keys
            .iter()
            .map(|key| self.resolve_lookup(key, fields))
            .collect::<Result<Vec<_>>>()?;

        let snapshot = {
            let resolved = resolved.clone();
            move |cache: &ViewModelCache| -> Result<Vec<Option<Record>>> {
                resolved.iter().map(|(pk, fs)| cache.get_resolved(pk, fs)).collect()
            }
        };
        let previous = RefCell::new(snapshot(self)?);

        let cache = self.myself_downgrade();
        let notify: AnyChangeListener = Rc::new(move || {
            let Some(cache) = cache.upgrade()
            else {
                return;
            };
            match snapshot(cache.as_ref()) {
                Ok(next) => {
                    let before = previous.replace(next.clone());
                    listener(before, next);
                }
                Err(err) => error!(
                    "[{}] {} list listener failed to read records: {err}",
                    cache.name,
                    cache.entity().name()
                ),
            }
        });

        let mut subscriptions = Vec::with_capacity(resolved.len());
        for (pk, fs) in resolved {
            let batcher = self.batcher.clone();
            let notify = notify.clone();
            // One listener per key: coalescing must not merge the changes of different keys.
            let on_change: ChangeListener = Rc::new(move |_, _| batcher.call_all(&notify));
            match self.listen_on(&pk, fs, on_change, true) {
                Ok(unsubscribe) => subscriptions.push(unsubscribe),
                Err(err) => {
                    Unsubscribe::combine(subscriptions).unsubscribe();
                    return Err(err);
                }
            }
        }
        Ok(Unsubscribe::combine(subscriptions))
    }

    /// Subscribe `callback` to the views of `pks` for `fs`. Used by caches holding relations into this one.
    pub(crate) fn subscribe_relation(
        &self,
        pks: &[PkKey],
        fs: &Arc<FieldSet>,
        callback: ChangeListener,
    ) -> Result<Unsubscribe> {
        let mut subscriptions = Vec::with_capacity(pks.len());
        for pk in pks {
            match self.listen_on(pk, fs.clone(), callback.clone(), false) {
                Ok(unsubscribe) => subscriptions.push(unsubscribe),
                Err(err) => {
                    Unsubscribe::combine(subscriptions).unsubscribe();
                    return Err(err);
                }
            }
        }
        Ok(Unsubscribe::combine(subscriptions))
    }

    /// Relation listener entry point: recompute the view `key` of `pk` after a related record changed.
    pub(crate) fn refresh(&self, pk: &PkKey, key: &str) {
        let Some(cache) = self.record_cache(pk)
        else {
            return;
        };
        let _scope = self.batcher.listeners_enabled();
        let result = self.batcher.batch(|| {
            if cache.refresh(self, key)? {
                self.notify_any_change();
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(
                "[{}] {}({}) failed to refresh [{}] after a related record changed: {err}",
                self.name,
                self.entity().name(),
                pk,
                key
            );
        }
    }

    /// Run `f` as one batch; listeners are notified once it returns successfully.
    pub fn batch<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _scope = self.batcher.listeners_enabled();
        self.batcher.batch(f)
    }
}

impl Debug for ViewModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewModelCache")
            .field("name", &self.name)
            .field("entity", &self.entity().name())
            .field("records", &self.records().len())
            .finish()
    }
}
