//! The shadowed configuration object and its typed store.
//!
//! Every object carries two attribute sets: `current` (what the live
//! core runs) and `modified` (the pending edit). Auto-commit promotes
//! immediately; under ATOMIC the promotion waits for commit, and abort
//! discards the shadow. Destroy of a referenced object is refused.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DatastoreError, DatastoreResult, ErrorKind};
use crate::name::validate_name;

/// Which attribute set a query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Which {
    /// The committed set.
    Current,
    /// The pending edit.
    Modified,
}

/// One shadowed object.
#[derive(Debug, Clone)]
pub struct ConfObject<A> {
    /// Full `namespace:name`.
    pub name: String,
    /// Committed attributes; `None` before the first commit.
    pub current: Option<A>,
    /// Pending attributes.
    pub modified: Option<A>,
    /// Administrative enable.
    pub enabled: bool,
    /// Names of objects referencing this one.
    pub used_by: BTreeSet<String>,
    /// Deferred-destroy mark; operations on such objects fail
    /// `INVALID_OBJECT`.
    pub destroying: bool,
}

impl<A: Clone> ConfObject<A> {
    fn new(name: &str, attrs: A) -> Self {
        Self {
            name: name.to_string(),
            current: None,
            modified: Some(attrs),
            enabled: false,
            used_by: BTreeSet::new(),
            destroying: false,
        }
    }

    /// True when another object references this one.
    pub fn is_used(&self) -> bool {
        !self.used_by.is_empty()
    }

    /// Promotes the pending edit to current.
    pub fn promote(&mut self) {
        if let Some(m) = self.modified.take() {
            self.current = Some(m);
        }
    }

    /// Discards the pending edit.
    pub fn discard(&mut self) {
        self.modified = None;
    }

    /// The newest attribute view: the pending edit when present, else
    /// current.
    pub fn effective(&self) -> Option<&A> {
        self.modified.as_ref().or(self.current.as_ref())
    }
}

/// A named store of shadowed objects of one type.
#[derive(Debug)]
pub struct ObjectMap<A> {
    kind_name: &'static str,
    objects: BTreeMap<String, ConfObject<A>>,
}

impl<A: Clone + Serialize + DeserializeOwned> ObjectMap<A> {
    /// Creates an empty store; `kind_name` appears in error messages.
    pub fn new(kind_name: &'static str) -> Self {
        Self {
            kind_name,
            objects: BTreeMap::new(),
        }
    }

    /// The object kind this store holds.
    pub fn kind_name(&self) -> &'static str {
        self.kind_name
    }

    /// Creates an object with its initial attributes in `modified`.
    pub fn create(&mut self, name: &str, attrs: A) -> DatastoreResult<()> {
        validate_name(name)?;
        if self.objects.contains_key(name) {
            return Err(DatastoreError::already_exists(name));
        }
        self.objects.insert(name.to_string(), ConfObject::new(name, attrs));
        Ok(())
    }

    fn get_mut_live(&mut self, name: &str) -> DatastoreResult<&mut ConfObject<A>> {
        let kind = self.kind_name;
        let obj = self
            .objects
            .get_mut(name)
            .ok_or_else(|| DatastoreError::not_found(kind, name))?;
        if obj.destroying {
            return Err(DatastoreError::new(
                ErrorKind::InvalidObject,
                format!("name = :{name}: is being destroyed."),
            ));
        }
        Ok(obj)
    }

    /// Immutable access.
    pub fn get(&self, name: &str) -> DatastoreResult<&ConfObject<A>> {
        self.objects
            .get(name)
            .ok_or_else(|| DatastoreError::not_found(self.kind_name, name))
    }

    /// Mutable access, refusing objects marked for destroy.
    pub fn get_mut(&mut self, name: &str) -> DatastoreResult<&mut ConfObject<A>> {
        self.get_mut_live(name)
    }

    /// Applies an edit to the pending attribute set, cloning current
    /// when no edit is pending yet.
    pub fn modify(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut A) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        let obj = self.get_mut_live(name)?;
        let mut attrs = match (&obj.modified, &obj.current) {
            (Some(m), _) => m.clone(),
            (None, Some(c)) => c.clone(),
            (None, None) => {
                return Err(DatastoreError::new(
                    ErrorKind::InvalidObject,
                    format!("name = :{name}: has no attributes."),
                ));
            }
        };
        f(&mut attrs)?;
        obj.modified = Some(attrs);
        Ok(())
    }

    /// Removes an object outright. Fails while referenced.
    pub fn destroy(&mut self, name: &str) -> DatastoreResult<ConfObject<A>> {
        {
            let obj = self.get_mut_live(name)?;
            if obj.is_used() {
                return Err(DatastoreError::in_use(name));
            }
        }
        Ok(self.objects.remove(name).expect("checked above"))
    }

    /// Marks/unmarks a reference from `referrer`.
    pub fn set_used_by(&mut self, name: &str, referrer: &str, used: bool) -> DatastoreResult<()> {
        let obj = self
            .objects
            .get_mut(name)
            .ok_or_else(|| DatastoreError::not_found(self.kind_name, name))?;
        if used {
            obj.used_by.insert(referrer.to_string());
        } else {
            obj.used_by.remove(referrer);
        }
        Ok(())
    }

    /// Promotes every pending edit; the commit sweep.
    pub fn promote_all(&mut self) {
        for obj in self.objects.values_mut() {
            obj.promote();
        }
    }

    /// Discards every pending edit; the abort sweep.
    pub fn discard_all(&mut self) {
        for obj in self.objects.values_mut() {
            obj.discard();
        }
    }

    /// Names in order.
    pub fn names(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    /// Iterates the objects.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfObject<A>)> {
        self.objects.iter()
    }

    /// Committed attribute sets, for snapshots.
    pub fn current_attrs(&self) -> BTreeMap<String, A> {
        self.objects
            .iter()
            .filter_map(|(n, o)| o.current.clone().map(|a| (n.clone(), a)))
            .collect()
    }

    /// Replaces the whole store from a snapshot of committed attrs.
    pub fn restore(&mut self, attrs: BTreeMap<String, A>) {
        self.objects = attrs
            .into_iter()
            .map(|(name, a)| {
                let mut obj = ConfObject::new(&name, a);
                obj.promote();
                (name, obj)
            })
            .collect();
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
