// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Storage for the parameter sets of a stream.
//!
//! Every stored set carries a `changed` flag, raised whenever a set with different content
//! replaces it. The decoder clears the flag when it activates the set for a picture, so a
//! flag found raised on a set in use by the current picture means the stream redefined it
//! mid-picture.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::codec::h265::parser::Aps;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::MAX_APS_COUNT;
use crate::codec::h265::parser::MAX_PPS_COUNT;
use crate::codec::h265::parser::MAX_SPS_COUNT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParameterSetKind {
    Sps,
    Pps,
    Aps,
}

impl fmt::Display for ParameterSetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterSetKind::Sps => write!(f, "SPS"),
            ParameterSetKind::Pps => write!(f, "PPS"),
            ParameterSetKind::Aps => write!(f, "APS"),
        }
    }
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("{kind} {id} has not been received")]
pub struct NotPresent {
    pub kind: ParameterSetKind,
    pub id: u8,
}

#[derive(Debug)]
struct Entry<P> {
    set: Rc<P>,
    changed: bool,
}

/// Parameter sets of one kind, keyed by id.
#[derive(Debug)]
pub struct ParameterSetMap<P> {
    kind: ParameterSetKind,
    max_count: u8,
    entries: BTreeMap<u8, Entry<P>>,
}

impl<P: PartialEq + fmt::Debug> ParameterSetMap<P> {
    pub fn new(kind: ParameterSetKind, max_count: u8) -> Self {
        Self {
            kind,
            max_count,
            entries: Default::default(),
        }
    }

    pub fn kind(&self) -> ParameterSetKind {
        self.kind
    }

    /// Inserts `set` under `id`, replacing any previous one. Returns the stored set.
    ///
    /// Sending a set again with identical content keeps the stored instance and its flag.
    pub fn store(&mut self, id: u8, set: P) -> Rc<P> {
        debug_assert!(id < self.max_count);

        match self.entries.get_mut(&id) {
            Some(entry) if *entry.set == set => {
                log::debug!("{} {} received again, unchanged", self.kind, id);
            }
            Some(entry) => {
                log::debug!("{} {} redefined", self.kind, id);
                entry.set = Rc::new(set);
                entry.changed = true;
            }
            None => {
                self.entries.insert(
                    id,
                    Entry {
                        set: Rc::new(set),
                        changed: true,
                    },
                );
            }
        }

        Rc::clone(&self.entries[&id].set)
    }

    pub fn get(&self, id: u8) -> Result<Rc<P>, NotPresent> {
        self.entries
            .get(&id)
            .map(|entry| Rc::clone(&entry.set))
            .ok_or(NotPresent {
                kind: self.kind,
                id,
            })
    }

    pub fn is_changed(&self, id: u8) -> bool {
        self.entries.get(&id).is_some_and(|entry| entry.changed)
    }

    pub fn clear_changed(&mut self, id: u8) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.changed = false;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// All the parameter sets of a stream.
#[derive(Debug)]
pub struct ParameterSetStore {
    pub sps: ParameterSetMap<Sps>,
    pub pps: ParameterSetMap<Pps>,
    pub aps: ParameterSetMap<Aps>,
}

impl Default for ParameterSetStore {
    fn default() -> Self {
        Self {
            sps: ParameterSetMap::new(ParameterSetKind::Sps, MAX_SPS_COUNT),
            pps: ParameterSetMap::new(ParameterSetKind::Pps, MAX_PPS_COUNT),
            aps: ParameterSetMap::new(ParameterSetKind::Aps, MAX_APS_COUNT),
        }
    }
}

impl ParameterSetStore {
    pub fn is_changed(&self, kind: ParameterSetKind, id: u8) -> bool {
        match kind {
            ParameterSetKind::Sps => self.sps.is_changed(id),
            ParameterSetKind::Pps => self.pps.is_changed(id),
            ParameterSetKind::Aps => self.aps.is_changed(id),
        }
    }

    pub fn clear_changed(&mut self, kind: ParameterSetKind, id: u8) {
        match kind {
            ParameterSetKind::Sps => self.sps.clear_changed(id),
            ParameterSetKind::Pps => self.pps.clear_changed(id),
            ParameterSetKind::Aps => self.aps.clear_changed(id),
        }
    }

    pub fn len(&self) -> usize {
        self.sps.len() + self.pps.len() + self.aps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every stored set.
    pub fn clear(&mut self) {
        self.sps.clear();
        self.pps.clear();
        self.aps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pps(id: u8, sps_id: u8) -> Pps {
        Pps {
            pic_parameter_set_id: id,
            seq_parameter_set_id: sps_id,
            ..Default::default()
        }
    }

    #[test]
    fn missing_set_is_not_present() {
        let store = ParameterSetStore::default();
        assert_eq!(
            store.sps.get(3).unwrap_err(),
            NotPresent {
                kind: ParameterSetKind::Sps,
                id: 3
            }
        );
    }

    #[test]
    fn changed_flag_tracks_redefinition() {
        let mut store = ParameterSetStore::default();

        let first = store.pps.store(1, pps(1, 0));
        assert!(store.is_changed(ParameterSetKind::Pps, 1));
        store.clear_changed(ParameterSetKind::Pps, 1);
        assert!(!store.is_changed(ParameterSetKind::Pps, 1));

        // Identical content: same instance, flag untouched.
        let again = store.pps.store(1, pps(1, 0));
        assert!(Rc::ptr_eq(&first, &again));
        assert!(!store.is_changed(ParameterSetKind::Pps, 1));

        let redefined = store.pps.store(1, pps(1, 2));
        assert!(store.is_changed(ParameterSetKind::Pps, 1));
        assert_eq!(redefined.seq_parameter_set_id, 2);
        // Holders of the old set keep seeing the old content.
        assert_eq!(first.seq_parameter_set_id, 0);
    }

    #[test]
    fn clear_releases_everything() {
        let mut store = ParameterSetStore::default();
        store.pps.store(0, pps(0, 0));
        store.pps.store(7, pps(7, 0));
        assert_eq!(store.len(), 2);

        store.clear();
        assert!(store.is_empty());
        assert!(store.pps.get(7).is_err());
    }
}
