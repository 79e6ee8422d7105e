//! The side tables instructions refer to by index.

use std::hash::Hash;

use bimap::BiHashMap;
use itertools::Itertools;

use crate::{matcher::Matcher, ThunkInfo};

/// Collects the matchers, strings and thunks of a program while it is being generated.
///
/// Matchers and strings are deduplicated; asking for an equal entry again gives back the
/// first index. Thunks never are, since each one sits at its own place in the grammar.
#[derive(Debug, Default)]
pub struct Tables {
    matchers: BiHashMap<Matcher, usize>,
    strings: BiHashMap<String, usize>,
    actions: Vec<ThunkInfo>,
    predicates: Vec<ThunkInfo>,
}

/// The finished tables, each in index order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTables {
    pub matchers: Vec<Matcher>,
    pub strings: Vec<String>,
    pub actions: Vec<ThunkInfo>,
    pub predicates: Vec<ThunkInfo>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_matcher(&mut self, matcher: Matcher) -> usize {
        intern(&mut self.matchers, matcher)
    }

    pub fn insert_string(&mut self, s: &str) -> usize {
        if let Some(&already) = self.strings.get_by_left(s) {
            already
        } else {
            intern(&mut self.strings, s.to_owned())
        }
    }

    pub fn insert_action(&mut self, thunk: ThunkInfo) -> usize {
        self.actions.push(thunk);
        self.actions.len() - 1
    }

    pub fn insert_predicate(&mut self, thunk: ThunkInfo) -> usize {
        self.predicates.push(thunk);
        self.predicates.len() - 1
    }

    /// Fill in the parameters of an action allocated before its body was compiled.
    pub fn set_action_params(&mut self, idx: usize, params: Vec<usize>) {
        if let Some(thunk) = self.actions.get_mut(idx) {
            thunk.params = params;
        }
    }

    pub fn finish(self) -> FinishedTables {
        FinishedTables {
            matchers: in_index_order(self.matchers),
            strings: in_index_order(self.strings),
            actions: self.actions,
            predicates: self.predicates,
        }
    }
}

fn intern<T: Eq + Hash>(table: &mut BiHashMap<T, usize>, value: T) -> usize {
    if let Some(&already) = table.get_by_left(&value) {
        already
    } else {
        let idx = table.len();
        table.insert(value, idx);
        idx
    }
}

fn in_index_order<T: Eq + Hash>(table: BiHashMap<T, usize>) -> Vec<T> {
    table
        .into_iter()
        .sorted_by_key(|&(_, idx)| idx)
        .map(|(value, _)| value)
        .collect()
}
