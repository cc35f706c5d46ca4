//! Per-root handler table with wildcard resolution.
//!
//! Handlers are indexed three ways (by exact `(target, channel)` key, by
//! target, by channel) so that [`HandlerTable::resolve`] only ever touches
//! the buckets that can match.

use crate::component::ComponentId;
use crate::event::ANY;
use crate::handler::{HandlerFn, HandlerId, HandlerInfo, HandlerSpec};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

/// A handler bound into a table.
pub(crate) struct Installed {
    pub(crate) info: HandlerInfo,
    pub(crate) callable: HandlerFn,
    pub(crate) global: bool,
    pub(crate) seq: u64,
}

impl Installed {
    pub(crate) fn new(id: HandlerId, component: ComponentId, channel: &str, spec: HandlerSpec) -> Self {
        let target = spec.target.unwrap_or_else(|| channel.to_owned());
        let channels: Vec<String> = spec.channels.into_vec();
        let global = spec.global || (target == ANY && channels.iter().all(|c| c == ANY));
        Self {
            info: HandlerInfo {
                id,
                component,
                name: spec.name,
                target,
                channels,
                priority: spec.priority,
                filter: spec.filter,
                accepts_event: spec.accepts_event,
            },
            callable: spec.callable,
            global,
            seq: id.0,
        }
    }

    /// Priority descending, filters first, then insertion order.
    fn order(&self, other: &Self) -> Ordering {
        other
            .info
            .priority
            .total_cmp(&self.info.priority)
            .then_with(|| other.info.filter.cmp(&self.info.filter))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: HashMap<HandlerId, Rc<Installed>>,
    exact: HashMap<(String, String), Vec<HandlerId>>,
    by_target: HashMap<String, Vec<HandlerId>>,
    by_channel: HashMap<String, Vec<HandlerId>>,
    globals: Vec<HandlerId>,
}

impl HandlerTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn add(&mut self, installed: Rc<Installed>) {
        let id = installed.info.id;
        if installed.global {
            self.globals.push(id);
        } else {
            let target = &installed.info.target;
            self.by_target.entry(target.clone()).or_default().push(id);
            for channel in &installed.info.channels {
                self.exact
                    .entry((target.clone(), channel.clone()))
                    .or_default()
                    .push(id);
                self.by_channel.entry(channel.clone()).or_default().push(id);
            }
        }
        self.entries.insert(id, installed);
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> Option<Rc<Installed>> {
        let installed = self.entries.remove(&id)?;
        if installed.global {
            self.globals.retain(|h| *h != id);
            return Some(installed);
        }

        let target = &installed.info.target;
        prune(&mut self.by_target, target, id);
        for channel in &installed.info.channels {
            prune(&mut self.exact, &(target.clone(), channel.clone()), id);
            prune(&mut self.by_channel, channel, id);
        }
        Some(installed)
    }

    /// Move every entry of `other` into this table.
    pub(crate) fn merge(&mut self, other: HandlerTable) {
        for installed in other.entries.into_values() {
            self.add(installed);
        }
    }

    /// Remove and return the entries owned by components matching `owned`.
    pub(crate) fn split_off(&mut self, owned: impl Fn(ComponentId) -> bool) -> HandlerTable {
        let ids: Vec<HandlerId> = self
            .entries
            .values()
            .filter(|installed| owned(installed.info.component))
            .map(|installed| installed.info.id)
            .collect();

        let mut split = HandlerTable::default();
        for id in ids {
            if let Some(installed) = self.remove(id) {
                split.add(installed);
            }
        }
        split
    }

    /// Handlers for a route, in dispatch order.
    pub(crate) fn resolve(&self, target: &str, channel: &str) -> Vec<Rc<Installed>> {
        let mut ids: Vec<HandlerId> = match (target == ANY, channel == ANY) {
            (true, true) => self.entries.keys().copied().collect(),
            (false, true) => self.with_globals(self.by_target.get(target)),
            (true, false) => {
                let mut ids = self.with_globals(self.by_channel.get(channel));
                if let Some(catch_all) = self.by_channel.get(ANY) {
                    ids.extend(catch_all);
                }
                ids
            }
            (false, false) => {
                let mut ids = self.globals.clone();
                for key in [
                    (ANY, channel),
                    (target, ANY),
                    (target, channel),
                ] {
                    if let Some(bucket) = self.exact.get(&(key.0.to_owned(), key.1.to_owned())) {
                        ids.extend(bucket);
                    }
                }
                ids
            }
        };
        ids.sort_unstable();
        ids.dedup();

        let mut handlers: Vec<Rc<Installed>> = ids
            .into_iter()
            .filter_map(|id| self.entries.get(&id).cloned())
            .collect();
        handlers.sort_by(|a, b| a.order(b));
        handlers
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Rc<Installed>> {
        self.entries.values()
    }

    fn with_globals(&self, bucket: Option<&Vec<HandlerId>>) -> Vec<HandlerId> {
        let mut ids = self.globals.clone();
        if let Some(bucket) = bucket {
            ids.extend(bucket);
        }
        ids
    }
}

fn prune<K>(index: &mut HashMap<K, Vec<HandlerId>>, key: &K, id: HandlerId)
where
    K: std::hash::Hash + Eq,
{
    if let Some(bucket) = index.get_mut(key) {
        bucket.retain(|h| *h != id);
        if bucket.is_empty() {
            index.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Reply;
    use serde_json::Value;
    use smallvec::smallvec;

    struct Decl {
        name: &'static str,
        target: &'static str,
        channels: &'static [&'static str],
        priority: f64,
        filter: bool,
    }

    fn decl(name: &'static str, target: &'static str, channels: &'static [&'static str]) -> Decl {
        Decl {
            name,
            target,
            channels,
            priority: 0.0,
            filter: false,
        }
    }

    fn install(table: &mut HandlerTable, seq: u64, decl: Decl) -> HandlerId {
        let id = HandlerId(seq);
        let spec = HandlerSpec {
            name: decl.name.to_owned(),
            channels: decl.channels.iter().map(|c| (*c).to_owned()).collect(),
            target: Some(decl.target.to_owned()),
            priority: decl.priority,
            filter: decl.filter,
            overrides: false,
            accepts_event: false,
            global: false,
            inherited: false,
            callable: Rc::new(|_, _, _| Ok(Reply::Value(Value::Null))),
        };
        table.add(Rc::new(Installed::new(
            id,
            ComponentId::from_index(0),
            "app",
            spec,
        )));
        id
    }

    fn names(handlers: &[Rc<Installed>]) -> Vec<&str> {
        handlers.iter().map(|h| h.info.name.as_str()).collect()
    }

    fn sample() -> HandlerTable {
        let mut table = HandlerTable::default();
        install(&mut table, 1, decl("exact", "app", &["hello"]));
        install(&mut table, 2, decl("any_target", ANY, &["hello"]));
        install(&mut table, 3, decl("any_channel", "app", &[ANY]));
        install(&mut table, 4, decl("global", ANY, &[ANY]));
        install(&mut table, 5, decl("other_channel", "app", &["bye"]));
        install(&mut table, 6, decl("other_target", "db", &["hello"]));
        table
    }

    #[test]
    fn exact_route_unions_wildcard_buckets() {
        let table = sample();
        assert_eq!(
            names(&table.resolve("app", "hello")),
            vec!["exact", "any_target", "any_channel", "global"]
        );
    }

    #[test]
    fn wildcard_channel_collects_everything_under_target() {
        let table = sample();
        assert_eq!(
            names(&table.resolve("app", ANY)),
            vec!["exact", "any_channel", "global", "other_channel"]
        );
    }

    #[test]
    fn wildcard_target_collects_everything_on_channel() {
        let table = sample();
        assert_eq!(
            names(&table.resolve(ANY, "hello")),
            vec!["exact", "any_target", "any_channel", "global", "other_target"]
        );
        // Catch-all handlers hear broadcasts on any channel.
        assert_eq!(
            names(&table.resolve(ANY, "bye")),
            vec!["any_channel", "global", "other_channel"]
        );
    }

    #[test]
    fn double_wildcard_returns_all() {
        let table = sample();
        assert_eq!(table.resolve(ANY, ANY).len(), 6);
    }

    #[test]
    fn ordering_is_priority_then_filter_then_insertion() {
        let mut table = HandlerTable::default();
        install(&mut table, 1, decl("late_listener", "app", &["x"]));
        install(
            &mut table,
            2,
            Decl {
                filter: true,
                ..decl("filter", "app", &["x"])
            },
        );
        install(
            &mut table,
            3,
            Decl {
                priority: 5.0,
                ..decl("high", "app", &["x"])
            },
        );
        install(
            &mut table,
            4,
            Decl {
                priority: -1.0,
                ..decl("low", "app", &["x"])
            },
        );
        install(&mut table, 5, decl("later_listener", "app", &["x"]));
        assert_eq!(
            names(&table.resolve("app", "x")),
            vec!["high", "filter", "late_listener", "later_listener", "low"]
        );
    }

    #[test]
    fn multi_channel_handlers_resolve_once() {
        let mut table = HandlerTable::default();
        install(&mut table, 1, decl("both", "app", &["a", "b"]));
        assert_eq!(names(&table.resolve("app", ANY)), vec!["both"]);
        assert_eq!(names(&table.resolve("app", "b")), vec!["both"]);
    }

    #[test]
    fn remove_and_split_keep_indexes_consistent() {
        let mut table = sample();
        let removed = table.remove(HandlerId(1)).expect("installed");
        assert_eq!(removed.info.name, "exact");
        assert_eq!(
            names(&table.resolve("app", "hello")),
            vec!["any_target", "any_channel", "global"]
        );

        let split = table.split_off(|c| c == ComponentId::from_index(0));
        assert!(table.is_empty());
        assert_eq!(split.len(), 5);

        let mut merged = HandlerTable::default();
        merged.merge(split);
        assert_eq!(merged.resolve(ANY, ANY).len(), 5);
        assert_eq!(merged.resolve("db", "hello").len(), 3);
    }

    #[test]
    fn declared_global_ignores_route() {
        let mut table = HandlerTable::default();
        let spec = HandlerSpec {
            name: "watch".to_owned(),
            channels: smallvec!["watch".to_owned()],
            target: None,
            priority: 0.0,
            filter: false,
            overrides: false,
            accepts_event: false,
            global: true,
            inherited: false,
            callable: Rc::new(|_, _, _| Ok(Reply::Value(Value::Null))),
        };
        table.add(Rc::new(Installed::new(
            HandlerId(9),
            ComponentId::from_index(0),
            "app",
            spec,
        )));
        assert_eq!(names(&table.resolve("db", "anything")), vec!["watch"]);
    }
}
