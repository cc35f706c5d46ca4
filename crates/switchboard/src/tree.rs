//! The component tree.
//!
//! Components live in an arena indexed by [`ComponentId`]. Every node knows
//! its parent and root; only roots carry a [`RootState`] (event queue,
//! handler table, tick hooks). Registering a subtree merges its root state
//! into the new root; unregistering splits it back out.
//!
//! ```text
//!   register(b, a)                        unregister(b)
//!
//!   a*   b*          a*                   a*        b*
//!        |     ==>   |                    |   ==>   |
//!        c           b                    d         c
//!                    |\
//!                    c d       (* = owns queue, table, ticks)
//! ```

use crate::component::{Component, ComponentId};
use crate::dispatch::Queued;
use crate::engine::Engine;
use crate::error::RuntimeError;
use crate::event::{Event, Route};
use crate::events;
use crate::handler::{HandlerInfo, HandlerSet, TickFn};
use crate::registry::{HandlerTable, Installed};
use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::rc::Rc;
use tracing::debug;

/// State owned by the root of a tree.
#[derive(Default)]
pub(crate) struct RootState {
    pub(crate) queue: VecDeque<Queued>,
    pub(crate) table: HandlerTable,
    pub(crate) ticks: Vec<(ComponentId, TickFn)>,
}

pub(crate) struct Node {
    pub(crate) channel: String,
    pub(crate) type_name: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) parent: ComponentId,
    pub(crate) root: ComponentId,
    pub(crate) children: Vec<ComponentId>,
    pub(crate) links: BTreeSet<ComponentId>,
    /// `None` while one of the component's handlers is running.
    pub(crate) state: Option<Box<dyn Any>>,
    pub(crate) root_state: RootState,
}

/// Why a component's state could not be checked out.
pub(crate) enum Checkout {
    Gone,
    Busy,
}

impl Engine {
    /// Add a detached component to the arena.
    pub fn add<C: Component>(&self, component: C) -> ComponentId {
        let channel = component.channel().to_owned();
        let mut set = HandlerSet::<C>::new();
        C::handlers(&mut set);
        let (specs, ticks) = set.into_parts();

        let mut st = self.state.borrow_mut();
        let id = ComponentId::from_index(st.nodes.len());
        let mut table = HandlerTable::default();
        for spec in specs {
            st.next_handler += 1;
            let handler = crate::handler::HandlerId(st.next_handler);
            table.add(Rc::new(Installed::new(handler, id, &channel, spec)));
        }

        debug!(
            component = %id,
            kind = type_name::<C>(),
            %channel,
            handlers = table.len(),
            "component added"
        );
        st.nodes.push(Some(Node {
            channel,
            type_name: type_name::<C>(),
            type_id: TypeId::of::<C>(),
            parent: id,
            root: id,
            children: Vec::new(),
            links: BTreeSet::new(),
            state: Some(Box::new(component)),
            root_state: RootState {
                queue: VecDeque::new(),
                table,
                ticks: ticks.into_iter().map(|tick| (id, tick)).collect(),
            },
        }));
        id
    }

    /// Detach `id` if needed, then drop it and its whole subtree.
    pub fn remove(&self, id: ComponentId) -> Result<(), RuntimeError> {
        self.unregister(id)?;
        let mut st = self.state.borrow_mut();
        let subtree = flatten_from(&st, id);
        for member in &subtree {
            let links: Vec<ComponentId> = st.node(*member)?.links.iter().copied().collect();
            for other in links {
                if let Ok(node) = st.node_mut(other) {
                    node.links.remove(member);
                }
            }
        }
        for member in subtree {
            st.nodes[member.index()] = None;
        }
        debug!(component = %id, "component removed");
        Ok(())
    }

    /// Attach `child` (and its subtree) under `parent`.
    pub fn register(&self, child: ComponentId, parent: ComponentId) -> Result<(), RuntimeError> {
        let attached = {
            let st = self.state.borrow();
            let node = st.node(child)?;
            st.node(parent)?;
            if child == parent || is_ancestor(&st, child, parent) {
                return Err(RuntimeError::Cycle { child, parent });
            }
            node.parent != child
        };
        if attached {
            self.unregister(child)?;
        }

        let channel = {
            let mut st = self.state.borrow_mut();
            let new_root = st.node(parent)?.root;
            let moved = std::mem::take(&mut st.node_mut(child)?.root_state);

            let root_state = &mut st.node_mut(new_root)?.root_state;
            root_state.table.merge(moved.table);
            root_state.queue.extend(moved.queue);
            root_state.ticks.extend(moved.ticks);

            st.node_mut(parent)?.children.push(child);
            let node = st.node_mut(child)?;
            node.parent = parent;
            let channel = node.channel.clone();
            set_root(&mut st, child, new_root);

            debug!(%child, %parent, root = %new_root, "component registered");
            channel
        };

        self.fire(child, events::registered(child, parent).target(channel))?;
        Ok(())
    }

    /// Detach `child` and its subtree into a tree of their own. No-op for a
    /// detached component.
    pub fn unregister(&self, child: ComponentId) -> Result<(), RuntimeError> {
        let (parent, channel) = {
            let st = self.state.borrow();
            let node = st.node(child)?;
            if node.parent == child {
                return Ok(());
            }
            (node.parent, node.channel.clone())
        };

        // Delivered while the subtree is still attached.
        if let Err(err) = self.send(
            child,
            events::unregistered(child, parent).target(channel.clone()),
        ) {
            debug!(%child, error = %err, "unregistered handlers failed");
        }

        let old_root = {
            let mut st = self.state.borrow_mut();
            let node = st.node(child)?;
            if node.parent == child {
                // A handler of the pre-state event already detached it.
                return Ok(());
            }
            let parent = node.parent;
            let old_root = node.root;
            let subtree: HashSet<ComponentId> = flatten_from(&st, child).into_iter().collect();

            let root_state = &mut st.node_mut(old_root)?.root_state;
            let table = root_state.table.split_off(|c| subtree.contains(&c));
            let (ticks, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut root_state.ticks)
                .into_iter()
                .partition(|(c, _)| subtree.contains(c));
            root_state.ticks = kept;
            let (queue, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut root_state.queue)
                .into_iter()
                .partition(|queued: &Queued| subtree.contains(&queued.origin));
            root_state.queue = kept;

            st.node_mut(parent)?.children.retain(|c| *c != child);
            let node = st.node_mut(child)?;
            node.parent = child;
            node.root_state = RootState {
                queue,
                table,
                ticks,
            };
            set_root(&mut st, child, child);

            debug!(%child, %parent, old_root = %old_root, "component unregistered");
            old_root
        };

        let mut event = events::unregistered(child, parent).target(channel);
        let route = event.resolve_route("");
        self.enqueue_routed(old_root, event, route, parent);
        Ok(())
    }

    /// Link two components across trees. Links are symmetric and do not
    /// merge handler tables.
    pub fn link(&self, a: ComponentId, b: ComponentId) -> Result<(), RuntimeError> {
        let mut st = self.state.borrow_mut();
        st.node(b)?;
        st.node_mut(a)?.links.insert(b);
        st.node_mut(b)?.links.insert(a);
        Ok(())
    }

    pub fn unlink(&self, a: ComponentId, b: ComponentId) -> Result<(), RuntimeError> {
        let mut st = self.state.borrow_mut();
        st.node_mut(a)?.links.remove(&b);
        st.node_mut(b)?.links.remove(&a);
        Ok(())
    }

    pub fn links(&self, id: ComponentId) -> Vec<ComponentId> {
        self.state
            .borrow()
            .node(id)
            .map(|node| node.links.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Queue a copy of `event` on the root of every tree linked to `origin`.
    pub fn fire_linked(&self, origin: ComponentId, event: Event) -> Result<usize, RuntimeError> {
        let (channel, targets) = {
            let st = self.state.borrow();
            let node = st.node(origin)?;
            let roots: BTreeSet<ComponentId> = node
                .links
                .iter()
                .filter_map(|link| st.node(*link).ok().map(|n| n.root))
                .collect();
            (node.channel.clone(), roots)
        };

        for root in &targets {
            let mut copy = event.duplicate();
            let route = copy.resolve_route(&channel);
            self.enqueue_routed(*root, copy, route, origin);
        }
        Ok(targets.len())
    }

    pub fn root_of(&self, id: ComponentId) -> Option<ComponentId> {
        self.state.borrow().node(id).ok().map(|node| node.root)
    }

    /// The parent, or `None` for a detached component.
    pub fn parent_of(&self, id: ComponentId) -> Option<ComponentId> {
        self.state
            .borrow()
            .node(id)
            .ok()
            .filter(|node| node.parent != id)
            .map(|node| node.parent)
    }

    pub fn children(&self, id: ComponentId) -> Vec<ComponentId> {
        self.state
            .borrow()
            .node(id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    pub fn channel_of(&self, id: ComponentId) -> Option<String> {
        self.state.borrow().node(id).ok().map(|node| node.channel.clone())
    }

    pub fn type_name_of(&self, id: ComponentId) -> Option<&'static str> {
        self.state.borrow().node(id).ok().map(|node| node.type_name)
    }

    pub fn contains_component(&self, id: ComponentId) -> bool {
        self.state.borrow().node(id).is_ok()
    }

    /// `id` and its descendants, pre-order.
    pub fn flatten(&self, id: ComponentId) -> Vec<ComponentId> {
        flatten_from(&self.state.borrow(), id)
    }

    /// Whether `child` is a strict descendant of `parent`.
    pub fn contains(&self, parent: ComponentId, child: ComponentId) -> bool {
        parent != child && is_ancestor(&self.state.borrow(), parent, child)
    }

    pub fn find_by_channel(&self, root: ComponentId, channel: &str) -> Vec<ComponentId> {
        let st = self.state.borrow();
        flatten_from(&st, root)
            .into_iter()
            .filter(|id| st.node(*id).is_ok_and(|node| node.channel == channel))
            .collect()
    }

    pub fn find_by_type<C: Component>(&self, root: ComponentId) -> Vec<ComponentId> {
        let st = self.state.borrow();
        flatten_from(&st, root)
            .into_iter()
            .filter(|id| st.node(*id).is_ok_and(|node| node.type_id == TypeId::of::<C>()))
            .collect()
    }

    /// Number of handlers installed in the table of `id`'s tree.
    pub fn handler_count(&self, id: ComponentId) -> usize {
        let st = self.state.borrow();
        st.node(id)
            .and_then(|node| st.node(node.root))
            .map(|root| root.root_state.table.len())
            .unwrap_or(0)
    }

    /// Handlers installed in `id`'s tree, in no particular order.
    pub fn handlers(&self, id: ComponentId) -> Vec<HandlerInfo> {
        let st = self.state.borrow();
        st.node(id)
            .and_then(|node| st.node(node.root))
            .map(|root| {
                root.root_state
                    .table
                    .iter()
                    .map(|installed| installed.info.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events waiting on the queue of `id`'s tree.
    pub fn queue_len(&self, id: ComponentId) -> usize {
        let st = self.state.borrow();
        st.node(id)
            .and_then(|node| st.node(node.root))
            .map(|root| root.root_state.queue.len())
            .unwrap_or(0)
    }

    /// Copies of the queued events of `id`'s tree, in order.
    pub fn queued(&self, id: ComponentId) -> Vec<(Event, Route)> {
        let st = self.state.borrow();
        st.node(id)
            .and_then(|node| st.node(node.root))
            .map(|root| {
                root.root_state
                    .queue
                    .iter()
                    .map(|queued| (queued.event.clone(), queued.route.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Borrow a component's state mutably.
    pub fn with_component<C: Component, R>(
        &self,
        id: ComponentId,
        f: impl FnOnce(&mut C) -> R,
    ) -> Result<R, RuntimeError> {
        let mut state = self.checkout(id).map_err(|reason| match reason {
            Checkout::Gone => RuntimeError::UnknownComponent(id),
            Checkout::Busy => RuntimeError::ComponentBusy(id),
        })?;
        let result = match state.downcast_mut::<C>() {
            Some(component) => Ok(f(component)),
            None => Err(RuntimeError::TypeMismatch {
                id,
                expected: type_name::<C>(),
            }),
        };
        self.checkin(id, state);
        result
    }

    pub(crate) fn checkout(&self, id: ComponentId) -> Result<Box<dyn Any>, Checkout> {
        let mut st = self.state.borrow_mut();
        let node = st.node_mut(id).map_err(|_| Checkout::Gone)?;
        node.state.take().ok_or(Checkout::Busy)
    }

    /// Return checked-out state. Dropped if the component was removed
    /// meanwhile.
    pub(crate) fn checkin(&self, id: ComponentId, state: Box<dyn Any>) {
        if let Ok(node) = self.state.borrow_mut().node_mut(id) {
            node.state = Some(state);
        }
    }
}

fn flatten_from(st: &crate::engine::State, id: ComponentId) -> Vec<ComponentId> {
    let mut out = Vec::new();
    let mut stack = vec![id];
    while let Some(next) = stack.pop() {
        let Ok(node) = st.node(next) else {
            continue;
        };
        out.push(next);
        stack.extend(node.children.iter().rev().copied());
    }
    out
}

/// Whether `ancestor` is `id` or one of its ancestors.
fn is_ancestor(st: &crate::engine::State, ancestor: ComponentId, id: ComponentId) -> bool {
    let mut current = id;
    loop {
        if current == ancestor {
            return true;
        }
        match st.node(current) {
            Ok(node) if node.parent != current => current = node.parent,
            _ => return false,
        }
    }
}

fn set_root(st: &mut crate::engine::State, id: ComponentId, root: ComponentId) {
    for member in flatten_from(st, id) {
        if let Ok(node) = st.node_mut(member) {
            node.root = root;
        }
    }
}
