//! Validated cache tree.
//!
//! Memoizes the result of applying a command to a server state, organized
//! as a branching tree keyed by command. A node represents the state
//! reachable by one specific command sequence from the root. Children are
//! created lazily with compute-once semantics per edge: concurrent callers
//! racing the same edge cooperate instead of duplicating work, while
//! distinct edges proceed independently.
//!
//! Cached states are re-validated on every read. The source of invalidity
//! is external to the cache (a backend restart resets server state), so a
//! cached node cannot be trusted until a caller-supplied predicate
//! re-confirms it; a stale node is recomputed and refreshed in place,
//! discarding descendants derived from the stale state.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;

use crate::error::Result;

/// One slot in a node's child map.
enum Slot<C, S> {
    /// A computation for this edge is in flight. The receiver resolves to
    /// `true` once the slot settles (resolved, or released after a
    /// failure).
    InFlight(watch::Receiver<bool>),
    /// A concrete child node.
    Resolved(Arc<CacheNode<C, S>>),
}

/// A node of the cache tree: the state reached by one command sequence,
/// plus the edges explored from it.
pub struct CacheNode<C, S> {
    state: RwLock<S>,
    /// Guarded per node; unrelated branches of the tree never contend.
    children: Mutex<HashMap<C, Slot<C, S>>>,
}

impl<C, S> std::fmt::Debug for CacheNode<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("child_count", &self.child_count())
            .finish_non_exhaustive()
    }
}

impl<C, S> CacheNode<C, S> {
    fn new(state: S) -> Self {
        Self {
            state: RwLock::new(state),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Number of edges (resolved or in flight) out of this node.
    pub fn child_count(&self) -> usize {
        self.children_lock().len()
    }

    /// Replace this node's contents after recomputation. Descendants were
    /// derived from the stale state and are discarded with it.
    fn refresh(&self, new_state: S) {
        *self.state.write().expect("state lock poisoned") = new_state;
        self.children_lock().clear();
    }

    fn children_lock(&self) -> std::sync::MutexGuard<'_, HashMap<C, Slot<C, S>>> {
        self.children.lock().expect("child map lock poisoned")
    }
}

impl<C, S: Clone> CacheNode<C, S> {
    /// Snapshot of the state this node caches.
    pub fn state(&self) -> S {
        self.state.read().expect("state lock poisoned").clone()
    }
}

/// What a caller found when it looked up an edge.
enum Claim<C: Eq + Hash + Clone, S> {
    /// A resolved, still-valid child.
    Hit(Arc<CacheNode<C, S>>),
    /// Another caller is computing this edge; wait for it to settle.
    Wait(watch::Receiver<bool>),
    /// This caller owns the edge and must run the step function.
    Compute(EdgeClaim<C, S>),
}

/// Ownership of one in-flight edge.
///
/// Dropping an unresolved claim (step error, caller cancellation, panic)
/// restores the slot to exactly what it was before the attempt and wakes
/// waiters, so the edge can be retried later.
struct EdgeClaim<C: Eq + Hash + Clone, S> {
    node: Arc<CacheNode<C, S>>,
    command: C,
    /// The previously resolved child when this claim is a refresh of a
    /// stale edge; `None` for a brand-new edge.
    stale: Option<Arc<CacheNode<C, S>>>,
    done: Option<watch::Sender<bool>>,
}

impl<C: Eq + Hash + Clone, S> EdgeClaim<C, S> {
    /// Install the computed child and wake waiters.
    fn resolve(mut self, child: Arc<CacheNode<C, S>>) {
        self.node
            .children_lock()
            .insert(self.command.clone(), Slot::Resolved(child));
        self.stale = None;
        if let Some(done) = self.done.take() {
            let _ = done.send(true);
        }
    }
}

impl<C: Eq + Hash + Clone, S> Drop for EdgeClaim<C, S> {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        // The computation never settled: put the slot back.
        if let Ok(mut children) = self.node.children.lock() {
            match self.stale.take() {
                Some(prior) => {
                    children.insert(self.command.clone(), Slot::Resolved(prior));
                }
                None => {
                    children.remove(&self.command);
                }
            }
        }
        let _ = done.send(true);
    }
}

/// A concurrent, validated, branching cache over command sequences.
pub struct CacheTree<C, S> {
    root: Arc<CacheNode<C, S>>,
}

impl<C, S> CacheTree<C, S>
where
    C: Eq + Hash + Clone,
    S: Clone,
{
    /// Create a tree whose root caches the supplied initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            root: Arc::new(CacheNode::new(initial_state)),
        }
    }

    /// The root node: the state before any command has been applied.
    pub fn root(&self) -> Arc<CacheNode<C, S>> {
        self.root.clone()
    }

    /// Advance one edge from `node` along `command`.
    ///
    /// `step` performs the real work of applying a command to a state;
    /// `validate` decides whether a previously cached state is still
    /// authoritative. A cache hit costs one `validate` call; a miss, a
    /// stale hit, or a wait behind a failed computation costs one `step`
    /// invocation, but never more than one concurrently per edge.
    ///
    /// # Errors
    ///
    /// A failing `step` propagates its error and leaves the child map
    /// exactly as it was before the attempt.
    pub async fn advance<F, Fut, V>(
        &self,
        node: &Arc<CacheNode<C, S>>,
        command: C,
        step: &F,
        validate: &V,
    ) -> Result<Arc<CacheNode<C, S>>>
    where
        F: Fn(C, S) -> Fut,
        Fut: Future<Output = Result<S>>,
        V: Fn(&S) -> bool,
    {
        loop {
            match Self::claim_edge(node, &command, validate) {
                Claim::Hit(child) => return Ok(child),
                Claim::Wait(mut settled) => {
                    // Wake when the in-flight computation settles, then
                    // re-examine the slot: it may have resolved, or been
                    // released after a failure.
                    let _ = settled.wait_for(|done| *done).await;
                }
                Claim::Compute(claim) => {
                    let parent_state = node.state();
                    let new_state = step(command.clone(), parent_state).await?;
                    let child = match &claim.stale {
                        Some(existing) => {
                            // Same slot identity: refresh in place.
                            existing.refresh(new_state);
                            existing.clone()
                        }
                        None => Arc::new(CacheNode::new(new_state)),
                    };
                    claim.resolve(child.clone());
                    return Ok(child);
                }
            }
        }
    }

    /// Left fold of [`advance`](Self::advance) over a command sequence,
    /// replaying a whole session prefix against the cache.
    pub async fn advance_sequence<F, Fut, V, I>(
        &self,
        node: &Arc<CacheNode<C, S>>,
        commands: I,
        step: &F,
        validate: &V,
    ) -> Result<Arc<CacheNode<C, S>>>
    where
        I: IntoIterator<Item = C>,
        F: Fn(C, S) -> Fut,
        Fut: Future<Output = Result<S>>,
        V: Fn(&S) -> bool,
    {
        let mut current = node.clone();
        for command in commands {
            current = self.advance(&current, command, step, validate).await?;
        }
        Ok(current)
    }

    /// Atomically decide what to do about one edge. Holds only this
    /// node's lock; `validate` must be cheap and non-blocking.
    fn claim_edge<V>(node: &Arc<CacheNode<C, S>>, command: &C, validate: &V) -> Claim<C, S>
    where
        V: Fn(&S) -> bool,
    {
        let mut children = node.children_lock();
        let resolved = match children.get(command) {
            Some(Slot::InFlight(settled)) => return Claim::Wait(settled.clone()),
            Some(Slot::Resolved(child)) => Some(child.clone()),
            None => None,
        };

        let stale = match resolved {
            Some(child) => {
                let still_valid = {
                    let state = child.state.read().expect("state lock poisoned");
                    validate(&state)
                };
                if still_valid {
                    return Claim::Hit(child);
                }
                // Re-claim the edge so racing stale readers wait instead
                // of recomputing the same step.
                Some(child)
            }
            None => None,
        };

        let (done, settled) = watch::channel(false);
        children.insert(command.clone(), Slot::InFlight(settled));
        Claim::Compute(EdgeClaim {
            node: node.clone(),
            command: command.clone(),
            stale,
            done: Some(done),
        })
    }
}
