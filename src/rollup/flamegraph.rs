use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{AccountId, EventKind, StackSample, TimeWindow};
use crate::store::{EventStore, Field, Predicate, QueryContext, SampleQuery, Term};
use crate::Result;

pub const ROOT_FRAME: &str = "root";

/// One frame of a merged call tree. `value` is self weight, `total` includes
/// every descendant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlamegraphNode {
    pub name: String,
    pub value: f64,
    pub total: f64,
    pub children: Vec<FlamegraphNode>,
}

impl FlamegraphNode {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: 0.0,
            total: 0.0,
            children: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(ROOT_FRAME)
    }

    pub fn from_samples<'a>(samples: impl IntoIterator<Item = &'a StackSample>) -> Self {
        let mut root = Self::root();
        for sample in samples {
            root.add_sample(&sample.stack, sample.value);
        }
        root
    }

    /// Linear scan; fan-out per frame is small.
    fn child_mut(&mut self, name: &str) -> &mut FlamegraphNode {
        let idx = match self.children.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.children.push(FlamegraphNode::new(name));
                self.children.len() - 1
            }
        };
        &mut self.children[idx]
    }

    /// Walks `stack` from the root frame down. An empty stack is ignored.
    pub fn add_sample<S: AsRef<str>>(&mut self, stack: &[S], value: f64) {
        if stack.is_empty() {
            return;
        }
        self.total += value;

        let mut node = self;
        for frame in stack {
            node = node.child_mut(frame.as_ref());
            node.total += value;
        }
        node.value += value;
    }

    /// Folds `other` into `self` by matching child names at every level.
    pub fn merge(&mut self, other: FlamegraphNode) {
        self.value += other.value;
        self.total += other.total;
        for child in other.children {
            self.child_mut(&child.name).merge(child);
        }
    }

    pub fn child(&self, name: &str) -> Option<&FlamegraphNode> {
        self.children.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlamegraphRequest {
    pub service: Option<String>,
    pub profile_type: Option<String>,
}

pub async fn build_flamegraph(
    store: &dyn EventStore,
    ctx: &QueryContext,
    account: &AccountId,
    window: TimeWindow,
    request: &FlamegraphRequest,
) -> Result<FlamegraphNode> {
    let mut predicate = Predicate::new(account.clone());
    if let Some(service) = &request.service {
        predicate = predicate.and(Term::Eq(Field::ServiceName, service.clone()));
    }
    if let Some(profile_type) = &request.profile_type {
        predicate = predicate.and(Term::Eq(Field::ProfileType, profile_type.clone()));
    }

    let samples = store
        .profile_samples(ctx, &SampleQuery { predicate, window })
        .await?;
    debug!(
        kind = EventKind::Profile.as_str(),
        samples = samples.len(),
        "Building flamegraph"
    );
    Ok(FlamegraphNode::from_samples(&samples))
}
