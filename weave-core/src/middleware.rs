//! Middleware stages and the frozen, position-ordered stage list.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;
use crate::peer::Peer;
use crate::pipe::{Direction, Pipe, PipeError};

/// Outcome of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Hand the message to the next stage.
    Continue,
    /// Stop the traversal; the message is neither delivered nor written.
    Halt,
}

/// One unit of message processing. A stage may rewrite `msg` in place and may
/// re-enter the pipeline through `pipe.send` / `pipe.receive`.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn execute(
        &self,
        peer: &Peer,
        pipe: &mut Pipe<'_>,
        msg: &mut Message,
    ) -> Result<Flow, PipeError>;
}

/// A named middleware with its position in the stage list.
pub struct Stage {
    name: String,
    position: usize,
    middleware: Arc<dyn Middleware>,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 1-based position, assigned once when the list is built.
    pub fn position(&self) -> usize {
        self.position
    }

    pub(crate) async fn execute(
        &self,
        peer: &Peer,
        pipe: &mut Pipe<'_>,
        msg: &mut Message,
    ) -> Result<Flow, PipeError> {
        self.middleware.execute(peer, pipe, msg).await
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.position)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("position", &self.position)
            .finish()
    }
}

/// Immutable list of stages. Positions run 1..=N in registration order.
#[derive(Debug, Default)]
pub struct StageList {
    stages: Vec<Stage>,
}

impl StageList {
    pub fn builder() -> StageListBuilder {
        StageListBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Stages with position in `[from, to)`, ascending for Send, descending for Receive.
    pub(crate) fn select(&self, from: usize, to: usize, direction: Direction) -> Vec<&Stage> {
        let mut selected: Vec<&Stage> = self
            .stages
            .iter()
            .filter(|s| s.position >= from && s.position < to)
            .collect();
        if direction == Direction::Receive {
            selected.reverse();
        }
        selected
    }
}

/// Collects stages in registration order; [`build`](Self::build) freezes positions.
#[derive(Default)]
pub struct StageListBuilder {
    stages: Vec<(String, Arc<dyn Middleware>)>,
}

impl StageListBuilder {
    pub fn stage(self, name: impl Into<String>, middleware: impl Middleware + 'static) -> Self {
        self.stage_arc(name, Arc::new(middleware))
    }

    pub fn stage_arc(mut self, name: impl Into<String>, middleware: Arc<dyn Middleware>) -> Self {
        self.stages.push((name.into(), middleware));
        self
    }

    pub fn build(self) -> StageList {
        let stages = self
            .stages
            .into_iter()
            .enumerate()
            .map(|(idx, (name, middleware))| Stage {
                name,
                position: idx + 1,
                middleware,
            })
            .collect();
        StageList { stages }
    }
}

impl fmt::Debug for StageListBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|(name, _)| name))
            .finish()
    }
}
