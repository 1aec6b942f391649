//! Thread-local context/diagnostics stack.
//!
//! # Responsibility
//! - Record "what is happening" frames while the engine works on items.
//! - Render failure diagnostics from the innermost frame outwards.
//!
//! # Invariants
//! - Frames are pushed and popped only through `ContextGuard`, so the stack
//!   unwinds correctly on early returns and panics.
//! - The stack is per thread; frames never leak across threads.

use crate::model::item::ItemId;
use serde::Serialize;
use std::cell::RefCell;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use uuid::Uuid;

/// Operation recorded by one context frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    LoadConfig,
    MetaReady,
    DataReady,
    Validate,
    Commit,
    StorageOpen,
    StorageRead,
    StorageWrite,
    StorageClose,
}

impl ContextRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadConfig => "loading configuration",
            Self::MetaReady => "determining structure of",
            Self::DataReady => "computing data of",
            Self::Validate => "validating",
            Self::Commit => "committing",
            Self::StorageOpen => "opening storage",
            Self::StorageRead => "reading storage",
            Self::StorageWrite => "writing storage",
            Self::StorageClose => "closing storage",
        }
    }
}

/// One entry of the context stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextFrame {
    pub role: ContextRole,
    pub item: Option<ItemId>,
    /// Item path or storage location.
    pub label: String,
}

impl Display for ContextFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} `{}`", self.role.as_str(), self.label)
    }
}

/// Session metadata appended to every diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub version: &'static str,
    pub pid: u32,
}

impl SessionInfo {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            version: env!("CARGO_PKG_VERSION"),
            pid: std::process::id(),
        }
    }
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static STACK: RefCell<Vec<ContextFrame>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a frame; it is popped when the returned guard drops.
pub fn enter(role: ContextRole, item: Option<ItemId>, label: impl Into<String>) -> ContextGuard {
    let frame = ContextFrame {
        role,
        item,
        label: label.into(),
    };
    let depth = STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.push(frame);
        stack.len()
    });
    ContextGuard {
        depth,
        _not_send: PhantomData,
    }
}

/// Snapshot of the current thread's stack, outermost first.
pub fn frames() -> Vec<ContextFrame> {
    STACK.with(|stack| stack.borrow().clone())
}

/// Innermost frame of the current thread, if any.
pub fn innermost() -> Option<ContextFrame> {
    STACK.with(|stack| stack.borrow().last().cloned())
}

/// Returns whether the current thread is already working on `item` in `role`.
pub fn is_active(role: ContextRole, item: ItemId) -> bool {
    STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|frame| frame.role == role && frame.item == Some(item))
    })
}

/// Renders `reason` with the current stack (innermost first) and `session`.
pub fn describe_failure(reason: &str, session: &SessionInfo) -> String {
    let mut text = reason.to_string();
    for frame in frames().iter().rev() {
        text.push_str("\n  while ");
        text.push_str(&frame.to_string());
    }
    text.push_str(&format!(
        "\n[dms_core {} session={} pid={}]",
        session.version, session.session_id, session.pid
    ));
    text
}

/// Scope guard for one context frame.
#[derive(Debug)]
#[must_use = "the frame is popped as soon as the guard drops"]
pub struct ContextGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let depth = self.depth;
        let _ = STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            stack.truncate(depth.saturating_sub(1));
        });
    }
}
