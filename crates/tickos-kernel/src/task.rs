//! Task control blocks and task identity.

use serde::Serialize;
use std::fmt;

use crate::unit::TaskUnit;
use crate::value::Value;

/// Opaque, stable task identifier.
///
/// Handles are allocated monotonically per kernel and never reused within a
/// kernel's lifetime. Zero is never a valid handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TaskHandle(u64);

impl TaskHandle {
    /// Get the numeric handle value.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a handle from a u64 value.
    pub fn from_u64(id: u64) -> Self {
        TaskHandle(id)
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State of a task.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TaskState {
    /// In the ready queue, waiting to be picked
    Ready,
    /// The task currently being advanced
    Running,
    /// Waiting for a condition (a delay expiry)
    Blocked,
    /// Parked by suspend(); invisible to the scheduler until resumed
    Suspended,
}

/// Why a blocked task is blocked.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum BlockReason {
    /// Waiting for a tick-count delay to expire
    Delay,
}

/// Task control block.
///
/// Owns the task's restartable unit along with its scheduling fields and
/// telemetry. All transitions go through the task table, which keeps the
/// state field and set memberships in agreement.
#[derive(Debug)]
pub struct Tcb {
    /// Stable identifier
    pub handle: TaskHandle,

    /// Human-readable label, informational only
    pub name: String,

    /// Scheduling priority; higher value runs first
    pub priority: i32,

    /// Current lifecycle state
    pub state: TaskState,

    /// The restartable unit advancing this task's body
    pub unit: TaskUnit,

    /// Remaining ticks before auto-unblock; nonzero only while blocked on a
    /// delay
    pub delay_ticks: u32,

    /// Reason for the current block, when blocked
    pub blocked_on: Option<BlockReason>,

    /// Tick at which the task was created
    pub created_at: u64,

    /// Tick at which the task last advanced
    pub last_ran_at: Option<u64>,

    /// Number of times the task has been advanced
    pub run_count: u64,

    /// Opaque stack-size hint; reserved space, not an execution bound
    pub stack_hint: usize,

    /// Opaque value passed through to the body
    pub params: Value,
}

impl Tcb {
    /// Capture an embedder-facing snapshot of this TCB.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            handle: self.handle,
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            delay_ticks: self.delay_ticks,
            blocked_on: self.blocked_on,
            created_at: self.created_at,
            last_ran_at: self.last_ran_at,
            run_count: self.run_count,
            stack_hint: self.stack_hint,
        }
    }
}

/// Point-in-time view of a TCB, safe to hand to embedders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub handle: TaskHandle,
    pub name: String,
    pub priority: i32,
    pub state: TaskState,
    pub delay_ticks: u32,
    pub blocked_on: Option<BlockReason>,
    pub created_at: u64,
    pub last_ran_at: Option<u64>,
    pub run_count: u64,
    pub stack_hint: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_display() {
        assert_eq!(TaskHandle::from_u64(7).to_string(), "#7");
    }

    #[test]
    fn test_handle_ordering() {
        assert!(TaskHandle::from_u64(1) < TaskHandle::from_u64(2));
    }
}
