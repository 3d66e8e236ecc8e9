//! The task table: owns every TCB and all state transitions.
//!
//! Every task is in exactly one of the ready queue, the blocked list, the
//! suspended list, or the running slot; `state` and membership always agree.
//! Invalid transitions are reported as `false`, never as panics or errors.

use rustc_hash::FxHashMap;

use crate::ready::ReadyQueue;
use crate::task::{BlockReason, TaskHandle, TaskState, Tcb};
use crate::unit::TaskUnit;
use crate::value::Value;

/// Owns the set of tasks and their control blocks.
#[derive(Debug, Default)]
pub struct TaskTable {
    tasks: FxHashMap<TaskHandle, Tcb>,
    ready: ReadyQueue,
    /// Blocked tasks in block order, so same-tick unblocks re-enter the
    /// ready queue deterministically.
    blocked: Vec<TaskHandle>,
    /// Suspended tasks in suspension order.
    suspended: Vec<TaskHandle>,
    running: Option<TaskHandle>,
    next_handle: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle and store a new TCB in the ready state.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &mut self,
        name: String,
        priority: i32,
        unit: TaskUnit,
        stack_hint: usize,
        params: Value,
        now_tick: u64,
    ) -> TaskHandle {
        self.next_handle += 1;
        let handle = TaskHandle::from_u64(self.next_handle);

        self.tasks.insert(
            handle,
            Tcb {
                handle,
                name,
                priority,
                state: TaskState::Ready,
                unit,
                delay_ticks: 0,
                blocked_on: None,
                created_at: now_tick,
                last_ran_at: None,
                run_count: 0,
                stack_hint,
                params,
            },
        );
        self.ready.insert(handle, priority);
        handle
    }

    /// Remove a task from the table and all memberships.
    ///
    /// Returns true iff the task existed.
    pub fn remove(&mut self, handle: TaskHandle) -> bool {
        if self.tasks.remove(&handle).is_none() {
            return false;
        }
        self.ready.remove(handle);
        self.blocked.retain(|h| *h != handle);
        self.suspended.retain(|h| *h != handle);
        if self.running == Some(handle) {
            self.running = None;
        }
        true
    }

    /// Move a task to the suspended state from any non-suspended state.
    pub fn suspend(&mut self, handle: TaskHandle) -> bool {
        let Some(tcb) = self.tasks.get_mut(&handle) else {
            return false;
        };
        if tcb.state == TaskState::Suspended {
            return false;
        }

        match tcb.state {
            TaskState::Ready => {
                self.ready.remove(handle);
            }
            TaskState::Blocked => {
                self.blocked.retain(|h| *h != handle);
            }
            TaskState::Running => {
                self.running = None;
            }
            TaskState::Suspended => unreachable!("checked above"),
        }

        let tcb = self.tasks.get_mut(&handle).expect("present above");
        tcb.state = TaskState::Suspended;
        // A suspended task no longer waits on its delay; resume goes to
        // ready regardless of what it was doing.
        tcb.delay_ticks = 0;
        tcb.blocked_on = None;
        self.suspended.push(handle);
        true
    }

    /// Return a suspended task to the ready queue.
    pub fn resume(&mut self, handle: TaskHandle) -> bool {
        let Some(tcb) = self.tasks.get_mut(&handle) else {
            return false;
        };
        if tcb.state != TaskState::Suspended {
            return false;
        }
        tcb.state = TaskState::Ready;
        let priority = tcb.priority;
        self.suspended.retain(|h| *h != handle);
        self.ready.insert(handle, priority);
        true
    }

    /// Block a ready or running task.
    pub fn block(&mut self, handle: TaskHandle, reason: BlockReason) -> bool {
        let Some(tcb) = self.tasks.get_mut(&handle) else {
            return false;
        };
        match tcb.state {
            TaskState::Ready => {
                self.ready.remove(handle);
            }
            TaskState::Running => {
                self.running = None;
            }
            TaskState::Blocked | TaskState::Suspended => return false,
        }

        let tcb = self.tasks.get_mut(&handle).expect("present above");
        tcb.state = TaskState::Blocked;
        tcb.blocked_on = Some(reason);
        self.blocked.push(handle);
        true
    }

    /// Unblock a blocked task back to ready.
    pub fn unblock(&mut self, handle: TaskHandle) -> bool {
        let Some(tcb) = self.tasks.get_mut(&handle) else {
            return false;
        };
        if tcb.state != TaskState::Blocked {
            return false;
        }
        tcb.state = TaskState::Ready;
        tcb.blocked_on = None;
        tcb.delay_ticks = 0;
        let priority = tcb.priority;
        self.blocked.retain(|h| *h != handle);
        self.ready.insert(handle, priority);
        true
    }

    /// Update a task's priority. A ready task is re-inserted so queue
    /// ordering is maintained; blocked and suspended tasks keep the stored
    /// priority for their eventual re-admission.
    pub fn set_priority(&mut self, handle: TaskHandle, priority: i32) -> bool {
        let Some(tcb) = self.tasks.get_mut(&handle) else {
            return false;
        };
        tcb.priority = priority;
        let was_ready = tcb.state == TaskState::Ready;
        if was_ready {
            self.ready.remove(handle);
            self.ready.insert(handle, priority);
        }
        true
    }

    /// Head of the ready queue.
    pub fn next_ready(&self) -> Option<TaskHandle> {
        self.ready.head()
    }

    /// Priority of the ready-queue head.
    pub fn next_ready_priority(&self) -> Option<i32> {
        self.ready.head_priority()
    }

    /// Transition a ready task into the running slot.
    pub fn make_running(&mut self, handle: TaskHandle) -> bool {
        if self.running.is_some() {
            return false;
        }
        let Some(tcb) = self.tasks.get_mut(&handle) else {
            return false;
        };
        if tcb.state != TaskState::Ready {
            return false;
        }
        tcb.state = TaskState::Running;
        self.ready.remove(handle);
        self.running = Some(handle);
        true
    }

    /// Return the running task (if any) to the tail of its priority band.
    pub fn yield_current(&mut self) -> bool {
        let Some(handle) = self.running.take() else {
            return false;
        };
        let tcb = self.tasks.get_mut(&handle).expect("running task has a TCB");
        tcb.state = TaskState::Ready;
        let priority = tcb.priority;
        self.ready.insert(handle, priority);
        true
    }

    /// The currently running task.
    pub fn running(&self) -> Option<TaskHandle> {
        self.running
    }

    pub fn get(&self, handle: TaskHandle) -> Option<&Tcb> {
        self.tasks.get(&handle)
    }

    pub fn get_mut(&mut self, handle: TaskHandle) -> Option<&mut Tcb> {
        self.tasks.get_mut(&handle)
    }

    pub fn contains(&self, handle: TaskHandle) -> bool {
        self.tasks.contains_key(&handle)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.len()
    }

    /// Blocked tasks in block order.
    pub fn blocked_tasks(&self) -> Vec<TaskHandle> {
        self.blocked.clone()
    }

    /// All live handles, sorted for stable iteration.
    pub fn handles(&self) -> Vec<TaskHandle> {
        let mut handles: Vec<_> = self.tasks.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Assert the state/membership invariants. Test support.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        use crate::task::TaskState::*;

        let mut seen = 0;
        for handle in self.ready.iter() {
            assert_eq!(self.tasks[&handle].state, Ready, "{} in ready queue", handle);
            seen += 1;
        }
        for handle in &self.blocked {
            assert_eq!(self.tasks[handle].state, Blocked, "{} in blocked list", handle);
            seen += 1;
        }
        for handle in &self.suspended {
            assert_eq!(
                self.tasks[handle].state,
                Suspended,
                "{} in suspended list",
                handle
            );
            seen += 1;
        }
        if let Some(handle) = self.running {
            assert_eq!(self.tasks[&handle].state, Running, "{} running", handle);
            seen += 1;
        }
        assert_eq!(seen, self.tasks.len(), "every task in exactly one set");

        for tcb in self.tasks.values() {
            if tcb.delay_ticks > 0 {
                assert_eq!(tcb.state, Blocked, "{} delayed but not blocked", tcb.handle);
            }
        }

        let priorities: Vec<_> = self.ready.priorities().collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted, "ready queue priority order");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{TransformMode, Transformer};

    fn test_unit() -> TaskUnit {
        Transformer::new(TransformMode::DelayOnly)
            .transform("(k) => { while (true) { k.yield(); } }")
            .unwrap()
            .factory
            .instantiate(&Value::Null)
    }

    fn table_with(count: usize, priority: i32) -> (TaskTable, Vec<TaskHandle>) {
        let mut table = TaskTable::new();
        let handles = (0..count)
            .map(|i| {
                table.create(
                    format!("task{}", i),
                    priority,
                    test_unit(),
                    1024,
                    Value::Null,
                    0,
                )
            })
            .collect();
        (table, handles)
    }

    #[test]
    fn test_create_starts_ready() {
        let (table, handles) = table_with(1, 5);
        assert_eq!(table.get(handles[0]).unwrap().state, TaskState::Ready);
        assert_eq!(table.next_ready(), Some(handles[0]));
        table.check_invariants();
    }

    #[test]
    fn test_handles_unique_and_monotonic() {
        let mut table = TaskTable::new();
        let a = table.create("a".into(), 1, test_unit(), 0, Value::Null, 0);
        let b = table.create("b".into(), 1, test_unit(), 0, Value::Null, 0);
        table.remove(a);
        let c = table.create("c".into(), 1, test_unit(), 0, Value::Null, 0);
        assert!(a < b && b < c, "handles are never reused");
    }

    #[test]
    fn test_remove_clears_all_membership() {
        let (mut table, handles) = table_with(2, 5);
        assert!(table.make_running(handles[0]));
        assert!(table.remove(handles[0]));
        assert_eq!(table.running(), None);
        assert!(!table.remove(handles[0]));
        table.check_invariants();
    }

    #[test]
    fn test_suspend_resume_round_trip() {
        let (mut table, handles) = table_with(1, 7);
        assert!(table.suspend(handles[0]));
        assert_eq!(table.get(handles[0]).unwrap().state, TaskState::Suspended);
        assert!(!table.suspend(handles[0]), "already suspended");
        table.check_invariants();

        assert!(table.resume(handles[0]));
        let tcb = table.get(handles[0]).unwrap();
        assert_eq!(tcb.state, TaskState::Ready);
        assert_eq!(tcb.priority, 7, "priority survives the round trip");
        table.check_invariants();
    }

    #[test]
    fn test_resume_requires_suspended() {
        let (mut table, handles) = table_with(1, 5);
        assert!(!table.resume(handles[0]));
    }

    #[test]
    fn test_suspend_blocked_task_clears_delay() {
        let (mut table, handles) = table_with(1, 5);
        assert!(table.block(handles[0], BlockReason::Delay));
        table.get_mut(handles[0]).unwrap().delay_ticks = 10;
        assert!(table.suspend(handles[0]));
        let tcb = table.get(handles[0]).unwrap();
        assert_eq!(tcb.delay_ticks, 0);
        assert_eq!(tcb.blocked_on, None);
        table.check_invariants();
    }

    #[test]
    fn test_block_unblock() {
        let (mut table, handles) = table_with(1, 5);
        assert!(table.block(handles[0], BlockReason::Delay));
        assert_eq!(
            table.get(handles[0]).unwrap().blocked_on,
            Some(BlockReason::Delay)
        );
        assert!(!table.block(handles[0], BlockReason::Delay), "already blocked");
        table.check_invariants();

        assert!(table.unblock(handles[0]));
        assert_eq!(table.get(handles[0]).unwrap().state, TaskState::Ready);
        assert!(!table.unblock(handles[0]));
        table.check_invariants();
    }

    #[test]
    fn test_block_running_clears_slot() {
        let (mut table, handles) = table_with(1, 5);
        assert!(table.make_running(handles[0]));
        assert!(table.block(handles[0], BlockReason::Delay));
        assert_eq!(table.running(), None);
        table.check_invariants();
    }

    #[test]
    fn test_set_priority_reorders_ready_queue() {
        let (mut table, handles) = table_with(3, 5);
        assert!(table.set_priority(handles[2], 9));
        assert_eq!(table.next_ready(), Some(handles[2]));
        table.check_invariants();
    }

    #[test]
    fn test_set_priority_on_blocked_stores_only() {
        let (mut table, handles) = table_with(2, 5);
        assert!(table.block(handles[0], BlockReason::Delay));
        assert!(table.set_priority(handles[0], 9));
        // Not in the ready queue yet...
        assert_eq!(table.next_ready(), Some(handles[1]));
        // ...but re-admitted at the new priority.
        assert!(table.unblock(handles[0]));
        assert_eq!(table.next_ready(), Some(handles[0]));
        table.check_invariants();
    }

    #[test]
    fn test_yield_current_rotates_band() {
        let (mut table, handles) = table_with(3, 5);
        assert!(table.make_running(handles[0]));
        assert!(table.yield_current());
        assert_eq!(table.running(), None);
        // The yielded task re-enters at the tail of its band.
        let order: Vec<_> = [table.next_ready()].into_iter().flatten().collect();
        assert_eq!(order, vec![handles[1]]);
        table.check_invariants();
    }

    #[test]
    fn test_operations_on_unknown_handle_return_false() {
        let mut table = TaskTable::new();
        let ghost = TaskHandle::from_u64(42);
        assert!(!table.remove(ghost));
        assert!(!table.suspend(ghost));
        assert!(!table.resume(ghost));
        assert!(!table.block(ghost, BlockReason::Delay));
        assert!(!table.unblock(ghost));
        assert!(!table.set_priority(ghost, 1));
        assert!(!table.make_running(ghost));
    }
}
