//! The tick scheduler and the periodic tick driver.
//!
//! Each tick: bump the counter, age every delay-blocked task (unblocking the
//! expired ones in block order), select the next task, context-switch, and
//! advance the selected task's restartable unit by one step. Errors raised
//! by a unit are caught here; the failing task is logged and deleted and no
//! other task is affected.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::kernel::SchedulerConfig;
use crate::task::{BlockReason, TaskHandle};
use crate::table::TaskTable;
use crate::transform::op::UnitProgram;
use crate::unit::{PrintSink, Step, Suspension, TaskUnit, UnitContext};
use crate::value::Value;

/// Body compiled for the idle task: always ready, always yielding.
pub(crate) const IDLE_BODY: &str = "(k) => { while (true) { k.yield(); } }";

/// Priority of the idle task; user tasks at this priority share its band.
pub(crate) const IDLE_PRIORITY: i32 = 0;

/// The cooperative tick scheduler.
///
/// All mutation happens under the kernel's state lock; the tick driver and
/// the facade serialize on it, which is the whole concurrency story of a
/// cooperative kernel hosted on threads.
pub(crate) struct Scheduler {
    table: TaskTable,
    tick_count: u64,
    idle: TaskHandle,
    idle_program: Arc<UnitProgram>,
    config: SchedulerConfig,
    sink: Arc<dyn PrintSink>,
    name_counter: u64,
}

impl Scheduler {
    pub(crate) fn new(
        config: SchedulerConfig,
        sink: Arc<dyn PrintSink>,
        idle_program: Arc<UnitProgram>,
    ) -> Self {
        let mut table = TaskTable::new();
        let idle = table.create(
            "idle".to_string(),
            IDLE_PRIORITY,
            TaskUnit::new(idle_program.clone(), &Value::Null),
            config.idle_task_stack_size,
            Value::Null,
            0,
        );
        Self {
            table,
            tick_count: 0,
            idle,
            idle_program,
            config,
            sink,
            name_counter: 0,
        }
    }

    pub(crate) fn table(&self) -> &TaskTable {
        &self.table
    }

    pub(crate) fn table_mut(&mut self) -> &mut TaskTable {
        &mut self.table
    }

    pub(crate) fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub(crate) fn idle_handle(&self) -> TaskHandle {
        self.idle
    }

    /// Allocate the next default task name.
    pub(crate) fn next_task_name(&mut self) -> String {
        self.name_counter += 1;
        format!("Task_{}", self.name_counter)
    }

    /// Register a new task in the ready state.
    pub(crate) fn create_task(
        &mut self,
        name: String,
        priority: i32,
        unit: TaskUnit,
        stack_hint: usize,
        params: Value,
    ) -> TaskHandle {
        self.table
            .create(name, priority, unit, stack_hint, params, self.tick_count)
    }

    /// Run one full scheduler tick.
    pub(crate) fn tick(&mut self) {
        self.tick_count += 1;

        // Phase 1: delay accounting, in block order.
        for handle in self.table.blocked_tasks() {
            let Some(tcb) = self.table.get_mut(handle) else {
                continue;
            };
            if tcb.blocked_on == Some(BlockReason::Delay) && tcb.delay_ticks > 0 {
                tcb.delay_ticks -= 1;
                if tcb.delay_ticks == 0 {
                    self.table.unblock(handle);
                }
            }
        }

        // Phase 2: selection.
        let picked = self.select();

        // Phase 3: context switch. The outgoing task rotates to the tail of
        // its priority band.
        if self.table.running() != Some(picked) {
            if self.table.running().is_some() {
                self.table.yield_current();
            }
            self.table.make_running(picked);
        }

        // Phase 4: advance one step and interpret the outcome.
        self.advance(picked);
    }

    /// Pick the task to run this tick.
    ///
    /// The ready head preempts the runner only at priority >= the runner's:
    /// equal priority rotates the band (round-robin), higher priority
    /// preempts, and a lower-priority head (the idle task included) never
    /// displaces a runner.
    fn select(&self) -> TaskHandle {
        match (self.table.running(), self.table.next_ready()) {
            (Some(running), Some(head)) => {
                let running_priority = self
                    .table
                    .get(running)
                    .map(|t| t.priority)
                    .unwrap_or(IDLE_PRIORITY);
                let head_priority = self.table.next_ready_priority().unwrap_or(IDLE_PRIORITY);
                if head_priority >= running_priority {
                    head
                } else {
                    running
                }
            }
            (Some(running), None) => running,
            (None, Some(head)) => head,
            // The idle task is always ready or running, so this arm only
            // covers a table that lost it to an error.
            (None, None) => self.idle,
        }
    }

    /// Advance one task's unit by one step.
    fn advance(&mut self, handle: TaskHandle) {
        let tick_count = self.tick_count;
        let tick_rate = self.config.tick_rate;
        let sink = self.sink.clone();

        let Some(tcb) = self.table.get_mut(handle) else {
            return;
        };
        tcb.run_count += 1;
        tcb.last_ran_at = Some(tick_count);
        let params = tcb.params.clone();

        let ctx = UnitContext {
            tick_count,
            tick_rate,
            handle,
            params: &params,
            sink: &*sink,
        };
        let result = tcb.unit.step(&ctx);

        match result {
            Ok(Step::Done) => {
                log::debug!("task {} completed", handle);
                self.table.remove(handle);
                if handle == self.idle {
                    self.recreate_idle();
                }
            }
            Ok(Step::Yield(Suspension::Delay(ticks))) if ticks > 0 => {
                self.table.block(handle, BlockReason::Delay);
                if let Some(tcb) = self.table.get_mut(handle) {
                    tcb.delay_ticks = ticks;
                }
            }
            // A zero delay and a plain yield both leave the task running;
            // the next tick's context switch rotates it if a peer is ready.
            Ok(Step::Yield(_)) => {}
            Err(error) => {
                let name = self
                    .table
                    .get(handle)
                    .map(|t| t.name.clone())
                    .unwrap_or_default();
                log::warn!("task {} ({}) failed and was deleted: {}", handle, name, error);
                self.table.remove(handle);
                if handle == self.idle {
                    self.recreate_idle();
                }
            }
        }
    }

    /// Rebuild the idle task after a failure, preserving the invariant that
    /// exactly one idle task always exists.
    fn recreate_idle(&mut self) {
        let unit = TaskUnit::new(self.idle_program.clone(), &Value::Null);
        self.idle = self.table.create(
            "idle".to_string(),
            IDLE_PRIORITY,
            unit,
            self.config.idle_task_stack_size,
            Value::Null,
            self.tick_count,
        );
        log::warn!("idle task recreated as {}", self.idle);
    }

    /// Current state counts for the status snapshot.
    pub(crate) fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.table.ready_count(),
            self.table.blocked_count(),
            self.table.suspended_count(),
            self.table.len(),
        )
    }

    /// Whether a task may be targeted by a lifecycle operation from the
    /// facade. The idle task is owned by the kernel and refuses them.
    pub(crate) fn is_user_task(&self, handle: TaskHandle) -> bool {
        handle != self.idle && self.table.contains(handle)
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, handle: TaskHandle) -> Option<crate::task::TaskState> {
        self.table.get(handle).map(|t| t.state)
    }
}

// ============================================================================
// Tick driver
// ============================================================================

struct DriverShared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Periodic driver thread calling the kernel's tick at a fixed rate.
///
/// The condvar lets `stop()` interrupt the inter-tick wait immediately
/// instead of waiting out the period.
pub(crate) struct TickDriver {
    shared: Arc<DriverShared>,
    handle: Option<JoinHandle<()>>,
}

impl TickDriver {
    /// Spawn the driver thread at `tick_rate` Hz.
    pub(crate) fn start(tick_rate: u32, tick_fn: Arc<dyn Fn() + Send + Sync>) -> Self {
        let period = Duration::from_secs_f64(1.0 / tick_rate as f64);
        let shared = Arc::new(DriverShared {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("tickos-tick".to_string())
            .spawn(move || {
                let mut next = Instant::now() + period;
                loop {
                    {
                        let mut stopped = thread_shared.stopped.lock();
                        loop {
                            if *stopped {
                                return;
                            }
                            let now = Instant::now();
                            if now >= next {
                                break;
                            }
                            thread_shared.wake.wait_for(&mut stopped, next - now);
                        }
                    }

                    tick_fn();

                    next += period;
                    let now = Instant::now();
                    if next < now {
                        // Fell behind (debugger, loaded host); don't try to
                        // replay the missed ticks.
                        next = now + period;
                    }
                }
            })
            .expect("failed to spawn tick driver thread");

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Signal the driver to stop and wait for it to exit.
    pub(crate) fn stop(&mut self) {
        *self.shared.stopped.lock() = true;
        self.shared.wake.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TickDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{TransformMode, Transformer};
    use crate::TaskState;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn idle_program() -> Arc<UnitProgram> {
        Transformer::new(TransformMode::DelayOnly)
            .transform(IDLE_BODY)
            .unwrap()
            .factory
            .program()
            .clone()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(crate::unit::LogSink),
            idle_program(),
        )
    }

    fn compile(source: &str) -> TaskUnit {
        Transformer::new(TransformMode::DelayOnly)
            .transform(source)
            .unwrap()
            .factory
            .instantiate(&Value::Null)
    }

    #[test]
    fn test_idle_task_exists_at_construction() {
        let sched = scheduler();
        assert_eq!(sched.table().len(), 1);
        assert_eq!(sched.state_of(sched.idle_handle()), Some(TaskState::Ready));
    }

    #[test]
    fn test_ticks_proceed_with_only_idle() {
        let mut sched = scheduler();
        for _ in 0..10 {
            sched.tick();
        }
        assert_eq!(sched.tick_count(), 10);
        let idle_state = sched.state_of(sched.idle_handle()).unwrap();
        assert!(matches!(idle_state, TaskState::Ready | TaskState::Running));
    }

    #[test]
    fn test_one_shot_body_runs_once_and_is_deleted() {
        let mut sched = scheduler();
        let unit = compile("let x = 1;");
        let handle = sched.create_task("one".into(), 5, unit, 0, Value::Null);

        sched.tick();
        assert!(!sched.table().contains(handle));
    }

    #[test]
    fn test_delay_blocks_for_exact_tick_count() {
        let mut sched = scheduler();
        let unit = compile("(k) => { while (true) { k.delay(3); } }");
        let handle = sched.create_task("delayer".into(), 5, unit, 0, Value::Null);

        sched.tick();
        assert_eq!(sched.state_of(handle), Some(TaskState::Blocked));
        assert_eq!(sched.table().get(handle).unwrap().delay_ticks, 3);

        sched.tick();
        sched.tick();
        assert_eq!(sched.state_of(handle), Some(TaskState::Blocked));

        // Third tick after the block: delay expires and the task runs again,
        // immediately re-blocking.
        sched.tick();
        assert_eq!(sched.state_of(handle), Some(TaskState::Blocked));
        assert_eq!(sched.table().get(handle).unwrap().delay_ticks, 3);
        assert_eq!(sched.table().get(handle).unwrap().run_count, 2);
    }

    #[test]
    fn test_failed_task_is_removed() {
        let mut sched = scheduler();
        let unit = compile(r#"throw "boom";"#);
        let handle = sched.create_task("bomb".into(), 5, unit, 0, Value::Null);

        sched.tick();
        assert!(!sched.table().contains(handle));
        assert_eq!(sched.table().len(), 1, "only the idle task remains");
    }

    #[test]
    fn test_driver_ticks_and_stops() {
        let count = Arc::new(AtomicU64::new(0));
        let tick_count = count.clone();
        let mut driver = TickDriver::start(
            200,
            Arc::new(move || {
                tick_count.fetch_add(1, Ordering::Relaxed);
            }),
        );

        thread::sleep(Duration::from_millis(300));
        driver.stop();
        let observed = count.load(Ordering::Relaxed);
        assert!(observed >= 10, "expected many ticks, got {}", observed);

        // No further ticks after stop.
        let frozen = count.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::Relaxed), frozen);
    }
}
