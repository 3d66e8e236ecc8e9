//! The kernel facade: the public surface embedders and task authors use.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::scheduler::{Scheduler, TickDriver, IDLE_BODY};
use crate::task::{TaskHandle, TaskSnapshot};
use crate::transform::{TransformError, TransformMode, Transformer};
use crate::unit::{LogSink, PrintSink};
use crate::value::Value;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Cap on simultaneously live tasks, the idle task included.
    pub max_tasks: usize,

    /// Ticks per second of the scheduler. Must be > 0.
    pub tick_rate: u32,

    /// Default stack-size hint for tasks created without one.
    pub stack_size: usize,

    /// Stack-size hint for the idle task.
    pub idle_task_stack_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 32,
            tick_rate: 100,
            stack_size: 2048,
            idle_task_stack_size: 512,
        }
    }
}

/// Kernel construction options.
#[derive(Clone, Default)]
pub struct KernelOptions {
    /// Run the transformer in statement-level mode: every top-level
    /// statement of a body is a suspension point.
    pub yield_all_statements: bool,

    /// Destination for `print(…)` output; defaults to the `log` facade.
    pub print_sink: Option<Arc<dyn PrintSink>>,
}

impl fmt::Debug for KernelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelOptions")
            .field("yield_all_statements", &self.yield_all_statements)
            .field("print_sink", &self.print_sink.as_ref().map(|_| "<sink>"))
            .finish()
    }
}

/// Per-task creation options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Human-readable name; defaults to `Task_<n>`.
    pub name: Option<String>,

    /// Stack-size hint; defaults to the config's `stack_size`.
    pub stack_hint: Option<usize>,

    /// Opaque value the body can read via its second parameter or
    /// `getParams()`.
    pub params: Value,
}

/// A delay marker: the value yielded from a suspension point to request a
/// tick-count-based block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DelayMarker {
    pub delay_ticks: u32,
}

/// Snapshot of the kernel's overall state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub is_running: bool,
    pub tick_count: u64,
    pub current_task: Option<TaskHandle>,
    pub ready_tasks: usize,
    pub blocked_tasks: usize,
    pub suspended_tasks: usize,
    pub total_tasks: usize,
}

/// Kernel construction and task-creation failures.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// `tick_rate` must be positive.
    #[error("invalid tick rate: must be > 0")]
    InvalidTickRate,

    /// The configured task cap is reached.
    #[error("task limit reached ({limit} tasks)")]
    TooManyTasks { limit: usize },

    /// The body could not be transformed into a restartable unit.
    #[error(transparent)]
    Transform(#[from] TransformError),
}

struct KernelInner {
    sched: Mutex<Scheduler>,
    driver: Mutex<Option<TickDriver>>,
    yield_statements: AtomicBool,
    config: SchedulerConfig,
}

/// A cooperative tick-driven task kernel.
///
/// Construct one with a [`SchedulerConfig`] and [`KernelOptions`], register
/// task bodies as source text, then `start()` the periodic tick (or drive
/// time manually with `tick()`).
pub struct Kernel {
    inner: Arc<KernelInner>,
}

impl Kernel {
    /// Create a kernel. Fails on a zero tick rate and propagates any failure
    /// to compile the idle task.
    pub fn new(config: SchedulerConfig, options: KernelOptions) -> Result<Self, KernelError> {
        if config.tick_rate == 0 {
            return Err(KernelError::InvalidTickRate);
        }

        let sink: Arc<dyn PrintSink> = options.print_sink.unwrap_or_else(|| Arc::new(LogSink));

        let idle_program = Transformer::new(TransformMode::DelayOnly)
            .transform(IDLE_BODY)?
            .factory
            .program()
            .clone();

        let inner = Arc::new(KernelInner {
            sched: Mutex::new(Scheduler::new(config, sink, idle_program)),
            driver: Mutex::new(None),
            yield_statements: AtomicBool::new(options.yield_all_statements),
            config,
        });

        Ok(Self { inner })
    }

    /// Create a kernel with default configuration.
    pub fn with_defaults() -> Result<Self, KernelError> {
        Self::new(SchedulerConfig::default(), KernelOptions::default())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the periodic tick driver. A no-op when already running.
    pub fn start(&self) {
        let mut driver = self.inner.driver.lock();
        if driver.is_some() {
            return;
        }
        let tick_inner = self.inner.clone();
        *driver = Some(TickDriver::start(
            self.inner.config.tick_rate,
            Arc::new(move || {
                tick_inner.sched.lock().tick();
            }),
        ));
    }

    /// Stop the periodic tick driver. A no-op when already stopped.
    pub fn stop(&self) {
        if let Some(mut driver) = self.inner.driver.lock().take() {
            driver.stop();
        }
    }

    /// Whether the periodic tick driver is running.
    pub fn is_running(&self) -> bool {
        self.inner.driver.lock().is_some()
    }

    /// Run one scheduler tick manually. Usable whether or not the periodic
    /// driver is running; returns the new tick count.
    pub fn tick(&self) -> u64 {
        let mut sched = self.inner.sched.lock();
        sched.tick();
        sched.tick_count()
    }

    // ========================================================================
    // Task management
    // ========================================================================

    /// Create a task from body source text.
    pub fn create_task(&self, body: &str, priority: i32) -> Result<TaskHandle, KernelError> {
        self.create_task_with(body, priority, TaskOptions::default())
    }

    /// Create a task with explicit options.
    pub fn create_task_with(
        &self,
        body: &str,
        priority: i32,
        options: TaskOptions,
    ) -> Result<TaskHandle, KernelError> {
        let mode = if self.inner.yield_statements.load(Ordering::Acquire) {
            TransformMode::StatementLevel
        } else {
            TransformMode::DelayOnly
        };

        let output = Transformer::new(mode).transform(body)?;
        for diagnostic in &output.diagnostics {
            log::warn!("task body: {}", diagnostic);
        }

        let mut sched = self.inner.sched.lock();
        if sched.table().len() >= self.inner.config.max_tasks {
            return Err(KernelError::TooManyTasks {
                limit: self.inner.config.max_tasks,
            });
        }

        let name = options
            .name
            .unwrap_or_else(|| sched.next_task_name());
        let stack_hint = options.stack_hint.unwrap_or(self.inner.config.stack_size);
        let unit = output.factory.instantiate(&options.params);

        Ok(sched.create_task(name, priority, unit, stack_hint, options.params))
    }

    /// Delete a task, cancelling it and discarding its restartable unit.
    ///
    /// Returns true iff the task existed. The idle task refuses deletion.
    pub fn delete_task(&self, handle: TaskHandle) -> bool {
        let mut sched = self.inner.sched.lock();
        if !sched.is_user_task(handle) {
            return false;
        }
        sched.table_mut().remove(handle)
    }

    /// Suspend a task. Returns false for unknown handles, the idle task, or
    /// an already-suspended task.
    pub fn suspend_task(&self, handle: TaskHandle) -> bool {
        let mut sched = self.inner.sched.lock();
        if !sched.is_user_task(handle) {
            return false;
        }
        sched.table_mut().suspend(handle)
    }

    /// Resume a suspended task to ready. Returns false otherwise.
    pub fn resume_task(&self, handle: TaskHandle) -> bool {
        let mut sched = self.inner.sched.lock();
        if !sched.is_user_task(handle) {
            return false;
        }
        sched.table_mut().resume(handle)
    }

    /// Change a task's priority. A ready task is re-inserted in queue order;
    /// the idle task refuses (it must stay at the lowest priority).
    pub fn set_task_priority(&self, handle: TaskHandle, priority: i32) -> bool {
        let mut sched = self.inner.sched.lock();
        if !sched.is_user_task(handle) {
            return false;
        }
        sched.table_mut().set_priority(handle, priority)
    }

    // ========================================================================
    // Delay and yield
    // ========================================================================

    /// Build a delay marker for `ticks` ticks, clamped to >= 0.
    ///
    /// Outside a task context (no task running) this is a zero marker, a
    /// no-op yield, never an error.
    pub fn delay(&self, ticks: i64) -> DelayMarker {
        let sched = self.inner.sched.lock();
        if sched.table().running().is_none() {
            return DelayMarker { delay_ticks: 0 };
        }
        DelayMarker {
            delay_ticks: ticks.max(0).min(u32::MAX as i64) as u32,
        }
    }

    /// Build a delay marker from milliseconds: `ceil(ms × tick_rate / 1000)`.
    pub fn delay_ms(&self, ms: u64) -> DelayMarker {
        let sched = self.inner.sched.lock();
        if sched.table().running().is_none() {
            return DelayMarker { delay_ticks: 0 };
        }
        let ticks = (ms * self.inner.config.tick_rate as u64).div_ceil(1000);
        DelayMarker {
            delay_ticks: ticks.min(u32::MAX as u64) as u32,
        }
    }

    /// Rotate the running task to the tail of its priority band.
    ///
    /// Returns false when no task is running.
    pub fn yield_now(&self) -> bool {
        self.inner.sched.lock().table_mut().yield_current()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Current tick count.
    pub fn tick_count(&self) -> u64 {
        self.inner.sched.lock().tick_count()
    }

    /// Snapshot of the kernel's overall state.
    pub fn system_status(&self) -> SystemStatus {
        // Driver lock before scheduler lock: stop() joins the tick thread
        // while holding the driver lock, and the tick thread takes the
        // scheduler lock.
        let is_running = self.is_running();
        let sched = self.inner.sched.lock();
        let (ready_tasks, blocked_tasks, suspended_tasks, total_tasks) = sched.counts();
        SystemStatus {
            is_running,
            tick_count: sched.tick_count(),
            current_task: sched.table().running(),
            ready_tasks,
            blocked_tasks,
            suspended_tasks,
            total_tasks,
        }
    }

    /// Snapshot of one task, or None for an unknown handle.
    pub fn task_info(&self, handle: TaskHandle) -> Option<TaskSnapshot> {
        self.inner
            .sched
            .lock()
            .table()
            .get(handle)
            .map(|tcb| tcb.snapshot())
    }

    /// Snapshots of every live task, the idle task included, in handle order.
    pub fn all_tasks(&self) -> Vec<TaskSnapshot> {
        let sched = self.inner.sched.lock();
        sched
            .table()
            .handles()
            .into_iter()
            .filter_map(|handle| sched.table().get(handle))
            .map(|tcb| tcb.snapshot())
            .collect()
    }

    /// Handle of the idle task.
    pub fn idle_task(&self) -> TaskHandle {
        self.inner.sched.lock().idle_handle()
    }

    // ========================================================================
    // Transformer mode
    // ========================================================================

    /// Switch between statement-level (true) and delay-only (false)
    /// transformation. Affects only future task creations.
    pub fn set_yield_mode(&self, yield_all_statements: bool) {
        self.inner
            .yield_statements
            .store(yield_all_statements, Ordering::Release);
    }

    /// Current transformer mode flag.
    pub fn yield_mode(&self) -> bool {
        self.inner.yield_statements.load(Ordering::Acquire)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.system_status();
        f.debug_struct("Kernel")
            .field("is_running", &status.is_running)
            .field("tick_count", &status.tick_count)
            .field("total_tasks", &status.total_tasks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskState;

    fn kernel() -> Kernel {
        Kernel::new(
            SchedulerConfig {
                tick_rate: 10,
                ..Default::default()
            },
            KernelOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_tick_rate_rejected() {
        let err = Kernel::new(
            SchedulerConfig {
                tick_rate: 0,
                ..Default::default()
            },
            KernelOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::InvalidTickRate));
    }

    #[test]
    fn test_create_task_returns_nonzero_handle() {
        let kernel = kernel();
        let handle = kernel.create_task("let x = 1;", 5).unwrap();
        assert!(handle.as_u64() > 0);
        assert_eq!(
            kernel.task_info(handle).unwrap().state,
            TaskState::Ready
        );
    }

    #[test]
    fn test_default_names_use_counter() {
        let kernel = kernel();
        let a = kernel.create_task("let x = 1;", 1).unwrap();
        let b = kernel.create_task("let x = 1;", 1).unwrap();
        assert_eq!(kernel.task_info(a).unwrap().name, "Task_1");
        assert_eq!(kernel.task_info(b).unwrap().name, "Task_2");
    }

    #[test]
    fn test_max_tasks_enforced() {
        let kernel = Kernel::new(
            SchedulerConfig {
                max_tasks: 2,
                ..Default::default()
            },
            KernelOptions::default(),
        )
        .unwrap();

        // The idle task occupies one slot.
        kernel.create_task("let x = 1;", 1).unwrap();
        let err = kernel.create_task("let x = 1;", 1).unwrap_err();
        assert!(matches!(err, KernelError::TooManyTasks { limit: 2 }));
    }

    #[test]
    fn test_transform_error_surfaces_from_create() {
        let kernel = kernel();
        let err = kernel.create_task("let = ;", 1).unwrap_err();
        assert!(matches!(err, KernelError::Transform(_)));
    }

    #[test]
    fn test_idle_task_refuses_lifecycle_operations() {
        let kernel = kernel();
        let idle = kernel.idle_task();
        assert!(!kernel.delete_task(idle));
        assert!(!kernel.suspend_task(idle));
        assert!(!kernel.set_task_priority(idle, 5));
    }

    #[test]
    fn test_unknown_handle_operations_return_false() {
        let kernel = kernel();
        let ghost = TaskHandle::from_u64(999);
        assert!(!kernel.delete_task(ghost));
        assert!(!kernel.suspend_task(ghost));
        assert!(!kernel.resume_task(ghost));
        assert!(!kernel.set_task_priority(ghost, 1));
        assert!(kernel.task_info(ghost).is_none());
    }

    #[test]
    fn test_delay_outside_task_context_is_zero() {
        let kernel = kernel();
        assert_eq!(kernel.delay(5), DelayMarker { delay_ticks: 0 });
        assert_eq!(kernel.delay_ms(500), DelayMarker { delay_ticks: 0 });
    }

    #[test]
    fn test_yield_mode_controls() {
        let kernel = kernel();
        assert!(!kernel.yield_mode());
        kernel.set_yield_mode(true);
        assert!(kernel.yield_mode());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let kernel = kernel();
        assert!(!kernel.is_running());
        kernel.start();
        assert!(kernel.is_running());
        kernel.start();
        assert!(kernel.is_running());
        kernel.stop();
        assert!(!kernel.is_running());
        kernel.stop();
        assert!(!kernel.is_running());
    }

    #[test]
    fn test_system_status_shape() {
        let kernel = kernel();
        kernel.create_task("(k) => { k.delay(100); }", 5).unwrap();
        let status = kernel.system_status();
        assert!(!status.is_running);
        assert_eq!(status.tick_count, 0);
        assert_eq!(status.total_tasks, 2);
        assert_eq!(status.ready_tasks, 2);

        kernel.tick();
        let status = kernel.system_status();
        assert_eq!(status.blocked_tasks, 1);
    }
}
