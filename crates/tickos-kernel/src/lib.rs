//! tickos kernel
//!
//! A cooperative, tick-driven task kernel modeled on a pared-down RTOS:
//! - **Transformer**: rewrites user-authored task bodies (a JavaScript-family
//!   surface language) into restartable units whose `delay(n)` calls are
//!   mechanically lifted to explicit suspension points (`transform` module)
//! - **Units**: suspendable op interpreter preserving all local state
//!   between steps (`unit` module)
//! - **Scheduler**: priority plus round-robin selection driven by a periodic
//!   tick; delays are accounted in ticks (`scheduler`, `table`, `ready`
//!   modules)
//! - **Kernel facade**: start/stop, task lifecycle, delays, introspection
//!   (`kernel` module)
//!
//! # Example
//!
//! ```
//! use tickos_kernel::{Kernel, KernelOptions, SchedulerConfig};
//!
//! let kernel = Kernel::new(
//!     SchedulerConfig {
//!         tick_rate: 10,
//!         ..Default::default()
//!     },
//!     KernelOptions::default(),
//! )
//! .unwrap();
//!
//! let worker = kernel
//!     .create_task(
//!         r#"
//!         (rtos) => {
//!             let i = 0;
//!             while (i < 3) {
//!                 print(i);
//!                 rtos.delay(1);
//!                 i = i + 1;
//!             }
//!         }
//!         "#,
//!         5,
//!     )
//!     .unwrap();
//!
//! // Drive time manually (or call kernel.start() for a periodic tick).
//! for _ in 0..10 {
//!     kernel.tick();
//! }
//! assert!(kernel.task_info(worker).is_none(), "worker ran to completion");
//! ```

#![warn(rust_2018_idioms)]

pub mod kernel;
pub mod ready;
mod scheduler;
pub mod table;
pub mod task;
pub mod transform;
pub mod unit;
pub mod value;

pub use kernel::{
    DelayMarker, Kernel, KernelError, KernelOptions, SchedulerConfig, SystemStatus, TaskOptions,
};
pub use task::{BlockReason, TaskHandle, TaskSnapshot, TaskState};
pub use transform::{Diagnostic, TransformError, TransformMode, Transformer, UnitFactory};
pub use unit::{LogSink, PrintSink, Step, Suspension, TaskUnit, UnitContext, UnitError};
pub use value::Value;
