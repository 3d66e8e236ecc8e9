//! Integration tests for the body transformer and the restartable-unit
//! contract, through the public API.

use parking_lot::Mutex;
use std::sync::Arc;

use tickos_kernel::{
    Diagnostic, Kernel, KernelError, KernelOptions, PrintSink, SchedulerConfig, Step, Suspension,
    TaskHandle, TransformMode, Transformer, UnitContext, Value,
};

#[derive(Default)]
struct CaptureSink {
    lines: Mutex<Vec<String>>,
}

impl CaptureSink {
    fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl PrintSink for CaptureSink {
    fn print(&self, _task: TaskHandle, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

fn drive(source: &str, mode: TransformMode) -> (Vec<Step>, Vec<String>) {
    let sink = CaptureSink::default();
    let params = Value::Null;
    let output = Transformer::new(mode).transform(source).unwrap();
    let mut unit = output.factory.instantiate(&params);

    let mut steps = Vec::new();
    for _ in 0..1000 {
        let ctx = UnitContext {
            tick_count: 0,
            tick_rate: 10,
            handle: TaskHandle::from_u64(1),
            params: &params,
            sink: &sink,
        };
        let step = unit.step(&ctx).unwrap();
        let done = step == Step::Done;
        steps.push(step);
        if done {
            break;
        }
    }
    (steps, sink.lines())
}

// ============================================================================
// Transformer laws
// ============================================================================

#[test]
fn test_delay_free_body_is_a_single_step_unit() {
    // Delay-only mode: the transformer is a no-op on a body with no delay
    // calls; the unit completes on its first step.
    let (steps, lines) = drive(
        "let total = 0; for (let i = 1; i <= 4; i++) { total = total + i; } print(total);",
        TransformMode::DelayOnly,
    );
    assert_eq!(steps, vec![Step::Done]);
    assert_eq!(lines, vec!["10"]);
}

#[test]
fn test_statement_mode_yields_once_per_statement() {
    // k statements, none of them delays: k yields, then done on call k+1.
    let (steps, _) = drive("let a = 1; let b = 2; let c = 3;", TransformMode::StatementLevel);
    assert_eq!(steps.len(), 4);
    assert!(steps[..3]
        .iter()
        .all(|s| matches!(s, Step::Yield(Suspension::Yield(_)))));
    assert_eq!(steps[3], Step::Done);
}

#[test]
fn test_statement_mode_counts_delay_once() {
    // Three plain statements plus one delay: four suspension points.
    let (steps, _) = drive(
        "(k) => { let x = 1; x = x + 1; k.delay(2); x = x + 1; }",
        TransformMode::StatementLevel,
    );
    let yields = steps
        .iter()
        .filter(|s| matches!(s, Step::Yield(_)))
        .count();
    assert_eq!(yields, 4);
    let delays = steps
        .iter()
        .filter(|s| matches!(s, Step::Yield(Suspension::Delay(_))))
        .count();
    assert_eq!(delays, 1);
}

#[test]
fn test_delay_only_mode_yields_exactly_at_delays() {
    let (steps, _) = drive(
        "(k) => { let x = 1; x = x + 1; k.delay(2); x = x + 1; }",
        TransformMode::DelayOnly,
    );
    assert_eq!(
        steps,
        vec![Step::Yield(Suspension::Delay(2)), Step::Done]
    );
}

#[test]
fn test_delay_ms_marker_matches_delay_of_ceiling() {
    // delayMs(ms) == delay(ceil(ms * tick_rate / 1000)) at tick_rate 10.
    let (ms_steps, _) = drive("(k) => { k.delayMs(250); }", TransformMode::DelayOnly);
    let (tick_steps, _) = drive("(k) => { k.delay(3); }", TransformMode::DelayOnly);
    assert_eq!(ms_steps, tick_steps);
}

#[test]
fn test_control_flow_preserved_across_suspensions() {
    let (steps, lines) = drive(
        r#"
        (k) => {
            let log = [];
            for (let i = 0; i < 2; i++) {
                try {
                    if (i == 1) { throw "second"; }
                    log.push("ok");
                } catch (e) {
                    log.push(e);
                }
                k.delay(1);
            }
            print(log);
        }
        "#,
        TransformMode::DelayOnly,
    );
    assert_eq!(
        steps,
        vec![
            Step::Yield(Suspension::Delay(1)),
            Step::Yield(Suspension::Delay(1)),
            Step::Done,
        ]
    );
    assert_eq!(lines, vec!["[ok, second]"]);
}

// ============================================================================
// Diagnostics and failure modes
// ============================================================================

#[test]
fn test_bare_delay_diagnostic_without_rewrite() {
    let output = Transformer::new(TransformMode::DelayOnly)
        .transform("delay(5); print(1);")
        .unwrap();
    assert!(matches!(
        output.diagnostics.as_slice(),
        [Diagnostic::BareDelay { .. }]
    ));
    assert!(!output.factory.program().has_suspension_points());
}

#[test]
fn test_unparseable_body_fails_task_creation() {
    let kernel = Kernel::new(SchedulerConfig::default(), KernelOptions::default()).unwrap();
    let err = kernel.create_task("(k) => { k.delay(1); ] }", 5).unwrap_err();
    assert!(matches!(err, KernelError::Transform(_)));
    // Construction failed: no task was registered.
    assert_eq!(kernel.system_status().total_tasks, 1);
}

#[test]
fn test_rewrite_rejection_surfaces_from_create() {
    let kernel = Kernel::new(SchedulerConfig::default(), KernelOptions::default()).unwrap();
    // Unknown kernel method: lowering rejects the body.
    let err = kernel
        .create_task("(k) => { k.format(); }", 5)
        .unwrap_err();
    assert!(matches!(err, KernelError::Transform(_)));
}

#[test]
fn test_mode_change_affects_only_future_creations() {
    let sink = Arc::new(CaptureSink::default());
    let kernel = Kernel::new(
        SchedulerConfig {
            tick_rate: 10,
            ..Default::default()
        },
        KernelOptions {
            yield_all_statements: false,
            print_sink: Some(sink.clone()),
        },
    )
    .unwrap();

    // Created in delay-only mode: completes on its first advance.
    let before = kernel.create_task("print(1); print(2);", 5).unwrap();
    kernel.set_yield_mode(true);
    // Created in statement mode: one print per advance.
    let after = kernel.create_task("print(3); print(4);", 5).unwrap();

    // One task advances per tick: the delay-only task runs to completion in
    // its single step, then the statement-mode task takes a step per tick.
    kernel.tick();
    assert!(kernel.task_info(before).is_none(), "delay-only task finished");
    assert!(kernel.task_info(after).is_some(), "statement task still going");
    assert_eq!(sink.lines(), vec!["1", "2"]);

    kernel.tick();
    assert_eq!(sink.lines(), vec!["1", "2", "3"]);
}
