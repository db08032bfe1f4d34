//! Demonstrates the built-in log aggregator work unit (SPEC_FULL.md §12.1)
//! draining `tracing` events once per frame via a `ChannelLayer`.

use frame_scheduler::builtin::{log_aggregator_body, ChannelLayer, WriterSink};
use frame_scheduler::work_unit::{WorkUnitKind, WorkUnitOutcome};
use frame_scheduler::{FrameScheduler, SchedulerConfig};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    let (layer, receiver) = ChannelLayer::new();
    tracing_subscriber::registry().with(layer).init();

    let scheduler = FrameScheduler::new(
        SchedulerConfig::new()
            .with_thread_count(2)
            .with_frame_length_us(5_000),
    );

    let worker = scheduler
        .add_work_unit(
            "noisy_worker",
            WorkUnitKind::Normal,
            vec![],
            Box::new(|| {
                tracing::info!(frame = "demo", "noisy worker did some work");
                WorkUnitOutcome::Completed
            }),
        )
        .unwrap();

    scheduler
        .add_work_unit(
            "log_aggregator",
            WorkUnitKind::Normal,
            vec![worker],
            log_aggregator_body(receiver, WriterSink(std::io::stdout())),
        )
        .unwrap();

    scheduler.update_dependency_cache();
    for _ in 0..5 {
        let report = scheduler.do_one_frame().unwrap();
        println!(
            "frame {} took {}us (carry {}us)",
            report.frame_index, report.elapsed_us, report.carry_us
        );
    }
}
