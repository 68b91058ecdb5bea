// tests/property/graph_walk.rs

use proptest::prelude::*;

use formicary::dag::{JobDefinition, NextTask};
use formicary::types::RequestState;

use crate::common::{JobDefinitionBuilder, TaskDefinitionBuilder};

/// A chain `task_0 -> ... -> task_{n-1}` where every task may also jump
/// forward on exit code `7`. Forward-only edges keep the graph acyclic with
/// a single sink.
fn forward_jump_job() -> impl Strategy<Value = JobDefinition> {
    (2..12usize).prop_flat_map(|n| {
        proptest::collection::vec(proptest::option::of(any::<usize>()), n - 1).prop_map(
            move |jumps| {
                let mut builder = JobDefinitionBuilder::new("forward");
                for (i, jump) in jumps.into_iter().enumerate() {
                    let mut task = TaskDefinitionBuilder::shell(&format!("task_{i}"))
                        .on_completed(&format!("task_{}", i + 1));
                    if let Some(raw) = jump {
                        let span = n - (i + 1);
                        let target = i + 1 + raw % span;
                        task = task.on_exit("7", &format!("task_{target}"));
                    }
                    builder = builder.task(task.build());
                }
                builder
                    .task(TaskDefinitionBuilder::shell(&format!("task_{}", n - 1)).build())
                    .build()
            },
        )
    })
}

fn index_of(task_type: &str) -> usize {
    task_type
        .trim_start_matches("task_")
        .parse()
        .unwrap_or(usize::MAX)
}

proptest! {
    #[test]
    fn forward_jobs_validate_and_walk_to_the_sink(
        job in forward_jump_job(),
        exits in proptest::collection::vec(prop_oneof![Just("0"), Just("7")], 12),
    ) {
        prop_assert!(job.validate().is_ok());
        let last = job.get_last_task().map(|t| t.task_type.clone());
        prop_assert_eq!(last.as_deref(), Some(job.tasks()[job.tasks().len() - 1].task_type.as_str()));

        let mut current = job.get_first_task().unwrap();
        prop_assert_eq!(current.task_type.as_str(), "task_0");
        let mut steps = 0;
        loop {
            let exit = exits[steps % exits.len()];
            match job.next_task(current, RequestState::Completed, Some(exit)).unwrap() {
                NextTask::Task(next) => {
                    prop_assert!(index_of(&next.task_type) > index_of(&current.task_type));
                    current = next;
                }
                NextTask::None => break,
                NextTask::Fatal => prop_assert!(false, "no task maps to FATAL"),
            }
            steps += 1;
            prop_assert!(steps < job.tasks().len());
        }
        prop_assert_eq!(Some(current.task_type.clone()), last);
    }
}
