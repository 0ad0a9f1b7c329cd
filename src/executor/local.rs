//! Runs actions as local child processes across a bounded pool of worker
//! threads.

use super::{split_command_arguments, ExecutionResult, ExecutionSet, Executor};
use crate::error::Result;
use std::{
    collections::BinaryHeap,
    cmp::Reverse,
    io::Write,
    process::{Command, Stdio},
    sync::{Condvar, Mutex},
};
use yansi::Paint;

/// Local parallel executor with a configurable maximum concurrent action
/// count.
pub struct LocalExecutor {
    max_parallel: usize,
}

impl LocalExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self { max_parallel: max_parallel.max(1) }
    }
}

struct Scheduler {
    /// Remaining unfinished prerequisites per set position.
    remaining: Vec<usize>,
    /// Positions ready to run, lowest position (highest priority) first.
    ready: BinaryHeap<Reverse<usize>>,
    /// Positions of dependents, per set position.
    dependents: Vec<Vec<usize>>,
    running: usize,
    started: usize,
    finished: usize,
    failed: usize,
    /// Actions popped but never launched because the run was stopping.
    drained: usize,
    /// Once set, no further actions are launched; in-flight ones drain.
    stop: bool,
}

impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "Local"
    }

    fn execute(&self, set: &ExecutionSet) -> Result<ExecutionResult> {
        let total = set.len();
        if total == 0 {
            return Ok(ExecutionResult::default());
        }

        let mut dependents = vec![Vec::new(); total];
        let mut remaining = vec![0usize; total];
        for (pos, item) in set.items().iter().enumerate() {
            remaining[pos] = item.prerequisites.len();
            for &p in &item.prerequisites {
                dependents[p].push(pos);
            }
        }
        let ready: BinaryHeap<Reverse<usize>> = remaining
            .iter()
            .enumerate()
            .filter(|(_, &r)| r == 0)
            .map(|(pos, _)| Reverse(pos))
            .collect();

        let scheduler = Mutex::new(Scheduler {
            remaining,
            ready,
            dependents,
            running: 0,
            started: 0,
            finished: 0,
            failed: 0,
            drained: 0,
            stop: false,
        });
        let wakeup = Condvar::new();
        let print_lock = Mutex::new(());

        let workers = self.max_parallel.min(total);
        debug!("executing {total} action(s) with up to {workers} worker(s)");

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let pos = {
                        let mut state = scheduler.lock().unwrap();
                        loop {
                            if let Some(Reverse(pos)) = state.ready.pop() {
                                if state.stop {
                                    // drain without launching
                                    state.finished += 1;
                                    state.drained += 1;
                                    continue;
                                }
                                state.running += 1;
                                state.started += 1;
                                break Some((pos, state.started));
                            }
                            if state.finished + state.running == total
                                || (state.stop && state.running == 0)
                            {
                                break None;
                            }
                            state = wakeup.wait(state).unwrap();
                        }
                    };
                    let Some((pos, sequence)) = pos else {
                        wakeup.notify_all();
                        return;
                    };

                    let item = &set.items()[pos];
                    let success = run_action(item, sequence, total, &print_lock);

                    let mut state = scheduler.lock().unwrap();
                    state.running -= 1;
                    state.finished += 1;
                    if success {
                        let ready_now: Vec<usize> = state.dependents[pos]
                            .clone()
                            .into_iter()
                            .filter(|&d| {
                                state.remaining[d] -= 1;
                                state.remaining[d] == 0
                            })
                            .collect();
                        for d in ready_now {
                            state.ready.push(Reverse(d));
                        }
                    } else {
                        state.failed += 1;
                        state.stop = true;
                    }
                    drop(state);
                    wakeup.notify_all();
                });
            }
        });

        let state = scheduler.into_inner().unwrap();
        let result = ExecutionResult {
            total,
            completed: state.finished - state.failed - state.drained,
            failed: state.failed,
        };
        if state.failed > 0 {
            error!("{} of {} action(s) failed", state.failed, total);
        } else if !result.success() {
            // a failure upstream starved the rest of the graph
            error!("{} action(s) were never started", total - result.completed);
        }
        Ok(result)
    }
}

/// Spawns the child process for one action with fully buffered output, then
/// flushes status and output under the print lock so interleaved actions
/// stay readable.
fn run_action(
    item: &super::ExecutionItem,
    sequence: usize,
    total: usize,
    print_lock: &Mutex<()>,
) -> bool {
    let action = &item.action;
    let output = Command::new(&action.command_path)
        .args(split_command_arguments(&action.command_arguments))
        .current_dir(&action.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    let _guard = print_lock.lock().unwrap();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match output {
        Ok(output) => {
            let status = format!("[{sequence}/{total}] {}", action.status_description);
            if output.status.success() {
                let _ = writeln!(out, "{status}");
            } else {
                let _ = writeln!(out, "{}", Paint::red(&status));
            }
            if !output.stdout.is_empty() {
                let _ = out.write_all(&output.stdout);
            }
            if !output.stderr.is_empty() {
                let _ = out.write_all(&output.stderr);
            }
            if !output.status.success() {
                let _ = writeln!(
                    out,
                    "{}",
                    Paint::red(&format!(
                        "{} exited with {}: {} {}",
                        action.status_description,
                        output.status,
                        action.command_path.display(),
                        action.command_arguments
                    ))
                );
                return false;
            }
            true
        }
        Err(err) => {
            let _ = writeln!(
                out,
                "{}",
                Paint::red(&format!(
                    "failed to launch \"{}\": {err}",
                    action.command_path.display()
                ))
            );
            false
        }
    }
}
