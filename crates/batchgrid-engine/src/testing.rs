//! Test doubles for the process and queue seams.
//!
//! [`ScriptedRunner`] records every command and answers from canned output so
//! the scheduler adapters can be exercised without a cluster. Unscripted
//! programs succeed with empty output.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use crate::command::{CommandLine, CommandOutput, CommandRunner};
use crate::error::EngineResult;
use crate::queue::JobIdResolver;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct ScriptedRunner {
    calls: Mutex<Vec<CommandLine>>,
    once: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    always: Mutex<HashMap<String, CommandOutput>>,
    counters: Mutex<HashMap<String, u64>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot answer for the next call to `program`.
    pub fn respond(&self, program: &str, output: CommandOutput) {
        lock(&self.once)
            .entry(program.to_string())
            .or_default()
            .push_back(output);
    }

    /// Answer every call to `program` with `output` once one-shot answers run out.
    pub fn respond_always(&self, program: &str, output: CommandOutput) {
        lock(&self.always).insert(program.to_string(), output);
    }

    /// Answer every call to `program` with an increasing job id, starting at `first`.
    pub fn respond_with_ids(&self, program: &str, first: u64) {
        lock(&self.counters).insert(program.to_string(), first);
    }

    pub fn calls(&self) -> Vec<CommandLine> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandLine> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.program == program)
            .cloned()
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, command: &CommandLine) -> EngineResult<CommandOutput> {
        lock(&self.calls).push(command.clone());

        if let Some(output) = lock(&self.once)
            .get_mut(&command.program)
            .and_then(VecDeque::pop_front)
        {
            return Ok(output);
        }
        if let Some(next) = lock(&self.counters).get_mut(&command.program) {
            let id = *next;
            *next += 1;
            return Ok(CommandOutput::ok(format!("{id}\n")));
        }
        Ok(lock(&self.always)
            .get(&command.program)
            .cloned()
            .unwrap_or_default())
    }
}

/// A queue held in memory: name → ids.
#[derive(Default)]
pub struct InMemoryQueue {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: &str, id: &str) {
        lock(&self.entries)
            .entry(name.to_string())
            .or_default()
            .push(id.to_string());
    }

    /// Drop `name` from the queue, as if all its tasks completed.
    pub fn remove(&self, name: &str) {
        lock(&self.entries).remove(name);
    }
}

impl JobIdResolver for InMemoryQueue {
    fn resolve(&self, name: &str) -> EngineResult<Vec<String>> {
        Ok(lock(&self.entries).get(name).cloned().unwrap_or_default())
    }
}
