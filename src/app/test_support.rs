//! Test doubles shared by the gate, link, workflow and command tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::app::adb::runner::{CommandRunner, ShellCommand};
use crate::app::error::AppError;
use crate::app::models::CommandResult;
use crate::app::output::OutputSink;

pub fn ok(stdout: &str) -> CommandResult {
    CommandResult {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

pub fn failed(stderr: &str) -> CommandResult {
    CommandResult {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: Some(1),
    }
}

type SideEffect = Box<dyn Fn(&ShellCommand) + Send>;

struct Rule {
    prefix: String,
    responses: VecDeque<CommandResult>,
    side_effect: Option<SideEffect>,
}

/// Replays canned results keyed by command-line prefix and records every invocation.
///
/// A rule with several queued responses hands them out in order and then keeps
/// repeating the last one. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    pub calls: Vec<ShellCommand>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, prefix: &str, result: CommandResult) -> Self {
        self.push_rule(prefix, vec![result], None);
        self
    }

    pub fn on_seq(mut self, prefix: &str, results: Vec<CommandResult>) -> Self {
        self.push_rule(prefix, results, None);
        self
    }

    /// Like `on`, but also runs `effect` (e.g. creating the pulled file on disk).
    pub fn on_with(
        mut self,
        prefix: &str,
        result: CommandResult,
        effect: impl Fn(&ShellCommand) + Send + 'static,
    ) -> Self {
        self.push_rule(prefix, vec![result], Some(Box::new(effect)));
        self
    }

    fn push_rule(&mut self, prefix: &str, results: Vec<CommandResult>, effect: Option<SideEffect>) {
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            responses: results.into(),
            side_effect: effect,
        });
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls.iter().map(|call| call.line.clone()).collect()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.calls
            .iter()
            .filter(|call| call.line.starts_with(prefix))
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&mut self, command: &ShellCommand) -> Result<CommandResult, AppError> {
        self.calls.push(command.clone());
        // Longest prefix wins so specific rules can shadow broad ones.
        let rule = self
            .rules
            .iter_mut()
            .filter(|rule| command.line.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len());
        let Some(rule) = rule else {
            return Ok(ok(""));
        };
        if let Some(effect) = rule.side_effect.as_ref() {
            effect(command);
        }
        let result = if rule.responses.len() > 1 {
            rule.responses.pop_front().unwrap_or_default()
        } else {
            rule.responses.front().cloned().unwrap_or_default()
        };
        Ok(result)
    }
}

pub fn collecting_sink() -> (OutputSink, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&lines);
    let sink: OutputSink = Arc::new(move |line: &str| {
        if let Ok(mut guard) = captured.lock() {
            guard.push(line.to_string());
        }
    });
    (sink, lines)
}
