//! Command automatons driven by the output of a connection.
//!
//! A [`CommandAutomaton`] issues one command line on an
//! [`ObservableConnection`], subscribes to the received data and feeds every
//! line (and every unterminated prompt fragment) through the ordered rules of
//! a [`LineClassifier`]. The first rule that consumes a line wins. Rules may
//! answer prompts, append result lines or record a terminal outcome.
//!
//! Outcomes are write-once: after success or failure is recorded the
//! automaton ignores further input.
//!
//! # Main Components
//!
//! - [`CommandAutomaton`] - Subscription, line pipeline, completion and timeouts
//! - [`LineClassifier`] / [`Rule`] - Per-command ordered classification tables
//! - [`Sftp`], [`Gunzip`], [`Hexdump`] - Concrete classifiers
//! - [`LineSplitter`] - Chunk-to-line reassembly

use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::connection::{ObservableConnection, ObserverKey, SessionEvent};
use crate::error::{CommandFailure, ConnectError, FailureKind};

pub use gunzip::Gunzip;
pub use hexdump::Hexdump;
pub use lines::{Fragment, IGNORE_START_LINE, LineSplitter};
pub use sftp::Sftp;

mod gunzip;
mod hexdump;
mod lines;
mod sftp;

/// Shell prompt that completes a command whose tool returned to the shell.
///
/// Accepts `user@host:path$`, `[user@host path]$` and a bare `$` or `#`.
/// A `%` needs the user/host part, so progress output such as `100%` never
/// ends a command.
pub static DEFAULT_SHELL_PROMPT: Lazy<Regex> = Lazy::new(|| {
    compile(r"^(?:(?:[\w.-]+@[\w.-]+:[^\s$#%]*|\[[\w.-]+@[\w.-]+[^\]]*\])[$#%]|[$#])\s*$")
});

pub(crate) fn compile(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid built-in regex {pattern:?}: {err}"),
    }
}

pub(crate) fn compile_set(patterns: &[&str]) -> RegexSet {
    match RegexSet::new(patterns) {
        Ok(set) => set,
        Err(err) => panic!("invalid built-in regex set {patterns:?}: {err}"),
    }
}

/// Verdict of one rule on one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parse {
    /// The line was handled; later rules do not see it.
    Consumed,
    /// The rule does not apply; try the next one.
    Pass,
}

/// A named classification step.
pub struct Rule<S> {
    pub name: &'static str,
    /// Whether the rule also runs on unterminated fragments.
    pub on_partial: bool,
    pub apply: fn(&mut S, &str, &mut LineContext<'_>) -> Parse,
}

/// Command-specific part of an automaton.
pub trait LineClassifier: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// The command line to issue.
    fn command_string(&self) -> String;

    /// Rules in priority order.
    fn rules() -> &'static [Rule<Self>]
    where
        Self: Sized;

    /// Called once, right before the command is sent.
    fn on_start(&mut self) {}
}

/// Per-command tuning.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Prompt of the shell the command returns to; `None` disables
    /// completion on prompt.
    pub shell_prompt: Option<Regex>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            shell_prompt: Some(DEFAULT_SHELL_PROMPT.clone()),
        }
    }
}

impl CommandOptions {
    pub fn with_shell_prompt(mut self, pattern: &str) -> Result<Self, ConnectError> {
        let prompt = Regex::new(pattern)
            .map_err(|e| ConnectError::WrongUsage(format!("invalid shell prompt regex: {e}")))?;
        self.shell_prompt = Some(prompt);
        Ok(self)
    }

    pub fn without_shell_prompt(mut self) -> Self {
        self.shell_prompt = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Success,
    Failure(CommandFailure),
    TimedOut(Duration),
}

/// What a rule can do while handling a line.
pub struct LineContext<'a> {
    connection: &'a ObservableConnection,
    command: &'a str,
    is_full_line: bool,
    result: &'a mut Vec<String>,
    outcome: &'a mut Option<Outcome>,
}

impl LineContext<'_> {
    pub fn is_full_line(&self) -> bool {
        self.is_full_line
    }

    /// Sends a reply line. A failed send records a usage failure.
    pub fn sendline(&mut self, data: &str) {
        if let Err(err) = self.connection.sendline(data) {
            self.fail(FailureKind::Usage, err.to_string());
        }
    }

    /// Sends a secret reply line; it is never logged in clear.
    pub fn sendline_secret(&mut self, secret: &str) {
        if let Err(err) = self.connection.sendline_secret(secret) {
            self.fail(FailureKind::Usage, err.to_string());
        }
    }

    pub fn append(&mut self, line: &str) {
        self.result.push(line.to_string());
    }

    /// Records a failure unless an outcome was already recorded.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        if self.outcome.is_none() {
            let failure = CommandFailure {
                kind,
                command: self.command.to_string(),
                message: message.into(),
            };
            debug!("'{}' failed: {}", self.command, failure.message);
            *self.outcome = Some(Outcome::Failure(failure));
        }
    }

    /// Records success unless an outcome was already recorded.
    pub fn succeed(&mut self) {
        if self.outcome.is_none() {
            *self.outcome = Some(Outcome::Success);
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }
}

struct AutomatonState<C> {
    classifier: C,
    splitter: LineSplitter,
    result: Vec<String>,
    outcome: Option<Outcome>,
    started: bool,
    output_started: bool,
    echo_seen: bool,
    partial_consumed: bool,
    subscription: Option<ObserverKey>,
}

/// One running command on one connection.
pub struct CommandAutomaton<C: LineClassifier> {
    connection: Arc<ObservableConnection>,
    command_string: String,
    options: CommandOptions,
    state: Mutex<AutomatonState<C>>,
    done: watch::Sender<bool>,
}

impl<C: LineClassifier> CommandAutomaton<C> {
    pub fn new(connection: Arc<ObservableConnection>, classifier: C) -> Arc<Self> {
        Self::with_options(connection, classifier, CommandOptions::default())
    }

    pub fn with_options(
        connection: Arc<ObservableConnection>,
        classifier: C,
        options: CommandOptions,
    ) -> Arc<Self> {
        let command_string = classifier.command_string();
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            connection,
            command_string,
            options,
            state: Mutex::new(AutomatonState {
                classifier,
                splitter: LineSplitter::new(),
                result: Vec::new(),
                outcome: None,
                started: false,
                output_started: false,
                echo_seen: false,
                partial_consumed: false,
                subscription: None,
            }),
            done,
        })
    }

    pub fn command_string(&self) -> &str {
        &self.command_string
    }

    pub fn connection(&self) -> &Arc<ObservableConnection> {
        &self.connection
    }

    /// Subscribes to the connection and sends the command line.
    ///
    /// # Errors
    ///
    /// [`ConnectError::WrongUsage`] if already started; otherwise the send
    /// error, which is also recorded as the automaton's usage failure.
    pub fn start(self: &Arc<Self>) -> Result<(), ConnectError> {
        {
            let mut state = self.lock_state();
            if state.started {
                return Err(ConnectError::WrongUsage(format!(
                    "command '{}' already started",
                    self.command_string
                )));
            }
            state.started = true;
            state.classifier.on_start();
        }

        let key = self.connection.subscribe(self, Self::data_received);
        self.lock_state().subscription = Some(key);
        self.connection.connection().record(SessionEvent::CommandStarted {
            command: self.command_string.clone(),
        });
        debug!("starting '{}' on '{}'", self.command_string, self.connection.name());

        if let Err(err) = self.connection.sendline(&self.command_string) {
            let failed = {
                let mut state = self.lock_state();
                Self::set_outcome(
                    &mut state,
                    Outcome::Failure(CommandFailure {
                        kind: FailureKind::Usage,
                        command: self.command_string.clone(),
                        message: err.to_string(),
                    }),
                )
            };
            if failed {
                self.on_finished();
            }
            return Err(err);
        }
        Ok(())
    }

    fn data_received(&self, data: &str) {
        let finished = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.outcome.is_some() {
                return;
            }
            for fragment in state.splitter.feed(data) {
                self.on_fragment(state, &fragment);
                if state.outcome.is_some() {
                    break;
                }
            }
            state.outcome.is_some()
        };
        if finished {
            self.on_finished();
        }
    }

    fn on_fragment(&self, state: &mut AutomatonState<C>, fragment: &Fragment) {
        let line = fragment.text.as_str();
        trace!(
            "{} <- {:?} ({})",
            state.classifier.name(),
            line,
            if fragment.is_full_line { "line" } else { "partial" }
        );

        if fragment.is_full_line {
            let already_handled = fragment.seen_as_partial && state.partial_consumed;
            state.partial_consumed = false;
            if already_handled {
                return;
            }
            state.output_started = true;
            if !state.echo_seen && self.is_command_echo(line) {
                state.echo_seen = true;
                return;
            }
        }

        if state.output_started
            && let Some(prompt) = &self.options.shell_prompt
            && prompt.is_match(line)
        {
            debug!("'{}' returned to shell prompt {:?}", self.command_string, line);
            Self::set_outcome(state, Outcome::Success);
            return;
        }

        let AutomatonState {
            classifier,
            result,
            outcome,
            partial_consumed,
            ..
        } = state;
        let mut ctx = LineContext {
            connection: &self.connection,
            command: &self.command_string,
            is_full_line: fragment.is_full_line,
            result,
            outcome,
        };
        for rule in C::rules() {
            if !fragment.is_full_line && !rule.on_partial {
                continue;
            }
            if (rule.apply)(&mut *classifier, line, &mut ctx) == Parse::Consumed {
                trace!("{}: rule '{}' consumed {:?}", classifier.name(), rule.name, line);
                if !fragment.is_full_line {
                    *partial_consumed = true;
                }
                break;
            }
        }
    }

    fn is_command_echo(&self, line: &str) -> bool {
        let command = self.command_string.trim();
        !command.is_empty() && line.ends_with(command)
    }

    fn set_outcome(state: &mut AutomatonState<C>, outcome: Outcome) -> bool {
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        true
    }

    fn on_finished(&self) {
        let (success, result, error) = {
            let state = self.lock_state();
            match &state.outcome {
                Some(Outcome::Success) => (true, state.result.clone(), None),
                Some(Outcome::Failure(failure)) => {
                    (false, state.result.clone(), Some(failure.message.clone()))
                }
                Some(Outcome::TimedOut(timeout)) => (
                    false,
                    state.result.clone(),
                    Some(format!("timeout after {timeout:?}")),
                ),
                None => return,
            }
        };
        debug!(
            "'{}' finished ({})",
            self.command_string,
            if success { "success" } else { "failure" }
        );
        self.connection.connection().record(SessionEvent::CommandFinished {
            command: self.command_string.clone(),
            success,
            result,
            error,
        });
        self.done.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        self.lock_state().outcome.is_some()
    }

    /// Result lines, or the recorded failure.
    ///
    /// # Errors
    ///
    /// [`ConnectError::ResultNotAvailableYet`] before a terminal state,
    /// [`ConnectError::CommandFailure`] after a classified failure and
    /// [`ConnectError::CommandTimeout`] after a timeout.
    pub fn result(&self) -> Result<Vec<String>, ConnectError> {
        let state = self.lock_state();
        match &state.outcome {
            None => Err(ConnectError::ResultNotAvailableYet(
                self.command_string.clone(),
            )),
            Some(Outcome::Success) => Ok(state.result.clone()),
            Some(Outcome::Failure(failure)) => Err(failure.clone().into()),
            Some(Outcome::TimedOut(timeout)) => Err(ConnectError::CommandTimeout {
                command: self.command_string.clone(),
                timeout: *timeout,
                partial: state.result.clone(),
            }),
        }
    }

    /// Result lines accumulated so far, whatever the state.
    pub fn partial_result(&self) -> Vec<String> {
        self.lock_state().result.clone()
    }

    /// Waits for a terminal state.
    ///
    /// On expiry the automaton stops observing the connection and reports
    /// [`ConnectError::CommandTimeout`] with the lines gathered so far.
    pub async fn await_result(&self, timeout: Duration) -> Result<Vec<String>, ConnectError> {
        let mut done = self.done.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            done.wait_for(|finished| *finished).await.map(|_| ())
        })
        .await;

        match waited {
            Ok(Ok(())) => self.result(),
            Ok(Err(_)) => Err(ConnectError::InternalServerError(format!(
                "completion channel of '{}' closed",
                self.command_string
            ))),
            Err(_) => {
                let timed_out = Self::set_outcome(&mut self.lock_state(), Outcome::TimedOut(timeout));
                if timed_out {
                    warn!("'{}' timeout after {timeout:?}", self.command_string);
                    self.stop_observing();
                    self.on_finished();
                }
                self.result()
            }
        }
    }

    /// Stops the command without a result.
    pub fn cancel(&self) {
        let cancelled = Self::set_outcome(
            &mut self.lock_state(),
            Outcome::Failure(CommandFailure {
                kind: FailureKind::Cancelled,
                command: self.command_string.clone(),
                message: "cancelled by caller".to_string(),
            }),
        );
        if cancelled {
            self.stop_observing();
            self.on_finished();
        }
    }

    /// Read-only access to the classifier state.
    pub fn inspect<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.lock_state().classifier)
    }

    fn stop_observing(&self) {
        let key = self.lock_state().subscription.take();
        if let Some(key) = key {
            self.connection.unsubscribe_key(&key);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, AutomatonState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: LineClassifier> Drop for CommandAutomaton<C> {
    fn drop(&mut self) {
        let key = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .subscription
            .take();
        if let Some(key) = key
            && self.connection.observers().contains(&key)
        {
            self.connection.unsubscribe_key(&key);
        }
    }
}

impl<C: LineClassifier> fmt::Debug for CommandAutomaton<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAutomaton")
            .field("command", &self.command_string)
            .field("connection", &self.connection.name())
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::connection::Connection;

    /// Connection whose sends are captured instead of transmitted.
    pub(crate) fn capturing_connection() -> (Arc<ObservableConnection>, Arc<Mutex<Vec<String>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let connection = Connection::new(None).with_how2send(move |data| {
            sink.lock()
                .expect("sink lock")
                .push(String::from_utf8_lossy(&data).into_owned());
            Ok(())
        });
        (Arc::new(ObservableConnection::new(connection)), sent)
    }

    pub(crate) fn feed_lines(connection: &ObservableConnection, lines: &[&str]) {
        for line in lines {
            connection.inject(&format!("{line}\n"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{capturing_connection, feed_lines};
    use super::*;

    /// Collects every line, fails on `boom`, answers `ask?` on partial fragments.
    struct Echoish {
        answers: usize,
    }

    impl Echoish {
        fn answer(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
            if line.ends_with("ask?") {
                self.answers += 1;
                ctx.sendline("answer");
                return Parse::Consumed;
            }
            Parse::Pass
        }

        fn boom(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
            if line == "boom" {
                ctx.fail(FailureKind::RemoteOperation, line);
                return Parse::Consumed;
            }
            Parse::Pass
        }

        fn collect(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
            ctx.append(line);
            Parse::Consumed
        }
    }

    static ECHOISH_RULES: &[Rule<Echoish>] = &[
        Rule {
            name: "answer",
            on_partial: true,
            apply: Echoish::answer,
        },
        Rule {
            name: "boom",
            on_partial: false,
            apply: Echoish::boom,
        },
        Rule {
            name: "collect",
            on_partial: false,
            apply: Echoish::collect,
        },
    ];

    impl LineClassifier for Echoish {
        fn name(&self) -> &'static str {
            "echoish"
        }

        fn command_string(&self) -> String {
            "echoish --all".to_string()
        }

        fn rules() -> &'static [Rule<Self>] {
            ECHOISH_RULES
        }
    }

    fn started() -> (
        Arc<CommandAutomaton<Echoish>>,
        Arc<ObservableConnection>,
        Arc<Mutex<Vec<String>>>,
    ) {
        let (connection, sent) = capturing_connection();
        let automaton = CommandAutomaton::new(Arc::clone(&connection), Echoish { answers: 0 });
        automaton.start().expect("start");
        (automaton, connection, sent)
    }

    #[test]
    fn start_sends_command_line_and_subscribes() {
        let (automaton, connection, sent) = started();
        assert_eq!(
            sent.lock().expect("sent").as_slice(),
            &["echoish --all\n".to_string()]
        );
        assert_eq!(connection.observers().len(), 1);
        assert!(matches!(
            automaton.result(),
            Err(ConnectError::ResultNotAvailableYet(_))
        ));
        assert!(matches!(automaton.start(), Err(ConnectError::WrongUsage(_))));
    }

    #[test]
    fn echo_is_skipped_and_shell_prompt_completes() {
        let (automaton, connection, _) = started();
        feed_lines(&connection, &["user@box:~$ echoish --all", "one", "two"]);
        connection.inject("user@box:~$ ");

        assert_eq!(
            automaton.result().expect("success"),
            vec!["one".to_string(), "two".to_string()]
        );
    }

    #[test]
    fn default_shell_prompt_shapes() {
        for prompt in [
            "xyz@debian:/home$",
            "xyz@debian:~$ ",
            "root@box-1:/var/log#",
            "[fred@centos ~]$",
            "fred@mac:~%",
            "$",
            "# ",
        ] {
            assert!(DEFAULT_SHELL_PROMPT.is_match(prompt), "{prompt:?} is a prompt");
        }
        for line in ["100%", "50%", "sftp>", "total 12$ 4", "Uploading a to b", "<none>$"] {
            assert!(!DEFAULT_SHELL_PROMPT.is_match(line), "{line:?} is output");
        }
    }

    #[test]
    fn percentage_line_does_not_complete_the_command() {
        let (automaton, connection, _) = started();
        feed_lines(&connection, &["echoish --all", "100%", "50%"]);
        assert!(!automaton.is_done());

        connection.inject("$ ");
        assert_eq!(
            automaton.result().expect("success"),
            vec!["100%".to_string(), "50%".to_string()]
        );
    }

    #[test]
    fn lines_split_across_chunks_are_reassembled() {
        let (automaton, connection, _) = started();
        for chunk in ["fir", "st\nsec", "ond\n", "$ "] {
            connection.inject(chunk);
        }
        assert_eq!(
            automaton.result().expect("success"),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[test]
    fn first_terminal_outcome_wins_and_later_input_is_ignored() {
        let (automaton, connection, _) = started();
        feed_lines(&connection, &["kept", "boom", "after"]);
        connection.inject("$ ");

        let err = match automaton.result() {
            Ok(_) => panic!("boom must fail the command"),
            Err(err) => err,
        };
        match err {
            ConnectError::CommandFailure(failure) => {
                assert_eq!(failure.kind, FailureKind::RemoteOperation);
                assert_eq!(failure.message, "boom");
                assert_eq!(failure.command, "echoish --all");
            }
            other => panic!("unexpected error type: {other}"),
        }
        assert_eq!(automaton.partial_result(), vec!["kept".to_string()]);
    }

    #[test]
    fn partial_prompt_is_answered_once() {
        let (automaton, connection, sent) = started();
        connection.inject("ask?");
        connection.inject(" ");
        connection.inject("\n");

        assert_eq!(automaton.inspect(|c| c.answers), 1);
        assert_eq!(sent.lock().expect("sent").len(), 2);
        assert!(automaton.partial_result().is_empty());
    }

    #[test]
    fn send_failure_at_start_is_usage_failure() {
        let connection = Arc::new(ObservableConnection::new(crate::connection::Connection::new(None)));
        let automaton = CommandAutomaton::new(Arc::clone(&connection), Echoish { answers: 0 });

        assert!(matches!(automaton.start(), Err(ConnectError::WrongUsage(_))));
        assert!(automaton.is_done());
        match automaton.result() {
            Err(ConnectError::CommandFailure(failure)) => {
                assert_eq!(failure.kind, FailureKind::Usage)
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn dropping_the_automaton_unsubscribes() {
        let (automaton, connection, _) = started();
        assert_eq!(connection.observers().len(), 1);
        drop(automaton);
        assert!(connection.observers().is_empty());
        connection.inject("nobody listens\n");
    }

    #[test]
    fn cancel_is_terminal() {
        let (automaton, connection, _) = started();
        automaton.cancel();
        feed_lines(&connection, &["ignored"]);
        match automaton.result() {
            Err(ConnectError::CommandFailure(failure)) => {
                assert_eq!(failure.kind, FailureKind::Cancelled)
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(connection.observers().is_empty());
    }

    #[tokio::test]
    async fn await_result_times_out_with_partial_lines() {
        let (automaton, connection, _) = started();
        feed_lines(&connection, &["only line"]);

        let err = match automaton.await_result(Duration::from_millis(20)).await {
            Ok(_) => panic!("no prompt arrives, must time out"),
            Err(err) => err,
        };
        match err {
            ConnectError::CommandTimeout { partial, .. } => {
                assert_eq!(partial, vec!["only line".to_string()])
            }
            other => panic!("unexpected error type: {other}"),
        }
        assert!(connection.observers().is_empty());

        feed_lines(&connection, &["late"]);
        assert_eq!(automaton.partial_result(), vec!["only line".to_string()]);
    }

    #[tokio::test]
    async fn await_result_returns_once_done() {
        let (automaton, connection, _) = started();
        feed_lines(&connection, &["payload"]);
        connection.inject("$ ");
        let result = automaton
            .await_result(Duration::from_secs(1))
            .await
            .expect("completed");
        assert_eq!(result, vec!["payload".to_string()]);
    }

    #[test]
    fn two_automatons_on_one_connection_see_the_same_stream() {
        let (connection, _) = capturing_connection();
        let first = CommandAutomaton::new(Arc::clone(&connection), Echoish { answers: 0 });
        let second = CommandAutomaton::new(Arc::clone(&connection), Echoish { answers: 0 });
        first.start().expect("start first");
        second.start().expect("start second");

        feed_lines(&connection, &["shared"]);
        connection.inject("$ ");

        assert_eq!(first.result().expect("first"), vec!["shared".to_string()]);
        assert_eq!(second.result().expect("second"), vec!["shared".to_string()]);
    }
}
