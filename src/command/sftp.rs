use super::*;

static RE_CONFIRM_HOST_KEY: Lazy<Regex> = Lazy::new(|| {
    compile(r"(?i)Are\syou\ssure\syou\swant\sto\scontinue\sconnecting\s\(yes/no[^)]*\)\?")
});
static RE_PASSWORD: Lazy<Regex> = Lazy::new(|| compile(r"(?i)password:\s*$"));
static RE_CONNECTED: Lazy<Regex> = Lazy::new(|| compile(r"(?i)Connected\sto\s.+"));
static RE_PROMPT: Lazy<Regex> = Lazy::new(|| compile(r"(?i)^sftp>"));
static RE_PROMPT_WITH_COMMAND: Lazy<Regex> = Lazy::new(|| compile(r"(?i)sftp>\s\w+"));
static RE_TRANSFER_START: Lazy<Regex> = Lazy::new(|| compile(r"(?i)(Fetching\s.*|Uploading\s.*)"));
static RE_TRANSFER_DONE: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i).+\s+100%\s+\d+\S*\s+.+/s\s+\d+:\d+"));
static RE_TRANSFER_PROGRESS: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i).+\s+\d{1,2}%\s+\d+\S*\s+.+/s\s+(--:--|\d+:\d+)\s+ETA"));
static RE_RESEND_PASSWORD: Lazy<Regex> =
    Lazy::new(|| compile(r"(?i)Permission\sdenied,\splease\stry\sagain"));
static RE_AUTHENTICATION: Lazy<Regex> = Lazy::new(|| {
    compile(
        r"(?i)(?P<AUTH>Authentication\sfailed.*)|(?P<HOST_KEY>Host\skey\sverification\sfailed.*)|(?P<PERM>.*Permission\sdenied.*)",
    )
});
static RE_HELP: Lazy<Regex> = Lazy::new(|| compile(r"(?i)usage:\ssftp\s.*"));
static ERRORS: Lazy<RegexSet> = Lazy::new(|| {
    compile_set(&[
        r"(?i)File.*not\sfound.*",
        r"(?i).*No\ssuch\sfile\sor\sdirectory.*",
        r"(?i)Couldn't\sread\spacket:\sConnection\sreset\sby\speer",
        r"(?i)(unknown|invalid)\soption\s.*",
        r"(?i)ssh:.+",
    ])
});

static SFTP_RULES: &[Rule<Sftp>] = &[
    Rule {
        name: "useless line",
        on_partial: true,
        apply: Sftp::catch_useless_line,
    },
    Rule {
        name: "host key confirmation",
        on_partial: true,
        apply: Sftp::answer_host_key,
    },
    Rule {
        name: "password prompt",
        on_partial: true,
        apply: Sftp::send_password,
    },
    Rule {
        name: "connected banner",
        on_partial: false,
        apply: Sftp::check_if_connected,
    },
    Rule {
        name: "sftp prompt",
        on_partial: true,
        apply: Sftp::send_command_if_prompt,
    },
    Rule {
        name: "transfer start",
        on_partial: false,
        apply: Sftp::transfer_started,
    },
    Rule {
        name: "transfer progress",
        on_partial: false,
        apply: Sftp::transfer_progress,
    },
    Rule {
        name: "command output",
        on_partial: false,
        apply: Sftp::command_output,
    },
    Rule {
        name: "password rejected",
        on_partial: false,
        apply: Sftp::password_rejected,
    },
    Rule {
        name: "authentication failure",
        on_partial: false,
        apply: Sftp::authentication_failure,
    },
    Rule {
        name: "command error",
        on_partial: false,
        apply: Sftp::command_error,
    },
];

/// Interactive `sftp` session.
///
/// Without a remote command the session fetches `[user@]host:source` to
/// `destination` and ends when the shell prompt returns, or with `exit` at
/// the first `sftp>` prompt after the transfer completed. With a command,
/// the command is issued at the first `sftp>` prompt and `exit` at the next
/// one, which completes the session.
///
/// Result lines are the transfer start and completion lines, plus any
/// output of the remote command.
#[derive(Debug, Clone)]
pub struct Sftp {
    host: String,
    password: String,
    user: Option<String>,
    confirm_host_key: bool,
    source_path: Option<String>,
    destination_path: Option<String>,
    options: Option<String>,
    command: Option<String>,

    host_key_answered: bool,
    password_sent: bool,
    ready: bool,
    command_sent: bool,
    exit_sent: bool,
    transfer_active: bool,
    transfer_done: bool,
    password_attempts: usize,
}

impl Sftp {
    pub fn new(host: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            password: password.into(),
            user: None,
            confirm_host_key: true,
            source_path: None,
            destination_path: None,
            options: None,
            command: None,
            host_key_answered: false,
            password_sent: false,
            ready: false,
            command_sent: false,
            exit_sent: false,
            transfer_active: false,
            transfer_done: false,
            password_attempts: 0,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Answer to an unknown host key: `yes` when true, `no` otherwise.
    pub fn confirm_host_key(mut self, confirm: bool) -> Self {
        self.confirm_host_key = confirm;
        self
    }

    pub fn with_source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = Some(path.into());
        self
    }

    pub fn with_destination_path(mut self, path: impl Into<String>) -> Self {
        self.destination_path = Some(path.into());
        self
    }

    /// Raw option string placed right after `sftp`.
    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Command issued at the interactive prompt.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Number of times the password was sent.
    pub fn password_attempts(&self) -> usize {
        self.password_attempts
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn catch_useless_line(&mut self, line: &str, _ctx: &mut LineContext<'_>) -> Parse {
        if line.trim().is_empty() || RE_PROMPT_WITH_COMMAND.is_match(line) {
            return Parse::Consumed;
        }
        Parse::Pass
    }

    fn answer_host_key(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if self.host_key_answered || !RE_CONFIRM_HOST_KEY.is_match(line) {
            return Parse::Pass;
        }
        ctx.sendline(if self.confirm_host_key { "yes" } else { "no" });
        self.host_key_answered = true;
        Parse::Consumed
    }

    fn send_password(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if self.password_sent || !RE_PASSWORD.is_match(line) {
            return Parse::Pass;
        }
        ctx.sendline_secret(&self.password);
        self.password_sent = true;
        self.password_attempts += 1;
        Parse::Consumed
    }

    fn check_if_connected(&mut self, line: &str, _ctx: &mut LineContext<'_>) -> Parse {
        if !RE_CONNECTED.is_match(line) {
            return Parse::Pass;
        }
        self.ready = true;
        Parse::Consumed
    }

    fn send_command_if_prompt(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if !self.ready || !RE_PROMPT.is_match(line) {
            return Parse::Pass;
        }
        if !self.command_sent {
            if let Some(command) = self.command.as_deref() {
                ctx.sendline(command);
            }
            self.command_sent = true;
        } else if self.command.is_none() && !self.transfer_done {
            // fetch: the client prints a prompt before the transfer starts
        } else if !self.exit_sent {
            ctx.sendline("exit");
            self.exit_sent = true;
            ctx.succeed();
        }
        Parse::Consumed
    }

    fn transfer_started(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if !self.ready
            || !self.command_sent
            || self.transfer_active
            || !RE_TRANSFER_START.is_match(line)
        {
            return Parse::Pass;
        }
        self.transfer_active = true;
        ctx.append(line);
        Parse::Consumed
    }

    fn transfer_progress(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if !self.transfer_active {
            return Parse::Pass;
        }
        if RE_TRANSFER_DONE.is_match(line) {
            ctx.append(line);
            self.transfer_active = false;
            self.transfer_done = true;
        } else if RE_TRANSFER_PROGRESS.is_match(line) {
            // intermediate progress is not part of the result
        } else {
            let kind = if ERRORS.is_match(line) {
                FailureKind::RemoteOperation
            } else {
                FailureKind::ProtocolViolation
            };
            ctx.fail(kind, line);
        }
        Parse::Consumed
    }

    fn command_output(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if !self.ready || !self.command_sent || self.transfer_active || is_failure_banner(line) {
            return Parse::Pass;
        }
        ctx.append(line);
        Parse::Consumed
    }

    fn password_rejected(&mut self, line: &str, _ctx: &mut LineContext<'_>) -> Parse {
        if !RE_RESEND_PASSWORD.is_match(line) {
            return Parse::Pass;
        }
        self.password_sent = false;
        Parse::Consumed
    }

    fn authentication_failure(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        let Some(caps) = RE_AUTHENTICATION.captures(line) else {
            return Parse::Pass;
        };
        let message = caps
            .name("AUTH")
            .or_else(|| caps.name("HOST_KEY"))
            .or_else(|| caps.name("PERM"))
            .map_or(line, |m| m.as_str());
        ctx.fail(FailureKind::Authentication, message);
        Parse::Consumed
    }

    fn command_error(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if let Some(help) = RE_HELP.find(line) {
            ctx.fail(
                FailureKind::RemoteOperation,
                format!("invalid command: {}", help.as_str()),
            );
            return Parse::Consumed;
        }
        if ERRORS.is_match(line) {
            ctx.fail(FailureKind::RemoteOperation, line);
            return Parse::Consumed;
        }
        Parse::Pass
    }
}

/// Lines the later rules classify as failures (or a password retry); they
/// are never treated as command output.
fn is_failure_banner(line: &str) -> bool {
    RE_RESEND_PASSWORD.is_match(line)
        || RE_AUTHENTICATION.is_match(line)
        || RE_HELP.is_match(line)
        || ERRORS.is_match(line)
}

impl LineClassifier for Sftp {
    fn name(&self) -> &'static str {
        "sftp"
    }

    fn command_string(&self) -> String {
        let mut cmd = "sftp".to_string();
        if let Some(options) = &self.options {
            cmd = format!("{cmd} {options}");
        }
        match &self.user {
            Some(user) => cmd = format!("{cmd} {user}@{}", self.host),
            None => cmd = format!("{cmd} {}", self.host),
        }
        if let Some(source) = &self.source_path {
            cmd = format!("{cmd}:{source}");
        }
        if let Some(destination) = &self.destination_path {
            cmd = format!("{cmd} {destination}");
        }
        cmd
    }

    fn rules() -> &'static [Rule<Self>] {
        SFTP_RULES
    }

    fn on_start(&mut self) {
        // A fetch needs no interactive command.
        if self.command.is_none() {
            self.command_sent = true;
        }
    }
}
