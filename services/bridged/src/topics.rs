use crate::config::AuthorizeConfig;

/// A parsed request from an MQTT topic relative to the configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRequest {
    PinMode { pin: u8 },
    DigitalSet { pin: u8 },
    DigitalGet { pin: u8 },
    AnalogSet { pin: u8 },
    AnalogGet { pin: u8 },
    DatastorePut { key: String },
    DatastoreGet { key: String },
    MailboxIn,
    MailboxAvailable,
    FileRead { path: String },
    FileWrite { path: String },
    FileRemove { path: String },
    ShellRun,
    ShellRunAsync,
    ShellPoll { pid: u16 },
    ShellKill { pid: u16 },
    ConsoleIn,
    SummaryGet,
    HandshakeGet,
}

/// The sensitive action a request maps onto; each has a config switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthAction {
    FileRead,
    FileWrite,
    FileRemove,
    DatastoreGet,
    DatastorePut,
    MailboxRead,
    MailboxWrite,
    ShellRun,
    ShellRunAsync,
    ShellPoll,
    ShellKill,
    ConsoleInput,
    DigitalRead,
    DigitalWrite,
    DigitalMode,
    AnalogRead,
    AnalogWrite,
}

impl AuthAction {
    pub fn name(self) -> &'static str {
        match self {
            AuthAction::FileRead => "file_read",
            AuthAction::FileWrite => "file_write",
            AuthAction::FileRemove => "file_remove",
            AuthAction::DatastoreGet => "datastore_get",
            AuthAction::DatastorePut => "datastore_put",
            AuthAction::MailboxRead => "mailbox_read",
            AuthAction::MailboxWrite => "mailbox_write",
            AuthAction::ShellRun => "shell_run",
            AuthAction::ShellRunAsync => "shell_run_async",
            AuthAction::ShellPoll => "shell_poll",
            AuthAction::ShellKill => "shell_kill",
            AuthAction::ConsoleInput => "console_input",
            AuthAction::DigitalRead => "digital_read",
            AuthAction::DigitalWrite => "digital_write",
            AuthAction::DigitalMode => "digital_mode",
            AuthAction::AnalogRead => "analog_read",
            AuthAction::AnalogWrite => "analog_write",
        }
    }
}

impl TopicRequest {
    /// The switch guarding this request, when it is a sensitive one. Summary
    /// and handshake snapshots are unauthenticated reads of published state.
    pub fn action(&self) -> Option<AuthAction> {
        match self {
            TopicRequest::PinMode { .. } => Some(AuthAction::DigitalMode),
            TopicRequest::DigitalSet { .. } => Some(AuthAction::DigitalWrite),
            TopicRequest::DigitalGet { .. } => Some(AuthAction::DigitalRead),
            TopicRequest::AnalogSet { .. } => Some(AuthAction::AnalogWrite),
            TopicRequest::AnalogGet { .. } => Some(AuthAction::AnalogRead),
            TopicRequest::DatastorePut { .. } => Some(AuthAction::DatastorePut),
            TopicRequest::DatastoreGet { .. } => Some(AuthAction::DatastoreGet),
            TopicRequest::MailboxIn => Some(AuthAction::MailboxWrite),
            TopicRequest::MailboxAvailable => Some(AuthAction::MailboxRead),
            TopicRequest::FileRead { .. } => Some(AuthAction::FileRead),
            TopicRequest::FileWrite { .. } => Some(AuthAction::FileWrite),
            TopicRequest::FileRemove { .. } => Some(AuthAction::FileRemove),
            TopicRequest::ShellRun => Some(AuthAction::ShellRun),
            TopicRequest::ShellRunAsync => Some(AuthAction::ShellRunAsync),
            TopicRequest::ShellPoll { .. } => Some(AuthAction::ShellPoll),
            TopicRequest::ShellKill { .. } => Some(AuthAction::ShellKill),
            TopicRequest::ConsoleIn => Some(AuthAction::ConsoleInput),
            TopicRequest::SummaryGet | TopicRequest::HandshakeGet => None,
        }
    }
}

/// Parses a topic already stripped of the configured prefix. Topics the
/// daemon itself publishes on (`…/value`, `mailbox/out`, `system/status`)
/// parse to `None` so the daemon never consumes its own traffic.
pub fn parse(topic: &str) -> Option<TopicRequest> {
    let segments: Vec<&str> = topic.split('/').collect();

    match segments.as_slice() {
        ["d", pin, "mode"] => Some(TopicRequest::PinMode { pin: pin.parse().ok()? }),
        ["d", pin, "set"] => Some(TopicRequest::DigitalSet { pin: pin.parse().ok()? }),
        ["d", pin, "get"] => Some(TopicRequest::DigitalGet { pin: pin.parse().ok()? }),
        ["a", pin, "set"] => Some(TopicRequest::AnalogSet { pin: pin.parse().ok()? }),
        ["a", pin, "get"] => Some(TopicRequest::AnalogGet { pin: pin.parse().ok()? }),
        ["datastore", "put", key @ ..] if !key.is_empty() => Some(TopicRequest::DatastorePut {
            key: key.join("/"),
        }),
        ["datastore", "get", rest @ ..] if rest.len() >= 2 && *rest.last().unwrap() == "request" => {
            Some(TopicRequest::DatastoreGet {
                key: rest[..rest.len() - 1].join("/"),
            })
        }
        ["mailbox", "in"] => Some(TopicRequest::MailboxIn),
        ["mailbox", "available"] => Some(TopicRequest::MailboxAvailable),
        ["file", "read", path @ ..] if !path.is_empty() => Some(TopicRequest::FileRead {
            path: path.join("/"),
        }),
        ["file", "write", path @ ..] if !path.is_empty() => Some(TopicRequest::FileWrite {
            path: path.join("/"),
        }),
        ["file", "remove", path @ ..] if !path.is_empty() => Some(TopicRequest::FileRemove {
            path: path.join("/"),
        }),
        ["sh", "run"] => Some(TopicRequest::ShellRun),
        ["sh", "run_async"] => Some(TopicRequest::ShellRunAsync),
        ["sh", "poll", pid] => Some(TopicRequest::ShellPoll { pid: pid.parse().ok()? }),
        ["sh", "kill", pid] => Some(TopicRequest::ShellKill { pid: pid.parse().ok()? }),
        ["console", "in"] => Some(TopicRequest::ConsoleIn),
        ["system", "bridge", "summary", "get"] => Some(TopicRequest::SummaryGet),
        ["system", "bridge", "handshake", "get"] => Some(TopicRequest::HandshakeGet),
        _ => None,
    }
}

/// Deny-by-default authorisation: every sensitive action needs its switch
/// turned on, and shell execution additionally consults the allow-list.
pub struct Authorizer {
    switches: AuthorizeConfig,
    /// `None` = `*` wildcard (lab setups), otherwise exact binary names.
    allowed_commands: Option<Vec<String>>,
}

impl Authorizer {
    pub fn new(switches: AuthorizeConfig, allowed_commands: Option<Vec<String>>) -> Authorizer {
        Authorizer {
            switches,
            allowed_commands,
        }
    }

    pub fn permits(&self, action: AuthAction) -> bool {
        match action {
            AuthAction::FileRead => self.switches.allow_file_read,
            AuthAction::FileWrite => self.switches.allow_file_write,
            AuthAction::FileRemove => self.switches.allow_file_remove,
            AuthAction::DatastoreGet => self.switches.allow_datastore_get,
            AuthAction::DatastorePut => self.switches.allow_datastore_put,
            AuthAction::MailboxRead => self.switches.allow_mailbox_read,
            AuthAction::MailboxWrite => self.switches.allow_mailbox_write,
            AuthAction::ShellRun => self.switches.allow_shell_run,
            AuthAction::ShellRunAsync => self.switches.allow_shell_run_async,
            AuthAction::ShellPoll => self.switches.allow_shell_poll,
            AuthAction::ShellKill => self.switches.allow_shell_kill,
            AuthAction::ConsoleInput => self.switches.allow_console_input,
            AuthAction::DigitalRead => self.switches.allow_digital_read,
            AuthAction::DigitalWrite => self.switches.allow_digital_write,
            AuthAction::DigitalMode => self.switches.allow_digital_mode,
            AuthAction::AnalogRead => self.switches.allow_analog_read,
            AuthAction::AnalogWrite => self.switches.allow_analog_write,
        }
    }

    /// Whether the command line's binary is on the allow-list. The list
    /// holds bare binary names; the command may use an absolute path.
    pub fn command_allowed(&self, command_line: &str) -> bool {
        let binary = match command_line.split_whitespace().next() {
            Some(binary) => binary,
            None => return false,
        };

        let name = binary.rsplit('/').next().unwrap_or(binary);

        match self.allowed_commands {
            None => true,
            Some(ref list) => list.iter().any(|allowed| allowed == name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_sensitive_requests() -> Vec<TopicRequest> {
        vec![
            TopicRequest::PinMode { pin: 3 },
            TopicRequest::DigitalSet { pin: 13 },
            TopicRequest::DigitalGet { pin: 7 },
            TopicRequest::AnalogSet { pin: 9 },
            TopicRequest::AnalogGet { pin: 0 },
            TopicRequest::DatastorePut { key: "k".to_string() },
            TopicRequest::DatastoreGet { key: "k".to_string() },
            TopicRequest::MailboxIn,
            TopicRequest::MailboxAvailable,
            TopicRequest::FileRead { path: "f".to_string() },
            TopicRequest::FileWrite { path: "f".to_string() },
            TopicRequest::FileRemove { path: "f".to_string() },
            TopicRequest::ShellRun,
            TopicRequest::ShellRunAsync,
            TopicRequest::ShellPoll { pid: 1 },
            TopicRequest::ShellKill { pid: 1 },
            TopicRequest::ConsoleIn,
        ]
    }

    #[test]
    fn test_parse_gpio_topics() {
        assert_eq!(parse("d/13/set"), Some(TopicRequest::DigitalSet { pin: 13 }));
        assert_eq!(parse("d/7/get"), Some(TopicRequest::DigitalGet { pin: 7 }));
        assert_eq!(parse("d/2/mode"), Some(TopicRequest::PinMode { pin: 2 }));
        assert_eq!(parse("a/5/set"), Some(TopicRequest::AnalogSet { pin: 5 }));
        assert_eq!(parse("a/5/get"), Some(TopicRequest::AnalogGet { pin: 5 }));
        assert_eq!(parse("d/not-a-pin/set"), None);
    }

    #[test]
    fn test_parse_datastore_topics() {
        assert_eq!(
            parse("datastore/put/answer"),
            Some(TopicRequest::DatastorePut { key: "answer".to_string() })
        );
        assert_eq!(
            parse("datastore/get/answer/request"),
            Some(TopicRequest::DatastoreGet { key: "answer".to_string() })
        );
        // Keys may contain slashes.
        assert_eq!(
            parse("datastore/get/a/b/request"),
            Some(TopicRequest::DatastoreGet { key: "a/b".to_string() })
        );
        // The published value topic is not a request.
        assert_eq!(parse("datastore/get/answer/value"), None);
    }

    #[test]
    fn test_parse_file_and_shell_topics() {
        assert_eq!(
            parse("file/read/etc/motd"),
            Some(TopicRequest::FileRead { path: "etc/motd".to_string() })
        );
        assert_eq!(parse("sh/run"), Some(TopicRequest::ShellRun));
        assert_eq!(parse("sh/poll/42"), Some(TopicRequest::ShellPoll { pid: 42 }));
        assert_eq!(parse("sh/kill/42"), Some(TopicRequest::ShellKill { pid: 42 }));
    }

    #[test]
    fn test_published_topics_do_not_parse() {
        assert_eq!(parse("d/13/value"), None);
        assert_eq!(parse("mailbox/out"), None);
        assert_eq!(parse("file/value/etc/motd"), None);
        assert_eq!(parse("system/status"), None);
        assert_eq!(parse("system/bridge/summary/value"), None);
    }

    #[test]
    fn test_deny_by_default_all_sensitive_actions() {
        let authorizer = Authorizer::new(AuthorizeConfig::default(), Some(vec![]));

        for request in all_sensitive_requests() {
            let action = request.action().expect("sensitive request must map");
            assert!(
                !authorizer.permits(action),
                "{} must be denied by default",
                action.name()
            );
        }
    }

    #[test]
    fn test_switch_enables_single_action() {
        let mut switches = AuthorizeConfig::default();
        switches.allow_digital_write = true;

        let authorizer = Authorizer::new(switches, Some(vec![]));

        assert!(authorizer.permits(AuthAction::DigitalWrite));
        assert!(!authorizer.permits(AuthAction::DigitalRead));
        assert!(!authorizer.permits(AuthAction::ShellRun));
    }

    #[test]
    fn test_command_allow_list() {
        let authorizer = Authorizer::new(
            AuthorizeConfig::default(),
            Some(vec!["ls".to_string(), "uptime".to_string()]),
        );

        assert!(authorizer.command_allowed("ls -la /tmp"));
        assert!(authorizer.command_allowed("/bin/ls"));
        assert!(authorizer.command_allowed("uptime"));
        assert!(!authorizer.command_allowed("rm -rf /"));
        assert!(!authorizer.command_allowed(""));
    }

    #[test]
    fn test_command_wildcard() {
        let authorizer = Authorizer::new(AuthorizeConfig::default(), None);
        assert!(authorizer.command_allowed("anything --goes"));
        assert!(!authorizer.command_allowed(""));
    }

    #[test]
    fn test_empty_allow_list_blocks_everything() {
        let authorizer = Authorizer::new(AuthorizeConfig::default(), Some(vec![]));
        assert!(!authorizer.command_allowed("ls"));
    }

    #[test]
    fn test_snapshot_requests_are_unauthenticated() {
        assert_eq!(parse("system/bridge/summary/get"), Some(TopicRequest::SummaryGet));
        assert!(TopicRequest::SummaryGet.action().is_none());
        assert!(TopicRequest::HandshakeGet.action().is_none());
    }
}
