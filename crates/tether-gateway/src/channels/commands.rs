//! Slash-command parsing for chat messages.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stop,
    New,
    /// `/model` alone shows the current model.
    Model(Option<String>),
    Workspace(WorkspaceArg),
    /// Recently used workspaces.
    Workspaces,
    Stats,
    Help,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceArg {
    Show,
    Home,
    Switch(String),
    /// `/workspace new` without a name carries `None`.
    New(Option<String>),
}

pub const HELP_TEXT: &str = "Commands:\n\
/stop - Stop the current response\n\
/new - Start a fresh session\n\
/model - Show the current model\n\
/model <opus|sonnet|haiku> - Switch model\n\
/workspace - Show the current workspace\n\
/workspace <name> - Switch by name\n\
/workspace new <name> - Create and switch\n\
/workspace home - Return to the home workspace\n\
/workspaces - List recent workspaces\n\
/stats - Show session info and cost\n\
/help - This message";

/// Parse a message as a command. Returns `None` for ordinary prompts.
pub fn parse(text: &str) -> Option<Command> {
    let text = text.trim();
    let rest = text.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    // Group chats address commands as /cmd@botname.
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let arg = (!args.is_empty()).then(|| args.to_string());

    let command = match name.as_str() {
        "stop" => Command::Stop,
        "new" => Command::New,
        "model" => Command::Model(arg),
        "workspace" => Command::Workspace(parse_workspace(args)),
        "workspaces" => Command::Workspaces,
        "stats" => Command::Stats,
        "help" | "start" => Command::Help,
        _ => Command::Unknown(format!("/{head}")),
    };
    Some(command)
}

fn parse_workspace(args: &str) -> WorkspaceArg {
    if args.is_empty() {
        return WorkspaceArg::Show;
    }
    if args.eq_ignore_ascii_case("home") {
        return WorkspaceArg::Home;
    }
    let mut parts = args.splitn(2, char::is_whitespace);
    match parts.next() {
        Some(first) if first.eq_ignore_ascii_case("new") => {
            WorkspaceArg::New(parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string))
        }
        _ => WorkspaceArg::Switch(args.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("hello there"), None);
        assert_eq!(parse("  what does /stop do?"), None);
    }

    #[test]
    fn simple_commands() {
        assert_eq!(parse("/stop"), Some(Command::Stop));
        assert_eq!(parse(" /NEW "), Some(Command::New));
        assert_eq!(parse("/stats@tether_bot"), Some(Command::Stats));
        assert_eq!(parse("/start"), Some(Command::Help));
        assert_eq!(parse("/jobs"), Some(Command::Unknown("/jobs".into())));
        assert_eq!(parse("/workspaces"), Some(Command::Workspaces));
    }

    #[test]
    fn model_argument() {
        assert_eq!(parse("/model"), Some(Command::Model(None)));
        assert_eq!(parse("/model  opus "), Some(Command::Model(Some("opus".into()))));
    }

    #[test]
    fn workspace_forms() {
        assert_eq!(parse("/workspace"), Some(Command::Workspace(WorkspaceArg::Show)));
        assert_eq!(parse("/workspace Home"), Some(Command::Workspace(WorkspaceArg::Home)));
        assert_eq!(
            parse("/workspace my-project"),
            Some(Command::Workspace(WorkspaceArg::Switch("my-project".into())))
        );
        assert_eq!(
            parse("/workspace new  demo app"),
            Some(Command::Workspace(WorkspaceArg::New(Some("demo app".into()))))
        );
        assert_eq!(parse("/workspace new"), Some(Command::Workspace(WorkspaceArg::New(None))));
        assert_eq!(
            parse("/workspace newsletter"),
            Some(Command::Workspace(WorkspaceArg::Switch("newsletter".into())))
        );
    }
}
