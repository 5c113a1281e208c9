//! Parsing of terminal input lines into actions.

use shared::agent_api::ChatOptions;

pub const HELP: &str = "\
Commands:
  /new                       start a new conversation
  /list                      list conversations
  /load <n|id>               switch to a conversation
  /export [path]             write the conversation transcript to a file
  /models                    list models served by the backend
  /model <name>              switch the active model profile
  /regen <n> [temp] [top_k] [top_p]
                             resend user message n with new sampling options
  /history                   show the current conversation
  /pending                   show commands waiting for approval
  /approve <id>              run a pending command
  /deny <id>                 refuse a pending command
  /denied [clear]            show or forget denied command ids
  /help                      this text
  /quit                      exit
Anything else is sent to the model. Ctrl-C cancels a response in progress.";

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Chat(String),
    New,
    List,
    Load(String),
    Export(Option<String>),
    Models,
    Model(String),
    Regenerate {
        index: usize,
        temperature: Option<f32>,
        top_k: Option<u32>,
        top_p: Option<f32>,
    },
    History,
    Pending,
    Approve(String),
    Deny(String),
    Denied { clear: bool },
    Help,
    Quit,
    Empty,
    /// Slash command that could not be understood, with a hint
    Invalid(String),
}

impl Action {
    /// Sampling options for a regenerate request, filling gaps from `base`
    pub fn regenerate_options(&self, base: ChatOptions) -> Option<ChatOptions> {
        match self {
            Action::Regenerate {
                temperature,
                top_k,
                top_p,
                ..
            } => Some(ChatOptions {
                temperature: temperature.unwrap_or(base.temperature),
                top_k: top_k.unwrap_or(base.top_k),
                top_p: top_p.unwrap_or(base.top_p),
            }),
            _ => None,
        }
    }
}

pub fn parse(line: &str) -> Action {
    let line = line.trim();
    if line.is_empty() {
        return Action::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Action::Chat(line.to_string());
    };

    let mut parts = rest.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    match (name, args.as_slice()) {
        ("new", []) => Action::New,
        ("list", []) => Action::List,
        ("load", [target]) => Action::Load(target.to_string()),
        ("export", []) => Action::Export(None),
        ("export", [path]) => Action::Export(Some(path.to_string())),
        ("models", []) => Action::Models,
        ("model", [model]) => Action::Model(model.to_string()),
        ("regen", [index, sampling @ ..]) if sampling.len() <= 3 => parse_regenerate(index, sampling),
        ("history", []) => Action::History,
        ("pending", []) => Action::Pending,
        ("approve", [id]) => Action::Approve(id.to_string()),
        ("deny", [id]) => Action::Deny(id.to_string()),
        ("denied", []) => Action::Denied { clear: false },
        ("denied", ["clear"]) => Action::Denied { clear: true },
        ("help", _) => Action::Help,
        ("quit" | "exit", []) => Action::Quit,
        _ => Action::Invalid(format!("Unknown command: /{}. Type /help for a list.", rest)),
    }
}

fn parse_regenerate(index: &str, sampling: &[&str]) -> Action {
    let Ok(index) = index.parse::<usize>() else {
        return Action::Invalid(format!("Not a message number: {}", index));
    };
    let temperature = match sampling.first().map(|t| t.parse::<f32>()) {
        Some(Ok(t)) => Some(t),
        Some(Err(_)) => return Action::Invalid("temperature must be a number".into()),
        None => None,
    };
    let top_k = match sampling.get(1).map(|k| k.parse::<u32>()) {
        Some(Ok(k)) => Some(k),
        Some(Err(_)) => return Action::Invalid("top_k must be a whole number".into()),
        None => None,
    };
    let top_p = match sampling.get(2).map(|p| p.parse::<f32>()) {
        Some(Ok(p)) => Some(p),
        Some(Err(_)) => return Action::Invalid("top_p must be a number".into()),
        None => None,
    };
    Action::Regenerate {
        index,
        temperature,
        top_k,
        top_p,
    }
}
