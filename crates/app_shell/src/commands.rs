use core_types::Plan;
use thiserror::Error;

/// A note picked by its position in the last listing or by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteRef {
    Index(usize),
    Id(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    SignUp { email: String, password: String },
    SignIn { email: String, password: String },
    SignInGoogle,
    SignOut,
    New,
    List,
    Open(NoteRef),
    Title(String),
    Write(String),
    Say(String),
    Save,
    Pin,
    SetCategory(String),
    Tag(String),
    Untag(String),
    Filter(String),
    ClearFilters,
    SelectCategory(String),
    AddCategory(String),
    Categories,
    Search(String),
    Delete(Option<NoteRef>),
    Theme,
    Plan(Plan),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

pub const HELP: &[(&str, &str)] = &[
    ("signup <email> <password>", "create an account and sign in"),
    ("signin <email> <password>", "sign in"),
    ("signin google", "sign in with Google"),
    ("signout", "sign out"),
    ("new", "create a note"),
    ("list", "show the notes"),
    ("open <n|id>", "open a note"),
    ("title <text>", "rename the open note"),
    ("write <html>", "replace the open note's content"),
    ("say <text>", "append dictated text (Premium)"),
    ("save", "save the open note now"),
    ("pin", "pin or unpin the open note"),
    ("cat <category>", "move the open note to a category"),
    ("tag <tag> / untag <tag>", "tag the open note"),
    ("filter <tag>", "toggle a tag filter"),
    ("clear", "clear tag filters"),
    ("category <name>", "show one category (All for every note)"),
    ("newcat <name>", "add a category"),
    ("categories", "list categories and tags"),
    ("search [query]", "search notes, no query clears"),
    ("delete [n|id]", "delete the open or given note"),
    ("theme", "toggle light/dark theme"),
    ("plan <free|premium>", "switch plan"),
    ("help", "show this list"),
    ("quit", "save and exit"),
];

pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim();
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    if name.is_empty() {
        return Err(ParseError::Empty);
    }

    let command = match name.to_ascii_lowercase().as_str() {
        "signup" => {
            let (email, password) = credentials(rest, "signup <email> <password>")?;
            Command::SignUp { email, password }
        }
        "signin" if rest.eq_ignore_ascii_case("google") => Command::SignInGoogle,
        "signin" => {
            let (email, password) = credentials(rest, "signin <email> <password>")?;
            Command::SignIn { email, password }
        }
        "signout" => Command::SignOut,
        "new" => Command::New,
        "list" | "ls" => Command::List,
        "open" => {
            let usage = "open <n|id>";
            Command::Open(note_ref(rest, usage)?.ok_or(ParseError::Usage(usage))?)
        }
        "title" => Command::Title(rest.to_string()),
        "write" => Command::Write(rest.to_string()),
        "say" => Command::Say(required(rest, "say <text>")?),
        "save" => Command::Save,
        "pin" => Command::Pin,
        "cat" => Command::SetCategory(required(rest, "cat <category>")?),
        "tag" => Command::Tag(required(rest, "tag <tag>")?),
        "untag" => Command::Untag(required(rest, "untag <tag>")?),
        "filter" => Command::Filter(required(rest, "filter <tag>")?),
        "clear" => Command::ClearFilters,
        "category" => Command::SelectCategory(required(rest, "category <name>")?),
        "newcat" => Command::AddCategory(required(rest, "newcat <name>")?),
        "categories" => Command::Categories,
        "search" => Command::Search(rest.to_string()),
        "delete" | "rm" => Command::Delete(note_ref(rest, "delete [n|id]")?),
        "theme" => Command::Theme,
        "plan" => match rest.to_ascii_lowercase().as_str() {
            "free" => Command::Plan(Plan::Free),
            "premium" => Command::Plan(Plan::Premium),
            _ => return Err(ParseError::Usage("plan <free|premium>")),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

fn credentials(rest: &str, usage: &'static str) -> Result<(String, String), ParseError> {
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(email), Some(password), None) => Ok((email.to_string(), password.to_string())),
        _ => Err(ParseError::Usage(usage)),
    }
}

fn required(rest: &str, usage: &'static str) -> Result<String, ParseError> {
    if rest.is_empty() {
        Err(ParseError::Usage(usage))
    } else {
        Ok(rest.to_string())
    }
}

/// Listing positions start at 1.
fn note_ref(rest: &str, usage: &'static str) -> Result<Option<NoteRef>, ParseError> {
    if rest.is_empty() {
        return Ok(None);
    }
    match rest.parse::<usize>() {
        Ok(0) => Err(ParseError::Usage(usage)),
        Ok(index) => Ok(Some(NoteRef::Index(index))),
        Err(_) => Ok(Some(NoteRef::Id(rest.to_string()))),
    }
}
