use anyhow::{bail, Context, Result};

use chatlet_backend::runtime::WidgetRuntime;
use chatlet_backend::writeback::WriteAction;

pub const HELP: &str = "\
plain text              message from the other side of the chat
/send <text>            message typed by you
/use <item> [n]         use n of an item (default 1)
/buy <product> [n]      buy n of a product (default 1)
/accept <task id>       accept a task
/complete <task id>     complete an accepted task
/post <title> | <body>  open a forum thread
/reply <thread> <text>  reply to a thread
/floor <thread> <floor> <text>
                        reply to one floor of a thread
/show [widget]          print snapshots (backpack, shop, tasks, contacts, forum)
/switch                 simulate switching chats
/help, /quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Receive(String),
    Send(String),
    Use { item: String, amount: u32 },
    Buy { product: String, quantity: u32 },
    Accept { task: String },
    Complete { task: String },
    Post { title: String, body: String },
    Reply { thread: String, content: String },
    Floor { thread: String, floor: usize, content: String },
    Show(Option<String>),
    Switch,
    Help,
    Quit,
}

/// Parse one stdin line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Receive(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let command = match name {
        "send" => Command::Send(required(args, "text")?.to_string()),
        "use" => {
            let (item, amount) = name_and_count(args)?;
            Command::Use { item, amount }
        }
        "buy" => {
            let (product, quantity) = name_and_count(args)?;
            Command::Buy { product, quantity }
        }
        "accept" => Command::Accept {
            task: required(args, "task id")?.to_string(),
        },
        "complete" => Command::Complete {
            task: required(args, "task id")?.to_string(),
        },
        "post" => {
            let (title, body) = args
                .split_once('|')
                .context("usage: /post <title> | <body>")?;
            Command::Post {
                title: required(title.trim(), "title")?.to_string(),
                body: required(body.trim(), "body")?.to_string(),
            }
        }
        "reply" => {
            let (thread, content) = args
                .split_once(char::is_whitespace)
                .context("usage: /reply <thread> <text>")?;
            Command::Reply {
                thread: thread.to_string(),
                content: required(content.trim(), "text")?.to_string(),
            }
        }
        "floor" => {
            let mut parts = args.splitn(3, char::is_whitespace);
            let (Some(thread), Some(floor), Some(content)) =
                (parts.next(), parts.next(), parts.next())
            else {
                bail!("usage: /floor <thread> <floor> <text>");
            };
            Command::Floor {
                thread: thread.to_string(),
                floor: floor
                    .parse()
                    .with_context(|| format!("'{}' is not a floor number", floor))?,
                content: required(content.trim(), "text")?.to_string(),
            }
        }
        "show" => Command::Show((!args.is_empty()).then(|| args.to_string())),
        "switch" => Command::Switch,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command '/{}' (try /help)", other),
    };
    Ok(Some(command))
}

fn required<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    if value.is_empty() {
        bail!("missing {}", what);
    }
    Ok(value)
}

/// `name [count]`; the name may contain spaces.
fn name_and_count(args: &str) -> Result<(String, u32)> {
    let args = required(args, "name")?;
    if let Some((name, last)) = args.rsplit_once(char::is_whitespace) {
        if let Ok(count) = last.parse() {
            return Ok((name.trim().to_string(), count));
        }
    }
    Ok((args.to_string(), 1))
}

/// Look the command's target up in the current snapshots.
pub fn resolve(command: &Command, runtime: &WidgetRuntime) -> Result<Option<WriteAction>> {
    let action = match command {
        Command::Use { item, amount } => {
            let items = runtime.backpack.snapshot();
            let found = items
                .iter()
                .find(|i| &i.name == item)
                .with_context(|| format!("no item named '{}' in the backpack", item))?;
            WriteAction::UseItem {
                item: found.clone(),
                amount: *amount,
            }
        }
        Command::Buy { product, quantity } => {
            let products = runtime.shop.snapshot();
            let found = products
                .iter()
                .find(|p| &p.name == product)
                .with_context(|| format!("the shop has no '{}'", product))?;
            WriteAction::BuyProduct {
                product: found.clone(),
                quantity: *quantity,
            }
        }
        Command::Accept { task } | Command::Complete { task } => {
            let tasks = runtime.tasks.snapshot();
            let found = tasks
                .iter()
                .find(|t| &t.id == task)
                .with_context(|| format!("no task with id '{}'", task))?
                .clone();
            if matches!(command, Command::Accept { .. }) {
                WriteAction::AcceptTask { task: found }
            } else {
                WriteAction::CompleteTask { task: found }
            }
        }
        Command::Post { title, body } => WriteAction::PostThread {
            thread_id: runtime.next_thread_id(),
            title: title.clone(),
            body: body.clone(),
        },
        Command::Reply { thread, content } => WriteAction::ReplyThread {
            thread: find_thread(runtime, thread)?,
            content: content.clone(),
        },
        Command::Floor {
            thread,
            floor,
            content,
        } => WriteAction::ReplyFloor {
            thread: find_thread(runtime, thread)?,
            floor: *floor,
            content: content.clone(),
        },
        _ => return Ok(None),
    };
    Ok(Some(action))
}

fn find_thread(
    runtime: &WidgetRuntime,
    id: &str,
) -> Result<chatlet_backend::domain::forum::Thread> {
    runtime
        .forum
        .snapshot()
        .iter()
        .find(|t| t.id == id)
        .cloned()
        .with_context(|| format!("no thread with id '{}'", id))
}
