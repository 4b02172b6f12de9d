//! Line-oriented host that drives an agent from stdin.
//!
//! Each input line is one host event: an intercepted request, a lifecycle
//! step, a sync wake-up, a control message or a newly opened tab. Results and
//! messages posted to tabs are printed on stdout.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::Agent;
use crate::clients::{ClientId, ClientMessage};
use crate::http::{Request, Response};

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
  /// `<METHOD> <url> [body]`
  Fetch {
    method: Method,
    url: String,
    body: Option<String>,
  },
  /// `open <url>`: a page navigation
  Navigate(String),
  Install,
  Activate,
  /// `sync [tag]`: without a tag, fire every registered tag
  Sync(Option<String>),
  /// `message <json>`
  Message(String),
  /// `tab <url>`: open a tab and print what it receives
  Tab(String),
  /// `close <id>`: close a tab
  Close(ClientId),
  Metrics,
  Partitions,
  Quit,
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_command(line: &str) -> Result<Option<HostCommand>> {
  let line = line.trim();
  if line.is_empty() || line.starts_with('#') {
    return Ok(None);
  }

  let (word, rest) = match line.split_once(char::is_whitespace) {
    Some((word, rest)) => (word, rest.trim()),
    None => (line, ""),
  };

  let required = |what: &str| -> Result<String> {
    if rest.is_empty() {
      Err(eyre!("'{}' needs {}", word, what))
    } else {
      Ok(rest.to_string())
    }
  };

  let command = match word {
    "install" => HostCommand::Install,
    "activate" => HostCommand::Activate,
    "metrics" => HostCommand::Metrics,
    "partitions" => HostCommand::Partitions,
    "quit" | "exit" => HostCommand::Quit,
    "sync" => HostCommand::Sync((!rest.is_empty()).then(|| rest.to_string())),
    "message" => HostCommand::Message(required("a JSON message")?),
    "tab" => HostCommand::Tab(required("a URL")?),
    "open" => HostCommand::Navigate(required("a URL")?),
    "close" => {
      let id = required("a tab id")?;
      HostCommand::Close(
        id.parse()
          .map_err(|e| eyre!("Invalid tab id '{}': {}", id, e))?,
      )
    }
    method if method.chars().all(|c| c.is_ascii_uppercase()) => {
      let method = Method::from_bytes(method.as_bytes())
        .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
      let (url, body) = match rest.split_once(char::is_whitespace) {
        Some((url, body)) => (url, Some(body.trim().to_string())),
        None => (rest, None),
      };
      if url.is_empty() {
        return Err(eyre!("'{}' needs a URL", word));
      }
      HostCommand::Fetch {
        method,
        url: url.to_string(),
        body,
      }
    }
    other => return Err(eyre!("Unknown command '{}'", other)),
  };

  Ok(Some(command))
}

/// Host events
enum Event {
  /// A line read from stdin
  Line(String),
  /// A message posted to an open tab
  Posted(ClientId, ClientMessage),
  /// Stdin reached EOF
  Closed,
}

/// Render a response as `<status> <source> <body>`, noting when a cached
/// copy was written.
pub fn describe(response: &Response) -> String {
  if response.is_network_error() {
    return format!("network error ({})", response.source);
  }
  match response.cached_at() {
    Some(at) => format!(
      "{} {} cached-at={} {}",
      response.status,
      response.source,
      at.to_rfc3339(),
      response.text()
    ),
    None => format!("{} {} {}", response.status, response.source, response.text()),
  }
}

/// Read commands from stdin until EOF or `quit`.
pub async fn run(agent: Agent) -> Result<()> {
  let (tx, mut rx) = mpsc::unbounded_channel();

  let stdin_tx = tx.clone();
  tokio::spawn(async move {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
      match lines.next_line().await {
        Ok(Some(line)) => {
          if stdin_tx.send(Event::Line(line)).is_err() {
            break;
          }
        }
        Ok(None) => break,
        Err(e) => {
          warn!("Failed to read stdin: {}", e);
          break;
        }
      }
    }
    let _ = stdin_tx.send(Event::Closed);
  });

  while let Some(event) = rx.recv().await {
    let line = match event {
      Event::Posted(id, message) => {
        let json = serde_json::to_string(&message).unwrap_or_default();
        println!("tab {}: {}", id, json);
        continue;
      }
      Event::Line(line) => line,
      Event::Closed => break,
    };

    let command = match parse_command(&line) {
      Ok(Some(command)) => command,
      Ok(None) => continue,
      Err(e) => {
        println!("error: {}", e);
        continue;
      }
    };
    debug!(?command, "Host command");

    if command == HostCommand::Quit {
      break;
    }
    if let Err(e) = execute(&agent, command, &tx).await {
      println!("error: {}", e);
    }
  }

  Ok(())
}

async fn execute(
  agent: &Agent,
  command: HostCommand,
  tab_tx: &mpsc::UnboundedSender<Event>,
) -> Result<()> {
  let ctx = agent.context();
  match command {
    HostCommand::Fetch { method, url, body } => {
      let mut request = Request::new(method, ctx.config.resolve_url(&url)?);
      if let Some(body) = body {
        request = request
          .with_header("content-type", "application/json")
          .with_body(body);
      }
      println!("{}", describe(&agent.handle_fetch(request).await));
    }
    HostCommand::Navigate(url) => {
      let request = Request::get(ctx.config.resolve_url(&url)?).navigate();
      println!("{}", describe(&agent.handle_fetch(request).await));
    }
    HostCommand::Install => {
      let report = agent.install().await?;
      println!(
        "installed: {} static assets{}, {} offline pages, {} critical endpoints, {} misses",
        report.static_assets,
        if report.bulk { " (bulk)" } else { "" },
        report.offline_pages,
        report.critical_endpoints,
        report.misses.len()
      );
      for miss in report.misses {
        println!("  miss: {}", miss);
      }
      println!("state: {:?}", agent.state());
    }
    HostCommand::Activate => {
      let report = agent.activate()?;
      println!(
        "activated: deleted {:?}, seeded {}, claimed {} tabs",
        report.deleted_partitions, report.seeded, report.claimed_clients
      );
    }
    HostCommand::Sync(Some(tag)) => match agent.on_sync_wake(&tag).await {
      Ok(()) => println!("sync {}: ok", tag),
      Err(e) => println!("sync {}: failed, retry later: {}", tag, e),
    },
    HostCommand::Sync(None) => {
      let tags = agent.take_sync_tags();
      if tags.is_empty() {
        println!("no sync registered");
      }
      for tag in tags {
        match agent.on_sync_wake(&tag).await {
          Ok(()) => println!("sync {}: ok", tag),
          Err(e) => {
            println!("sync {}: failed, retry later: {}", tag, e);
            agent.register_sync_tag(tag);
          }
        }
      }
    }
    HostCommand::Message(raw) => {
      agent.handle_raw_message(&raw)?;
      println!("ok");
    }
    HostCommand::Tab(url) => {
      let (id, mut messages) = agent.connect_client(ctx.config.resolve_url(&url)?);
      let tx = tab_tx.clone();
      tokio::spawn(async move {
        while let Some(message) = messages.recv().await {
          if tx.send(Event::Posted(id, message)).is_err() {
            break;
          }
        }
      });
      println!("tab {} opened, controlled: {}", id, ctx.clients.is_controlled(id));
    }
    HostCommand::Close(id) => {
      if agent.disconnect_client(id) {
        println!("tab {} closed, {} open", id, ctx.clients.len());
      } else {
        println!("no tab {}", id);
      }
    }
    HostCommand::Metrics => {
      println!("{}", serde_json::to_string(&agent.sync_metrics())?);
    }
    HostCommand::Partitions => {
      for partition in ctx.storage.partitions()? {
        println!("{} ({} entries)", partition, ctx.storage.keys(&partition)?.len());
      }
    }
    HostCommand::Quit => {}
  }
  Ok(())
}
