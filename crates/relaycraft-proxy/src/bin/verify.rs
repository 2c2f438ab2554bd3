//! `relaycraft-verify` - a small CLI for poking at a running relaycraftd's
//! `/_relay` control channel: poll the flow ring, manage breakpoints, and
//! resume paused flows.

use std::convert::Infallible;

use clap::{Parser, Subcommand};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use relaycraft_proxy::config::ConnectionPoolConfig;
use relaycraft_proxy::proxy::{create_http_client, HttpClient};
use serde_json::{json, Value};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Poke at a running relaycraftd's `/_relay` control channel.
#[derive(Parser, Debug)]
#[command(name = "relaycraft-verify")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base URL of the running proxy's control channel
    #[arg(long, default_value = "http://127.0.0.1:9090")]
    url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll flows recorded since a given server timestamp
    Poll {
        #[arg(long, default_value_t = 0.0)]
        since: f64,
    },
    /// Manage breakpoints
    Breakpoints {
        #[command(subcommand)]
        action: BreakpointAction,
    },
    /// Resume a flow paused at a breakpoint
    Resume {
        /// Id of the paused flow
        id: String,
        /// Abort the flow instead of letting it continue
        #[arg(long)]
        abort: bool,
        /// Override the response status code
        #[arg(long)]
        status_code: Option<u16>,
        /// Replace the response body (UTF-8 text)
        #[arg(long)]
        response_body: Option<String>,
    },
    /// Fetch the configured interception certificate
    Cert,
}

#[derive(Subcommand, Debug)]
enum BreakpointAction {
    /// Register a breakpoint
    Add {
        id: String,
        /// URL substring, exact string, or regex to match against
        pattern: String,
        #[arg(long, default_value = "contains")]
        match_type: String,
        #[arg(long)]
        on_request: bool,
        #[arg(long)]
        on_response: bool,
    },
    /// Remove a breakpoint by id
    Remove { id: String },
    /// Remove every breakpoint
    Clear,
}

fn body_from(bytes: impl Into<Bytes>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(bytes.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

async fn send_json(client: &HttpClient, method: Method, url: String, body: Option<Value>) -> anyhow::Result<Value> {
    let payload = body.map(|v| v.to_string()).unwrap_or_default();
    let req = Request::builder()
        .method(method)
        .uri(url)
        .header("content-type", "application/json")
        .body(body_from(payload))?;

    let resp = client.request(req).await?;
    let status = resp.status();
    let bytes = resp.into_body().collect().await?.to_bytes();
    let value: Value = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({"raw": String::from_utf8_lossy(&bytes)}))
    };
    if !status.is_success() {
        anyhow::bail!("{status}: {value}");
    }
    Ok(value)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = create_http_client(&ConnectionPoolConfig::default(), false);
    let base = args.url.trim_end_matches('/').to_string();

    match args.command {
        Command::Poll { since } => {
            let url = format!("{base}/_relay/poll?since={since}");
            let result = send_json(&client, Method::GET, url, None).await?;
            let flows = result["flows"].as_array().cloned().unwrap_or_default();
            println!("{BOLD}{}{} flow(s) since {since}{RESET}", CYAN, flows.len());
            for flow in &flows {
                println!(
                    "  {} {} {} -> {}",
                    flow["method"].as_str().unwrap_or("?"),
                    flow["url"].as_str().unwrap_or("?"),
                    flow["status"],
                    flow["id"].as_str().unwrap_or("?"),
                );
            }
            let notifications = result["notifications"].as_array().cloned().unwrap_or_default();
            for note in &notifications {
                println!("  {CYAN}notification{RESET}: {note}");
            }
        }
        Command::Breakpoints { action } => {
            let body = match action {
                BreakpointAction::Add {
                    id,
                    pattern,
                    match_type,
                    on_request,
                    on_response,
                } => json!({
                    "action": "add",
                    "id": id,
                    "pattern": pattern,
                    "matchType": match_type,
                    "breakOnRequest": on_request,
                    "breakOnResponse": on_response,
                }),
                BreakpointAction::Remove { id } => json!({"action": "remove", "id": id}),
                BreakpointAction::Clear => json!({"action": "clear"}),
            };
            let url = format!("{base}/_relay/breakpoints");
            send_json(&client, Method::POST, url, Some(body)).await?;
            println!("{GREEN}ok{RESET}");
        }
        Command::Resume {
            id,
            abort,
            status_code,
            response_body,
        } => {
            let mut modifications = serde_json::Map::new();
            if abort {
                modifications.insert("action".into(), json!("abort"));
            }
            if let Some(code) = status_code {
                modifications.insert("statusCode".into(), json!(code));
            }
            if let Some(body) = response_body {
                modifications.insert("responseBody".into(), json!(body));
            }
            let body = json!({
                "id": id,
                "modifications": Value::Object(modifications),
            });
            let url = format!("{base}/_relay/resume");
            match send_json(&client, Method::POST, url, Some(body)).await {
                Ok(_) => println!("{GREEN}resumed {id}{RESET}"),
                Err(err) => {
                    println!("{RED}failed to resume {id}: {err}{RESET}");
                    std::process::exit(1);
                }
            }
        }
        Command::Cert => {
            let url = format!("{base}/cert");
            let req = Request::builder().method(Method::GET).uri(url).body(body_from(Bytes::new()))?;
            let resp = client.request(req).await?;
            if !resp.status().is_success() {
                println!("{RED}no certificate configured ({}){RESET}", resp.status());
                std::process::exit(1);
            }
            let bytes = resp.into_body().collect().await?.to_bytes();
            print!("{}", String::from_utf8_lossy(&bytes));
        }
    }

    Ok(())
}
