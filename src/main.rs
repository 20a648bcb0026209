use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

extern crate scgi_server;
use scgi_server::scgi::defs;
use scgi_server::{Request, Response, Server, Settings};

/// SCGI application server behind a front-end web server
#[derive(Parser, Debug)]
#[command(name = "scgi-server", version)]
struct Args
{
    /// TCP address, or `unix:<path>` for a local socket
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    listen: String,

    /// TOML file with limits and timeouts
    #[arg(short, long)]
    config: Option<PathBuf>,
}

const PAGE_HEAD: &str = "<!DOCTYPE html>\n<html>\n<head><title>SCGI</title></head>\n<body>\n";
const PAGE_FOOT: &str = "\n</body>\n</html>\n";

fn escape_html(s: &str) -> String
{
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn index(req: &Request) -> Option<Response>
{
    let body = format!("{}<p>Hello world, {}</p>{}",
                       PAGE_HEAD, escape_html(req.path()), PAGE_FOOT);
    Some(Response::ok(defs::RESP_TYPE_HTML, body))
}

/// Describe the decoded request as JSON
fn echo(req: &Request) -> Option<Response>
{
    let files: serde_json::Map<String, serde_json::Value> = req.files.iter()
        .map(|(name, list)| {
            let list: Vec<_> = list.iter()
                .map(|f| json!({"filename": f.filename,
                                "content_type": f.content_type,
                                "size": f.size()}))
                .collect();
            (name.clone(), json!(list))
        })
        .collect();
    let cookies: Vec<_> = req.cookies.iter()
        .map(|c| json!({"name": c.name, "value": c.value}))
        .collect();
    let reply = json!({
        "method": req.method.to_string(),
        "path": req.path(),
        "query": req.query,
        "form": req.form,
        "files": files,
        "cookies": cookies,
        "content_type": req.content_type,
        "content_size": req.content_size,
        "ajax": req.is_ajax,
        "websocket": req.is_websocket,
        "user_agent": req.user_agent,
        "remote_addr": req.param(defs::REMOTE_ADDR),
    });
    match Response::json(defs::RESP_CODE_OK, &reply) {
        Ok(resp) => Some(resp),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode reply");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>>
{
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scgi_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::new()
    };
    tracing::info!(?settings, "Starting");

    let mut server = Server::new(settings)?;
    server.add_handler("/echo", echo);
    server.add_handler("/", index);

    tracing::info!(address = %args.listen, "Press Ctrl-C to stop");
    server.listen(&args.listen).await?;
    Ok(())
}

#[test]
fn test_echo_handler()
{
    use scgi_server::scgi::connection::Connection;
    use scgi_server::scgi::header::encode_header;
    use scgi_server::scgi::request::read_request;

    let input = encode_header(&[("REQUEST_METHOD", "GET"),
                                ("REQUEST_URI", "/echo?a=1"),
                                ("HTTP_COOKIE", "k=v")]);
    let rt = tokio::runtime::Runtime::new().unwrap();
    let req = rt.block_on(async {
        let settings = Settings::new();
        let mut conn = Connection::new(&input[..], &settings);
        read_request(&mut conn, &settings).await.unwrap()
    });
    let resp = echo(&req).unwrap();
    let value: serde_json::Value = serde_json::from_slice(resp.content()).unwrap();
    assert_eq!(value["path"], "/echo");
    assert_eq!(value["query"]["a"][0], "1");
    assert_eq!(value["cookies"][0]["value"], "v");
    assert!(index(&req).unwrap().content().starts_with(b"<!DOCTYPE html>"));
}
