//! HTTP read surface
//!
//!  Serves the track map to renderers and exposes the visibility and
//!  focus controls. One request per connection read, minimal parsing.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::scheduler::Visibility;
use crate::track_map::TrackMap;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// State shared by every connection
pub struct HttpState {
    pub map: Arc<TrackMap>,
    pub visibility: Arc<Visibility>,
}

pub async fn run_http_server(port: u16, state: Arc<HttpState>) -> Result<(), BoxError> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("HTTP server listening on port {}", port);

    loop {
        let (socket, addr) = listener.accept().await?;
        debug!("HTTP client connected: {}", addr);

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_http_request(socket, state).await {
                debug!("HTTP error: {}", e);
            }
        });
    }
}

async fn handle_http_request(mut socket: TcpStream, state: Arc<HttpState>) -> Result<(), BoxError> {
    let mut buffer = vec![0u8; 8192];
    let n = socket.read(&mut buffer).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..n]);
    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let (Some(_method), Some(url)) = (parts.next(), parts.next()) else {
        return Ok(());
    };

    let response = route(url, &state)?;
    let header = format!(
        "HTTP/1.1 {}\r\n\
         Server: flighttrack\r\n\
         Content-Type: {}\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         Access-Control-Allow-Origin: *\r\n\
         \r\n",
        response.status,
        response.content_type,
        response.body.len()
    );

    socket.write_all(header.as_bytes()).await?;
    socket.write_all(response.body.as_bytes()).await?;
    Ok(())
}

#[derive(Debug)]
struct Response {
    status: &'static str,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn json(body: String) -> Self {
        Self {
            status: "200 OK",
            content_type: "application/json;charset=utf-8",
            body,
        }
    }

    fn text(body: &str) -> Self {
        Self {
            status: "200 OK",
            content_type: "text/plain;charset=utf-8",
            body: body.to_string(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: "404 Not Found",
            content_type: "text/plain;charset=utf-8",
            body: "not found\n".to_string(),
        }
    }
}

fn route(url: &str, state: &HttpState) -> Result<Response, serde_json::Error> {
    let path = url.split('?').next().unwrap_or(url);
    let response = match path {
        "/tracks.json" => Response::json(serde_json::to_string(&state.map.snapshot())?),
        "/active.json" => Response::json(serde_json::to_string(&state.map.active_ids())?),
        "/visibility" => Response::text(if state.visibility.is_foreground() {
            "visible\n"
        } else {
            "hidden\n"
        }),
        "/visibility/hidden" => {
            state.visibility.set_foreground(false);
            Response::text("hidden\n")
        }
        "/visibility/visible" => {
            state.visibility.set_foreground(true);
            Response::text("visible\n")
        }
        "/focus" | "/focus/" => {
            state.map.set_focus(None);
            Response::text("focus cleared\n")
        }
        _ => match path.strip_prefix("/focus/") {
            Some(id) => {
                state.map.set_focus(Some(id.to_string()));
                Response::text("focus set\n")
            }
            None => Response::not_found(),
        },
    };
    Ok(response)
}
