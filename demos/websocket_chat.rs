//! A minimal chat room: one HTTP route serves an embedded HTML/JS client,
//! one WebSocket route joins it to a shared room. New connections replay the
//! recent history, then every message is broadcast to everyone still
//! connected.

use std::sync::Arc;

use embers::prelude::*;
use tokio::sync::Mutex;

const CHAT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>embers chat</title></head>
<body>
  <ul id="log"></ul>
  <input id="msg" autofocus>
  <script>
    const log = document.getElementById("log");
    const input = document.getElementById("msg");
    const ws = new WebSocket("ws://" + location.host + "/ws");
    ws.onmessage = (event) => {
      const item = document.createElement("li");
      item.textContent = event.data;
      log.appendChild(item);
    };
    input.addEventListener("keydown", (event) => {
      if (event.key === "Enter" && input.value) {
        ws.send(input.value);
        input.value = "";
      }
    });
  </script>
</body>
</html>"#;

const HISTORY_LIMIT: usize = 50;

#[tokio::main]
async fn main() -> Result<()> {
    let room = Arc::new(WebSocketRoom::new());
    let history = Arc::new(Mutex::new(Vec::<String>::new()));

    let app = App::new()
        .middleware(middleware::logging())
        .get("/", handler(|_req| async { Response::html(StatusCode::OK, CHAT_PAGE) }))
        .websocket(
            "/ws",
            ws_handler(move |mut session| {
                let room = room.clone();
                let history = history.clone();
                async move {
                    session.send_text("welcome to the chat").await?;
                    for line in history.lock().await.iter() {
                        session.send_text(line.clone()).await?;
                    }

                    let handle = room.add(session).await;

                    loop {
                        let message = {
                            let mut guard = handle.lock().await;
                            guard.recv().await
                        };

                        match message {
                            Some(WebSocketMessage::Text(text)) => {
                                let mut log = history.lock().await;
                                log.push(text.clone());
                                if log.len() > HISTORY_LIMIT {
                                    log.remove(0);
                                }
                                drop(log);
                                room.broadcast_text(&text).await;
                            }
                            Some(WebSocketMessage::Close) | None => break,
                            _ => {}
                        }
                    }

                    room.remove(&handle).await;
                    Ok(())
                }
            }),
        );

    let running = app.build().await?;
    println!("chat demo listening at http://{}", running.config().bind_address());
    running.serve().await
}
