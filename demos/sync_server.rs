//! Runnable sync server over in-memory storage
//!
//! Start it, then point any WebSocket client at the printed url and send
//! protocol messages, e.g.
//! `{"rqtType":"insert","rqtData":{"description":"milk","number":2}}`.

use std::sync::Arc;

use entrysync::{ MemoryStorage, WebSocketServerOptions, WebSocketSyncServer };

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let storage = Arc::new(MemoryStorage::new());
    let mut server = WebSocketSyncServer::with_options(
        storage,
        WebSocketServerOptions::default()
    );

    server.start().await?;
    println!("sync server listening at {}", server.url());
    println!("press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
