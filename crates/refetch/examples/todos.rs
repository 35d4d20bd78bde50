// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Todo List Example
//!
//! Demonstrates a typical read-mutate-invalidate cycle:
//! - An observer subscribes to the todo list and loads it
//! - A second caller asking for the same list joins the fetch already running
//! - A mutation on the "server" is followed by an invalidation, which refetches
//!   the observed list and pushes the new data to the listener
//! - The cache is dehydrated to JSON, as a server would before handing it to a client
//!
//! Run with `RUST_LOG=refetch=debug` to see the cache activity.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use refetch::{
    DehydrateOptions, FetchError, ObserverOptions, QueryClient, QueryFilters, QueryObserver, QueryOptions, RefetchType,
    dehydrate,
};
use tracing_subscriber::EnvFilter;

/// Stands in for a remote todo service.
#[derive(Debug, Clone, Default)]
struct TodoServer {
    todos: Arc<Mutex<Vec<String>>>,
}

impl TodoServer {
    async fn list(&self) -> Result<Vec<String>, FetchError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(self.todos.lock().clone())
    }

    async fn add(&self, todo: &str) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.todos.lock().push(todo.to_string());
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let server = TodoServer::default();
    server.add("write the docs").await;

    let client = QueryClient::<Vec<String>>::new();
    let api = server.clone();
    let todos = QueryOptions::new(["todos"])
        .stale_time(Duration::from_secs(30))
        .fetcher(move |_ctx| {
            let api = api.clone();
            async move { api.list().await }
        });

    let observer = QueryObserver::new(&client, ObserverOptions::new(todos.clone()))?;
    let _subscription = observer.subscribe(|result| match result.data() {
        Some(todos) => println!("todos ({}): {todos:?}", if result.is_stale() { "stale" } else { "fresh" }),
        None => println!("loading todos..."),
    });

    // The observer's fetch is already running; this call joins it.
    let loaded = client.fetch_query(todos)?.await?;
    println!("fetched {} todo(s) once, shared by both callers", loaded.len());

    server.add("ship the release").await;
    client
        .invalidate_queries(&QueryFilters::new().key(["todos"]), RefetchType::Active)
        .await;

    let snapshot = dehydrate(&client, &DehydrateOptions::new());
    println!("dehydrated: {}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}
